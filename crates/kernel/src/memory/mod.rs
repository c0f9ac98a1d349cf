pub mod frame_allocator;
pub mod heap;
pub mod paging;
pub mod space;

use core::{
    fmt::{Debug, LowerHex},
    ops::{Add, AddAssign, Sub, SubAssign},
};

use crate::limine::HHDM;

/// First address that is no longer usable by userspace (exclusive).
pub const USER_TOP: usize = 0x0000_8000_0000_0000;
/// Start of the canonical higher half.
pub const HIGHER_HALF: usize = 0xFFFF_8000_0000_0000;

/// A virtual memory address
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
#[repr(transparent)]
pub struct VirtAddr(usize);

/// A physical memory address
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
#[repr(transparent)]
pub struct PhysAddr(usize);

impl Debug for VirtAddr {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "VirtAddr({:#x})", self.0)
    }
}

impl Debug for PhysAddr {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "PhysAddr({:#x})", self.0)
    }
}

macro_rules! impl_addr_ty {
    ($ty: ty) => {
        impl $ty {
            #[inline(always)]
            pub const fn null() -> Self {
                Self(0)
            }

            #[inline(always)]
            pub const fn from(value: usize) -> Self {
                Self(value)
            }

            #[inline(always)]
            pub const fn into_raw(self) -> usize {
                self.0
            }

            #[inline(always)]
            pub const fn is_null(self) -> bool {
                self.0 == 0
            }

            #[inline(always)]
            pub const fn align_down(self, alignment: usize) -> Self {
                Self(align_down(self.0, alignment))
            }

            #[inline(always)]
            pub const fn align_up(self, alignment: usize) -> Self {
                Self(align_up(self.0, alignment))
            }

            #[inline(always)]
            pub const fn is_aligned_to(self, alignment: usize) -> bool {
                self.0 % alignment == 0
            }
        }

        impl LowerHex for $ty {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                LowerHex::fmt(&self.0, f)
            }
        }

        impl From<usize> for $ty {
            #[inline(always)]
            fn from(value: usize) -> Self {
                Self(value)
            }
        }

        impl Add<usize> for $ty {
            type Output = $ty;
            #[inline(always)]
            fn add(self, rhs: usize) -> Self::Output {
                Self(self.0 + rhs)
            }
        }

        impl AddAssign<usize> for $ty {
            #[inline(always)]
            fn add_assign(&mut self, rhs: usize) {
                *self = *self + rhs
            }
        }

        impl Sub<$ty> for $ty {
            type Output = usize;
            #[inline(always)]
            fn sub(self, rhs: $ty) -> Self::Output {
                self.0 - rhs.0
            }
        }

        impl Sub<usize> for $ty {
            type Output = Self;
            #[inline(always)]
            fn sub(self, rhs: usize) -> Self::Output {
                Self(self.0 - rhs)
            }
        }

        impl SubAssign<usize> for $ty {
            #[inline(always)]
            fn sub_assign(&mut self, rhs: usize) {
                *self = *self - rhs
            }
        }
    };
}

impl_addr_ty!(VirtAddr);
impl_addr_ty!(PhysAddr);

impl VirtAddr {
    #[inline(always)]
    pub fn from_ptr<T: ?Sized>(ptr: *const T) -> Self {
        Self(ptr as *const u8 as usize)
    }

    #[inline(always)]
    pub const fn into_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }

    /// Converts a higher-half direct-map address back into its physical one.
    #[inline(always)]
    pub fn into_phys(self) -> PhysAddr {
        debug_assert!(self.0 >= *HHDM);
        PhysAddr(self.0 - *HHDM)
    }

    #[inline(always)]
    pub const fn is_higher_half(self) -> bool {
        self.0 >= HIGHER_HALF
    }
}

impl PhysAddr {
    /// The higher-half direct-map alias of this physical address.
    #[inline(always)]
    pub fn into_virt(self) -> VirtAddr {
        VirtAddr(self.0 + *HHDM)
    }
}

#[inline(always)]
pub const fn align_down(value: usize, alignment: usize) -> usize {
    value & !(alignment - 1)
}

#[inline(always)]
pub const fn align_up(value: usize, alignment: usize) -> usize {
    (value + alignment - 1) & !(alignment - 1)
}
