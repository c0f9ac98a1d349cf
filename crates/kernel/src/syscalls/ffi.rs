//! User-pointer validation. Arguments arrive as raw integers; everything
//! dereferenced on behalf of userspace must point into the lower half of
//! the currently loaded address space.

use cairn_abi::errors::{Errno, SysResult};

use crate::memory::USER_TOP;

fn check_range(ptr: usize, len: usize) -> SysResult<()> {
    if ptr == 0 {
        return Err(Errno::EFAULT);
    }
    let end = ptr.checked_add(len).ok_or(Errno::EFAULT)?;
    if end > USER_TOP {
        return Err(Errno::EFAULT);
    }
    Ok(())
}

pub fn user_slice<'a>(ptr: usize, len: usize) -> SysResult<&'a [u8]> {
    if len == 0 {
        return Ok(&[]);
    }
    check_range(ptr, len)?;
    Ok(unsafe { core::slice::from_raw_parts(ptr as *const u8, len) })
}

pub fn user_slice_mut<'a>(ptr: usize, len: usize) -> SysResult<&'a mut [u8]> {
    if len == 0 {
        return Ok(&mut []);
    }
    check_range(ptr, len)?;
    Ok(unsafe { core::slice::from_raw_parts_mut(ptr as *mut u8, len) })
}

pub fn user_str<'a>(ptr: usize, len: usize) -> SysResult<&'a str> {
    let bytes = user_slice(ptr, len)?;
    core::str::from_utf8(bytes).map_err(|_| Errno::EINVAL)
}

pub fn user_ref<'a, T>(ptr: usize) -> SysResult<&'a T> {
    check_range(ptr, size_of::<T>())?;
    if ptr % align_of::<T>() != 0 {
        return Err(Errno::EFAULT);
    }
    Ok(unsafe { &*(ptr as *const T) })
}

pub fn user_mut<'a, T>(ptr: usize) -> SysResult<&'a mut T> {
    check_range(ptr, size_of::<T>())?;
    if ptr % align_of::<T>() != 0 {
        return Err(Errno::EFAULT);
    }
    Ok(unsafe { &mut *(ptr as *mut T) })
}

pub fn user_slice_of<'a, T>(ptr: usize, count: usize) -> SysResult<&'a mut [T]> {
    if count == 0 {
        return Ok(&mut []);
    }
    let len = count.checked_mul(size_of::<T>()).ok_or(Errno::EFAULT)?;
    check_range(ptr, len)?;
    if ptr % align_of::<T>() != 0 {
        return Err(Errno::EFAULT);
    }
    Ok(unsafe { core::slice::from_raw_parts_mut(ptr as *mut T, count) })
}
