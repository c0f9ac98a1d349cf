use super::handlers::IDT;
use lazy_static::lazy_static;

pub type IdtTable = [GateDescriptor; 256];

#[repr(C, packed)]
pub struct IdtDescriptor {
    limit: u16,
    base: usize,
}

unsafe impl Send for IdtDescriptor {}
unsafe impl Sync for IdtDescriptor {}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(C, packed)]
pub struct GateDescriptor {
    offset0: u16,
    selector: u16,
    pub ist: u8,
    attributes: u8, // gate type, dpl, present
    offset1: u16,
    offset2: u32,
    reserved: u32,
}

impl GateDescriptor {
    pub const fn new(handler: usize, attributes: u8) -> Self {
        Self {
            offset0: handler as u16,
            selector: super::super::gdt::KERNEL_CODE_SEG,
            ist: 0,
            attributes: attributes | 1 << 7, // present
            offset1: (handler >> 16) as u16,
            offset2: (handler >> 32) as u32,
            reserved: 0,
        }
    }

    pub const fn default() -> Self {
        Self {
            offset0: 0,
            selector: 0,
            ist: 0,
            attributes: 0,
            offset1: 0,
            offset2: 0,
            reserved: 0,
        }
    }
}

lazy_static! {
    pub static ref IDT_DESCRIPTOR: IdtDescriptor = IdtDescriptor {
        limit: (size_of::<IdtTable>() - 1) as u16,
        base: IDT.get() as usize,
    };
}
