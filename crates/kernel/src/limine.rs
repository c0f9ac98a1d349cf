//! Limine boot protocol requests and accessors.

use lazy_static::lazy_static;
use limine::BaseRevision;
use limine::modules::{InternalModule, ModuleFlags};
use limine::request::{HhdmRequest, MemoryMapRequest, ModuleRequest, RsdpRequest};
use limine::response::MemoryMapResponse;

use crate::fs::ustar::TarArchiveIter;

#[used]
#[unsafe(link_section = ".requests")]
static BASE_REVISION: BaseRevision = BaseRevision::with_revision(2);

#[used]
#[unsafe(link_section = ".requests")]
static HHDM_REQUEST: HhdmRequest = HhdmRequest::new();

#[used]
#[unsafe(link_section = ".requests")]
static RSDP_REQUEST: RsdpRequest = RsdpRequest::new();

#[used]
#[unsafe(link_section = ".requests")]
static MMAP_REQUEST: MemoryMapRequest = MemoryMapRequest::new();

const RAMDISK_MODULE: InternalModule = InternalModule::new()
    .with_path(c"ramdisk.tar")
    .with_flags(ModuleFlags::empty());

#[used]
#[unsafe(link_section = ".requests")]
static MODULES_REQUEST: ModuleRequest =
    ModuleRequest::new().with_internal_modules(&[&RAMDISK_MODULE]);

lazy_static! {
    /// Offset of the higher-half direct map.
    pub static ref HHDM: usize = HHDM_REQUEST
        .get_response()
        .expect("no Limine HHDM response")
        .offset() as usize;
}

pub fn mmap_request() -> &'static MemoryMapResponse {
    MMAP_REQUEST.get_response().expect("no Limine memory map")
}

pub fn rsdp_addr() -> usize {
    RSDP_REQUEST
        .get_response()
        .expect("no Limine RSDP response")
        .address() as usize
}

/// The boot ramdisk as a tar archive, if the bootloader provided one.
pub fn ramdisk() -> Option<TarArchiveIter<'static>> {
    let module = MODULES_REQUEST.get_response()?.modules().first().copied()?;
    Some(unsafe { TarArchiveIter::new(module.addr(), module.size() as usize) })
}
