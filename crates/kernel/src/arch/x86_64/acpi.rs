//! Just enough ACPI to find the CPUs and the HPET: RSDP, the X/RSDT index,
//! the MADT processor records. The AML interpreter is somebody else's
//! problem.

use heapless::Vec;
use lazy_static::lazy_static;

use crate::PhysAddr;
use crate::VirtAddr;
use crate::config;

#[derive(Debug, Clone, Copy)]
#[repr(C, packed)]
struct Rsdp {
    signature: [u8; 8],
    checksum: u8,
    oem_id: [u8; 6],
    revision: u8,
    rsdt_addr: u32,
    // revision >= 2
    length: u32,
    xsdt_addr: u64,
    extended_checksum: u8,
    reserved: [u8; 3],
}

#[derive(Debug, Clone, Copy)]
#[repr(C, packed)]
pub struct SdtHeader {
    signature: [u8; 4],
    length: u32,
    revision: u8,
    checksum: u8,
    oem_id: [u8; 6],
    oem_table_id: [u8; 8],
    oem_revision: u32,
    creator_id: u32,
    creator_revision: u32,
}

struct SdtIndex {
    header: &'static SdtHeader,
    entry_size: usize,
}

impl SdtIndex {
    fn entries(&self) -> usize {
        (self.header.length as usize - size_of::<SdtHeader>()) / self.entry_size
    }

    fn entry(&self, index: usize) -> PhysAddr {
        let base = VirtAddr::from_ptr(self.header as *const SdtHeader as *const u8)
            + size_of::<SdtHeader>()
            + index * self.entry_size;
        let addr = if self.entry_size == 8 {
            unsafe { base.into_ptr::<u64>().read_unaligned() as usize }
        } else {
            unsafe { base.into_ptr::<u32>().read_unaligned() as usize }
        };
        PhysAddr::from(addr)
    }

    fn find(&self, signature: &[u8; 4]) -> Option<&'static SdtHeader> {
        (0..self.entries())
            .map(|i| unsafe { &*self.entry(i).into_virt().into_ptr::<SdtHeader>() })
            .find(|header| {
                // copy out, the header is packed
                let sig = header.signature;
                sig == *signature
            })
    }
}

fn sdt_index() -> SdtIndex {
    let rsdp = unsafe {
        &*PhysAddr::from(crate::limine::rsdp_addr())
            .into_virt()
            .into_ptr::<Rsdp>()
    };
    let signature = rsdp.signature;
    assert_eq!(signature, *b"RSD PTR ", "RSDP signature mismatch");

    if rsdp.revision >= 2 {
        SdtIndex {
            header: unsafe {
                &*PhysAddr::from(rsdp.xsdt_addr as usize)
                    .into_virt()
                    .into_ptr::<SdtHeader>()
            },
            entry_size: 8,
        }
    } else {
        SdtIndex {
            header: unsafe {
                &*PhysAddr::from(rsdp.rsdt_addr as usize)
                    .into_virt()
                    .into_ptr::<SdtHeader>()
            },
            entry_size: 4,
        }
    }
}

#[repr(C, packed)]
struct MadtHeader {
    header: SdtHeader,
    local_apic_addr: u32,
    flags: u32,
}

#[repr(C, packed)]
struct MadtRecord {
    kind: u8,
    length: u8,
}

#[repr(C, packed)]
struct LocalApicRecord {
    record: MadtRecord,
    acpi_id: u8,
    apic_id: u8,
    flags: u32,
}

const MADT_RECORD_LOCAL_APIC: u8 = 0;
const LOCAL_APIC_ENABLED: u32 = 1 << 0;
const LOCAL_APIC_ONLINE_CAPABLE: u32 = 1 << 1;

/// Local APIC ids of every enableable CPU, BSP included, in MADT order.
fn detect_cpus() -> Vec<u32, { config::MAX_CPUS }> {
    let madt = sdt_index().find(b"APIC").expect("no MADT in the ACPI index");
    let madt = unsafe { &*(madt as *const SdtHeader as *const MadtHeader) };

    let mut cpus = Vec::new();
    let base = VirtAddr::from_ptr(madt as *const MadtHeader as *const u8);
    let mut offset = size_of::<MadtHeader>();
    let length = madt.header.length as usize;

    while offset + size_of::<MadtRecord>() <= length {
        let record = unsafe { &*(base + offset).into_ptr::<MadtRecord>() };
        if record.kind == MADT_RECORD_LOCAL_APIC {
            let lapic = unsafe { &*(base + offset).into_ptr::<LocalApicRecord>() };
            let flags = lapic.flags;
            if flags & (LOCAL_APIC_ENABLED | LOCAL_APIC_ONLINE_CAPABLE) != 0
                && cpus.push(lapic.apic_id as u32).is_err()
            {
                crate::warn!("more CPUs than MAX_CPUS, ignoring the rest");
                break;
            }
        }
        offset += (record.length as usize).max(2);
    }

    cpus
}

#[repr(C, packed)]
struct GenericAddress {
    address_space: u8,
    bit_width: u8,
    bit_offset: u8,
    access_size: u8,
    address: u64,
}

#[repr(C, packed)]
struct HpetTable {
    header: SdtHeader,
    event_timer_block_id: u32,
    base: GenericAddress,
    hpet_number: u8,
    min_tick: u16,
    page_protection: u8,
}

fn detect_hpet() -> PhysAddr {
    let table = sdt_index().find(b"HPET").expect("no HPET table, no clock");
    let table = unsafe { &*(table as *const SdtHeader as *const HpetTable) };
    PhysAddr::from(table.base.address as usize)
}

lazy_static! {
    pub static ref CPUS: Vec<u32, { config::MAX_CPUS }> = detect_cpus();
    pub static ref HPET_BASE: PhysAddr = detect_hpet();
}
