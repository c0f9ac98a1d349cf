#![no_std]
#![no_main]
#![feature(custom_test_frameworks)]
#![test_runner(crate::test::test_runner)]
#![reexport_test_harness_main = "kernel_testmain"]
#![feature(sync_unsafe_cell)]

#[cfg(test)]
mod test;

mod arch;
mod config;
mod fs;
mod ioring;
mod limine;
mod memory;
mod sched;
mod smp;
mod syscalls;
mod time;
mod utils;
mod wait;

extern crate alloc;

pub use memory::PhysAddr;
pub use memory::VirtAddr;

use cairn_utils::make_path;

use crate::fs::VfsContext;
use crate::sched::Process;

#[macro_export]
macro_rules! serial {
    ($($arg:tt)*) => {
        $crate::arch::serial::_serial(format_args!($($arg)*))
    };
}

/// Milliseconds since boot, `0` until the clock is up.
#[macro_export]
macro_rules! time {
    (ms) => {
        $crate::time::uptime_checked() / 1_000_000
    };
    (us) => {
        $crate::time::uptime_checked() / 1_000
    };
    () => {
        $crate::time::uptime_checked()
    };
}

#[macro_export]
macro_rules! logln {
    ($($arg:tt)*) => {{
        let ms = $crate::time!(ms);
        $crate::serial!(
            "[{:>5}.{:03}] {}\n",
            ms / 1000,
            ms % 1000,
            format_args!($($arg)*)
        );
    }};
}

/// runtime debug info, takes an optional module type as context
#[macro_export]
macro_rules! debug {
    ($mod: ty, $($arg:tt)*) => {{
        // makes sure $mod is a valid type
        let _ = core::marker::PhantomData::<$mod>;
        $crate::logln!("\x1B[91mdebug\x1B[0m {}: {}", stringify!($mod), format_args!($($arg)*));
    }};
    ($($arg:tt)*) => {
        $crate::logln!("\x1B[91mdebug\x1B[0m {}", format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! info {
    ($($arg:tt)*) => {
        $crate::logln!("\x1B[92minfo \x1B[0m {}", format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! warn {
    ($($arg:tt)*) => {
        $crate::logln!("\x1B[93mwarn \x1B[0m {}", format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! error {
    ($($arg:tt)*) => {
        $crate::logln!("\x1B[91merror\x1B[0m {}", format_args!($($arg)*))
    };
}

#[unsafe(no_mangle)]
pub fn khalt() -> ! {
    loop {
        unsafe { arch::hlt() }
    }
}

use core::panic::PanicInfo;

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    unsafe {
        arch::disable_interrupts();
        arch::serial::SERIAL.force_unlock();
    }
    smp::halt_others();

    serial!(
        "\x1B[38;2;255;0;0mkernel panic:\n{}, at {}\x1B[0m\n",
        info.message(),
        info.location().unwrap()
    );
    arch::print_stack_trace();

    #[cfg(test)]
    arch::power::exit_qemu(test::EXIT_FAILURE);
    #[cfg(not(test))]
    khalt()
}

/// The first thread: brings the rest of the system up, then turns into the
/// spawner of `ram:/bin/init`.
fn init_main() -> ! {
    smp::start_timers();
    info!("timers armed on {} CPUs", smp::cpu_count());

    #[cfg(test)]
    {
        kernel_testmain();
        arch::power::exit_qemu(test::EXIT_SUCCESS);
    }

    #[cfg(not(test))]
    {
        use cairn_abi::process::Priority;

        match sched::spawn::spawn(&["/bin/init"], Priority::Medium) {
            Ok(pid) => info!("init spawned as pid {pid}"),
            Err(errno) => error!("no init: {errno}"),
        }

        loop {
            wait::sleep(time::NS_PER_SEC);
        }
    }
}

#[unsafe(no_mangle)]
extern "C" fn kstart() -> ! {
    arch::serial::init();
    serial!("\nCairnOS core booting...\n");

    let bsp_tss = arch::init_cpu(0);

    memory::paging::init_kernel_root();
    memory::heap::init();
    arch::map_device_mmio();
    info!("memory online, {} usable frames", memory::frame_allocator::usable_frames());

    time::init();
    smp::init(bsp_tss);

    fs::init();

    let vfs = VfsContext::new(make_path!("ram"));
    let kernel_process = unsafe { Process::create_kernel(vfs) };

    info!("handing off to the init thread");
    unsafe { sched::init(kernel_process, init_main) }
}
