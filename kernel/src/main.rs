#![no_std]
#![no_main]

use bootloader_api::{entry_point, BootInfo};
use core::panic::PanicInfo;
use kernel::sys::{ata, pmm};
use kernel::{log, BOOTLOADER_CONFIG};

entry_point!(kernel_main, config = &BOOTLOADER_CONFIG);

fn kernel_main(boot_info: &'static mut BootInfo) -> ! {
    kernel::init(boot_info);

    x86_64::instructions::interrupts::enable();

    let info = pmm::PMM.lock().memory_info();
    log!(
        "{} KiB total, {} KiB free",
        info.total_memory / 1024,
        info.available_memory / 1024
    );

    let drives = ata::IDE.lock().drive_count();
    log!(
        "{} drive(s), last error: {}",
        drives,
        ata::error_to_string(ata::last_error())
    );

    kernel::hlt_loop();
}

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    x86_64::instructions::interrupts::disable();
    log!("{info}");

    kernel::hlt_loop();
}
