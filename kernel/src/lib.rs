#![cfg_attr(not(test), no_std)]
#![feature(abi_x86_interrupt)]

use bootloader_api::config::Mapping;
use bootloader_api::{BootInfo, BootloaderConfig};

extern crate alloc;

pub mod sys;

/// Brings the machine up in dependency order. Interrupts stay disabled;
/// the caller enables them once this returns.
pub fn init(boot_info: &'static mut BootInfo) {
    sys::serial::init();

    sys::gdt::init();
    sys::idt::init();
    sys::exceptions::init();
    sys::irq::init();
    sys::time::init();

    let Some(physical_memory_offset) = boot_info.physical_memory_offset.into_option() else {
        log!("bootloader did not map physical memory");
        hlt_loop();
    };
    sys::memory::init(physical_memory_offset, &boot_info.memory_regions);

    sys::ata::init();

    log!("kernel initialized");
}

pub fn hlt_loop() -> ! {
    loop {
        x86_64::instructions::hlt();
    }
}

pub static BOOTLOADER_CONFIG: BootloaderConfig = {
    let mut config = BootloaderConfig::new_default();
    config.mappings.physical_memory = Some(Mapping::Dynamic);
    config
};
