pub mod allocator;
pub mod ata;
pub mod cmos;
pub mod exceptions;
pub mod gdt;
pub mod idt;
pub mod irq;
pub mod memory;
pub mod pic;
pub mod pmm;
pub mod port;
pub mod serial;
pub mod time;

#[macro_export]
macro_rules! log {
    ($($arg:tt)*) => {
        {
            let uptime = $crate::sys::time::uptime();

            $crate::println_serial!("[{:.4}] {}", uptime, format_args!($($arg)*));
        }
    }
}
