use crate::log;
use lazy_static::lazy_static;
use spin::Mutex;
use uart_16550::SerialPort;

const COM1: u16 = 0x3F8;

#[macro_export]
macro_rules! print_serial {
    ($($arg:tt)*) => {
        $crate::sys::serial::print(format_args!($($arg)*));
    };
}

#[macro_export]
macro_rules! println_serial {
    () => ($crate::print_serial!("\n"));
    ($fmt:expr) => ($crate::print_serial!(concat!($fmt, "\n")));
    ($fmt:expr, $($arg:tt)*) => ($crate::print_serial!(
        concat!($fmt, "\n"), $($arg)*));
}

#[doc(hidden)]
#[cfg(not(test))]
pub fn print(args: ::core::fmt::Arguments) {
    use core::fmt::Write;
    use x86_64::instructions::interrupts;

    interrupts::without_interrupts(|| {
        // A UART write cannot fail; there is nowhere left to report it anyway.
        let _ = SERIAL.lock().write_fmt(args);
    });
}

#[doc(hidden)]
#[cfg(test)]
pub fn print(args: ::core::fmt::Arguments) {
    std::print!("{args}");
}

lazy_static! {
    pub static ref SERIAL: Mutex<SerialPort> = Mutex::new(unsafe { SerialPort::new(COM1) });
}

pub fn init() {
    SERIAL.lock().init();

    log!("serial initialized");
}
