use super::irq::{self, Irq};
use crate::log;
use core::sync::atomic::{AtomicUsize, Ordering};
use x86_64::instructions::interrupts;
use x86_64::instructions::port::Port;

pub const PIT_FREQUENCY: f64 = 3_579_545.0 / 3.0;
const PIT_DIVIDER: usize = 1 << 16;
#[allow(clippy::cast_precision_loss)]
const PIT_INTERVAL: f64 = (PIT_DIVIDER as f64) / PIT_FREQUENCY;

static PIT_TICKS: AtomicUsize = AtomicUsize::new(0);

pub fn ticks() -> usize {
    PIT_TICKS.load(Ordering::Relaxed)
}

#[must_use]
pub const fn time_between_ticks() -> f64 {
    PIT_INTERVAL
}

/// Seconds since the PIT started ticking.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn uptime() -> f64 {
    time_between_ticks() * ticks() as f64
}

pub fn set_pit_frequency_divider(divider: u16, channel: u8) {
    interrupts::without_interrupts(|| {
        let bytes = divider.to_le_bytes();
        let mut cmd: Port<u8> = Port::new(0x43);
        let mut data: Port<u8> = Port::new(0x40 + u16::from(channel));
        let operating_mode = 6;
        let access_mode = 3;

        unsafe { cmd.write((channel << 6) | (access_mode << 4) | operating_mode) };
        unsafe { data.write(bytes[0]) };
        unsafe { data.write(bytes[1]) };
    });
}

fn pit_interrupt_handler() {
    PIT_TICKS.fetch_add(1, Ordering::Relaxed);
}

pub fn init() {
    // A divider of 65536 is programmed as 0.
    let divider = if PIT_DIVIDER < 65536 { PIT_DIVIDER } else { 0 };
    let channel = 0;
    set_pit_frequency_divider(u16::try_from(divider).unwrap_or(0), channel);

    if let Err(err) = irq::set_handler(Irq::Timer as u8, pit_interrupt_handler) {
        log!("pit: {}", err);
        return;
    }

    log!("pit initialized");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uptime_follows_ticks() {
        let before = ticks();
        pit_interrupt_handler();
        pit_interrupt_handler();

        assert!(ticks() >= before + 2);
        assert!((PIT_INTERVAL - 0.054_925).abs() < 1e-5);
    }
}
