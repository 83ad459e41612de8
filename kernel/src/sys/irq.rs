use super::pic::{self, Pic};
use super::port::{HardwarePorts, PortIo};
use super::{gdt, idt};
use crate::log;
use core::fmt;
use spin::Mutex;
use x86_64::instructions::interrupts;
use x86_64::structures::idt::InterruptStackFrame;

pub static IRQ: Mutex<IrqDispatcher<HardwarePorts>> =
    Mutex::new(IrqDispatcher::new(Pic::new(HardwarePorts)));

#[derive(Debug)]
#[repr(u8)]
pub enum Irq {
    Timer = 0,
    Keyboard = 1,
    Cascade = 2,
    Rtc = 8,
    PrimaryAta = 14,
    SecondaryAta = 15,
}

#[must_use]
pub const fn interrupt_index(irq: u8) -> u8 {
    pic::PIC_1_OFFSET + irq
}

#[derive(Clone, Copy, Default)]
pub enum IrqHandler {
    #[default]
    None,
    Installed(fn()),
}

impl fmt::Debug for IrqHandler {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::None => write!(f, "None"),
            Self::Installed(handler) => write!(f, "Installed({:#x})", *handler as usize),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidIrq(pub u8);

impl fmt::Display for InvalidIrq {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "invalid IRQ line {}", self.0)
    }
}

/// Callback slots for the 16 IRQ lines plus the controllers they are
/// acknowledged on. Slot `n` is IRQ line `n`, whatever vector it was
/// remapped to.
#[derive(Debug)]
pub struct IrqDispatcher<P> {
    handlers: [IrqHandler; pic::LINES as usize],
    pic: Pic<P>,
}

impl<P: PortIo> IrqDispatcher<P> {
    pub const fn new(pic: Pic<P>) -> Self {
        Self {
            handlers: [IrqHandler::None; pic::LINES as usize],
            pic,
        }
    }

    pub fn remap(&mut self) {
        self.pic.remap();
    }

    /// Replaces whatever was registered for `irq`.
    pub fn set_handler(&mut self, irq: u8, handler: fn()) -> Result<(), InvalidIrq> {
        let slot = self.handlers.get_mut(usize::from(irq)).ok_or(InvalidIrq(irq))?;
        *slot = IrqHandler::Installed(handler);
        self.pic.clear_mask(irq);
        Ok(())
    }

    pub fn clear_handler(&mut self, irq: u8) -> Result<(), InvalidIrq> {
        let slot = self.handlers.get_mut(usize::from(irq)).ok_or(InvalidIrq(irq))?;
        *slot = IrqHandler::None;
        Ok(())
    }

    #[must_use]
    pub fn handler(&self, irq: u8) -> IrqHandler {
        self.handlers
            .get(usize::from(irq))
            .copied()
            .unwrap_or_default()
    }

    /// Runs the callback for `irq`, if any, then acknowledges the line.
    pub fn dispatch(&mut self, irq: u8) {
        if let IrqHandler::Installed(handler) = self.handler(irq) {
            handler();
        }
        self.pic.end_of_interrupt(irq);
    }

    pub fn pic(&mut self) -> &mut Pic<P> {
        &mut self.pic
    }
}

macro_rules! irq_handler {
    ($handler:ident, $irq:expr) => {
        extern "x86-interrupt" fn $handler(_stack_frame: InterruptStackFrame) {
            IRQ.lock().dispatch($irq);
        }
    };
}

irq_handler!(irq0_handler, 0);
irq_handler!(irq1_handler, 1);
irq_handler!(irq2_handler, 2);
irq_handler!(irq3_handler, 3);
irq_handler!(irq4_handler, 4);
irq_handler!(irq5_handler, 5);
irq_handler!(irq6_handler, 6);
irq_handler!(irq7_handler, 7);
irq_handler!(irq8_handler, 8);
irq_handler!(irq9_handler, 9);
irq_handler!(irq10_handler, 10);
irq_handler!(irq11_handler, 11);
irq_handler!(irq12_handler, 12);
irq_handler!(irq13_handler, 13);
irq_handler!(irq14_handler, 14);
irq_handler!(irq15_handler, 15);

const TRAMPOLINES: [extern "x86-interrupt" fn(InterruptStackFrame); pic::LINES as usize] = [
    irq0_handler,
    irq1_handler,
    irq2_handler,
    irq3_handler,
    irq4_handler,
    irq5_handler,
    irq6_handler,
    irq7_handler,
    irq8_handler,
    irq9_handler,
    irq10_handler,
    irq11_handler,
    irq12_handler,
    irq13_handler,
    irq14_handler,
    irq15_handler,
];

/// Remaps the controllers and points vectors 32-47 at the trampolines.
pub fn init() {
    interrupts::without_interrupts(|| {
        IRQ.lock().remap();

        let selector = gdt::kernel_code_selector();
        let mut table = idt::IDT.lock();
        for (irq, trampoline) in (0..pic::LINES).zip(TRAMPOLINES) {
            table.set_gate(
                interrupt_index(irq),
                trampoline as usize as u64,
                selector,
                idt::INTERRUPT_GATE,
            );
        }
    });

    log!("pic remapped, irq gates installed");
}

/// Registers `handler` for `irq`. Callbacks run with the dispatcher
/// locked, so they must not register handlers themselves.
pub fn set_handler(irq: u8, handler: fn()) -> Result<(), InvalidIrq> {
    interrupts::without_interrupts(|| IRQ.lock().set_handler(irq, handler))
}

pub fn clear_handler(irq: u8) -> Result<(), InvalidIrq> {
    interrupts::without_interrupts(|| IRQ.lock().clear_handler(irq))
}

pub fn set_mask(irq: u8) {
    interrupts::without_interrupts(|| IRQ.lock().pic().set_mask(irq));
}

pub fn clear_mask(irq: u8) {
    interrupts::without_interrupts(|| IRQ.lock().pic().clear_mask(irq));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sys::pic::{PIC1_COMMAND, PIC1_DATA, PIC2_COMMAND, PIC2_DATA};
    use crate::sys::port::fake::ScriptedPorts;
    use core::sync::atomic::{AtomicUsize, Ordering};

    fn dispatcher() -> IrqDispatcher<ScriptedPorts> {
        let mut ports = ScriptedPorts::new();
        ports.set(PIC1_DATA, 0).set(PIC2_DATA, 0);
        IrqDispatcher::new(Pic::new(ports))
    }

    fn eoi_writes(dispatcher: &mut IrqDispatcher<ScriptedPorts>) -> std::vec::Vec<u16> {
        dispatcher
            .pic()
            .ports()
            .writes()
            .into_iter()
            .filter(|&(port, value)| {
                (port == PIC1_COMMAND || port == PIC2_COMMAND) && value == 0x20
            })
            .map(|(port, _)| port)
            .collect()
    }

    static TIMER_CALLS: AtomicUsize = AtomicUsize::new(0);

    fn count_timer() {
        TIMER_CALLS.fetch_add(1, Ordering::SeqCst);
    }

    #[test]
    fn registered_callback_runs_once_per_dispatch() {
        let mut irqs = dispatcher();
        irqs.set_handler(0, count_timer).unwrap();

        irqs.dispatch(0);
        irqs.dispatch(0);
        irqs.dispatch(0);

        assert_eq!(TIMER_CALLS.load(Ordering::SeqCst), 3);
        assert_eq!(eoi_writes(&mut irqs), [PIC1_COMMAND; 3]);
    }

    #[test]
    fn empty_slot_only_acknowledges() {
        let mut irqs = dispatcher();
        irqs.dispatch(5);
        irqs.dispatch(11);

        assert_eq!(
            eoi_writes(&mut irqs),
            [PIC1_COMMAND, PIC2_COMMAND, PIC1_COMMAND]
        );
    }

    static FIRST: AtomicUsize = AtomicUsize::new(0);
    static SECOND: AtomicUsize = AtomicUsize::new(0);

    fn first() {
        FIRST.fetch_add(1, Ordering::SeqCst);
    }

    fn second() {
        SECOND.fetch_add(1, Ordering::SeqCst);
    }

    #[test]
    fn registration_overwrites() {
        let mut irqs = dispatcher();
        irqs.set_handler(9, first).unwrap();
        irqs.set_handler(9, second).unwrap();
        irqs.dispatch(9);

        assert_eq!(FIRST.load(Ordering::SeqCst), 0);
        assert_eq!(SECOND.load(Ordering::SeqCst), 1);

        irqs.clear_handler(9).unwrap();
        irqs.dispatch(9);
        assert_eq!(SECOND.load(Ordering::SeqCst), 1);
        assert!(matches!(irqs.handler(9), IrqHandler::None));
    }

    #[test]
    fn registration_unmasks_line() {
        let mut irqs = dispatcher();
        irqs.pic().set_mask(14);
        irqs.set_handler(14, first).unwrap();

        assert_eq!(irqs.pic().masks(), (0, 0));
    }

    #[test]
    fn out_of_range_line_is_rejected() {
        let mut irqs = dispatcher();
        assert_eq!(irqs.set_handler(16, first), Err(InvalidIrq(16)));
        assert_eq!(irqs.clear_handler(200), Err(InvalidIrq(200)));
        assert!(matches!(irqs.handler(16), IrqHandler::None));
        assert_eq!(InvalidIrq(16).to_string(), "invalid IRQ line 16");
    }

    #[test]
    fn lines_map_onto_remapped_vectors() {
        assert_eq!(interrupt_index(Irq::Timer as u8), 32);
        assert_eq!(interrupt_index(Irq::Rtc as u8), 40);
        assert_eq!(interrupt_index(Irq::SecondaryAta as u8), 47);
    }
}
