//! Interrupt vector table.
//!
//! The table is owned here rather than built with
//! `x86_64::structures::idt::InterruptDescriptorTable` because gates are
//! installed one at a time from raw entry addresses: exception stubs are
//! naked functions and IRQ trampolines are bound after the PIC remap.

use crate::log;
use core::mem::size_of;
use lazy_static::lazy_static;
use spin::Mutex;
use x86_64::structures::DescriptorTablePointer;
use x86_64::VirtAddr;

pub const ENTRIES: usize = 256;

/// Present, ring 0, 64-bit interrupt gate.
pub const INTERRUPT_GATE: u8 = 0x8E;

lazy_static! {
    pub static ref IDT: Mutex<VectorTable> = Mutex::new(VectorTable::new());
}

/// One long-mode gate descriptor.
///
/// The first eight bytes are the classic protected-mode gate
/// (`base_low`, `selector`, `reserved`, `type_attr`, `base_high`); long mode
/// appends the upper half of the handler address and a reserved dword.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Gate {
    base_low: u16,
    selector: u16,
    reserved: u8,
    type_attr: u8,
    base_high: u16,
    base_upper: u32,
    reserved_upper: u32,
}

const _: () = assert!(size_of::<Gate>() == 16);

impl Gate {
    #[must_use]
    pub const fn missing() -> Self {
        Self {
            base_low: 0,
            selector: 0,
            reserved: 0,
            type_attr: 0,
            base_high: 0,
            base_upper: 0,
            reserved_upper: 0,
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    #[must_use]
    pub const fn new(handler: u64, selector: u16, type_attr: u8) -> Self {
        Self {
            base_low: handler as u16,
            selector,
            reserved: 0,
            type_attr,
            base_high: (handler >> 16) as u16,
            base_upper: (handler >> 32) as u32,
            reserved_upper: 0,
        }
    }

    #[must_use]
    pub const fn handler_address(&self) -> u64 {
        (self.base_low as u64) | ((self.base_high as u64) << 16) | ((self.base_upper as u64) << 32)
    }

    #[must_use]
    pub const fn selector(&self) -> u16 {
        self.selector
    }

    #[must_use]
    pub const fn type_attr(&self) -> u8 {
        self.type_attr
    }

    #[must_use]
    pub const fn is_present(&self) -> bool {
        self.type_attr & 0x80 != 0
    }

    /// Wire image of the gate, little-endian.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; 16] {
        let mut bytes = [0; 16];
        bytes[0..2].copy_from_slice(&self.base_low.to_le_bytes());
        bytes[2..4].copy_from_slice(&self.selector.to_le_bytes());
        bytes[4] = self.reserved;
        bytes[5] = self.type_attr;
        bytes[6..8].copy_from_slice(&self.base_high.to_le_bytes());
        bytes[8..12].copy_from_slice(&self.base_upper.to_le_bytes());
        bytes[12..16].copy_from_slice(&self.reserved_upper.to_le_bytes());
        bytes
    }
}

#[repr(C, align(16))]
pub struct VectorTable {
    entries: [Gate; ENTRIES],
}

impl Default for VectorTable {
    fn default() -> Self {
        Self::new()
    }
}

impl VectorTable {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: [Gate::missing(); ENTRIES],
        }
    }

    /// Writes the gate for `vector`. Nothing is validated: a bad selector
    /// or a handler address that is not an interrupt entry point only shows
    /// up when the vector fires.
    pub fn set_gate(&mut self, vector: u8, handler: u64, selector: u16, type_attr: u8) {
        self.entries[usize::from(vector)] = Gate::new(handler, selector, type_attr);
    }

    #[must_use]
    pub fn gate(&self, vector: u8) -> &Gate {
        &self.entries[usize::from(vector)]
    }

    pub fn clear(&mut self) {
        self.entries.fill(Gate::missing());
    }

    #[allow(clippy::cast_possible_truncation)]
    #[must_use]
    pub fn pointer(&self) -> DescriptorTablePointer {
        DescriptorTablePointer {
            limit: (size_of::<[Gate; ENTRIES]>() - 1) as u16,
            base: VirtAddr::from_ptr(self.entries.as_ptr()),
        }
    }

    /// Zero-fills every gate and loads the table into the CPU.
    ///
    /// # Safety
    ///
    /// The table must stay at this address, and stay alive, for as long as
    /// the CPU may take an interrupt through it. Interrupts must be disabled.
    pub unsafe fn install(&mut self) {
        self.clear();
        let pointer = self.pointer();
        unsafe { x86_64::instructions::tables::lidt(&pointer) };
    }
}

/// Installs a gate in the kernel table.
pub fn set_gate(vector: u8, handler: u64, selector: u16, type_attr: u8) {
    IDT.lock().set_gate(vector, handler, selector, type_attr);
}

pub fn init() {
    // The table lives in a static, so its address never changes.
    unsafe { IDT.lock().install() };

    log!("idt loaded");
}
