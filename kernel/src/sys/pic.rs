//! Cascaded 8259 interrupt controllers.
//!
//! ```text
//! master 0x20/0x21  IRQ 0-7   -> vectors 32-39
//! slave  0xA0/0xA1  IRQ 8-15  -> vectors 40-47 (cascaded on master IRQ 2)
//! ```

use super::port::PortIo;

pub const PIC_1_OFFSET: u8 = 0x20;
pub const PIC_2_OFFSET: u8 = 0x28;

pub const PIC1_COMMAND: u16 = 0x20;
pub const PIC1_DATA: u16 = 0x21;
pub const PIC2_COMMAND: u16 = 0xA0;
pub const PIC2_DATA: u16 = 0xA1;

const ICW1_INIT: u8 = 0x10;
const ICW1_ICW4: u8 = 0x01;
const ICW4_8086: u8 = 0x01;
const CMD_END_OF_INTERRUPT: u8 = 0x20;

/// Number of IRQ lines across both controllers.
pub const LINES: u8 = 16;

#[derive(Debug)]
pub struct Pic<P> {
    ports: P,
}

impl<P: PortIo> Pic<P> {
    pub const fn new(ports: P) -> Self {
        Self { ports }
    }

    /// Moves IRQs 0-15 off the CPU exception vectors and unmasks every line.
    pub fn remap(&mut self) {
        self.ports.write_u8(PIC1_COMMAND, ICW1_INIT | ICW1_ICW4);
        self.ports.write_u8(PIC2_COMMAND, ICW1_INIT | ICW1_ICW4);
        self.ports.write_u8(PIC1_DATA, PIC_1_OFFSET);
        self.ports.write_u8(PIC2_DATA, PIC_2_OFFSET);
        self.ports.write_u8(PIC1_DATA, 4); // Slave on IRQ 2
        self.ports.write_u8(PIC2_DATA, 2); // Cascade identity
        self.ports.write_u8(PIC1_DATA, ICW4_8086);
        self.ports.write_u8(PIC2_DATA, ICW4_8086);
        self.ports.write_u8(PIC1_DATA, 0);
        self.ports.write_u8(PIC2_DATA, 0);
    }

    pub fn end_of_interrupt(&mut self, irq: u8) {
        if irq >= 8 {
            self.ports.write_u8(PIC2_COMMAND, CMD_END_OF_INTERRUPT);
        }
        self.ports.write_u8(PIC1_COMMAND, CMD_END_OF_INTERRUPT);
    }

    pub fn set_mask(&mut self, irq: u8) {
        let (port, line) = mask_port(irq);
        let value = self.ports.read_u8(port) | (1 << line);
        self.ports.write_u8(port, value);
    }

    pub fn clear_mask(&mut self, irq: u8) {
        let (port, line) = mask_port(irq);
        let value = self.ports.read_u8(port) & !(1 << line);
        self.ports.write_u8(port, value);
    }

    pub fn masks(&mut self) -> (u8, u8) {
        (self.ports.read_u8(PIC1_DATA), self.ports.read_u8(PIC2_DATA))
    }

    #[cfg(test)]
    pub fn ports(&self) -> &P {
        &self.ports
    }
}

const fn mask_port(irq: u8) -> (u16, u8) {
    if irq < 8 {
        (PIC1_DATA, irq)
    } else {
        (PIC2_DATA, irq - 8)
    }
}
