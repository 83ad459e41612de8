use super::port::PortIo;

const ADDRESS_PORT: u16 = 0x70;
const DATA_PORT: u16 = 0x71;

const NMI_DISABLE: u8 = 0x80;

#[repr(u8)]
enum Register {
    ExtendedMemoryLow = 0x30,
    ExtendedMemoryHigh = 0x31,
}

#[derive(Debug)]
pub struct Cmos<P> {
    ports: P,
}

impl<P: PortIo> Cmos<P> {
    pub const fn new(ports: P) -> Self {
        Self { ports }
    }

    /// Extended memory above 1 MiB in KiB, as the BIOS recorded it at POST.
    /// The register pair saturates at 65535.
    pub fn extended_memory_kb(&mut self) -> u16 {
        let low = self.read_register(Register::ExtendedMemoryLow);
        let high = self.read_register(Register::ExtendedMemoryHigh);
        u16::from_le_bytes([low, high])
    }

    fn read_register(&mut self, reg: Register) -> u8 {
        self.ports.write_u8(ADDRESS_PORT, NMI_DISABLE | reg as u8);
        let value = self.ports.read_u8(DATA_PORT);
        self.ports.write_u8(ADDRESS_PORT, 0);
        value
    }
}
