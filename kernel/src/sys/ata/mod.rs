//! Polled ATA/IDE driver for the two legacy channels.
//!
//! The driver never enables device interrupts (nIEN is set after every
//! channel reset); every wait is a bounded poll of the status register.

use super::irq::Irq;
use super::port::{HardwarePorts, PortIo};
use crate::log;
use alloc::string::String;
use bit_field::BitField as _;
use core::fmt;
use lazy_static::lazy_static;
use spin::Mutex;

pub mod identify;
pub mod timeout;

pub use identify::IdentifyData;
pub use timeout::{Deadline, IterationTimeout, Timeout};

pub const SECTOR_SIZE: usize = 512;
const WORDS_PER_SECTOR: usize = SECTOR_SIZE / 2;

pub const PRIMARY_BASE: u16 = 0x1F0;
pub const PRIMARY_CONTROL: u16 = 0x3F6;
pub const SECONDARY_BASE: u16 = 0x170;
pub const SECONDARY_CONTROL: u16 = 0x376;

pub const CHANNELS: usize = 2;
pub const DRIVES_PER_CHANNEL: usize = 2;

/// Highest block reachable with 28-bit addressing.
pub const LBA28_MAX: u64 = 0x0FFF_FFFF;

/// Register offsets from a channel's command block base.
pub mod reg {
    pub const DATA: u16 = 0x00;
    pub const ERROR: u16 = 0x01;
    pub const FEATURES: u16 = 0x01;
    pub const SECTOR_COUNT: u16 = 0x02;
    pub const LBA_LOW: u16 = 0x03;
    pub const LBA_MID: u16 = 0x04;
    pub const LBA_HIGH: u16 = 0x05;
    pub const DEVICE: u16 = 0x06;
    pub const COMMAND: u16 = 0x07;
    pub const STATUS: u16 = 0x07;
}

const CONTROL_NIEN: u8 = 0x02;
const CONTROL_SRST: u8 = 0x04;

/// Reads of the alternate status register that add up to the 400 ns the
/// device needs after a drive select or command.
const SELECT_DELAY_READS: usize = 4;
const RESET_DELAY_READS: usize = 64;

const UNKNOWN_MODEL: &str = "Unknown device";

lazy_static! {
    pub static ref IDE: Mutex<IdeController<HardwarePorts>> =
        Mutex::new(IdeController::new(HardwarePorts, IdeConfig::default()));
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Read = 0x20,
    ReadExt = 0x24,
    Write = 0x30,
    WriteExt = 0x34,
    IdentifyPacket = 0xA1,
    Identify = 0xEC,
}

#[allow(dead_code)]
#[repr(usize)]
#[derive(Debug, Clone, Copy)]
enum Status {
    Err = 0,  // Error
    Idx = 1,  // (obsolete)
    Corr = 2, // (obsolete)
    Drq = 3,  // Data Request
    Srv = 4,  // (command dependant)
    Df = 5,   // Drive Fault
    Drdy = 6, // Device Ready
    Bsy = 7,  // Busy
}

fn has(status: u8, bit: Status) -> bool {
    status.get_bit(bit as usize)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdeError {
    Timeout,
    NotFound,
    BadStatus,
    DriveFault,
    InvalidArgument,
}

impl IdeError {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Timeout => "Timeout",
            Self::NotFound => "Drive not found",
            Self::BadStatus => "Bad status",
            Self::DriveFault => "Drive fault",
            Self::InvalidArgument => "Invalid argument",
        }
    }
}

impl fmt::Display for IdeError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[must_use]
pub const fn error_to_string(error: Option<IdeError>) -> &'static str {
    match error {
        Some(error) => error.as_str(),
        None => "No error",
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DeviceClass {
    #[default]
    None,
    Hdd,
    CdRom,
    Atapi,
}

#[derive(Debug, Clone, Copy)]
pub struct IdeConfig<T = IterationTimeout> {
    pub timeout: T,
    /// Extra rounds of waiting for IDENTIFY data after a timeout.
    pub identify_retries: u8,
}

impl<T: Default> Default for IdeConfig<T> {
    fn default() -> Self {
        Self {
            timeout: T::default(),
            identify_retries: 3,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct Drive {
    pub channel: u8,
    pub unit: u8,
    pub present: bool,
    pub class: DeviceClass,
    pub atapi: bool,
    pub model: String,
    pub serial: String,
    pub firmware: String,
    pub cylinders: u16,
    pub heads: u16,
    pub sectors_per_track: u16,
    pub capabilities: u16,
    pub dma_supported: bool,
    pub lba48_supported: bool,
    pub total_sectors: u32,
    pub total_sectors48: u64,
}

impl Drive {
    fn identified(channel: u8, unit: u8, class: DeviceClass, id: IdentifyData) -> Self {
        Self {
            channel,
            unit,
            present: true,
            class,
            atapi: matches!(class, DeviceClass::CdRom | DeviceClass::Atapi),
            model: id.model,
            serial: id.serial,
            firmware: id.firmware,
            cylinders: id.cylinders,
            heads: id.heads,
            sectors_per_track: id.sectors_per_track,
            capabilities: id.capabilities,
            dma_supported: id.dma_supported,
            lba48_supported: id.lba48_supported,
            total_sectors: id.total_sectors28,
            total_sectors48: id.total_sectors48,
        }
    }

    /// The bus answered but neither IDENTIFY variant did.
    fn unidentified(channel: u8, unit: u8) -> Self {
        Self {
            channel,
            unit,
            present: true,
            model: String::from(UNKNOWN_MODEL),
            ..Self::default()
        }
    }

    /// Sector I/O is only attempted on identified ATA disks.
    #[must_use]
    pub fn is_disk(&self) -> bool {
        self.present && self.class == DeviceClass::Hdd
    }

    #[must_use]
    pub fn block_count(&self) -> u64 {
        if self.lba48_supported {
            self.total_sectors48
        } else {
            u64::from(self.total_sectors)
        }
    }

    fn humanized_size(&self) -> (u64, &'static str) {
        let bytes = self.block_count() * SECTOR_SIZE as u64;
        if bytes >> 20 < 1000 {
            (bytes >> 20, "MB")
        } else {
            (bytes >> 30, "GB")
        }
    }
}

impl fmt::Display for Drive {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.class {
            DeviceClass::Hdd => {
                let (size, unit) = self.humanized_size();
                write!(f, "{} {} ({} {})", self.model, self.serial, size, unit)
            }
            DeviceClass::CdRom => write!(f, "{} {} (CD-ROM)", self.model, self.serial),
            DeviceClass::Atapi => write!(f, "{} {} (ATAPI)", self.model, self.serial),
            DeviceClass::None => f.write_str(&self.model),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Channel {
    pub base: u16,
    pub control: u16,
    pub irq: u8,
    pub drives: [Drive; DRIVES_PER_CHANNEL],
}

impl Channel {
    fn new(base: u16, control: u16, irq: Irq) -> Self {
        Self {
            base,
            control,
            irq: irq as u8,
            drives: Default::default(),
        }
    }
}

pub struct IdeController<P, T = IterationTimeout> {
    ports: P,
    config: IdeConfig<T>,
    channels: [Channel; CHANNELS],
    drive_count: usize,
    last_error: Option<IdeError>,
}

impl<P: PortIo, T: Timeout> IdeController<P, T> {
    pub fn new(ports: P, config: IdeConfig<T>) -> Self {
        Self {
            ports,
            config,
            channels: [
                Channel::new(PRIMARY_BASE, PRIMARY_CONTROL, Irq::PrimaryAta),
                Channel::new(SECONDARY_BASE, SECONDARY_CONTROL, Irq::SecondaryAta),
            ],
            drive_count: 0,
            last_error: None,
        }
    }

    #[must_use]
    pub const fn last_error(&self) -> Option<IdeError> {
        self.last_error
    }

    #[must_use]
    pub const fn drive_count(&self) -> usize {
        self.drive_count
    }

    #[must_use]
    pub fn channel(&self, channel: u8) -> Option<&Channel> {
        self.channels.get(usize::from(channel))
    }

    #[must_use]
    pub fn drive(&self, channel: u8, drive: u8) -> Option<&Drive> {
        self.channel(channel)?.drives.get(usize::from(drive))
    }

    pub fn drives(&self) -> impl Iterator<Item = &Drive> {
        self.channels
            .iter()
            .flat_map(|channel| channel.drives.iter())
            .filter(|drive| drive.present)
    }

    /// Re-reads both channels from scratch and returns how many drives
    /// answered. An empty channel or slot never hides a more specific error
    /// seen earlier in the same pass.
    pub fn detect_all(&mut self) -> usize {
        self.last_error = None;
        self.drive_count = 0;
        for channel in &mut self.channels {
            channel.drives = Default::default();
        }

        for channel in 0..CHANNELS as u8 {
            let earlier = self.last_error;
            let Ok((base, control)) = self.probe_channel(channel) else {
                self.keep_specific_error(earlier);
                continue;
            };
            self.reset(control);

            for unit in 0..DRIVES_PER_CHANNEL as u8 {
                let earlier = self.last_error;
                if self.probe_drive_at(base, control, unit).is_err() {
                    self.keep_specific_error(earlier);
                    continue;
                }

                let drive = self.identify_drive(channel, unit);
                self.keep_specific_error(earlier);
                self.channels[usize::from(channel)].drives[usize::from(unit)] = drive;
                self.drive_count += 1;
            }
        }

        self.drive_count
    }

    fn keep_specific_error(&mut self, earlier: Option<IdeError>) {
        if self.last_error == Some(IdeError::NotFound) && earlier.is_some() {
            self.last_error = earlier;
        }
    }

    fn identify_drive(&mut self, channel: u8, unit: u8) -> Drive {
        if let Ok(id) = self.identify_ata(channel, unit) {
            return Drive::identified(channel, unit, DeviceClass::Hdd, id);
        }
        if let Ok(id) = self.identify_atapi(channel, unit) {
            let class = if id.is_cdrom() {
                DeviceClass::CdRom
            } else {
                DeviceClass::Atapi
            };
            return Drive::identified(channel, unit, class, id);
        }
        Drive::unidentified(channel, unit)
    }

    /// A port reads as absent when three status reads all float high or all
    /// read zero.
    pub fn port_present(&mut self, base: u16) -> bool {
        let reads = [(); 3].map(|()| self.ports.read_u8(base + reg::STATUS));
        !(reads.iter().all(|&s| s == 0xFF) || reads.iter().all(|&s| s == 0x00))
    }

    /// Returns the channel's command and control ports when something
    /// drives its status register.
    pub fn probe_channel(&mut self, channel: u8) -> Result<(u16, u16), IdeError> {
        let (base, control) = self.ports_of(channel)?;

        if !self.port_present(base) {
            return self.fail(IdeError::NotFound);
        }

        for _ in 0..4 {
            let status = self.ports.read_u8(base + reg::STATUS);
            if status != 0xFF && status != 0x00 {
                return Ok((base, control));
            }
        }

        self.fail(IdeError::NotFound)
    }

    pub fn reset_channel(&mut self, channel: u8) -> Result<(), IdeError> {
        let (_, control) = self.ports_of(channel)?;
        self.reset(control);
        Ok(())
    }

    /// Pulses SRST, then leaves the channel with device interrupts disabled.
    fn reset(&mut self, control: u16) {
        self.ports.write_u8(control, CONTROL_SRST);
        self.delay(control, SELECT_DELAY_READS);
        self.ports.write_u8(control, 0);
        self.delay(control, RESET_DELAY_READS);
        self.ports.write_u8(control, CONTROL_NIEN);
    }

    pub fn probe_drive(&mut self, channel: u8, drive: u8) -> Result<(), IdeError> {
        let (base, control) = self.ports_of(channel)?;
        Self::check_drive_index(drive).or_else(|err| self.fail(err))?;
        self.probe_drive_at(base, control, drive)
    }

    /// Selects the drive, confirms the selection stuck and that the selected
    /// drive drives the status register, then waits for BSY to clear.
    fn probe_drive_at(&mut self, base: u16, control: u16, drive: u8) -> Result<(), IdeError> {
        self.select(base, control, drive);

        let device = self.ports.read_u8(base + reg::DEVICE);
        if device == 0xFF || device.get_bit(4) != (drive == 1) {
            return self.fail(IdeError::NotFound);
        }
        if !self.port_present(base) {
            return self.fail(IdeError::NotFound);
        }

        self.wait_ready(base)?;
        Ok(())
    }

    pub fn identify_ata(&mut self, channel: u8, drive: u8) -> Result<IdentifyData, IdeError> {
        self.identify(channel, drive, Command::Identify)
    }

    pub fn identify_atapi(&mut self, channel: u8, drive: u8) -> Result<IdentifyData, IdeError> {
        self.identify(channel, drive, Command::IdentifyPacket)
    }

    fn identify(
        &mut self,
        channel: u8,
        drive: u8,
        command: Command,
    ) -> Result<IdentifyData, IdeError> {
        let (base, control) = self.ports_of(channel)?;
        Self::check_drive_index(drive).or_else(|err| self.fail(err))?;

        self.select(base, control, drive);
        self.wait_ready(base)?;

        self.ports.write_u8(base + reg::SECTOR_COUNT, 0);
        self.ports.write_u8(base + reg::LBA_LOW, 0);
        self.ports.write_u8(base + reg::LBA_MID, 0);
        self.ports.write_u8(base + reg::LBA_HIGH, 0);
        self.ports.write_u8(base + reg::COMMAND, command as u8);
        self.delay(control, SELECT_DELAY_READS);

        if self.ports.read_u8(base + reg::STATUS) == 0 {
            // Nothing on the wire answered this command
            return self.fail(IdeError::NotFound);
        }

        let mut attempt = 0;
        loop {
            let ready = self.wait_ready(base).and_then(|_| self.wait_drq(base));
            match ready {
                Ok(()) => break,
                Err(IdeError::Timeout) if attempt < self.config.identify_retries => attempt += 1,
                Err(IdeError::BadStatus) if self.packet_signature(base) => {
                    // Aborted because the device speaks the other protocol
                    return self.fail(IdeError::NotFound);
                }
                Err(err) => return Err(err),
            }
        }

        let mut words = [0; identify::WORDS];
        for word in &mut words {
            *word = self.ports.read_u16(base + reg::DATA);
        }

        Ok(IdentifyData::parse(&words))
    }

    /// Signature an ATAPI or SATA device leaves in the LBA mid/high
    /// registers after aborting IDENTIFY DEVICE.
    fn packet_signature(&mut self, base: u16) -> bool {
        let mid = self.ports.read_u8(base + reg::LBA_MID);
        let high = self.ports.read_u8(base + reg::LBA_HIGH);
        matches!((mid, high), (0x14, 0xEB) | (0x69, 0x96) | (0x3C, 0xC3))
    }

    #[must_use]
    pub fn check_presence(&mut self, channel: u8, drive: u8) -> bool {
        match self.drive(channel, drive) {
            Some(drive) => drive.present,
            None => {
                self.last_error = Some(IdeError::InvalidArgument);
                false
            }
        }
    }

    pub fn read_sectors(
        &mut self,
        channel: u8,
        drive: u8,
        lba: u64,
        count: u8,
        buf: &mut [u8],
    ) -> Result<(), IdeError> {
        let base = self.prepare_transfer(channel, drive, count, buf.len())?;
        self.issue_transfer(base, drive, lba, count, Command::Read, Command::ReadExt)?;

        for sector in buf.chunks_exact_mut(SECTOR_SIZE) {
            self.wait_drq(base)?;
            for chunk in sector.chunks_exact_mut(2) {
                let data = self.ports.read_u16(base + reg::DATA).to_le_bytes();
                chunk.copy_from_slice(&data);
            }
        }

        self.last_error = None;
        Ok(())
    }

    pub fn write_sectors(
        &mut self,
        channel: u8,
        drive: u8,
        lba: u64,
        count: u8,
        buf: &[u8],
    ) -> Result<(), IdeError> {
        let base = self.prepare_transfer(channel, drive, count, buf.len())?;
        self.issue_transfer(base, drive, lba, count, Command::Write, Command::WriteExt)?;

        for sector in buf.chunks_exact(SECTOR_SIZE) {
            self.wait_drq(base)?;
            for chunk in sector.chunks_exact(2) {
                self.ports
                    .write_u16(base + reg::DATA, u16::from_le_bytes([chunk[0], chunk[1]]));
            }
            let status = self.wait_ready(base)?;
            if has(status, Status::Df) {
                return self.fail(IdeError::DriveFault);
            }
            if has(status, Status::Err) {
                return self.fail(IdeError::BadStatus);
            }
        }

        self.last_error = None;
        Ok(())
    }

    /// Validates a transfer request and returns the channel's base port.
    fn prepare_transfer(
        &mut self,
        channel: u8,
        drive: u8,
        count: u8,
        len: usize,
    ) -> Result<u16, IdeError> {
        let (base, _) = self.ports_of(channel)?;
        Self::check_drive_index(drive).or_else(|err| self.fail(err))?;

        if count == 0 || len != usize::from(count) * SECTOR_SIZE {
            return self.fail(IdeError::InvalidArgument);
        }
        if !self.drive(channel, drive).is_some_and(Drive::is_disk) {
            return self.fail(IdeError::NotFound);
        }

        Ok(base)
    }

    /// Programs the task file and issues the command. Blocks past the 28-bit
    /// range get the EXT opcode, but only the low 28 address bits and an
    /// 8-bit count are written: the high-order LBA and count registers that
    /// the EXT commands also need are never programmed.
    fn issue_transfer(
        &mut self,
        base: u16,
        drive: u8,
        lba: u64,
        count: u8,
        command: Command,
        extended: Command,
    ) -> Result<(), IdeError> {
        self.wait_ready(base)?;

        #[allow(clippy::cast_possible_truncation)]
        let bytes = (lba as u32).to_le_bytes();
        let mut device = bytes[3] & 0x0F;
        device.set_bit(4, drive > 0);
        device.set_bit(5, true);
        device.set_bit(6, true); // LBA
        device.set_bit(7, true);

        self.ports.write_u8(base + reg::SECTOR_COUNT, count);
        self.ports.write_u8(base + reg::LBA_LOW, bytes[0]);
        self.ports.write_u8(base + reg::LBA_MID, bytes[1]);
        self.ports.write_u8(base + reg::LBA_HIGH, bytes[2]);
        self.ports.write_u8(base + reg::DEVICE, device);

        let command = if lba > LBA28_MAX { extended } else { command };
        self.ports.write_u8(base + reg::COMMAND, command as u8);

        Ok(())
    }

    fn select(&mut self, base: u16, control: u16, drive: u8) {
        self.ports.write_u8(base + reg::DEVICE, 0xA0 | (drive << 4));
        self.delay(control, SELECT_DELAY_READS);
    }

    fn delay(&mut self, control: u16, reads: usize) {
        for _ in 0..reads {
            self.ports.read_u8(control);
        }
    }

    /// Polls until BSY clears and returns the final status.
    fn wait_ready(&mut self, base: u16) -> Result<u8, IdeError> {
        let mut deadline = self.config.timeout.start();
        loop {
            let status = self.ports.read_u8(base + reg::STATUS);
            if !has(status, Status::Bsy) {
                return Ok(status);
            }
            if deadline.expired() {
                return self.timed_out(base, Status::Bsy);
            }
            core::hint::spin_loop();
        }
    }

    /// Polls until the device asks for data, failing early on ERR or DF.
    fn wait_drq(&mut self, base: u16) -> Result<(), IdeError> {
        let mut deadline = self.config.timeout.start();
        loop {
            let status = self.ports.read_u8(base + reg::STATUS);
            if !has(status, Status::Bsy) {
                if has(status, Status::Err) {
                    return self.fail(IdeError::BadStatus);
                }
                if has(status, Status::Df) {
                    return self.fail(IdeError::DriveFault);
                }
                if has(status, Status::Drq) {
                    return Ok(());
                }
            }
            if deadline.expired() {
                return self.timed_out(base, Status::Drq);
            }
            core::hint::spin_loop();
        }
    }

    fn timed_out<X>(&mut self, base: u16, bit: Status) -> Result<X, IdeError> {
        log!("ATA hanged while polling {:?} bit in status register", bit);
        self.debug(base);
        self.fail(IdeError::Timeout)
    }

    fn debug(&mut self, base: u16) {
        log!(
            "ATA status register: 0b{:08b} <BSY|DRDY|DF|#|DRQ|#|#|ERR>",
            self.ports.read_u8(base + reg::STATUS)
        );
        log!(
            "ATA error register:  0b{:08b} <#|#|#|#|#|ABRT|#|#>",
            self.ports.read_u8(base + reg::ERROR)
        );
    }

    fn fail<X>(&mut self, error: IdeError) -> Result<X, IdeError> {
        self.last_error = Some(error);
        Err(error)
    }

    fn ports_of(&mut self, channel: u8) -> Result<(u16, u16), IdeError> {
        match self.channels.get(usize::from(channel)) {
            Some(c) => Ok((c.base, c.control)),
            None => self.fail(IdeError::InvalidArgument),
        }
    }

    const fn check_drive_index(drive: u8) -> Result<(), IdeError> {
        if (drive as usize) < DRIVES_PER_CHANNEL {
            Ok(())
        } else {
            Err(IdeError::InvalidArgument)
        }
    }
}

pub fn init() {
    let mut ide = IDE.lock();
    let count = ide.detect_all();

    for drive in ide.drives() {
        log!("ATA {}:{} {}", drive.channel, drive.unit, drive);
    }
    log!("ide: {} drive(s) detected", count);
}

/// Runs a fresh detection pass over both channels.
pub fn detect_all() -> usize {
    IDE.lock().detect_all()
}

pub fn read(channel: u8, drive: u8, lba: u64, count: u8, buf: &mut [u8]) -> Result<(), IdeError> {
    IDE.lock().read_sectors(channel, drive, lba, count, buf)
}

pub fn write(channel: u8, drive: u8, lba: u64, count: u8, buf: &[u8]) -> Result<(), IdeError> {
    IDE.lock().write_sectors(channel, drive, lba, count, buf)
}

#[must_use]
pub fn check_presence(channel: u8, drive: u8) -> bool {
    IDE.lock().check_presence(channel, drive)
}

#[must_use]
pub fn last_error() -> Option<IdeError> {
    IDE.lock().last_error()
}
