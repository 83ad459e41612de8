//! IDENTIFY DEVICE / IDENTIFY PACKET DEVICE response decoding.

use alloc::string::String;
use bit_field::BitField as _;

pub const WORDS: usize = 256;

/// ATAPI peripheral device type for CD/DVD drives (word 0, bits 8-12).
const ATAPI_TYPE_CDROM: u16 = 0x05;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdentifyData {
    pub model: String,
    pub serial: String,
    pub firmware: String,
    pub cylinders: u16,
    pub heads: u16,
    pub sectors_per_track: u16,
    pub capabilities: u16,
    pub dma_supported: bool,
    pub lba48_supported: bool,
    pub total_sectors28: u32,
    /// Only meaningful when `lba48_supported` is set; zero otherwise.
    pub total_sectors48: u64,
    pub atapi_device_type: u16,
}

impl IdentifyData {
    #[must_use]
    pub fn parse(words: &[u16; WORDS]) -> Self {
        let lba48_supported = words[83].get_bit(10);
        let total_sectors48 = if lba48_supported {
            words[100..104]
                .iter()
                .rev()
                .fold(0, |acc, &word| (acc << 16) | u64::from(word))
        } else {
            0
        };

        Self {
            model: ata_string(&words[27..47]),
            serial: ata_string(&words[10..20]),
            firmware: ata_string(&words[23..27]),
            cylinders: words[1],
            heads: words[3],
            sectors_per_track: words[6],
            capabilities: words[49],
            dma_supported: words[49].get_bit(8),
            lba48_supported,
            total_sectors28: u32::from(words[60]) | (u32::from(words[61]) << 16),
            total_sectors48,
            atapi_device_type: words[0].get_bits(8..13),
        }
    }

    #[must_use]
    pub const fn is_cdrom(&self) -> bool {
        self.atapi_device_type == ATAPI_TYPE_CDROM
    }
}

/// ATA strings store two characters per word, high byte first, padded with
/// spaces.
fn ata_string(words: &[u16]) -> String {
    let bytes: alloc::vec::Vec<u8> = words.iter().flat_map(|w| w.to_be_bytes()).collect();
    String::from_utf8_lossy(&bytes)
        .trim_end_matches([' ', '\0'])
        .into()
}

#[cfg(test)]
pub(crate) fn put_string(words: &mut [u16], text: &str) {
    let mut bytes = alloc::vec![b' '; words.len() * 2];
    bytes[..text.len()].copy_from_slice(text.as_bytes());
    for (word, pair) in words.iter_mut().zip(bytes.chunks(2)) {
        *word = u16::from_be_bytes([pair[0], pair[1]]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn disk_words() -> [u16; WORDS] {
        let mut words = [0; WORDS];
        words[0] = 0x0040;
        words[1] = 16383;
        words[3] = 16;
        words[6] = 63;
        put_string(&mut words[10..20], "QM00001");
        put_string(&mut words[23..27], "2.5+");
        put_string(&mut words[27..47], "QEMU HARDDISK");
        words[49] = 0x0300;
        words[60] = 0x0000;
        words[61] = 0x0400;
        words
    }

    #[test]
    fn strings_are_byte_swapped_and_trimmed() {
        let id = IdentifyData::parse(&disk_words());

        assert_eq!(id.model, "QEMU HARDDISK");
        assert_eq!(id.serial, "QM00001");
        assert_eq!(id.firmware, "2.5+");
    }

    #[test]
    fn geometry_and_lba28() {
        let id = IdentifyData::parse(&disk_words());

        assert_eq!((id.cylinders, id.heads, id.sectors_per_track), (16383, 16, 63));
        assert_eq!(id.total_sectors28, 0x0400_0000);
        assert!(id.dma_supported);
        assert_eq!(id.capabilities, 0x0300);
    }

    #[test]
    fn lba48_count_from_words_100_to_103() {
        let mut words = disk_words();
        words[83] = 1 << 10;
        words[100] = 0x5678;
        words[101] = 0x1234;
        words[102] = 0x0002;
        words[103] = 0x0000;
        let id = IdentifyData::parse(&words);

        assert!(id.lba48_supported);
        assert_eq!(id.total_sectors48, 0x0002_1234_5678);
    }

    #[test]
    fn lba48_count_ignored_without_support_bit() {
        let mut words = disk_words();
        words[100] = 0xFFFF;
        let id = IdentifyData::parse(&words);

        assert!(!id.lba48_supported);
        assert_eq!(id.total_sectors48, 0);
    }

    #[test]
    fn atapi_device_type() {
        let mut words = [0; WORDS];
        words[0] = 0x85C0;
        assert!(IdentifyData::parse(&words).is_cdrom());

        words[0] = 0x8180;
        let id = IdentifyData::parse(&words);
        assert!(!id.is_cdrom());
        assert_eq!(id.atapi_device_type, 0x01);
    }

    #[test]
    fn odd_length_model_keeps_last_character() {
        let mut words = [0; WORDS];
        put_string(&mut words[27..47], "ABC");
        assert_eq!(IdentifyData::parse(&words).model, "ABC");
    }
}
