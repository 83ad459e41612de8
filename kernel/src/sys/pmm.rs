//! Bitmap allocator over physical memory in 4 KiB blocks.
//!
//! Bit `i` covers `[i * BLOCK_SIZE, (i + 1) * BLOCK_SIZE)` and is set iff the
//! block is allocated. The first MiB is reserved at init for firmware, the
//! BIOS data area and legacy video memory, and is never handed out.

use super::cmos::Cmos;
use super::port::PortIo;
use bootloader_api::info::{MemoryRegion, MemoryRegionKind};
use spin::Mutex;
use x86_64::structures::paging::{FrameAllocator, PhysFrame, Size4KiB};
use x86_64::PhysAddr;

pub const BLOCK_SIZE: u64 = 4096;
pub const MAX_BLOCKS: usize = 131_072;
pub const RESERVED_BLOCKS: usize = 256;
pub const FALLBACK_MEMORY_KB: u32 = 65536;

const CMOS_MIN_KB: u16 = 1024;

const WORD_BITS: usize = u64::BITS as usize;
const WORDS: usize = MAX_BLOCKS / WORD_BITS;

pub static PMM: Mutex<PhysicalMemoryManager> = Mutex::new(PhysicalMemoryManager::new());

/// Boot record memory information, multiboot style.
#[derive(Debug, Clone, Copy)]
pub struct BootMemoryMap<'a> {
    pub flags: u32,
    /// KiB below 1 MiB.
    pub mem_lower: u32,
    /// KiB above 1 MiB.
    pub mem_upper: u32,
    pub regions: &'a [MemoryRegion],
}

impl BootMemoryMap<'_> {
    /// `mem_lower` and `mem_upper` are valid.
    pub const MEMORY_INFO: u32 = 1 << 0;
    /// `regions` is valid.
    pub const MEMORY_MAP: u32 = 1 << 6;

    /// Memory size in KiB: available regions when the map is present, the
    /// lower/upper figures otherwise, `None` when the record has neither.
    #[must_use]
    pub fn memory_kb(&self) -> Option<u32> {
        if self.flags & Self::MEMORY_MAP != 0 {
            let bytes: u64 = self
                .regions
                .iter()
                .filter(|r| r.kind == MemoryRegionKind::Usable)
                .map(|r| r.end.saturating_sub(r.start))
                .sum();
            return Some(u32::try_from(bytes / 1024).unwrap_or(u32::MAX));
        }
        if self.flags & Self::MEMORY_INFO != 0 {
            return Some(self.mem_lower.saturating_add(self.mem_upper));
        }
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryInfo {
    pub total_memory: u64,
    pub available_memory: u64,
    pub used_memory: u64,
    pub total_blocks: usize,
    pub used_blocks: usize,
}

/// Memory size from the CMOS extended memory registers, falling back to
/// 64 MiB when the reading is implausible.
pub fn detect_memory_kb<P: PortIo>(cmos: &mut Cmos<P>) -> u32 {
    match cmos.extended_memory_kb() {
        kb @ CMOS_MIN_KB..=u16::MAX => u32::from(kb),
        _ => FALLBACK_MEMORY_KB,
    }
}

pub struct PhysicalMemoryManager {
    bitmap: [u64; WORDS],
    total_blocks: usize,
    used_blocks: usize,
    total_memory_kb: u32,
}

impl Default for PhysicalMemoryManager {
    fn default() -> Self {
        Self::new()
    }
}

impl PhysicalMemoryManager {
    /// An empty manager with no blocks; every allocation fails until one of
    /// the `init` functions runs.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            bitmap: [0; WORDS],
            total_blocks: 0,
            used_blocks: 0,
            total_memory_kb: 0,
        }
    }

    pub fn init_with_memory_map(&mut self, total_memory_kb: u32) {
        self.total_memory_kb = total_memory_kb;
        let blocks = u64::from(total_memory_kb) * 1024 / BLOCK_SIZE;
        self.total_blocks = usize::try_from(blocks).map_or(MAX_BLOCKS, |b| b.min(MAX_BLOCKS));
        self.bitmap.fill(0);
        self.used_blocks = 0;

        for block in 0..RESERVED_BLOCKS.min(self.total_blocks) {
            self.set(block);
        }
    }

    /// Sizes the bitmap from the boot record, then keeps every region the
    /// record does not call usable out of the allocator.
    pub fn init_from_boot_map<P: PortIo>(&mut self, map: &BootMemoryMap, cmos: &mut Cmos<P>) {
        let kb = map.memory_kb().unwrap_or_else(|| detect_memory_kb(cmos));
        self.init_with_memory_map(kb);

        if map.flags & BootMemoryMap::MEMORY_MAP != 0 {
            for region in map
                .regions
                .iter()
                .filter(|r| r.kind != MemoryRegionKind::Usable)
            {
                self.reserve_region(
                    PhysAddr::new(region.start),
                    region.end.saturating_sub(region.start),
                );
            }
        }
    }

    pub fn init_detected<P: PortIo>(&mut self, cmos: &mut Cmos<P>) {
        let kb = detect_memory_kb(cmos);
        self.init_with_memory_map(kb);
    }

    /// Marks every block overlapping `[base, base + length)` as used.
    pub fn reserve_region(&mut self, base: PhysAddr, length: u64) {
        if length == 0 {
            return;
        }
        let first = base.as_u64() / BLOCK_SIZE;
        let last = base.as_u64().saturating_add(length - 1) / BLOCK_SIZE;
        let last = last.min(self.total_blocks as u64);

        for block in first..=last {
            let block = block as usize;
            if block < self.total_blocks && !self.test(block) {
                self.set(block);
            }
        }
    }

    /// First free block, lowest address first.
    pub fn alloc_block(&mut self) -> Option<PhysAddr> {
        let block = (0..self.total_blocks).find(|&b| !self.test(b))?;
        self.set(block);
        Some(block_address(block))
    }

    /// First run of `count` free blocks. The bitmap is only touched once a
    /// whole run has been found.
    pub fn alloc_blocks(&mut self, count: usize) -> Option<PhysAddr> {
        if count == 0 || count > self.total_blocks {
            return None;
        }

        let mut start = 0;
        while start + count <= self.total_blocks {
            match (start..start + count).find(|&b| self.test(b)) {
                Some(used) => start = used + 1,
                None => {
                    for block in start..start + count {
                        self.set(block);
                    }
                    return Some(block_address(start));
                }
            }
        }
        None
    }

    /// Out-of-range addresses and blocks that are already free are ignored.
    pub fn free_block(&mut self, addr: PhysAddr) {
        if let Some(block) = self.block_index(addr) {
            self.clear(block);
        }
    }

    pub fn free_blocks(&mut self, addr: PhysAddr, count: usize) {
        if let Some(first) = self.block_index(addr) {
            let end = first.saturating_add(count).min(self.total_blocks);
            for block in first..end {
                self.clear(block);
            }
        }
    }

    #[must_use]
    pub fn is_block_used(&self, block: usize) -> bool {
        self.test(block)
    }

    #[must_use]
    pub const fn total_blocks(&self) -> usize {
        self.total_blocks
    }

    #[must_use]
    pub const fn used_blocks(&self) -> usize {
        self.used_blocks
    }

    #[must_use]
    pub const fn total_memory(&self) -> u64 {
        self.total_blocks as u64 * BLOCK_SIZE
    }

    #[must_use]
    pub const fn used_memory(&self) -> u64 {
        self.used_blocks as u64 * BLOCK_SIZE
    }

    #[must_use]
    pub const fn free_memory(&self) -> u64 {
        (self.total_blocks - self.used_blocks) as u64 * BLOCK_SIZE
    }

    #[must_use]
    pub const fn memory_info(&self) -> MemoryInfo {
        MemoryInfo {
            total_memory: self.total_memory(),
            available_memory: self.free_memory(),
            used_memory: self.used_memory(),
            total_blocks: self.total_blocks,
            used_blocks: self.used_blocks,
        }
    }

    /// Display-only guess at the memory generation from its size.
    #[must_use]
    pub const fn memory_type(&self) -> &'static str {
        if self.total_memory_kb >= 1024 * 1024 {
            "DDR3/DDR4"
        } else if self.total_memory_kb >= 512 * 1024 {
            "DDR2/DDR3"
        } else {
            "SDRAM/DDR"
        }
    }

    fn block_index(&self, addr: PhysAddr) -> Option<usize> {
        usize::try_from(addr.as_u64() / BLOCK_SIZE)
            .ok()
            .filter(|&block| block < self.total_blocks)
    }

    fn test(&self, block: usize) -> bool {
        if block >= self.total_blocks {
            return true;
        }
        self.bitmap[block / WORD_BITS] & (1 << (block % WORD_BITS)) != 0
    }

    fn set(&mut self, block: usize) {
        if block < self.total_blocks {
            self.bitmap[block / WORD_BITS] |= 1 << (block % WORD_BITS);
            self.used_blocks += 1;
        }
    }

    fn clear(&mut self, block: usize) {
        if block < self.total_blocks && self.test(block) {
            self.bitmap[block / WORD_BITS] &= !(1 << (block % WORD_BITS));
            self.used_blocks -= 1;
        }
    }
}

const fn block_address(block: usize) -> PhysAddr {
    PhysAddr::new_truncate(block as u64 * BLOCK_SIZE)
}

unsafe impl FrameAllocator<Size4KiB> for PhysicalMemoryManager {
    fn allocate_frame(&mut self) -> Option<PhysFrame> {
        self.alloc_block().map(PhysFrame::containing_address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sys::port::fake::ScriptedPorts;
    use std::boxed::Box;

    fn pmm(kb: u32) -> Box<PhysicalMemoryManager> {
        let mut pmm = Box::new(PhysicalMemoryManager::new());
        pmm.init_with_memory_map(kb);
        pmm
    }

    fn region(start: u64, end: u64, kind: MemoryRegionKind) -> MemoryRegion {
        let mut region = MemoryRegion::empty();
        region.start = start;
        region.end = end;
        region.kind = kind;
        region
    }

    fn true_occupancy(pmm: &PhysicalMemoryManager) -> usize {
        (0..pmm.total_blocks()).filter(|&b| pmm.is_block_used(b)).count()
    }

    #[test]
    fn init_sizes_and_reserves_low_memory() {
        for kb in [4096, 65536, 131_072, 524_288, 1_048_576, 4_194_304] {
            let pmm = pmm(kb);
            let expected = (kb as usize * 1024 / 4096).min(MAX_BLOCKS);

            assert_eq!(pmm.total_blocks(), expected);
            assert_eq!(pmm.used_blocks(), RESERVED_BLOCKS);
            assert!((0..RESERVED_BLOCKS).all(|b| pmm.is_block_used(b)));
            assert!(!pmm.is_block_used(RESERVED_BLOCKS));
            assert_eq!(pmm.free_memory(), (expected - RESERVED_BLOCKS) as u64 * 4096);
        }
    }

    #[test]
    fn tiny_memory_reserves_what_exists() {
        let mut pmm = pmm(512);

        assert_eq!(pmm.total_blocks(), 128);
        assert_eq!(pmm.used_blocks(), 128);
        assert_eq!(pmm.alloc_block(), None);
    }

    #[test]
    fn end_to_end_64_mib() {
        let mut pmm = pmm(65536);
        assert_eq!(pmm.total_blocks(), 16384);
        assert_eq!(pmm.used_blocks(), 256);

        let addr = pmm.alloc_blocks(3).unwrap();
        assert_eq!(addr.as_u64(), 1_048_576);
        assert!((256..=258).all(|b| pmm.is_block_used(b)));
        assert!(!pmm.is_block_used(259));
        assert_eq!(pmm.used_blocks(), 259);
    }

    #[test]
    fn alloc_block_takes_a_clear_bit() {
        let mut pmm = pmm(8192);
        let mut seen = std::vec::Vec::new();

        while let Some(addr) = pmm.alloc_block() {
            let block = (addr.as_u64() / BLOCK_SIZE) as usize;
            assert!(block >= RESERVED_BLOCKS);
            assert!(!seen.contains(&block));
            assert!(pmm.is_block_used(block));
            seen.push(block);
            assert_eq!(pmm.used_blocks(), RESERVED_BLOCKS + seen.len());
        }

        assert_eq!(seen.len(), 2048 - RESERVED_BLOCKS);
        assert_eq!(pmm.free_memory(), 0);
    }

    #[test]
    fn freed_block_is_reused_first() {
        let mut pmm = pmm(65536);
        let a = pmm.alloc_block().unwrap();
        let b = pmm.alloc_block().unwrap();
        let _c = pmm.alloc_block().unwrap();

        pmm.free_block(b);
        assert!(!pmm.is_block_used((b.as_u64() / BLOCK_SIZE) as usize));
        assert!(pmm.is_block_used((a.as_u64() / BLOCK_SIZE) as usize));
        assert_eq!(pmm.alloc_block(), Some(b));
    }

    #[test]
    fn contiguous_run_skips_holes() {
        let mut pmm = pmm(65536);
        let _ = pmm.alloc_blocks(2).unwrap(); // 256, 257
        let hole = pmm.alloc_block().unwrap(); // 258
        let _ = pmm.alloc_block().unwrap(); // 259
        pmm.free_block(hole);

        let run = pmm.alloc_blocks(2).unwrap();
        assert_eq!(run.as_u64() / BLOCK_SIZE, 260);
        assert!(!pmm.is_block_used(258));
    }

    #[test]
    fn failed_run_leaves_bitmap_untouched() {
        let mut pmm = pmm(2048); // 512 blocks, 256 free
        let before = pmm.memory_info();

        assert_eq!(pmm.alloc_blocks(257), None);
        assert_eq!(pmm.alloc_blocks(0), None);
        assert_eq!(pmm.alloc_blocks(MAX_BLOCKS + 1), None);
        assert_eq!(pmm.memory_info(), before);
        assert_eq!(true_occupancy(&pmm), RESERVED_BLOCKS);

        assert_eq!(pmm.alloc_blocks(256).unwrap().as_u64(), 256 * BLOCK_SIZE);
        assert_eq!(pmm.free_memory(), 0);
    }

    #[test]
    fn double_and_out_of_range_free_are_ignored() {
        let mut pmm = pmm(65536);
        let a = pmm.alloc_block().unwrap();
        pmm.free_block(a);
        pmm.free_block(a);
        pmm.free_block(PhysAddr::new(1 << 40));
        pmm.free_blocks(PhysAddr::new(1 << 40), 4);

        assert_eq!(pmm.used_blocks(), RESERVED_BLOCKS);
        assert_eq!(true_occupancy(&pmm), pmm.used_blocks());
    }

    #[test]
    fn free_blocks_stops_at_the_end_of_memory() {
        let mut pmm = pmm(2048);
        let run = pmm.alloc_blocks(256).unwrap();
        pmm.free_blocks(run, 10_000);

        assert_eq!(pmm.used_blocks(), RESERVED_BLOCKS);
        assert_eq!(true_occupancy(&pmm), RESERVED_BLOCKS);
    }

    #[test]
    fn counters_track_bitmap() {
        let mut pmm = pmm(65536);
        let run = pmm.alloc_blocks(40).unwrap();
        let one = pmm.alloc_block().unwrap();
        pmm.free_blocks(PhysAddr::new(run.as_u64() + 10 * BLOCK_SIZE), 5);
        pmm.reserve_region(PhysAddr::new(0x0100_0000), 3 * BLOCK_SIZE + 1);
        pmm.free_block(one);

        assert_eq!(true_occupancy(&pmm), pmm.used_blocks());
        assert_eq!(
            pmm.memory_info().available_memory + pmm.memory_info().used_memory,
            pmm.memory_info().total_memory
        );
    }

    #[test]
    fn memory_type_is_size_based() {
        assert_eq!(pmm(65536).memory_type(), "SDRAM/DDR");
        assert_eq!(pmm(524_288).memory_type(), "DDR2/DDR3");
        assert_eq!(pmm(2_097_152).memory_type(), "DDR3/DDR4");
    }

    #[test]
    fn boot_map_sums_usable_regions_and_reserves_the_rest() {
        let regions = [
            region(0, 0x9_F000, MemoryRegionKind::Usable),
            region(0x9_F000, 0x10_0000, MemoryRegionKind::UnknownBios(2)),
            region(0x10_0000, 0x40_0000, MemoryRegionKind::Usable),
            region(0x40_0000, 0x48_0000, MemoryRegionKind::Bootloader),
            region(0x48_0000, 0x400_0000, MemoryRegionKind::Usable),
        ];
        let map = BootMemoryMap {
            flags: BootMemoryMap::MEMORY_MAP,
            mem_lower: 0,
            mem_upper: 0,
            regions: &regions,
        };
        let usable = 0x9_F000 + 0x30_0000 + (0x400_0000 - 0x48_0000);
        assert_eq!(map.memory_kb(), Some(usable / 1024));

        let mut ports = ScriptedPorts::new();
        let mut pmm = Box::new(PhysicalMemoryManager::new());
        pmm.init_from_boot_map(&map, &mut Cmos::new(&mut ports));

        assert_eq!(pmm.total_blocks(), (usable / 4096) as usize);
        assert!((0x400..0x480).all(|b| pmm.is_block_used(b)));
        assert_eq!(pmm.used_blocks(), RESERVED_BLOCKS + 0x80);
        assert!(ports.log.is_empty());

        let run = pmm.alloc_blocks(0x300).unwrap();
        assert_eq!(run.as_u64(), 0x10_0000);
        assert_eq!(pmm.alloc_block().unwrap().as_u64(), 0x48_0000);
    }

    #[test]
    fn boot_map_falls_back_to_lower_upper_then_cmos() {
        let info = BootMemoryMap {
            flags: BootMemoryMap::MEMORY_INFO,
            mem_lower: 639,
            mem_upper: 130_048,
            regions: &[],
        };
        assert_eq!(info.memory_kb(), Some(130_687));

        let nothing = BootMemoryMap {
            flags: 0,
            mem_lower: 639,
            mem_upper: 130_048,
            regions: &[],
        };
        assert_eq!(nothing.memory_kb(), None);

        let mut ports = ScriptedPorts::new();
        ports.script(0x71, &[0x00, 0x7C]); // 31744 KiB
        let mut pmm = Box::new(PhysicalMemoryManager::new());
        pmm.init_from_boot_map(&nothing, &mut Cmos::new(&mut ports));
        assert_eq!(pmm.total_blocks(), 31744 / 4);
    }

    #[test]
    fn cmos_reading_is_sanity_checked() {
        let mut ports = ScriptedPorts::new();
        ports.script(0x71, &[0x00, 0x02, 0x00, 0x7C]);
        let mut cmos = Cmos::new(&mut ports);

        assert_eq!(detect_memory_kb(&mut cmos), FALLBACK_MEMORY_KB);
        assert_eq!(detect_memory_kb(&mut cmos), 31744);
    }

    #[test]
    fn detected_init_uses_fallback() {
        let mut ports = ScriptedPorts::new();
        ports.script(0x71, &[0x10, 0x00]);
        let mut pmm = Box::new(PhysicalMemoryManager::new());
        pmm.init_detected(&mut Cmos::new(&mut ports));

        assert_eq!(pmm.total_blocks(), 16384);
    }

    #[test]
    fn frame_allocator_hands_out_pmm_blocks() {
        let mut pmm = pmm(65536);
        let frame = pmm.allocate_frame().unwrap();

        assert_eq!(frame.start_address().as_u64(), 0x10_0000);
        assert!(pmm.is_block_used(256));
    }

    #[test]
    fn uninitialized_manager_allocates_nothing() {
        let mut pmm = Box::new(PhysicalMemoryManager::new());
        assert_eq!(pmm.alloc_block(), None);
        assert_eq!(pmm.alloc_blocks(1), None);
        assert_eq!(pmm.free_memory(), 0);
    }
}
