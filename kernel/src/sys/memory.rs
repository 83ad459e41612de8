use super::allocator;
use super::cmos::Cmos;
use super::pmm::{BootMemoryMap, PMM};
use super::port::HardwarePorts;
use crate::log;
use bootloader_api::info::MemoryRegions;
use x86_64::{
    instructions::interrupts,
    registers::control::Cr3,
    structures::paging::{OffsetPageTable, PageTable},
    VirtAddr,
};

/// Brings up the physical memory manager from the bootloader's memory map,
/// then maps the kernel heap onto blocks it hands out.
pub fn init(physical_memory_offset: u64, memory_regions: &'static MemoryRegions) {
    interrupts::without_interrupts(|| {
        let map = BootMemoryMap {
            flags: BootMemoryMap::MEMORY_MAP,
            mem_lower: 0,
            mem_upper: 0,
            regions: memory_regions,
        };

        let mut pmm = PMM.lock();
        pmm.init_from_boot_map(&map, &mut Cmos::new(HardwarePorts));

        let info = pmm.memory_info();
        log!(
            "pmm initialized: {} blocks, {} KiB free, {} KiB used ({})",
            info.total_blocks,
            info.available_memory / 1024,
            info.used_memory / 1024,
            pmm.memory_type()
        );

        let mut mapper = unsafe { mapper(VirtAddr::new(physical_memory_offset)) };

        if let Err(err) = allocator::init_heap(&mut mapper, &mut *pmm) {
            log!("heap initialization failed: {:?}", err);
            crate::hlt_loop();
        }
    });

    log!("heap initialized");
}

unsafe fn mapper(physical_memory_offset: VirtAddr) -> OffsetPageTable<'static> {
    let level_4_table = unsafe { active_level_4_table(physical_memory_offset) };

    unsafe { OffsetPageTable::new(level_4_table, physical_memory_offset) }
}

unsafe fn active_level_4_table(physical_memory_offset: VirtAddr) -> &'static mut PageTable {
    let (level_4_table_frame, _) = Cr3::read();

    let phys = level_4_table_frame.start_address();
    let virt = physical_memory_offset + phys.as_u64();
    let page_table_ptr: *mut PageTable = virt.as_mut_ptr();

    unsafe { &mut *page_table_ptr }
}
