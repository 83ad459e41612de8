use crate::log;
use lazy_static::lazy_static;
use x86_64::registers::segmentation::{Segment, CS, DS, ES, SS};
use x86_64::structures::gdt::{Descriptor, GlobalDescriptorTable, SegmentSelector};

lazy_static! {
    static ref GDT: (GlobalDescriptorTable, Selectors) = {
        let mut gdt = GlobalDescriptorTable::new();

        let code_selector = gdt.append(Descriptor::kernel_code_segment());
        let data_selector = gdt.append(Descriptor::kernel_data_segment());

        (
            gdt,
            Selectors {
                code_selector,
                data_selector,
            },
        )
    };
}

struct Selectors {
    code_selector: SegmentSelector,
    data_selector: SegmentSelector,
}

/// Selector every interrupt gate jumps through.
#[must_use]
pub fn kernel_code_selector() -> u16 {
    GDT.1.code_selector.0
}

pub fn init() {
    GDT.0.load();

    unsafe { CS::set_reg(GDT.1.code_selector) };
    unsafe { SS::set_reg(GDT.1.data_selector) };
    unsafe { DS::set_reg(GDT.1.data_selector) };
    unsafe { ES::set_reg(GDT.1.data_selector) };

    log!("gdt loaded");
}
