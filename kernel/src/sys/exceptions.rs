//! CPU exception vectors 0-31.
//!
//! Every stub funnels into [`dispatch`], which reports the fault and halts.
//! Nothing here ever returns to the faulting instruction.

use super::{gdt, idt};
use crate::log;
use core::arch::naked_asm;
use core::fmt;
use x86_64::instructions::interrupts;
use x86_64::registers::control::Cr2;
use x86_64::structures::idt::InterruptStackFrameValue;

pub const COUNT: u8 = 32;

const NAMES: [&str; COUNT as usize] = [
    "DIVIDE ERROR",
    "DEBUG",
    "NON-MASKABLE INTERRUPT",
    "BREAKPOINT",
    "OVERFLOW",
    "BOUND RANGE EXCEEDED",
    "INVALID OPCODE",
    "DEVICE NOT AVAILABLE",
    "DOUBLE FAULT",
    "COPROCESSOR SEGMENT OVERRUN",
    "INVALID TSS",
    "SEGMENT NOT PRESENT",
    "STACK SEGMENT FAULT",
    "GENERAL PROTECTION FAULT",
    "PAGE FAULT",
    "RESERVED",
    "X87 FLOATING POINT",
    "ALIGNMENT CHECK",
    "MACHINE CHECK",
    "SIMD FLOATING POINT",
    "VIRTUALIZATION",
    "CONTROL PROTECTION",
    "RESERVED",
    "RESERVED",
    "RESERVED",
    "RESERVED",
    "RESERVED",
    "RESERVED",
    "HYPERVISOR INJECTION",
    "VMM COMMUNICATION",
    "SECURITY",
    "RESERVED",
];

const PAGE_FAULT: u64 = 14;

#[must_use]
pub fn name(vector: u8) -> &'static str {
    NAMES.get(usize::from(vector)).copied().unwrap_or("UNKNOWN")
}

/// Whether the CPU pushes an error code for this vector.
#[must_use]
pub const fn has_error_code(vector: u8) -> bool {
    matches!(vector, 8 | 10..=14 | 17 | 21 | 29 | 30)
}

/// General-purpose registers in the order the common stub leaves them on
/// the stack (last pushed first).
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct Registers {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rbp: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rbx: u64,
    pub rax: u64,
}

impl fmt::Display for Registers {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(
            f,
            "RAX={:016x} RBX={:016x} RCX={:016x} RDX={:016x}",
            self.rax, self.rbx, self.rcx, self.rdx
        )?;
        writeln!(
            f,
            "RSI={:016x} RDI={:016x} RBP={:016x} R8 ={:016x}",
            self.rsi, self.rdi, self.rbp, self.r8
        )?;
        writeln!(
            f,
            "R9 ={:016x} R10={:016x} R11={:016x} R12={:016x}",
            self.r9, self.r10, self.r11, self.r12
        )?;
        write!(
            f,
            "R13={:016x} R14={:016x} R15={:016x}",
            self.r13, self.r14, self.r15
        )
    }
}

/// Everything on the stack when a stub calls into Rust.
#[repr(C)]
#[derive(Debug)]
pub struct ExceptionContext {
    pub registers: Registers,
    pub vector: u64,
    pub error_code: u64,
    pub frame: InterruptStackFrameValue,
}

impl ExceptionContext {
    #[allow(clippy::cast_possible_truncation)]
    #[must_use]
    pub fn name(&self) -> &'static str {
        if self.vector < u64::from(COUNT) {
            name(self.vector as u8)
        } else {
            "UNKNOWN"
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    #[must_use]
    pub fn has_error_code(&self) -> bool {
        self.vector < u64::from(COUNT) && has_error_code(self.vector as u8)
    }
}

impl fmt::Display for ExceptionContext {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "EXCEPTION {}: {}", self.vector, self.name())?;
        if self.has_error_code() {
            write!(f, " (error code {:#x})", self.error_code)?;
        }
        Ok(())
    }
}

extern "sysv64" fn dispatch(context: &ExceptionContext) -> ! {
    interrupts::disable();

    log!("{}", context);
    if context.vector == PAGE_FAULT {
        log!("Accessed Address: {:?}", Cr2::read());
    }
    log!("Stack Frame: {:#?}", context.frame);
    log!("Registers:\n{}", context.registers);
    log!("system halted");

    crate::hlt_loop();
}

#[unsafe(naked)]
extern "sysv64" fn common_stub() {
    naked_asm!(
        "push rax",
        "push rbx",
        "push rcx",
        "push rdx",
        "push rsi",
        "push rdi",
        "push rbp",
        "push r8",
        "push r9",
        "push r10",
        "push r11",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        "mov rdi, rsp", // Arg #1: exception context
        "cld",
        "call {}",
        "ud2",
        sym dispatch
    );
}

macro_rules! exception_stub {
    ($name:ident, $vector:literal) => {
        #[unsafe(naked)]
        extern "sysv64" fn $name() {
            naked_asm!(
                "push 0", // CPU pushed no error code
                "push {}",
                "jmp {}",
                const $vector,
                sym common_stub
            );
        }
    };
    ($name:ident, $vector:literal, error_code) => {
        #[unsafe(naked)]
        extern "sysv64" fn $name() {
            naked_asm!(
                "push {}",
                "jmp {}",
                const $vector,
                sym common_stub
            );
        }
    };
}

exception_stub!(exception0, 0);
exception_stub!(exception1, 1);
exception_stub!(exception2, 2);
exception_stub!(exception3, 3);
exception_stub!(exception4, 4);
exception_stub!(exception5, 5);
exception_stub!(exception6, 6);
exception_stub!(exception7, 7);
exception_stub!(exception8, 8, error_code);
exception_stub!(exception9, 9);
exception_stub!(exception10, 10, error_code);
exception_stub!(exception11, 11, error_code);
exception_stub!(exception12, 12, error_code);
exception_stub!(exception13, 13, error_code);
exception_stub!(exception14, 14, error_code);
exception_stub!(exception15, 15);
exception_stub!(exception16, 16);
exception_stub!(exception17, 17, error_code);
exception_stub!(exception18, 18);
exception_stub!(exception19, 19);
exception_stub!(exception20, 20);
exception_stub!(exception21, 21, error_code);
exception_stub!(exception22, 22);
exception_stub!(exception23, 23);
exception_stub!(exception24, 24);
exception_stub!(exception25, 25);
exception_stub!(exception26, 26);
exception_stub!(exception27, 27);
exception_stub!(exception28, 28);
exception_stub!(exception29, 29, error_code);
exception_stub!(exception30, 30, error_code);
exception_stub!(exception31, 31);

const STUBS: [extern "sysv64" fn(); COUNT as usize] = [
    exception0,
    exception1,
    exception2,
    exception3,
    exception4,
    exception5,
    exception6,
    exception7,
    exception8,
    exception9,
    exception10,
    exception11,
    exception12,
    exception13,
    exception14,
    exception15,
    exception16,
    exception17,
    exception18,
    exception19,
    exception20,
    exception21,
    exception22,
    exception23,
    exception24,
    exception25,
    exception26,
    exception27,
    exception28,
    exception29,
    exception30,
    exception31,
];

pub fn init() {
    let selector = gdt::kernel_code_selector();
    let mut table = idt::IDT.lock();

    for (vector, stub) in (0..COUNT).zip(STUBS) {
        table.set_gate(vector, stub as usize as u64, selector, idt::INTERRUPT_GATE);
    }

    log!("exception handlers installed");
}
