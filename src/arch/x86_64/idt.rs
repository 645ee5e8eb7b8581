//! EMBODIOS Interrupt Descriptor Table (IDT).
//!
//! Installs handlers for the Intel-defined exceptions (0..31) and wires the
//! legacy PIT/PIC timer interrupt (IRQ0, remapped to vector 32) into the
//! scheduler tick. One IST-backed stack is carried for the double fault so
//! a wedged kernel stack cannot turn a double fault into a triple fault.

use lazy_static::lazy_static;
use spin::Once;
use x86_64::registers::control::Cr2;
use x86_64::structures::idt::{InterruptDescriptorTable, InterruptStackFrame, PageFaultErrorCode};

use crate::arch::x86_64::{gdt, pic, vga};
use crate::log::logger::try_get_logger;

pub const TIMER_VECTOR: u8 = 32;

static LOADED: Once<()> = Once::new();

lazy_static! {
    static ref IDT: InterruptDescriptorTable = {
        let mut idt = InterruptDescriptorTable::new();
        idt.divide_error.set_handler_fn(divide_error);
        idt.debug.set_handler_fn(debug_handler);
        idt.non_maskable_interrupt.set_handler_fn(nmi_handler);
        idt.breakpoint.set_handler_fn(bp_handler);
        idt.overflow.set_handler_fn(of_handler);
        idt.bound_range_exceeded.set_handler_fn(br_handler);
        idt.invalid_opcode.set_handler_fn(ud_handler);
        idt.device_not_available.set_handler_fn(dna_handler);
        unsafe {
            idt.double_fault
                .set_handler_fn(df_handler)
                .set_stack_index(gdt::DOUBLE_FAULT_IST_INDEX);
        }
        idt.invalid_tss.set_handler_fn(ts_handler);
        idt.segment_not_present.set_handler_fn(np_handler);
        idt.stack_segment_fault.set_handler_fn(ss_handler);
        idt.general_protection_fault.set_handler_fn(gp_handler);
        idt.page_fault.set_handler_fn(pf_handler);
        idt.x87_floating_point.set_handler_fn(x87_handler);
        idt.alignment_check.set_handler_fn(ac_handler);
        idt.machine_check.set_handler_fn(mc_handler);
        idt.simd_floating_point.set_handler_fn(simd_handler);
        idt.virtualization.set_handler_fn(vm_handler);
        idt.security_exception.set_handler_fn(sec_handler);

        idt[TIMER_VECTOR as usize].set_handler_fn(timer_handler);
        idt
    };
}

pub fn init() {
    LOADED.call_once(|| {
        IDT.load();
        pic::init();
    });
    if let Some(l) = try_get_logger() {
        l.log("[ARCH] IDT installed, PIT/PIC timer armed at vector 32");
    }
}

extern "x86-interrupt" fn timer_handler(_stack: InterruptStackFrame) {
    super::time::timer::on_tick();
    crate::sched::tick();
    pic::notify_eoi(TIMER_VECTOR);
}

macro_rules! fault_handler {
    ($name:ident, $vec:expr) => {
        extern "x86-interrupt" fn $name(stack: InterruptStackFrame) {
            on_fault($vec, &stack, None);
        }
    };
}

fault_handler!(divide_error, 0);
fault_handler!(debug_handler, 1);
fault_handler!(nmi_handler, 2);
fault_handler!(bp_handler, 3);
fault_handler!(of_handler, 4);
fault_handler!(br_handler, 5);
fault_handler!(ud_handler, 6);
fault_handler!(dna_handler, 7);
fault_handler!(x87_handler, 16);
fault_handler!(mc_handler, 18);
fault_handler!(simd_handler, 19);
fault_handler!(vm_handler, 20);

extern "x86-interrupt" fn ts_handler(stack: InterruptStackFrame, code: u64) {
    on_fault(10, &stack, Some(code));
}
extern "x86-interrupt" fn np_handler(stack: InterruptStackFrame, code: u64) {
    on_fault(11, &stack, Some(code));
}
extern "x86-interrupt" fn ss_handler(stack: InterruptStackFrame, code: u64) {
    on_fault(12, &stack, Some(code));
}
extern "x86-interrupt" fn gp_handler(stack: InterruptStackFrame, code: u64) {
    on_fault(13, &stack, Some(code));
}
extern "x86-interrupt" fn ac_handler(stack: InterruptStackFrame, code: u64) {
    on_fault(17, &stack, Some(code));
}
extern "x86-interrupt" fn sec_handler(stack: InterruptStackFrame, code: u64) {
    on_fault(30, &stack, Some(code));
}

extern "x86-interrupt" fn pf_handler(stack: InterruptStackFrame, code: PageFaultErrorCode) {
    let addr = Cr2::read();
    vga::print("[PF]\n");
    on_fault(14, &stack, Some(code.bits()));
    let _ = addr;
}

extern "x86-interrupt" fn df_handler(stack: InterruptStackFrame, code: u64) -> ! {
    on_fault(8, &stack, Some(code));
    halt_loop();
}

fn on_fault(vec: usize, stack: &InterruptStackFrame, code: Option<u64>) {
    vga::print("[EXC]\n");
    let _ = (vec, stack, code);
    if vec == 8 || vec == 18 {
        halt_loop();
    }
}

fn halt_loop() -> ! {
    loop {
        unsafe { core::arch::asm!("hlt", options(nomem, nostack, preserves_flags)) }
    }
}
