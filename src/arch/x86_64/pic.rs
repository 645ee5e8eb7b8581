//! Legacy 8259 PIC remap + 8254 PIT programming.
//!
//! The scheduler's tick handler (spec.md §4.1) wants a nominal 100 Hz
//! timer interrupt. APIC/TSC-deadline timers are a real upgrade path
//! (see the `embodios-apic` feature) but are not wired up here; the PIT
//! is simple, universally present, and sufficient to drive preemption.

use x86_64::instructions::port::Port;

const PIC1_CMD: u16 = 0x20;
const PIC1_DATA: u16 = 0x21;
const PIC2_CMD: u16 = 0xA0;
const PIC2_DATA: u16 = 0xA1;

const PIT_CHANNEL0: u16 = 0x40;
const PIT_COMMAND: u16 = 0x43;
const PIT_BASE_HZ: u32 = 1_193_182;

/// Vector offset for the master PIC (IRQ0 → vector 32).
pub const PIC1_OFFSET: u8 = 32;
/// Vector offset for the slave PIC (IRQ8 → vector 40).
pub const PIC2_OFFSET: u8 = 40;

pub fn init() {
    remap();
    mask_all_but_timer();
    program_pit(super::time::timer::TICK_HZ);
}

fn remap() {
    unsafe {
        let mut cmd1 = Port::<u8>::new(PIC1_CMD);
        let mut cmd2 = Port::<u8>::new(PIC2_CMD);
        let mut data1 = Port::<u8>::new(PIC1_DATA);
        let mut data2 = Port::<u8>::new(PIC2_DATA);

        let mask1 = { let mut p = Port::<u8>::new(PIC1_DATA); p.read() };
        let mask2 = { let mut p = Port::<u8>::new(PIC2_DATA); p.read() };

        cmd1.write(0x11u8); // ICW1: init, cascade, expect ICW4
        cmd2.write(0x11u8);
        data1.write(PIC1_OFFSET);
        data2.write(PIC2_OFFSET);
        data1.write(4u8); // ICW3: slave on IRQ2
        data2.write(2u8);
        data1.write(0x01u8); // ICW4: 8086 mode
        data2.write(0x01u8);

        data1.write(mask1);
        data2.write(mask2);
    }
}

fn mask_all_but_timer() {
    unsafe {
        let mut data1 = Port::<u8>::new(PIC1_DATA);
        let mut data2 = Port::<u8>::new(PIC2_DATA);
        data1.write(0b1111_1110u8); // unmask IRQ0 only
        data2.write(0xffu8);
    }
}

fn program_pit(hz: u32) {
    let divisor = (PIT_BASE_HZ / hz).max(1) as u16;
    unsafe {
        let mut cmd = Port::<u8>::new(PIT_COMMAND);
        let mut ch0 = Port::<u8>::new(PIT_CHANNEL0);
        cmd.write(0x36u8); // channel 0, lo/hi, mode 3 (square wave), binary
        ch0.write((divisor & 0xff) as u8);
        ch0.write((divisor >> 8) as u8);
    }
}

/// Send end-of-interrupt for the given vector. Both PICs need it if the
/// vector came from the slave (>= PIC2_OFFSET).
pub fn notify_eoi(vector: u8) {
    unsafe {
        if vector >= PIC2_OFFSET {
            Port::<u8>::new(PIC2_CMD).write(0x20u8);
        }
        Port::<u8>::new(PIC1_CMD).write(0x20u8);
    }
}
