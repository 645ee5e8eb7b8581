//! Callee-saved CPU context for a cooperative software context switch.
//!
//! Layout is deliberately the System V callee-saved set plus `rsp`/`rip`;
//! the compile-time offset assertions keep the naked `switch` routine below
//! honest if a field is ever reordered.

pub type EntryFn = extern "C" fn(usize) -> !;

#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct Context {
    pub rbx: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rbp: u64,
    pub rsp: u64,
    pub rflags: u64,
    pub rip: u64,
}

impl Context {
    pub const fn zero() -> Self {
        Context {
            rbx: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
            rbp: 0,
            rsp: 0,
            rflags: 0x202,
            rip: 0,
        }
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::zero()
    }
}

const OFF_RBX: usize = 0;
const OFF_R12: usize = 8;
const OFF_R13: usize = 16;
const OFF_R14: usize = 24;
const OFF_R15: usize = 32;
const OFF_RBP: usize = 40;
const OFF_RSP: usize = 48;
const OFF_RFLAGS: usize = 56;
const OFF_RIP: usize = 64;

const _: () = assert!(core::mem::size_of::<Context>() == 72);
const _: () = assert!(core::mem::offset_of!(Context, rbx) == OFF_RBX);
const _: () = assert!(core::mem::offset_of!(Context, r12) == OFF_R12);
const _: () = assert!(core::mem::offset_of!(Context, r13) == OFF_R13);
const _: () = assert!(core::mem::offset_of!(Context, r14) == OFF_R14);
const _: () = assert!(core::mem::offset_of!(Context, r15) == OFF_R15);
const _: () = assert!(core::mem::offset_of!(Context, rbp) == OFF_RBP);
const _: () = assert!(core::mem::offset_of!(Context, rsp) == OFF_RSP);
const _: () = assert!(core::mem::offset_of!(Context, rflags) == OFF_RFLAGS);
const _: () = assert!(core::mem::offset_of!(Context, rip) == OFF_RIP);

/// Lays out the initial register file for a brand-new task: `rip` points at
/// a trampoline that loads `entry`/`arg` from `r12`/`r13` and calls into it,
/// falling through to `task_exit` if `entry` ever returns.
pub fn init_context(ctx: &mut Context, stack_top: u64, entry: EntryFn, arg: usize, exit: extern "C" fn() -> !) {
    *ctx = Context::zero();
    // Reserve one slot so `switch`'s `ret` lands on `trampoline`, and stash
    // `exit` just below it for the trampoline to fall through to.
    let sp = (stack_top - 16) & !0xf;
    unsafe {
        let exit_slot = (sp - 8) as *mut u64;
        exit_slot.write(exit as usize as u64);
    }
    ctx.rsp = sp - 8;
    ctx.r12 = entry as usize as u64;
    ctx.r13 = arg as u64;
    ctx.rip = trampoline as usize as u64;
}

extern "C" fn trampoline() -> ! {
    unsafe {
        core::arch::asm!(
            "mov rdi, r13",
            "mov rsi, r12",
            "call {target}",
            target = sym task_start,
            options(noreturn)
        );
    }
}

/// First Rust code to run on a freshly created task's own stack.
///
/// A task that has run before resumes mid-`switch_locked`, on its own
/// stack, inside the scheduler lock it took before it was last switched
/// away from — unwinding back out of that call is what drops the lock. A
/// brand-new task has no such call to resume into, so the scheduler lock
/// (and the arena lock held across the switch) would otherwise stay locked
/// forever. Drop them here before running the task's real entry point.
extern "C" fn task_start(arg: usize, entry: usize) -> ! {
    unsafe { super::release_fresh_task_locks() };
    let entry: EntryFn = unsafe { core::mem::transmute(entry) };
    entry(arg)
}

/// Saves the caller's callee-saved registers into `*from`, loads `*to`, and
/// resumes execution there. On the first switch into a freshly-initialized
/// task this "returns" into [`trampoline`] instead of the call site.
///
/// # Safety
/// Must run with interrupts disabled; `from` and `to` must be distinct,
/// live `Context`s belonging to tasks that are not concurrently switched
/// elsewhere.
#[naked]
pub unsafe extern "C" fn switch(from: *mut Context, to: *const Context) {
    core::arch::naked_asm!(
        "mov [rdi + 0x00], rbx",
        "mov [rdi + 0x08], r12",
        "mov [rdi + 0x10], r13",
        "mov [rdi + 0x18], r14",
        "mov [rdi + 0x20], r15",
        "mov [rdi + 0x28], rbp",
        "mov [rdi + 0x30], rsp",
        "pushfq",
        "pop qword ptr [rdi + 0x38]",
        "lea rax, [rip + 2f]",
        "mov [rdi + 0x40], rax",
        "mov rbx, [rsi + 0x00]",
        "mov r12, [rsi + 0x08]",
        "mov r13, [rsi + 0x10]",
        "mov r14, [rsi + 0x18]",
        "mov r15, [rsi + 0x20]",
        "mov rbp, [rsi + 0x28]",
        "mov rsp, [rsi + 0x30]",
        "push qword ptr [rsi + 0x38]",
        "popfq",
        "jmp qword ptr [rsi + 0x40]",
        "2:",
        "ret",
    );
}
