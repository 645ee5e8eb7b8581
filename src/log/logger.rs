//! EMBODIOS logging facade.
//!
//! The console and printf infrastructure proper (multi-tty VGA, scrollback,
//! hotkeys) is out of scope for this crate; what the core subsystems need is
//! a thin, always-available sink for structured log lines. This module is
//! that sink: a single global logger backed by the 16550 serial port, with
//! an optional VGA mirror for early bring-up before serial is confirmed
//! wired up on real hardware.

use core::fmt::Write;
use core::sync::atomic::{AtomicU8, Ordering};
use spin::Mutex;

use crate::arch::x86_64::serial;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Severity {
    Debug = 0,
    Info = 1,
    Warn = 2,
    Error = 3,
    Fatal = 4,
}

pub type LogLevel = Severity;

static MIN_SEVERITY: AtomicU8 = AtomicU8::new(Severity::Info as u8);
static PANIC_MODE: Mutex<bool> = Mutex::new(false);

pub struct Logger;

static LOGGER: Logger = Logger;

/// Raised once boot has progressed far enough that the serial port is live.
static READY: core::sync::atomic::AtomicBool = core::sync::atomic::AtomicBool::new(false);

pub fn init() {
    serial::init();
    READY.store(true, Ordering::SeqCst);
}

pub fn try_get_logger() -> Option<&'static Logger> {
    if READY.load(Ordering::Relaxed) {
        Some(&LOGGER)
    } else {
        None
    }
}

pub fn set_min_severity(s: Severity) {
    MIN_SEVERITY.store(s as u8, Ordering::Relaxed);
}

impl Logger {
    pub fn log(&self, msg: &str) {
        self.log_at(Severity::Info, msg);
    }

    pub fn log_at(&self, sev: Severity, msg: &str) {
        if (sev as u8) < MIN_SEVERITY.load(Ordering::Relaxed) {
            return;
        }
        let tag = match sev {
            Severity::Debug => "DBG",
            Severity::Info => "INF",
            Severity::Warn => "WRN",
            Severity::Error => "ERR",
            Severity::Fatal => "FTL",
        };
        let mut port = serial::lock();
        let _ = write!(port, "[{tag}] {msg}\n");
    }
}

pub fn enter_panic_mode() {
    *PANIC_MODE.lock() = true;
    MIN_SEVERITY.store(Severity::Debug as u8, Ordering::SeqCst);
}

pub fn log(msg: &str) {
    if let Some(l) = try_get_logger() {
        l.log(msg);
    }
}

pub fn log_info(msg: &str) {
    if let Some(l) = try_get_logger() {
        l.log_at(Severity::Info, msg);
    }
}

pub fn log_warn(msg: &str) {
    if let Some(l) = try_get_logger() {
        l.log_at(Severity::Warn, msg);
    }
}

pub fn log_err(msg: &str) {
    if let Some(l) = try_get_logger() {
        l.log_at(Severity::Error, msg);
    }
}

pub fn log_dbg(msg: &str) {
    if let Some(l) = try_get_logger() {
        l.log_at(Severity::Debug, msg);
    }
}

pub fn log_fatal(msg: &str) {
    if let Some(l) = try_get_logger() {
        l.log_at(Severity::Fatal, msg);
    }
}
