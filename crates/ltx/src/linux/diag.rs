//! Diagnostics and the fatal-assertion path.
//!
//! Fatal conditions print `[file:module:line] message` to stderr and exit
//! with status 1. When the caller is the executor process itself the text is
//! additionally mirrored as a nil-slot Log frame written straight to stdout,
//! so a controller tailing the protocol stream sees why the session died. A
//! forked child that fails before exec uses the same path but must never
//! produce protocol bytes, hence the pid comparison.

use std::fmt;
use std::io::Write as _;
use std::sync::atomic::{AtomicI32, Ordering};

use ltx_wire::{Field, MsgType};

use super::sys;

static MAIN_PID: AtomicI32 = AtomicI32::new(0);

pub fn init() {
    MAIN_PID.store(unsafe { libc::getpid() }, Ordering::Relaxed);
}

pub fn emit(file: &str, module: &str, line: u32, args: fmt::Arguments<'_>) {
    let text = format!("[{file}:{module}:{line}] {args}\n");
    let _ = std::io::stderr().write_all(text.as_bytes());

    if unsafe { libc::getpid() } != MAIN_PID.load(Ordering::Relaxed) {
        return;
    }

    let mut frame = Vec::with_capacity(text.len() + 16);
    ltx_wire::put_msg(
        &mut frame,
        MsgType::Log,
        &[
            Field::Nil,
            Field::Uint(sys::monotonic_ns()),
            Field::Str(text.as_bytes()),
        ],
    );

    // Best effort: stdout may be gone or blocked, and this must not recurse
    // into the fatal path.
    let mut rest = frame.as_slice();
    while !rest.is_empty() {
        match sys::write_fd(libc::STDOUT_FILENO, rest) {
            Ok(n) if n > 0 => rest = &rest[n..],
            _ => break,
        }
    }
}

pub fn fail(file: &str, module: &str, line: u32, args: fmt::Arguments<'_>) -> ! {
    emit(file, module, line, args);
    unsafe { libc::_exit(1) }
}

macro_rules! note {
    ($($arg:tt)*) => {
        $crate::linux::diag::emit(file!(), module_path!(), line!(), format_args!($($arg)*))
    };
}

macro_rules! fatal {
    ($($arg:tt)*) => {
        $crate::linux::diag::fail(file!(), module_path!(), line!(), format_args!($($arg)*))
    };
}

macro_rules! check {
    ($cond:expr, $($arg:tt)*) => {
        if !$cond {
            $crate::linux::diag::fail(file!(), module_path!(), line!(), format_args!($($arg)*));
        }
    };
}

pub(crate) use {check, fatal, note};
