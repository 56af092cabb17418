//! Thin wrappers over the raw syscalls the event loop is built on.
//!
//! Each helper performs one libc call and maps failure to
//! `io::Error::last_os_error()`; policy (what is fatal, what is retried)
//! stays with the callers.

use std::ffi::CString;
use std::io;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};

use super::diag::fatal;

pub fn monotonic_ns() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // Immune to clock slew; cannot fail with valid arguments.
    unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC_RAW, &mut ts) };
    ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}

fn last() -> io::Error {
    io::Error::last_os_error()
}

pub fn set_nonblocking(fd: RawFd, on: bool) -> io::Result<()> {
    let flags = if on { libc::O_NONBLOCK } else { 0 };
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags) } < 0 {
        return Err(last());
    }
    Ok(())
}

pub fn pipe_cloexec() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0 as RawFd; 2];
    if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) } != 0 {
        return Err(last());
    }
    unsafe { Ok((OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1]))) }
}

pub fn epoll_create() -> io::Result<OwnedFd> {
    let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
    if fd < 0 {
        return Err(last());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

pub fn epoll_add(ep: RawFd, fd: RawFd, token: u64, events: u32) -> io::Result<()> {
    let mut ev = libc::epoll_event {
        events,
        u64: token,
    };
    if unsafe { libc::epoll_ctl(ep, libc::EPOLL_CTL_ADD, fd, &mut ev) } != 0 {
        return Err(last());
    }
    Ok(())
}

pub fn epoll_wait(
    ep: RawFd,
    events: &mut [libc::epoll_event],
    timeout_ms: i32,
) -> io::Result<usize> {
    loop {
        let n = unsafe {
            libc::epoll_wait(ep, events.as_mut_ptr(), events.len() as i32, timeout_ms)
        };
        if n >= 0 {
            return Ok(n as usize);
        }
        let err = last();
        if err.raw_os_error() != Some(libc::EINTR) {
            return Err(err);
        }
    }
}

/// Blocks `SIGCHLD` for the process and returns a descriptor that reads
/// `signalfd_siginfo` records for it instead.
pub fn sigchld_fd() -> io::Result<OwnedFd> {
    unsafe {
        let mut mask: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut mask);
        libc::sigaddset(&mut mask, libc::SIGCHLD);
        if libc::sigprocmask(libc::SIG_BLOCK, &mask, std::ptr::null_mut()) != 0 {
            return Err(last());
        }
        let fd = libc::signalfd(-1, &mask, libc::SFD_CLOEXEC);
        if fd < 0 {
            return Err(last());
        }
        Ok(OwnedFd::from_raw_fd(fd))
    }
}

pub fn read_fd(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
    if n < 0 {
        return Err(last());
    }
    Ok(n as usize)
}

pub fn write_fd(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    let n = unsafe { libc::write(fd, buf.as_ptr().cast(), buf.len()) };
    if n < 0 {
        return Err(last());
    }
    Ok(n as usize)
}

/// Reads as many siginfo records as fit one read; returns the byte count,
/// which the caller checks for whole-record alignment.
pub fn read_siginfo(fd: RawFd, out: &mut [libc::signalfd_siginfo]) -> io::Result<usize> {
    let n = unsafe { libc::read(fd, out.as_mut_ptr().cast(), std::mem::size_of_val(out)) };
    if n < 0 {
        return Err(last());
    }
    Ok(n as usize)
}

/// Copies up to `count` bytes from `src` to `dst`. With `offset` the file
/// position of `src` is left untouched and the transfer starts there.
pub fn sendfile(
    dst: RawFd,
    src: RawFd,
    offset: Option<&mut i64>,
    count: usize,
) -> io::Result<usize> {
    let off = offset.map_or(std::ptr::null_mut(), |o| o as *mut i64);
    let n = unsafe { libc::sendfile(dst, src, off, count) };
    if n < 0 {
        return Err(last());
    }
    Ok(n as usize)
}

pub fn splice(src: RawFd, dst: RawFd, count: usize) -> io::Result<usize> {
    let n = unsafe {
        libc::splice(
            src,
            std::ptr::null_mut(),
            dst,
            std::ptr::null_mut(),
            count,
            0,
        )
    };
    if n < 0 {
        return Err(last());
    }
    Ok(n as usize)
}

pub fn kill_sigkill(pid: libc::pid_t) -> io::Result<()> {
    if unsafe { libc::kill(pid, libc::SIGKILL) } != 0 {
        return Err(last());
    }
    Ok(())
}

/// Collects the zombie for an exit already reported through the signalfd.
pub fn reap(pid: libc::pid_t) -> io::Result<()> {
    let mut info: libc::siginfo_t = unsafe { std::mem::zeroed() };
    let rc = unsafe {
        libc::waitid(
            libc::P_PID,
            pid as libc::id_t,
            &mut info,
            libc::WEXITED | libc::WNOHANG,
        )
    };
    if rc != 0 {
        return Err(last());
    }
    Ok(())
}

/// Forks and execs a slot child: the overlay is applied with `setenv`
/// between fork and exec, and both output streams point at the capture
/// pipe. Only fork failure returns; failures inside the child are written
/// to its stderr (the capture pipe once redirected) before `_exit(1)`.
pub fn spawn_child(
    argv: &[CString],
    env: &[(CString, CString)],
    capture_w: RawFd,
) -> io::Result<libc::pid_t> {
    let mut argv_ptrs: Vec<*const libc::c_char> = argv.iter().map(|a| a.as_ptr()).collect();
    argv_ptrs.push(std::ptr::null());

    let pid = unsafe { libc::fork() };
    if pid < 0 {
        return Err(last());
    }
    if pid > 0 {
        return Ok(pid);
    }

    unsafe {
        for (key, val) in env {
            if libc::setenv(key.as_ptr(), val.as_ptr(), 1) != 0 {
                fatal!("setenv: {}", last());
            }
        }
        if libc::dup2(capture_w, libc::STDERR_FILENO) < 0 {
            fatal!("dup2(capture, stderr): {}", last());
        }
        if libc::dup2(capture_w, libc::STDOUT_FILENO) < 0 {
            fatal!("dup2(capture, stdout): {}", last());
        }
        libc::execv(argv_ptrs[0], argv_ptrs.as_ptr());
        fatal!("execv {:?}: {}", argv[0], last());
    }
}
