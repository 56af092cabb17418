//! The executor: a single-threaded, readiness-driven dispatcher.
//!
//! Frames arrive on stdin and replies leave on stdout, while child
//! processes, their capture pipes, and SIGCHLD are multiplexed through one
//! epoll set. The loop owns all state; children share nothing with it after
//! exec. Every inbound frame is echoed back before any frame it gives rise
//! to, which is what lets the controller correlate replies without sequence
//! numbers.

use std::ffi::CString;
use std::fs::{File, OpenOptions};
use std::io::Write as _;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::fs::OpenOptionsExt as _;

use anyhow::{Context, Result};
use ltx_wire::{Cursor, Field, MsgType};

mod buf;
mod diag;
mod slots;
mod sys;

use buf::{InBuf, OutBuf, CAPACITY, DRAIN_WATERMARK};
use diag::{check, fatal, note};
use slots::{SlotTable, ARGV_STORE_BYTES, ENV_KEY_MAX, ENV_VAL_MAX, SLOT_COUNT};

const POLL_TIMEOUT_MS: i32 = 100;
const MAX_EVENTS: usize = 128;

/// Largest chunk read from a capture pipe per readiness event; one Log
/// frame is emitted per chunk.
const LOG_CHUNK: usize = 1024;

/// Files at or past 2 GiB - 4 KiB are refused, matching the kernel's
/// per-call transfer ceiling so one Data frame always describes the whole
/// file.
const FILE_SIZE_MAX: u64 = 0x7fff_f000;

const VERSION_BANNER: &str = concat!("LTX Version=", env!("CARGO_PKG_VERSION"));

const TOKEN_STDIN: u64 = 0x100;
const TOKEN_STDOUT: u64 = 0x101;
const TOKEN_SIGCHLD: u64 = 0x102;

pub fn run() -> i32 {
    diag::init();
    let mut executor = match Executor::new() {
        Ok(executor) => executor,
        Err(err) => fatal!("startup: {err:#}"),
    };
    executor.event_loop();
    note!("Exiting");
    0
}

/// One decoded inbound frame, owning its data so dispatch can consume the
/// raw bytes out of the input buffer first.
enum Request {
    Ping,
    Version,
    Env {
        target: Option<u8>,
        key: String,
        val: String,
    },
    Exec {
        slot: u8,
        argv: Vec<CString>,
    },
    Kill {
        slot: u8,
    },
    GetFile {
        path: String,
    },
    SetFile {
        path: String,
        size: u64,
    },
}

struct Executor {
    ep: OwnedFd,
    sig: OwnedFd,
    in_fd: RawFd,
    out_fd: RawFd,
    in_buf: InBuf,
    out_buf: OutBuf,
    out_blocked: bool,
    slots: SlotTable,
}

impl Executor {
    fn new() -> Result<Executor> {
        let ep = sys::epoll_create().context("epoll_create1")?;
        let sig = sys::sigchld_fd().context("signalfd(SIGCHLD)")?;
        sys::set_nonblocking(libc::STDOUT_FILENO, true).context("set stdout non-blocking")?;

        sys::epoll_add(
            ep.as_raw_fd(),
            libc::STDIN_FILENO,
            TOKEN_STDIN,
            libc::EPOLLIN as u32,
        )
        .context("register stdin")?;
        sys::epoll_add(
            ep.as_raw_fd(),
            libc::STDOUT_FILENO,
            TOKEN_STDOUT,
            (libc::EPOLLOUT | libc::EPOLLET) as u32,
        )
        .context("register stdout")?;
        sys::epoll_add(
            ep.as_raw_fd(),
            sig.as_raw_fd(),
            TOKEN_SIGCHLD,
            libc::EPOLLIN as u32,
        )
        .context("register signalfd")?;

        Ok(Executor {
            ep,
            sig,
            in_fd: libc::STDIN_FILENO,
            out_fd: libc::STDOUT_FILENO,
            in_buf: InBuf::new(),
            out_buf: OutBuf::new(),
            out_blocked: false,
            slots: SlotTable::new(),
        })
    }

    fn event_loop(&mut self) {
        let mut events = [libc::epoll_event { events: 0, u64: 0 }; MAX_EVENTS];
        let mut stop = false;

        while !stop {
            let n = match sys::epoll_wait(self.ep.as_raw_fd(), &mut events, POLL_TIMEOUT_MS) {
                Ok(n) => n,
                Err(err) => fatal!("epoll_wait: {err}"),
            };

            for ev in &events[..n] {
                stop |= self.handle_event(ev.u64, ev.events);
            }

            if self.out_buf.len() > 0 && !self.out_blocked {
                self.drain();
            }
            if self.in_buf.len() >= 2 {
                self.process_msgs();
            }
            if self.out_buf.len() > 0 && !self.out_blocked {
                self.drain();
            }
        }
    }

    /// Returns true when the session is over (hang-up on either stdio end).
    fn handle_event(&mut self, token: u64, events: u32) -> bool {
        let mut stop = false;
        match token {
            TOKEN_STDIN => {
                if events & libc::EPOLLIN as u32 != 0 {
                    self.fill_read_buf();
                }
                if events & libc::EPOLLHUP as u32 != 0 {
                    stop = true;
                }
            }
            TOKEN_STDOUT => {
                if events & libc::EPOLLOUT as u32 != 0 {
                    self.out_blocked = false;
                }
                if events & libc::EPOLLHUP as u32 != 0 {
                    stop = true;
                }
            }
            TOKEN_SIGCHLD => self.reap_children(),
            slot => {
                check!(slot < SLOT_COUNT as u64, "unknown event token {slot}");
                self.read_child_output(slot as u8);
            }
        }

        if self.out_buf.len() > DRAIN_WATERMARK {
            self.drain();
        }
        stop
    }

    fn fill_read_buf(&mut self) {
        check!(self.in_buf.avail() > 0, "read buffer full");
        match sys::read_fd(self.in_fd, self.in_buf.free_mut()) {
            Ok(n) => self.in_buf.commit(n),
            Err(err) => fatal!("read(stdin): {err}"),
        }
    }

    fn drain(&mut self) {
        while self.out_buf.len() > 0 {
            match sys::write_fd(self.out_fd, self.out_buf.pending()) {
                Ok(n) => self.out_buf.consume(n),
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                    self.out_blocked = true;
                    break;
                }
                Err(err) => fatal!("write(stdout, {} bytes): {err}", self.out_buf.len()),
            }
        }
        self.out_buf.compact();
    }

    fn push_msg(&mut self, ty: MsgType, fields: &[Field<'_>]) {
        ltx_wire::put_msg(self.out_buf.buf_mut(), ty, fields);
        check!(
            !self.out_buf.over_capacity(),
            "Out buffer full: {} > {}",
            self.out_buf.len(),
            CAPACITY
        );
    }

    /// Echoes the inbound frame byte-for-byte, then removes it from the
    /// input buffer.
    fn echo(&mut self, consumed: usize) {
        self.out_buf.append(&self.in_buf.unread()[..consumed]);
        check!(
            !self.out_buf.over_capacity(),
            "Out buffer full: {} > {}",
            self.out_buf.len(),
            CAPACITY
        );
        self.in_buf.consume(consumed);
    }

    fn process_msgs(&mut self) {
        while self.in_buf.len() >= 2 {
            let parsed = {
                let mut cur = Cursor::new(self.in_buf.unread());
                parse_frame(&mut cur).map(|req| (req, cur.consumed()))
            };
            let Some((req, consumed)) = parsed else {
                break;
            };
            self.dispatch(req, consumed);

            if self.out_buf.len() > DRAIN_WATERMARK {
                self.drain();
            }
        }
        self.in_buf.compact();
    }

    fn dispatch(&mut self, req: Request, consumed: usize) {
        match req {
            // SetFile is the one frame never echoed verbatim: its reply is
            // re-encoded with the written file streamed back as the payload.
            Request::SetFile { path, size } => {
                self.in_buf.consume(consumed);
                self.set_file(&path, size);
            }
            Request::Ping => {
                self.echo(consumed);
                self.push_msg(MsgType::Pong, &[Field::Uint(sys::monotonic_ns())]);
            }
            Request::Version => {
                self.echo(consumed);
                self.push_msg(
                    MsgType::Log,
                    &[
                        Field::Nil,
                        Field::Uint(sys::monotonic_ns()),
                        Field::Str(VERSION_BANNER.as_bytes()),
                    ],
                );
            }
            Request::Env { target, key, val } => {
                self.echo(consumed);
                self.apply_env(target, &key, &val);
            }
            Request::Exec { slot, argv } => {
                self.echo(consumed);
                self.exec_slot(slot, argv);
            }
            Request::Kill { slot } => {
                self.echo(consumed);
                self.kill_slot(slot);
            }
            Request::GetFile { path } => {
                self.echo(consumed);
                self.get_file(&path);
            }
        }
    }

    fn apply_env(&mut self, target: Option<u8>, key: &str, val: &str) {
        match target {
            None => std::env::set_var(key, val),
            Some(id) => {
                if let Err(err) = self.slots.get_mut(id).env.set(key, val) {
                    fatal!("Env: {err}");
                }
            }
        }
    }

    fn exec_slot(&mut self, id: u8, argv: Vec<CString>) {
        {
            let slot = self.slots.get_mut(id);
            check!(
                slot.pid == 0,
                "Exec: slot {id} is still running pid {}",
                slot.pid
            );
            // A leftover capture pipe from the previous child would alias
            // this slot's event token; whatever tail output it still holds
            // is dropped, as reuse implies the controller saw the Result.
            slot.capture = None;
        }

        let (pipe_r, pipe_w) = match sys::pipe_cloexec() {
            Ok(pair) => pair,
            Err(err) => fatal!("pipe2: {err}"),
        };
        if let Err(err) = sys::epoll_add(
            self.ep.as_raw_fd(),
            pipe_r.as_raw_fd(),
            u64::from(id),
            libc::EPOLLIN as u32,
        ) {
            fatal!("epoll_ctl(capture pipe): {err}");
        }

        let slot = self.slots.get_mut(id);
        let pid = match sys::spawn_child(&argv, slot.env.entries(), pipe_w.as_raw_fd()) {
            Ok(pid) => pid,
            Err(err) => fatal!("fork: {err}"),
        };
        slot.pid = pid;
        slot.capture = Some(pipe_r);
        // pipe_w drops here; the child keeps its duplicated copies.
    }

    fn kill_slot(&mut self, id: u8) {
        let pid = self.slots.get_mut(id).pid;
        if pid == 0 {
            return;
        }
        match sys::kill_sigkill(pid) {
            Ok(()) => {}
            // The child can exit between Result emission and this Kill.
            Err(err) if err.raw_os_error() == Some(libc::ESRCH) => {}
            Err(err) => fatal!("kill({pid}): {err}"),
        }
    }

    fn read_child_output(&mut self, id: u8) {
        let Some(fd) = self
            .slots
            .get_mut(id)
            .capture
            .as_ref()
            .map(|f| f.as_raw_fd())
        else {
            return;
        };

        let mut chunk = [0u8; LOG_CHUNK];
        let n = match sys::read_fd(fd, &mut chunk) {
            Ok(n) => n,
            Err(err) => fatal!("read(capture pipe {id}): {err}"),
        };
        if n == 0 {
            // EOF. Closing also removes the pipe from the epoll set; the
            // slot stays occupied until its Result goes out.
            self.slots.get_mut(id).capture = None;
            return;
        }

        self.push_msg(
            MsgType::Log,
            &[
                Field::Uint(u64::from(id)),
                Field::Uint(sys::monotonic_ns()),
                Field::Str(&chunk[..n]),
            ],
        );
    }

    fn reap_children(&mut self) {
        let mut si: [libc::signalfd_siginfo; SLOT_COUNT] = unsafe { std::mem::zeroed() };
        let len = match sys::read_siginfo(self.sig.as_raw_fd(), &mut si) {
            Ok(len) => len,
            Err(err) => fatal!("read(signalfd): {err}"),
        };
        let record = std::mem::size_of::<libc::signalfd_siginfo>();
        check!(len % record == 0, "signalfd reads not atomic?");

        for info in &si[..len / record] {
            let pid = info.ssi_pid as libc::pid_t;
            let Some(id) = self.slots.slot_of_pid(pid) else {
                fatal!("PID not found: {pid}");
            };

            self.push_msg(
                MsgType::Result,
                &[
                    Field::Uint(u64::from(id)),
                    Field::Uint(sys::monotonic_ns()),
                    Field::Uint(info.ssi_code as u64),
                    Field::Uint(info.ssi_status as u64),
                ],
            );

            self.slots.get_mut(id).pid = 0;
            let _ = sys::reap(pid);
        }
    }

    fn get_file(&mut self, path: &str) {
        let file = match File::open(path) {
            Ok(file) => file,
            Err(err) => fatal!("open {path}: {err}"),
        };
        let size = match file.metadata() {
            Ok(meta) => meta.len(),
            Err(err) => fatal!("stat {path}: {err}"),
        };
        check!(size < FILE_SIZE_MAX, "{path}: too large ({size})");

        self.push_msg(MsgType::Data, &[Field::BinHeader(size)]);
        self.stream_file(file.as_raw_fd(), size, None);
    }

    fn set_file(&mut self, path: &str, size: u64) {
        let mut file = match OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
        {
            Ok(file) => file,
            Err(err) => fatal!("open {path}: {err}"),
        };

        // Whatever part of the blob is already buffered goes straight to
        // the file; the rest splices from stdin without ever entering the
        // message buffer.
        let mut left = size;
        while left > 0 && self.in_buf.len() > 0 {
            let take = (left as usize).min(self.in_buf.len());
            if let Err(err) = file.write_all(&self.in_buf.unread()[..take]) {
                fatal!("write {path}: {err}");
            }
            self.in_buf.consume(take);
            left -= take as u64;
        }
        while left > 0 {
            let n = match sys::splice(self.in_fd, file.as_raw_fd(), left as usize) {
                Ok(n) => n,
                Err(err) => fatal!("splice(stdin, {path}): {err}"),
            };
            check!(n > 0, "stdin closed with {left} blob bytes missing");
            left -= n as u64;
        }

        self.push_msg(
            MsgType::SetFile,
            &[Field::Str(path.as_bytes()), Field::BinHeader(size)],
        );
        self.stream_file(file.as_raw_fd(), size, Some(0));
    }

    /// Flips stdout to blocking, flushes the buffered preamble, then moves
    /// `size` bytes of `fd` out with sendfile so file contents never pass
    /// through the message buffer. Ordering on the stream is preserved
    /// because nothing else runs until the transfer completes.
    fn stream_file(&mut self, fd: RawFd, size: u64, offset: Option<i64>) {
        if let Err(err) = sys::set_nonblocking(self.out_fd, false) {
            fatal!("fcntl(stdout): {err}");
        }
        self.drain();

        let mut off = offset;
        let mut left = size;
        while left > 0 {
            let n = match sys::sendfile(self.out_fd, fd, off.as_mut(), left as usize) {
                Ok(n) => n,
                Err(err) => fatal!("sendfile: {err}"),
            };
            check!(n > 0, "sendfile: short transfer, {left} of {size} bytes left");
            left -= n as u64;
        }

        if let Err(err) = sys::set_nonblocking(self.out_fd, true) {
            fatal!("fcntl(stdout): {err}");
        }
    }
}

/// Decodes the next frame, returning `None` while it is still incomplete.
/// Protocol violations never return: they end the process through the
/// fatal path.
fn parse_frame(cur: &mut Cursor<'_>) -> Option<Request> {
    let arity = fatal_err(cur.array_len())?;
    check!(arity >= 1, "empty frame");

    let code = fatal_err(cur.uint())?;
    let ty = match MsgType::from_code(code) {
        Ok(ty) => ty,
        Err(err) => fatal!("{err}"),
    };
    check!(ty.inbound(), "{ty:?}: not handled by executor");

    let (lo, hi) = ty.arity();
    check!(
        arity >= lo && arity <= hi,
        "{ty:?}: bad frame length {arity}"
    );

    Some(match ty {
        MsgType::Ping => Request::Ping,
        MsgType::Version => Request::Version,
        MsgType::Kill => Request::Kill {
            slot: slot_id(cur)?,
        },
        MsgType::Env => {
            let target = if cur.opt_nil()? {
                None
            } else {
                Some(slot_id(cur)?)
            };
            let key = utf8(fatal_err(cur.str_bytes())?);
            let val = utf8(fatal_err(cur.str_bytes())?);
            check!(
                !key.is_empty() && key.len() <= ENV_KEY_MAX,
                "Env: key length {} out of range",
                key.len()
            );
            check!(
                !key.contains('=') && !key.contains('\0'),
                "Env: key contains '=' or a NUL byte"
            );
            check!(
                val.len() < ENV_VAL_MAX,
                "Env: value length {} out of range",
                val.len()
            );
            check!(!val.contains('\0'), "Env: value contains a NUL byte");
            Request::Env { target, key, val }
        }
        MsgType::Exec => {
            let slot = slot_id(cur)?;
            let mut argv = Vec::with_capacity(arity as usize - 2);
            let mut packed = 0usize;
            for _ in 0..arity - 2 {
                let arg = fatal_err(cur.str_bytes())?;
                packed += arg.len() + 1;
                check!(
                    packed <= ARGV_STORE_BYTES,
                    "Exec: argv exceeds {ARGV_STORE_BYTES} bytes"
                );
                argv.push(cstring(arg));
            }
            Request::Exec { slot, argv }
        }
        MsgType::GetFile => Request::GetFile {
            path: utf8(fatal_err(cur.str_bytes())?),
        },
        MsgType::SetFile => {
            let path = utf8(fatal_err(cur.str_bytes())?);
            let size = fatal_err(cur.bin_len())?;
            Request::SetFile { path, size }
        }
        MsgType::Pong | MsgType::Log | MsgType::Result | MsgType::Data => unreachable!(),
    })
}

fn fatal_err<T>(res: Result<Option<T>>) -> Option<T> {
    match res {
        Ok(v) => v,
        Err(err) => fatal!("{err}"),
    }
}

fn slot_id(cur: &mut Cursor<'_>) -> Option<u8> {
    let id = fatal_err(cur.uint())?;
    check!(id < SLOT_COUNT as u64, "slot id {id} out of range");
    Some(id as u8)
}

fn utf8(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(s) => s.to_owned(),
        Err(_) => fatal!("string field is not valid UTF-8"),
    }
}

fn cstring(bytes: &[u8]) -> CString {
    match CString::new(bytes) {
        Ok(s) => s,
        Err(_) => fatal!("argv string contains a NUL byte"),
    }
}
