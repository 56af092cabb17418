//! Canonical msgpack-subset codec for the LTX controller protocol.
//!
//! Every frame on the wire is a msgpack array whose first element is the
//! message-type code. Only a small subset of msgpack is legal, and only the
//! shortest encoding of each value is accepted: a `str8` holding a 10 byte
//! string is a protocol violation, not a tolerated variant. This keeps the
//! echo guarantee byte-exact, because re-encoding a decoded value always
//! reproduces the inbound bytes.
//!
//! Decoding distinguishes "need more bytes" (`Ok(None)`, the caller rewinds
//! to the frame start and waits for more input) from malformed input
//! (`Err`, which the executor escalates to a fatal diagnostic).

use anyhow::{bail, Result};

pub const NIL: u8 = 0xc0;

const FIXARRAY0: u8 = 0x90;
const FIXARRAY_MAX: u8 = 0x9f;
const FIXSTR0: u8 = 0xa0;
const FIXSTR_MAX: u8 = 0xbf;
const BIN8: u8 = 0xc4;
const BIN16: u8 = 0xc5;
const BIN32: u8 = 0xc6;
const UINT8: u8 = 0xcc;
const UINT16: u8 = 0xcd;
const UINT32: u8 = 0xce;
const UINT64: u8 = 0xcf;
const STR8: u8 = 0xd9;
const STR16: u8 = 0xda;
const STR32: u8 = 0xdb;
const ARRAY16: u8 = 0xdc;

const FIXSTR_CAP: u64 = 31;
const FIXARRAY_CAP: u64 = 15;

/// Message-type codes, one per protocol operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgType {
    Ping,
    Pong,
    Env,
    Exec,
    Log,
    Result,
    GetFile,
    SetFile,
    Data,
    Kill,
    Version,
}

impl MsgType {
    pub fn from_code(code: u64) -> Result<MsgType> {
        Ok(match code {
            0 => MsgType::Ping,
            1 => MsgType::Pong,
            2 => MsgType::Env,
            3 => MsgType::Exec,
            4 => MsgType::Log,
            5 => MsgType::Result,
            6 => MsgType::GetFile,
            7 => MsgType::SetFile,
            8 => MsgType::Data,
            9 => MsgType::Kill,
            10 => MsgType::Version,
            other => bail!("unknown message type {other}"),
        })
    }

    pub const fn code(self) -> u8 {
        match self {
            MsgType::Ping => 0,
            MsgType::Pong => 1,
            MsgType::Env => 2,
            MsgType::Exec => 3,
            MsgType::Log => 4,
            MsgType::Result => 5,
            MsgType::GetFile => 6,
            MsgType::SetFile => 7,
            MsgType::Data => 8,
            MsgType::Kill => 9,
            MsgType::Version => 10,
        }
    }

    /// Inclusive (min, max) frame arity, counting the type element itself.
    pub const fn arity(self) -> (u64, u64) {
        match self {
            MsgType::Ping => (1, 1),
            MsgType::Pong => (2, 2),
            MsgType::Env => (4, 4),
            MsgType::Exec => (3, 14),
            MsgType::Log => (4, 4),
            MsgType::Result => (5, 5),
            MsgType::GetFile => (2, 2),
            MsgType::SetFile => (3, 3),
            MsgType::Data => (2, 2),
            MsgType::Kill => (2, 2),
            MsgType::Version => (1, 1),
        }
    }

    /// Whether the executor accepts this type on its input stream. The
    /// remaining types only ever travel executor-to-controller.
    pub const fn inbound(self) -> bool {
        matches!(
            self,
            MsgType::Ping
                | MsgType::Env
                | MsgType::Exec
                | MsgType::GetFile
                | MsgType::SetFile
                | MsgType::Kill
                | MsgType::Version
        )
    }
}

fn put_be(out: &mut Vec<u8>, v: u64, width: usize) {
    out.extend_from_slice(&v.to_be_bytes()[8 - width..]);
}

pub fn put_array_len(out: &mut Vec<u8>, len: u64) {
    if len <= FIXARRAY_CAP {
        out.push(FIXARRAY0 + len as u8);
    } else {
        out.push(ARRAY16);
        put_be(out, len, 2);
    }
}

pub fn put_uint(out: &mut Vec<u8>, v: u64) {
    if v < 0x80 {
        out.push(v as u8);
    } else if v <= 0xff {
        out.push(UINT8);
        put_be(out, v, 1);
    } else if v <= 0xffff {
        out.push(UINT16);
        put_be(out, v, 2);
    } else if v <= 0xffff_ffff {
        out.push(UINT32);
        put_be(out, v, 4);
    } else {
        out.push(UINT64);
        put_be(out, v, 8);
    }
}

pub fn put_nil(out: &mut Vec<u8>) {
    out.push(NIL);
}

pub fn put_str_header(out: &mut Vec<u8>, len: u64) {
    if len <= FIXSTR_CAP {
        out.push(FIXSTR0 + len as u8);
    } else if len <= 0xff {
        out.push(STR8);
        put_be(out, len, 1);
    } else if len <= 0xffff {
        out.push(STR16);
        put_be(out, len, 2);
    } else {
        out.push(STR32);
        put_be(out, len, 4);
    }
}

pub fn put_str(out: &mut Vec<u8>, s: &[u8]) {
    put_str_header(out, s.len() as u64);
    out.extend_from_slice(s);
}

pub fn put_bin_header(out: &mut Vec<u8>, len: u64) {
    if len <= 0xff {
        out.push(BIN8);
        put_be(out, len, 1);
    } else if len <= 0xffff {
        out.push(BIN16);
        put_be(out, len, 2);
    } else {
        out.push(BIN32);
        put_be(out, len, 4);
    }
}

pub fn put_bin(out: &mut Vec<u8>, b: &[u8]) {
    put_bin_header(out, b.len() as u64);
    out.extend_from_slice(b);
}

/// One positional value of an outbound frame.
///
/// `BinHeader` writes a length tag with no payload; the payload bytes are
/// streamed behind the frame by the caller (file replies).
pub enum Field<'a> {
    Uint(u64),
    Nil,
    Str(&'a [u8]),
    BinHeader(u64),
}

pub fn put_msg(out: &mut Vec<u8>, ty: MsgType, fields: &[Field<'_>]) {
    put_array_len(out, fields.len() as u64 + 1);
    put_uint(out, u64::from(ty.code()));
    for field in fields {
        match field {
            Field::Uint(v) => put_uint(out, *v),
            Field::Nil => put_nil(out),
            Field::Str(s) => put_str(out, s),
            Field::BinHeader(len) => put_bin_header(out, *len),
        }
    }
}

/// Borrowing decode cursor over the unconsumed input region.
///
/// The cursor never fails on truncation: a value whose bytes have not all
/// arrived yet decodes to `Ok(None)` and the caller retries the whole frame
/// once more input is buffered.
pub struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Cursor { buf, pos: 0 }
    }

    pub fn consumed(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn byte(&mut self) -> Option<u8> {
        let b = *self.buf.get(self.pos)?;
        self.pos += 1;
        Some(b)
    }

    fn be_uint(&mut self, width: usize) -> Option<u64> {
        if self.remaining() < width {
            return None;
        }
        let mut v = 0u64;
        for _ in 0..width {
            v = (v << 8) | u64::from(self.buf[self.pos]);
            self.pos += 1;
        }
        Some(v)
    }

    fn take(&mut self, len: usize) -> Option<&'a [u8]> {
        if self.remaining() < len {
            return None;
        }
        let s = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Some(s)
    }

    pub fn array_len(&mut self) -> Result<Option<u64>> {
        let start = self.pos;
        let Some(tag) = self.byte() else {
            return Ok(None);
        };
        match tag {
            FIXARRAY0..=FIXARRAY_MAX => Ok(Some(u64::from(tag - FIXARRAY0))),
            ARRAY16 => {
                let Some(len) = self.be_uint(2) else {
                    self.pos = start;
                    return Ok(None);
                };
                if len <= FIXARRAY_CAP {
                    bail!("array16 holding {len} elements is not canonical");
                }
                Ok(Some(len))
            }
            other => bail!("frame must start with an array, not 0x{other:02x}"),
        }
    }

    pub fn uint(&mut self) -> Result<Option<u64>> {
        let start = self.pos;
        let Some(tag) = self.byte() else {
            return Ok(None);
        };
        let (width, floor) = match tag {
            0x00..=0x7f => return Ok(Some(u64::from(tag))),
            UINT8 => (1, 0x80),
            UINT16 => (2, 0x100),
            UINT32 => (4, 0x1_0000),
            UINT64 => (8, 0x1_0000_0000),
            other => bail!("not an unsigned integer tag: 0x{other:02x}"),
        };
        let Some(v) = self.be_uint(width) else {
            self.pos = start;
            return Ok(None);
        };
        if v < floor {
            bail!("uint{} holding {v} is not canonical", width * 8);
        }
        Ok(Some(v))
    }

    /// Consumes a nil marker if one is next. `Ok(None)` means the byte has
    /// not arrived yet; `Ok(Some(false))` leaves the cursor untouched.
    pub fn opt_nil(&mut self) -> Option<bool> {
        let b = *self.buf.get(self.pos)?;
        if b == NIL {
            self.pos += 1;
            Some(true)
        } else {
            Some(false)
        }
    }

    fn str_len(&mut self) -> Result<Option<u64>> {
        let start = self.pos;
        let Some(tag) = self.byte() else {
            return Ok(None);
        };
        let (width, floor) = match tag {
            FIXSTR0..=FIXSTR_MAX => return Ok(Some(u64::from(tag - FIXSTR0))),
            STR8 => (1, FIXSTR_CAP + 1),
            STR16 => (2, 0x100),
            STR32 => (4, 0x1_0000),
            other => bail!("not a string tag: 0x{other:02x}"),
        };
        let Some(len) = self.be_uint(width) else {
            self.pos = start;
            return Ok(None);
        };
        if len < floor {
            bail!("str{} holding {len} bytes is not canonical", width * 8);
        }
        Ok(Some(len))
    }

    pub fn str_bytes(&mut self) -> Result<Option<&'a [u8]>> {
        let start = self.pos;
        let Some(len) = self.str_len()? else {
            return Ok(None);
        };
        match self.take(len as usize) {
            Some(s) => Ok(Some(s)),
            None => {
                self.pos = start;
                Ok(None)
            }
        }
    }

    /// Decodes a bin length tag without touching the payload, which the
    /// executor streams straight from the input descriptor.
    pub fn bin_len(&mut self) -> Result<Option<u64>> {
        let start = self.pos;
        let Some(tag) = self.byte() else {
            return Ok(None);
        };
        let (width, floor) = match tag {
            BIN8 => (1, 0),
            BIN16 => (2, 0x100),
            BIN32 => (4, 0x1_0000),
            other => bail!("not a binary tag: 0x{other:02x}"),
        };
        let Some(len) = self.be_uint(width) else {
            self.pos = start;
            return Ok(None);
        };
        if len < floor {
            bail!("bin{} holding {len} bytes is not canonical", width * 8);
        }
        Ok(Some(len))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enc(f: impl FnOnce(&mut Vec<u8>)) -> Vec<u8> {
        let mut out = Vec::new();
        f(&mut out);
        out
    }

    #[test]
    fn uint_encodes_narrowest_form() {
        assert_eq!(enc(|o| put_uint(o, 0)), [0x00]);
        assert_eq!(enc(|o| put_uint(o, 0x7f)), [0x7f]);
        assert_eq!(enc(|o| put_uint(o, 0x80)), [0xcc, 0x80]);
        assert_eq!(enc(|o| put_uint(o, 0xff)), [0xcc, 0xff]);
        assert_eq!(enc(|o| put_uint(o, 0x100)), [0xcd, 0x01, 0x00]);
        assert_eq!(enc(|o| put_uint(o, 0xffff)), [0xcd, 0xff, 0xff]);
        assert_eq!(enc(|o| put_uint(o, 0x1_0000)), [0xce, 0, 1, 0, 0]);
        assert_eq!(
            enc(|o| put_uint(o, 0x1_0000_0000)),
            [0xcf, 0, 0, 0, 1, 0, 0, 0, 0]
        );
    }

    #[test]
    fn str_encodes_narrowest_form() {
        assert_eq!(enc(|o| put_str(o, b"")), [0xa0]);
        assert_eq!(enc(|o| put_str(o, b"hi")), [0xa2, b'h', b'i']);
        let s31 = [b'x'; 31];
        assert_eq!(enc(|o| put_str(o, &s31))[0], 0xbf);
        let s32 = [b'x'; 32];
        assert_eq!(&enc(|o| put_str(o, &s32))[..2], [0xd9, 32]);
        let s256 = [b'x'; 256];
        assert_eq!(&enc(|o| put_str(o, &s256))[..3], [0xda, 0x01, 0x00]);
    }

    #[test]
    fn bin_encodes_narrowest_form() {
        assert_eq!(enc(|o| put_bin(o, b"ABC")), [0xc4, 3, b'A', b'B', b'C']);
        assert_eq!(&enc(|o| put_bin_header(o, 0x100))[..], [0xc5, 0x01, 0x00]);
        assert_eq!(
            &enc(|o| put_bin_header(o, 0x1_0000))[..],
            [0xc6, 0, 1, 0, 0]
        );
    }

    #[test]
    fn msg_matches_reference_bytes() {
        // Ping and its Pong reply, straight from the protocol reference.
        assert_eq!(enc(|o| put_msg(o, MsgType::Ping, &[])), [0x91, 0x00]);
        let pong = enc(|o| put_msg(o, MsgType::Pong, &[Field::Uint(0x1_0000_0000)]));
        assert_eq!(&pong[..3], [0x92, 0x01, 0xcf]);

        let get = enc(|o| put_msg(o, MsgType::GetFile, &[Field::Str(b"/tmp/x")]));
        assert_eq!(
            get,
            [0x92, 0x06, 0xa6, 0x2f, 0x74, 0x6d, 0x70, 0x2f, 0x78]
        );
    }

    #[test]
    fn decode_roundtrips_canonical_values() {
        for v in [0u64, 1, 0x7f, 0x80, 0xff, 0x100, 0xffff, 0x1_0000, u64::MAX] {
            let bytes = enc(|o| put_uint(o, v));
            let mut cur = Cursor::new(&bytes);
            assert_eq!(cur.uint().unwrap(), Some(v));
            assert_eq!(cur.consumed(), bytes.len());
        }
    }

    #[test]
    fn decode_rejects_wide_uint() {
        // 5 fits in a fixint, so uint8 is not canonical.
        assert!(Cursor::new(&[0xcc, 0x05]).uint().is_err());
        assert!(Cursor::new(&[0xcd, 0x00, 0xff]).uint().is_err());
        assert!(Cursor::new(&[0xce, 0, 0, 0xff, 0xff]).uint().is_err());
        assert!(Cursor::new(&[0xcf, 0, 0, 0, 0, 0xff, 0xff, 0xff, 0xff])
            .uint()
            .is_err());
    }

    #[test]
    fn decode_rejects_wide_str_and_bin() {
        let mut wide = vec![0xd9, 31];
        wide.extend_from_slice(&[b'x'; 31]);
        assert!(Cursor::new(&wide).str_bytes().is_err());
        assert!(Cursor::new(&[0xc5, 0x00, 0xff]).bin_len().is_err());
        assert!(Cursor::new(&[0xdc, 0x00, 0x02]).array_len().is_err());
    }

    #[test]
    fn decode_rejects_kind_mismatch() {
        assert!(Cursor::new(&[0xc0]).uint().is_err());
        assert!(Cursor::new(&[0x05]).str_bytes().is_err());
        assert!(Cursor::new(&[0xa1, b'x']).bin_len().is_err());
        assert!(Cursor::new(&[0x00]).array_len().is_err());
    }

    #[test]
    fn incomplete_input_is_not_an_error() {
        // Truncated at every point of a str16: tag only, partial length,
        // partial payload.
        let mut full = vec![0xda, 0x01, 0x00];
        full.extend_from_slice(&[b'y'; 256]);
        for cut in [1, 2, 3, 100] {
            let mut cur = Cursor::new(&full[..cut]);
            assert!(cur.str_bytes().unwrap().is_none(), "cut at {cut}");
            assert_eq!(cur.consumed(), 0, "cursor must rewind at {cut}");
        }
        assert_eq!(
            Cursor::new(&full).str_bytes().unwrap(),
            Some(&full[3..][..256])
        );

        assert!(Cursor::new(&[0xcf, 0, 0]).uint().unwrap().is_none());
        assert!(Cursor::new(&[]).array_len().unwrap().is_none());
    }

    #[test]
    fn opt_nil_peeks() {
        let mut cur = Cursor::new(&[0xc0, 0x07]);
        assert_eq!(cur.opt_nil(), Some(true));
        assert_eq!(cur.opt_nil(), Some(false));
        assert_eq!(cur.uint().unwrap(), Some(7));
        assert_eq!(Cursor::new(&[]).opt_nil(), None);
    }

    #[test]
    fn msg_type_codes_roundtrip() {
        for code in 0..=10u64 {
            let ty = MsgType::from_code(code).unwrap();
            assert_eq!(u64::from(ty.code()), code);
        }
        assert!(MsgType::from_code(11).is_err());
    }

    #[test]
    fn arity_table() {
        assert_eq!(MsgType::Ping.arity(), (1, 1));
        assert_eq!(MsgType::Exec.arity(), (3, 14));
        assert_eq!(MsgType::Env.arity(), (4, 4));
        assert!(!MsgType::Pong.inbound());
        assert!(!MsgType::Data.inbound());
        assert!(MsgType::SetFile.inbound());
    }
}
