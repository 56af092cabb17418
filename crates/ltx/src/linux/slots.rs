//! The process-slot table and per-slot environment overlays.
//!
//! Slots are a flat array addressed by the one-byte ids on the wire; the
//! pid lookup the signal handler needs is a linear scan over 127 entries,
//! which beats a map at this size and keeps reuse trivial. Environment
//! overlays survive slot reuse until overwritten.

use std::ffi::CString;
use std::os::fd::OwnedFd;

use anyhow::{bail, Result};

/// Slot ids run 0..=126; 127 is reserved and never valid on the wire.
pub const SLOT_COUNT: usize = 127;

/// `ARG_MAX` from linux/limits.h, the baseline for the packed-storage
/// budgets below.
pub const ARG_MAX: usize = 131072;

/// Combined byte budget for one Exec's argv strings (NUL terminators
/// included), deliberately far below the kernel limit.
pub const ARGV_STORE_BYTES: usize = ARG_MAX / 2;

pub const ENV_KEY_STORE_BYTES: usize = ARG_MAX / 16;
pub const ENV_VAL_STORE_BYTES: usize = ARG_MAX / 2;
pub const ENV_MAX_ENTRIES: usize = 255;
pub const ENV_KEY_MAX: usize = 255;
/// PATH_MAX; individual values may not reach it.
pub const ENV_VAL_MAX: usize = 4096;

/// Ordered key→value pairs applied to a slot's children between fork and
/// exec. Keys are unique; setting one again replaces its value in place.
pub struct EnvOverlay {
    entries: Vec<(CString, CString)>,
    key_bytes: usize,
    val_bytes: usize,
}

impl EnvOverlay {
    fn new() -> EnvOverlay {
        EnvOverlay {
            entries: Vec::new(),
            key_bytes: 0,
            val_bytes: 0,
        }
    }

    pub fn set(&mut self, key: &str, val: &str) -> Result<()> {
        if key.is_empty() || key.len() > ENV_KEY_MAX {
            bail!("key length {} out of range", key.len());
        }
        if val.len() >= ENV_VAL_MAX {
            bail!("value length {} out of range", val.len());
        }
        let Ok(ckey) = CString::new(key) else {
            bail!("key contains a NUL byte");
        };
        let Ok(cval) = CString::new(val) else {
            bail!("value contains a NUL byte");
        };

        if let Some(slot) = self
            .entries
            .iter_mut()
            .find(|(k, _)| k.as_bytes() == key.as_bytes())
        {
            let new_val_bytes = self.val_bytes - (slot.1.as_bytes().len() + 1) + val.len() + 1;
            if new_val_bytes >= ENV_VAL_STORE_BYTES {
                bail!("ran out of value space: {new_val_bytes}");
            }
            self.val_bytes = new_val_bytes;
            slot.1 = cval;
            return Ok(());
        }

        if self.entries.len() >= ENV_MAX_ENTRIES {
            bail!("ran out of entries: {}", ENV_MAX_ENTRIES);
        }
        if self.key_bytes + key.len() + 1 >= ENV_KEY_STORE_BYTES {
            bail!("ran out of key space: {}", self.key_bytes + key.len() + 1);
        }
        if self.val_bytes + val.len() + 1 >= ENV_VAL_STORE_BYTES {
            bail!("ran out of value space: {}", self.val_bytes + val.len() + 1);
        }
        self.key_bytes += key.len() + 1;
        self.val_bytes += val.len() + 1;
        self.entries.push((ckey, cval));
        Ok(())
    }

    pub fn entries(&self) -> &[(CString, CString)] {
        &self.entries
    }
}

pub struct Slot {
    /// 0 while no child occupies the slot.
    pub pid: libc::pid_t,
    /// Read end of the child's merged stdout+stderr pipe. Dropping it also
    /// removes it from the event loop's interest set.
    pub capture: Option<OwnedFd>,
    pub env: EnvOverlay,
}

pub struct SlotTable {
    slots: Vec<Slot>,
}

impl SlotTable {
    pub fn new() -> SlotTable {
        let mut slots = Vec::with_capacity(SLOT_COUNT);
        for _ in 0..SLOT_COUNT {
            slots.push(Slot {
                pid: 0,
                capture: None,
                env: EnvOverlay::new(),
            });
        }
        SlotTable { slots }
    }

    pub fn get_mut(&mut self, id: u8) -> &mut Slot {
        &mut self.slots[usize::from(id)]
    }

    pub fn slot_of_pid(&self, pid: libc::pid_t) -> Option<u8> {
        if pid == 0 {
            return None;
        }
        self.slots
            .iter()
            .position(|slot| slot.pid == pid)
            .map(|id| id as u8)
    }
}
