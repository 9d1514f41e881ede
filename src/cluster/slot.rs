//! Cluster slot calculation.
//!
//! Keys map to one of 16384 slots via CRC16 (XMODEM variant) modulo 16384.

use crc::{Crc, CRC_16_XMODEM};

use crate::core::command::Cmd;
use crate::core::{Error, Result};

/// Number of hash slots in the cluster.
pub const SLOT_COUNT: u16 = 16384;

const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_XMODEM);

/// Calculates the slot for a key.
///
/// If the key contains a non-empty `{...}` section, only its content is
/// hashed, so `{user1000}.following` and `{user1000}.followers` share a slot.
///
/// # Examples
///
/// ```
/// use slotwise::key_slot;
///
/// assert_eq!(key_slot("A"), 6373);
/// assert_eq!(key_slot("{user1000}.following"), key_slot("{user1000}.followers"));
/// ```
pub fn key_slot(key: impl AsRef<[u8]>) -> u16 {
    let hash_key = extract_hash_tag(key.as_ref());
    CRC16.checksum(hash_key) % SLOT_COUNT
}

/// Returns the content of the first `{...}` pair, or the whole key if that
/// pair is missing or empty.
fn extract_hash_tag(key: &[u8]) -> &[u8] {
    if let Some(start) = key.iter().position(|&b| b == b'{') {
        if let Some(len) = key[start + 1..].iter().position(|&b| b == b'}') {
            if len > 0 {
                return &key[start + 1..start + 1 + len];
            }
        }
    }
    key
}

/// Computes the single slot a command targets.
///
/// Returns `Ok(None)` for keyless commands.
///
/// # Errors
///
/// Returns [`Error::CrossSlot`] when the keys hash to different slots.
pub fn command_slot(cmd: &Cmd) -> Result<Option<u16>> {
    let mut slot = None;
    for key in cmd.keys() {
        let s = key_slot(key);
        match slot {
            None => slot = Some(s),
            Some(prev) if prev != s => return Err(Error::CrossSlot),
            Some(_) => {}
        }
    }
    Ok(slot)
}
