//! Node and pipeline identifiers

use crate::error::{EventError, Result};
use rand::rngs::OsRng;
use rand::RngCore;

const ID_LEN: usize = 10;
const ALPHABET: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

/// Largest multiple of the alphabet size that fits in a byte
const ACCEPT_BELOW: u8 = (256 / ALPHABET.len() * ALPHABET.len()) as u8;

/// Generate `<prefix>_<10 base62 chars>` from the OS randomness source.
///
/// A failing randomness source is an error; there is no weaker fallback.
pub fn new_id(prefix: &str) -> Result<String> {
    let mut id = String::with_capacity(prefix.len() + 1 + ID_LEN);
    id.push_str(prefix);
    id.push('_');

    let mut remaining = ID_LEN;
    let mut buf = [0u8; ID_LEN * 2];
    while remaining > 0 {
        OsRng
            .try_fill_bytes(&mut buf)
            .map_err(|e| EventError::Id(format!("{}: {}", prefix, e)))?;
        for c in buf.iter().filter_map(|&b| base62(b)).take(remaining) {
            id.push(c);
            remaining -= 1;
        }
    }
    Ok(id)
}

/// Map a random byte to a base62 char, rejecting the bytes that would
/// make the low end of the alphabet more likely.
fn base62(b: u8) -> Option<char> {
    if b >= ACCEPT_BELOW {
        return None;
    }
    Some(ALPHABET[b as usize % ALPHABET.len()] as char)
}
