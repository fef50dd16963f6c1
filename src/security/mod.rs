//! Secure storage for adapter credentials (LLM/STT/TTS API keys, admin
//! token) — see `keyring` for the OS-keyring/file-fallback mechanism.

pub mod keyring;

use anyhow::Result;

pub fn set_credential(name: &str, value: &str) -> Result<()> {
    keyring::set_credential(name, value)
}

pub fn get_credential(name: &str) -> Result<String> {
    keyring::get_credential(name)
}

pub fn delete_credential(name: &str) -> Result<()> {
    keyring::delete_credential(name)
}

pub fn has_credential(name: &str) -> bool {
    keyring::has_credential(name)
}

/// Constant-time byte comparison, for credentials where a byte-by-byte
/// early exit would let a timing side-channel narrow down the value
/// (admin token header, password hash).
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}
