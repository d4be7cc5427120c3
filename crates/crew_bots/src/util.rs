//! Utility helpers shared across the session core.

use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::Path;

use crate::error::SessionError;

/// Compute SHA256 hash of bytes and return as hex string.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Write a serializable value to a JSON file, creating parent directories
/// as needed.
pub fn write_json_to_path<T: Serialize>(value: &T, path: &Path) -> Result<(), SessionError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let data = serde_json::to_vec_pretty(value)?;
    fs::write(path, data)?;
    Ok(())
}

/// Read a JSON file and deserialize it.
pub fn read_json_from_path<T: DeserializeOwned>(path: &Path) -> Result<T, SessionError> {
    let data = fs::read(path)?;
    Ok(serde_json::from_slice(&data)?)
}

/// Deterministic draw stream derived from a seed, used where repeated runs
/// with the same seed must produce identical results.
fn seeded_draw(seed: u64, counter: u64) -> u64 {
    let payload = format!("{seed}:{counter}");
    let digest = Sha256::digest(payload.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes)
}

/// Fisher-Yates shuffle driven by the seeded draw stream.
pub fn seeded_shuffle<T>(items: &mut [T], seed: u64) {
    let mut counter = 0u64;
    for i in (1..items.len()).rev() {
        let draw = seeded_draw(seed, counter);
        counter += 1;
        let j = (draw % (i as u64 + 1)) as usize;
        items.swap(i, j);
    }
}
