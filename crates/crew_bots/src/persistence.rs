//! Durable identity progress.
//!
//! One [`SaveRecord`] per identity, written wholesale at checkpoints and
//! session end. A missing or corrupt save file is never fatal: loading falls
//! back to an empty record set and the reason is surfaced to the caller for
//! journaling.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crew_bots_proto::IdentityId;

use crate::error::SessionError;
use crate::identity::{IdentityRegistry, IdentityStatus};
use crate::util::{read_json_from_path, write_json_to_path};

pub const SAVE_VERSION: u32 = 1;

fn default_save_version() -> u32 {
    SAVE_VERSION
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaveRecord {
    pub identity_id: IdentityId,
    pub suit_id: u32,
    pub hp: u32,
    /// Status code per [`IdentityStatus::code`].
    pub status: u8,
    pub xp: u64,
    pub level: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SaveFile {
    #[serde(default = "default_save_version")]
    pub version: u32,
    pub records: Vec<SaveRecord>,
}

#[derive(Debug, Clone)]
pub struct PersistenceAdapter {
    path: PathBuf,
}

impl PersistenceAdapter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read all records. Missing file is an ordinary first run; a corrupt or
    /// version-mismatched file yields no records plus the fallback reason.
    pub fn load_all(&self) -> (Vec<SaveRecord>, Option<String>) {
        if !self.path.exists() {
            return (Vec::new(), None);
        }
        match read_json_from_path::<SaveFile>(&self.path) {
            Ok(file) if file.version == SAVE_VERSION => (file.records, None),
            Ok(file) => (
                Vec::new(),
                Some(format!(
                    "save version mismatch: expected {SAVE_VERSION}, found {}",
                    file.version
                )),
            ),
            Err(error) => (Vec::new(), Some(format!("save unreadable: {error:?}"))),
        }
    }

    pub fn save_all(&self, records: Vec<SaveRecord>) -> Result<(), SessionError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = SaveFile {
            version: SAVE_VERSION,
            records,
        };
        write_json_to_path(&file, &self.path)
    }
}

/// Project current identity progress into durable records.
pub fn project(registry: &IdentityRegistry) -> Vec<SaveRecord> {
    registry
        .identities()
        .map(|identity| SaveRecord {
            identity_id: identity.identity_id,
            suit_id: identity.suit_id,
            hp: identity.hp,
            status: identity.status.code(),
            xp: identity.xp,
            level: identity.level,
        })
        .collect()
}

/// Apply records onto matching identities. Unmatched records are ignored;
/// identities without a record keep registry defaults. Returns how many
/// records were applied.
pub fn reconcile(registry: &mut IdentityRegistry, records: &[SaveRecord]) -> usize {
    let mut applied = 0;
    for record in records {
        let Some(identity) = registry.get_mut(record.identity_id) else {
            continue;
        };
        identity.suit_id = record.suit_id;
        identity.hp = record.hp.min(identity.max_hp);
        identity.status = IdentityStatus::from_code(record.status);
        identity.xp = record.xp;
        identity.level = record.level;
        applied += 1;
    }
    applied
}
