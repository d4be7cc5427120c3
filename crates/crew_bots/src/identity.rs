//! Identity catalogue and registry.
//!
//! Identities are the durable half of a bot: a fixed template (name, suit,
//! voice) plus progress fields that survive the session. The registry hands
//! out identity slots in a deterministic order, bounded by configured
//! capacity.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fs;
use std::path::Path;

use crew_bots_proto::IdentityId;

use crate::error::SessionError;
use crate::util::{seeded_shuffle, sha256_hex};

pub const DEFAULT_MIN_IDENTITIES: usize = 4;
pub const DEFAULT_MAX_IDENTITIES: usize = 16;
pub const DEFAULT_MAX_HP: u32 = 100;
pub const DEFAULT_VOICE_VOLUME: f32 = 1.0;

const BUILTIN_NAMES: [&str; 8] = ["Ash", "Bea", "Cole", "Dex", "Em", "Fen", "Gus", "Haze"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuitMode {
    Fixed,
    Random,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoiceProfile {
    pub folder: String,
    pub base_volume: f32,
    /// Pitch is not configured; it is derived from the identity name so the
    /// same identity sounds the same on every participant.
    pub pitch: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentityStatus {
    Alive,
    Dead,
    SelectedForArrival,
}

impl IdentityStatus {
    pub fn code(self) -> u8 {
        match self {
            IdentityStatus::Alive => 0,
            IdentityStatus::Dead => 1,
            IdentityStatus::SelectedForArrival => 2,
        }
    }

    pub fn from_code(code: u8) -> Self {
        match code {
            1 => IdentityStatus::Dead,
            2 => IdentityStatus::SelectedForArrival,
            _ => IdentityStatus::Alive,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    pub identity_id: IdentityId,
    pub name: String,
    pub suit_mode: SuitMode,
    pub suit_id: u32,
    pub voice: VoiceProfile,
    pub hp: u32,
    pub max_hp: u32,
    pub xp: u64,
    pub level: u32,
    pub status: IdentityStatus,
}

// ---------------------------------------------------------------------
// Catalogue
// ---------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct CatalogueEntry {
    pub name: String,
    pub suit_mode: SuitMode,
    pub suit_id: u32,
    pub voice_folder: String,
    pub voice_volume: f32,
    pub max_hp: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogueReject {
    pub name: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct RawCatalogue {
    #[serde(default)]
    identity: Vec<RawEntry>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct RawEntry {
    #[serde(default)]
    name: String,
    #[serde(default)]
    suit: Option<SuitMode>,
    #[serde(default)]
    suit_id: Option<u32>,
    #[serde(default)]
    voice_folder: Option<String>,
    #[serde(default)]
    voice_volume: Option<f32>,
    #[serde(default)]
    max_hp: Option<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IdentityCatalogue {
    pub entries: Vec<CatalogueEntry>,
}

impl IdentityCatalogue {
    pub fn builtin() -> Self {
        let entries = BUILTIN_NAMES
            .iter()
            .map(|name| CatalogueEntry {
                name: (*name).to_string(),
                suit_mode: SuitMode::Fixed,
                suit_id: 0,
                voice_folder: format!("voices/{}", name.to_ascii_lowercase()),
                voice_volume: DEFAULT_VOICE_VOLUME,
                max_hp: DEFAULT_MAX_HP,
            })
            .collect();
        Self { entries }
    }

    /// Merge a user override file onto the builtin catalogue. A missing file
    /// yields the builtins; a malformed file or entry falls back and is
    /// reported, never fatal.
    pub fn load_toml(path: impl AsRef<Path>) -> (Self, Vec<CatalogueReject>) {
        let path = path.as_ref();
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(_) => return (Self::builtin(), Vec::new()),
        };
        let raw: RawCatalogue = match toml::from_str(&text) {
            Ok(raw) => raw,
            Err(error) => {
                return (
                    Self::builtin(),
                    vec![CatalogueReject {
                        name: path.display().to_string(),
                        reason: format!("catalogue file unreadable: {error}"),
                    }],
                );
            }
        };
        Self::merge_raw(raw)
    }

    fn merge_raw(raw: RawCatalogue) -> (Self, Vec<CatalogueReject>) {
        let mut catalogue = Self::builtin();
        let mut rejects = Vec::new();
        for (index, raw_entry) in raw.identity.into_iter().enumerate() {
            match validate_entry(&raw_entry) {
                Ok(entry) => {
                    match catalogue
                        .entries
                        .iter_mut()
                        .find(|existing| existing.name == entry.name)
                    {
                        Some(existing) => *existing = entry,
                        None => catalogue.entries.push(entry),
                    }
                }
                Err(reason) => rejects.push(CatalogueReject {
                    name: if raw_entry.name.trim().is_empty() {
                        format!("entry #{index}")
                    } else {
                        raw_entry.name.clone()
                    },
                    reason,
                }),
            }
        }
        (catalogue, rejects)
    }
}

fn validate_entry(raw: &RawEntry) -> Result<CatalogueEntry, String> {
    let name = raw.name.trim();
    if name.is_empty() {
        return Err("name must not be empty".to_string());
    }
    let voice_volume = raw.voice_volume.unwrap_or(DEFAULT_VOICE_VOLUME);
    if !(0.0..=1.0).contains(&voice_volume) {
        return Err(format!("voice_volume out of range: {voice_volume}"));
    }
    let max_hp = raw.max_hp.unwrap_or(DEFAULT_MAX_HP);
    if max_hp == 0 {
        return Err("max_hp must be positive".to_string());
    }
    Ok(CatalogueEntry {
        name: name.to_string(),
        suit_mode: raw.suit.unwrap_or(SuitMode::Fixed),
        suit_id: raw.suit_id.unwrap_or(0),
        voice_folder: raw
            .voice_folder
            .clone()
            .unwrap_or_else(|| format!("voices/{}", name.to_ascii_lowercase())),
        voice_volume,
        max_hp,
    })
}

fn derived_pitch(name: &str) -> f32 {
    let digest = sha256_hex(name.as_bytes());
    let bucket = u32::from_str_radix(&digest[..4], 16).unwrap_or(0) % 31;
    0.85 + bucket as f32 / 100.0
}

// ---------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationOrder {
    InOrder,
    Shuffled { seed: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentitySelector {
    Next,
    Specific(IdentityId),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryConfig {
    pub min_identities: usize,
    pub max_identities: usize,
    pub order: AllocationOrder,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            min_identities: DEFAULT_MIN_IDENTITIES,
            max_identities: DEFAULT_MAX_IDENTITIES,
            order: AllocationOrder::InOrder,
        }
    }
}

#[derive(Debug, Clone)]
pub struct IdentityRegistry {
    identities: BTreeMap<IdentityId, Identity>,
    available: VecDeque<IdentityId>,
    allocated: BTreeSet<IdentityId>,
    capacity: usize,
}

impl IdentityRegistry {
    /// Build the registry from a catalogue. Entry count is clamped to
    /// `max_identities`; a catalogue shorter than `min_identities` is padded
    /// with generated recruits so the pool never starts undersized.
    pub fn load(catalogue: &IdentityCatalogue, config: &RegistryConfig) -> Self {
        let max = config.max_identities.max(1);
        let min = config.min_identities.min(max);
        let mut entries: Vec<CatalogueEntry> = catalogue.entries.iter().take(max).cloned().collect();
        let mut pad = 1u32;
        while entries.len() < min {
            entries.push(CatalogueEntry {
                name: format!("Recruit {pad}"),
                suit_mode: SuitMode::Fixed,
                suit_id: 0,
                voice_folder: "voices/default".to_string(),
                voice_volume: DEFAULT_VOICE_VOLUME,
                max_hp: DEFAULT_MAX_HP,
            });
            pad += 1;
        }

        let mut identities = BTreeMap::new();
        let mut order: Vec<IdentityId> = Vec::with_capacity(entries.len());
        for (index, entry) in entries.iter().enumerate() {
            let identity_id = index as IdentityId + 1;
            identities.insert(
                identity_id,
                Identity {
                    identity_id,
                    name: entry.name.clone(),
                    suit_mode: entry.suit_mode,
                    suit_id: entry.suit_id,
                    voice: VoiceProfile {
                        folder: entry.voice_folder.clone(),
                        base_volume: entry.voice_volume,
                        pitch: derived_pitch(&entry.name),
                    },
                    hp: entry.max_hp,
                    max_hp: entry.max_hp,
                    xp: 0,
                    level: 1,
                    status: IdentityStatus::Alive,
                },
            );
            order.push(identity_id);
        }
        if let AllocationOrder::Shuffled { seed } = config.order {
            seeded_shuffle(&mut order, seed);
        }

        let capacity = order.len();
        Self {
            identities,
            available: order.into_iter().collect(),
            allocated: BTreeSet::new(),
            capacity,
        }
    }

    pub fn allocate(&mut self, selector: IdentitySelector) -> Result<IdentityId, SessionError> {
        let identity_id = match selector {
            IdentitySelector::Next => self
                .available
                .pop_front()
                .ok_or(SessionError::IdentityPoolExhausted {
                    capacity: self.capacity,
                })?,
            IdentitySelector::Specific(identity_id) => {
                let identity = self
                    .identities
                    .get(&identity_id)
                    .ok_or(SessionError::IdentityNotFound { identity_id })?;
                // A killed identity is still allocated; report it as dead
                // rather than as live.
                if identity.status == IdentityStatus::Dead {
                    return Err(SessionError::IdentityDead { identity_id });
                }
                let position = self
                    .available
                    .iter()
                    .position(|candidate| *candidate == identity_id)
                    .ok_or(SessionError::IdentityAlreadyLive { identity_id })?;
                self.available.remove(position);
                identity_id
            }
        };
        self.allocated.insert(identity_id);
        if let Some(identity) = self.identities.get_mut(&identity_id) {
            if identity.status == IdentityStatus::Alive {
                identity.status = IdentityStatus::SelectedForArrival;
            }
        }
        Ok(identity_id)
    }

    pub fn release(&mut self, identity_id: IdentityId) {
        if self.allocated.remove(&identity_id) {
            self.available.push_back(identity_id);
            if let Some(identity) = self.identities.get_mut(&identity_id) {
                if identity.status == IdentityStatus::SelectedForArrival {
                    identity.status = IdentityStatus::Alive;
                }
            }
        }
    }

    pub fn get(&self, identity_id: IdentityId) -> Option<&Identity> {
        self.identities.get(&identity_id)
    }

    pub(crate) fn get_mut(&mut self, identity_id: IdentityId) -> Option<&mut Identity> {
        self.identities.get_mut(&identity_id)
    }

    pub fn identities(&self) -> impl Iterator<Item = &Identity> {
        self.identities.values()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available_len(&self) -> usize {
        self.available.len()
    }

    pub fn is_allocated(&self, identity_id: IdentityId) -> bool {
        self.allocated.contains(&identity_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry_with(order: AllocationOrder, max: usize) -> IdentityRegistry {
        IdentityRegistry::load(
            &IdentityCatalogue::builtin(),
            &RegistryConfig {
                min_identities: 1,
                max_identities: max,
                order,
            },
        )
    }

    #[test]
    fn in_order_allocation_is_sequential() {
        let mut registry = registry_with(AllocationOrder::InOrder, 3);
        assert_eq!(registry.allocate(IdentitySelector::Next), Ok(1));
        assert_eq!(registry.allocate(IdentitySelector::Next), Ok(2));
        assert_eq!(registry.allocate(IdentitySelector::Next), Ok(3));
    }

    #[test]
    fn allocation_beyond_capacity_fails_instead_of_wrapping() {
        let mut registry = registry_with(AllocationOrder::InOrder, 2);
        registry.allocate(IdentitySelector::Next).expect("first");
        registry.allocate(IdentitySelector::Next).expect("second");
        assert_eq!(
            registry.allocate(IdentitySelector::Next),
            Err(SessionError::IdentityPoolExhausted { capacity: 2 })
        );
    }

    #[test]
    fn shuffled_allocation_is_reproducible_per_seed() {
        let mut first = registry_with(AllocationOrder::Shuffled { seed: 9 }, 8);
        let mut second = registry_with(AllocationOrder::Shuffled { seed: 9 }, 8);
        for _ in 0..8 {
            assert_eq!(
                first.allocate(IdentitySelector::Next),
                second.allocate(IdentitySelector::Next)
            );
        }
    }

    #[test]
    fn release_returns_identity_to_pool() {
        let mut registry = registry_with(AllocationOrder::InOrder, 1);
        let id = registry.allocate(IdentitySelector::Next).expect("allocate");
        assert!(registry.allocate(IdentitySelector::Next).is_err());
        registry.release(id);
        assert_eq!(registry.allocate(IdentitySelector::Next), Ok(id));
    }

    #[test]
    fn specific_allocation_of_live_identity_is_rejected() {
        let mut registry = registry_with(AllocationOrder::InOrder, 4);
        registry
            .allocate(IdentitySelector::Specific(2))
            .expect("allocate 2");
        assert_eq!(
            registry.allocate(IdentitySelector::Specific(2)),
            Err(SessionError::IdentityAlreadyLive { identity_id: 2 })
        );
        assert_eq!(
            registry.allocate(IdentitySelector::Specific(99)),
            Err(SessionError::IdentityNotFound { identity_id: 99 })
        );
    }

    #[test]
    fn specific_allocation_of_dead_identity_reports_it_as_dead() {
        let mut registry = registry_with(AllocationOrder::InOrder, 4);
        registry
            .allocate(IdentitySelector::Specific(2))
            .expect("allocate 2");
        registry.get_mut(2).expect("identity").status = IdentityStatus::Dead;
        assert_eq!(
            registry.allocate(IdentitySelector::Specific(2)),
            Err(SessionError::IdentityDead { identity_id: 2 })
        );
    }

    #[test]
    fn malformed_override_entries_fall_back_with_reasons() {
        let raw: RawCatalogue = toml::from_str(
            r#"
            [[identity]]
            name = "Vera"
            max_hp = 120

            [[identity]]
            name = ""
            max_hp = 50

            [[identity]]
            name = "Loud"
            voice_volume = 3.5
            "#,
        )
        .expect("parse test catalogue");
        let (catalogue, rejects) = IdentityCatalogue::merge_raw(raw);
        assert_eq!(rejects.len(), 2);
        assert!(rejects[0].reason.contains("name"));
        assert!(rejects[1].reason.contains("voice_volume"));
        assert!(catalogue
            .entries
            .iter()
            .any(|entry| entry.name == "Vera" && entry.max_hp == 120));
        // Builtins survive the merge.
        assert!(catalogue.entries.iter().any(|entry| entry.name == "Ash"));
    }

    #[test]
    fn override_replaces_builtin_of_same_name() {
        let raw: RawCatalogue = toml::from_str(
            r#"
            [[identity]]
            name = "Ash"
            suit = "random"
            max_hp = 80
            "#,
        )
        .expect("parse test catalogue");
        let (catalogue, rejects) = IdentityCatalogue::merge_raw(raw);
        assert!(rejects.is_empty());
        let ash = catalogue
            .entries
            .iter()
            .find(|entry| entry.name == "Ash")
            .expect("Ash present");
        assert_eq!(ash.suit_mode, SuitMode::Random);
        assert_eq!(ash.max_hp, 80);
        assert_eq!(
            catalogue
                .entries
                .iter()
                .filter(|entry| entry.name == "Ash")
                .count(),
            1
        );
    }

    #[test]
    fn derived_pitch_is_stable_and_bounded() {
        let pitch = derived_pitch("Ash");
        assert_eq!(pitch, derived_pitch("Ash"));
        assert!((0.85..=1.16).contains(&pitch));
    }
}
