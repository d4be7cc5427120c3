//! Single-writer ownership coordination.
//!
//! The host's [`OwnershipAuthority`] is the only writer of authoritative
//! ownership state; every other participant holds the same structure as a
//! read-only cache updated through [`OwnershipAuthority::apply_decision`].
//! Generation counters strictly increase per entity, so reordered or
//! duplicated transfer messages are detected and discarded.
//!
//! Items a bot holds carry no authority of their own: their authority is
//! re-derived from the holding entity's token on every commit.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crew_bots_proto::{Generation, InstanceId, ItemId, ParticipantId, TransferDecision, TransferRequest};

use crate::error::SessionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnershipToken {
    pub entity_id: InstanceId,
    pub owner: ParticipantId,
    pub generation: Generation,
}

#[derive(Debug, Clone)]
pub struct OwnershipAuthority {
    host: ParticipantId,
    tokens: BTreeMap<InstanceId, OwnershipToken>,
    /// Entities that may not change owner right now. A killed bot's id
    /// stays here while its corpse exists; the lock outlives the token, so
    /// it is checked before the token lookup.
    locked: BTreeSet<InstanceId>,
    items_by_entity: BTreeMap<InstanceId, BTreeSet<ItemId>>,
    item_owner: BTreeMap<ItemId, ParticipantId>,
}

impl OwnershipAuthority {
    pub fn new(host: ParticipantId) -> Self {
        Self {
            host,
            tokens: BTreeMap::new(),
            locked: BTreeSet::new(),
            items_by_entity: BTreeMap::new(),
            item_owner: BTreeMap::new(),
        }
    }

    pub fn host(&self) -> ParticipantId {
        self.host
    }

    pub fn token(&self, entity_id: InstanceId) -> Option<&OwnershipToken> {
        self.tokens.get(&entity_id)
    }

    pub fn current_owner(&self, entity_id: InstanceId) -> Option<ParticipantId> {
        self.tokens.get(&entity_id).map(|token| token.owner)
    }

    pub fn tokens(&self) -> impl Iterator<Item = &OwnershipToken> {
        self.tokens.values()
    }

    /// Register a freshly spawned entity. `after` is the last generation the
    /// entity's identity ever held, so a revive always produces a strictly
    /// greater generation than the pre-kill token.
    pub fn register(
        &mut self,
        entity_id: InstanceId,
        owner: ParticipantId,
        after: Generation,
    ) -> Result<OwnershipToken, SessionError> {
        if self.tokens.contains_key(&entity_id) {
            return Err(SessionError::EntityAlreadyRegistered { entity_id });
        }
        let generation = after
            .checked_add(1)
            .ok_or(SessionError::GenerationOverflow { entity_id })?;
        let token = OwnershipToken {
            entity_id,
            owner,
            generation,
        };
        self.tokens.insert(entity_id, token);
        Ok(token)
    }

    /// Drop the entity's token, returning it so the lifecycle layer can
    /// remember the final generation. Held items lose their derived owner.
    pub fn revoke(&mut self, entity_id: InstanceId) -> Option<OwnershipToken> {
        self.locked.remove(&entity_id);
        if let Some(items) = self.items_by_entity.remove(&entity_id) {
            for item in items {
                self.item_owner.remove(&item);
            }
        }
        self.tokens.remove(&entity_id)
    }

    pub fn set_locked(&mut self, entity_id: InstanceId, locked: bool) {
        if locked {
            self.locked.insert(entity_id);
        } else {
            self.locked.remove(&entity_id);
        }
    }

    pub fn is_locked(&self, entity_id: InstanceId) -> bool {
        self.locked.contains(&entity_id)
    }

    /// Host-side transfer arbitration. The decision is returned for
    /// broadcast whether accepted or not; a commit re-derives item authority
    /// synchronously.
    pub fn request_transfer(&mut self, request: &TransferRequest) -> TransferDecision {
        let reject = |generation: Generation, reason: &str| TransferDecision {
            entity_id: request.entity_id,
            from: request.from,
            to: request.to,
            generation,
            accepted: false,
            reason: Some(reason.to_string()),
        };

        if self.locked.contains(&request.entity_id) {
            let generation = self
                .tokens
                .get(&request.entity_id)
                .map(|token| token.generation)
                .unwrap_or(request.expected_generation);
            return reject(generation, "entity is not transferable");
        }
        let Some(token) = self.tokens.get(&request.entity_id) else {
            return reject(request.expected_generation, "entity does not exist");
        };
        if token.owner != request.from {
            return reject(token.generation, "stale owner");
        }
        if token.generation != request.expected_generation {
            return reject(token.generation, "stale generation");
        }
        let Some(generation) = token.generation.checked_add(1) else {
            return reject(token.generation, "generation overflow");
        };

        let committed = OwnershipToken {
            entity_id: request.entity_id,
            owner: request.to,
            generation,
        };
        self.tokens.insert(request.entity_id, committed);
        self.rederive_item_authority(request.entity_id);
        TransferDecision {
            entity_id: request.entity_id,
            from: request.from,
            to: request.to,
            generation,
            accepted: true,
            reason: None,
        }
    }

    /// Reassign everything a departing participant owned back to the host,
    /// each under a fresh generation. No entity is ever left without an
    /// owner.
    pub fn handle_disconnect(&mut self, participant: ParticipantId) -> Vec<TransferDecision> {
        let orphaned: Vec<InstanceId> = self
            .tokens
            .values()
            .filter(|token| token.owner == participant)
            .map(|token| token.entity_id)
            .collect();

        let mut decisions = Vec::with_capacity(orphaned.len());
        for entity_id in orphaned {
            let Some(token) = self.tokens.get_mut(&entity_id) else {
                continue;
            };
            let Some(generation) = token.generation.checked_add(1) else {
                continue;
            };
            let from = token.owner;
            token.owner = self.host;
            token.generation = generation;
            self.rederive_item_authority(entity_id);
            decisions.push(TransferDecision {
                entity_id,
                from,
                to: self.host,
                generation,
                accepted: true,
                reason: Some("owner disconnected".to_string()),
            });
        }
        decisions
    }

    /// Replica-side application of a broadcast decision. Messages carrying a
    /// generation at or below the cached one are stale and ignored; the
    /// return value says whether the cache moved.
    pub fn apply_decision(&mut self, decision: &TransferDecision) -> bool {
        if !decision.accepted {
            return false;
        }
        if let Some(token) = self.tokens.get(&decision.entity_id) {
            if decision.generation <= token.generation {
                return false;
            }
        }
        self.tokens.insert(
            decision.entity_id,
            OwnershipToken {
                entity_id: decision.entity_id,
                owner: decision.to,
                generation: decision.generation,
            },
        );
        self.rederive_item_authority(decision.entity_id);
        true
    }

    /// Install a token verbatim (spawn replication on replicas, and host
    /// migration rebuilds). Stale installs are ignored.
    pub fn install_token(&mut self, token: OwnershipToken) -> bool {
        if let Some(existing) = self.tokens.get(&token.entity_id) {
            if token.generation <= existing.generation {
                return false;
            }
        }
        self.tokens.insert(token.entity_id, token);
        self.rederive_item_authority(token.entity_id);
        true
    }

    /// Re-derive every token from a replicated snapshot instead of resetting
    /// (transport-level host migration path).
    pub fn rebuild_from_snapshot(&mut self, tokens: Vec<OwnershipToken>) {
        self.tokens.clear();
        for token in tokens {
            self.tokens.insert(token.entity_id, token);
        }
        let entities: Vec<InstanceId> = self.items_by_entity.keys().copied().collect();
        for entity_id in entities {
            self.rederive_item_authority(entity_id);
        }
    }

    // ---------------------------------------------------------------------
    // Inventory authority
    // ---------------------------------------------------------------------

    pub fn attach_item(&mut self, item_id: ItemId, entity_id: InstanceId) -> Result<(), SessionError> {
        if !self.tokens.contains_key(&entity_id) {
            return Err(SessionError::EntityNotFound { entity_id });
        }
        self.items_by_entity
            .entry(entity_id)
            .or_default()
            .insert(item_id);
        self.rederive_item_authority(entity_id);
        Ok(())
    }

    pub fn detach_item(&mut self, item_id: ItemId) {
        self.items_by_entity.retain(|_, items| {
            items.remove(&item_id);
            !items.is_empty()
        });
        self.item_owner.remove(&item_id);
    }

    /// Current authority over an item, always the owner of the holding
    /// entity.
    pub fn item_authority(&self, item_id: ItemId) -> Option<ParticipantId> {
        self.item_owner.get(&item_id).copied()
    }

    pub fn items_held_by(&self, entity_id: InstanceId) -> Vec<ItemId> {
        self.items_by_entity
            .get(&entity_id)
            .map(|items| items.iter().copied().collect())
            .unwrap_or_default()
    }

    fn rederive_item_authority(&mut self, entity_id: InstanceId) {
        let owner = self.tokens.get(&entity_id).map(|token| token.owner);
        let Some(items) = self.items_by_entity.get(&entity_id) else {
            return;
        };
        for item in items {
            match owner {
                Some(owner) => {
                    self.item_owner.insert(*item, owner);
                }
                None => {
                    self.item_owner.remove(item);
                }
            }
        }
    }
}
