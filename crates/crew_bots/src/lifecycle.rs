//! Spawn, despawn, kill, and revive of bot instances.
//!
//! The host is the only participant that commits lifecycle changes; the
//! `apply_*` methods are the replica mirror path fed from confirmed wire
//! messages. Generations survive kill/revive: the manager remembers the
//! final generation per identity so a revived bot's token is always newer
//! than the stray messages of its previous life.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crew_bots_proto::{
    DespawnEvent, Generation, IdentityId, InstanceId, KillCause, KillEvent, ParticipantId,
    ReviveConfirmed, SpawnAnimationKind, SpawnConfirmed, Vec3, BOT_BODY_ID_OFFSET,
};

use crate::behavior::BehaviorMachine;
use crate::error::SessionError;
use crate::identity::{IdentityRegistry, IdentityStatus};
use crate::ownership::OwnershipAuthority;

pub const DEFAULT_MAX_SLOTS: usize = 16;

#[derive(Debug, Clone, PartialEq)]
pub struct SpawnParams {
    pub position: Vec3,
    pub y_rotation: f32,
    pub outside: bool,
    pub spawn_animation: SpawnAnimationKind,
    pub destroy_dead_body: bool,
}

impl Default for SpawnParams {
    fn default() -> Self {
        Self {
            position: Vec3::default(),
            y_rotation: 0.0,
            outside: true,
            spawn_animation: SpawnAnimationKind::None,
            destroy_dead_body: false,
        }
    }
}

/// A live bot. 1:1 with a simulated body in the host world; the instance id
/// doubles as the body id, offset above human participant ids.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BotInstance {
    pub instance_id: InstanceId,
    pub identity_id: IdentityId,
    pub slot: u32,
    pub owner: ParticipantId,
    pub machine: BehaviorMachine,
}

/// Terminal representation left behind by a kill, kept for possible revival.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadBody {
    pub identity_id: IdentityId,
    pub instance_id: InstanceId,
    pub cause: KillCause,
    pub velocity: Vec3,
    pub invalidated: bool,
}

#[derive(Debug, Clone)]
pub struct LifecycleManager {
    max_slots: usize,
    slots: Vec<Option<InstanceId>>,
    instances: BTreeMap<InstanceId, BotInstance>,
    by_identity: BTreeMap<IdentityId, InstanceId>,
    dead_bodies: BTreeMap<IdentityId, DeadBody>,
    last_generation: BTreeMap<IdentityId, Generation>,
    next_instance_seq: u64,
}

impl LifecycleManager {
    pub fn new(max_slots: usize) -> Self {
        let max_slots = max_slots.max(1);
        Self {
            max_slots,
            slots: vec![None; max_slots],
            instances: BTreeMap::new(),
            by_identity: BTreeMap::new(),
            dead_bodies: BTreeMap::new(),
            last_generation: BTreeMap::new(),
            next_instance_seq: 0,
        }
    }

    pub fn instance(&self, instance_id: InstanceId) -> Option<&BotInstance> {
        self.instances.get(&instance_id)
    }

    pub fn instance_mut(&mut self, instance_id: InstanceId) -> Option<&mut BotInstance> {
        self.instances.get_mut(&instance_id)
    }

    pub fn instances(&self) -> impl Iterator<Item = &BotInstance> {
        self.instances.values()
    }

    pub fn instances_mut(&mut self) -> impl Iterator<Item = &mut BotInstance> {
        self.instances.values_mut()
    }

    pub fn live_count(&self) -> usize {
        self.instances.len()
    }

    pub fn instance_of_identity(&self, identity_id: IdentityId) -> Option<InstanceId> {
        self.by_identity.get(&identity_id).copied()
    }

    pub fn dead_body(&self, identity_id: IdentityId) -> Option<&DeadBody> {
        self.dead_bodies.get(&identity_id)
    }

    // ---------------------------------------------------------------------
    // Host-side commits
    // ---------------------------------------------------------------------

    pub fn spawn(
        &mut self,
        registry: &mut IdentityRegistry,
        authority: &mut OwnershipAuthority,
        owner: ParticipantId,
        identity_id: IdentityId,
        params: &SpawnParams,
    ) -> Result<SpawnConfirmed, SessionError> {
        let identity = registry
            .get(identity_id)
            .ok_or(SessionError::IdentityNotFound { identity_id })?;
        if identity.status == IdentityStatus::Dead {
            return Err(SessionError::IdentityDead { identity_id });
        }
        if self.by_identity.contains_key(&identity_id) {
            return Err(SessionError::IdentityAlreadyLive { identity_id });
        }
        let slot = self
            .slots
            .iter()
            .position(|slot| slot.is_none())
            .ok_or(SessionError::NoFreeSlot {
                max_slots: self.max_slots,
            })?;

        let instance_id = BOT_BODY_ID_OFFSET + self.next_instance_seq;
        let after = self.last_generation.get(&identity_id).copied().unwrap_or(0);
        let token = authority.register(instance_id, owner, after)?;
        self.next_instance_seq += 1;

        self.slots[slot] = Some(instance_id);
        self.by_identity.insert(identity_id, instance_id);
        self.instances.insert(
            instance_id,
            BotInstance {
                instance_id,
                identity_id,
                slot: slot as u32,
                owner,
                machine: BehaviorMachine::new(),
            },
        );
        if params.destroy_dead_body {
            if let Some(body) = self.dead_bodies.get_mut(&identity_id) {
                body.invalidated = true;
                authority.set_locked(body.instance_id, false);
            }
        }
        if let Some(identity) = registry.get_mut(identity_id) {
            identity.status = IdentityStatus::Alive;
        }

        Ok(SpawnConfirmed {
            identity_id,
            instance_id,
            slot: slot as u32,
            owner,
            generation: token.generation,
            spawn_position: params.position,
            y_rotation: params.y_rotation,
            outside: params.outside,
            spawn_animation: params.spawn_animation,
            destroy_dead_body: params.destroy_dead_body,
        })
    }

    pub fn despawn(
        &mut self,
        registry: &mut IdentityRegistry,
        authority: &mut OwnershipAuthority,
        instance_id: InstanceId,
    ) -> Result<DespawnEvent, SessionError> {
        let instance = self
            .instances
            .remove(&instance_id)
            .ok_or(SessionError::EntityNotFound { entity_id: instance_id })?;
        self.remove_bookkeeping(&instance, authority);
        registry.release(instance.identity_id);
        Ok(DespawnEvent { instance_id })
    }

    pub fn kill(
        &mut self,
        registry: &mut IdentityRegistry,
        authority: &mut OwnershipAuthority,
        instance_id: InstanceId,
        cause: KillCause,
        body_velocity: Vec3,
        spawn_body: bool,
    ) -> Result<KillEvent, SessionError> {
        let instance = self
            .instances
            .remove(&instance_id)
            .ok_or(SessionError::EntityNotFound { entity_id: instance_id })?;
        self.remove_bookkeeping(&instance, authority);

        if let Some(identity) = registry.get_mut(instance.identity_id) {
            identity.status = IdentityStatus::Dead;
            identity.hp = 0;
        }
        if spawn_body {
            // The corpse keeps its id locked until the body is destroyed.
            authority.set_locked(instance_id, true);
            self.dead_bodies.insert(
                instance.identity_id,
                DeadBody {
                    identity_id: instance.identity_id,
                    instance_id,
                    cause,
                    velocity: body_velocity,
                    invalidated: false,
                },
            );
        }
        Ok(KillEvent {
            instance_id,
            cause,
            body_velocity,
            spawn_body,
        })
    }

    pub fn revive(
        &mut self,
        registry: &mut IdentityRegistry,
        authority: &mut OwnershipAuthority,
        owner: ParticipantId,
        identity_id: IdentityId,
        position: Vec3,
    ) -> Result<(SpawnConfirmed, ReviveConfirmed), SessionError> {
        {
            let identity = registry
                .get(identity_id)
                .ok_or(SessionError::IdentityNotFound { identity_id })?;
            match identity.status {
                IdentityStatus::Alive => {
                    return Err(SessionError::IdentityNotDead { identity_id })
                }
                IdentityStatus::SelectedForArrival => {
                    return Err(SessionError::ReviveAlreadySelected { identity_id })
                }
                IdentityStatus::Dead => {}
            }
        }
        let restored_hp = registry
            .get(identity_id)
            .map(|identity| identity.max_hp)
            .unwrap_or(0);
        if let Some(identity) = registry.get_mut(identity_id) {
            identity.status = IdentityStatus::Alive;
            identity.hp = restored_hp;
        }

        let params = SpawnParams {
            position,
            spawn_animation: SpawnAnimationKind::RagdollRecover,
            destroy_dead_body: true,
            ..SpawnParams::default()
        };
        let confirmed = match self.spawn(registry, authority, owner, identity_id, &params) {
            Ok(confirmed) => confirmed,
            Err(error) => {
                // Roll the status back so a later revive can retry.
                if let Some(identity) = registry.get_mut(identity_id) {
                    identity.status = IdentityStatus::Dead;
                    identity.hp = 0;
                }
                return Err(error);
            }
        };
        let revived = ReviveConfirmed {
            identity_id,
            instance_id: confirmed.instance_id,
            position,
            restored_hp,
        };
        Ok((confirmed, revived))
    }

    /// Requester-side guard: marks a dead identity as claimed by an
    /// in-flight revive request so repeated local requests are suppressed
    /// while the host's decision is pending.
    pub fn mark_for_revive(
        &mut self,
        registry: &mut IdentityRegistry,
        identity_id: IdentityId,
    ) -> Result<(), SessionError> {
        let identity = registry
            .get(identity_id)
            .ok_or(SessionError::IdentityNotFound { identity_id })?;
        match identity.status {
            IdentityStatus::Alive => Err(SessionError::IdentityNotDead { identity_id }),
            IdentityStatus::SelectedForArrival => {
                Err(SessionError::ReviveAlreadySelected { identity_id })
            }
            IdentityStatus::Dead => {
                if let Some(identity) = registry.get_mut(identity_id) {
                    identity.status = IdentityStatus::SelectedForArrival;
                }
                Ok(())
            }
        }
    }

    /// Undo of `mark_for_revive` when the request is rejected or times out.
    pub fn clear_revive_mark(&mut self, registry: &mut IdentityRegistry, identity_id: IdentityId) {
        if let Some(identity) = registry.get_mut(identity_id) {
            if identity.status == IdentityStatus::SelectedForArrival {
                identity.status = IdentityStatus::Dead;
            }
        }
    }

    fn remove_bookkeeping(&mut self, instance: &BotInstance, authority: &mut OwnershipAuthority) {
        if let Some(token) = authority.revoke(instance.instance_id) {
            self.last_generation
                .insert(instance.identity_id, token.generation);
        }
        if let Some(slot) = self.slots.get_mut(instance.slot as usize) {
            *slot = None;
        }
        self.by_identity.remove(&instance.identity_id);
    }

    // ---------------------------------------------------------------------
    // Replica mirror path
    // ---------------------------------------------------------------------

    pub fn apply_spawn_confirmed(
        &mut self,
        registry: &mut IdentityRegistry,
        authority: &mut OwnershipAuthority,
        confirmed: &SpawnConfirmed,
    ) {
        self.next_instance_seq = self
            .next_instance_seq
            .max(confirmed.instance_id.saturating_sub(BOT_BODY_ID_OFFSET) + 1);
        if let Some(slot) = self.slots.get_mut(confirmed.slot as usize) {
            *slot = Some(confirmed.instance_id);
        }
        self.by_identity
            .insert(confirmed.identity_id, confirmed.instance_id);
        self.instances.insert(
            confirmed.instance_id,
            BotInstance {
                instance_id: confirmed.instance_id,
                identity_id: confirmed.identity_id,
                slot: confirmed.slot,
                owner: confirmed.owner,
                machine: BehaviorMachine::new(),
            },
        );
        authority.install_token(crate::ownership::OwnershipToken {
            entity_id: confirmed.instance_id,
            owner: confirmed.owner,
            generation: confirmed.generation,
        });
        if confirmed.destroy_dead_body {
            if let Some(body) = self.dead_bodies.get_mut(&confirmed.identity_id) {
                body.invalidated = true;
                authority.set_locked(body.instance_id, false);
            }
        }
        if let Some(identity) = registry.get_mut(confirmed.identity_id) {
            identity.status = IdentityStatus::Alive;
        }
        self.last_generation
            .insert(confirmed.identity_id, confirmed.generation);
    }

    pub fn apply_kill(
        &mut self,
        registry: &mut IdentityRegistry,
        authority: &mut OwnershipAuthority,
        event: &KillEvent,
    ) {
        if let Some(instance) = self.instances.remove(&event.instance_id) {
            self.remove_bookkeeping(&instance, authority);
            if let Some(identity) = registry.get_mut(instance.identity_id) {
                identity.status = IdentityStatus::Dead;
                identity.hp = 0;
            }
            if event.spawn_body {
                authority.set_locked(event.instance_id, true);
                self.dead_bodies.insert(
                    instance.identity_id,
                    DeadBody {
                        identity_id: instance.identity_id,
                        instance_id: event.instance_id,
                        cause: event.cause,
                        velocity: event.body_velocity,
                        invalidated: false,
                    },
                );
            }
        }
    }

    pub fn apply_despawn(
        &mut self,
        registry: &mut IdentityRegistry,
        authority: &mut OwnershipAuthority,
        event: &DespawnEvent,
    ) {
        if let Some(instance) = self.instances.remove(&event.instance_id) {
            self.remove_bookkeeping(&instance, authority);
            registry.release(instance.identity_id);
        }
    }

    /// Follows the replicated `SpawnConfirmed` of a revive; restores the
    /// identity's progress fields the spawn mirror does not carry.
    pub fn apply_revive(&mut self, registry: &mut IdentityRegistry, confirmed: &ReviveConfirmed) {
        if let Some(identity) = registry.get_mut(confirmed.identity_id) {
            identity.status = IdentityStatus::Alive;
            identity.hp = confirmed.restored_hp.min(identity.max_hp);
        }
    }

    /// New owner from a committed transfer decision; the machine keeps its
    /// replicated state so behavior resumes where it left off.
    pub fn apply_owner_change(&mut self, instance_id: InstanceId, owner: ParticipantId) {
        if let Some(instance) = self.instances.get_mut(&instance_id) {
            instance.owner = owner;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{AllocationOrder, IdentityCatalogue, RegistryConfig};

    fn fixture(max_slots: usize) -> (IdentityRegistry, OwnershipAuthority, LifecycleManager) {
        let registry = IdentityRegistry::load(
            &IdentityCatalogue::builtin(),
            &RegistryConfig {
                min_identities: 1,
                max_identities: 8,
                order: AllocationOrder::InOrder,
            },
        );
        (
            registry,
            OwnershipAuthority::new(0),
            LifecycleManager::new(max_slots),
        )
    }

    #[test]
    fn spawn_fills_slots_in_order() {
        let (mut registry, mut authority, mut lifecycle) = fixture(3);
        let params = SpawnParams::default();
        for (identity_id, expected_slot) in [(1u32, 0u32), (2, 1), (3, 2)] {
            let confirmed = lifecycle
                .spawn(&mut registry, &mut authority, 0, identity_id, &params)
                .expect("spawn");
            assert_eq!(confirmed.slot, expected_slot);
        }
        let fourth = lifecycle.spawn(&mut registry, &mut authority, 0, 4, &params);
        assert_eq!(fourth, Err(SessionError::NoFreeSlot { max_slots: 3 }));
    }

    #[test]
    fn double_spawn_of_live_identity_is_rejected() {
        let (mut registry, mut authority, mut lifecycle) = fixture(4);
        let params = SpawnParams::default();
        lifecycle
            .spawn(&mut registry, &mut authority, 0, 1, &params)
            .expect("first spawn");
        assert_eq!(
            lifecycle.spawn(&mut registry, &mut authority, 0, 1, &params),
            Err(SessionError::IdentityAlreadyLive { identity_id: 1 })
        );
        assert_eq!(lifecycle.live_count(), 1);
    }

    #[test]
    fn dead_identity_must_go_through_revive() {
        let (mut registry, mut authority, mut lifecycle) = fixture(4);
        let params = SpawnParams::default();
        let confirmed = lifecycle
            .spawn(&mut registry, &mut authority, 0, 1, &params)
            .expect("spawn");
        lifecycle
            .kill(
                &mut registry,
                &mut authority,
                confirmed.instance_id,
                KillCause::Enemy,
                Vec3::default(),
                true,
            )
            .expect("kill");
        assert_eq!(
            lifecycle.spawn(&mut registry, &mut authority, 0, 1, &params),
            Err(SessionError::IdentityDead { identity_id: 1 })
        );
    }

    #[test]
    fn kill_then_revive_restores_aliveness_with_newer_generation() {
        let (mut registry, mut authority, mut lifecycle) = fixture(4);
        let confirmed = lifecycle
            .spawn(&mut registry, &mut authority, 0, 1, &SpawnParams::default())
            .expect("spawn");
        let pre_kill_generation = confirmed.generation;
        lifecycle
            .kill(
                &mut registry,
                &mut authority,
                confirmed.instance_id,
                KillCause::Hazard,
                Vec3::new(0.0, -4.0, 0.0),
                true,
            )
            .expect("kill");
        assert_eq!(registry.get(1).expect("identity").status, IdentityStatus::Dead);
        assert_eq!(registry.get(1).expect("identity").hp, 0);
        // The corpse id is locked against transfers while the body exists.
        assert!(authority.is_locked(confirmed.instance_id));

        let (spawn_mirror, revived) = lifecycle
            .revive(&mut registry, &mut authority, 0, 1, Vec3::default())
            .expect("revive");
        assert!(spawn_mirror.destroy_dead_body);
        assert_eq!(
            spawn_mirror.spawn_animation,
            SpawnAnimationKind::RagdollRecover
        );
        let identity = registry.get(1).expect("identity");
        assert_eq!(identity.status, IdentityStatus::Alive);
        assert_eq!(identity.hp, identity.max_hp);
        assert_eq!(revived.restored_hp, identity.max_hp);

        let token = authority.token(revived.instance_id).expect("token");
        assert!(token.generation > pre_kill_generation);
        // The dead body was invalidated by the fresh spawn and its lock
        // released with it.
        assert!(lifecycle.dead_body(1).expect("body").invalidated);
        assert!(!authority.is_locked(confirmed.instance_id));
    }

    #[test]
    fn revive_of_living_identity_is_a_conflict() {
        let (mut registry, mut authority, mut lifecycle) = fixture(4);
        lifecycle
            .spawn(&mut registry, &mut authority, 0, 1, &SpawnParams::default())
            .expect("spawn");
        assert_eq!(
            lifecycle.revive(&mut registry, &mut authority, 0, 1, Vec3::default()),
            Err(SessionError::IdentityNotDead { identity_id: 1 })
        );
    }

    #[test]
    fn second_revive_request_on_marked_identity_loses_the_race() {
        let (mut registry, mut authority, mut lifecycle) = fixture(4);
        let confirmed = lifecycle
            .spawn(&mut registry, &mut authority, 0, 1, &SpawnParams::default())
            .expect("spawn");
        lifecycle
            .kill(
                &mut registry,
                &mut authority,
                confirmed.instance_id,
                KillCause::Enemy,
                Vec3::default(),
                true,
            )
            .expect("kill");
        lifecycle
            .mark_for_revive(&mut registry, 1)
            .expect("first request marks");
        assert_eq!(
            lifecycle.mark_for_revive(&mut registry, 1),
            Err(SessionError::ReviveAlreadySelected { identity_id: 1 })
        );
        // Rejection clears the mark so the identity can be revived later.
        lifecycle.clear_revive_mark(&mut registry, 1);
        assert!(lifecycle
            .revive(&mut registry, &mut authority, 0, 1, Vec3::default())
            .is_ok());
    }

    #[test]
    fn despawn_frees_slot_and_releases_identity() {
        let (mut registry, mut authority, mut lifecycle) = fixture(1);
        registry
            .allocate(crate::identity::IdentitySelector::Specific(1))
            .expect("allocate");
        let confirmed = lifecycle
            .spawn(&mut registry, &mut authority, 0, 1, &SpawnParams::default())
            .expect("spawn");
        lifecycle
            .despawn(&mut registry, &mut authority, confirmed.instance_id)
            .expect("despawn");
        assert_eq!(lifecycle.live_count(), 0);
        assert_eq!(authority.current_owner(confirmed.instance_id), None);
        assert!(!registry.is_allocated(1));
        // Slot is reusable and instance ids never repeat.
        let second = lifecycle
            .spawn(&mut registry, &mut authority, 0, 2, &SpawnParams::default())
            .expect("respawn");
        assert_eq!(second.slot, 0);
        assert_ne!(second.instance_id, confirmed.instance_id);
    }

    #[test]
    fn replica_mirrors_spawn_and_kill() {
        let (mut host_registry, mut host_authority, mut host_lifecycle) = fixture(4);
        let (mut registry, mut authority, mut lifecycle) = fixture(4);

        let confirmed = host_lifecycle
            .spawn(&mut host_registry, &mut host_authority, 0, 1, &SpawnParams::default())
            .expect("host spawn");
        lifecycle.apply_spawn_confirmed(&mut registry, &mut authority, &confirmed);
        assert_eq!(lifecycle.live_count(), 1);
        assert_eq!(authority.current_owner(confirmed.instance_id), Some(0));

        let kill = host_lifecycle
            .kill(
                &mut host_registry,
                &mut host_authority,
                confirmed.instance_id,
                KillCause::Enemy,
                Vec3::default(),
                false,
            )
            .expect("host kill");
        lifecycle.apply_kill(&mut registry, &mut authority, &kill);
        assert_eq!(lifecycle.live_count(), 0);
        assert_eq!(registry.get(1).expect("identity").status, IdentityStatus::Dead);
    }
}
