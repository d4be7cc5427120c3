//! Per-participant session context.
//!
//! One `SessionContext` runs on every participant. The host's context is
//! authoritative: it commits lifecycle and ownership changes and broadcasts
//! the results. Every other context turns the same calls into requests,
//! tracks them as pending until the host's answer (or a timeout) arrives,
//! and mirrors committed state from the wire.

use std::collections::BTreeMap;
use std::path::PathBuf;

use crew_bots_proto::{
    DespawnEvent, IdentityId, InstanceId, KillCause, KillEvent, ParticipantId,
    RequestKind, RequestRejected, ReviveConfirmed, ReviveRequest, SessionMessage, SpawnConfirmed,
    SpawnRequest, StateSnapshot, TeleportEvent, TransferDecision, TransferRequest, Vec3,
};

use crate::behavior::{Intent, Perception};
use crate::error::SessionError;
use crate::hooks::{execute_intent, BodyHooks};
use crate::identity::{
    AllocationOrder, IdentityCatalogue, IdentityRegistry, IdentitySelector, RegistryConfig,
    DEFAULT_MAX_IDENTITIES, DEFAULT_MIN_IDENTITIES,
};
use crate::journal::{Journal, SessionEventBody, SessionTick, DEFAULT_MAX_JOURNAL_EVENTS};
use crate::lifecycle::{LifecycleManager, SpawnParams, DEFAULT_MAX_SLOTS};
use crate::ownership::OwnershipAuthority;
use crate::persistence::{project, reconcile, PersistenceAdapter};
use crate::replication::{broadcast_message, decode_payload, send_message, SessionTransport};

/// Ticks a requester waits for a host decision before treating its own
/// request as rejected and resuming prior behavior.
pub const DEFAULT_REQUEST_TIMEOUT_TICKS: u64 = 200;

/// Periodic state snapshot cadence for owned instances; transitions are
/// broadcast immediately regardless.
pub const DEFAULT_SNAPSHOT_INTERVAL_TICKS: u64 = 10;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub session_id: String,
    pub max_slots: usize,
    pub min_identities: usize,
    pub max_identities: usize,
    pub order: AllocationOrder,
    pub catalogue_path: Option<PathBuf>,
    pub save_path: Option<PathBuf>,
    pub max_journal_events: usize,
    pub request_timeout_ticks: u64,
    pub snapshot_interval_ticks: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            session_id: "default".to_string(),
            max_slots: DEFAULT_MAX_SLOTS,
            min_identities: DEFAULT_MIN_IDENTITIES,
            max_identities: DEFAULT_MAX_IDENTITIES,
            order: AllocationOrder::InOrder,
            catalogue_path: None,
            save_path: None,
            max_journal_events: DEFAULT_MAX_JOURNAL_EVENTS,
            request_timeout_ticks: DEFAULT_REQUEST_TIMEOUT_TICKS,
            snapshot_interval_ticks: DEFAULT_SNAPSHOT_INTERVAL_TICKS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum PendingKind {
    Spawn { identity_id: IdentityId },
    Kill { instance_id: InstanceId },
    Revive { identity_id: IdentityId },
    Despawn { instance_id: InstanceId },
    Transfer { entity_id: InstanceId },
}

#[derive(Debug, Clone)]
struct PendingRequest {
    kind: PendingKind,
    issued_tick: SessionTick,
}

pub struct SessionContext<T: SessionTransport> {
    config: SessionConfig,
    transport: T,
    registry: IdentityRegistry,
    persistence: Option<PersistenceAdapter>,
    authority: OwnershipAuthority,
    lifecycle: LifecycleManager,
    journal: Journal,
    tick: SessionTick,
    pending: Vec<PendingRequest>,
}

impl<T: SessionTransport> SessionContext<T> {
    pub fn new(config: SessionConfig, transport: T) -> Self {
        let mut journal = Journal::new(config.max_journal_events);

        let (catalogue, rejects) = match &config.catalogue_path {
            Some(path) => IdentityCatalogue::load_toml(path),
            None => (IdentityCatalogue::builtin(), Vec::new()),
        };
        for reject in rejects {
            journal.append(
                0,
                SessionEventBody::CatalogueEntryRejected {
                    name: reject.name,
                    reason: reject.reason,
                },
            );
        }

        let mut registry = IdentityRegistry::load(
            &catalogue,
            &RegistryConfig {
                min_identities: config.min_identities,
                max_identities: config.max_identities,
                order: config.order,
            },
        );

        let persistence = config.save_path.clone().map(PersistenceAdapter::new);
        if let Some(adapter) = &persistence {
            let (records, fallback) = adapter.load_all();
            if let Some(reason) = fallback {
                journal.append(0, SessionEventBody::SaveFileFallback { reason });
            }
            reconcile(&mut registry, &records);
        }

        let authority = OwnershipAuthority::new(transport.host_participant());
        let lifecycle = LifecycleManager::new(config.max_slots);

        Self {
            config,
            transport,
            registry,
            persistence,
            authority,
            lifecycle,
            journal,
            tick: 0,
            pending: Vec::new(),
        }
    }

    pub fn is_host(&self) -> bool {
        self.transport.is_host()
    }

    pub fn session_id(&self) -> &str {
        &self.config.session_id
    }

    pub fn local_participant(&self) -> ParticipantId {
        self.transport.local_participant()
    }

    pub fn tick_count(&self) -> SessionTick {
        self.tick
    }

    pub fn registry(&self) -> &IdentityRegistry {
        &self.registry
    }

    pub fn authority(&self) -> &OwnershipAuthority {
        &self.authority
    }

    pub fn lifecycle(&self) -> &LifecycleManager {
        &self.lifecycle
    }

    pub fn journal(&self) -> &Journal {
        &self.journal
    }

    pub fn pending_requests(&self) -> usize {
        self.pending.len()
    }

    // ---------------------------------------------------------------------
    // Operations: committed on the host, requested everywhere else
    // ---------------------------------------------------------------------

    /// Spawns a bot. On the host this commits immediately and returns the
    /// confirmation; elsewhere it sends a request and returns `None` until
    /// the confirmation arrives through [`Self::tick`].
    pub fn spawn_bot(
        &mut self,
        selector: IdentitySelector,
        params: &SpawnParams,
    ) -> Result<Option<SpawnConfirmed>, SessionError> {
        if self.is_host() {
            let owner = self.local_participant();
            let confirmed = self.commit_spawn(owner, selector, params)?;
            broadcast_message(&self.transport, &SessionMessage::SpawnConfirmed(confirmed.clone()))?;
            return Ok(Some(confirmed));
        }
        let identity_id = match selector {
            IdentitySelector::Specific(identity_id) => identity_id,
            IdentitySelector::Next => self.next_local_candidate()?,
        };
        send_message(
            &self.transport,
            self.transport.host_participant(),
            &SessionMessage::SpawnRequest(SpawnRequest {
                identity_id,
                spawn_position: params.position,
                y_rotation: params.y_rotation,
                outside: params.outside,
                spawn_animation: params.spawn_animation,
                destroy_dead_body: params.destroy_dead_body,
            }),
        )?;
        self.pending.push(PendingRequest {
            kind: PendingKind::Spawn { identity_id },
            issued_tick: self.tick,
        });
        Ok(None)
    }

    pub fn kill_bot(
        &mut self,
        instance_id: InstanceId,
        cause: KillCause,
        body_velocity: Vec3,
        spawn_body: bool,
    ) -> Result<(), SessionError> {
        let event = KillEvent {
            instance_id,
            cause,
            body_velocity,
            spawn_body,
        };
        if self.is_host() {
            let event = self.commit_kill(&event)?;
            broadcast_message(&self.transport, &SessionMessage::Kill(event))?;
            return Ok(());
        }
        send_message(
            &self.transport,
            self.transport.host_participant(),
            &SessionMessage::Kill(event),
        )?;
        self.pending.push(PendingRequest {
            kind: PendingKind::Kill { instance_id },
            issued_tick: self.tick,
        });
        Ok(())
    }

    pub fn revive_bot(&mut self, identity_id: IdentityId, position: Vec3) -> Result<(), SessionError> {
        if self.is_host() {
            let owner = self.local_participant();
            let (spawn, revived) = self.commit_revive(owner, identity_id, position)?;
            broadcast_message(&self.transport, &SessionMessage::SpawnConfirmed(spawn))?;
            broadcast_message(&self.transport, &SessionMessage::ReviveConfirmed(revived))?;
            return Ok(());
        }
        // Local mark suppresses duplicate requests while the host decides.
        self.lifecycle.mark_for_revive(&mut self.registry, identity_id)?;
        send_message(
            &self.transport,
            self.transport.host_participant(),
            &SessionMessage::ReviveRequest(ReviveRequest {
                identity_id,
                position,
            }),
        )?;
        self.pending.push(PendingRequest {
            kind: PendingKind::Revive { identity_id },
            issued_tick: self.tick,
        });
        Ok(())
    }

    pub fn despawn_bot(&mut self, instance_id: InstanceId) -> Result<(), SessionError> {
        if self.is_host() {
            let event =
                self.lifecycle
                    .despawn(&mut self.registry, &mut self.authority, instance_id)?;
            self.journal
                .append(self.tick, SessionEventBody::Despawned { instance_id });
            broadcast_message(&self.transport, &SessionMessage::Despawn(event))?;
            return Ok(());
        }
        send_message(
            &self.transport,
            self.transport.host_participant(),
            &SessionMessage::Despawn(DespawnEvent { instance_id }),
        )?;
        self.pending.push(PendingRequest {
            kind: PendingKind::Despawn { instance_id },
            issued_tick: self.tick,
        });
        Ok(())
    }

    /// Requests ownership of an entity for the local participant.
    pub fn request_ownership(&mut self, entity_id: InstanceId) -> Result<(), SessionError> {
        let token = self
            .authority
            .token(entity_id)
            .copied()
            .ok_or(SessionError::EntityNotFound { entity_id })?;
        let request = TransferRequest {
            entity_id,
            from: token.owner,
            to: self.local_participant(),
            expected_generation: token.generation,
        };
        if self.is_host() {
            let decision = self.commit_transfer(&request)?;
            broadcast_message(&self.transport, &SessionMessage::TransferDecision(decision))?;
            return Ok(());
        }
        send_message(
            &self.transport,
            self.transport.host_participant(),
            &SessionMessage::TransferRequest(request),
        )?;
        self.pending.push(PendingRequest {
            kind: PendingKind::Transfer { entity_id },
            issued_tick: self.tick,
        });
        Ok(())
    }

    /// Moves a bot's body and tells everyone else to do the same. Issued by
    /// the owning participant (inverse teleports, ship recalls).
    pub fn teleport_bot<B: BodyHooks>(
        &mut self,
        hooks: &mut B,
        event: TeleportEvent,
    ) -> Result<(), SessionError> {
        if self.lifecycle.instance(event.instance_id).is_none() {
            return Err(SessionError::EntityNotFound {
                entity_id: event.instance_id,
            });
        }
        let local = self.local_participant();
        if self.authority.current_owner(event.instance_id) != Some(local) {
            return Err(SessionError::NotOwner {
                entity_id: event.instance_id,
                participant: local,
            });
        }
        hooks.teleport_body(event.instance_id, event.position, event.outside);
        broadcast_message(&self.transport, &SessionMessage::Teleport(event))
    }

    /// Records that a bot picked up an item. Item authority is never set
    /// directly; it derives from the holder's token, here and on every
    /// committed transfer.
    pub fn attach_item(
        &mut self,
        item_id: crew_bots_proto::ItemId,
        instance_id: InstanceId,
    ) -> Result<(), SessionError> {
        if !self.is_host() {
            return Err(SessionError::NotHost {
                participant: self.local_participant(),
            });
        }
        self.authority.attach_item(item_id, instance_id)?;
        if let Some(owner) = self.authority.item_authority(item_id) {
            self.journal.append(
                self.tick,
                SessionEventBody::ItemAuthorityDerived {
                    item_id,
                    holder: instance_id,
                    owner,
                },
            );
        }
        Ok(())
    }

    pub fn detach_item(&mut self, item_id: crew_bots_proto::ItemId) {
        self.authority.detach_item(item_id);
    }

    // ---------------------------------------------------------------------
    // Tick loop
    // ---------------------------------------------------------------------

    /// Advances the session one tick: drains the transport, applies or
    /// commits messages, reassigns entities of departed participants,
    /// evaluates owned behavior machines against `perceptions`, and expires
    /// pending requests. Returns the intents executed this tick.
    pub fn tick<B: BodyHooks>(
        &mut self,
        perceptions: &BTreeMap<InstanceId, Perception>,
        hooks: &mut B,
    ) -> Result<Vec<(InstanceId, Intent)>, SessionError> {
        self.tick += 1;

        for (sender, payload) in self.transport.drain_inbox() {
            match decode_payload(&payload) {
                Ok(message) => self.handle_message(sender, message, hooks)?,
                Err(_) => {
                    self.journal.append(
                        self.tick,
                        SessionEventBody::RequestRejected {
                            participant: sender,
                            reason: "undecodable payload".to_string(),
                        },
                    );
                }
            }
        }

        for participant in self.transport.drain_disconnects() {
            self.journal.append(
                self.tick,
                SessionEventBody::ParticipantDisconnected { participant },
            );
            if self.is_host() {
                for decision in self.authority.handle_disconnect(participant) {
                    self.lifecycle.apply_owner_change(decision.entity_id, decision.to);
                    self.journal.append(
                        self.tick,
                        SessionEventBody::OwnerReassigned {
                            entity_id: decision.entity_id,
                            from: decision.from,
                            to: decision.to,
                            generation: decision.generation,
                        },
                    );
                    broadcast_message(
                        &self.transport,
                        &SessionMessage::TransferDecision(decision),
                    )?;
                }
            }
        }

        let intents = self.tick_owned_machines(perceptions)?;
        for (instance_id, intent) in &intents {
            execute_intent(hooks, *instance_id, intent);
        }

        self.expire_pending();
        Ok(intents)
    }

    fn tick_owned_machines(
        &mut self,
        perceptions: &BTreeMap<InstanceId, Perception>,
    ) -> Result<Vec<(InstanceId, Intent)>, SessionError> {
        let local = self.local_participant();
        let owned: Vec<InstanceId> = self
            .lifecycle
            .instances()
            .filter(|instance| instance.owner == local)
            .map(|instance| instance.instance_id)
            .collect();

        let snapshot_due = self.config.snapshot_interval_ticks > 0
            && self.tick % self.config.snapshot_interval_ticks == 0;
        let mut intents = Vec::new();
        for instance_id in owned {
            let Some(perception) = perceptions.get(&instance_id) else {
                continue;
            };
            let mut transition = None;
            let mut snapshot = None;
            if let Some(instance) = self.lifecycle.instance_mut(instance_id) {
                transition = instance.machine.tick(perception);
                intents.push((instance_id, instance.machine.intent(perception)));
                if transition.is_some() || snapshot_due {
                    snapshot = Some(instance.machine.snapshot(instance_id, perception));
                }
            }
            if let Some(transition) = transition {
                self.journal.append(
                    self.tick,
                    SessionEventBody::StateChanged {
                        instance_id,
                        from: transition.from,
                        to: transition.to,
                    },
                );
            }
            if let Some(snapshot) = snapshot {
                broadcast_message(&self.transport, &SessionMessage::State(snapshot))?;
            }
        }
        Ok(intents)
    }

    fn expire_pending(&mut self) {
        let timeout = self.config.request_timeout_ticks;
        let tick = self.tick;
        let mut expired = Vec::new();
        self.pending.retain(|request| {
            if tick.saturating_sub(request.issued_tick) >= timeout {
                expired.push(request.kind.clone());
                false
            } else {
                true
            }
        });
        for kind in expired {
            if let PendingKind::Revive { identity_id } = kind {
                self.lifecycle.clear_revive_mark(&mut self.registry, identity_id);
            }
            self.journal.append(
                tick,
                SessionEventBody::RequestTimedOut {
                    description: format!("{kind:?}"),
                },
            );
        }
    }

    // ---------------------------------------------------------------------
    // Message handling
    // ---------------------------------------------------------------------

    fn handle_message<B: BodyHooks>(
        &mut self,
        sender: ParticipantId,
        message: SessionMessage,
        hooks: &mut B,
    ) -> Result<(), SessionError> {
        match message {
            // Requests reach the host untouched; non-hosts ignore them.
            SessionMessage::SpawnRequest(request) => {
                if self.is_host() {
                    self.host_handle_spawn_request(sender, &request)?;
                }
            }
            SessionMessage::ReviveRequest(request) => {
                if self.is_host() {
                    self.host_handle_revive_request(sender, &request)?;
                }
            }
            SessionMessage::TransferRequest(request) => {
                if self.is_host() {
                    let decision = self.commit_transfer(&request)?;
                    if decision.accepted {
                        broadcast_message(
                            &self.transport,
                            &SessionMessage::TransferDecision(decision),
                        )?;
                    } else {
                        send_message(
                            &self.transport,
                            sender,
                            &SessionMessage::TransferDecision(decision),
                        )?;
                    }
                }
            }
            SessionMessage::Kill(event) => {
                if self.is_host() {
                    // Non-host kill notifications are requests to commit.
                    match self.commit_kill(&event) {
                        Ok(event) => {
                            broadcast_message(&self.transport, &SessionMessage::Kill(event))?
                        }
                        Err(error) => self.reject_request(
                            sender,
                            RequestKind::Kill,
                            None,
                            Some(event.instance_id),
                            &error,
                        )?,
                    }
                } else if sender == self.transport.host_participant() {
                    hooks.play_terminal_animation(event.instance_id);
                    hooks.set_body_enabled(event.instance_id, false);
                    self.lifecycle
                        .apply_kill(&mut self.registry, &mut self.authority, &event);
                    self.pending.retain(|pending| {
                        pending.kind != PendingKind::Kill { instance_id: event.instance_id }
                    });
                }
            }
            SessionMessage::Despawn(event) => {
                if self.is_host() {
                    match self.lifecycle.despawn(
                        &mut self.registry,
                        &mut self.authority,
                        event.instance_id,
                    ) {
                        Ok(event) => {
                            self.journal.append(
                                self.tick,
                                SessionEventBody::Despawned {
                                    instance_id: event.instance_id,
                                },
                            );
                            broadcast_message(&self.transport, &SessionMessage::Despawn(event))?;
                        }
                        Err(error) => self.reject_request(
                            sender,
                            RequestKind::Despawn,
                            None,
                            Some(event.instance_id),
                            &error,
                        )?,
                    }
                } else if sender == self.transport.host_participant() {
                    hooks.set_body_enabled(event.instance_id, false);
                    self.lifecycle
                        .apply_despawn(&mut self.registry, &mut self.authority, &event);
                    self.pending.retain(|pending| {
                        pending.kind != PendingKind::Despawn { instance_id: event.instance_id }
                    });
                }
            }
            SessionMessage::SpawnConfirmed(confirmed) => {
                if sender == self.transport.host_participant() {
                    self.apply_spawn_confirmed(hooks, &confirmed);
                }
            }
            SessionMessage::ReviveConfirmed(confirmed) => {
                if sender == self.transport.host_participant() {
                    self.apply_revive_confirmed(&confirmed);
                }
            }
            SessionMessage::TransferDecision(decision) => {
                if sender == self.transport.host_participant() {
                    self.apply_transfer_decision(&decision);
                }
            }
            SessionMessage::State(snapshot) => {
                self.apply_state_snapshot(sender, &snapshot);
            }
            SessionMessage::Teleport(event) => {
                self.apply_teleport(hooks, &event);
            }
            SessionMessage::Disconnect(notice) => {
                // Transports without native disconnect detection relay the
                // notice as an ordinary message; the host path is shared.
                self.journal.append(
                    self.tick,
                    SessionEventBody::ParticipantDisconnected {
                        participant: notice.participant,
                    },
                );
                if self.is_host() {
                    for decision in self.authority.handle_disconnect(notice.participant) {
                        self.lifecycle.apply_owner_change(decision.entity_id, decision.to);
                        self.journal.append(
                            self.tick,
                            SessionEventBody::OwnerReassigned {
                                entity_id: decision.entity_id,
                                from: decision.from,
                                to: decision.to,
                                generation: decision.generation,
                            },
                        );
                        broadcast_message(
                            &self.transport,
                            &SessionMessage::TransferDecision(decision),
                        )?;
                    }
                }
            }
            SessionMessage::Rejected(rejection) => {
                self.apply_rejection(&rejection);
            }
        }
        Ok(())
    }

    fn host_handle_spawn_request(
        &mut self,
        sender: ParticipantId,
        request: &SpawnRequest,
    ) -> Result<(), SessionError> {
        let params = SpawnParams {
            position: request.spawn_position,
            y_rotation: request.y_rotation,
            outside: request.outside,
            spawn_animation: request.spawn_animation,
            destroy_dead_body: request.destroy_dead_body,
        };
        match self.commit_spawn(sender, IdentitySelector::Specific(request.identity_id), &params)
        {
            Ok(confirmed) => broadcast_message(
                &self.transport,
                &SessionMessage::SpawnConfirmed(confirmed),
            ),
            Err(error) => self.reject_request(
                sender,
                RequestKind::Spawn,
                Some(request.identity_id),
                None,
                &error,
            ),
        }
    }

    fn host_handle_revive_request(
        &mut self,
        sender: ParticipantId,
        request: &ReviveRequest,
    ) -> Result<(), SessionError> {
        match self.commit_revive(sender, request.identity_id, request.position) {
            Ok((spawn, revived)) => {
                broadcast_message(&self.transport, &SessionMessage::SpawnConfirmed(spawn))?;
                broadcast_message(&self.transport, &SessionMessage::ReviveConfirmed(revived))
            }
            Err(error) => self.reject_request(
                sender,
                RequestKind::Revive,
                Some(request.identity_id),
                None,
                &error,
            ),
        }
    }

    fn reject_request(
        &mut self,
        requester: ParticipantId,
        kind: RequestKind,
        identity_id: Option<IdentityId>,
        instance_id: Option<InstanceId>,
        error: &SessionError,
    ) -> Result<(), SessionError> {
        let reason = format!("{error:?}");
        self.journal.append(
            self.tick,
            SessionEventBody::RequestRejected {
                participant: requester,
                reason: reason.clone(),
            },
        );
        send_message(
            &self.transport,
            requester,
            &SessionMessage::Rejected(RequestRejected {
                kind,
                identity_id,
                instance_id,
                code: error.code(),
                reason,
            }),
        )
    }

    // ---------------------------------------------------------------------
    // Host commits
    // ---------------------------------------------------------------------

    fn commit_spawn(
        &mut self,
        owner: ParticipantId,
        selector: IdentitySelector,
        params: &SpawnParams,
    ) -> Result<SpawnConfirmed, SessionError> {
        let identity_id = self.registry.allocate(selector)?;
        self.journal
            .append(self.tick, SessionEventBody::IdentityAllocated { identity_id });
        match self
            .lifecycle
            .spawn(&mut self.registry, &mut self.authority, owner, identity_id, params)
        {
            Ok(confirmed) => {
                self.journal.append(
                    self.tick,
                    SessionEventBody::Spawned {
                        identity_id,
                        instance_id: confirmed.instance_id,
                        owner,
                    },
                );
                Ok(confirmed)
            }
            Err(error) => {
                self.registry.release(identity_id);
                self.journal
                    .append(self.tick, SessionEventBody::IdentityReleased { identity_id });
                Err(error)
            }
        }
    }

    fn commit_kill(&mut self, event: &KillEvent) -> Result<KillEvent, SessionError> {
        let committed = self.lifecycle.kill(
            &mut self.registry,
            &mut self.authority,
            event.instance_id,
            event.cause,
            event.body_velocity,
            event.spawn_body,
        )?;
        self.journal.append(
            self.tick,
            SessionEventBody::Killed {
                instance_id: committed.instance_id,
                cause: committed.cause,
            },
        );
        Ok(committed)
    }

    fn commit_revive(
        &mut self,
        owner: ParticipantId,
        identity_id: IdentityId,
        position: Vec3,
    ) -> Result<(SpawnConfirmed, ReviveConfirmed), SessionError> {
        let (spawn, revived) =
            self.lifecycle
                .revive(&mut self.registry, &mut self.authority, owner, identity_id, position)?;
        self.journal.append(
            self.tick,
            SessionEventBody::Revived {
                identity_id,
                instance_id: revived.instance_id,
                restored_hp: revived.restored_hp,
            },
        );
        Ok((spawn, revived))
    }

    fn commit_transfer(&mut self, request: &TransferRequest) -> Result<TransferDecision, SessionError> {
        let decision = self.authority.request_transfer(request);
        if decision.accepted {
            self.lifecycle.apply_owner_change(decision.entity_id, decision.to);
            self.journal.append(
                self.tick,
                SessionEventBody::TransferCommitted {
                    entity_id: decision.entity_id,
                    from: decision.from,
                    to: decision.to,
                    generation: decision.generation,
                },
            );
            for item_id in self.authority.items_held_by(decision.entity_id) {
                self.journal.append(
                    self.tick,
                    SessionEventBody::ItemAuthorityDerived {
                        item_id,
                        holder: decision.entity_id,
                        owner: decision.to,
                    },
                );
            }
        } else {
            self.journal.append(
                self.tick,
                SessionEventBody::TransferRejected {
                    entity_id: decision.entity_id,
                    reason: decision.reason.clone().unwrap_or_default(),
                },
            );
        }
        Ok(decision)
    }

    // ---------------------------------------------------------------------
    // Replica application
    // ---------------------------------------------------------------------

    fn apply_spawn_confirmed<B: BodyHooks>(&mut self, hooks: &mut B, confirmed: &SpawnConfirmed) {
        self.lifecycle
            .apply_spawn_confirmed(&mut self.registry, &mut self.authority, confirmed);
        hooks.set_body_enabled(confirmed.instance_id, true);
        hooks.teleport_body(
            confirmed.instance_id,
            confirmed.spawn_position,
            Some(confirmed.outside),
        );
        self.journal.append(
            self.tick,
            SessionEventBody::Spawned {
                identity_id: confirmed.identity_id,
                instance_id: confirmed.instance_id,
                owner: confirmed.owner,
            },
        );
        self.pending.retain(|pending| {
            pending.kind
                != PendingKind::Spawn {
                    identity_id: confirmed.identity_id,
                }
        });
    }

    fn apply_revive_confirmed(&mut self, confirmed: &ReviveConfirmed) {
        self.lifecycle.apply_revive(&mut self.registry, confirmed);
        self.journal.append(
            self.tick,
            SessionEventBody::Revived {
                identity_id: confirmed.identity_id,
                instance_id: confirmed.instance_id,
                restored_hp: confirmed.restored_hp,
            },
        );
        self.pending.retain(|pending| {
            pending.kind
                != PendingKind::Revive {
                    identity_id: confirmed.identity_id,
                }
        });
    }

    fn apply_transfer_decision(&mut self, decision: &TransferDecision) {
        if decision.accepted {
            if self.authority.apply_decision(decision) {
                self.lifecycle.apply_owner_change(decision.entity_id, decision.to);
                self.journal.append(
                    self.tick,
                    SessionEventBody::TransferCommitted {
                        entity_id: decision.entity_id,
                        from: decision.from,
                        to: decision.to,
                        generation: decision.generation,
                    },
                );
            } else {
                self.journal.append(
                    self.tick,
                    SessionEventBody::StaleMessageDiscarded {
                        entity_id: decision.entity_id,
                        generation: decision.generation,
                    },
                );
            }
        } else {
            self.journal.append(
                self.tick,
                SessionEventBody::TransferRejected {
                    entity_id: decision.entity_id,
                    reason: decision.reason.clone().unwrap_or_default(),
                },
            );
        }
        self.pending.retain(|pending| {
            pending.kind
                != PendingKind::Transfer {
                    entity_id: decision.entity_id,
                }
        });
    }

    fn apply_state_snapshot(&mut self, sender: ParticipantId, snapshot: &StateSnapshot) {
        // Snapshots are authoritative only when they come from the current
        // owner; anything else is a straggler from a previous owner.
        let Some(instance) = self.lifecycle.instance(snapshot.instance_id) else {
            self.journal.append(
                self.tick,
                SessionEventBody::UnknownEntityMessage {
                    entity_id: snapshot.instance_id,
                },
            );
            return;
        };
        if instance.owner != sender || instance.owner == self.local_participant() {
            self.journal.append(
                self.tick,
                SessionEventBody::StaleMessageDiscarded {
                    entity_id: snapshot.instance_id,
                    generation: self
                        .authority
                        .token(snapshot.instance_id)
                        .map(|token| token.generation)
                        .unwrap_or(0),
                },
            );
            return;
        }
        if let Some(instance) = self.lifecycle.instance_mut(snapshot.instance_id) {
            instance.machine.apply_snapshot(snapshot);
        }
    }

    fn apply_teleport<B: BodyHooks>(&mut self, hooks: &mut B, event: &TeleportEvent) {
        if self.lifecycle.instance(event.instance_id).is_none() {
            self.journal.append(
                self.tick,
                SessionEventBody::UnknownEntityMessage {
                    entity_id: event.instance_id,
                },
            );
            return;
        }
        hooks.teleport_body(event.instance_id, event.position, event.outside);
    }

    fn apply_rejection(&mut self, rejection: &RequestRejected) {
        self.journal.append(
            self.tick,
            SessionEventBody::RequestRejected {
                participant: self.local_participant(),
                reason: rejection.reason.clone(),
            },
        );
        if rejection.kind == RequestKind::Revive {
            if let Some(identity_id) = rejection.identity_id {
                self.lifecycle.clear_revive_mark(&mut self.registry, identity_id);
            }
        }
        self.pending.retain(|pending| match (&pending.kind, rejection.kind) {
            (PendingKind::Spawn { identity_id }, RequestKind::Spawn) => {
                Some(*identity_id) != rejection.identity_id
            }
            (PendingKind::Revive { identity_id }, RequestKind::Revive) => {
                Some(*identity_id) != rejection.identity_id
            }
            (PendingKind::Kill { instance_id }, RequestKind::Kill) => {
                Some(*instance_id) != rejection.instance_id
            }
            (PendingKind::Despawn { instance_id }, RequestKind::Despawn) => {
                Some(*instance_id) != rejection.instance_id
            }
            _ => true,
        });
    }

    // ---------------------------------------------------------------------
    // Persistence checkpoints
    // ---------------------------------------------------------------------

    /// Writes every identity's progress to the save file. Only meaningful
    /// on the host, whose registry is authoritative.
    pub fn checkpoint(&mut self) -> Result<(), SessionError> {
        let Some(adapter) = &self.persistence else {
            return Ok(());
        };
        let records = project(&self.registry);
        let count = records.len();
        adapter.save_all(records)?;
        self.journal
            .append(self.tick, SessionEventBody::SaveCheckpoint { records: count });
        Ok(())
    }

    pub fn session_end(&mut self) -> Result<(), SessionError> {
        self.checkpoint()
    }

    fn next_local_candidate(&self) -> Result<IdentityId, SessionError> {
        self.registry
            .identities()
            .find(|identity| {
                identity.status == crate::identity::IdentityStatus::Alive
                    && self.lifecycle.instance_of_identity(identity.identity_id).is_none()
            })
            .map(|identity| identity.identity_id)
            .ok_or(SessionError::IdentityPoolExhausted {
                capacity: self.registry.capacity(),
            })
    }
}
