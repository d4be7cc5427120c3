//! Wire-message contracts for the companion-bot session protocol.
//!
//! All messages are transport-agnostic CBOR payloads. The host is the only
//! participant that commits authoritative decisions; every other message is
//! either a request or a replicated fact.

use serde::{Deserialize, Serialize};

pub const WIRE_ENCODING_CBOR: &str = "cbor";

pub const TOPIC_PREFIX: &str = "cb";
pub const TOPIC_LIFECYCLE_SUFFIX: &str = "lifecycle";
pub const TOPIC_OWNERSHIP_SUFFIX: &str = "ownership";
pub const TOPIC_STATE_SUFFIX: &str = "state";

/// Numeric id of a human participant in the session. The host is a
/// participant like any other; which id is the host is a transport query.
pub type ParticipantId = u64;
/// Catalogue id of a bot identity (template + progress record).
pub type IdentityId = u32;
/// Id of a live bot instance; doubles as the ownership entity id.
pub type InstanceId = u64;
/// Id of an item a bot can hold.
pub type ItemId = u64;
/// Monotonic per-entity ownership version. Strictly increases on every
/// committed transfer; stale generations are discarded by all receivers.
pub type Generation = u64;

/// Bot body ids live far above participant ids so a body id alone tells
/// receivers whether a human or a bot is behind it.
pub const BOT_BODY_ID_OFFSET: u64 = 1_000_000;

pub fn session_topic(session_id: &str, suffix: &str) -> String {
    format!("{TOPIC_PREFIX}.{session_id}.{suffix}")
}

pub fn topic_lifecycle(session_id: &str) -> String {
    session_topic(session_id, TOPIC_LIFECYCLE_SUFFIX)
}

pub fn topic_ownership(session_id: &str) -> String {
    session_topic(session_id, TOPIC_OWNERSHIP_SUFFIX)
}

pub fn topic_state(session_id: &str) -> String {
    session_topic(session_id, TOPIC_STATE_SUFFIX)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Vec3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vec3 {
    pub fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SpawnAnimationKind {
    None,
    DropFromCeiling,
    WalkIn,
    RagdollRecover,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum KillCause {
    Enemy,
    Hazard,
    Gravity,
    Abandoned,
    Unknown,
}

/// Behavior states shared on the wire. The owning participant's machine is
/// the only writer; everyone else applies these from [`StateSnapshot`]s.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BehaviorState {
    BrainDead,
    SearchingForPlayer,
    GetCloseToPlayer,
    JustLostPlayer,
    ChillWithPlayer,
    FetchingObject,
    PlayerInCruiser,
    Panik,
    ReturnToShip,
    ChillAtShip,
    SearchingForScrap,
    UseInverseTeleport,
    UseKeyOnLockedDoor,
    MissionControl,
    SellScrap,
    CollectScrapToSell,
    FightEnemy,
    ChargeHeldItem,
    UseTzpInhalant,
    LostInFacility,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpawnRequest {
    pub identity_id: IdentityId,
    pub spawn_position: Vec3,
    pub y_rotation: f32,
    pub outside: bool,
    pub spawn_animation: SpawnAnimationKind,
    pub destroy_dead_body: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpawnConfirmed {
    pub identity_id: IdentityId,
    pub instance_id: InstanceId,
    pub slot: u32,
    pub owner: ParticipantId,
    pub generation: Generation,
    pub spawn_position: Vec3,
    pub y_rotation: f32,
    pub outside: bool,
    pub spawn_animation: SpawnAnimationKind,
    pub destroy_dead_body: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRequest {
    pub entity_id: InstanceId,
    pub from: ParticipantId,
    pub to: ParticipantId,
    /// Generation the requester last saw for the entity. The host rejects
    /// the request when its committed generation has already moved past it.
    pub expected_generation: Generation,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferDecision {
    pub entity_id: InstanceId,
    pub from: ParticipantId,
    pub to: ParticipantId,
    pub generation: Generation,
    pub accepted: bool,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KillEvent {
    pub instance_id: InstanceId,
    pub cause: KillCause,
    pub body_velocity: Vec3,
    pub spawn_body: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviveRequest {
    pub identity_id: IdentityId,
    pub position: Vec3,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviveConfirmed {
    pub identity_id: IdentityId,
    pub instance_id: InstanceId,
    pub position: Vec3,
    pub restored_hp: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DespawnEvent {
    pub instance_id: InstanceId,
}

/// Coarse perception summary carried by periodic state snapshots so a new
/// owner can resume evaluation without resetting to BrainDead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerceptionSummary {
    pub fear_level: f32,
    #[serde(default)]
    pub assigned_player: Option<ParticipantId>,
    #[serde(default)]
    pub held_item: Option<ItemId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub instance_id: InstanceId,
    pub state: BehaviorState,
    pub perception: PerceptionSummary,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TeleportEvent {
    pub instance_id: InstanceId,
    pub position: Vec3,
    #[serde(default)]
    pub outside: Option<bool>,
    pub allow_interact: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisconnectNotice {
    pub participant: ParticipantId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestKind {
    Spawn,
    Kill,
    Revive,
    Despawn,
}

/// Sent by the host to a single requester when a non-transfer request
/// cannot be committed. Transfers carry their verdict in
/// [`TransferDecision`] instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestRejected {
    pub kind: RequestKind,
    pub identity_id: Option<IdentityId>,
    pub instance_id: Option<InstanceId>,
    pub code: ErrorCode,
    pub reason: String,
}

/// Every message the session protocol puts on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "body")]
pub enum SessionMessage {
    SpawnRequest(SpawnRequest),
    SpawnConfirmed(SpawnConfirmed),
    TransferRequest(TransferRequest),
    TransferDecision(TransferDecision),
    Kill(KillEvent),
    ReviveRequest(ReviveRequest),
    ReviveConfirmed(ReviveConfirmed),
    Despawn(DespawnEvent),
    State(StateSnapshot),
    Teleport(TeleportEvent),
    Disconnect(DisconnectNotice),
    Rejected(RequestRejected),
}

pub fn encode_message(message: &SessionMessage) -> Result<Vec<u8>, serde_cbor::Error> {
    serde_cbor::to_vec(message)
}

pub fn decode_message(bytes: &[u8]) -> Result<SessionMessage, serde_cbor::Error> {
    serde_cbor::from_slice(bytes)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    ErrNotFound,
    ErrCapacity,
    ErrConflict,
    ErrStale,
    ErrNotHost,
    ErrMalformed,
    ErrTimeout,
}

impl ErrorCode {
    pub fn retryable(self) -> bool {
        matches!(self, ErrorCode::ErrCapacity | ErrorCode::ErrTimeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_helpers_match_expected_format() {
        assert_eq!(topic_lifecycle("s1"), "cb.s1.lifecycle");
        assert_eq!(topic_ownership("s1"), "cb.s1.ownership");
        assert_eq!(topic_state("s1"), "cb.s1.state");
    }

    #[test]
    fn cbor_round_trip_transfer_decision() {
        let decision = SessionMessage::TransferDecision(TransferDecision {
            entity_id: 7,
            from: 1,
            to: 2,
            generation: 5,
            accepted: true,
            reason: None,
        });
        let encoded = encode_message(&decision).expect("encode decision");
        let decoded = decode_message(&encoded).expect("decode decision");
        assert_eq!(decoded, decision);
    }

    #[test]
    fn cbor_round_trip_spawn_confirmed() {
        let spawn = SessionMessage::SpawnConfirmed(SpawnConfirmed {
            identity_id: 3,
            instance_id: 1_000_000,
            slot: 0,
            owner: 1,
            generation: 1,
            spawn_position: Vec3::new(1.0, 0.0, -4.5),
            y_rotation: 90.0,
            outside: true,
            spawn_animation: SpawnAnimationKind::WalkIn,
            destroy_dead_body: false,
        });
        let encoded = encode_message(&spawn).expect("encode spawn");
        let decoded = decode_message(&encoded).expect("decode spawn");
        assert_eq!(decoded, spawn);
    }

    #[test]
    fn cbor_round_trip_state_snapshot() {
        let snapshot = SessionMessage::State(StateSnapshot {
            instance_id: 1_000_002,
            state: BehaviorState::Panik,
            perception: PerceptionSummary {
                fear_level: 0.8,
                assigned_player: Some(4),
                held_item: None,
            },
        });
        let encoded = encode_message(&snapshot).expect("encode snapshot");
        let decoded = decode_message(&encoded).expect("decode snapshot");
        assert_eq!(decoded, snapshot);
    }

    #[test]
    fn error_code_retryable_covers_transient_conditions() {
        assert!(ErrorCode::ErrCapacity.retryable());
        assert!(ErrorCode::ErrTimeout.retryable());
        assert!(!ErrorCode::ErrStale.retryable());
        assert!(!ErrorCode::ErrNotFound.retryable());
    }

    #[test]
    fn teleport_event_tolerates_missing_outside_flag() {
        // Older senders omit `outside`; decode must default it to None.
        let full = TeleportEvent {
            instance_id: 1_000_000,
            position: Vec3::new(0.0, 2.0, 0.0),
            outside: None,
            allow_interact: true,
        };
        let encoded = serde_cbor::to_vec(&full).expect("encode teleport");
        let decoded: TeleportEvent = serde_cbor::from_slice(&encoded).expect("decode teleport");
        assert_eq!(decoded, full);
    }
}
