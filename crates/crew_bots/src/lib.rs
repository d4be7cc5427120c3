pub mod behavior;
pub mod error;
pub mod hooks;
pub mod identity;
pub mod journal;
pub mod lifecycle;
pub mod ownership;
pub mod persistence;
pub mod replication;
pub mod session;
pub mod util;

pub use behavior::{
    BehaviorMachine, HeldItem, Intent, ItemKind, Perception, Transition, TransitionRule,
    BRAINDEAD_SETTLE_TICKS, CLOSE_ENOUGH_M, FEAR_DECAY, FEAR_DECAY_TZP, FEAR_RISE_ENEMY,
    FEAR_RISE_HAZARD, INVERSE_TELEPORT_TICKS, LOCKED_DOOR_WAIT_TICKS, LOSE_SIGHT_M,
    LOST_PLAYER_GRACE_TICKS, MISSION_CONTROL_TICKS, PANIC_ENTER_THRESHOLD, PANIC_EXIT_THRESHOLD,
    SEARCH_GIVE_UP_TICKS, SHIP_RESTLESS_TICKS, TOO_FAR_M, TZP_INHALE_TICKS,
};
pub use error::SessionError;
pub use hooks::{execute_intent, refresh_perception, BodyHooks, NullHooks, PerceptionHooks};
pub use identity::{
    AllocationOrder, CatalogueEntry, CatalogueReject, Identity, IdentityCatalogue,
    IdentityRegistry, IdentitySelector, IdentityStatus, RegistryConfig, SuitMode, VoiceProfile,
    DEFAULT_MAX_HP, DEFAULT_MAX_IDENTITIES, DEFAULT_MIN_IDENTITIES,
};
pub use journal::{
    Journal, JournalFilter, SessionEvent, SessionEventBody, SessionEventId, SessionTick,
    DEFAULT_MAX_JOURNAL_EVENTS,
};
pub use lifecycle::{
    BotInstance, DeadBody, LifecycleManager, SpawnParams, DEFAULT_MAX_SLOTS,
};
pub use ownership::{OwnershipAuthority, OwnershipToken};
pub use persistence::{project, reconcile, PersistenceAdapter, SaveFile, SaveRecord, SAVE_VERSION};
pub use replication::{
    broadcast_message, decode_payload, send_message, InMemoryHub, InMemoryTransport,
    SessionTransport,
};
pub use session::{
    SessionConfig, SessionContext, DEFAULT_REQUEST_TIMEOUT_TICKS, DEFAULT_SNAPSHOT_INTERVAL_TICKS,
};
