use std::io;

use crew_bots_proto::{ErrorCode, IdentityId, InstanceId, ParticipantId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    IdentityNotFound {
        identity_id: IdentityId,
    },
    IdentityPoolExhausted {
        capacity: usize,
    },
    IdentityAlreadyLive {
        identity_id: IdentityId,
    },
    IdentityDead {
        identity_id: IdentityId,
    },
    IdentityNotDead {
        identity_id: IdentityId,
    },
    ReviveAlreadySelected {
        identity_id: IdentityId,
    },
    NoFreeSlot {
        max_slots: usize,
    },
    EntityNotFound {
        entity_id: InstanceId,
    },
    EntityAlreadyRegistered {
        entity_id: InstanceId,
    },
    NotOwner {
        entity_id: InstanceId,
        participant: ParticipantId,
    },
    GenerationOverflow {
        entity_id: InstanceId,
    },
    NotHost {
        participant: ParticipantId,
    },
    ParticipantUnknown {
        participant: ParticipantId,
    },
    Io(String),
    Serde(String),
}

impl SessionError {
    /// Wire-level error class of the failure, for requesters deciding
    /// whether a retry is worthwhile.
    pub fn code(&self) -> ErrorCode {
        match self {
            SessionError::IdentityNotFound { .. }
            | SessionError::EntityNotFound { .. }
            | SessionError::ParticipantUnknown { .. } => ErrorCode::ErrNotFound,
            SessionError::IdentityPoolExhausted { .. } | SessionError::NoFreeSlot { .. } => {
                ErrorCode::ErrCapacity
            }
            SessionError::IdentityAlreadyLive { .. }
            | SessionError::IdentityDead { .. }
            | SessionError::IdentityNotDead { .. }
            | SessionError::ReviveAlreadySelected { .. }
            | SessionError::EntityAlreadyRegistered { .. }
            | SessionError::NotOwner { .. } => ErrorCode::ErrConflict,
            SessionError::GenerationOverflow { .. } => ErrorCode::ErrStale,
            SessionError::NotHost { .. } => ErrorCode::ErrNotHost,
            SessionError::Io(_) | SessionError::Serde(_) => ErrorCode::ErrMalformed,
        }
    }
}

impl From<io::Error> for SessionError {
    fn from(error: io::Error) -> Self {
        SessionError::Io(error.to_string())
    }
}

impl From<serde_json::Error> for SessionError {
    fn from(error: serde_json::Error) -> Self {
        SessionError::Serde(error.to_string())
    }
}

impl From<serde_cbor::Error> for SessionError {
    fn from(error: serde_cbor::Error) -> Self {
        SessionError::Serde(error.to_string())
    }
}
