//! Bounded in-session event journal.
//!
//! The session records every lifecycle effect, ownership decision, and
//! fallback (malformed catalogue entry, corrupt save, stale discard) here.
//! Oldest events are evicted once the cap is reached; the eviction count is
//! kept so operators can tell the log is truncated.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use crew_bots_proto::{
    BehaviorState, Generation, IdentityId, InstanceId, ItemId, KillCause, ParticipantId,
};

pub type SessionTick = u64;
pub type SessionEventId = u64;

pub const DEFAULT_MAX_JOURNAL_EVENTS: usize = 4_096;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SessionEventBody {
    CatalogueEntryRejected {
        name: String,
        reason: String,
    },
    CatalogueFileFallback {
        reason: String,
    },
    SaveFileFallback {
        reason: String,
    },
    SaveCheckpoint {
        records: usize,
    },
    IdentityAllocated {
        identity_id: IdentityId,
    },
    IdentityReleased {
        identity_id: IdentityId,
    },
    Spawned {
        identity_id: IdentityId,
        instance_id: InstanceId,
        owner: ParticipantId,
    },
    Despawned {
        instance_id: InstanceId,
    },
    Killed {
        instance_id: InstanceId,
        cause: KillCause,
    },
    Revived {
        identity_id: IdentityId,
        instance_id: InstanceId,
        restored_hp: u32,
    },
    TransferCommitted {
        entity_id: InstanceId,
        from: ParticipantId,
        to: ParticipantId,
        generation: Generation,
    },
    TransferRejected {
        entity_id: InstanceId,
        reason: String,
    },
    OwnerReassigned {
        entity_id: InstanceId,
        from: ParticipantId,
        to: ParticipantId,
        generation: Generation,
    },
    ItemAuthorityDerived {
        item_id: ItemId,
        holder: InstanceId,
        owner: ParticipantId,
    },
    StaleMessageDiscarded {
        entity_id: InstanceId,
        generation: Generation,
    },
    UnknownEntityMessage {
        entity_id: InstanceId,
    },
    RequestRejected {
        participant: ParticipantId,
        reason: String,
    },
    RequestTimedOut {
        description: String,
    },
    StateChanged {
        instance_id: InstanceId,
        from: BehaviorState,
        to: BehaviorState,
    },
    ParticipantDisconnected {
        participant: ParticipantId,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionEvent {
    pub id: SessionEventId,
    pub tick: SessionTick,
    pub body: SessionEventBody,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JournalFilter {
    pub instance_id: Option<InstanceId>,
    pub since_tick: Option<SessionTick>,
}

impl JournalFilter {
    pub fn matches(&self, event: &SessionEvent) -> bool {
        if let Some(since) = self.since_tick {
            if event.tick < since {
                return false;
            }
        }
        match self.instance_id {
            None => true,
            Some(wanted) => event_instance(&event.body) == Some(wanted),
        }
    }
}

fn event_instance(body: &SessionEventBody) -> Option<InstanceId> {
    match body {
        SessionEventBody::Spawned { instance_id, .. }
        | SessionEventBody::Despawned { instance_id }
        | SessionEventBody::Killed { instance_id, .. }
        | SessionEventBody::Revived { instance_id, .. }
        | SessionEventBody::StateChanged { instance_id, .. } => Some(*instance_id),
        SessionEventBody::TransferCommitted { entity_id, .. }
        | SessionEventBody::TransferRejected { entity_id, .. }
        | SessionEventBody::OwnerReassigned { entity_id, .. }
        | SessionEventBody::StaleMessageDiscarded { entity_id, .. }
        | SessionEventBody::UnknownEntityMessage { entity_id } => Some(*entity_id),
        SessionEventBody::ItemAuthorityDerived { holder, .. } => Some(*holder),
        _ => None,
    }
}

#[derive(Debug, Clone)]
pub struct Journal {
    events: VecDeque<SessionEvent>,
    max_events: usize,
    next_id: SessionEventId,
    evicted: u64,
}

impl Journal {
    pub fn new(max_events: usize) -> Self {
        Self {
            events: VecDeque::new(),
            max_events: max_events.max(1),
            next_id: 1,
            evicted: 0,
        }
    }

    pub fn append(&mut self, tick: SessionTick, body: SessionEventBody) -> SessionEventId {
        let id = self.next_id;
        self.next_id = self.next_id.saturating_add(1);
        self.events.push_back(SessionEvent { id, tick, body });
        while self.events.len() > self.max_events {
            self.events.pop_front();
            self.evicted += 1;
        }
        id
    }

    pub fn events(&self) -> impl Iterator<Item = &SessionEvent> {
        self.events.iter()
    }

    pub fn filtered(&self, filter: &JournalFilter) -> Vec<SessionEvent> {
        self.events
            .iter()
            .filter(|event| filter.matches(event))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn evicted(&self) -> u64 {
        self.evicted
    }
}

impl Default for Journal {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_JOURNAL_EVENTS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn journal_evicts_oldest_beyond_cap() {
        let mut journal = Journal::new(2);
        journal.append(1, SessionEventBody::Despawned { instance_id: 1 });
        journal.append(2, SessionEventBody::Despawned { instance_id: 2 });
        journal.append(3, SessionEventBody::Despawned { instance_id: 3 });
        assert_eq!(journal.len(), 2);
        assert_eq!(journal.evicted(), 1);
        let ids: Vec<_> = journal.events().map(|event| event.id).collect();
        assert_eq!(ids, vec![2, 3]);
    }

    #[test]
    fn filter_by_instance_and_tick() {
        let mut journal = Journal::default();
        journal.append(1, SessionEventBody::Despawned { instance_id: 7 });
        journal.append(5, SessionEventBody::Despawned { instance_id: 8 });
        journal.append(
            9,
            SessionEventBody::Killed {
                instance_id: 7,
                cause: KillCause::Hazard,
            },
        );

        let filter = JournalFilter {
            instance_id: Some(7),
            since_tick: Some(2),
        };
        let matched = journal.filtered(&filter);
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].tick, 9);
    }
}
