//! Session transport abstraction and the in-memory hub used by tests.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};

use crew_bots_proto::{decode_message, encode_message, ParticipantId, SessionMessage};

use crate::error::SessionError;

/// Reliable, ordered messaging between session participants. Any transport
/// with per-sender ordering satisfies the contract; delivery of a unicast
/// to an unknown participant is a [`SessionError::ParticipantUnknown`].
pub trait SessionTransport {
    fn local_participant(&self) -> ParticipantId;
    fn host_participant(&self) -> ParticipantId;
    fn participants(&self) -> Vec<ParticipantId>;
    fn send(&self, target: ParticipantId, payload: &[u8]) -> Result<(), SessionError>;
    fn broadcast(&self, payload: &[u8]) -> Result<(), SessionError>;
    /// All payloads queued for the local participant, in arrival order,
    /// tagged with the sending participant.
    fn drain_inbox(&self) -> Vec<(ParticipantId, Vec<u8>)>;
    /// Participants the transport has observed dropping since the last call.
    fn drain_disconnects(&self) -> Vec<ParticipantId>;

    fn is_host(&self) -> bool {
        self.local_participant() == self.host_participant()
    }
}

pub fn send_message<T: SessionTransport>(
    transport: &T,
    target: ParticipantId,
    message: &SessionMessage,
) -> Result<(), SessionError> {
    let payload = encode_message(message)?;
    transport.send(target, &payload)
}

pub fn broadcast_message<T: SessionTransport>(
    transport: &T,
    message: &SessionMessage,
) -> Result<(), SessionError> {
    let payload = encode_message(message)?;
    transport.broadcast(&payload)
}

pub fn decode_payload(payload: &[u8]) -> Result<SessionMessage, SessionError> {
    Ok(decode_message(payload)?)
}

#[derive(Default)]
struct HubState {
    inboxes: BTreeMap<ParticipantId, VecDeque<(ParticipantId, Vec<u8>)>>,
    disconnect_queues: BTreeMap<ParticipantId, Vec<ParticipantId>>,
}

/// Shared in-memory fabric connecting [`InMemoryTransport`] endpoints.
/// Delivery is synchronous and ordered, which makes multi-participant
/// scenarios deterministic.
#[derive(Clone, Default)]
pub struct InMemoryHub {
    host: ParticipantId,
    state: Arc<Mutex<HubState>>,
}

impl InMemoryHub {
    pub fn new(host: ParticipantId) -> Self {
        let hub = Self {
            host,
            state: Arc::new(Mutex::new(HubState::default())),
        };
        hub.attach(host);
        hub
    }

    /// Joins a participant and returns its endpoint.
    pub fn attach(&self, participant: ParticipantId) -> InMemoryTransport {
        let mut state = self.state.lock().expect("lock hub");
        state.inboxes.entry(participant).or_default();
        state.disconnect_queues.entry(participant).or_default();
        InMemoryTransport {
            participant,
            hub: self.clone(),
        }
    }

    /// Removes a participant; its queued mail is dropped and every remaining
    /// endpoint observes the disconnect on its next drain.
    pub fn disconnect(&self, participant: ParticipantId) {
        let mut state = self.state.lock().expect("lock hub");
        state.inboxes.remove(&participant);
        state.disconnect_queues.remove(&participant);
        for queue in state.disconnect_queues.values_mut() {
            queue.push(participant);
        }
    }

    pub fn participants(&self) -> Vec<ParticipantId> {
        let state = self.state.lock().expect("lock hub");
        state.inboxes.keys().copied().collect()
    }
}

#[derive(Clone)]
pub struct InMemoryTransport {
    participant: ParticipantId,
    hub: InMemoryHub,
}

impl SessionTransport for InMemoryTransport {
    fn local_participant(&self) -> ParticipantId {
        self.participant
    }

    fn host_participant(&self) -> ParticipantId {
        self.hub.host
    }

    fn participants(&self) -> Vec<ParticipantId> {
        self.hub.participants()
    }

    fn send(&self, target: ParticipantId, payload: &[u8]) -> Result<(), SessionError> {
        let mut state = self.hub.state.lock().expect("lock hub");
        let inbox = state
            .inboxes
            .get_mut(&target)
            .ok_or(SessionError::ParticipantUnknown {
                participant: target,
            })?;
        inbox.push_back((self.participant, payload.to_vec()));
        Ok(())
    }

    fn broadcast(&self, payload: &[u8]) -> Result<(), SessionError> {
        let mut state = self.hub.state.lock().expect("lock hub");
        let sender = self.participant;
        for (participant, inbox) in state.inboxes.iter_mut() {
            if *participant != sender {
                inbox.push_back((sender, payload.to_vec()));
            }
        }
        Ok(())
    }

    fn drain_inbox(&self) -> Vec<(ParticipantId, Vec<u8>)> {
        let mut state = self.hub.state.lock().expect("lock hub");
        match state.inboxes.get_mut(&self.participant) {
            Some(inbox) => inbox.drain(..).collect(),
            None => Vec::new(),
        }
    }

    fn drain_disconnects(&self) -> Vec<ParticipantId> {
        let mut state = self.hub.state.lock().expect("lock hub");
        match state.disconnect_queues.get_mut(&self.participant) {
            Some(queue) => std::mem::take(queue),
            None => Vec::new(),
        }
    }
}
