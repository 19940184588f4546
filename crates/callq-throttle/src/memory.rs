//! In-memory capabilities.
//!
//! Backs a call with plain data and broadcast channels. Used by the
//! simulator and by tests; each setter only notifies subscribers when the
//! value actually changes.

use async_trait::async_trait;
use callq_common::VideoConstraints;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::capability::{
    ConstraintError, LocalMediaEvent, LocalMediaState, LocalMediaView, ParticipantEvent,
    ParticipantId, ParticipantSnapshot, RosterEvent, RosterView, SignalingChannel,
};
use crate::signaling::SignalingMessage;

const CHANNEL_CAPACITY: usize = 256;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct MemoryParticipant {
    snapshot: ParticipantSnapshot,
    events: broadcast::Sender<ParticipantEvent>,
}

/// A roster of remote participants.
pub struct MemoryRoster {
    participants: Mutex<HashMap<ParticipantId, MemoryParticipant>>,
    events: broadcast::Sender<RosterEvent>,
}

impl MemoryRoster {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            participants: Mutex::new(HashMap::new()),
            events,
        }
    }

    /// Add a participant with a fresh id.
    pub fn add(&self, video_available: bool, audio_available: bool) -> ParticipantId {
        let id = Uuid::now_v7();
        self.add_with_id(id, video_available, audio_available);
        id
    }

    /// Add a participant, replacing any participant with the same id.
    pub fn add_with_id(&self, id: ParticipantId, video_available: bool, audio_available: bool) {
        let (events, _) = broadcast::channel(CHANNEL_CAPACITY);
        let participant = MemoryParticipant {
            snapshot: ParticipantSnapshot {
                id,
                video_available,
                audio_available,
            },
            events,
        };
        lock(&self.participants).insert(id, participant);

        tracing::debug!(participant = %id, video_available, audio_available, "Participant added");
        let _ = self.events.send(RosterEvent::Added(id));
    }

    /// Remove a participant. Its availability subscriptions end.
    pub fn remove(&self, id: ParticipantId) -> bool {
        let removed = lock(&self.participants).remove(&id).is_some();
        if removed {
            tracing::debug!(participant = %id, "Participant removed");
            let _ = self.events.send(RosterEvent::Removed(id));
        }
        removed
    }

    pub fn set_video_available(&self, id: ParticipantId, available: bool) {
        self.update(id, |snapshot| {
            (snapshot.video_available != available).then(|| {
                snapshot.video_available = available;
                ParticipantEvent::VideoAvailable(available)
            })
        });
    }

    pub fn set_audio_available(&self, id: ParticipantId, available: bool) {
        self.update(id, |snapshot| {
            (snapshot.audio_available != available).then(|| {
                snapshot.audio_available = available;
                ParticipantEvent::AudioAvailable(available)
            })
        });
    }

    /// Number of live membership subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.events.receiver_count()
    }

    fn update(
        &self,
        id: ParticipantId,
        change: impl FnOnce(&mut ParticipantSnapshot) -> Option<ParticipantEvent>,
    ) {
        let mut participants = lock(&self.participants);
        if let Some(participant) = participants.get_mut(&id) {
            if let Some(event) = change(&mut participant.snapshot) {
                let _ = participant.events.send(event);
            }
        }
    }
}

impl Default for MemoryRoster {
    fn default() -> Self {
        Self::new()
    }
}

impl RosterView for MemoryRoster {
    fn for_each_participant(&self, visitor: &mut dyn FnMut(&ParticipantSnapshot)) {
        let snapshots: Vec<ParticipantSnapshot> = lock(&self.participants)
            .values()
            .map(|p| p.snapshot)
            .collect();
        for snapshot in &snapshots {
            visitor(snapshot);
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<RosterEvent> {
        self.events.subscribe()
    }

    fn subscribe_participant(
        &self,
        id: ParticipantId,
    ) -> Option<broadcast::Receiver<ParticipantEvent>> {
        lock(&self.participants)
            .get(&id)
            .map(|p| p.events.subscribe())
    }
}

/// Local media with a single video track by default.
pub struct MemoryLocalMedia {
    state: Mutex<LocalMediaState>,
    video_tracks: Mutex<Option<usize>>,
    events: broadcast::Sender<LocalMediaEvent>,
    requests: Mutex<Vec<VideoConstraints>>,
    applied: Mutex<Option<VideoConstraints>>,
    failure: Mutex<Option<String>>,
    apply_delay: Mutex<Option<Duration>>,
}

impl MemoryLocalMedia {
    pub fn new(state: LocalMediaState) -> Self {
        let (events, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            state: Mutex::new(state),
            video_tracks: Mutex::new(Some(1)),
            events,
            requests: Mutex::new(Vec::new()),
            applied: Mutex::new(None),
            failure: Mutex::new(None),
            apply_delay: Mutex::new(None),
        }
    }

    /// Video and audio available and enabled, not speaking.
    pub fn with_video() -> Self {
        Self::new(LocalMediaState {
            video_available: true,
            video_enabled: true,
            audio_enabled: true,
            speaking: false,
        })
    }

    pub fn set_video_available(&self, value: bool) {
        self.update(|s| &mut s.video_available, value, LocalMediaEvent::VideoAvailable);
    }

    pub fn set_video_enabled(&self, value: bool) {
        self.update(|s| &mut s.video_enabled, value, LocalMediaEvent::VideoEnabled);
    }

    pub fn set_audio_enabled(&self, value: bool) {
        self.update(|s| &mut s.audio_enabled, value, LocalMediaEvent::AudioEnabled);
    }

    pub fn set_speaking(&self, value: bool) {
        self.update(|s| &mut s.speaking, value, LocalMediaEvent::Speaking);
    }

    /// `None` removes the local stream altogether.
    pub fn set_video_track_count(&self, count: Option<usize>) {
        *lock(&self.video_tracks) = count;
    }

    /// Make every following application fail with `reason`, or succeed again
    /// with `None`.
    pub fn fail_applications(&self, reason: Option<String>) {
        *lock(&self.failure) = reason;
    }

    /// Delay the completion of every following application.
    pub fn set_apply_delay(&self, delay: Option<Duration>) {
        *lock(&self.apply_delay) = delay;
    }

    /// Every constraint set requested so far, in request order.
    pub fn requests(&self) -> Vec<VideoConstraints> {
        lock(&self.requests).clone()
    }

    pub fn request_count(&self) -> usize {
        lock(&self.requests).len()
    }

    /// Number of live local media subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.events.receiver_count()
    }

    /// Constraints of the last successful application.
    pub fn applied(&self) -> Option<VideoConstraints> {
        *lock(&self.applied)
    }

    fn update(
        &self,
        field: impl FnOnce(&mut LocalMediaState) -> &mut bool,
        value: bool,
        event: impl FnOnce(bool) -> LocalMediaEvent,
    ) {
        let mut state = lock(&self.state);
        let slot = field(&mut *state);
        if *slot == value {
            return;
        }
        *slot = value;
        drop(state);

        let _ = self.events.send(event(value));
    }
}

#[async_trait]
impl LocalMediaView for MemoryLocalMedia {
    fn state(&self) -> LocalMediaState {
        *lock(&self.state)
    }

    fn subscribe(&self) -> broadcast::Receiver<LocalMediaEvent> {
        self.events.subscribe()
    }

    fn video_track_count(&self) -> Option<usize> {
        *lock(&self.video_tracks)
    }

    async fn apply_video_constraints(
        &self,
        constraints: VideoConstraints,
    ) -> Result<(), ConstraintError> {
        lock(&self.requests).push(constraints);

        let delay = *lock(&self.apply_delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if let Some(reason) = lock(&self.failure).clone() {
            return Err(ConstraintError::Rejected(reason));
        }

        *lock(&self.applied) = Some(constraints);
        Ok(())
    }
}

/// A signaling channel fed by hand.
pub struct MemorySignaling {
    messages: broadcast::Sender<SignalingMessage>,
}

impl MemorySignaling {
    pub fn new() -> Self {
        let (messages, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { messages }
    }

    /// Deliver a message to every subscriber. Returns the number of
    /// subscribers that received it.
    pub fn deliver(&self, message: SignalingMessage) -> usize {
        self.messages.send(message).unwrap_or(0)
    }
}

impl Default for MemorySignaling {
    fn default() -> Self {
        Self::new()
    }
}

impl SignalingChannel for MemorySignaling {
    fn subscribe(&self) -> broadcast::Receiver<SignalingMessage> {
        self.messages.subscribe()
    }
}
