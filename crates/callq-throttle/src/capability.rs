//! Capabilities the quality controller consumes.
//!
//! Each capability hands out subscriptions as `broadcast::Receiver`s. The
//! receiver is the subscription handle: dropping it unsubscribes, so a
//! controller that owns its receivers releases every one of them when it is
//! torn down.

use async_trait::async_trait;
use callq_common::VideoConstraints;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

pub use crate::signaling::SignalingMessage;

/// Identifier of a remote participant in the call.
pub type ParticipantId = Uuid;

/// Media availability of a remote participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantSnapshot {
    pub id: ParticipantId,
    pub video_available: bool,
    pub audio_available: bool,
}

/// Membership changes of the call roster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RosterEvent {
    Added(ParticipantId),
    Removed(ParticipantId),
}

/// Media availability changes of a single participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParticipantEvent {
    VideoAvailable(bool),
    AudioAvailable(bool),
}

/// The remote participants of the call.
pub trait RosterView: Send + Sync {
    /// Visit every participant currently in the call.
    fn for_each_participant(&self, visitor: &mut dyn FnMut(&ParticipantSnapshot));

    /// Subscribe to participants joining and leaving.
    fn subscribe(&self) -> broadcast::Receiver<RosterEvent>;

    /// Subscribe to availability changes of one participant, or `None` if the
    /// participant is not in the call.
    fn subscribe_participant(
        &self,
        id: ParticipantId,
    ) -> Option<broadcast::Receiver<ParticipantEvent>>;
}

/// Number of remote participants with each kind of media available.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PeerCounts {
    pub available_videos: usize,
    pub available_audios: usize,
}

impl PeerCounts {
    pub fn new(available_videos: usize, available_audios: usize) -> Self {
        Self {
            available_videos,
            available_audios,
        }
    }

    /// Count the participants currently in the roster.
    pub fn collect(roster: &dyn RosterView) -> Self {
        let mut counts = Self::default();
        roster.for_each_participant(&mut |participant| {
            if participant.video_available {
                counts.available_videos += 1;
            }
            if participant.audio_available {
                counts.available_audios += 1;
            }
        });
        counts
    }
}

/// Flags of the local media.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalMediaState {
    pub video_available: bool,
    pub video_enabled: bool,
    pub audio_enabled: bool,
    pub speaking: bool,
}

/// Changes of the local media flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalMediaEvent {
    VideoAvailable(bool),
    VideoEnabled(bool),
    AudioEnabled(bool),
    Speaking(bool),
}

/// Why constraints could not be applied to the local video.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConstraintError {
    #[error("No local stream to adjust its video quality found")]
    NoLocalStream,

    #[error("No local video track to adjust its quality found")]
    NoVideoTrack,

    #[error("More than one local video track to adjust its quality found: {0}")]
    MultipleVideoTracks(usize),

    #[error("Constraints rejected: {0}")]
    Rejected(String),
}

/// The local participant's media.
#[async_trait]
pub trait LocalMediaView: Send + Sync {
    fn state(&self) -> LocalMediaState;

    fn subscribe(&self) -> broadcast::Receiver<LocalMediaEvent>;

    /// Number of video tracks in the local stream, or `None` when there is no
    /// local stream at all.
    fn video_track_count(&self) -> Option<usize>;

    /// Apply constraints to the (single) local video track.
    async fn apply_video_constraints(
        &self,
        constraints: VideoConstraints,
    ) -> Result<(), ConstraintError>;
}

/// Out-of-band messages from the signaling server.
pub trait SignalingChannel: Send + Sync {
    fn subscribe(&self) -> broadcast::Receiver<SignalingMessage>;
}
