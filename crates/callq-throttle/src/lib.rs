//! Sent-video quality throttling for group calls.
//!
//! A [`QualityController`] watches the call roster and the local media, picks
//! the outgoing video tier from how many peers have video and audio, keeps
//! high quality while the local participant speaks, and applies the tier's
//! constraints to the local video track.
//!
//! The call itself is reached only through the traits in [`capability`];
//! [`memory`] provides in-process implementations.

pub mod capability;
pub mod controller;
pub mod memory;
pub mod signaling;
pub mod state;

pub use capability::{
    ConstraintError, LocalMediaEvent, LocalMediaState, LocalMediaView, ParticipantEvent,
    ParticipantId, ParticipantSnapshot, PeerCounts, RosterEvent, RosterView, SignalingChannel,
};
pub use controller::{ControllerOptions, QualityController, ThrottlerEvent, ThrottlerSnapshot};
pub use signaling::{ControlAction, SignalingMessage};
pub use state::{SpeakingState, ThresholdKind, ThrottleState};
