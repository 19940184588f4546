//! Signaling messages consumed by the quality controller.
//!
//! Only `control` messages carrying a forced threshold are of interest; a
//! moderator sends them to impose the same limits on every participant's
//! throttler. Everything else on the channel is ignored.

use callq_common::{CallqResult, ThresholdTable};
use serde::{Deserialize, Serialize};

use crate::state::ThresholdKind;

/// A message received through the signaling channel.
///
/// Wire format: `{ "type": "control", "payload": { "action": ..., ... } }`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalingMessage {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// Control actions understood by the quality controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum ControlAction {
    ForceAvailableVideosThreshold { threshold: ThresholdTable },
    ForceAvailableAudiosThreshold { threshold: ThresholdTable },
}

impl ControlAction {
    const ACTIONS: [&'static str; 2] = [
        "forceAvailableVideosThreshold",
        "forceAvailableAudiosThreshold",
    ];

    pub fn into_parts(self) -> (ThresholdKind, ThresholdTable) {
        match self {
            Self::ForceAvailableVideosThreshold { threshold } => {
                (ThresholdKind::AvailableVideos, threshold)
            }
            Self::ForceAvailableAudiosThreshold { threshold } => {
                (ThresholdKind::AvailableAudios, threshold)
            }
        }
    }
}

impl SignalingMessage {
    pub const CONTROL: &'static str = "control";

    pub fn new(kind: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            kind: kind.into(),
            payload,
        }
    }

    /// Build a control message for an action.
    pub fn control(action: &ControlAction) -> CallqResult<Self> {
        Ok(Self::new(Self::CONTROL, serde_json::to_value(action)?))
    }

    /// Moderator message forcing the available videos threshold.
    pub fn force_available_videos_threshold(threshold: ThresholdTable) -> CallqResult<Self> {
        Self::control(&ControlAction::ForceAvailableVideosThreshold { threshold })
    }

    /// Moderator message forcing the available audios threshold.
    pub fn force_available_audios_threshold(threshold: ThresholdTable) -> CallqResult<Self> {
        Self::control(&ControlAction::ForceAvailableAudiosThreshold { threshold })
    }

    /// The control action carried by this message.
    ///
    /// Returns `Ok(None)` for other message types and unknown actions, and an
    /// error when a known action has a malformed payload.
    pub fn control_action(&self) -> CallqResult<Option<ControlAction>> {
        if self.kind != Self::CONTROL {
            return Ok(None);
        }

        let known = self
            .payload
            .get("action")
            .and_then(|a| a.as_str())
            .is_some_and(|a| ControlAction::ACTIONS.contains(&a));
        if !known {
            return Ok(None);
        }

        Ok(Some(serde_json::from_value(self.payload.clone())?))
    }
}
