//! Decision state of the quality controller.
//!
//! Everything here is synchronous and owned by the controller task: the
//! threshold tables, the speaking state, the tier currently applied to the
//! local video and the tier of the application still in flight.

use callq_common::{QualityTier, ThresholdTable};
use serde::Serialize;

use crate::capability::{LocalMediaState, PeerCounts};

/// Which of the two threshold tables an update targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ThresholdKind {
    AvailableVideos,
    AvailableAudios,
}

/// Whether the local participant is speaking or spoke recently enough to keep
/// high quality.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SpeakingState {
    #[default]
    NotSpeaking,
    SpeakingOrGrace,
}

#[derive(Debug, Clone)]
pub struct ThrottleState {
    available_videos_threshold: ThresholdTable,
    available_audios_threshold: ThresholdTable,
    speaking: SpeakingState,
    /// Tier whose constraints were last applied successfully.
    current: QualityTier,
    /// Tier of the most recent application that has not completed yet.
    in_flight: Option<QualityTier>,
}

impl ThrottleState {
    /// Capture starts with the highest quality constraints.
    pub fn new(
        available_videos_threshold: ThresholdTable,
        available_audios_threshold: ThresholdTable,
    ) -> Self {
        Self {
            available_videos_threshold,
            available_audios_threshold,
            speaking: SpeakingState::NotSpeaking,
            current: QualityTier::High,
            in_flight: None,
        }
    }

    pub fn current(&self) -> QualityTier {
        self.current
    }

    pub fn in_flight(&self) -> Option<QualityTier> {
        self.in_flight
    }

    pub fn speaking(&self) -> SpeakingState {
        self.speaking
    }

    pub fn set_speaking(&mut self, speaking: SpeakingState) {
        self.speaking = speaking;
    }

    pub fn threshold(&self, kind: ThresholdKind) -> &ThresholdTable {
        match kind {
            ThresholdKind::AvailableVideos => &self.available_videos_threshold,
            ThresholdKind::AvailableAudios => &self.available_audios_threshold,
        }
    }

    /// Replace a table. The table is expected to be validated already.
    pub fn set_threshold(&mut self, kind: ThresholdKind, table: ThresholdTable) {
        match kind {
            ThresholdKind::AvailableVideos => self.available_videos_threshold = table,
            ThresholdKind::AvailableAudios => self.available_audios_threshold = table,
        }
    }

    /// Tier for the given peer counts.
    ///
    /// Speaking always gets HIGH. Otherwise the lowest tier whose video or
    /// audio threshold is reached wins, falling back to HIGH.
    pub fn tier_for(&self, counts: PeerCounts) -> QualityTier {
        if self.speaking == SpeakingState::SpeakingOrGrace {
            return QualityTier::High;
        }

        QualityTier::THROTTLED
            .into_iter()
            .find(|&tier| {
                self.available_videos_threshold
                    .is_reached(tier, counts.available_videos)
                    || self
                        .available_audios_threshold
                        .is_reached(tier, counts.available_audios)
            })
            .unwrap_or(QualityTier::High)
    }

    /// Tier that has to be applied now, if any.
    ///
    /// Nothing is computed while there is no enabled local video. The target
    /// is compared with the tier the track will end up with once the pending
    /// application completes, so unchanged inputs never request the same
    /// constraints twice.
    pub fn plan(
        &self,
        local: &LocalMediaState,
        counts: impl FnOnce() -> PeerCounts,
    ) -> Option<QualityTier> {
        if !local.video_available || !local.video_enabled {
            return None;
        }

        let target = self.tier_for(counts());
        (target != self.pending()).then_some(target)
    }

    /// Tier the local video is heading to.
    pub fn pending(&self) -> QualityTier {
        self.in_flight.unwrap_or(self.current)
    }

    pub fn begin_apply(&mut self, tier: QualityTier) {
        self.in_flight = Some(tier);
    }

    /// Record the completion of an application and return the tier that was
    /// current before it.
    ///
    /// Completions are applied in arrival order, so the last one wins.
    pub fn finish_apply(&mut self, tier: QualityTier, applied: bool) -> QualityTier {
        let previous = self.current;
        if self.in_flight == Some(tier) {
            self.in_flight = None;
        }
        if applied {
            self.current = tier;
        }
        previous
    }
}

impl Default for ThrottleState {
    fn default() -> Self {
        Self::new(
            ThresholdTable::default_available_videos(),
            ThresholdTable::default_available_audios(),
        )
    }
}
