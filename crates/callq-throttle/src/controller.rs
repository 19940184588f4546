//! Quality controller: the task that throttles the sent video.
//!
//! One controller is spawned per call. It owns all its state and is the only
//! place where that state changes; everything else talks to it through the
//! [`QualityController`] handle or through the capabilities' event streams.
//!
//! Architecture:
//! ```text
//!   LocalMediaView ──events──┐
//!   RosterView ──────events──┤
//!   peers (StreamMap) ─events┼──▶ controller task ──apply_video_constraints──▶ LocalMediaView
//!   SignalingChannel ────────┤          ▲                         │
//!   QualityController ──cmds─┘          └──── completion ─────────┘
//! ```
//!
//! Roster, per-peer, speaking, audio and video-enabled events are only
//! listened to while the local video is available. Without an outgoing video
//! there is nothing to adjust, so the roster subscriptions are dropped until
//! it becomes available again.

use callq_common::config::{DEFAULT_GRACE_PERIOD_MS, ThrottleConfig};
use callq_common::{CallqError, CallqResult, QualityTier, ThresholdTable};
use futures_util::future::BoxFuture;
use futures_util::stream::{FuturesUnordered, StreamExt};
use serde::Serialize;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::AbortHandle;
use tokio::time::Sleep;
use tokio_stream::StreamMap;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;

use crate::capability::{
    ConstraintError, LocalMediaEvent, LocalMediaView, ParticipantEvent, ParticipantId,
    PeerCounts, RosterEvent, RosterView, SignalingChannel,
};
use crate::signaling::SignalingMessage;
use crate::state::{SpeakingState, ThresholdKind, ThrottleState};

/// Settings a controller starts with.
#[derive(Debug, Clone)]
pub struct ControllerOptions {
    pub available_videos_threshold: ThresholdTable,
    pub available_audios_threshold: ThresholdTable,
    /// How long high quality is kept after the local participant stops speaking.
    pub grace_period: Duration,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            available_videos_threshold: ThresholdTable::default_available_videos(),
            available_audios_threshold: ThresholdTable::default_available_audios(),
            grace_period: Duration::from_millis(DEFAULT_GRACE_PERIOD_MS),
        }
    }
}

impl From<&ThrottleConfig> for ControllerOptions {
    fn from(config: &ThrottleConfig) -> Self {
        Self {
            available_videos_threshold: config.available_videos_threshold.clone(),
            available_audios_threshold: config.available_audios_threshold.clone(),
            grace_period: config.grace_period(),
        }
    }
}

/// Notifications emitted by a controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ThrottlerEvent {
    ThresholdChanged {
        kind: ThresholdKind,
        threshold: ThresholdTable,
    },
    QualityChanged {
        previous: QualityTier,
        current: QualityTier,
    },
    QualityChangeFailed {
        tier: QualityTier,
        error: String,
    },
}

/// Point-in-time view of a controller's state.
#[derive(Debug, Clone, Serialize)]
pub struct ThrottlerSnapshot {
    pub current: QualityTier,
    pub in_flight: Option<QualityTier>,
    pub speaking: SpeakingState,
    pub grace_pending: bool,
    /// Whether roster and local media changes are being listened to.
    pub listening: bool,
    pub tracked_participants: usize,
    pub available_videos_threshold: ThresholdTable,
    pub available_audios_threshold: ThresholdTable,
}

/// Commands sent from the handle to the controller task.
enum Command {
    SetThreshold {
        kind: ThresholdKind,
        table: ThresholdTable,
        reply: oneshot::Sender<()>,
    },
    Snapshot {
        reply: oneshot::Sender<ThrottlerSnapshot>,
    },
}

/// Handle to a running quality controller.
///
/// Clones share the same controller. The controller stops when
/// [`destroy`](Self::destroy) is called or when every handle is dropped.
#[derive(Clone)]
pub struct QualityController {
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<ThrottlerEvent>,
    destroyed: Arc<AtomicBool>,
    task: AbortHandle,
}

impl QualityController {
    /// Spawn a controller bound to one call.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(
        roster: Arc<dyn RosterView>,
        local_media: Arc<dyn LocalMediaView>,
        signaling: &dyn SignalingChannel,
        options: ControllerOptions,
    ) -> CallqResult<Self> {
        options.available_videos_threshold.validate()?;
        options.available_audios_threshold.validate()?;

        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let (events, _) = broadcast::channel(256);
        let destroyed = Arc::new(AtomicBool::new(false));

        // Subscribe before spawning so nothing published meanwhile is missed
        let local_media_rx = local_media.subscribe();
        let signaling_rx = signaling.subscribe();

        let throttler = Throttler {
            roster,
            local_media,
            state: ThrottleState::new(
                options.available_videos_threshold,
                options.available_audios_threshold,
            ),
            grace: GraceTimer::new(options.grace_period),
            listeners: None,
            applies: FuturesUnordered::new(),
            events: events.clone(),
            destroyed: destroyed.clone(),
        };

        let task = tokio::spawn(throttler.run(cmd_rx, local_media_rx, signaling_rx));

        Ok(Self {
            commands: cmd_tx,
            events,
            destroyed,
            task: task.abort_handle(),
        })
    }

    /// Replace the available videos threshold.
    ///
    /// The table is validated first; on error the previous table stays in
    /// effect. On success subscribers are notified and the quality is
    /// adjusted if needed before this returns.
    pub async fn set_available_videos_threshold(&self, table: ThresholdTable) -> CallqResult<()> {
        self.set_threshold(ThresholdKind::AvailableVideos, table).await
    }

    /// Replace the available audios threshold. See
    /// [`set_available_videos_threshold`](Self::set_available_videos_threshold).
    pub async fn set_available_audios_threshold(&self, table: ThresholdTable) -> CallqResult<()> {
        self.set_threshold(ThresholdKind::AvailableAudios, table).await
    }

    async fn set_threshold(&self, kind: ThresholdKind, table: ThresholdTable) -> CallqResult<()> {
        table.validate()?;

        let (reply, done) = oneshot::channel();
        self.send(Command::SetThreshold { kind, table, reply }).await?;
        done.await.map_err(|_| CallqError::Destroyed)
    }

    /// Current state of the controller.
    pub async fn snapshot(&self) -> CallqResult<ThrottlerSnapshot> {
        let (reply, snapshot) = oneshot::channel();
        self.send(Command::Snapshot { reply }).await?;
        snapshot.await.map_err(|_| CallqError::Destroyed)
    }

    /// Subscribe to threshold and quality notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<ThrottlerEvent> {
        self.events.subscribe()
    }

    /// Stop the controller.
    ///
    /// Subscriptions, the grace timer and in-flight applications are all
    /// dropped with the task; a completion that races with this call is
    /// discarded. Calling it again does nothing.
    pub fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.task.abort();
        tracing::debug!("Quality controller destroyed");
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire) || self.task.is_finished()
    }

    async fn send(&self, command: Command) -> CallqResult<()> {
        if self.destroyed.load(Ordering::Acquire) {
            return Err(CallqError::Destroyed);
        }
        self.commands
            .send(command)
            .await
            .map_err(|_| CallqError::Destroyed)
    }
}

/// The single pending "speaking stopped" grace period.
///
/// Starting it again replaces the previous deadline, so at most one expiry is
/// ever pending.
struct GraceTimer {
    period: Duration,
    sleep: Option<Pin<Box<Sleep>>>,
}

impl GraceTimer {
    fn new(period: Duration) -> Self {
        Self {
            period,
            sleep: None,
        }
    }

    fn start(&mut self) {
        self.sleep = Some(Box::pin(tokio::time::sleep(self.period)));
    }

    fn cancel(&mut self) {
        self.sleep = None;
    }

    fn is_pending(&self) -> bool {
        self.sleep.is_some()
    }

    /// Resolves when the pending period elapses; never resolves when idle.
    async fn expired(&mut self) {
        match self.sleep.as_mut() {
            Some(sleep) => {
                sleep.await;
                self.sleep = None;
            }
            None => std::future::pending().await,
        }
    }
}

/// Subscriptions held while the local video is available.
struct Listeners {
    roster: broadcast::Receiver<RosterEvent>,
    participants: StreamMap<ParticipantId, BroadcastStream<ParticipantEvent>>,
}

enum Observed {
    Roster(Result<RosterEvent, RecvError>),
    Participant(ParticipantId, Result<ParticipantEvent, BroadcastStreamRecvError>),
}

impl Listeners {
    fn new(roster: &dyn RosterView) -> Self {
        let mut listeners = Self {
            roster: roster.subscribe(),
            participants: StreamMap::new(),
        };
        listeners.observe_all(roster);
        listeners
    }

    /// Re-subscribe to every participant currently in the roster.
    fn observe_all(&mut self, roster: &dyn RosterView) {
        let mut ids = Vec::new();
        roster.for_each_participant(&mut |participant| ids.push(participant.id));

        self.participants = StreamMap::new();
        for id in ids {
            self.observe(roster, id);
        }
    }

    fn observe(&mut self, roster: &dyn RosterView, id: ParticipantId) {
        if let Some(rx) = roster.subscribe_participant(id) {
            self.participants.insert(id, BroadcastStream::new(rx));
        }
    }

    fn forget(&mut self, id: ParticipantId) {
        self.participants.remove(&id);
    }

    async fn next(&mut self) -> Observed {
        tokio::select! {
            event = self.roster.recv() => Observed::Roster(event),
            Some((id, event)) = self.participants.next() => Observed::Participant(id, event),
        }
    }
}

async fn next_observed(listeners: &mut Option<Listeners>) -> Observed {
    match listeners {
        Some(listeners) => listeners.next().await,
        None => std::future::pending().await,
    }
}

async fn next_signaling(
    rx: &mut Option<broadcast::Receiver<SignalingMessage>>,
) -> Result<SignalingMessage, RecvError> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

type ApplyFuture = BoxFuture<'static, (QualityTier, Result<(), ConstraintError>)>;

/// Everything the controller task can wake up for.
enum Input {
    Command(Command),
    LocalMedia(Result<LocalMediaEvent, RecvError>),
    Signaling(Result<SignalingMessage, RecvError>),
    Observed(Observed),
    GraceElapsed,
    Applied(QualityTier, Result<(), ConstraintError>),
}

/// State owned by the controller task.
struct Throttler {
    roster: Arc<dyn RosterView>,
    local_media: Arc<dyn LocalMediaView>,
    state: ThrottleState,
    grace: GraceTimer,
    listeners: Option<Listeners>,
    applies: FuturesUnordered<ApplyFuture>,
    events: broadcast::Sender<ThrottlerEvent>,
    destroyed: Arc<AtomicBool>,
}

impl Throttler {
    /// Run the controller event loop until destroyed or every handle is gone.
    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<Command>,
        mut local_media_rx: broadcast::Receiver<LocalMediaEvent>,
        signaling_rx: broadcast::Receiver<SignalingMessage>,
    ) {
        let mut signaling_rx = Some(signaling_rx);

        if self.local_media.state().video_available {
            self.start_listening();
        }

        loop {
            let input = tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(cmd) => Input::Command(cmd),
                    None => break, // Every handle dropped
                },
                event = local_media_rx.recv() => Input::LocalMedia(event),
                msg = next_signaling(&mut signaling_rx), if signaling_rx.is_some() => {
                    Input::Signaling(msg)
                }
                observed = next_observed(&mut self.listeners), if self.listeners.is_some() => {
                    Input::Observed(observed)
                }
                () = self.grace.expired(), if self.grace.is_pending() => Input::GraceElapsed,
                Some((tier, result)) = self.applies.next(), if !self.applies.is_empty() => {
                    Input::Applied(tier, result)
                }
            };

            // Nothing may change once the handle has been destroyed
            if self.destroyed.load(Ordering::Acquire) {
                break;
            }

            match input {
                Input::Command(cmd) => self.handle_command(cmd),
                Input::LocalMedia(Ok(event)) => self.handle_local_media(event),
                Input::LocalMedia(Err(RecvError::Lagged(skipped))) => {
                    tracing::warn!(skipped, "Missed local media changes, resyncing");
                    self.resync_local_media();
                }
                Input::LocalMedia(Err(RecvError::Closed)) => {
                    tracing::info!("Local media closed, stopping quality controller");
                    break;
                }
                Input::Signaling(Ok(msg)) => self.handle_signaling_message(msg),
                Input::Signaling(Err(RecvError::Lagged(skipped))) => {
                    tracing::warn!(skipped, "Missed signaling messages");
                }
                Input::Signaling(Err(RecvError::Closed)) => {
                    tracing::debug!("Signaling channel closed");
                    signaling_rx = None;
                }
                Input::Observed(observed) => self.handle_observed(observed),
                Input::GraceElapsed => self.handle_grace_elapsed(),
                Input::Applied(tier, result) => self.handle_applied(tier, result),
            }
        }

        tracing::debug!("Quality controller stopped");
    }

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::SetThreshold { kind, table, reply } => {
                self.set_threshold(kind, table);
                let _ = reply.send(());
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
        }
    }

    fn snapshot(&self) -> ThrottlerSnapshot {
        ThrottlerSnapshot {
            current: self.state.current(),
            in_flight: self.state.in_flight(),
            speaking: self.state.speaking(),
            grace_pending: self.grace.is_pending(),
            listening: self.listeners.is_some(),
            tracked_participants: self
                .listeners
                .as_ref()
                .map_or(0, |l| l.participants.len()),
            available_videos_threshold: self
                .state
                .threshold(ThresholdKind::AvailableVideos)
                .clone(),
            available_audios_threshold: self
                .state
                .threshold(ThresholdKind::AvailableAudios)
                .clone(),
        }
    }

    /// Store an already validated table, notify and re-evaluate.
    fn set_threshold(&mut self, kind: ThresholdKind, table: ThresholdTable) {
        self.state.set_threshold(kind, table.clone());
        let _ = self.events.send(ThrottlerEvent::ThresholdChanged {
            kind,
            threshold: table,
        });

        self.adjust_quality_if_needed();
    }

    fn handle_signaling_message(&mut self, msg: SignalingMessage) {
        let action = match msg.control_action() {
            Ok(Some(action)) => action,
            Ok(None) => return,
            Err(e) => {
                tracing::warn!(error = %e, "Malformed control message ignored");
                return;
            }
        };

        let (kind, table) = action.into_parts();
        tracing::debug!(?kind, threshold = ?table, "Threshold changed by a moderator");

        if let Err(e) = table.validate() {
            tracing::warn!(?kind, error = %e, "Forced threshold rejected");
            return;
        }
        self.set_threshold(kind, table);
    }

    fn handle_local_media(&mut self, event: LocalMediaEvent) {
        match event {
            LocalMediaEvent::VideoAvailable(true) => self.start_listening(),
            LocalMediaEvent::VideoAvailable(false) => self.stop_listening(),
            // The rest only matters while there is a video to adjust
            _ if self.listeners.is_none() => {}
            LocalMediaEvent::VideoEnabled(_) => self.adjust_quality_if_needed(),
            LocalMediaEvent::AudioEnabled(enabled) => {
                if self.handle_audio_enabled(enabled) {
                    self.adjust_quality_if_needed();
                }
            }
            LocalMediaEvent::Speaking(speaking) => {
                if self.handle_speaking(speaking) {
                    self.adjust_quality_if_needed();
                }
            }
        }
    }

    /// Returns whether the quality has to be re-evaluated.
    fn handle_speaking(&mut self, speaking: bool) -> bool {
        if speaking {
            self.grace.cancel();
            self.state.set_speaking(SpeakingState::SpeakingOrGrace);
            return true;
        }

        // Keep the high quality for a while in case speaking resumes
        if self.state.speaking() == SpeakingState::SpeakingOrGrace {
            self.grace.start();
        }
        false
    }

    /// A muted participant cannot be speaking. Returns whether the quality has
    /// to be re-evaluated.
    fn handle_audio_enabled(&mut self, enabled: bool) -> bool {
        if enabled {
            return false;
        }

        self.grace.cancel();
        self.state.set_speaking(SpeakingState::NotSpeaking);
        true
    }

    fn handle_grace_elapsed(&mut self) {
        tracing::trace!("Grace period after speaking elapsed");
        self.state.set_speaking(SpeakingState::NotSpeaking);
        self.adjust_quality_if_needed();
    }

    fn start_listening(&mut self) {
        if self.listeners.is_none() {
            self.listeners = Some(Listeners::new(self.roster.as_ref()));
            tracing::debug!("Local video available, listening to call changes");
        }
        self.resync_local_media();
    }

    fn stop_listening(&mut self) {
        if self.listeners.take().is_some() {
            tracing::debug!("Local video unavailable, stopped listening to call changes");
        }
    }

    /// Bring speaking state in line with the local media flags, then
    /// re-evaluate.
    fn resync_local_media(&mut self) {
        let local = self.local_media.state();
        if !local.video_available {
            self.stop_listening();
            return;
        }
        if self.listeners.is_none() {
            self.start_listening();
            return;
        }

        // A grace period that is already running is left as is
        if local.speaking || !self.grace.is_pending() {
            self.handle_speaking(local.speaking);
        }
        self.handle_audio_enabled(local.audio_enabled);
        self.adjust_quality_if_needed();
    }

    fn handle_observed(&mut self, observed: Observed) {
        let Some(listeners) = self.listeners.as_mut() else {
            return;
        };

        match observed {
            Observed::Roster(Ok(RosterEvent::Added(id))) => {
                listeners.observe(self.roster.as_ref(), id);
            }
            Observed::Roster(Ok(RosterEvent::Removed(id))) => {
                listeners.forget(id);
            }
            Observed::Roster(Err(RecvError::Lagged(skipped))) => {
                tracing::warn!(skipped, "Missed roster changes, resubscribing to participants");
                listeners.observe_all(self.roster.as_ref());
            }
            Observed::Roster(Err(RecvError::Closed)) => {
                tracing::debug!("Roster closed, stopped listening to call changes");
                self.listeners = None;
                return;
            }
            Observed::Participant(id, Ok(event)) => {
                tracing::trace!(participant = %id, ?event, "Participant media changed");
            }
            Observed::Participant(id, Err(BroadcastStreamRecvError::Lagged(skipped))) => {
                tracing::debug!(participant = %id, skipped, "Missed participant media changes");
            }
        }

        self.adjust_quality_if_needed();
    }

    fn adjust_quality_if_needed(&mut self) {
        let local = self.local_media.state();
        let roster = self.roster.as_ref();
        let Some(tier) = self.state.plan(&local, || PeerCounts::collect(roster)) else {
            return;
        };

        self.apply_constraints(tier);
    }

    fn apply_constraints(&mut self, tier: QualityTier) {
        let track = match self.local_media.video_track_count() {
            None => Err(ConstraintError::NoLocalStream),
            Some(0) => Err(ConstraintError::NoVideoTrack),
            Some(1) => Ok(()),
            Some(n) => Err(ConstraintError::MultipleVideoTracks(n)),
        };
        if let Err(e) = track {
            tracing::warn!(%tier, error = %e, "Cannot adjust sent video quality");
            self.notify_failure(tier, &e);
            return;
        }

        let constraints = tier.constraints();
        tracing::trace!(%tier, ?constraints, "Applying video constraints");

        self.state.begin_apply(tier);
        let local_media = self.local_media.clone();
        self.applies.push(Box::pin(async move {
            let result = local_media.apply_video_constraints(constraints).await;
            (tier, result)
        }));
    }

    fn handle_applied(&mut self, tier: QualityTier, result: Result<(), ConstraintError>) {
        match result {
            Ok(()) => {
                let previous = self.state.finish_apply(tier, true);
                tracing::debug!(%previous, %tier, "Changed quality");
                let _ = self.events.send(ThrottlerEvent::QualityChanged {
                    previous,
                    current: tier,
                });
            }
            Err(e) => {
                self.state.finish_apply(tier, false);
                tracing::warn!(%tier, error = %e, "Failed to set quality");
                self.notify_failure(tier, &e);
            }
        }
    }

    fn notify_failure(&self, tier: QualityTier, error: &ConstraintError) {
        let _ = self.events.send(ThrottlerEvent::QualityChangeFailed {
            tier,
            error: error.to_string(),
        });
    }
}
