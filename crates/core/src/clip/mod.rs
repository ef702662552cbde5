use std::{
    fmt,
    sync::{
        atomic::{AtomicU32, AtomicU64, Ordering},
        Arc, Weak,
    },
};

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::{backend::BackendState, graph::GraphRoute, Result, SoundError};

static NEXT_CLIP_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique clip identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClipId(u64);

impl ClipId {
    #[cfg(test)]
    pub(crate) fn new(value: u64) -> Self {
        Self(value)
    }

    fn next() -> Self {
        Self(NEXT_CLIP_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ClipId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClipState {
    /// Added, nothing requested yet.
    Idle,
    /// Fetching or decoding ahead of playback.
    Loading,
    /// Enough data buffered to play through.
    Playing,
    Finished,
    Failed,
    Disposed,
}

impl ClipState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Failed | Self::Disposed)
    }
}

/// How a clip's lifetime ended.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Finished,
    Failed(SoundError),
    Disposed,
}

/// Callbacks registered when a clip is added.
#[derive(Default)]
pub struct ClipCallbacks {
    on_finish: Option<Box<dyn FnOnce() + Send>>,
    on_error: Option<Box<dyn FnOnce(SoundError) + Send>>,
}

impl ClipCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Invoked once on natural completion.
    pub fn on_finish(mut self, callback: impl FnOnce() + Send + 'static) -> Self {
        self.on_finish = Some(Box::new(callback));
        self
    }

    /// Invoked once when loading, decoding or starting playback fails.
    pub fn on_error(mut self, callback: impl FnOnce(SoundError) + Send + 'static) -> Self {
        self.on_error = Some(Box::new(callback));
        self
    }
}

impl fmt::Debug for ClipCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClipCallbacks")
            .field("on_finish", &self.on_finish.is_some())
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

struct Settlement {
    callbacks: ClipCallbacks,
    outcome_tx: oneshot::Sender<Outcome>,
}

impl Settlement {
    /// Runs the matching callback, then publishes the outcome.
    fn resolve(self, outcome: Outcome) {
        match &outcome {
            Outcome::Finished => {
                if let Some(on_finish) = self.callbacks.on_finish {
                    on_finish();
                }
            }
            Outcome::Failed(err) => {
                if let Some(on_error) = self.callbacks.on_error {
                    on_error(err.clone());
                }
            }
            Outcome::Disposed => {}
        }
        let _ = self.outcome_tx.send(outcome);
    }
}

/// Variant-specific playback resource (decoder, buffers, worker threads).
pub(crate) trait Playback: Send + Sync {
    /// Begins fetching and playing. Calling it again while running is a no-op.
    fn start(&self) -> Result<()>;

    fn set_volume(&self, volume: f32);

    /// Stops playback and releases every resource. Must not fail.
    fn release(&self);
}

#[derive(Default)]
struct Readiness {
    ready: bool,
    closed: Option<Result<()>>,
    pending: Vec<oneshot::Sender<Result<()>>>,
}

/// Handle to a tracked clip. Cloning is cheap; all clones share one clip.
///
/// The first of finish, error or dispose settles the clip. Later terminal
/// events are ignored, so each callback fires at most once and never after
/// disposal.
#[derive(Clone)]
pub struct Clip {
    inner: Arc<ClipInner>,
}

struct ClipInner {
    id: ClipId,
    source_uri: String,
    volume: AtomicU32,
    frames_played: AtomicU64,
    state: Mutex<ClipState>,
    settlement: Mutex<Option<Settlement>>,
    outcome_rx: Mutex<Option<oneshot::Receiver<Outcome>>>,
    readiness: Mutex<Readiness>,
    playback: Mutex<Option<Arc<dyn Playback>>>,
    route: Mutex<Option<GraphRoute>>,
    owner: Weak<BackendState>,
}

impl Clip {
    pub(crate) fn new(
        source_uri: &str,
        callbacks: ClipCallbacks,
        owner: Weak<BackendState>,
        volume: f32,
    ) -> Self {
        let (outcome_tx, outcome_rx) = oneshot::channel();
        Self {
            inner: Arc::new(ClipInner {
                id: ClipId::next(),
                source_uri: source_uri.to_string(),
                volume: AtomicU32::new(volume.to_bits()),
                frames_played: AtomicU64::new(0),
                state: Mutex::new(ClipState::Idle),
                settlement: Mutex::new(Some(Settlement {
                    callbacks,
                    outcome_tx,
                })),
                outcome_rx: Mutex::new(Some(outcome_rx)),
                readiness: Mutex::new(Readiness::default()),
                playback: Mutex::new(None),
                route: Mutex::new(None),
                owner,
            }),
        }
    }

    pub fn id(&self) -> ClipId {
        self.inner.id
    }

    pub fn source_uri(&self) -> &str {
        &self.inner.source_uri
    }

    /// Effective volume in `[0, 1]`.
    pub fn volume(&self) -> f32 {
        f32::from_bits(self.inner.volume.load(Ordering::Acquire))
    }

    pub fn state(&self) -> ClipState {
        *self.inner.state.lock()
    }

    /// True once the clip finished, failed or was disposed.
    pub fn is_settled(&self) -> bool {
        self.inner.settlement.lock().is_none()
    }

    /// Mono frames rendered so far.
    pub fn frames_played(&self) -> u64 {
        self.inner.frames_played.load(Ordering::Relaxed)
    }

    pub fn has_analyser(&self) -> bool {
        self.inner.route.lock().is_some()
    }

    /// Takes the single-resolution completion signal. Only the first caller
    /// receives it.
    pub fn take_outcome(&self) -> Option<oneshot::Receiver<Outcome>> {
        self.inner.outcome_rx.lock().take()
    }

    /// Stops playback and releases the clip without firing callbacks.
    /// Idempotent.
    pub fn dispose(&self) {
        self.settle(Outcome::Disposed);
    }

    pub(crate) fn same(&self, other: &Clip) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn downgrade(&self) -> WeakClip {
        WeakClip {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub(crate) fn set_volume(&self, volume: f32) {
        self.inner.volume.store(volume.to_bits(), Ordering::Release);
        let playback = self.inner.playback.lock().clone();
        if let Some(playback) = playback {
            playback.set_volume(volume);
        }
    }

    /// Attaches the variant's playback resource. A clip that settled in the
    /// meantime releases the resource straight away.
    pub(crate) fn install(&self, playback: Arc<dyn Playback>) -> bool {
        {
            let mut slot = self.inner.playback.lock();
            if !self.is_settled() {
                *slot = Some(playback);
                return true;
            }
        }
        playback.release();
        false
    }

    pub(crate) fn playback(&self) -> Option<Arc<dyn Playback>> {
        self.inner.playback.lock().clone()
    }

    pub(crate) fn is_routed(&self) -> bool {
        self.has_analyser()
    }

    pub(crate) fn connect(&self, route: GraphRoute) -> Result<()> {
        let mut slot = self.inner.route.lock();
        if slot.is_some() {
            return Err(SoundError::AlreadyRouted(self.inner.id.get()));
        }
        *slot = Some(route);
        Ok(())
    }

    /// Receiver resolved once the clip can play through, or when it settles.
    pub(crate) fn wait_ready(&self) -> oneshot::Receiver<Result<()>> {
        let (tx, rx) = oneshot::channel();
        let mut readiness = self.inner.readiness.lock();
        if let Some(result) = readiness.closed.clone() {
            let _ = tx.send(result);
        } else if readiness.ready {
            let _ = tx.send(Ok(()));
        } else {
            readiness.pending.push(tx);
        }
        rx
    }

    pub(crate) fn mark_loading(&self) {
        let mut state = self.inner.state.lock();
        if *state == ClipState::Idle {
            *state = ClipState::Loading;
        }
    }

    pub(crate) fn fail(&self, err: SoundError) -> bool {
        self.settle(Outcome::Failed(err))
    }

    fn mark_ready(&self) {
        {
            let mut state = self.inner.state.lock();
            if state.is_terminal() {
                return;
            }
            *state = ClipState::Playing;
        }

        let pending = {
            let mut readiness = self.inner.readiness.lock();
            if readiness.closed.is_some() {
                return;
            }
            readiness.ready = true;
            std::mem::take(&mut readiness.pending)
        };
        tracing::debug!(clip = %self.inner.id, source = %self.inner.source_uri, "clip can play through");
        for tx in pending {
            let _ = tx.send(Ok(()));
        }
    }

    fn deliver(&self, block: &[f32]) {
        self.inner
            .frames_played
            .fetch_add(block.len() as u64, Ordering::Relaxed);
        if let Some(route) = self.inner.route.lock().as_ref() {
            route.deliver(block);
        }
    }

    fn settle(&self, outcome: Outcome) -> bool {
        let Some(settlement) = self.inner.settlement.lock().take() else {
            return false;
        };
        let id = self.inner.id;

        *self.inner.state.lock() = match outcome {
            Outcome::Finished => ClipState::Finished,
            Outcome::Failed(_) => ClipState::Failed,
            Outcome::Disposed => ClipState::Disposed,
        };

        let playback = self.inner.playback.lock().take();
        if let Some(playback) = playback {
            playback.release();
        }
        self.inner.route.lock().take();

        let closed = match &outcome {
            Outcome::Finished => Ok(()),
            Outcome::Failed(err) => Err(err.clone()),
            Outcome::Disposed => Err(SoundError::Disposed(id.get())),
        };
        let pending = {
            let mut readiness = self.inner.readiness.lock();
            readiness.closed = Some(closed.clone());
            std::mem::take(&mut readiness.pending)
        };

        if let Some(owner) = self.inner.owner.upgrade() {
            owner.forget(self);
        }

        match &outcome {
            Outcome::Failed(err) => {
                tracing::warn!(clip = %id, source = %self.inner.source_uri, error = %err, "error occurred on source")
            }
            Outcome::Finished => {
                tracing::debug!(clip = %id, source = %self.inner.source_uri, "clip finished")
            }
            Outcome::Disposed => {
                tracing::debug!(clip = %id, source = %self.inner.source_uri, "clip disposed")
            }
        }

        settlement.resolve(outcome);
        for tx in pending {
            let _ = tx.send(closed.clone());
        }
        true
    }
}

impl fmt::Debug for Clip {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Clip")
            .field("id", &self.inner.id)
            .field("source_uri", &self.inner.source_uri)
            .field("volume", &self.volume())
            .field("state", &self.state())
            .finish()
    }
}

/// Non-owning clip reference held by worker threads.
#[derive(Clone)]
pub(crate) struct WeakClip {
    inner: Weak<ClipInner>,
}

impl WeakClip {
    pub(crate) fn upgrade(&self) -> Option<Clip> {
        self.inner.upgrade().map(|inner| Clip { inner })
    }

    pub(crate) fn ready(&self) {
        if let Some(clip) = self.upgrade() {
            clip.mark_ready();
        }
    }

    pub(crate) fn finish(&self) {
        if let Some(clip) = self.upgrade() {
            clip.settle(Outcome::Finished);
        }
    }

    pub(crate) fn fail(&self, err: SoundError) {
        if let Some(clip) = self.upgrade() {
            clip.fail(err);
        }
    }

    /// Hands a rendered block to the clip's route. False once the clip is
    /// gone or settled.
    pub(crate) fn deliver(&self, block: &[f32]) -> bool {
        match self.upgrade() {
            Some(clip) if !clip.is_settled() => {
                clip.deliver(block);
                true
            }
            _ => false,
        }
    }
}
