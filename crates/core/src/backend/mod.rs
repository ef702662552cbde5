use std::{
    fmt,
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use parking_lot::Mutex;

use crate::{
    analysis,
    clip::{Clip, ClipCallbacks, ClipState},
    config::{AutoplayPolicy, BackendKind, SoundConfig},
    graph::{AnalyserNode, DeviceContext, GraphRoute},
    Result, SoundError,
};

mod element;
mod library;

pub use element::NativeElementBackend;
pub use library::LibraryBackend;

/// Suspension returned by [`AudioBackend::play`]. Playback work starts when
/// `play` is called; the future only observes when the clip can play through.
pub type PlayFuture = Pin<Box<dyn Future<Output = Result<()>> + Send + 'static>>;

/// Shared contract of every playback technology.
pub trait AudioBackend: Send + Sync + fmt::Debug {
    fn kind(&self) -> BackendKind;

    /// Tracked clips, graphs and the volume policy.
    fn state(&self) -> &Arc<BackendState>;

    /// Creates a clip bound to `source_uri` and tracks it. Does not start
    /// playback.
    fn add(&self, source_uri: &str, callbacks: ClipCallbacks) -> Clip;

    /// Starts playback; resolves once the clip can play through.
    ///
    /// A rejected attempt also fails the clip, so `on_error` fires through the
    /// same path as a natural error.
    fn play(&self, clip: &Clip) -> PlayFuture;

    /// Creates and tracks a device context for `clip`'s analysis path.
    fn add_context(&self, clip: &Clip) -> Result<DeviceContext> {
        self.state().add_context(clip)
    }

    /// Routes `clip -> analyser -> context` and tracks the analyser.
    fn add_analyzer(&self, clip: &Clip, context: &DeviceContext) -> Result<AnalyserNode> {
        self.state().add_analyser(clip, context)
    }

    /// Loudness of the analyser's current window, or the fallback reading.
    fn analyze(&self, analyser: Option<&AnalyserNode>) -> f32 {
        analysis::measure(analyser)
    }

    fn dispose(&self, clip: &Clip) {
        clip.dispose();
    }

    /// Closes every context and disposes every clip, newest first.
    fn destroy(&self) {
        self.state().destroy();
    }

    fn volume(&self) -> f32 {
        self.state().volume()
    }

    /// Applies `value` (clamped) to every live clip and to future clips.
    fn set_volume(&self, value: f32) -> f32 {
        self.state().set_volume(value)
    }
}

/// Clamps a requested volume into `[0, 1]`; NaN becomes silence.
pub fn clamp_volume(value: f32) -> f32 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

struct LiveClips {
    volume: f32,
    clips: Vec<Clip>,
}

#[derive(Default)]
struct Graphs {
    analysers: Vec<AnalyserNode>,
    contexts: Vec<DeviceContext>,
}

/// State every backend variant tracks: live clips, live analysis graphs and
/// the volume shared by all clips.
pub struct BackendState {
    config: SoundConfig,
    live: Mutex<LiveClips>,
    graphs: Mutex<Graphs>,
    activated: AtomicBool,
}

impl BackendState {
    pub fn new(config: SoundConfig) -> Arc<Self> {
        Arc::new(Self {
            live: Mutex::new(LiveClips {
                volume: clamp_volume(config.volume),
                clips: Vec::new(),
            }),
            graphs: Mutex::new(Graphs::default()),
            activated: AtomicBool::new(false),
            config,
        })
    }

    pub fn config(&self) -> &SoundConfig {
        &self.config
    }

    pub fn volume(&self) -> f32 {
        self.live.lock().volume
    }

    /// Every live clip reflects the new value before this returns.
    pub fn set_volume(&self, value: f32) -> f32 {
        let volume = clamp_volume(value);
        let mut live = self.live.lock();
        live.volume = volume;
        for clip in &live.clips {
            clip.set_volume(volume);
        }
        volume
    }

    /// Snapshot of the live clips, oldest first.
    pub fn clips(&self) -> Vec<Clip> {
        self.live.lock().clips.clone()
    }

    pub fn live_clips(&self) -> usize {
        self.live.lock().clips.len()
    }

    pub fn live_analysers(&self) -> usize {
        self.graphs.lock().analysers.len()
    }

    pub fn live_contexts(&self) -> usize {
        self.graphs.lock().contexts.len()
    }

    /// Lifts the autoplay gate for this backend.
    pub fn notify_user_activation(&self) {
        self.activated.store(true, Ordering::Release);
    }

    pub(crate) fn admit(self: &Arc<Self>, source_uri: &str, callbacks: ClipCallbacks) -> Clip {
        let mut live = self.live.lock();
        let clip = Clip::new(source_uri, callbacks, Arc::downgrade(self), live.volume);
        live.clips.push(clip.clone());
        tracing::debug!(clip = %clip.id(), source = source_uri, volume = live.volume, "clip added");
        clip
    }

    pub(crate) fn check_autoplay(&self, clip: &Clip) -> Result<()> {
        match self.config.playback.autoplay {
            AutoplayPolicy::Allowed => Ok(()),
            AutoplayPolicy::RequiresActivation if self.activated.load(Ordering::Acquire) => Ok(()),
            AutoplayPolicy::RequiresActivation => Err(SoundError::rejected(
                clip.source_uri(),
                "playback requires a prior user activation",
            )),
        }
    }

    pub(crate) fn add_context(&self, clip: &Clip) -> Result<DeviceContext> {
        let mut graphs = self.graphs.lock();
        // Under the graphs lock so a concurrent settlement cannot miss it.
        if clip.is_settled() {
            return Err(SoundError::Disposed(clip.id().get()));
        }
        let context = DeviceContext::new(clip.id(), self.config.playback.context_sample_rate);
        graphs.contexts.push(context.clone());
        Ok(context)
    }

    pub(crate) fn add_analyser(&self, clip: &Clip, context: &DeviceContext) -> Result<AnalyserNode> {
        let mut graphs = self.graphs.lock();
        if clip.is_settled() {
            return Err(SoundError::Disposed(clip.id().get()));
        }
        if clip.is_routed() {
            return Err(SoundError::AlreadyRouted(clip.id().get()));
        }

        let analyser = context.create_analyser(&self.config.analyser)?;
        clip.connect(GraphRoute {
            analyser: analyser.clone(),
            context: context.clone(),
        })?;
        if !graphs.contexts.iter().any(|tracked| tracked.same(context)) {
            graphs.contexts.push(context.clone());
        }
        graphs.analysers.push(analyser.clone());
        tracing::debug!(clip = %clip.id(), context = context.id(), analyser = analyser.id(), "analyser connected");
        Ok(analyser)
    }

    /// Untracks a settled clip and tears down the graph it owns.
    pub(crate) fn forget(&self, clip: &Clip) {
        self.live.lock().clips.retain(|live| !live.same(clip));

        let owned = {
            let mut graphs = self.graphs.lock();
            graphs.analysers.retain(|analyser| analyser.owner() != clip.id());
            let (owned, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut graphs.contexts)
                .into_iter()
                .partition(|context| context.owner() == clip.id());
            graphs.contexts = kept;
            owned
        };
        for context in owned.iter().rev() {
            context.close();
        }
    }

    /// Releases contexts, then clips, newest first. Idempotent.
    pub(crate) fn destroy(&self) {
        let contexts = {
            let mut graphs = self.graphs.lock();
            graphs.analysers.clear();
            std::mem::take(&mut graphs.contexts)
        };
        for context in contexts.iter().rev() {
            context.close();
        }

        let clips = self.clips();
        for clip in clips.iter().rev() {
            clip.dispose();
        }
        self.live.lock().clips.clear();

        if !contexts.is_empty() || !clips.is_empty() {
            tracing::info!(
                contexts = contexts.len(),
                clips = clips.len(),
                "released all audio resources"
            );
        }
    }
}

impl fmt::Debug for BackendState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendState")
            .field("volume", &self.volume())
            .field("clips", &self.live_clips())
            .field("analysers", &self.live_analysers())
            .field("contexts", &self.live_contexts())
            .finish()
    }
}

/// Play sequence shared by both variants: gate, register the waiter, start.
pub(crate) fn start_playback(state: &BackendState, clip: &Clip) -> PlayFuture {
    let id = clip.id().get();
    if clip.is_settled() {
        // A failed clip reports its failure again; anything else is gone.
        let result = match clip.wait_ready().try_recv() {
            Ok(Err(err)) if clip.state() == ClipState::Failed => Err(err),
            _ => Err(SoundError::Disposed(id)),
        };
        return Box::pin(std::future::ready(result));
    }

    if let Err(err) = state.check_autoplay(clip) {
        clip.fail(err.clone());
        return Box::pin(std::future::ready(Err(err)));
    }

    let ready = clip.wait_ready();
    let started = match clip.playback() {
        Some(playback) => playback.start(),
        None => Err(SoundError::rejected(clip.source_uri(), "clip has no playback resource")),
    };
    if let Err(err) = started {
        clip.fail(err);
    }

    Box::pin(async move { ready.await.unwrap_or(Err(SoundError::Disposed(id))) })
}
