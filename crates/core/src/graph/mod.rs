use std::{
    f32::consts::PI,
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
};

use parking_lot::Mutex;
use realfft::{num_complex::Complex32, RealFftPlanner, RealToComplex};

use crate::{clip::ClipId, config::AnalyserSettings, Result, SoundError};

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_ANALYSER_ID: AtomicU64 = AtomicU64::new(1);

/// Lifecycle of a device context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    Running,
    Closed,
}

/// Audio-device context dedicated to one clip's analysis path.
///
/// The clip's output is routed `clip -> analyser -> destination`, where the
/// destination only counts rendered frames. Closing the context disconnects
/// every analyser created on it.
#[derive(Clone)]
pub struct DeviceContext {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    id: u64,
    owner: ClipId,
    sample_rate: u32,
    closed: AtomicBool,
    frames_rendered: AtomicU64,
    analysers: Mutex<Vec<AnalyserNode>>,
}

impl DeviceContext {
    pub(crate) fn new(owner: ClipId, sample_rate: u32) -> Self {
        let id = NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(context = id, clip = %owner, sample_rate, "audio context opened");
        Self {
            inner: Arc::new(ContextInner {
                id,
                owner,
                sample_rate,
                closed: AtomicBool::new(false),
                frames_rendered: AtomicU64::new(0),
                analysers: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Clip whose analysis path this context serves.
    pub fn owner(&self) -> ClipId {
        self.inner.owner
    }

    pub fn sample_rate(&self) -> u32 {
        self.inner.sample_rate
    }

    pub fn state(&self) -> ContextState {
        if self.is_closed() {
            ContextState::Closed
        } else {
            ContextState::Running
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Frames that reached this context's destination.
    pub fn frames_rendered(&self) -> u64 {
        self.inner.frames_rendered.load(Ordering::Relaxed)
    }

    /// Creates an analyser node owned by this context.
    pub fn create_analyser(&self, settings: &AnalyserSettings) -> Result<AnalyserNode> {
        let mut analysers = self.inner.analysers.lock();
        // Checked under the lock so `close` cannot miss a node created concurrently.
        if self.is_closed() {
            return Err(SoundError::ContextClosed(self.inner.id));
        }

        let analyser = AnalyserNode::new(self.inner.owner, self.inner.id, settings.clone());
        analysers.push(analyser.clone());
        Ok(analyser)
    }

    /// Closes the context and disconnects its analysers. Idempotent.
    pub fn close(&self) {
        let analysers = {
            let mut analysers = self.inner.analysers.lock();
            if self.inner.closed.swap(true, Ordering::AcqRel) {
                return;
            }
            std::mem::take(&mut *analysers)
        };

        for analyser in analysers.iter().rev() {
            analyser.disconnect();
        }
        tracing::debug!(context = self.inner.id, "audio context closed");
    }

    pub(crate) fn render(&self, block: &[f32]) -> bool {
        if self.is_closed() {
            return false;
        }
        self.inner
            .frames_rendered
            .fetch_add(block.len() as u64, Ordering::Relaxed);
        true
    }

    pub(crate) fn same(&self, other: &DeviceContext) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for DeviceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceContext")
            .field("id", &self.inner.id)
            .field("owner", &self.inner.owner)
            .field("sample_rate", &self.inner.sample_rate)
            .field("state", &self.state())
            .finish()
    }
}

/// Analyser node exposing the latest window of time-domain samples and the
/// smoothed spectrum derived from it.
#[derive(Clone)]
pub struct AnalyserNode {
    shared: Arc<AnalyserShared>,
}

struct AnalyserShared {
    id: u64,
    owner: ClipId,
    context_id: u64,
    settings: AnalyserSettings,
    connected: AtomicBool,
    window: Mutex<TimeWindow>,
    spectrum: Mutex<Option<Spectrum>>,
}

struct TimeWindow {
    samples: Vec<f32>,
    cursor: usize,
}

impl AnalyserNode {
    fn new(owner: ClipId, context_id: u64, settings: AnalyserSettings) -> Self {
        let size = settings.fft_size;
        Self {
            shared: Arc::new(AnalyserShared {
                id: NEXT_ANALYSER_ID.fetch_add(1, Ordering::Relaxed),
                owner,
                context_id,
                settings,
                connected: AtomicBool::new(true),
                window: Mutex::new(TimeWindow {
                    samples: vec![0.0; size],
                    cursor: 0,
                }),
                spectrum: Mutex::new(None),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn owner(&self) -> ClipId {
        self.shared.owner
    }

    pub fn context_id(&self) -> u64 {
        self.shared.context_id
    }

    pub fn settings(&self) -> &AnalyserSettings {
        &self.shared.settings
    }

    pub fn fft_size(&self) -> usize {
        self.shared.settings.fft_size
    }

    pub fn frequency_bin_count(&self) -> usize {
        self.shared.settings.frequency_bin_count()
    }

    /// False once the owning context has been closed.
    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    /// Copies the current window, oldest sample first, into `out`.
    ///
    /// Copies at most `fft_size` samples; the remainder of `out` is zeroed.
    pub fn float_time_domain_data(&self, out: &mut [f32]) {
        out.fill(0.0);
        let window = self.shared.window.lock();
        let len = window.samples.len();
        for (i, slot) in out.iter_mut().take(len).enumerate() {
            *slot = window.samples[(window.cursor + i) % len];
        }
    }

    /// Smoothed magnitude spectrum in decibels, one value per bin.
    pub fn float_frequency_data(&self, out: &mut [f32]) {
        let magnitudes = self.smoothed_magnitudes();
        out.fill(f32::NEG_INFINITY);
        for (slot, magnitude) in out.iter_mut().zip(magnitudes) {
            *slot = to_decibels(magnitude);
        }
    }

    /// Spectrum mapped through `[min_decibels, max_decibels]` onto `0..=255`.
    pub fn byte_frequency_data(&self, out: &mut [u8]) {
        let settings = &self.shared.settings;
        let range = settings.max_decibels - settings.min_decibels;
        let magnitudes = self.smoothed_magnitudes();
        out.fill(0);
        for (slot, magnitude) in out.iter_mut().zip(magnitudes) {
            let db = to_decibels(magnitude);
            let scaled = (255.0 / range) * (db - settings.min_decibels);
            *slot = scaled.floor().clamp(0.0, 255.0) as u8;
        }
    }

    pub(crate) fn ingest(&self, block: &[f32]) {
        if !self.is_connected() {
            return;
        }
        let mut window = self.shared.window.lock();
        let len = window.samples.len();
        let start = block.len().saturating_sub(len);
        for &sample in &block[start..] {
            let cursor = window.cursor;
            window.samples[cursor] = sample;
            window.cursor = (cursor + 1) % len;
        }
    }

    fn disconnect(&self) {
        self.shared.connected.store(false, Ordering::Release);
        let mut window = self.shared.window.lock();
        window.samples.fill(0.0);
        window.cursor = 0;
        *self.shared.spectrum.lock() = None;
    }

    fn smoothed_magnitudes(&self) -> Vec<f32> {
        let size = self.fft_size();
        let mut input = vec![0.0; size];
        self.float_time_domain_data(&mut input);

        let mut spectrum = self.shared.spectrum.lock();
        let spectrum = spectrum.get_or_insert_with(|| Spectrum::new(size));
        spectrum.update(&input, self.shared.settings.smoothing_time_constant);
        spectrum.smoothed.clone()
    }
}

impl fmt::Debug for AnalyserNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnalyserNode")
            .field("id", &self.shared.id)
            .field("owner", &self.shared.owner)
            .field("context_id", &self.shared.context_id)
            .field("connected", &self.is_connected())
            .finish()
    }
}

struct Spectrum {
    plan: Arc<dyn RealToComplex<f32>>,
    input: Vec<f32>,
    output: Vec<Complex32>,
    scratch: Vec<Complex32>,
    smoothed: Vec<f32>,
}

impl Spectrum {
    fn new(size: usize) -> Self {
        let plan = RealFftPlanner::<f32>::new().plan_fft_forward(size);
        Self {
            input: plan.make_input_vec(),
            output: plan.make_output_vec(),
            scratch: plan.make_scratch_vec(),
            smoothed: vec![0.0; size / 2],
            plan,
        }
    }

    fn update(&mut self, samples: &[f32], smoothing: f32) {
        let len = self.input.len();
        for (index, (slot, sample)) in self.input.iter_mut().zip(samples).enumerate() {
            *slot = sample * blackman(index, len);
        }

        if self
            .plan
            .process_with_scratch(&mut self.input, &mut self.output, &mut self.scratch)
            .is_err()
        {
            return;
        }

        for (smoothed, bin) in self.smoothed.iter_mut().zip(&self.output) {
            let magnitude = bin.norm() / len as f32;
            *smoothed = smoothing * *smoothed + (1.0 - smoothing) * magnitude;
        }
    }
}

fn blackman(index: usize, len: usize) -> f32 {
    const ALPHA: f32 = 0.16;
    let a0 = 0.5 * (1.0 - ALPHA);
    let a2 = 0.5 * ALPHA;
    let phase = 2.0 * PI * index as f32 / len as f32;
    a0 - 0.5 * phase.cos() + a2 * (2.0 * phase).cos()
}

fn to_decibels(magnitude: f32) -> f32 {
    20.0 * magnitude.log10()
}

/// Route from a clip's voice through its analyser to the context destination.
#[derive(Debug, Clone)]
pub(crate) struct GraphRoute {
    pub(crate) analyser: AnalyserNode,
    pub(crate) context: DeviceContext,
}

impl GraphRoute {
    pub(crate) fn deliver(&self, block: &[f32]) {
        if self.context.is_closed() {
            return;
        }
        self.analyser.ingest(block);
        self.context.render(block);
    }
}
