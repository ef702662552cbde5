use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
};

use parking_lot::Mutex;

use super::{start_playback, AudioBackend, BackendState, PlayFuture};
use crate::{
    clip::{Clip, ClipCallbacks, Playback, WeakClip},
    config::{BackendKind, SoundConfig},
    render::{join_worker, FeedStatus, Gain, SampleFeed, Voice},
    source::{self, DecodedAudio},
    Result, SoundError,
};

/// Backend whose clips are preloaded sounds.
///
/// Decoding starts on `add`; `play` starts a voice over the decoded buffer
/// once loading completes.
#[derive(Debug)]
pub struct LibraryBackend {
    state: Arc<BackendState>,
}

impl LibraryBackend {
    pub fn new(config: SoundConfig) -> Self {
        Self {
            state: BackendState::new(config),
        }
    }
}

impl AudioBackend for LibraryBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Library
    }

    fn state(&self) -> &Arc<BackendState> {
        &self.state
    }

    fn add(&self, source_uri: &str, callbacks: ClipCallbacks) -> Clip {
        let clip = self.state.admit(source_uri, callbacks);
        let sound = Arc::new(Sound::new(
            source_uri,
            clip.downgrade(),
            clip.volume(),
            self.state.config().playback.render_quantum,
        ));
        if clip.install(sound.clone()) {
            clip.mark_loading();
            if let Err(err) = sound.preload() {
                clip.fail(err);
            }
        }
        clip
    }

    fn play(&self, clip: &Clip) -> PlayFuture {
        tracing::debug!(clip = %clip.id(), source = clip.source_uri(), "sound play requested");
        start_playback(&self.state, clip)
    }
}

enum LoadState {
    Loading,
    Loaded(DecodedAudio),
    Failed,
}

struct SoundInner {
    load: LoadState,
    play_requested: bool,
    voice: Option<Voice>,
    loader: Option<JoinHandle<()>>,
}

/// Preloaded playback resource of one clip.
pub(crate) struct Sound {
    source_uri: String,
    clip: WeakClip,
    gain: Gain,
    quantum: usize,
    released: AtomicBool,
    inner: Mutex<SoundInner>,
}

impl Sound {
    fn new(source_uri: &str, clip: WeakClip, volume: f32, quantum: usize) -> Self {
        Self {
            source_uri: source_uri.to_string(),
            clip,
            gain: Gain::new(volume),
            quantum,
            released: AtomicBool::new(false),
            inner: Mutex::new(SoundInner {
                load: LoadState::Loading,
                play_requested: false,
                voice: None,
                loader: None,
            }),
        }
    }

    fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    /// Spawns the loader. The handle is stored under the same lock `release`
    /// takes, so a release always sees it.
    fn preload(self: &Arc<Self>) -> Result<()> {
        let mut inner = self.inner.lock();
        if self.is_released() {
            return Ok(());
        }
        let sound = Arc::clone(self);
        let handle = thread::Builder::new()
            .name("sound-loader".to_string())
            .spawn(move || sound.load())
            .map_err(|e| SoundError::load(&self.source_uri, format!("failed to spawn loader thread: {e}")))?;
        inner.loader = Some(handle);
        Ok(())
    }

    fn load(&self) {
        // Checked between chunks so a release never waits on a whole decode.
        let decoded = source::decode_while(&self.source_uri, || !self.is_released());

        let result = {
            let mut inner = self.inner.lock();
            if self.is_released() {
                return;
            }
            match decoded {
                Ok(Some(audio)) => {
                    tracing::debug!(
                        source = %self.source_uri,
                        duration_ms = audio.duration().as_millis() as u64,
                        "sound loaded"
                    );
                    let play_now = inner.play_requested;
                    inner.load = LoadState::Loaded(audio);
                    if play_now {
                        self.begin(&mut inner).map(|()| true)
                    } else {
                        Ok(false)
                    }
                }
                Ok(None) => return,
                Err(err) => {
                    inner.load = LoadState::Failed;
                    Err(err)
                }
            }
        };

        match result {
            Ok(true) => self.clip.ready(),
            Ok(false) => {}
            Err(err) => self.clip.fail(err),
        }
    }

    /// Spawns the voice over the decoded buffer. Caller holds the lock.
    fn begin(&self, inner: &mut SoundInner) -> Result<()> {
        if inner.voice.is_some() {
            return Ok(());
        }
        let LoadState::Loaded(audio) = &inner.load else {
            return Ok(());
        };
        let voice = Voice::spawn(
            "sound-voice",
            self.clip.clone(),
            Box::new(BufferFeed::new(audio.clone())),
            self.gain.clone(),
            self.quantum,
        )?;
        inner.voice = Some(voice);
        Ok(())
    }
}

impl Playback for Sound {
    fn start(&self) -> Result<()> {
        let started = {
            let mut inner = self.inner.lock();
            if self.is_released() {
                return Err(SoundError::rejected(&self.source_uri, "sound has been released"));
            }
            inner.play_requested = true;
            match inner.load {
                LoadState::Loading => false,
                LoadState::Loaded(_) => {
                    self.begin(&mut inner)?;
                    true
                }
                LoadState::Failed => {
                    return Err(SoundError::rejected(&self.source_uri, "sound failed to load"))
                }
            }
        };

        if started {
            self.clip.ready();
        }
        Ok(())
    }

    fn set_volume(&self, volume: f32) {
        self.gain.set(volume);
    }

    fn release(&self) {
        let (voice, loader) = {
            let mut inner = self.inner.lock();
            self.released.store(true, Ordering::Release);
            inner.load = LoadState::Failed;
            (inner.voice.take(), inner.loader.take())
        };
        if let Some(voice) = voice {
            voice.stop();
        }
        if let Some(loader) = loader {
            join_worker(loader);
        }
    }
}

/// Feed over a fully decoded clip.
struct BufferFeed {
    audio: DecodedAudio,
    position: usize,
}

impl BufferFeed {
    fn new(audio: DecodedAudio) -> Self {
        Self { audio, position: 0 }
    }
}

impl SampleFeed for BufferFeed {
    fn sample_rate(&self) -> Option<u32> {
        Some(self.audio.sample_rate)
    }

    fn pull(&mut self, out: &mut Vec<f32>, max_frames: usize) -> FeedStatus {
        let samples = &self.audio.samples;
        if self.position >= samples.len() {
            return FeedStatus::Ended;
        }
        let end = (self.position + max_frames).min(samples.len());
        out.extend_from_slice(&samples[self.position..end]);
        self.position = end;
        FeedStatus::Data
    }
}
