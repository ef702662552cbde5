use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use parking_lot::Mutex;

use super::{start_playback, AudioBackend, BackendState, PlayFuture};
use crate::{
    clip::{Clip, ClipCallbacks, Playback, WeakClip},
    config::{BackendKind, PlaybackConfig, SoundConfig},
    render::{join_worker, FeedStatus, Gain, SampleFeed, Voice},
    source::SourceStream,
    Result, SoundError,
};

/// How long an empty feed blocks waiting for the fetch thread.
const FEED_WAIT: Duration = Duration::from_millis(2);

/// Backend whose clips stream like a media element with `preload = none`.
///
/// Nothing is fetched until `play`, which spawns a fetch thread decoding
/// into a bounded queue and a voice rendering from it as data arrives.
#[derive(Debug)]
pub struct NativeElementBackend {
    state: Arc<BackendState>,
}

impl NativeElementBackend {
    pub fn new(config: SoundConfig) -> Self {
        Self {
            state: BackendState::new(config),
        }
    }
}

impl AudioBackend for NativeElementBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Element
    }

    fn state(&self) -> &Arc<BackendState> {
        &self.state
    }

    fn add(&self, source_uri: &str, callbacks: ClipCallbacks) -> Clip {
        let clip = self.state.admit(source_uri, callbacks);
        let element = MediaElement::new(
            source_uri,
            clip.downgrade(),
            clip.volume(),
            self.state.config().playback.clone(),
        );
        clip.install(Arc::new(element));
        clip
    }

    fn play(&self, clip: &Clip) -> PlayFuture {
        tracing::debug!(clip = %clip.id(), source = clip.source_uri(), "element play requested");
        start_playback(&self.state, clip)
    }
}

enum StreamChunk {
    Format(u32),
    Samples(Vec<f32>),
    End,
}

struct ElementWorkers {
    voice: Voice,
    fetch: JoinHandle<()>,
}

/// Streaming playback resource of one clip.
pub(crate) struct MediaElement {
    source_uri: String,
    clip: WeakClip,
    gain: Gain,
    playback: PlaybackConfig,
    halt: Arc<AtomicBool>,
    workers: Mutex<Option<ElementWorkers>>,
    started: AtomicBool,
}

impl MediaElement {
    fn new(source_uri: &str, clip: WeakClip, volume: f32, playback: PlaybackConfig) -> Self {
        Self {
            source_uri: source_uri.to_string(),
            clip,
            gain: Gain::new(volume),
            playback,
            halt: Arc::new(AtomicBool::new(false)),
            workers: Mutex::new(None),
            started: AtomicBool::new(false),
        }
    }
}

impl Playback for MediaElement {
    fn start(&self) -> Result<()> {
        let mut workers = self.workers.lock();
        if self.halt.load(Ordering::Acquire) {
            return Err(SoundError::rejected(&self.source_uri, "media element has been released"));
        }
        if self.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        if let Some(clip) = self.clip.upgrade() {
            clip.mark_loading();
        }

        let (chunk_tx, chunk_rx) = bounded(self.playback.stream_capacity);
        let fetch = {
            let job = FetchJob {
                source_uri: self.source_uri.clone(),
                clip: self.clip.clone(),
                chunk_tx,
                halt: self.halt.clone(),
                can_play_through: Duration::from_millis(self.playback.can_play_through_ms),
            };
            thread::Builder::new()
                .name("element-fetch".to_string())
                .spawn(move || job.run())
                .map_err(|e| SoundError::load(&self.source_uri, format!("failed to spawn fetch thread: {e}")))?
        };

        let voice = Voice::spawn(
            "element-voice",
            self.clip.clone(),
            Box::new(StreamFeed::new(chunk_rx)),
            self.gain.clone(),
            self.playback.render_quantum,
        );
        let voice = match voice {
            Ok(voice) => voice,
            Err(err) => {
                self.halt.store(true, Ordering::Release);
                join_worker(fetch);
                return Err(err);
            }
        };

        *workers = Some(ElementWorkers { voice, fetch });
        Ok(())
    }

    fn set_volume(&self, volume: f32) {
        self.gain.set(volume);
    }

    fn release(&self) {
        let workers = {
            let mut workers = self.workers.lock();
            self.halt.store(true, Ordering::Release);
            workers.take()
        };

        if let Some(ElementWorkers { voice, fetch }) = workers {
            // The voice owns the queue's receiver; stopping it unblocks the fetcher.
            voice.stop();
            join_worker(fetch);
        }
    }
}

struct FetchJob {
    source_uri: String,
    clip: WeakClip,
    chunk_tx: Sender<StreamChunk>,
    halt: Arc<AtomicBool>,
    can_play_through: Duration,
}

impl FetchJob {
    fn run(self) {
        if let Err(err) = self.stream() {
            if !self.halt.load(Ordering::Acquire) {
                self.clip.fail(err);
            }
        }
    }

    fn stream(&self) -> Result<()> {
        let mut source = SourceStream::open(&self.source_uri)?;
        let sample_rate = source.sample_rate();
        tracing::debug!(source = %self.source_uri, sample_rate, "element metadata loaded");
        if !self.send(StreamChunk::Format(sample_rate)) {
            return Ok(());
        }

        let threshold = (self.can_play_through.as_secs_f64() * sample_rate as f64) as u64;
        let mut buffered = 0u64;
        let mut signalled = false;

        while let Some(chunk) = source.next_chunk()? {
            buffered += chunk.len() as u64;
            if !self.send(StreamChunk::Samples(chunk)) {
                return Ok(());
            }
            if !signalled && buffered >= threshold {
                signalled = true;
                self.clip.ready();
            }
        }

        if !signalled {
            self.clip.ready();
        }
        self.send(StreamChunk::End);
        Ok(())
    }

    /// False once the element has been released or the voice is gone.
    fn send(&self, chunk: StreamChunk) -> bool {
        !self.halt.load(Ordering::Acquire) && self.chunk_tx.send(chunk).is_ok()
    }
}

/// Voice-side end of the decode queue.
struct StreamFeed {
    chunk_rx: Receiver<StreamChunk>,
    sample_rate: Option<u32>,
    pending: Vec<f32>,
    offset: usize,
    ended: bool,
}

impl StreamFeed {
    fn new(chunk_rx: Receiver<StreamChunk>) -> Self {
        Self {
            chunk_rx,
            sample_rate: None,
            pending: Vec::new(),
            offset: 0,
            ended: false,
        }
    }

    fn receive(&mut self, block: bool) -> Option<FeedStatus> {
        loop {
            let chunk = if block {
                match self.chunk_rx.recv_timeout(FEED_WAIT) {
                    Ok(chunk) => chunk,
                    Err(RecvTimeoutError::Timeout) => return None,
                    Err(RecvTimeoutError::Disconnected) => return Some(self.disconnected()),
                }
            } else {
                match self.chunk_rx.try_recv() {
                    Ok(chunk) => chunk,
                    Err(TryRecvError::Empty) => return None,
                    Err(TryRecvError::Disconnected) => return Some(self.disconnected()),
                }
            };

            match chunk {
                StreamChunk::Format(sample_rate) => self.sample_rate = Some(sample_rate),
                StreamChunk::Samples(samples) => {
                    self.pending = samples;
                    self.offset = 0;
                    return None;
                }
                StreamChunk::End => {
                    self.ended = true;
                    return None;
                }
            }
        }
    }

    fn disconnected(&mut self) -> FeedStatus {
        self.ended = true;
        FeedStatus::Failed(SoundError::msg("media stream closed before the end of the source"))
    }
}

impl SampleFeed for StreamFeed {
    fn sample_rate(&self) -> Option<u32> {
        self.sample_rate
    }

    fn pull(&mut self, out: &mut Vec<f32>, max_frames: usize) -> FeedStatus {
        while out.len() < max_frames && !self.ended {
            if self.offset >= self.pending.len() {
                // Only wait on the queue while the block is still empty.
                if let Some(status) = self.receive(out.is_empty()) {
                    return status;
                }
                if self.offset >= self.pending.len() {
                    break;
                }
            }

            let take = (max_frames - out.len()).min(self.pending.len() - self.offset);
            out.extend_from_slice(&self.pending[self.offset..self.offset + take]);
            self.offset += take;
        }

        if !out.is_empty() {
            FeedStatus::Data
        } else if self.ended {
            FeedStatus::Ended
        } else {
            FeedStatus::Starved
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feed_reassembles_blocks_across_chunks() {
        let (tx, rx) = bounded(8);
        let mut feed = StreamFeed::new(rx);

        tx.send(StreamChunk::Format(8_000)).unwrap();
        tx.send(StreamChunk::Samples(vec![1.0; 3])).unwrap();
        tx.send(StreamChunk::Samples(vec![2.0; 3])).unwrap();
        tx.send(StreamChunk::End).unwrap();

        let mut out = Vec::new();
        assert!(matches!(feed.pull(&mut out, 4), FeedStatus::Data));
        assert_eq!(out, vec![1.0, 1.0, 1.0, 2.0]);
        assert_eq!(feed.sample_rate(), Some(8_000));

        out.clear();
        assert!(matches!(feed.pull(&mut out, 4), FeedStatus::Data));
        assert_eq!(out, vec![2.0, 2.0]);

        out.clear();
        assert!(matches!(feed.pull(&mut out, 4), FeedStatus::Ended));
    }

    #[test]
    fn empty_queue_starves() {
        let (tx, rx) = bounded::<StreamChunk>(8);
        let mut feed = StreamFeed::new(rx);

        let mut out = Vec::new();
        assert!(matches!(feed.pull(&mut out, 4), FeedStatus::Starved));

        drop(tx);
        assert!(matches!(feed.pull(&mut out, 4), FeedStatus::Failed(_)));
    }
}
