use std::{
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};

use crate::{clip::WeakClip, Result, SoundError};

/// How long a starved voice waits before polling its feed again.
const STARVED_POLL: Duration = Duration::from_millis(5);

/// Result of asking a feed for the next block.
#[derive(Debug)]
pub(crate) enum FeedStatus {
    /// `out` holds at least one sample.
    Data,
    /// Nothing buffered yet; try again shortly.
    Starved,
    Ended,
    Failed(SoundError),
}

/// Source of decoded mono samples for a voice.
pub(crate) trait SampleFeed: Send + 'static {
    /// Known once the source has been probed.
    fn sample_rate(&self) -> Option<u32>;

    /// Appends up to `max_frames` samples to `out`.
    fn pull(&mut self, out: &mut Vec<f32>, max_frames: usize) -> FeedStatus;
}

/// Linear gain shared between a playback resource and its voice.
#[derive(Debug, Clone)]
pub(crate) struct Gain(Arc<AtomicU32>);

impl Gain {
    pub(crate) fn new(value: f32) -> Self {
        Self(Arc::new(AtomicU32::new(value.to_bits())))
    }

    pub(crate) fn get(&self) -> f32 {
        f32::from_bits(self.0.load(Ordering::Acquire))
    }

    pub(crate) fn set(&self, value: f32) {
        self.0.store(value.to_bits(), Ordering::Release);
    }
}

/// Wall-clock pacing for rendered media time.
#[derive(Debug, Clone)]
pub struct PlaybackClock {
    started: Instant,
    sample_rate: u32,
    frames: u64,
}

impl PlaybackClock {
    pub fn start(sample_rate: u32) -> Self {
        Self {
            started: Instant::now(),
            sample_rate: sample_rate.max(1),
            frames: 0,
        }
    }

    pub fn advance(&mut self, frames: usize) {
        self.frames += frames as u64;
    }

    /// Media time rendered so far.
    pub fn media_time(&self) -> Duration {
        Duration::from_secs_f64(self.frames as f64 / self.sample_rate as f64)
    }

    /// Time left until the rendered media time is due.
    pub fn until_due(&self) -> Duration {
        (self.started + self.media_time()).saturating_duration_since(Instant::now())
    }

    /// Re-anchors the clock after a stall so playback does not burst to
    /// catch up.
    pub fn resync(&mut self) {
        self.started = Instant::now()
            .checked_sub(self.media_time())
            .unwrap_or_else(Instant::now);
    }
}

/// Handle to a running voice thread.
///
/// The voice pulls blocks from its feed, applies gain, hands them to the
/// clip's route and sleeps until the wall clock catches up. Stop requests
/// interrupt the sleep.
pub(crate) struct Voice {
    stop_tx: Sender<()>,
    handle: Option<JoinHandle<()>>,
}

impl Voice {
    pub(crate) fn spawn(
        name: &str,
        clip: WeakClip,
        feed: Box<dyn SampleFeed>,
        gain: Gain,
        quantum: usize,
    ) -> Result<Self> {
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || run(clip, feed, gain, stop_rx, quantum.max(1)))
            .map_err(|e| SoundError::msg(format!("failed to spawn voice thread: {e}")))?;

        Ok(Self {
            stop_tx,
            handle: Some(handle),
        })
    }

    /// Stops the voice and waits for its thread, unless called from it.
    pub(crate) fn stop(mut self) {
        let _ = self.stop_tx.try_send(());
        if let Some(handle) = self.handle.take() {
            join_worker(handle);
        }
    }
}

impl Drop for Voice {
    fn drop(&mut self) {
        let _ = self.stop_tx.try_send(());
    }
}

/// Joins a worker thread. A worker releasing its own resources is detached
/// instead; it is already on its way out.
pub(crate) fn join_worker(handle: JoinHandle<()>) {
    if handle.thread().id() == thread::current().id() {
        return;
    }
    if handle.join().is_err() {
        tracing::warn!("audio worker panicked during shutdown");
    }
}

fn run(
    clip: WeakClip,
    mut feed: Box<dyn SampleFeed>,
    gain: Gain,
    stop_rx: Receiver<()>,
    quantum: usize,
) {
    let mut clock: Option<PlaybackClock> = None;
    let mut block = Vec::with_capacity(quantum);

    loop {
        block.clear();
        match feed.pull(&mut block, quantum) {
            FeedStatus::Data => {}
            FeedStatus::Starved => {
                if stop_requested(&stop_rx, STARVED_POLL) {
                    return;
                }
                if let Some(clock) = clock.as_mut() {
                    clock.resync();
                }
                continue;
            }
            FeedStatus::Ended => {
                clip.finish();
                return;
            }
            FeedStatus::Failed(err) => {
                clip.fail(err);
                return;
            }
        }

        let level = gain.get();
        for sample in block.iter_mut() {
            *sample *= level;
        }
        if !clip.deliver(&block) {
            return;
        }

        let Some(sample_rate) = feed.sample_rate() else {
            continue;
        };
        let clock = clock.get_or_insert_with(|| PlaybackClock::start(sample_rate));
        clock.advance(block.len());
        if stop_requested(&stop_rx, clock.until_due()) {
            return;
        }
    }
}

fn stop_requested(stop_rx: &Receiver<()>, wait: Duration) -> bool {
    match stop_rx.recv_timeout(wait) {
        Ok(()) | Err(RecvTimeoutError::Disconnected) => true,
        Err(RecvTimeoutError::Timeout) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_paces_media_time() {
        let mut clock = PlaybackClock::start(1_000);
        clock.advance(500);
        assert_eq!(clock.media_time(), Duration::from_millis(500));

        let due = clock.until_due();
        assert!(due <= Duration::from_millis(500));
        assert!(due > Duration::from_millis(400));
    }

    #[test]
    fn resync_keeps_media_time_due_now() {
        let mut clock = PlaybackClock::start(1_000);
        clock.advance(100);
        std::thread::sleep(Duration::from_millis(150));
        assert_eq!(clock.until_due(), Duration::ZERO);

        clock.resync();
        assert!(clock.until_due() <= Duration::from_millis(5));
    }

    #[test]
    fn gain_is_shared_between_clones() {
        let gain = Gain::new(0.5);
        let voice_side = gain.clone();
        gain.set(0.2);
        assert_eq!(voice_side.get(), 0.2);
    }
}
