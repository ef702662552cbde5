//! Lifecycle contract shared by every backend variant.
//!
//! Each case runs once per [`BackendKind`] against real WAV fixtures so both
//! playback technologies are held to the same observable behaviour.

use std::{
    f32::consts::TAU,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use lipsync_audio_core::{
    AutoplayPolicy, BackendKind, ClipCallbacks, ClipState, Outcome, PlaybackConfig, SoundConfig,
    SoundError, SoundRegistry,
};
use tempfile::TempDir;

const SAMPLE_RATE: u32 = 8_000;
const LIMIT: Duration = Duration::from_secs(10);

fn write_tone(dir: &Path, name: &str, seconds: f32) -> PathBuf {
    write_tone_at(dir, name, seconds, SAMPLE_RATE)
}

fn write_tone_at(dir: &Path, name: &str, seconds: f32, sample_rate: u32) -> PathBuf {
    let path = dir.join(name);
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(&path, spec).unwrap();
    let frames = (seconds * sample_rate as f32) as usize;
    for n in 0..frames {
        let t = n as f32 / sample_rate as f32;
        let sample = 0.8 * (TAU * 440.0 * t).sin();
        writer.write_sample((sample * i16::MAX as f32) as i16).unwrap();
    }
    writer.finalize().unwrap();
    path
}

fn write_garbage(dir: &Path, name: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, b"this is not audio at all").unwrap();
    path
}

fn uri(path: &Path) -> String {
    path.to_str().unwrap().to_string()
}

fn registry(kind: BackendKind) -> SoundRegistry {
    registry_with(kind, AutoplayPolicy::Allowed)
}

fn registry_with(kind: BackendKind, autoplay: AutoplayPolicy) -> SoundRegistry {
    registry_for(
        kind,
        PlaybackConfig {
            can_play_through_ms: 50,
            autoplay,
            ..PlaybackConfig::default()
        },
    )
}

fn registry_for(kind: BackendKind, playback: PlaybackConfig) -> SoundRegistry {
    SoundRegistry::new(SoundConfig {
        backend: kind,
        playback,
        ..SoundConfig::default()
    })
    .unwrap()
}

#[derive(Clone, Default)]
struct Counters {
    finished: Arc<AtomicUsize>,
    errors: Arc<AtomicUsize>,
}

impl Counters {
    fn callbacks(&self) -> ClipCallbacks {
        let finished = self.finished.clone();
        let errors = self.errors.clone();
        ClipCallbacks::new()
            .on_finish(move || {
                finished.fetch_add(1, Ordering::SeqCst);
            })
            .on_error(move |_| {
                errors.fetch_add(1, Ordering::SeqCst);
            })
    }

    fn finished(&self) -> usize {
        self.finished.load(Ordering::SeqCst)
    }

    fn errors(&self) -> usize {
        self.errors.load(Ordering::SeqCst)
    }
}

fn is_one_decimal(value: f32) -> bool {
    ((value * 10.0).round() / 10.0 - value).abs() < 1e-6
}

async fn add_does_not_start_playback(kind: BackendKind) {
    let dir = TempDir::new().unwrap();
    let tone = write_tone(dir.path(), "tone.wav", 0.5);
    let registry = registry(kind);
    let counters = Counters::default();

    let clip = registry.add(&uri(&tone), counters.callbacks());
    tokio::time::sleep(Duration::from_millis(150)).await;

    assert_eq!(clip.frames_played(), 0);
    assert!(!clip.is_settled());
    assert_ne!(clip.state(), ClipState::Playing);
    assert_eq!(registry.live_clips(), 1);
    assert_eq!(counters.finished() + counters.errors(), 0);
}

async fn play_resolves_then_finishes_once(kind: BackendKind) {
    let dir = TempDir::new().unwrap();
    let tone = write_tone(dir.path(), "tone.wav", 0.3);
    let registry = registry(kind);
    let counters = Counters::default();

    let mut session = registry.add_and_play(&uri(&tone), counters.callbacks());
    assert!(session.has_analyser());
    let ready = tokio::time::timeout(LIMIT, session.ready()).await.unwrap();
    assert_eq!(ready, Ok(()));

    let outcome = tokio::time::timeout(LIMIT, session.finished()).await.unwrap();
    assert_eq!(outcome, Outcome::Finished);
    assert_eq!(session.clip().state(), ClipState::Finished);
    assert!(session.clip().frames_played() > 0);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(counters.finished(), 1);
    assert_eq!(counters.errors(), 0);
    assert_eq!(registry.live_clips(), 0);
    assert_eq!(registry.live_contexts(), 0);
    assert_eq!(registry.live_analysers(), 0);
}

async fn broken_source_reports_one_error(kind: BackendKind) {
    let dir = TempDir::new().unwrap();
    let garbage = write_garbage(dir.path(), "garbage.wav");
    let missing = dir.path().join("missing.wav");
    let registry = registry(kind);

    for source in [garbage, missing] {
        let counters = Counters::default();
        let mut session = registry.add_and_play(&uri(&source), counters.callbacks());

        let ready = tokio::time::timeout(LIMIT, session.ready()).await.unwrap();
        assert!(
            matches!(ready, Err(SoundError::DecodeOrLoad { .. })),
            "unexpected play result {ready:?}"
        );
        let outcome = tokio::time::timeout(LIMIT, session.finished()).await.unwrap();
        assert!(matches!(outcome, Outcome::Failed(SoundError::DecodeOrLoad { .. })));

        assert_eq!(counters.errors(), 1);
        assert_eq!(counters.finished(), 0);
        assert_eq!(session.clip().state(), ClipState::Failed);
    }
    assert_eq!(registry.live_clips(), 0);
    assert_eq!(registry.live_contexts(), 0);
}

async fn dispose_mid_playback_is_silent(kind: BackendKind) {
    let dir = TempDir::new().unwrap();
    let tone = write_tone(dir.path(), "long.wav", 3.0);
    let registry = registry(kind);
    let counters = Counters::default();

    let mut session = registry.add_and_play(&uri(&tone), counters.callbacks());
    tokio::time::timeout(LIMIT, session.ready()).await.unwrap().unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(session.loudness() > 0.0);

    let analyser = session.analyser().cloned().unwrap();
    session.dispose();
    assert_eq!(registry.live_clips(), 0);
    assert_eq!(registry.live_contexts(), 0);
    assert_eq!(registry.live_analysers(), 0);
    assert!(!analyser.is_connected());

    let outcome = tokio::time::timeout(LIMIT, session.finished()).await.unwrap();
    assert_eq!(outcome, Outcome::Disposed);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(counters.finished(), 0);
    assert_eq!(counters.errors(), 0);

    session.dispose();
    assert_eq!(session.clip().state(), ClipState::Disposed);
}

async fn dispose_during_pending_play(kind: BackendKind) {
    let dir = TempDir::new().unwrap();
    let tone = write_tone_at(dir.path(), "long.wav", 120.0, 48_000);
    // Readiness needs far more audio than the decoder produces before dispose.
    let registry = registry_for(
        kind,
        PlaybackConfig {
            can_play_through_ms: 60_000,
            ..PlaybackConfig::default()
        },
    );
    let counters = Counters::default();

    let mut session = registry.add_and_play(&uri(&tone), counters.callbacks());
    let started = Instant::now();
    session.dispose();
    assert!(
        started.elapsed() < Duration::from_millis(250),
        "dispose blocked for {:?}",
        started.elapsed()
    );

    let ready = tokio::time::timeout(LIMIT, session.ready()).await.unwrap();
    assert_eq!(ready, Err(SoundError::Disposed(session.clip().id().get())));
    let outcome = tokio::time::timeout(LIMIT, session.finished()).await.unwrap();
    assert_eq!(outcome, Outcome::Disposed);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(counters.finished() + counters.errors(), 0);
    assert_eq!(registry.live_clips(), 0);
    assert_eq!(registry.live_contexts(), 0);
    assert_eq!(registry.live_analysers(), 0);
    assert_eq!(session.clip().state(), ClipState::Disposed);
}

async fn cancelled_ready_keeps_the_result(kind: BackendKind) {
    let dir = TempDir::new().unwrap();
    let garbage = write_garbage(dir.path(), "garbage.wav");
    let registry = registry(kind);

    let mut session = registry.add_and_play(&uri(&garbage), ClipCallbacks::new());
    // Either cancelled mid-wait or already failed; neither may turn into success.
    let first = tokio::time::timeout(Duration::ZERO, session.ready()).await;
    if let Ok(result) = first {
        assert!(result.is_err());
    }

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(matches!(session.try_outcome(), Some(Outcome::Failed(_))));
    let ready = tokio::time::timeout(LIMIT, session.ready()).await.unwrap();
    assert!(
        matches!(ready, Err(SoundError::DecodeOrLoad { .. })),
        "unexpected play result {ready:?}"
    );
    assert_eq!(session.ready().await, ready);
}

async fn destroy_releases_every_clip(kind: BackendKind) {
    let dir = TempDir::new().unwrap();
    let tone = write_tone(dir.path(), "long.wav", 3.0);
    let registry = registry(kind);
    let counters = Counters::default();

    let mut sessions: Vec<_> = (0..3)
        .map(|_| registry.add_and_play(&uri(&tone), counters.callbacks()))
        .collect();
    for session in sessions.iter_mut() {
        tokio::time::timeout(LIMIT, session.ready()).await.unwrap().unwrap();
    }
    let idle = registry.add(&uri(&tone), counters.callbacks());
    assert_eq!(registry.live_clips(), 4);
    assert_eq!(registry.live_contexts(), 3);

    registry.destroy();
    assert_eq!(registry.live_clips(), 0);
    assert_eq!(registry.live_contexts(), 0);
    assert_eq!(registry.live_analysers(), 0);
    assert_eq!(idle.state(), ClipState::Disposed);

    for session in sessions.iter_mut() {
        let outcome = tokio::time::timeout(LIMIT, session.finished()).await.unwrap();
        assert_eq!(outcome, Outcome::Disposed);
    }
    registry.destroy();
    assert_eq!(counters.finished() + counters.errors(), 0);
}

async fn volume_reaches_playing_clips(kind: BackendKind) {
    let dir = TempDir::new().unwrap();
    let tone = write_tone(dir.path(), "long.wav", 3.0);
    let registry = registry(kind);

    let mut session = registry.add_and_play(&uri(&tone), ClipCallbacks::new());
    tokio::time::timeout(LIMIT, session.ready()).await.unwrap().unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(session.loudness() > 0.0);

    assert_eq!(registry.set_volume(0.0), 0.0);
    assert_eq!(session.volume(), 0.0);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(session.loudness(), 0.0);

    let later = registry.add(&uri(&tone), ClipCallbacks::new());
    assert_eq!(later.volume(), 0.0);
    registry.dispose_all();
}

async fn autoplay_gate_rejects_until_activation(kind: BackendKind) {
    let dir = TempDir::new().unwrap();
    let tone = write_tone(dir.path(), "tone.wav", 0.2);
    let registry = registry_with(kind, AutoplayPolicy::RequiresActivation);
    let counters = Counters::default();

    let mut blocked = registry.add_and_play(&uri(&tone), counters.callbacks());
    let ready = tokio::time::timeout(LIMIT, blocked.ready()).await.unwrap();
    assert!(matches!(ready, Err(SoundError::PlaybackRejected { .. })));
    assert_eq!(
        tokio::time::timeout(LIMIT, blocked.finished()).await.unwrap(),
        Outcome::Failed(ready.unwrap_err())
    );
    assert_eq!(counters.errors(), 1);
    assert_eq!(registry.live_clips(), 0);

    registry.notify_user_activation();
    let mut allowed = registry.add_and_play(&uri(&tone), counters.callbacks());
    tokio::time::timeout(LIMIT, allowed.ready()).await.unwrap().unwrap();
    let outcome = tokio::time::timeout(LIMIT, allowed.finished()).await.unwrap();
    assert_eq!(outcome, Outcome::Finished);
    assert_eq!(counters.errors(), 1);
}

async fn play_after_dispose_is_rejected(kind: BackendKind) {
    let dir = TempDir::new().unwrap();
    let tone = write_tone(dir.path(), "tone.wav", 0.2);
    let registry = registry(kind);
    let counters = Counters::default();

    let clip = registry.add(&uri(&tone), counters.callbacks());
    registry.dispose(&clip);
    let result = tokio::time::timeout(LIMIT, registry.play(&clip)).await.unwrap();
    assert_eq!(result, Err(SoundError::Disposed(clip.id().get())));
    assert!(registry.add_context(&clip).is_err());
    assert_eq!(counters.finished() + counters.errors(), 0);
}

async fn loudness_has_one_decimal(kind: BackendKind) {
    let dir = TempDir::new().unwrap();
    let tone = write_tone(dir.path(), "long.wav", 2.0);
    let registry = registry(kind);

    let mut session = registry.add_and_play(&uri(&tone), ClipCallbacks::new());
    tokio::time::timeout(LIMIT, session.ready()).await.unwrap().unwrap();
    for _ in 0..10 {
        let value = session.loudness();
        assert!(value >= 0.0);
        assert!(is_one_decimal(value), "{value} is not rounded to one decimal");

        let fallback = registry.analyze(None);
        assert!((0.0..=1.0).contains(&fallback));
        assert!(is_one_decimal(fallback));
        tokio::time::sleep(Duration::from_millis(30)).await;
    }
    session.dispose();
}

macro_rules! backend_contract {
    ($($module:ident => $kind:expr),* $(,)?) => {
        $(
            mod $module {
                use super::*;

                #[tokio::test(flavor = "multi_thread")]
                async fn add_does_not_start_playback() {
                    super::add_does_not_start_playback($kind).await;
                }

                #[tokio::test(flavor = "multi_thread")]
                async fn play_resolves_then_finishes_once() {
                    super::play_resolves_then_finishes_once($kind).await;
                }

                #[tokio::test(flavor = "multi_thread")]
                async fn broken_source_reports_one_error() {
                    super::broken_source_reports_one_error($kind).await;
                }

                #[tokio::test(flavor = "multi_thread")]
                async fn dispose_mid_playback_is_silent() {
                    super::dispose_mid_playback_is_silent($kind).await;
                }

                #[tokio::test(flavor = "multi_thread")]
                async fn dispose_during_pending_play() {
                    super::dispose_during_pending_play($kind).await;
                }

                #[tokio::test(flavor = "multi_thread")]
                async fn cancelled_ready_keeps_the_result() {
                    super::cancelled_ready_keeps_the_result($kind).await;
                }

                #[tokio::test(flavor = "multi_thread")]
                async fn destroy_releases_every_clip() {
                    super::destroy_releases_every_clip($kind).await;
                }

                #[tokio::test(flavor = "multi_thread")]
                async fn volume_reaches_playing_clips() {
                    super::volume_reaches_playing_clips($kind).await;
                }

                #[tokio::test(flavor = "multi_thread")]
                async fn autoplay_gate_rejects_until_activation() {
                    super::autoplay_gate_rejects_until_activation($kind).await;
                }

                #[tokio::test(flavor = "multi_thread")]
                async fn play_after_dispose_is_rejected() {
                    super::play_after_dispose_is_rejected($kind).await;
                }

                #[tokio::test(flavor = "multi_thread")]
                async fn loudness_has_one_decimal() {
                    super::loudness_has_one_decimal($kind).await;
                }
            }
        )*
    };
}

backend_contract! {
    element => BackendKind::Element,
    library => BackendKind::Library,
}
