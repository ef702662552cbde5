use std::sync::Arc;

use crate::{
    backend::{AudioBackend, LibraryBackend, NativeElementBackend, PlayFuture},
    clip::{Clip, ClipCallbacks},
    config::{BackendKind, SoundConfig},
    graph::{AnalyserNode, DeviceContext},
    session::PlaybackSession,
    Result,
};

/// Manager of every clip one host plays.
///
/// A registry forwards to whichever backend it was built with and owns the
/// shared volume policy through it. Independent registries never share
/// clips, graphs or volume. Dropping the registry releases everything it
/// still tracks.
#[derive(Debug)]
pub struct SoundRegistry {
    backend: Arc<dyn AudioBackend>,
}

impl SoundRegistry {
    /// Builds the backend selected by `config`.
    pub fn new(config: SoundConfig) -> Result<Self> {
        config.validate()?;
        let backend: Arc<dyn AudioBackend> = match config.backend {
            BackendKind::Element => Arc::new(NativeElementBackend::new(config)),
            BackendKind::Library => Arc::new(LibraryBackend::new(config)),
        };
        Ok(Self::with_backend(backend))
    }

    pub fn with_backend(backend: Arc<dyn AudioBackend>) -> Self {
        tracing::debug!(backend = ?backend.kind(), "sound registry created");
        Self { backend }
    }

    pub fn backend(&self) -> &Arc<dyn AudioBackend> {
        &self.backend
    }

    pub fn kind(&self) -> BackendKind {
        self.backend.kind()
    }

    pub fn volume(&self) -> f32 {
        self.backend.volume()
    }

    /// Clamps `value` to `[0, 1]` (NaN is 0) and applies it to every live and
    /// future clip. Returns the applied value.
    pub fn set_volume(&self, value: f32) -> f32 {
        self.backend.set_volume(value)
    }

    /// Records a user gesture, lifting the autoplay gate.
    pub fn notify_user_activation(&self) {
        self.backend.state().notify_user_activation();
    }

    pub fn add(&self, source_uri: &str, callbacks: ClipCallbacks) -> Clip {
        self.backend.add(source_uri, callbacks)
    }

    pub fn play(&self, clip: &Clip) -> PlayFuture {
        self.backend.play(clip)
    }

    pub fn add_context(&self, clip: &Clip) -> Result<DeviceContext> {
        self.backend.add_context(clip)
    }

    pub fn add_analyzer(&self, clip: &Clip, context: &DeviceContext) -> Result<AnalyserNode> {
        self.backend.add_analyzer(clip, context)
    }

    pub fn analyze(&self, analyser: Option<&AnalyserNode>) -> f32 {
        self.backend.analyze(analyser)
    }

    pub fn dispose(&self, clip: &Clip) {
        self.backend.dispose(clip);
    }

    pub fn destroy(&self) {
        self.backend.destroy();
    }

    /// Adds `source_uri`, wires its analysis graph and starts playback.
    ///
    /// Returns immediately; await [`PlaybackSession::ready`] for the play
    /// result. If the analysis graph cannot be built the session still plays
    /// and reports fallback loudness.
    pub fn add_and_play(&self, source_uri: &str, callbacks: ClipCallbacks) -> PlaybackSession {
        let clip = self.add(source_uri, callbacks);
        let analyser = match self.attach_analysis(&clip) {
            Ok(analyser) => Some(analyser),
            Err(err) => {
                tracing::debug!(clip = %clip.id(), error = %err, "analysis unavailable, using fallback loudness");
                None
            }
        };
        let ready = self.play(&clip);
        PlaybackSession::new(clip, analyser, self.backend.clone(), ready)
    }

    /// Releases every tracked context and clip. Used on host teardown.
    pub fn dispose_all(&self) {
        self.destroy();
    }

    pub fn clips(&self) -> Vec<Clip> {
        self.backend.state().clips()
    }

    pub fn live_clips(&self) -> usize {
        self.backend.state().live_clips()
    }

    pub fn live_analysers(&self) -> usize {
        self.backend.state().live_analysers()
    }

    pub fn live_contexts(&self) -> usize {
        self.backend.state().live_contexts()
    }

    fn attach_analysis(&self, clip: &Clip) -> Result<AnalyserNode> {
        let context = self.add_context(clip)?;
        self.add_analyzer(clip, &context)
    }
}

impl Drop for SoundRegistry {
    fn drop(&mut self) {
        self.backend.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn volume_scenarios() {
        let registry = SoundRegistry::new(SoundConfig::default()).unwrap();
        assert_eq!(registry.volume(), 0.5);

        assert_eq!(registry.set_volume(1.5), 1.0);
        assert_eq!(registry.volume(), 1.0);
        assert_eq!(registry.set_volume(-0.2), 0.0);
        assert_eq!(registry.set_volume(f32::NAN), 0.0);

        registry.set_volume(0.5);
        let clips: Vec<_> = (0..3)
            .map(|i| registry.add(&format!("clip-{i}.wav"), ClipCallbacks::new()))
            .collect();
        assert!(clips.iter().all(|clip| clip.volume() == 0.5));

        registry.set_volume(0.2);
        assert!(clips.iter().all(|clip| clip.volume() == 0.2));
    }

    #[test]
    fn registries_are_independent() {
        let first = SoundRegistry::new(SoundConfig::default()).unwrap();
        let second = SoundRegistry::new(SoundConfig {
            backend: BackendKind::Library,
            ..SoundConfig::default()
        })
        .unwrap();

        first.set_volume(0.9);
        first.add("a.wav", ClipCallbacks::new());

        assert_eq!(second.volume(), 0.5);
        assert_eq!(second.live_clips(), 0);
        assert_eq!(second.kind(), BackendKind::Library);
    }

    #[test]
    fn rejects_invalid_config() {
        let mut config = SoundConfig::default();
        config.playback.render_quantum = 0;
        assert!(SoundRegistry::new(config).is_err());
    }

    #[test]
    fn analysis_degrades_to_fallback() {
        let registry = SoundRegistry::new(SoundConfig::default()).unwrap();
        let clip = registry.add("idle.wav", ClipCallbacks::new());
        let value = registry.analyze(None);
        assert!((0.0..=1.0).contains(&value));

        let context = registry.add_context(&clip).unwrap();
        let analyser = registry.add_analyzer(&clip, &context).unwrap();
        assert_eq!(registry.analyze(Some(&analyser)), 0.0);

        registry.dispose(&clip);
        registry.dispose(&clip);
        assert_eq!(registry.live_clips(), 0);
        assert_eq!(registry.live_contexts(), 0);
        assert!(context.is_closed());
    }
}
