use std::{fmt, sync::Arc};

use tokio::sync::oneshot::{self, error::TryRecvError};

use crate::{
    backend::{AudioBackend, PlayFuture},
    clip::{Clip, Outcome},
    graph::AnalyserNode,
    Result, SoundError,
};

/// Caller-facing handle for one playing clip.
///
/// Reports loudness on demand and exposes the clip's readiness and its
/// single completion outcome.
pub struct PlaybackSession {
    clip: Clip,
    analyser: Option<AnalyserNode>,
    backend: Arc<dyn AudioBackend>,
    ready: Option<PlayFuture>,
    ready_result: Option<Result<()>>,
    outcome_rx: Option<oneshot::Receiver<Outcome>>,
    outcome: Option<Outcome>,
}

impl PlaybackSession {
    pub(crate) fn new(
        clip: Clip,
        analyser: Option<AnalyserNode>,
        backend: Arc<dyn AudioBackend>,
        ready: PlayFuture,
    ) -> Self {
        let outcome_rx = clip.take_outcome();
        Self {
            clip,
            analyser,
            backend,
            ready: Some(ready),
            ready_result: None,
            outcome_rx,
            outcome: None,
        }
    }

    pub fn clip(&self) -> &Clip {
        &self.clip
    }

    pub fn analyser(&self) -> Option<&AnalyserNode> {
        self.analyser.as_ref()
    }

    pub fn has_analyser(&self) -> bool {
        self.analyser.is_some()
    }

    /// One-decimal loudness reading. Never fails: without an analyser the
    /// backend's fallback value is returned.
    pub fn loudness(&self) -> f32 {
        self.backend.analyze(self.analyser.as_ref())
    }

    pub fn volume(&self) -> f32 {
        self.clip.volume()
    }

    pub fn is_settled(&self) -> bool {
        self.clip.is_settled()
    }

    /// Result of the `play` request. Awaiting again returns the same result.
    ///
    /// Cancelling the await loses nothing; the next call resumes the same
    /// request.
    pub async fn ready(&mut self) -> Result<()> {
        if let Some(result) = &self.ready_result {
            return result.clone();
        }
        let result = match self.ready.as_mut() {
            Some(ready) => ready.await,
            None => Err(SoundError::Disposed(self.clip.id().get())),
        };
        self.ready = None;
        self.ready_result = Some(result.clone());
        result
    }

    /// Waits for the clip to finish, fail or be disposed.
    pub async fn finished(&mut self) -> Outcome {
        if let Some(outcome) = &self.outcome {
            return outcome.clone();
        }
        let outcome = match self.outcome_rx.take() {
            Some(rx) => rx.await.unwrap_or(Outcome::Disposed),
            None => Outcome::Disposed,
        };
        self.outcome = Some(outcome.clone());
        outcome
    }

    /// Non-blocking variant of [`finished`](Self::finished).
    pub fn try_outcome(&mut self) -> Option<Outcome> {
        if self.outcome.is_none() {
            let outcome = match self.outcome_rx.as_mut()?.try_recv() {
                Ok(outcome) => outcome,
                Err(TryRecvError::Empty) => return None,
                Err(TryRecvError::Closed) => Outcome::Disposed,
            };
            self.outcome_rx = None;
            self.outcome = Some(outcome);
        }
        self.outcome.clone()
    }

    /// Stops the clip without firing its callbacks.
    pub fn dispose(&self) {
        self.backend.dispose(&self.clip);
    }
}

impl fmt::Debug for PlaybackSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlaybackSession")
            .field("clip", &self.clip)
            .field("analyser", &self.analyser)
            .field("outcome", &self.outcome)
            .finish()
    }
}
