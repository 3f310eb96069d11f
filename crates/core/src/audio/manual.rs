use std::collections::HashMap;

use crate::{
    bridge::Notification,
    config::AudioTiming,
    error::StageError,
    scene::{Element, ElementId},
};

use super::{
    engine::progress_of, AudioBackend, HandleKey, HandleRole, PlaybackEvent, PlaybackEventKind,
    PlaybackHandle,
};

struct OneShot {
    handle: Box<dyn PlaybackHandle>,
    generation: u64,
    opened_at: f64,
    ready: bool,
    ended_emitted: bool,
}

/// Explicit single-fire plays, isolated from the engine's handles.
///
/// Each play gets a fresh handle at the element's configured volume that
/// never loops and always starts from zero. The handle is disposed once the
/// play ends or fails, or when its source never reports ready.
pub struct ManualPlayer {
    ended_epsilon_ms: f64,
    ready_timeout_ms: f64,
    sessions: HashMap<ElementId, OneShot>,
    next_generation: u64,
}

impl ManualPlayer {
    pub fn new(timing: &AudioTiming) -> Self {
        Self {
            ended_epsilon_ms: timing.ended_epsilon_ms,
            ready_timeout_ms: timing.ready_timeout_ms,
            sessions: HashMap::new(),
            next_generation: 0,
        }
    }

    /// Starts a one-shot play of the element's audio, replacing any one-shot
    /// already running for it. Returns `false` when the element has no audio.
    pub fn play_once(
        &mut self,
        backend: &mut dyn AudioBackend,
        element: &Element,
        now: f64,
    ) -> bool {
        let Some(audio) = element.audio_cue() else {
            return false;
        };
        if let Some(mut previous) = self.sessions.remove(&element.id) {
            previous.handle.pause();
        }

        self.next_generation += 1;
        let mut handle = backend.open(HandleKey {
            element: element.id.clone(),
            role: HandleRole::Manual,
            generation: self.next_generation,
        });
        handle.set_volume(audio.volume.clamp(0.0, 1.0));
        handle.set_looping(false);
        handle.load(&audio.src);
        handle.seek(0.0);
        handle.play();
        tracing::info!(id = %element.id, src = %audio.src, "one-shot play");

        self.sessions.insert(
            element.id.clone(),
            OneShot {
                handle,
                generation: self.next_generation,
                opened_at: now,
                ready: false,
                ended_emitted: false,
            },
        );
        true
    }

    /// Handles a backend event addressed to a one-shot handle.
    ///
    /// Returns the element id when its one-shot finished and was disposed.
    pub fn on_event(
        &mut self,
        event: &PlaybackEvent,
        outbox: &mut Vec<Notification>,
    ) -> Option<ElementId> {
        let id = &event.key.element;
        let session = self.sessions.get_mut(id)?;
        if session.generation != event.key.generation {
            return None;
        }

        let finished = match &event.kind {
            PlaybackEventKind::Ready | PlaybackEventKind::Started => {
                session.ready = true;
                false
            }
            PlaybackEventKind::StartFailed(message) => {
                let err = StageError::Playback {
                    id: id.to_string(),
                    message: message.clone(),
                };
                tracing::warn!(%err, "one-shot failed to start");
                outbox.push(Notification::AudioError {
                    id: id.clone(),
                    message: message.clone(),
                });
                true
            }
            PlaybackEventKind::TimeUpdate => {
                let current_time = session.handle.current_time();
                let duration = session.handle.duration().unwrap_or(0.0);
                outbox.push(Notification::AudioProgress {
                    id: id.clone(),
                    current_time,
                    duration,
                    progress: progress_of(current_time, duration),
                });
                let near_end =
                    duration > 0.0 && current_time >= duration - self.ended_epsilon_ms / 1000.0;
                if near_end && !session.ended_emitted {
                    session.ended_emitted = true;
                    outbox.push(Notification::AudioEnded { id: id.clone() });
                }
                session.handle.has_ended()
            }
            PlaybackEventKind::Ended => {
                if !session.ended_emitted {
                    outbox.push(Notification::AudioEnded { id: id.clone() });
                }
                true
            }
        };

        if !finished {
            return None;
        }
        let id = id.clone();
        self.sessions.remove(&id);
        tracing::debug!(%id, "one-shot disposed");
        Some(id)
    }

    /// Disposes one-shots whose source has not reported ready within the
    /// ready timeout, reporting an error for each.
    ///
    /// Returns the ids of the expired one-shots.
    pub fn poll(&mut self, now: f64, outbox: &mut Vec<Notification>) -> Vec<ElementId> {
        let timeout = self.ready_timeout_ms;
        let expired: Vec<ElementId> = self
            .sessions
            .iter()
            .filter(|(_, session)| !session.ready && now - session.opened_at >= timeout)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            if let Some(mut session) = self.sessions.remove(id) {
                session.handle.pause();
            }
            tracing::warn!(%id, "one-shot source never became ready");
            outbox.push(Notification::AudioError {
                id: id.clone(),
                message: "source never became ready".to_string(),
            });
        }
        expired
    }

    pub fn is_active(&self, id: &str) -> bool {
        self.sessions.contains_key(id)
    }
}

impl std::fmt::Debug for ManualPlayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManualPlayer")
            .field("active", &self.sessions.keys().collect::<Vec<_>>())
            .finish()
    }
}
