use std::collections::{HashMap, HashSet};

use crate::{
    bridge::Notification,
    config::AudioTiming,
    error::StageError,
    scene::{AudioConfig, Element, ElementId},
};

use super::{AudioBackend, HandleKey, HandleRole, PlaybackEvent, PlaybackEventKind, PlaybackHandle};

/// Snapshot of the audio intent last applied for an element.
#[derive(Debug, Clone, PartialEq)]
pub struct DesiredAudio {
    pub src: String,
    pub is_playing: bool,
    pub looping: bool,
    pub volume: f64,
}

impl From<&AudioConfig> for DesiredAudio {
    fn from(audio: &AudioConfig) -> Self {
        Self {
            src: audio.src.clone(),
            is_playing: audio.is_playing,
            looping: audio.looping,
            volume: audio.volume.clamp(0.0, 1.0),
        }
    }
}

/// Observable state of one element's engine-owned playback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioState {
    NoAudio,
    Idle,
    /// A start was requested and has not resolved yet.
    StartPending,
    Playing,
    /// Playing inside the suppression window; stop requests are ignored.
    StopSuppressed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Reason {
    /// The desired snapshot differs from the last applied one.
    Changed,
    /// Same snapshot re-sent; only repair drift.
    Drift,
    /// Applying a snapshot held back until the source became ready.
    Deferred,
}

struct AudioSlot {
    handle: Box<dyn PlaybackHandle>,
    generation: u64,
    src: String,
    applied: Option<DesiredAudio>,
    /// Stop requests before this instant (ms) are ignored.
    lock_until: f64,
    start_pending: bool,
    /// Set while a freshly loaded source has not reported ready.
    awaiting_ready: Option<f64>,
    ended_emitted: bool,
    /// The current playback was fired by a trajectory start rather than by
    /// the desired state, and runs once without looping.
    motion_playback: bool,
    /// A motion start arrived before the source was ready; it fires on the
    /// ready signal or the ready timeout.
    motion_armed: bool,
    last_progress: Option<f64>,
}

impl AudioSlot {
    fn new(handle: Box<dyn PlaybackHandle>, generation: u64, src: &str, now: f64) -> Self {
        Self {
            handle,
            generation,
            src: src.to_string(),
            applied: None,
            lock_until: f64::NEG_INFINITY,
            start_pending: false,
            awaiting_ready: Some(now),
            ended_emitted: false,
            motion_playback: false,
            motion_armed: false,
            last_progress: None,
        }
    }

    fn looping(&self) -> bool {
        !self.motion_playback && self.applied.as_ref().is_some_and(|d| d.looping)
    }

    fn start(&mut self, now: f64, lock_ms: f64) {
        self.lock_until = now + lock_ms;
        self.start_pending = true;
        self.ended_emitted = false;
        if self.handle.has_ended() {
            self.handle.seek(0.0);
        }
        self.handle.play();
    }

    fn start_motion(&mut self, now: f64, lock_ms: f64) {
        self.motion_armed = false;
        self.motion_playback = true;
        self.handle.set_looping(false);
        self.handle.seek(0.0);
        self.start(now, lock_ms);
    }

    /// Applies whatever was held back while the source was loading.
    fn resume_after_ready(&mut self, overridden: bool, now: f64, lock_ms: f64) {
        if self.motion_armed {
            self.start_motion(now, lock_ms);
        } else if let Some(desired) = self.applied.clone() {
            reconcile(self, &desired, overridden, now, lock_ms, Reason::Deferred);
        }
    }

    fn stop_allowed(&self, now: f64, overridden: bool) -> bool {
        now >= self.lock_until && !self.start_pending && !overridden
    }

    /// Hands the handle back to the desired state after a motion playback.
    fn finish_motion(&mut self) {
        if self.motion_playback {
            self.motion_playback = false;
            let looping = self.looping();
            self.handle.set_looping(looping);
        }
    }
}

/// Per-element reconciliation of desired audio state against the behaviour
/// of an asynchronous, unreliable playback handle.
pub struct AudioEngine {
    timing: AudioTiming,
    slots: HashMap<ElementId, AudioSlot>,
    overrides: HashSet<ElementId>,
    motion_starts: HashMap<ElementId, f64>,
    next_generation: u64,
}

impl AudioEngine {
    pub fn new(timing: AudioTiming) -> Self {
        Self {
            timing,
            slots: HashMap::new(),
            overrides: HashSet::new(),
            motion_starts: HashMap::new(),
            next_generation: 0,
        }
    }

    /// Brings the element's playback in line with its audio config.
    ///
    /// Called for every ADD and for every UPDATE that carries audio fields.
    pub fn sync(&mut self, backend: &mut dyn AudioBackend, element: &Element, now: f64) {
        let Some(audio) = element.audio_cue() else {
            self.release(element.id.as_str());
            return;
        };
        let desired = DesiredAudio::from(audio);
        let overridden = self.overrides.contains(&element.id);
        let lock_ms = self.timing.suppression_lock_ms;
        let slot = self.slot_for(backend, &element.id, &desired.src, now);

        if slot.motion_playback && !slot.handle.is_playing() {
            slot.finish_motion();
        }
        slot.handle.set_volume(desired.volume);
        if !slot.motion_playback {
            slot.handle.set_looping(desired.looping);
        }

        if slot.src != desired.src {
            tracing::debug!(id = %element.id, src = %desired.src, "audio source changed");
            slot.handle.load(&desired.src);
            slot.src = desired.src.clone();
            slot.start_pending = false;
            slot.ended_emitted = false;
            slot.motion_playback = false;
            slot.handle.set_looping(desired.looping);
            slot.awaiting_ready = Some(now);
            slot.applied = Some(desired);
            return;
        }
        if slot.awaiting_ready.is_some() {
            slot.applied = Some(desired);
            return;
        }
        if slot.applied.as_ref() == Some(&desired) {
            reconcile(slot, &desired, overridden, now, lock_ms, Reason::Drift);
            return;
        }
        slot.applied = Some(desired.clone());
        reconcile(slot, &desired, overridden, now, lock_ms, Reason::Changed);
    }

    /// Fires the one-shot playback that accompanies the start of a
    /// trajectory. Edge-triggered: fires at most once per `startTime`.
    ///
    /// Returns whether a playback was requested or armed.
    pub fn arm_motion_start(
        &mut self,
        backend: &mut dyn AudioBackend,
        element: &Element,
        now: f64,
    ) -> bool {
        let (Some(trajectory), Some(audio)) = (element.active_trajectory(), element.audio_cue())
        else {
            return false;
        };
        if self.motion_starts.get(&element.id) == Some(&trajectory.start_time) {
            return false;
        }
        self.motion_starts.insert(element.id.clone(), trajectory.start_time);

        let lock_ms = self.timing.suppression_lock_ms;
        let slot = self.slot_for(backend, &element.id, &audio.src, now);
        if slot.applied.is_none() {
            slot.handle.set_volume(audio.volume.clamp(0.0, 1.0));
            slot.applied = Some(DesiredAudio::from(audio));
        }
        if slot.awaiting_ready.is_some() {
            slot.motion_armed = true;
            slot.handle.set_looping(false);
            tracing::debug!(id = %element.id, "motion start waits for source");
            return true;
        }
        slot.start_motion(now, lock_ms);
        tracing::info!(
            id = %element.id,
            start_time = trajectory.start_time,
            "motion start playback"
        );
        true
    }

    /// Stops and discards the engine's handle for `id`.
    pub fn release(&mut self, id: &str) -> bool {
        match self.slots.remove(id) {
            Some(mut slot) => {
                slot.handle.pause();
                tracing::debug!(id, "released playback handle");
                true
            }
            None => false,
        }
    }

    /// Releases the handle and forgets the element entirely.
    pub fn forget(&mut self, id: &str) -> bool {
        self.motion_starts.remove(id);
        self.release(id)
    }

    /// Marks `id` as owned by a manual one-shot; stops are ignored meanwhile.
    pub fn set_override(&mut self, id: &ElementId, active: bool) {
        if active {
            self.overrides.insert(id.clone());
        } else {
            self.overrides.remove(id);
        }
    }

    pub fn is_overridden(&self, id: &str) -> bool {
        self.overrides.contains(id)
    }

    /// Handles a backend event addressed to an engine-owned handle.
    pub fn on_event(&mut self, event: &PlaybackEvent, now: f64, outbox: &mut Vec<Notification>) {
        let id = &event.key.element;
        let Some(slot) = self.slots.get_mut(id) else {
            tracing::debug!(%id, kind = ?event.kind, "event for released handle ignored");
            return;
        };
        if slot.generation != event.key.generation {
            tracing::debug!(%id, kind = ?event.kind, "event for stale handle ignored");
            return;
        }
        let overridden = self.overrides.contains(id);
        let lock_ms = self.timing.suppression_lock_ms;

        match &event.kind {
            PlaybackEventKind::Ready => {
                if slot.awaiting_ready.take().is_some() {
                    slot.resume_after_ready(overridden, now, lock_ms);
                }
            }
            PlaybackEventKind::Started => slot.start_pending = false,
            PlaybackEventKind::StartFailed(message) => {
                let err = StageError::Playback {
                    id: id.to_string(),
                    message: message.clone(),
                };
                tracing::warn!(%err, src = %slot.src, "playback failed to start");
                slot.start_pending = false;
                slot.lock_until = f64::NEG_INFINITY;
                slot.finish_motion();
                outbox.push(Notification::AudioError {
                    id: id.clone(),
                    message: message.clone(),
                });
            }
            PlaybackEventKind::TimeUpdate => {
                report_progress(id, slot, &self.timing, now, outbox);
            }
            PlaybackEventKind::Ended => {
                slot.start_pending = false;
                if !slot.ended_emitted {
                    slot.ended_emitted = true;
                    outbox.push(Notification::AudioEnded { id: id.clone() });
                }
                slot.finish_motion();
            }
        }
    }

    /// Applies snapshots whose source never reported ready within the
    /// configured timeout.
    pub fn poll(&mut self, now: f64) {
        let lock_ms = self.timing.suppression_lock_ms;
        for (id, slot) in self.slots.iter_mut() {
            let Some(since) = slot.awaiting_ready else {
                continue;
            };
            if now - since < self.timing.ready_timeout_ms {
                continue;
            }
            slot.awaiting_ready = None;
            tracing::debug!(%id, src = %slot.src, "no ready signal, applying audio state anyway");
            let overridden = self.overrides.contains(id);
            slot.resume_after_ready(overridden, now, lock_ms);
        }
    }

    pub fn state(&self, id: &str, now: f64) -> AudioState {
        let Some(slot) = self.slots.get(id) else {
            return AudioState::NoAudio;
        };
        if slot.start_pending {
            AudioState::StartPending
        } else if slot.handle.is_playing() {
            if now < slot.lock_until {
                AudioState::StopSuppressed
            } else {
                AudioState::Playing
            }
        } else {
            AudioState::Idle
        }
    }

    pub fn is_playing(&self, id: &str) -> bool {
        self.slots
            .get(id)
            .is_some_and(|slot| slot.handle.is_playing())
    }

    pub fn has_handle(&self, id: &str) -> bool {
        self.slots.contains_key(id)
    }

    fn slot_for(
        &mut self,
        backend: &mut dyn AudioBackend,
        id: &ElementId,
        src: &str,
        now: f64,
    ) -> &mut AudioSlot {
        let next_generation = &mut self.next_generation;
        self.slots.entry(id.clone()).or_insert_with(|| {
            *next_generation += 1;
            let key = HandleKey {
                element: id.clone(),
                role: HandleRole::Engine,
                generation: *next_generation,
            };
            let mut handle = backend.open(key);
            handle.load(src);
            AudioSlot::new(handle, *next_generation, src, now)
        })
    }
}

impl std::fmt::Debug for AudioEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioEngine")
            .field("slots", &self.slots.len())
            .field("overrides", &self.overrides)
            .finish()
    }
}

fn reconcile(
    slot: &mut AudioSlot,
    desired: &DesiredAudio,
    overridden: bool,
    now: f64,
    lock_ms: f64,
    reason: Reason,
) {
    let playing = slot.handle.is_playing();
    if desired.is_playing {
        if !playing && !slot.start_pending {
            if reason == Reason::Drift {
                slot.handle.seek(0.0);
            }
            slot.start(now, lock_ms);
        }
        return;
    }
    if !playing {
        return;
    }
    // A motion playback is not governed by the desired state; only an
    // explicit change to it may cut the playback short.
    if slot.motion_playback && reason != Reason::Changed {
        return;
    }
    if slot.stop_allowed(now, overridden) {
        slot.handle.pause();
        slot.finish_motion();
    } else {
        tracing::debug!(
            src = %slot.src,
            pending = slot.start_pending,
            overridden,
            "stop request suppressed"
        );
    }
}

fn report_progress(
    id: &ElementId,
    slot: &mut AudioSlot,
    timing: &AudioTiming,
    now: f64,
    outbox: &mut Vec<Notification>,
) {
    let current_time = slot.handle.current_time();
    let duration = slot.handle.duration().unwrap_or(0.0);

    let due = timing.progress_interval_ms <= 0.0
        || slot
            .last_progress
            .map_or(true, |last| now - last >= timing.progress_interval_ms);
    if due {
        slot.last_progress = Some(now);
        outbox.push(Notification::AudioProgress {
            id: id.clone(),
            current_time,
            duration,
            progress: progress_of(current_time, duration),
        });
    }

    // Native end signals are unreliable; report the end slightly early.
    let near_end = duration > 0.0 && current_time >= duration - timing.ended_epsilon_ms / 1000.0;
    if near_end && !slot.looping() && !slot.ended_emitted {
        slot.ended_emitted = true;
        outbox.push(Notification::AudioEnded { id: id.clone() });
    }
}

pub(super) fn progress_of(current_time: f64, duration: f64) -> f64 {
    if duration > 0.0 {
        (current_time / duration).clamp(0.0, 1.0)
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use crossbeam_channel::{unbounded, Receiver};

    use super::*;
    use crate::{audio::SimulatedBackend, scene::Trajectory};

    struct Rig {
        engine: AudioEngine,
        backend: SimulatedBackend,
        events: Receiver<PlaybackEvent>,
        outbox: Vec<Notification>,
        now: f64,
    }

    impl Rig {
        fn new() -> Self {
            Self::with(|backend| backend)
        }

        fn with(configure: impl FnOnce(SimulatedBackend) -> SimulatedBackend) -> Self {
            let (tx, events) = unbounded();
            let mut backend = configure(
                SimulatedBackend::new(tx)
                    .with_start_latency(20.0)
                    .with_load_latency(10.0)
                    .with_duration("bird.mp3", 2.0)
                    .with_failing("broken.mp3"),
            );
            let now = 10_000.0;
            backend.pump(now);
            Self {
                engine: AudioEngine::new(AudioTiming::default()),
                backend,
                events,
                outbox: Vec::new(),
                now,
            }
        }

        fn sync(&mut self, element: &Element) {
            self.engine.sync(&mut self.backend, element, self.now);
        }

        /// Advances simulated time in 10ms steps, delivering events.
        fn advance(&mut self, ms: f64) {
            let end = self.now + ms;
            while self.now < end {
                self.now = (self.now + 10.0).min(end);
                self.backend.pump(self.now);
                while let Ok(event) = self.events.try_recv() {
                    self.engine.on_event(&event, self.now, &mut self.outbox);
                }
                self.engine.poll(self.now);
            }
        }

        fn ended_count(&self) -> usize {
            self.outbox
                .iter()
                .filter(|n| matches!(n, Notification::AudioEnded { .. }))
                .count()
        }
    }

    fn bird(playing: bool) -> Element {
        let mut element = Element::new("bird");
        element.audio = Some(AudioConfig {
            src: "bird.mp3".into(),
            volume: 0.8,
            looping: false,
            is_playing: playing,
        });
        element
    }

    #[test]
    fn start_waits_for_ready_then_plays() {
        let mut rig = Rig::new();
        rig.sync(&bird(true));
        assert_eq!(rig.engine.state("bird", rig.now), AudioState::Idle);

        rig.advance(10.0);
        assert_eq!(rig.engine.state("bird", rig.now), AudioState::StartPending);

        rig.advance(30.0);
        assert_eq!(rig.engine.state("bird", rig.now), AudioState::StopSuppressed);
        rig.advance(1000.0);
        assert_eq!(rig.engine.state("bird", rig.now), AudioState::Playing);
    }

    #[test]
    fn quick_stop_after_start_is_suppressed_until_lock_expires() {
        let mut rig = Rig::new();
        rig.sync(&bird(false));
        rig.advance(20.0);

        rig.sync(&bird(true));
        rig.advance(100.0);
        rig.sync(&bird(false));
        rig.advance(10.0);
        assert!(rig.engine.is_playing("bird"), "stop inside lock window must be ignored");

        rig.advance(800.0);
        assert!(rig.engine.is_playing("bird"));
        rig.sync(&bird(false));
        assert!(!rig.engine.is_playing("bird"), "a fresh stop after the window is honoured");
    }

    #[test]
    fn stop_during_pending_start_is_ignored() {
        let mut rig = Rig::new();
        rig.sync(&bird(false));
        rig.advance(20.0);
        rig.engine.timing.suppression_lock_ms = 0.0;

        rig.sync(&bird(true));
        assert_eq!(rig.engine.state("bird", rig.now), AudioState::StartPending);
        rig.sync(&bird(false));
        assert!(rig.engine.is_playing("bird"));
    }

    #[test]
    fn manual_override_blocks_stops() {
        let mut rig = Rig::new();
        rig.sync(&bird(false));
        rig.advance(20.0);
        rig.sync(&bird(true));
        rig.advance(1000.0);

        let id = ElementId::from("bird");
        rig.engine.set_override(&id, true);
        rig.sync(&bird(false));
        assert!(rig.engine.is_playing("bird"));

        rig.engine.set_override(&id, false);
        rig.sync(&bird(false));
        assert!(!rig.engine.is_playing("bird"));
    }

    #[test]
    fn ended_is_emitted_once_even_with_native_signal() {
        let mut rig = Rig::new();
        rig.sync(&bird(false));
        rig.advance(20.0);
        rig.sync(&bird(true));
        rig.advance(3000.0);

        assert_eq!(rig.ended_count(), 1);
        assert!(rig
            .outbox
            .iter()
            .any(|n| matches!(n, Notification::AudioProgress { progress, .. } if *progress > 0.0)));
    }

    #[test]
    fn ended_fallback_fires_without_native_signal() {
        let mut rig = Rig::with(SimulatedBackend::without_native_end);
        rig.sync(&bird(false));
        rig.advance(20.0);
        rig.sync(&bird(true));

        rig.advance(2000.0);
        assert_eq!(rig.ended_count(), 1, "reported before the track really ends");
        rig.advance(1000.0);
        assert_eq!(rig.ended_count(), 1);
    }

    #[test]
    fn drift_restarts_a_silently_finished_track() {
        let mut rig = Rig::new();
        rig.sync(&bird(false));
        rig.advance(20.0);
        rig.sync(&bird(true));
        rig.advance(3000.0);
        assert!(!rig.engine.is_playing("bird"));

        rig.sync(&bird(true));
        assert_eq!(rig.engine.state("bird", rig.now), AudioState::StartPending);
        rig.advance(100.0);
        assert!(rig.engine.is_playing("bird"));
    }

    #[test]
    fn start_failure_reports_error_and_clears_pending() {
        let mut rig = Rig::new();
        let mut element = bird(true);
        element.audio.as_mut().unwrap().src = "broken.mp3".into();
        rig.sync(&element);
        rig.advance(100.0);

        assert_eq!(rig.engine.state("bird", rig.now), AudioState::Idle);
        assert!(rig
            .outbox
            .iter()
            .any(|n| matches!(n, Notification::AudioError { id, .. } if id.as_str() == "bird")));
    }

    #[test]
    fn source_change_defers_until_timeout_without_ready() {
        let mut rig = Rig::new();
        rig.sync(&bird(false));
        rig.advance(20.0);

        let mut element = bird(true);
        element.audio.as_mut().unwrap().src = "silent.mp3".into();
        rig.backend.stall_loading("silent.mp3");
        rig.sync(&element);
        rig.advance(1000.0);
        assert_eq!(rig.engine.state("bird", rig.now), AudioState::Idle);

        rig.advance(600.0);
        assert_ne!(rig.engine.state("bird", rig.now), AudioState::Idle);
    }

    #[test]
    fn late_resolution_into_released_handle_is_inert() {
        let mut rig = Rig::new();
        rig.sync(&bird(false));
        rig.advance(20.0);
        rig.sync(&bird(true));
        assert!(rig.engine.release("bird"));

        rig.advance(200.0);
        assert_eq!(rig.engine.state("bird", rig.now), AudioState::NoAudio);
        assert!(rig.outbox.is_empty());

        // A new handle for the same id ignores the old generation.
        rig.sync(&bird(false));
        let stale = PlaybackEvent {
            key: HandleKey {
                element: "bird".into(),
                role: HandleRole::Engine,
                generation: 1,
            },
            kind: PlaybackEventKind::StartFailed("late".into()),
        };
        rig.engine.on_event(&stale, rig.now, &mut rig.outbox);
        assert!(rig.outbox.is_empty());
    }

    #[test]
    fn motion_start_fires_once_per_start_time() {
        let mut rig = Rig::new();
        let mut element = bird(false);
        element.audio.as_mut().unwrap().looping = true;
        let mut trajectory = Trajectory::new(1000.0, Vec::new());
        trajectory.is_animating = true;
        trajectory.start_time = 5_000.0;
        element.trajectory = Some(trajectory);
        rig.sync(&element);

        assert!(rig.engine.arm_motion_start(&mut rig.backend, &element, rig.now));
        for _ in 0..10 {
            assert!(!rig.engine.arm_motion_start(&mut rig.backend, &element, rig.now));
        }
        rig.advance(2500.0);
        assert_eq!(rig.ended_count(), 1, "motion playback never loops");
        assert!(!rig.engine.is_playing("bird"));

        element.trajectory.as_mut().unwrap().start_time = 9_000.0;
        assert!(rig.engine.arm_motion_start(&mut rig.backend, &element, rig.now));
    }

    #[test]
    fn repeated_stop_does_not_cut_motion_playback() {
        let mut rig = Rig::new();
        let element = animated_bird();
        rig.sync(&element);
        rig.advance(20.0);
        rig.engine.arm_motion_start(&mut rig.backend, &element, rig.now);
        rig.advance(900.0);

        rig.sync(&element);
        assert!(rig.engine.is_playing("bird"));
    }

    fn animated_bird() -> Element {
        let mut element = bird(false);
        let mut trajectory = Trajectory::new(1000.0, Vec::new());
        trajectory.is_animating = true;
        trajectory.start_time = 1.0;
        element.trajectory = Some(trajectory);
        element
    }

    #[test]
    fn motion_start_on_loading_source_waits_for_ready() {
        let mut rig = Rig::new();
        let element = animated_bird();
        rig.sync(&element);

        assert!(rig.engine.arm_motion_start(&mut rig.backend, &element, rig.now));
        assert_eq!(rig.engine.state("bird", rig.now), AudioState::Idle);
        assert!(!rig.engine.arm_motion_start(&mut rig.backend, &element, rig.now));

        rig.advance(10.0);
        assert_eq!(rig.engine.state("bird", rig.now), AudioState::StartPending);
        rig.advance(40.0);
        assert!(rig.engine.is_playing("bird"));
    }

    #[test]
    fn motion_start_on_stalled_source_fires_at_ready_timeout() {
        let mut rig = Rig::new();
        rig.backend.stall_loading("bird.mp3");
        let element = animated_bird();
        rig.sync(&element);
        rig.engine.arm_motion_start(&mut rig.backend, &element, rig.now);

        rig.advance(1000.0);
        assert_eq!(rig.engine.state("bird", rig.now), AudioState::Idle);
        rig.advance(600.0);
        assert_eq!(rig.engine.state("bird", rig.now), AudioState::StartPending);
    }

    #[test]
    fn removing_audio_releases_the_handle() {
        let mut rig = Rig::new();
        rig.sync(&bird(true));
        assert!(rig.engine.has_handle("bird"));

        let mut element = bird(true);
        element.audio = None;
        rig.sync(&element);
        assert!(!rig.engine.has_handle("bird"));
    }
}
