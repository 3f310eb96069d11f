//! Audio side of the stage.
//!
//! Playback itself happens behind [`AudioBackend`]; starting playback is
//! asynchronous and its outcome, readiness, time updates and the native end
//! signal all come back later as [`PlaybackEvent`]s. Two independent owners
//! sit on top of the backend:
//!
//! - [`AudioEngine`] reconciles each element's desired audio state with what
//!   its playback handle is actually doing.
//! - [`ManualPlayer`] runs explicit one-shot plays on handles of its own.
//!
//! Every handle is opened with a [`HandleKey`] carrying a generation number.
//! Events for a generation that is no longer current are dropped, so a start
//! that resolves after its handle was discarded has no effect.

mod engine;
mod manual;
mod sim;

pub use engine::{AudioEngine, AudioState, DesiredAudio};
pub use manual::ManualPlayer;
pub use sim::SimulatedBackend;

use crate::scene::ElementId;

/// Which owner a playback handle belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandleRole {
    Engine,
    Manual,
}

/// Identity of one playback handle.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HandleKey {
    pub element: ElementId,
    pub role: HandleRole,
    pub generation: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PlaybackEventKind {
    /// The source can be played.
    Ready,
    /// A play request resolved successfully.
    Started,
    /// A play request was rejected.
    StartFailed(String),
    /// Playback position advanced.
    TimeUpdate,
    /// Native end-of-track signal.
    Ended,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackEvent {
    pub key: HandleKey,
    pub kind: PlaybackEventKind,
}

/// A single playable audio source.
///
/// `play` only requests playback; the handle reports the outcome later.
/// Like a media element, a handle is no longer paused as soon as play has
/// been requested.
pub trait PlaybackHandle {
    fn load(&mut self, src: &str);
    fn set_volume(&mut self, volume: f64);
    fn set_looping(&mut self, looping: bool);
    fn seek(&mut self, seconds: f64);
    fn play(&mut self);
    fn pause(&mut self);
    fn is_paused(&self) -> bool;
    fn has_ended(&self) -> bool;
    /// Seconds.
    fn current_time(&self) -> f64;
    /// Seconds, once known.
    fn duration(&self) -> Option<f64>;

    fn is_playing(&self) -> bool {
        !self.is_paused() && !self.has_ended()
    }
}

/// Opens playback handles and delivers their events.
pub trait AudioBackend {
    fn open(&mut self, key: HandleKey) -> Box<dyn PlaybackHandle>;

    /// Gives backends driven by the stage clock a chance to advance. Backends
    /// with their own threads deliver events without it.
    fn pump(&mut self, _now_ms: f64) {}
}
