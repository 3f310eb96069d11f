use std::{
    cell::{Cell, RefCell},
    collections::{HashMap, HashSet},
    rc::Rc,
};

use crossbeam_channel::Sender;

use super::{AudioBackend, HandleKey, PlaybackEvent, PlaybackEventKind, PlaybackHandle};

const DEFAULT_DURATION_SECONDS: f64 = 3.0;

/// Deterministic playback backend driven by the stage clock.
///
/// Loading, start resolution and playback all advance only in [`pump`],
/// with configurable latencies. It stands in for an audio device in headless
/// runs and lets tests reproduce start/stop races exactly.
///
/// [`pump`]: AudioBackend::pump
pub struct SimulatedBackend {
    events: Sender<PlaybackEvent>,
    clock: Rc<Cell<f64>>,
    tracks: Vec<Rc<RefCell<SimTrack>>>,
    durations: HashMap<String, f64>,
    failing: HashSet<String>,
    stalled: HashSet<String>,
    default_duration: f64,
    start_latency_ms: f64,
    load_latency_ms: f64,
    native_end: bool,
    last_pump: Option<f64>,
}

impl SimulatedBackend {
    pub fn new(events: Sender<PlaybackEvent>) -> Self {
        Self {
            events,
            clock: Rc::new(Cell::new(0.0)),
            tracks: Vec::new(),
            durations: HashMap::new(),
            failing: HashSet::new(),
            stalled: HashSet::new(),
            default_duration: DEFAULT_DURATION_SECONDS,
            start_latency_ms: 30.0,
            load_latency_ms: 50.0,
            native_end: true,
            last_pump: None,
        }
    }

    pub fn with_start_latency(mut self, ms: f64) -> Self {
        self.start_latency_ms = ms;
        self
    }

    pub fn with_load_latency(mut self, ms: f64) -> Self {
        self.load_latency_ms = ms;
        self
    }

    pub fn with_duration(mut self, src: impl Into<String>, seconds: f64) -> Self {
        self.durations.insert(src.into(), seconds);
        self
    }

    /// Play requests for `src` are rejected.
    pub fn with_failing(mut self, src: impl Into<String>) -> Self {
        self.failing.insert(src.into());
        self
    }

    /// Never delivers the native end signal.
    pub fn without_native_end(mut self) -> Self {
        self.native_end = false;
        self
    }

    /// `src` never reports ready.
    pub fn stall_loading(&mut self, src: impl Into<String>) {
        self.stalled.insert(src.into());
    }

    /// Number of handles that are still open.
    pub fn open_handles(&self) -> usize {
        self.tracks
            .iter()
            .filter(|track| !track.borrow().detached)
            .count()
    }

    pub fn track_volume(&self, key: &HandleKey) -> Option<f64> {
        self.tracks
            .iter()
            .map(|track| track.borrow())
            .find(|track| !track.detached && &track.key == key)
            .map(|track| track.volume)
    }

    fn emit(&self, key: &HandleKey, kind: PlaybackEventKind) {
        let event = PlaybackEvent {
            key: key.clone(),
            kind,
        };
        if self.events.send(event).is_err() {
            tracing::debug!("playback event receiver has been dropped");
        }
    }

    fn advance_track(&self, track: &mut SimTrack, now: f64, dt_seconds: f64) {
        if track.loading && now >= track.ready_at && !self.stalled.contains(&track.src) {
            track.loading = false;
            track.duration = Some(
                self.durations
                    .get(&track.src)
                    .copied()
                    .unwrap_or(self.default_duration),
            );
            self.emit(&track.key, PlaybackEventKind::Ready);
        }

        let was_running = track.running;
        if let Some(requested) = track.play_requested {
            if !track.loading && now >= requested + self.start_latency_ms {
                track.play_requested = None;
                if self.failing.contains(&track.src) {
                    track.paused = true;
                    track.running = false;
                    self.emit(
                        &track.key,
                        PlaybackEventKind::StartFailed(format!("cannot play `{}`", track.src)),
                    );
                } else {
                    track.running = true;
                    self.emit(&track.key, PlaybackEventKind::Started);
                }
            }
        }

        if !(was_running && track.running) || track.detached {
            return;
        }
        let duration = track.duration.unwrap_or(self.default_duration);
        track.position += dt_seconds;
        if track.position >= duration {
            if track.looping && duration > 0.0 {
                track.position %= duration;
            } else {
                track.position = duration;
                track.ended = true;
                track.paused = true;
                track.running = false;
                self.emit(&track.key, PlaybackEventKind::TimeUpdate);
                if self.native_end {
                    self.emit(&track.key, PlaybackEventKind::Ended);
                }
                return;
            }
        }
        self.emit(&track.key, PlaybackEventKind::TimeUpdate);
    }
}

impl AudioBackend for SimulatedBackend {
    fn open(&mut self, key: HandleKey) -> Box<dyn PlaybackHandle> {
        let track = Rc::new(RefCell::new(SimTrack::new(key)));
        self.tracks.push(track.clone());
        Box::new(SimHandle {
            track,
            clock: self.clock.clone(),
            load_latency_ms: self.load_latency_ms,
        })
    }

    fn pump(&mut self, now_ms: f64) {
        let dt_seconds = self
            .last_pump
            .map_or(0.0, |last| (now_ms - last).max(0.0) / 1000.0);
        self.last_pump = Some(now_ms);
        self.clock.set(now_ms);

        for track in &self.tracks {
            self.advance_track(&mut track.borrow_mut(), now_ms, dt_seconds);
        }
        // Detached tracks linger only until their last play request resolved.
        self.tracks.retain(|track| {
            let track = track.borrow();
            !track.detached || track.play_requested.is_some()
        });
    }
}

impl std::fmt::Debug for SimulatedBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulatedBackend")
            .field("tracks", &self.tracks.len())
            .field("start_latency_ms", &self.start_latency_ms)
            .finish()
    }
}

#[derive(Debug)]
struct SimTrack {
    key: HandleKey,
    src: String,
    volume: f64,
    looping: bool,
    paused: bool,
    running: bool,
    ended: bool,
    position: f64,
    duration: Option<f64>,
    loading: bool,
    ready_at: f64,
    play_requested: Option<f64>,
    detached: bool,
}

impl SimTrack {
    fn new(key: HandleKey) -> Self {
        Self {
            key,
            src: String::new(),
            volume: 1.0,
            looping: false,
            paused: true,
            running: false,
            ended: false,
            position: 0.0,
            duration: None,
            loading: true,
            ready_at: f64::INFINITY,
            play_requested: None,
            detached: false,
        }
    }
}

struct SimHandle {
    track: Rc<RefCell<SimTrack>>,
    clock: Rc<Cell<f64>>,
    load_latency_ms: f64,
}

impl PlaybackHandle for SimHandle {
    fn load(&mut self, src: &str) {
        let mut track = self.track.borrow_mut();
        track.src = src.to_string();
        track.loading = true;
        track.ready_at = self.clock.get() + self.load_latency_ms;
        track.duration = None;
        track.position = 0.0;
        track.ended = false;
        track.paused = true;
        track.running = false;
        track.play_requested = None;
    }

    fn set_volume(&mut self, volume: f64) {
        self.track.borrow_mut().volume = volume;
    }

    fn set_looping(&mut self, looping: bool) {
        self.track.borrow_mut().looping = looping;
    }

    fn seek(&mut self, seconds: f64) {
        let mut track = self.track.borrow_mut();
        let limit = track.duration.unwrap_or(f64::INFINITY);
        track.position = seconds.clamp(0.0, limit);
        if track.position < limit {
            track.ended = false;
        }
    }

    fn play(&mut self) {
        let mut track = self.track.borrow_mut();
        if track.ended {
            track.ended = false;
            track.position = 0.0;
        }
        track.paused = false;
        if track.play_requested.is_none() {
            track.play_requested = Some(self.clock.get());
        }
    }

    fn pause(&mut self) {
        let mut track = self.track.borrow_mut();
        track.paused = true;
        track.running = false;
        track.play_requested = None;
    }

    fn is_paused(&self) -> bool {
        self.track.borrow().paused
    }

    fn has_ended(&self) -> bool {
        self.track.borrow().ended
    }

    fn current_time(&self) -> f64 {
        self.track.borrow().position
    }

    fn duration(&self) -> Option<f64> {
        self.track.borrow().duration
    }
}

impl Drop for SimHandle {
    fn drop(&mut self) {
        self.track.borrow_mut().detached = true;
    }
}
