use std::{
    cell::Cell,
    ops::ControlFlow,
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use crate::{
    assets::ImageCache,
    audio::{AudioBackend, AudioEngine},
    bridge::Notification,
    config::StageConfig,
    render::Renderer,
    scene::{Element, ElementId, Pose},
    store::SceneStore,
    trajectory, Result,
};

/// Source of frame timestamps in milliseconds.
pub trait FrameClock {
    fn now_ms(&self) -> f64;
}

/// Wall clock, milliseconds since the Unix epoch.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl FrameClock for SystemClock {
    fn now_ms(&self) -> f64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs_f64() * 1000.0)
            .unwrap_or_default()
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: Cell<f64>,
}

impl ManualClock {
    pub fn new(start_ms: f64) -> Self {
        Self {
            now: Cell::new(start_ms),
        }
    }

    pub fn advance(&self, ms: f64) -> f64 {
        self.now.set(self.now.get() + ms);
        self.now.get()
    }

    pub fn set(&self, ms: f64) {
        self.now.set(ms);
    }
}

impl FrameClock for ManualClock {
    fn now_ms(&self) -> f64 {
        self.now.get()
    }
}

/// Calls a frame function at a fixed rate until it breaks or fails.
#[derive(Debug, Clone, Copy)]
pub struct FixedRateDriver {
    interval: Duration,
}

impl FixedRateDriver {
    pub fn new(target_fps: u32) -> Self {
        Self::with_interval(Duration::from_secs(1) / target_fps.max(1))
    }

    pub fn from_stage(stage: &StageConfig) -> Self {
        Self::new(stage.target_fps)
    }

    pub fn with_interval(interval: Duration) -> Self {
        Self { interval }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn run<C, F>(&self, clock: &C, mut frame: F) -> Result<()>
    where
        C: FrameClock + ?Sized,
        F: FnMut(f64) -> Result<ControlFlow<()>>,
    {
        loop {
            let started = Instant::now();
            if frame(clock.now_ms())?.is_break() {
                return Ok(());
            }
            if let Some(rest) = self.interval.checked_sub(started.elapsed()) {
                std::thread::sleep(rest);
            }
        }
    }
}

/// Everything one frame reads or writes.
pub struct FrameContext<'a> {
    pub store: &'a mut SceneStore,
    pub engine: &'a mut AudioEngine,
    pub backend: &'a mut dyn AudioBackend,
    pub renderer: &'a mut Renderer,
    pub images: &'a mut ImageCache,
    pub outbox: &'a mut Vec<Notification>,
}

/// What a frame drew.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct FrameReport {
    pub poses: Vec<(ElementId, Pose)>,
    /// Trajectories that completed during this frame.
    pub completed: Vec<ElementId>,
}

impl FrameReport {
    pub fn pose_of(&self, id: &str) -> Option<&Pose> {
        self.poses
            .iter()
            .find(|(element, _)| element.as_str() == id)
            .map(|(_, pose)| pose)
    }
}

/// The render loop body.
///
/// For every drawable element a tick computes its pose, fires the
/// trajectory side effects, then draws it. Hidden or fully transparent
/// elements are skipped entirely, trajectory included.
#[derive(Debug, Default)]
pub struct Scheduler {
    frames: u64,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    pub fn tick(&mut self, now: f64, ctx: FrameContext<'_>) -> FrameReport {
        let FrameContext {
            store,
            engine,
            backend,
            renderer,
            images,
            outbox,
        } = ctx;
        self.frames += 1;
        let mut report = FrameReport::default();

        renderer.begin_frame();
        for element in store.iter_mut() {
            if !element.is_drawable() {
                continue;
            }
            let mut pose = pose_at(now, element);

            engine.arm_motion_start(&mut *backend, element, now);
            if element
                .active_trajectory()
                .is_some_and(|t| trajectory::is_complete(now, t))
            {
                pose = complete(now, element, outbox);
                engine.sync(&mut *backend, element, now);
                report.completed.push(element.id.clone());
            }

            let image = images.get(&element.image, now);
            renderer.draw_element(element.id.as_str(), &pose, image);
            report.poses.push((element.id.clone(), pose));
        }
        report
    }
}

fn pose_at(now: f64, element: &Element) -> Pose {
    let rest = Pose::of(element);
    let Some(path) = element.trajectory.as_ref() else {
        return rest;
    };
    if path.is_animating {
        trajectory::apply_effect(now, path, trajectory::evaluate(now, path, rest))
    } else if trajectory::effect_outlives_motion(path) {
        trajectory::apply_effect(now, path, rest)
    } else {
        rest
    }
}

/// Settles a finished trajectory and reports it. Returns the pose to draw.
fn complete(now: f64, element: &mut Element, outbox: &mut Vec<Notification>) -> Pose {
    let rest = Pose::of(element);
    let Some(path) = element.trajectory.as_mut() else {
        return rest;
    };
    let settled = trajectory::final_pose(path, rest);
    path.is_animating = false;
    let drawn = if trajectory::effect_outlives_motion(path) {
        trajectory::apply_effect(now, path, settled)
    } else {
        settled
    };

    element.settle(&settled);
    if let Some(audio) = element.audio.as_mut() {
        audio.is_playing = false;
    }
    tracing::info!(id = %element.id, "trajectory completed");
    outbox.push(Notification::TrajectoryEnded {
        id: element.id.clone(),
    });
    drawn
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crossbeam_channel::{unbounded, Receiver};

    use super::*;
    use crate::{
        assets::DirResolver,
        audio::{PlaybackEvent, SimulatedBackend},
        config::AudioTiming,
        scene::{AudioConfig, EffectType, Keyframe, Trajectory},
    };

    struct Harness {
        scheduler: Scheduler,
        store: SceneStore,
        engine: AudioEngine,
        backend: SimulatedBackend,
        events: Receiver<PlaybackEvent>,
        renderer: Renderer,
        images: ImageCache,
        outbox: Vec<Notification>,
    }

    impl Harness {
        fn new() -> Self {
            let (tx, events) = unbounded();
            let stage = StageConfig {
                output_width: 96,
                output_height: 54,
                ..StageConfig::default()
            };
            Self {
                scheduler: Scheduler::new(),
                store: SceneStore::new(),
                engine: AudioEngine::new(AudioTiming::default()),
                backend: SimulatedBackend::new(tx),
                events,
                renderer: Renderer::new(&stage).unwrap(),
                images: ImageCache::new(Arc::new(DirResolver::new("missing-assets")), 2000.0)
                    .unwrap(),
                outbox: Vec::new(),
            }
        }

        fn tick(&mut self, now: f64) -> FrameReport {
            self.backend.pump(now);
            while let Ok(event) = self.events.try_recv() {
                self.engine.on_event(&event, now, &mut self.outbox);
            }
            self.scheduler.tick(
                now,
                FrameContext {
                    store: &mut self.store,
                    engine: &mut self.engine,
                    backend: &mut self.backend,
                    renderer: &mut self.renderer,
                    images: &mut self.images,
                    outbox: &mut self.outbox,
                },
            )
        }

        fn trajectory_ends(&self) -> usize {
            self.outbox
                .iter()
                .filter(|n| matches!(n, Notification::TrajectoryEnded { .. }))
                .count()
        }
    }

    fn walker(start_time: f64) -> Element {
        let mut element = Element::new("fox");
        let mut path = Trajectory::new(
            1000.0,
            vec![
                Keyframe::at(0.0, 0.0, 0.0),
                Keyframe {
                    opacity: Some(0.5),
                    ..Keyframe::at(1.0, 100.0, 50.0)
                },
            ],
        );
        path.is_animating = true;
        path.start_time = start_time;
        path.easing = crate::scene::Easing::Linear;
        element.trajectory = Some(path);
        element
    }

    #[test]
    fn completion_settles_element_and_reports_once() {
        let mut h = Harness::new();
        let mut element = walker(0.0);
        element.audio = Some(AudioConfig {
            src: "steps.mp3".into(),
            volume: 0.5,
            looping: false,
            is_playing: true,
        });
        h.store.insert(element);

        let mid = h.tick(500.0);
        let pose = mid.pose_of("fox").unwrap();
        assert!((pose.x - 50.0).abs() < 1e-9);
        assert!(mid.completed.is_empty());

        let end = h.tick(1000.0);
        assert_eq!(end.completed, [ElementId::from("fox")]);
        for now in [1016.0, 1032.0, 2000.0] {
            h.tick(now);
        }
        assert_eq!(h.trajectory_ends(), 1);

        let fox = h.store.get("fox").unwrap();
        assert_eq!((fox.position.x, fox.position.y), (100.0, 50.0));
        assert_eq!(fox.opacity, 0.5);
        assert!(!fox.trajectory.as_ref().unwrap().is_animating);
        assert!(!fox.audio.as_ref().unwrap().is_playing);
    }

    #[test]
    fn hidden_elements_are_not_evaluated() {
        let mut h = Harness::new();
        let mut element = walker(0.0);
        element.visible = false;
        h.store.insert(element);
        let mut faded = walker(0.0);
        faded.id = "ghost".into();
        faded.opacity = 0.0;
        h.store.insert(faded);

        let report = h.tick(5000.0);
        assert!(report.poses.is_empty());
        assert_eq!(h.trajectory_ends(), 0);
        assert!(h.store.get("fox").unwrap().trajectory.as_ref().unwrap().is_animating);
    }

    #[test]
    fn motion_start_fires_on_first_tick_only() {
        let mut h = Harness::new();
        let mut element = walker(0.0);
        element.trajectory.as_mut().unwrap().duration = 60_000.0;
        element.audio = Some(AudioConfig {
            src: "steps.mp3".into(),
            volume: 0.5,
            looping: false,
            is_playing: false,
        });
        h.store.insert(element);

        h.tick(0.0);
        let state = h.engine.state("fox", 0.0);
        assert_eq!(state, crate::audio::AudioState::Idle, "source still loading");
        for step in 1..100 {
            h.tick(f64::from(step) * 16.0);
        }
        assert!(h.engine.is_playing("fox"));
        assert_eq!(h.backend.open_handles(), 1);
    }

    #[test]
    fn continued_effect_keeps_breathing_after_completion() {
        let mut h = Harness::new();
        let mut element = walker(0.0);
        {
            let path = element.trajectory.as_mut().unwrap();
            path.effect_type = EffectType::Breathing;
            path.effect_continue = true;
            path.effect_period_ms = 1000.0;
        }
        h.store.insert(element);

        h.tick(1000.0);
        let quarter = h.tick(1250.0);
        let three_quarters = h.tick(1750.0);
        let up = quarter.pose_of("fox").unwrap().scale;
        let down = three_quarters.pose_of("fox").unwrap().scale;
        assert!((up - 1.08).abs() < 1e-9);
        assert!((down - 0.92).abs() < 1e-9);
        assert_eq!(h.store.get("fox").unwrap().scale, 1.0, "effect is never persisted");
    }

    #[test]
    fn looping_trajectory_never_completes() {
        let mut h = Harness::new();
        let mut element = walker(0.0);
        element.trajectory.as_mut().unwrap().looping = true;
        h.store.insert(element);

        let back = (0..10).map(|i| h.tick(f64::from(i) * 500.0)).last().unwrap();
        assert_eq!(h.trajectory_ends(), 0);
        // 4500ms into a 2000ms ping-pong period is 500ms into the way out.
        assert!((back.pose_of("fox").unwrap().x - 50.0).abs() < 1e-9);
    }

    #[test]
    fn manual_clock_drives_fixed_rate_driver() {
        let clock = ManualClock::new(100.0);
        let driver = FixedRateDriver::with_interval(Duration::ZERO);
        let mut seen = Vec::new();

        driver
            .run(&clock, |now| {
                seen.push(now);
                clock.advance(16.0);
                Ok(if seen.len() == 3 {
                    ControlFlow::Break(())
                } else {
                    ControlFlow::Continue(())
                })
            })
            .unwrap();
        assert_eq!(seen, [100.0, 116.0, 132.0]);
    }

    #[test]
    fn driver_interval_follows_target_rate() {
        let driver = FixedRateDriver::new(50);
        assert_eq!(driver.interval(), Duration::from_millis(20));
    }
}
