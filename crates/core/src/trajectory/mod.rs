//! Pure trajectory evaluation: `(now, trajectory, resting pose) -> pose`.
//!
//! Nothing here touches the store or the clock. The scheduler decides when a
//! trajectory is evaluated and what happens when it completes.

use std::f64::consts::TAU;

use crate::scene::{Easing, EffectType, Keyframe, Pose, Trajectory};

/// Segment spans shorter than this snap to the later keyframe.
const MIN_SEGMENT_SPAN: f64 = 1e-4;
const MIN_EFFECT_PERIOD_MS: f64 = 100.0;

impl Easing {
    pub fn apply(self, t: f64) -> f64 {
        match self {
            Easing::Linear => t,
            Easing::EaseIn => t * t * t,
            Easing::EaseOut => 1.0 - (1.0 - t).powi(3),
            Easing::EaseInOut => {
                if t < 0.5 {
                    4.0 * t * t * t
                } else {
                    1.0 - (-2.0 * t + 2.0).powi(3) / 2.0
                }
            }
        }
    }
}

/// Raw (un-eased) progress in `[0, 1]`.
///
/// Looping trajectories ping-pong with period `2 * duration`; others clamp.
pub fn progress(now: f64, trajectory: &Trajectory) -> f64 {
    let duration = trajectory.duration;
    if duration <= 0.0 {
        return 1.0;
    }
    let elapsed = now - trajectory.start_time;
    if trajectory.looping {
        let cycle = elapsed.rem_euclid(2.0 * duration);
        if cycle <= duration {
            cycle / duration
        } else {
            1.0 - (cycle - duration) / duration
        }
    } else {
        (elapsed / duration).clamp(0.0, 1.0)
    }
}

/// Whether a non-looping trajectory has run its full duration at `now`.
pub fn is_complete(now: f64, trajectory: &Trajectory) -> bool {
    !trajectory.looping && now - trajectory.start_time >= trajectory.duration
}

/// Pose of the element at `now`. Fields not driven by the keyframes keep
/// their value from `rest`.
pub fn evaluate(now: f64, trajectory: &Trajectory, rest: Pose) -> Pose {
    let eased = trajectory.easing.apply(progress(now, trajectory));
    sample(&trajectory.keyframes, eased, rest)
}

/// Pose a completed trajectory settles on: the explicit fields of its last
/// keyframe over `rest`.
pub fn final_pose(trajectory: &Trajectory, rest: Pose) -> Pose {
    match trajectory.keyframes.last() {
        Some(last) => hold(last, rest),
        None => rest,
    }
}

/// Samples the keyframe sequence at eased progress `t`.
pub fn sample(keyframes: &[Keyframe], t: f64, rest: Pose) -> Pose {
    let Some(last) = keyframes.last() else {
        return rest;
    };
    // The end of the path is the last keyframe itself, sparse fields included.
    if t >= last.time {
        return hold(last, rest);
    }
    let next_idx = keyframes.iter().position(|k| k.time >= t);

    match next_idx {
        None => hold(last, rest),
        Some(0) => hold(&keyframes[0], rest),
        Some(idx) => {
            let a = &keyframes[idx - 1];
            let b = &keyframes[idx];
            let span = b.time - a.time;
            if span.abs() < MIN_SEGMENT_SPAN {
                return hold(b, rest);
            }
            interpolate(a, b, (t - a.time) / span, rest)
        }
    }
}

/// Adds the periodic breathing / swinging modulation on top of `pose`.
pub fn apply_effect(now: f64, trajectory: &Trajectory, mut pose: Pose) -> Pose {
    if trajectory.effect_type == EffectType::None {
        return pose;
    }
    let period = trajectory.effect_period_ms.max(MIN_EFFECT_PERIOD_MS);
    let phase = (now - trajectory.start_time).rem_euclid(period) / period;
    let wave = (phase * TAU).sin();

    match trajectory.effect_type {
        EffectType::Breathing => pose.scale *= 1.0 + trajectory.effect_breath_amp * wave,
        EffectType::Swinging => pose.rotation += trajectory.effect_swing_deg.to_radians() * wave,
        EffectType::None => {}
    }
    pose
}

/// Whether the effect should still run once the trajectory stopped animating.
pub fn effect_outlives_motion(trajectory: &Trajectory) -> bool {
    trajectory.effect_continue && !trajectory.looping && trajectory.effect_type != EffectType::None
}

fn hold(keyframe: &Keyframe, rest: Pose) -> Pose {
    Pose {
        x: keyframe.x,
        y: keyframe.y,
        scale: keyframe.scale.unwrap_or(rest.scale),
        rotation: keyframe.rotation.unwrap_or(rest.rotation),
        opacity: keyframe.opacity.unwrap_or(rest.opacity),
    }
}

fn interpolate(a: &Keyframe, b: &Keyframe, f: f64, rest: Pose) -> Pose {
    Pose {
        x: lerp(a.x, b.x, f),
        y: lerp(a.y, b.y, f),
        scale: lerp_sparse(a.scale, b.scale, f).unwrap_or(rest.scale),
        rotation: lerp_sparse(a.rotation, b.rotation, f).unwrap_or(rest.rotation),
        opacity: lerp_sparse(a.opacity, b.opacity, f).unwrap_or(rest.opacity),
    }
}

fn lerp(start: f64, end: f64, t: f64) -> f64 {
    start + (end - start) * t
}

fn lerp_sparse(start: Option<f64>, end: Option<f64>, t: f64) -> Option<f64> {
    Some(lerp(start?, end?, t))
}
