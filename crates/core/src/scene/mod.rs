//! Data model of the projection stage.
//!
//! Every type here mirrors the JSON the authoring tool sends, so field names
//! are camelCase on the wire. Coordinates live in the fixed virtual grid
//! configured in [`crate::config::StageConfig`] (1920×1080 by default).

use std::{borrow::Borrow, fmt};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{Result, StageError};

/// Identifier of an element on the stage.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ElementId(pub String);

impl ElementId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ElementId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for ElementId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ElementId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

/// A sprite on the stage, optionally carrying an audio cue and a trajectory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Element {
    pub id: ElementId,
    #[serde(default)]
    pub name: String,
    /// Opaque image reference handed to the asset resolver.
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub position: Position,
    #[serde(default = "unit")]
    pub scale: f64,
    /// Radians.
    #[serde(default)]
    pub rotation: f64,
    #[serde(default = "unit")]
    pub opacity: f64,
    #[serde(default = "enabled")]
    pub visible: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio: Option<AudioConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trajectory: Option<Trajectory>,
}

impl Element {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: ElementId::new(id),
            name: String::new(),
            image: String::new(),
            position: Position::default(),
            scale: 1.0,
            rotation: 0.0,
            opacity: 1.0,
            visible: true,
            audio: None,
            trajectory: None,
        }
    }

    /// Audio cue with a usable source, if any.
    pub fn audio_cue(&self) -> Option<&AudioConfig> {
        self.audio.as_ref().filter(|audio| !audio.src.is_empty())
    }

    /// Trajectory that is currently running, if any.
    pub fn active_trajectory(&self) -> Option<&Trajectory> {
        self.trajectory.as_ref().filter(|t| t.is_animating)
    }

    pub fn is_drawable(&self) -> bool {
        self.visible && self.opacity > 0.0
    }

    /// Writes the explicit fields of `pose` back into the element.
    pub fn settle(&mut self, pose: &Pose) {
        self.position = Position {
            x: pose.x,
            y: pose.y,
        };
        self.scale = pose.scale;
        self.rotation = pose.rotation;
        self.opacity = pose.opacity;
    }
}

/// Audio attached to an element. `is_playing` is the requested intent, not
/// an observation of the playback handle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioConfig {
    pub src: String,
    #[serde(default = "half")]
    pub volume: f64,
    #[serde(default, rename = "loop")]
    pub looping: bool,
    #[serde(default)]
    pub is_playing: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Easing {
    Linear,
    EaseIn,
    EaseOut,
    #[default]
    EaseInOut,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EffectType {
    #[default]
    None,
    /// Periodic scale modulation.
    Breathing,
    /// Periodic rotation modulation.
    Swinging,
}

/// Keyframed motion path. Keyframe times are fractions of `duration`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Trajectory {
    #[serde(default)]
    pub is_animating: bool,
    /// Epoch milliseconds.
    #[serde(default)]
    pub start_time: f64,
    /// Milliseconds.
    pub duration: f64,
    /// Ping-pong looping: forward then reverse, period `2 * duration`.
    #[serde(default, rename = "loop")]
    pub looping: bool,
    #[serde(default)]
    pub easing: Easing,
    #[serde(default)]
    pub keyframes: Vec<Keyframe>,
    #[serde(default)]
    pub effect_type: EffectType,
    /// Keep the effect running once a non-looping trajectory has finished.
    #[serde(default)]
    pub effect_continue: bool,
    #[serde(default = "effect_period")]
    pub effect_period_ms: f64,
    #[serde(default = "breath_amp")]
    pub effect_breath_amp: f64,
    #[serde(default = "swing_deg")]
    pub effect_swing_deg: f64,
}

impl Trajectory {
    pub fn new(duration: f64, keyframes: Vec<Keyframe>) -> Self {
        Self {
            is_animating: false,
            start_time: 0.0,
            duration,
            looping: false,
            easing: Easing::default(),
            keyframes,
            effect_type: EffectType::None,
            effect_continue: false,
            effect_period_ms: effect_period(),
            effect_breath_amp: breath_amp(),
            effect_swing_deg: swing_deg(),
        }
    }
}

/// A point on a trajectory. `x`/`y` are absolute virtual coordinates; the
/// other fields are sparse and only interpolated when both neighbours set
/// them.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Keyframe {
    pub time: f64,
    pub x: f64,
    pub y: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotation: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opacity: Option<f64>,
}

impl Keyframe {
    pub fn at(time: f64, x: f64, y: f64) -> Self {
        Self {
            time,
            x,
            y,
            scale: None,
            rotation: None,
            opacity: None,
        }
    }
}

/// Transform of an element for one frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pose {
    pub x: f64,
    pub y: f64,
    pub scale: f64,
    pub rotation: f64,
    pub opacity: f64,
}

impl Pose {
    /// The element's resting transform, ignoring its trajectory.
    pub fn of(element: &Element) -> Self {
        Self {
            x: element.position.x,
            y: element.position.y,
            scale: element.scale,
            rotation: element.rotation,
            opacity: element.opacity,
        }
    }
}

/// Global scene settings, merged field by field from `UPDATE_FOREST_CONFIG`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SceneConfig {
    #[serde(default = "background_video")]
    pub background_video: String,
    #[serde(default)]
    pub ambient_audio: AmbientAudio,
    #[serde(default)]
    pub interaction: Interaction,
}

impl Default for SceneConfig {
    fn default() -> Self {
        Self {
            background_video: background_video(),
            ambient_audio: AmbientAudio::default(),
            interaction: Interaction::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AmbientAudio {
    pub volume: f64,
    #[serde(default)]
    pub sources: Vec<String>,
}

impl Default for AmbientAudio {
    fn default() -> Self {
        Self {
            volume: 0.3,
            sources: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Interaction {
    pub mouse_effects: bool,
    pub click_effects: bool,
    pub sound_on_interaction: bool,
}

impl Default for Interaction {
    fn default() -> Self {
        Self {
            mouse_effects: true,
            click_effects: true,
            sound_on_interaction: true,
        }
    }
}

/// Shallow merge of `fields` into `target`: every top-level key present in
/// `fields` replaces the corresponding field, everything else is kept. Keys
/// listed in `frozen` are never overwritten.
pub fn merge_fields<T>(target: &T, fields: &Map<String, Value>, frozen: &[&str]) -> Result<T>
where
    T: Serialize + serde::de::DeserializeOwned,
{
    let mut current = match serde_json::to_value(target)? {
        Value::Object(map) => map,
        _ => return Err(StageError::msg("merge target is not an object")),
    };
    for (key, value) in fields {
        if frozen.contains(&key.as_str()) {
            continue;
        }
        current.insert(key.clone(), value.clone());
    }
    Ok(serde_json::from_value(Value::Object(current))?)
}

fn unit() -> f64 {
    1.0
}

fn half() -> f64 {
    0.5
}

fn enabled() -> bool {
    true
}

fn effect_period() -> f64 {
    2000.0
}

fn breath_amp() -> f64 {
    0.08
}

fn swing_deg() -> f64 {
    10.0
}

fn background_video() -> String {
    "./video/forest.mp4".to_string()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn parses_authoring_payload() {
        let element: Element = serde_json::from_value(json!({
            "id": "fox",
            "name": "Fox",
            "image": "sprites/fox.png",
            "position": { "x": 400, "y": 300 },
            "scale": 0.5,
            "rotation": 0.1,
            "visible": true,
            "opacity": 1,
            "audio": { "src": "fox.mp3", "volume": 0.7, "loop": true, "isPlaying": false },
            "trajectory": {
                "isAnimating": true,
                "startTime": 1000,
                "duration": 2000,
                "loop": true,
                "easing": "easeOut",
                "keyframes": [
                    { "time": 0, "x": 0, "y": 0, "scale": 1 },
                    { "time": 1, "x": 100, "y": 50 }
                ]
            }
        }))
        .unwrap();

        let audio = element.audio_cue().unwrap();
        assert!(audio.looping);
        assert_eq!(audio.volume, 0.7);
        let trajectory = element.active_trajectory().unwrap();
        assert_eq!(trajectory.easing, Easing::EaseOut);
        assert_eq!(trajectory.keyframes[0].scale, Some(1.0));
        assert_eq!(trajectory.keyframes[1].scale, None);
        assert_eq!(trajectory.effect_period_ms, 2000.0);
    }

    #[test]
    fn missing_fields_take_defaults() {
        let element: Element = serde_json::from_value(json!({ "id": "a" })).unwrap();
        assert_eq!(element, Element::new("a"));
        assert!(element.audio_cue().is_none());
    }

    #[test]
    fn empty_source_is_not_an_audio_cue() {
        let mut element = Element::new("a");
        element.audio = Some(AudioConfig {
            src: String::new(),
            volume: 1.0,
            looping: false,
            is_playing: true,
        });
        assert!(element.audio_cue().is_none());
    }

    #[test]
    fn merge_replaces_only_listed_fields() {
        let mut element = Element::new("a");
        element.scale = 2.0;
        let fields = json!({ "id": "b", "opacity": 0.25, "position": { "x": 5, "y": 6 } });

        let merged = merge_fields(&element, fields.as_object().unwrap(), &["id"]).unwrap();

        assert_eq!(merged.id.as_str(), "a");
        assert_eq!(merged.opacity, 0.25);
        assert_eq!(merged.scale, 2.0);
        assert_eq!(merged.position, Position { x: 5.0, y: 6.0 });
    }

    #[test]
    fn merge_with_null_clears_optional_field() {
        let mut element = Element::new("a");
        element.audio = Some(AudioConfig {
            src: "x.mp3".into(),
            volume: 1.0,
            looping: false,
            is_playing: false,
        });
        let fields = json!({ "audio": null });

        let merged = merge_fields(&element, fields.as_object().unwrap(), &[]).unwrap();
        assert!(merged.audio.is_none());
    }

    #[test]
    fn merge_rejects_ill_typed_fields() {
        let element = Element::new("a");
        let fields = json!({ "scale": "huge" });
        assert!(merge_fields(&element, fields.as_object().unwrap(), &[]).is_err());
    }
}
