//! Core library for the forest projection stage.
//!
//! A stage holds a set of sprites placed on a fixed virtual grid. Each can
//! carry an audio cue and a keyframed trajectory. Commands arrive over
//! pluggable transports; every frame the stage evaluates trajectories,
//! reconciles audio against what the playback backend actually does, draws
//! and publishes notifications back to the controllers.

pub mod assets;
pub mod audio;
pub mod bridge;
pub mod config;
pub mod error;
pub mod render;
pub mod scene;
pub mod stage;
pub mod store;
pub mod timeline;
pub mod trajectory;

pub use assets::{AssetResolver, DirResolver, ImageCache};
pub use audio::{AudioBackend, AudioEngine, ManualPlayer, PlaybackEvent, SimulatedBackend};
pub use bridge::{Bridge, ChannelTransport, Command, Envelope, Notification, TransportId};
pub use config::AppConfig;
pub use error::{Result, StageError};
pub use render::Renderer;
pub use scene::{Element, ElementId, Pose, SceneConfig, Trajectory};
pub use stage::Stage;
pub use store::SceneStore;
pub use timeline::{FixedRateDriver, FrameClock, ManualClock, Scheduler, SystemClock};
