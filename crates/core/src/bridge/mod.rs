//! Message transport bridge.
//!
//! Commands reach the stage over two redundant transports: a host relay that
//! accepts anything, and a same-origin broadcast that rejects messages from
//! other origins. Both go through the same [`Command::parse`] so there is one
//! normalisation path; replies are routed back to the adapter a request came
//! in on.

use crossbeam_channel::Sender;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::{
    scene::{Element, ElementId},
    Result, StageError,
};

/// Wire envelope shared by all message types.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Value,
}

impl Envelope {
    pub fn new(kind: impl Into<String>, data: Value) -> Self {
        Self {
            kind: kind.into(),
            data,
        }
    }
}

/// Normalised inbound command.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    AddElement(Element),
    UpdateElement {
        id: ElementId,
        fields: Map<String, Value>,
    },
    RemoveElement(ElementId),
    UpdateForestConfig(Map<String, Value>),
    PlayAudioOnce(ElementId),
    RequestBackgroundSnapshot,
}

impl Command {
    /// Parses a raw `{type, data}` message. Anything malformed or unknown
    /// yields `None`.
    pub fn parse(raw: &Value) -> Option<Command> {
        let envelope: Envelope = match serde_json::from_value(raw.clone()) {
            Ok(envelope) => envelope,
            Err(err) => {
                tracing::debug!(%err, "dropping message without a valid envelope");
                return None;
            }
        };
        let command = Self::from_envelope(&envelope);
        if command.is_none() {
            tracing::debug!(kind = %envelope.kind, "dropping unknown or malformed command");
        }
        command
    }

    fn from_envelope(envelope: &Envelope) -> Option<Command> {
        let data = &envelope.data;
        match envelope.kind.as_str() {
            "ADD_ELEMENT" => serde_json::from_value(data.clone())
                .ok()
                .map(Command::AddElement),
            "UPDATE_ELEMENT" => {
                let fields = data.as_object()?.clone();
                let id = id_of(data)?;
                Some(Command::UpdateElement { id, fields })
            }
            "REMOVE_ELEMENT" => id_of(data).map(Command::RemoveElement),
            "UPDATE_FOREST_CONFIG" => data.as_object().cloned().map(Command::UpdateForestConfig),
            "PLAY_AUDIO_ONCE" => id_of(data).map(Command::PlayAudioOnce),
            "REQUEST_BACKGROUND_SNAPSHOT" => Some(Command::RequestBackgroundSnapshot),
            _ => None,
        }
    }
}

fn id_of(data: &Value) -> Option<ElementId> {
    data.get("id")?.as_str().map(ElementId::from)
}

/// Outbound message produced by the stage.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    AudioProgress {
        id: ElementId,
        current_time: f64,
        duration: f64,
        progress: f64,
    },
    AudioEnded {
        id: ElementId,
    },
    AudioError {
        id: ElementId,
        message: String,
    },
    TrajectoryEnded {
        id: ElementId,
    },
    BackgroundSnapshot {
        data_url: String,
    },
}

impl Notification {
    pub fn to_envelope(&self) -> Envelope {
        match self {
            Notification::AudioProgress {
                id,
                current_time,
                duration,
                progress,
            } => Envelope::new(
                "AUDIO_PROGRESS",
                json!({
                    "id": id,
                    "currentTime": current_time,
                    "duration": duration,
                    "progress": progress,
                }),
            ),
            Notification::AudioEnded { id } => Envelope::new("AUDIO_ENDED", json!({ "id": id })),
            Notification::AudioError { id, message } => {
                Envelope::new("AUDIO_ERROR", json!({ "id": id, "message": message }))
            }
            Notification::TrajectoryEnded { id } => {
                Envelope::new("TRAJECTORY_ENDED", json!({ "id": id }))
            }
            Notification::BackgroundSnapshot { data_url } => {
                Envelope::new("BACKGROUND_SNAPSHOT", json!({ "dataUrl": data_url }))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// Relayed by the host process; origin is not checked.
    HostRelay,
    /// Same-origin broadcast; foreign origins are rejected.
    Broadcast,
}

/// A pluggable transport adapter.
pub trait Transport {
    fn kind(&self) -> TransportKind;

    /// Whether an inbound message from `origin` may be processed.
    fn admits(&self, origin: Option<&str>) -> bool;

    /// Sends an outbound envelope over this transport.
    fn deliver(&mut self, envelope: &Envelope) -> Result<()>;

    /// Whether audio/trajectory notifications are published here.
    fn carries_notifications(&self) -> bool {
        self.kind() == TransportKind::HostRelay
    }
}

/// Transport adapter backed by a channel; the host side owns the receiver.
#[derive(Debug)]
pub struct ChannelTransport {
    kind: TransportKind,
    origin: Option<String>,
    notifications: bool,
    outbound: Sender<Envelope>,
}

impl ChannelTransport {
    pub fn host_relay(outbound: Sender<Envelope>) -> Self {
        Self {
            kind: TransportKind::HostRelay,
            origin: None,
            notifications: true,
            outbound,
        }
    }

    pub fn broadcast(origin: impl Into<String>, outbound: Sender<Envelope>) -> Self {
        Self {
            kind: TransportKind::Broadcast,
            origin: Some(origin.into()),
            notifications: false,
            outbound,
        }
    }

    pub fn with_notifications(mut self, enabled: bool) -> Self {
        self.notifications = enabled;
        self
    }
}

impl Transport for ChannelTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn admits(&self, origin: Option<&str>) -> bool {
        match &self.origin {
            None => true,
            Some(expected) => origin == Some(expected.as_str()),
        }
    }

    fn deliver(&mut self, envelope: &Envelope) -> Result<()> {
        self.outbound
            .send(envelope.clone())
            .map_err(|_| StageError::msg("transport receiver has been dropped"))
    }

    fn carries_notifications(&self) -> bool {
        self.notifications
    }
}

/// Index of an attached transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransportId(usize);

/// Owns the attached transports and routes traffic between them and the
/// stage.
#[derive(Default)]
pub struct Bridge {
    transports: Vec<Box<dyn Transport>>,
}

impl Bridge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&mut self, transport: Box<dyn Transport>) -> TransportId {
        self.transports.push(transport);
        TransportId(self.transports.len() - 1)
    }

    /// Admission check plus normalisation for a message that arrived on
    /// `from`.
    pub fn accept(&self, from: TransportId, origin: Option<&str>, raw: &Value) -> Option<Command> {
        let Some(transport) = self.transports.get(from.0) else {
            tracing::debug!(?from, "message on unknown transport");
            return None;
        };
        if !transport.admits(origin) {
            tracing::debug!(
                ?origin,
                kind = ?transport.kind(),
                "rejecting message from foreign origin"
            );
            return None;
        }
        Command::parse(raw)
    }

    /// Sends a reply on the transport the request arrived on.
    pub fn reply(&mut self, to: TransportId, notification: &Notification) {
        let envelope = notification.to_envelope();
        match self.transports.get_mut(to.0) {
            Some(transport) => {
                if let Err(err) = transport.deliver(&envelope) {
                    tracing::warn!(%err, kind = %envelope.kind, "reply could not be delivered");
                }
            }
            None => tracing::debug!(?to, "reply to unknown transport"),
        }
    }

    /// Publishes a notification on every transport that carries them.
    pub fn publish(&mut self, notification: &Notification) {
        let envelope = notification.to_envelope();
        for transport in self
            .transports
            .iter_mut()
            .filter(|transport| transport.carries_notifications())
        {
            if let Err(err) = transport.deliver(&envelope) {
                tracing::warn!(%err, kind = %envelope.kind, "notification could not be delivered");
            }
        }
    }
}

impl std::fmt::Debug for Bridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bridge")
            .field("transports", &self.transports.len())
            .finish()
    }
}
