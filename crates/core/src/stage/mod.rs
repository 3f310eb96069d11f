//! The projection stage: scene state, audio and rendering behind one
//! command/tick interface.
//!
//! Everything runs on the caller's thread. Commands are applied
//! synchronously by [`Stage::receive`]; [`Stage::tick`] drains playback
//! events, renders a frame and publishes whatever notifications piled up.

use std::sync::Arc;

use crossbeam_channel::Receiver;
use serde_json::Value;

use crate::{
    assets::{AssetResolver, ImageCache},
    audio::{AudioBackend, AudioEngine, HandleRole, ManualPlayer, PlaybackEvent},
    bridge::{Bridge, Command, Notification, Transport, TransportId},
    config::AppConfig,
    render::Renderer,
    store::SceneStore,
    timeline::{FrameContext, FrameReport, Scheduler},
    Result,
};

pub struct Stage<B: AudioBackend> {
    config: AppConfig,
    store: SceneStore,
    bridge: Bridge,
    engine: AudioEngine,
    manual: ManualPlayer,
    backend: B,
    events: Receiver<PlaybackEvent>,
    renderer: Renderer,
    images: ImageCache,
    scheduler: Scheduler,
    outbox: Vec<Notification>,
}

impl<B: AudioBackend> Stage<B> {
    /// `events` must receive what `backend` reports.
    pub fn new(
        config: AppConfig,
        backend: B,
        events: Receiver<PlaybackEvent>,
        resolver: Arc<dyn AssetResolver>,
    ) -> Result<Self> {
        let mut renderer = Renderer::new(&config.stage)?;
        renderer.begin_frame();
        let images = ImageCache::new(resolver, config.assets.retry_ms)?;

        Ok(Self {
            store: SceneStore::new(),
            bridge: Bridge::new(),
            engine: AudioEngine::new(config.audio.clone()),
            manual: ManualPlayer::new(&config.audio),
            backend,
            events,
            renderer,
            images,
            scheduler: Scheduler::new(),
            outbox: Vec::new(),
            config,
        })
    }

    pub fn attach(&mut self, transport: Box<dyn Transport>) -> TransportId {
        let kind = transport.kind();
        let id = self.bridge.attach(transport);
        tracing::info!(?kind, ?id, "transport attached");
        id
    }

    /// Handles a raw message that arrived on `from`. Returns whether it was
    /// accepted as a command.
    pub fn receive(
        &mut self,
        from: TransportId,
        origin: Option<&str>,
        raw: &Value,
        now: f64,
    ) -> bool {
        match self.bridge.accept(from, origin, raw) {
            Some(command) => {
                self.handle(command, from, now);
                true
            }
            None => false,
        }
    }

    /// Applies one normalised command.
    pub fn handle(&mut self, command: Command, reply_to: TransportId, now: f64) {
        match command {
            Command::AddElement(element) => {
                tracing::info!(id = %element.id, name = %element.name, "element added");
                self.engine.sync(&mut self.backend, &element, now);
                self.engine.arm_motion_start(&mut self.backend, &element, now);
                if self.store.insert(element).is_some() {
                    tracing::debug!("element replaced in place");
                    self.evict_unused_images();
                }
            }
            Command::UpdateElement { id, fields } => match self.store.merge(id.as_str(), &fields) {
                Ok(Some(element)) => {
                    if fields.contains_key("audio") {
                        self.engine.sync(&mut self.backend, element, now);
                    }
                    if fields.contains_key("image") {
                        self.evict_unused_images();
                    }
                }
                Ok(None) => tracing::debug!(%id, "update for unknown element ignored"),
                Err(err) => tracing::debug!(%id, %err, "dropping malformed update"),
            },
            Command::RemoveElement(id) => {
                if self.store.remove(id.as_str()).is_some() {
                    tracing::info!(%id, "element removed");
                }
                self.engine.forget(id.as_str());
                self.evict_unused_images();
            }
            Command::UpdateForestConfig(fields) => {
                if let Err(err) = self.store.merge_config(&fields) {
                    tracing::debug!(%err, "dropping malformed scene config update");
                }
            }
            Command::PlayAudioOnce(id) => {
                let Some(element) = self.store.get(id.as_str()) else {
                    tracing::debug!(%id, "one-shot for unknown element ignored");
                    return;
                };
                if self.manual.play_once(&mut self.backend, element, now) {
                    self.engine.set_override(&id, true);
                }
            }
            Command::RequestBackgroundSnapshot => match self.renderer.snapshot_data_url() {
                Ok(data_url) => {
                    self.bridge
                        .reply(reply_to, &Notification::BackgroundSnapshot { data_url });
                }
                Err(err) => tracing::warn!(%err, "snapshot failed"),
            },
        }
    }

    /// Runs one frame at `now` and publishes the resulting notifications.
    pub fn tick(&mut self, now: f64) -> FrameReport {
        self.backend.pump(now);
        self.drain_playback_events(now);
        for id in self.manual.poll(now, &mut self.outbox) {
            self.engine.set_override(&id, false);
        }
        self.engine.poll(now);
        self.images.poll(now);

        let report = self.scheduler.tick(
            now,
            FrameContext {
                store: &mut self.store,
                engine: &mut self.engine,
                backend: &mut self.backend,
                renderer: &mut self.renderer,
                images: &mut self.images,
                outbox: &mut self.outbox,
            },
        );
        for notification in self.outbox.drain(..) {
            self.bridge.publish(&notification);
        }
        report
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn store(&self) -> &SceneStore {
        &self.store
    }

    pub fn engine(&self) -> &AudioEngine {
        &self.engine
    }

    pub fn manual(&self) -> &ManualPlayer {
        &self.manual
    }

    pub fn renderer(&self) -> &Renderer {
        &self.renderer
    }

    pub fn images(&self) -> &ImageCache {
        &self.images
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn frames(&self) -> u64 {
        self.scheduler.frames()
    }

    fn evict_unused_images(&mut self) {
        let live = self.store.iter().map(|element| element.image.as_str());
        self.images.retain_referenced(live);
    }

    fn drain_playback_events(&mut self, now: f64) {
        while let Ok(event) = self.events.try_recv() {
            match event.key.role {
                HandleRole::Engine => self.engine.on_event(&event, now, &mut self.outbox),
                HandleRole::Manual => {
                    if let Some(id) = self.manual.on_event(&event, &mut self.outbox) {
                        self.engine.set_override(&id, false);
                    }
                }
            }
        }
    }
}

impl<B: AudioBackend> std::fmt::Debug for Stage<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stage")
            .field("elements", &self.store.len())
            .field("bridge", &self.bridge)
            .field("engine", &self.engine)
            .field("manual", &self.manual)
            .field("frames", &self.scheduler.frames())
            .finish()
    }
}
