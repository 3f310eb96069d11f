use std::{
    collections::{HashMap, HashSet},
    path::{Path, PathBuf},
    sync::Arc,
    thread::JoinHandle,
};

use crossbeam_channel::{Receiver, Sender};
use tiny_skia::Pixmap;

use crate::Result;

/// Turns an opaque image reference into something loadable.
pub trait AssetResolver: Send + Sync {
    fn resolve(&self, reference: &str) -> Option<PathBuf>;
}

/// Resolves references as paths relative to a root directory. Absolute
/// references are used as they are.
#[derive(Debug, Clone)]
pub struct DirResolver {
    root: PathBuf,
}

impl DirResolver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl AssetResolver for DirResolver {
    fn resolve(&self, reference: &str) -> Option<PathBuf> {
        if reference.is_empty() {
            return None;
        }
        let path = Path::new(reference);
        if path.is_absolute() {
            Some(path.to_path_buf())
        } else {
            Some(self.root.join(path))
        }
    }
}

#[derive(Debug)]
enum Entry {
    Pending,
    Ready(Pixmap),
    Failed { retry_at: f64 },
}

type Decoded = (String, std::result::Result<Pixmap, String>);

/// Memoised image decoding off the frame loop.
///
/// Decodes run on a worker thread; finished results are picked up by
/// [`ImageCache::poll`]. Until an image is ready, lookups miss and the caller
/// draws a placeholder. Failed decodes are retried after `retry_ms`.
pub struct ImageCache {
    entries: HashMap<String, Entry>,
    requests: Option<Sender<String>>,
    results: Receiver<Decoded>,
    retry_ms: f64,
    worker: Option<JoinHandle<()>>,
}

impl ImageCache {
    pub fn new(resolver: Arc<dyn AssetResolver>, retry_ms: f64) -> Result<Self> {
        let (request_tx, request_rx) = crossbeam_channel::unbounded::<String>();
        let (result_tx, result_rx) = crossbeam_channel::unbounded::<Decoded>();

        let worker = std::thread::Builder::new()
            .name("forest-stage-images".to_string())
            .spawn(move || run_decoder(resolver.as_ref(), request_rx, result_tx))?;

        Ok(Self {
            entries: HashMap::new(),
            requests: Some(request_tx),
            results: result_rx,
            retry_ms,
            worker: Some(worker),
        })
    }

    /// Returns the decoded image, scheduling a decode on a miss.
    pub fn get(&mut self, reference: &str, now: f64) -> Option<&Pixmap> {
        if reference.is_empty() {
            return None;
        }
        let request = match self.entries.get(reference) {
            None => true,
            Some(Entry::Failed { retry_at }) => now >= *retry_at,
            Some(Entry::Pending | Entry::Ready(_)) => false,
        };
        if request {
            self.request(reference);
        }
        match self.entries.get(reference) {
            Some(Entry::Ready(image)) => Some(image),
            _ => None,
        }
    }

    /// Collects finished decodes.
    pub fn poll(&mut self, now: f64) {
        while let Ok(decoded) = self.results.try_recv() {
            self.store(decoded, now);
        }
    }

    pub fn is_ready(&self, reference: &str) -> bool {
        matches!(self.entries.get(reference), Some(Entry::Ready(_)))
    }

    /// Drops every entry whose reference is not in `live`. Decodes still in
    /// flight for a dropped reference are discarded when they arrive.
    pub fn retain_referenced<'a>(&mut self, live: impl IntoIterator<Item = &'a str>) {
        let live: HashSet<&str> = live.into_iter().collect();
        let before = self.entries.len();
        self.entries.retain(|reference, _| live.contains(reference.as_str()));
        let evicted = before - self.entries.len();
        if evicted > 0 {
            tracing::debug!(evicted, kept = self.entries.len(), "evicted unused images");
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn request(&mut self, reference: &str) {
        let Some(requests) = &self.requests else {
            return;
        };
        if requests.send(reference.to_string()).is_ok() {
            self.entries.insert(reference.to_string(), Entry::Pending);
        } else {
            tracing::warn!(reference, "image worker is gone");
        }
    }

    fn store(&mut self, (reference, decoded): Decoded, now: f64) {
        let Some(slot) = self.entries.get_mut(&reference) else {
            tracing::debug!(%reference, "discarding decode for evicted image");
            return;
        };
        *slot = match decoded {
            Ok(image) => {
                tracing::debug!(
                    %reference,
                    width = image.width(),
                    height = image.height(),
                    "image ready"
                );
                Entry::Ready(image)
            }
            Err(message) => {
                tracing::warn!(%reference, %message, "image decode failed");
                Entry::Failed {
                    retry_at: now + self.retry_ms,
                }
            }
        };
    }

    #[cfg(test)]
    fn wait_for_decode(&mut self, now: f64) -> bool {
        match self.results.recv_timeout(std::time::Duration::from_secs(5)) {
            Ok(decoded) => {
                self.store(decoded, now);
                true
            }
            Err(_) => false,
        }
    }
}

impl Drop for ImageCache {
    fn drop(&mut self) {
        // Closing the request channel ends the worker loop.
        self.requests.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl std::fmt::Debug for ImageCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageCache")
            .field("entries", &self.entries.len())
            .field("retry_ms", &self.retry_ms)
            .finish()
    }
}

fn run_decoder(resolver: &dyn AssetResolver, requests: Receiver<String>, results: Sender<Decoded>) {
    while let Ok(reference) = requests.recv() {
        let decoded = match resolver.resolve(&reference) {
            Some(path) => Pixmap::load_png(&path)
                .map_err(|err| format!("{}: {err}", path.display())),
            None => Err("unresolvable reference".to_string()),
        };
        if results.send((reference, decoded)).is_err() {
            break;
        }
    }
}
