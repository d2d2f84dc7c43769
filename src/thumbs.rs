/// Bounded thumbnail cache for grid views
///
/// Keeps up to `capacity` decoded thumbnails keyed by photo locator, loads
/// them through per-photo [`PyramidLoader`]s one at a time with the most
/// recently requested photo first, and reconciles resolutions when the cell
/// size changes. A stale thumbnail stays on screen until its replacement has
/// been decoded.

use image::DynamicImage;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::pyramid::PyramidLoader;
use crate::scheduler::BackgroundScheduler;
use crate::sources::Photo;

pub const DEFAULT_CAPACITY: usize = 512;

// Stale when strictly smaller than the cell in both dimensions
// (under-resolved) or more than double it on the dominant axis
// (over-resolved).
fn fits_poorly_dims(have_w: u32, have_h: u32, width: u32, height: u32) -> bool {
    let under = have_w < width && have_h < height;
    let over = have_w.max(have_h) > 2 * width.max(height);
    under || over
}

/// Raised to subscribers when a photo's thumbnail was (re)decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThumbnailEvent {
    pub uri: String,
}

struct Entry {
    loader: Arc<PyramidLoader>,
    image: Option<Arc<DynamicImage>>,
    refs: usize,
}

struct CacheState {
    capacity: usize,
    target: (u32, u32),
    entries: HashMap<String, Entry>,
    // LRU order, most recently used first
    order: VecDeque<String>,
    // queued loads, most recently requested first
    pending: VecDeque<String>,
    in_flight: Option<String>,
    // photos with a best-size check queued or running
    checking: HashSet<String>,
    pending_checks: VecDeque<String>,
    check_in_flight: Option<String>,
}

/// The cache itself. One instance serves one grid view.
pub struct ThumbnailCache {
    scheduler: Arc<BackgroundScheduler>,
    cache_dir: PathBuf,
    state: Mutex<CacheState>,
    subscribers: Mutex<Vec<Sender<ThumbnailEvent>>>,
    disposals: AtomicUsize,
}

/// A lease on one thumbnail slot. While any handle for a photo is alive its
/// entry cannot be evicted; dropping the last handle releases the slot.
pub struct ThumbnailHandle {
    cache: Arc<ThumbnailCache>,
    uri: String,
}

impl ThumbnailHandle {
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Snapshot of the current thumbnail. `None` until the first load
    /// finishes; afterwards always the most recent successfully decoded
    /// image, even while a better one is on its way.
    pub fn image(&self) -> Option<Arc<DynamicImage>> {
        self.cache.image(&self.uri)
    }
}

impl Drop for ThumbnailHandle {
    fn drop(&mut self) {
        self.cache.release(&self.uri);
    }
}

impl ThumbnailCache {
    pub fn new(
        scheduler: Arc<BackgroundScheduler>,
        cache_dir: PathBuf,
        width: u32,
        height: u32,
    ) -> Arc<Self> {
        Self::with_capacity(scheduler, cache_dir, DEFAULT_CAPACITY, width, height)
    }

    pub fn with_capacity(
        scheduler: Arc<BackgroundScheduler>,
        cache_dir: PathBuf,
        capacity: usize,
        width: u32,
        height: u32,
    ) -> Arc<Self> {
        Arc::new(ThumbnailCache {
            scheduler,
            cache_dir,
            state: Mutex::new(CacheState {
                capacity,
                target: (width, height),
                entries: HashMap::new(),
                order: VecDeque::new(),
                pending: VecDeque::new(),
                in_flight: None,
                checking: HashSet::new(),
                pending_checks: VecDeque::new(),
                check_in_flight: None,
            }),
            subscribers: Mutex::new(Vec::new()),
            disposals: AtomicUsize::new(0),
        })
    }

    /// Subscribe to thumbnail updates.
    pub fn subscribe(&self) -> Receiver<ThumbnailEvent> {
        let (tx, rx) = mpsc::channel();
        self.subscribers.lock().push(tx);
        rx
    }

    /// Lease a thumbnail slot for a photo. Queues a load when nothing is
    /// cached yet; a repeated request just bumps the entry in the LRU order.
    pub fn request(self: &Arc<Self>, photo: &Arc<dyn Photo>) -> ThumbnailHandle {
        let uri = photo.uri().to_string();
        let mut guard = self.state.lock();
        let state = &mut *guard;

        state.order.retain(|u| u != &uri);
        state.order.push_front(uri.clone());

        match state.entries.get_mut(&uri) {
            Some(entry) => {
                entry.refs += 1;
                // A previously failed load gets another chance.
                if entry.image.is_none()
                    && state.in_flight.as_deref() != Some(uri.as_str())
                    && !state.pending.iter().any(|u| u == &uri)
                {
                    state.pending.push_front(uri.clone());
                }
            }
            None => {
                let loader = Arc::new(PyramidLoader::new(
                    Arc::clone(photo),
                    self.cache_dir.clone(),
                ));
                state.entries.insert(
                    uri.clone(),
                    Entry {
                        loader,
                        image: None,
                        refs: 1,
                    },
                );
                state.pending.push_front(uri.clone());
            }
        }

        self.pump(state);
        drop(guard);

        ThumbnailHandle {
            cache: Arc::clone(self),
            uri,
        }
    }

    /// Change the cell size. Cached thumbnails whose resolution no longer
    /// fits are verified against their pyramid and re-requested when a better
    /// tile exists; verifications are queued per photo and run one at a
    /// time, like loads.
    pub fn resize(self: &Arc<Self>, width: u32, height: u32) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.target == (width, height) {
            return;
        }
        state.target = (width, height);

        let mut stale = Vec::new();
        for (uri, entry) in &state.entries {
            let Some(image) = &entry.image else { continue };
            if fits_poorly_dims(image.width(), image.height(), width, height)
                && !state.checking.contains(uri)
            {
                stale.push(uri.clone());
            }
        }
        for uri in stale {
            state.checking.insert(uri.clone());
            state.pending_checks.push_back(uri);
        }
        self.pump_checks(state);
    }

    pub fn image(&self, uri: &str) -> Option<Arc<DynamicImage>> {
        self.state
            .lock()
            .entries
            .get(uri)
            .and_then(|entry| entry.image.clone())
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // Start the next queued load if nothing is running. One load at a time
    // keeps the disk and the decoder from thrashing while scrolling.
    fn pump(self: &Arc<Self>, state: &mut CacheState) {
        while state.in_flight.is_none() {
            let Some(uri) = state.pending.pop_front() else {
                return;
            };
            let Some(entry) = state.entries.get(&uri) else {
                continue;
            };

            let (width, height) = state.target;
            let preview = entry.loader.request_best_preview(&self.scheduler, width, height);
            state.in_flight = Some(uri.clone());

            let cache = Arc::clone(self);
            std::thread::spawn(move || {
                let result = preview.wait();
                cache.finish_load(&uri, result);
            });
        }
    }

    fn finish_load(self: &Arc<Self>, uri: &str, result: Result<Arc<DynamicImage>>) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.in_flight.as_deref() == Some(uri) {
            state.in_flight = None;
        }

        let mut updated = false;
        match result {
            Ok(image) => {
                if let Some(entry) = state.entries.get_mut(uri) {
                    entry.image = Some(image);
                    updated = true;
                }
            }
            Err(Error::Cancelled) => {}
            Err(err) => {
                tracing::warn!(uri, %err, "thumbnail load failed");
            }
        }

        if updated {
            self.evict(state);
        }
        self.pump(state);
        drop(guard);

        if updated {
            self.notify(uri);
        }
    }

    // Dispatch the next queued best-size check if none is running. Checks
    // are single-flight, so a resize over a full cache never fans out into
    // one blocked waiter thread per entry.
    fn pump_checks(self: &Arc<Self>, state: &mut CacheState) {
        while state.check_in_flight.is_none() {
            let Some(uri) = state.pending_checks.pop_front() else {
                return;
            };
            let (width, height) = state.target;
            let candidate = state.entries.get(&uri).and_then(|entry| {
                entry
                    .image
                    .as_ref()
                    .map(|image| (Arc::clone(&entry.loader), image.width(), image.height()))
            });
            let Some((loader, have_w, have_h)) = candidate else {
                state.checking.remove(&uri);
                continue;
            };
            // The target may have moved again while this check was queued.
            if !fits_poorly_dims(have_w, have_h, width, height) {
                state.checking.remove(&uri);
                continue;
            }

            let check = loader.is_best_preview(&self.scheduler, have_w, have_h, width, height);
            state.check_in_flight = Some(uri.clone());
            let cache = Arc::clone(self);
            std::thread::spawn(move || {
                // On a failed check the current thumbnail is kept.
                let best = check.wait().unwrap_or(true);
                cache.finish_check(&uri, best);
            });
        }
    }

    fn finish_check(self: &Arc<Self>, uri: &str, best: bool) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.checking.remove(uri);
        if state.check_in_flight.as_deref() == Some(uri) {
            state.check_in_flight = None;
        }

        let rerequest = !best
            && state.entries.contains_key(uri)
            && state.in_flight.as_deref() != Some(uri)
            && !state.pending.iter().any(|u| u == uri);
        if rerequest {
            state.pending.push_front(uri.to_string());
            self.pump(state);
        }
        self.pump_checks(state);
    }

    // Evict unleased entries from the cold end until the cache fits. Leased
    // entries are skipped; the cache may temporarily exceed capacity when
    // everything is leased.
    fn evict(&self, state: &mut CacheState) {
        while state.entries.len() > state.capacity {
            let victim = state
                .order
                .iter()
                .rev()
                .find(|uri| {
                    state
                        .entries
                        .get(uri.as_str())
                        .is_none_or(|entry| entry.refs == 0)
                })
                .cloned();
            let Some(victim) = victim else { break };

            state.order.retain(|u| u != &victim);
            state.pending.retain(|u| u != &victim);
            if state.entries.remove(&victim).is_some() {
                self.count_disposal();
            }
        }
    }

    fn release(self: &Arc<Self>, uri: &str) {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let discard = match state.entries.get_mut(uri) {
            Some(entry) => {
                entry.refs = entry.refs.saturating_sub(1);
                // A never-loaded entry nobody waits for is dead weight.
                entry.refs == 0
                    && entry.image.is_none()
                    && state.in_flight.as_deref() != Some(uri)
            }
            None => false,
        };

        if discard {
            state.entries.remove(uri);
            state.order.retain(|u| u != uri);
            state.pending.retain(|u| u != uri);
            drop(guard);
            self.count_disposal();
        }
    }

    fn count_disposal(&self) {
        let disposed = self.disposals.fetch_add(1, Ordering::Relaxed) + 1;
        if disposed % 100 == 0 {
            tracing::debug!(disposed, "thumbnail cache churn");
        }
    }

    fn notify(&self, uri: &str) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| {
            tx.send(ThumbnailEvent {
                uri: uri.to_string(),
            })
            .is_ok()
        });
    }
}

impl std::fmt::Debug for ThumbnailCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ThumbnailCache")
            .field("entries", &state.entries.len())
            .field("pending", &state.pending.len())
            .finish()
    }
}
