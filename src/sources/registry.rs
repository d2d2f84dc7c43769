/// Durable photo source registry
///
/// The registry decouples a source's transient runtime instance from its
/// permanent cache identity: sources and their photos are persisted through
/// the record store, revived across restarts via a typed factory map, and
/// started on the background scheduler. Availability changes flow through a
/// channel the registry drains, so nothing re-enters source code from inside
/// a notification.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::scheduler::{BackgroundScheduler, Job};
use crate::sources::records::{cached_photo, CachedPhotoRecord, PhotoSourceRecord};
use crate::sources::{CacheablePhotoSource, Photo, SourceEvent, SourceKind};
use crate::store::SqliteStore;

/// Builds a fresh, not-yet-woken instance of a source kind.
pub type SourceFactory = Box<dyn Fn() -> Arc<dyn CacheablePhotoSource> + Send + Sync>;

/// Raised to registry subscribers when a source's availability actually
/// changed from the last persisted value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryEvent {
    pub cache_id: i64,
    pub available: bool,
}

// One registered source: its persisted record plus the lazily constructed
// runtime instance. The instance lock guarantees a single live instance per
// persisted source.
struct CachedSource {
    record: Mutex<PhotoSourceRecord>,
    instance: Mutex<Option<Arc<dyn CacheablePhotoSource>>>,
    // Set when no factory exists for the persisted kind; the source stays
    // unavailable for the rest of this process.
    pinned_unavailable: AtomicBool,
}

/// Persistent catalogue of photo sources and the photos they contributed.
pub struct SourceRegistry {
    store: Arc<SqliteStore>,
    scheduler: Arc<BackgroundScheduler>,
    factories: Mutex<HashMap<SourceKind, SourceFactory>>,
    sources: Mutex<HashMap<i64, Arc<CachedSource>>>,
    events_tx: Sender<SourceEvent>,
    events_rx: Mutex<Receiver<SourceEvent>>,
    subscribers: Mutex<Vec<Sender<RegistryEvent>>>,
}

impl SourceRegistry {
    pub fn new(store: Arc<SqliteStore>, scheduler: Arc<BackgroundScheduler>) -> Result<Arc<Self>> {
        store.prepare::<PhotoSourceRecord>()?;
        store.prepare::<CachedPhotoRecord>()?;
        let (events_tx, events_rx) = mpsc::channel();
        Ok(Arc::new(SourceRegistry {
            store,
            scheduler,
            factories: Mutex::new(HashMap::new()),
            sources: Mutex::new(HashMap::new()),
            events_tx,
            events_rx: Mutex::new(events_rx),
            subscribers: Mutex::new(Vec::new()),
        }))
    }

    /// Install the factory used to revive persisted sources of `kind`.
    pub fn register_factory(&self, kind: SourceKind, factory: SourceFactory) {
        self.factories.lock().insert(kind, factory);
    }

    /// Subscribe to availability changes.
    pub fn subscribe(&self) -> Receiver<RegistryEvent> {
        let (tx, rx) = mpsc::channel();
        self.subscribers.lock().push(tx);
        rx
    }

    /// Register a brand-new source: persist its descriptor, hand it its
    /// permanent cache id, let it persist its own parameters, then start it
    /// in the background.
    pub fn register_source(
        self: &Arc<Self>,
        source: Arc<dyn CacheablePhotoSource>,
    ) -> Result<i64> {
        if source.cache_id() != 0 {
            return Err(Error::AlreadyRegistered(source.cache_id()));
        }

        let mut record = PhotoSourceRecord {
            cache_id: 0,
            source_kind: source.kind().as_str().to_string(),
            available: source.available(),
        };
        self.store.save(&mut record, false)?;

        source.set_cache_id(record.cache_id);
        source.connect_availability(self.events_tx.clone());
        source.persist()?;

        tracing::info!(
            kind = source.kind().as_str(),
            cache_id = record.cache_id,
            "registered photo source"
        );

        let cache_id = record.cache_id;
        let entry = Arc::new(CachedSource {
            record: Mutex::new(record),
            instance: Mutex::new(Some(source)),
            pinned_unavailable: AtomicBool::new(false),
        });
        self.sources.lock().insert(cache_id, entry);

        self.scheduler.submit(Box::new(StartSourceJob {
            registry: Arc::clone(self),
            cache_id,
        }));
        Ok(cache_id)
    }

    /// Persist a photo discovered by a registered source and tell the source
    /// the cache id it got, so the source can record its own locator mapping.
    pub fn register_photo(
        &self,
        source: &dyn CacheablePhotoSource,
        photo: &Arc<dyn Photo>,
    ) -> Result<i64> {
        let source_id = source.cache_id();
        if source_id == 0 {
            return Err(Error::UnregisteredSource);
        }

        let mut record = CachedPhotoRecord::from_photo(photo.as_ref(), source_id);
        self.store.save(&mut record, false)?;
        source.register_cached_photo(photo, record.cache_id)?;
        Ok(record.cache_id)
    }

    /// Revive every persisted source and start it. One broken source never
    /// prevents the others from starting.
    pub fn start_all(self: &Arc<Self>) -> Result<()> {
        let records: Vec<PhotoSourceRecord> = self.store.fetch_all()?;
        for record in records {
            let cache_id = record.cache_id;
            {
                let mut sources = self.sources.lock();
                if sources.contains_key(&cache_id) {
                    continue;
                }
                sources.insert(
                    cache_id,
                    Arc::new(CachedSource {
                        record: Mutex::new(record),
                        instance: Mutex::new(None),
                        pinned_unavailable: AtomicBool::new(false),
                    }),
                );
            }
            self.scheduler.submit(Box::new(StartSourceJob {
                registry: Arc::clone(self),
                cache_id,
            }));
        }
        Ok(())
    }

    /// The catalogue view: every persisted photo, without waking any source.
    pub fn photos(&self) -> Result<Vec<Arc<dyn Photo>>> {
        let records: Vec<CachedPhotoRecord> = self.store.fetch_all()?;
        Ok(records.into_iter().map(cached_photo).collect())
    }

    /// Look up one cached photo by its id.
    pub fn photo(&self, cache_id: i64) -> Result<Option<Arc<dyn Photo>>> {
        let record: Option<CachedPhotoRecord> = self
            .store
            .fetch_first_matching("cache_id = ?1", &[&cache_id])?;
        Ok(record.map(cached_photo))
    }

    /// Drain pending availability notifications: persist actual changes and
    /// re-raise them to subscribers. Pull-based by design; the embedding UI
    /// pumps this, and start jobs pump it once on completion.
    pub fn drain_events(&self) {
        loop {
            let event = self.events_rx.lock().try_recv();
            match event {
                Ok(SourceEvent { cache_id }) => self.reconcile_availability(cache_id),
                Err(_) => break,
            }
        }
    }

    // Recompute a source's availability and persist + re-raise only on an
    // actual change from the last persisted value.
    fn reconcile_availability(&self, cache_id: i64) {
        let Some(entry) = self.sources.lock().get(&cache_id).cloned() else {
            return;
        };

        let available = if entry.pinned_unavailable.load(Ordering::SeqCst) {
            false
        } else {
            match entry.instance.lock().as_ref() {
                Some(instance) => instance.available(),
                None => return,
            }
        };

        let mut record = entry.record.lock();
        if record.available == available {
            return;
        }
        record.available = available;
        if let Err(err) = self.store.save(&mut *record, false) {
            tracing::warn!(cache_id, %err, "failed to persist availability");
        }
        drop(record);

        tracing::debug!(cache_id, available, "source availability changed");
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| {
            tx.send(RegistryEvent {
                cache_id,
                available,
            })
            .is_ok()
        });
    }

    // Runs on a background worker. Builds the runtime instance if the source
    // was revived from a record, starts it, then reconciles the possibly
    // stale persisted availability flag.
    fn start_source(self: &Arc<Self>, cache_id: i64) -> Result<()> {
        let Some(entry) = self.sources.lock().get(&cache_id).cloned() else {
            return Ok(());
        };

        let instance = match self.ensure_instance(&entry) {
            Ok(instance) => instance,
            Err(err) => {
                // Missing implementation: pin this source unavailable and
                // let the rest of startup proceed.
                entry.pinned_unavailable.store(true, Ordering::SeqCst);
                tracing::warn!(cache_id, %err, "source cannot be revived");
                self.reconcile_availability(cache_id);
                return Err(err);
            }
        };

        instance.start(self)?;

        // The persisted flag can be stale from a previous run.
        self.reconcile_availability(cache_id);
        self.drain_events();
        Ok(())
    }

    fn ensure_instance(&self, entry: &CachedSource) -> Result<Arc<dyn CacheablePhotoSource>> {
        let mut slot = entry.instance.lock();
        if let Some(instance) = slot.as_ref() {
            return Ok(Arc::clone(instance));
        }

        let record = entry.record.lock().clone();
        let kind = SourceKind::parse(&record.source_kind)
            .ok_or_else(|| Error::SourceTypeUnavailable(record.source_kind.clone()))?;
        let factories = self.factories.lock();
        let factory = factories
            .get(&kind)
            .ok_or_else(|| Error::SourceTypeUnavailable(record.source_kind.clone()))?;

        let instance = factory();
        instance.set_cache_id(record.cache_id);
        instance.connect_availability(self.events_tx.clone());
        instance.wake_up()?;
        *slot = Some(Arc::clone(&instance));
        Ok(instance)
    }
}

impl std::fmt::Debug for SourceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceRegistry")
            .field("sources", &self.sources.lock().len())
            .finish()
    }
}

struct StartSourceJob {
    registry: Arc<SourceRegistry>,
    cache_id: i64,
}

impl Job for StartSourceJob {
    fn title(&self) -> String {
        format!("starting photo source {}", self.cache_id)
    }

    fn run(&mut self) -> Result<()> {
        self.registry.start_source(self.cache_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::PhotoMetadata;
    use crate::store::Record;
    use chrono::{DateTime, Utc};
    use std::sync::atomic::AtomicI64;
    use std::time::Duration;

    struct StubPhoto {
        uri: String,
        meta: PhotoMetadata,
    }

    impl Photo for StubPhoto {
        fn uri(&self) -> &str {
            &self.uri
        }
        fn source_id(&self) -> i64 {
            0
        }
        fn image_stamp(&self) -> DateTime<Utc> {
            Utc::now()
        }
        fn metadata(&self) -> &PhotoMetadata {
            &self.meta
        }
        fn read_image_bytes(&self) -> Result<Vec<u8>> {
            Err(Error::SourceUnavailable("stub".into()))
        }
    }

    #[derive(Default)]
    struct StubSource {
        cache_id: AtomicI64,
        available: AtomicBool,
        registered: Mutex<Vec<(String, i64)>>,
        started: Mutex<Option<Sender<()>>>,
        availability_tx: Mutex<Option<Sender<SourceEvent>>>,
    }

    impl StubSource {
        fn new(available: bool) -> Arc<Self> {
            let source = StubSource::default();
            source.available.store(available, Ordering::SeqCst);
            Arc::new(source)
        }

        fn notify_started(&self, tx: Sender<()>) {
            *self.started.lock() = Some(tx);
        }

        fn flip_availability(&self, available: bool) {
            self.available.store(available, Ordering::SeqCst);
            if let Some(tx) = self.availability_tx.lock().as_ref() {
                let _ = tx.send(SourceEvent {
                    cache_id: self.cache_id.load(Ordering::SeqCst),
                });
            }
        }
    }

    impl CacheablePhotoSource for StubSource {
        fn kind(&self) -> SourceKind {
            SourceKind::LocalFolder
        }
        fn cache_id(&self) -> i64 {
            self.cache_id.load(Ordering::SeqCst)
        }
        fn set_cache_id(&self, id: i64) {
            self.cache_id.store(id, Ordering::SeqCst);
        }
        fn display_name(&self) -> String {
            "stub".into()
        }
        fn available(&self) -> bool {
            self.available.load(Ordering::SeqCst)
        }
        fn connect_availability(&self, tx: Sender<SourceEvent>) {
            *self.availability_tx.lock() = Some(tx);
        }
        fn wake_up(&self) -> Result<()> {
            Ok(())
        }
        fn persist(&self) -> Result<()> {
            Ok(())
        }
        fn start(&self, _registry: &Arc<SourceRegistry>) -> Result<()> {
            if let Some(tx) = self.started.lock().as_ref() {
                let _ = tx.send(());
            }
            Ok(())
        }
        fn register_cached_photo(&self, photo: &Arc<dyn Photo>, cache_id: i64) -> Result<()> {
            self.registered
                .lock()
                .push((photo.uri().to_string(), cache_id));
            Ok(())
        }
        fn lookup_cached_photo(&self, _cache_id: i64) -> Result<Arc<dyn Photo>> {
            Err(Error::SourceUnavailable("stub".into()))
        }
        fn photos(&self) -> Result<Box<dyn Iterator<Item = Arc<dyn Photo>> + '_>> {
            Ok(Box::new(std::iter::empty()))
        }
    }

    fn registry() -> Arc<SourceRegistry> {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let scheduler = BackgroundScheduler::new(2);
        SourceRegistry::new(store, scheduler).unwrap()
    }

    #[test]
    fn registering_twice_fails() {
        let registry = registry();
        let source = StubSource::new(true);

        let (tx, rx) = mpsc::channel();
        source.notify_started(tx);

        let id = registry
            .register_source(source.clone() as Arc<dyn CacheablePhotoSource>)
            .unwrap();
        assert_ne!(id, 0);
        rx.recv_timeout(Duration::from_secs(5)).unwrap();

        match registry.register_source(source as Arc<dyn CacheablePhotoSource>) {
            Err(Error::AlreadyRegistered(seen)) => assert_eq!(seen, id),
            other => panic!("expected already-registered, got {:?}", other),
        }
    }

    #[test]
    fn register_photo_requires_a_registered_source() {
        let registry = registry();
        let source = StubSource::new(true) as Arc<dyn CacheablePhotoSource>;
        let photo = Arc::new(StubPhoto {
            uri: "file:///p.jpg".into(),
            meta: PhotoMetadata::default(),
        }) as Arc<dyn Photo>;

        assert_eq!(
            registry.register_photo(source.as_ref(), &photo).unwrap_err(),
            Error::UnregisteredSource
        );
    }

    #[test]
    fn register_photo_persists_and_calls_back() {
        let registry = registry();
        let source = StubSource::new(true);
        registry
            .register_source(source.clone() as Arc<dyn CacheablePhotoSource>)
            .unwrap();

        let photo = Arc::new(StubPhoto {
            uri: "file:///p.jpg".into(),
            meta: PhotoMetadata::default(),
        }) as Arc<dyn Photo>;
        let trait_source = source.clone() as Arc<dyn CacheablePhotoSource>;
        let photo_id = registry
            .register_photo(trait_source.as_ref(), &photo)
            .unwrap();
        assert_ne!(photo_id, 0);

        assert_eq!(
            source.registered.lock().as_slice(),
            &[("file:///p.jpg".to_string(), photo_id)]
        );
        let catalogue = registry.photos().unwrap();
        assert_eq!(catalogue.len(), 1);
        assert_eq!(catalogue[0].uri(), "file:///p.jpg");
        assert_eq!(catalogue[0].source_id(), source.cache_id());
    }

    #[test]
    fn availability_change_is_persisted_and_reraised_once() {
        let registry = registry();
        let events = registry.subscribe();
        let source = StubSource::new(true);
        let (tx, started) = mpsc::channel();
        source.notify_started(tx);

        let id = registry
            .register_source(source.clone() as Arc<dyn CacheablePhotoSource>)
            .unwrap();
        started.recv_timeout(Duration::from_secs(5)).unwrap();

        source.flip_availability(false);
        // Duplicate notifications for the same state collapse into one event.
        source.flip_availability(false);
        registry.drain_events();

        assert_eq!(
            events.recv_timeout(Duration::from_secs(1)).unwrap(),
            RegistryEvent {
                cache_id: id,
                available: false
            }
        );
        assert!(events.try_recv().is_err());

        let record: Option<PhotoSourceRecord> = registry
            .store
            .fetch_first_matching("cache_id = ?1", &[&id])
            .unwrap();
        assert!(!record.unwrap().available);
    }

    #[test]
    fn unknown_source_kind_degrades_to_unavailable() {
        let registry = registry();
        let mut record = PhotoSourceRecord {
            cache_id: 0,
            source_kind: "flickr".into(),
            available: true,
        };
        registry.store.save(&mut record, false).unwrap();

        registry.start_all().unwrap();
        // Drive the start synchronously for determinism.
        let err = registry.start_source(record.cache_id).unwrap_err();
        assert!(matches!(err, Error::SourceTypeUnavailable(_)));

        let stored: Option<PhotoSourceRecord> = registry
            .store
            .fetch_first_matching("cache_id = ?1", &[&record.id()])
            .unwrap();
        assert!(!stored.unwrap().available);
    }

    #[test]
    fn start_all_revives_persisted_sources_via_factory() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let scheduler = BackgroundScheduler::new(2);
        let registry = SourceRegistry::new(store.clone(), scheduler).unwrap();

        let mut record = PhotoSourceRecord {
            cache_id: 0,
            source_kind: SourceKind::LocalFolder.as_str().into(),
            available: false,
        };
        store.save(&mut record, false).unwrap();

        let (tx, started) = mpsc::channel();
        let revived = StubSource::new(true);
        revived.notify_started(tx);
        let template = Arc::clone(&revived);
        registry.register_factory(
            SourceKind::LocalFolder,
            Box::new(move || Arc::clone(&template) as Arc<dyn CacheablePhotoSource>),
        );

        registry.start_all().unwrap();
        started.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(revived.cache_id(), record.cache_id);
    }
}
