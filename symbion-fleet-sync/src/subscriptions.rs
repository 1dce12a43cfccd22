/*!
SUBSCRIPTION MULTIPLEXER - One push registration per (source, family)

ROLE:
Any number of charts can watch the same key; the multiplexer keeps exactly
one bus listener for it, feeds the key's window buffer, and fans new samples
out to every consumer.

HOW IT WORKS:
- `ensure(key)` seeds the buffer with one historical fetch of the retention
  window. Concurrent callers share the in-flight fetch. Failures are not
  remembered: the next call retries. It never registers a listener on its
  own: a key with no consumer has no push registration.
- `subscribe(key, cb)` adds a consumer; the returned handle removes it on
  `unsubscribe()` or drop. The last consumer leaving removes the listener;
  buffered data stays until it ages out.
- pushes arriving while a seed is in flight are merged like any other
  sample, the buffer's dedup makes the overlap harmless
*/

use futures::future::{BoxFuture, FutureExt, Shared as SharedFuture};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::SeedConf;
use crate::events::{EventBus, ListenerHandle, SyncEvent, Topic};
use crate::history::{with_timeout, FetchError, HistoryQuery, HistorySource};
use crate::models::{Sample, SourceKind, SubscriptionKey};
use crate::state::Shared;
use crate::window::WindowBuffer;

pub type SampleCallback = Arc<dyn Fn(&[Sample]) + Send + Sync>;

type SeedFuture = SharedFuture<BoxFuture<'static, Result<usize, FetchError>>>;

#[derive(Default)]
struct KeyEntry {
    consumers: HashMap<u64, SampleCallback>,
    registration: Option<ListenerHandle>,
    seeded: bool,
}

struct MuxInner {
    bus: EventBus,
    history: Arc<dyn HistorySource>,
    clock: Arc<dyn Clock>,
    window: Shared<WindowBuffer>,
    seed: SeedConf,
    request_timeout: Option<Duration>,
    entries: Mutex<HashMap<SubscriptionKey, KeyEntry>>,
    in_flight: Mutex<HashMap<SubscriptionKey, SeedFuture>>,
    next_consumer: AtomicU64,
    seed_fetches: AtomicU64,
}

#[derive(Clone)]
pub struct SubscriptionMux {
    inner: Arc<MuxInner>,
}

impl SubscriptionMux {
    pub fn new(
        bus: EventBus,
        history: Arc<dyn HistorySource>,
        clock: Arc<dyn Clock>,
        window: Shared<WindowBuffer>,
        seed: SeedConf,
        request_timeout: Option<Duration>,
    ) -> Self {
        Self {
            inner: Arc::new(MuxInner {
                bus,
                history,
                clock,
                window,
                seed,
                request_timeout,
                entries: Mutex::new(HashMap::new()),
                in_flight: Mutex::new(HashMap::new()),
                next_consumer: AtomicU64::new(1),
                seed_fetches: AtomicU64::new(0),
            }),
        }
    }

    /// Makes sure the buffer of `key` holds recent history. Returns
    /// immediately when it already does.
    ///
    /// Pushes only flow to keys with at least one consumer: `ensure` alone
    /// seeds the buffer but never holds a bus listener.
    pub async fn ensure(&self, key: SubscriptionKey) -> Result<(), FetchError> {
        if !key.source.supports(key.family) {
            return Err(FetchError::Unsupported(format!("{} has no {} series", key.source, key.family)));
        }
        let seed = {
            // entries then in_flight, same order as `finish_seed`
            let mut entries = self.inner.entries.lock();
            let entry = entries.entry(key).or_default();
            if entry.seeded {
                return Ok(());
            }
            let mut in_flight = self.inner.in_flight.lock();
            in_flight
                .entry(key)
                .or_insert_with(|| self.seed_future(key))
                .clone()
        };
        seed.await.map(|_| ())
    }

    fn seed_future(&self, key: SubscriptionKey) -> SeedFuture {
        let history = self.inner.history.clone();
        let window = self.inner.window.clone();
        let timeout = self.inner.request_timeout;
        let weak = Arc::downgrade(&self.inner);

        let end = self.inner.clock.now();
        let start = end - window.lock().retention_for(key.family);
        let query = HistoryQuery {
            source: key.source,
            family: key.family,
            start,
            end,
            interval: None,
            limit: Some(self.inner.seed.max_points),
        };
        self.inner.seed_fetches.fetch_add(1, Ordering::Relaxed);
        debug!(%key, "seeding buffer");

        async move {
            let landed = with_timeout(timeout, history.fetch(&query))
                .await
                .map(|samples| (samples.len(), window.lock().append(key, samples)));

            let inner = weak.upgrade();
            let consumers = match &inner {
                Some(inner) => inner.finish_seed(key, landed.is_ok()),
                None => Vec::new(),
            };

            let (fetched, added) = landed.map_err(|e| {
                warn!(%key, "seed fetch failed: {e}");
                e
            })?;
            debug!(%key, fetched, added, "seed landed");

            if added > 0 && !consumers.is_empty() {
                let buffered = window.lock().read(&key);
                for consumer in consumers {
                    consumer(&buffered);
                }
            }
            Ok(added)
        }
        .boxed()
        .shared()
    }

    /// Adds a consumer of `key`. It is called with every sample newly added
    /// to the buffer until the handle is released.
    pub fn subscribe<F>(&self, key: SubscriptionKey, callback: F) -> SubscriptionHandle
    where
        F: Fn(&[Sample]) + Send + Sync + 'static,
    {
        let id = self.inner.next_consumer.fetch_add(1, Ordering::Relaxed);
        let mut entries = self.inner.entries.lock();
        let entry = entries.entry(key).or_default();
        if entry.registration.is_none() && entry.consumers.is_empty() {
            // seeded by a bare `ensure`: nothing listened since, reseed next time
            entry.seeded = false;
        }
        entry.consumers.insert(id, Arc::new(callback));
        self.inner.register_push(key, entry);
        debug!(%key, consumers = entry.consumers.len(), "consumer added");

        SubscriptionHandle {
            mux: Some(Arc::downgrade(&self.inner)),
            key,
            id,
        }
    }

    pub fn read(&self, key: &SubscriptionKey) -> Vec<Sample> {
        self.inner.window.lock().read(key)
    }

    pub fn refcount(&self, key: &SubscriptionKey) -> usize {
        self.inner.entries.lock().get(key).map_or(0, |e| e.consumers.len())
    }

    pub fn is_seeded(&self, key: &SubscriptionKey) -> bool {
        self.inner.entries.lock().get(key).is_some_and(|e| e.seeded)
    }

    /// Keys currently holding a push listener.
    pub fn active_registrations(&self) -> usize {
        self.inner
            .entries
            .lock()
            .values()
            .filter(|e| e.registration.is_some())
            .count()
    }

    /// Seed requests started since creation.
    pub fn seed_fetches(&self) -> u64 {
        self.inner.seed_fetches.load(Ordering::Relaxed)
    }

    pub fn window(&self) -> &Shared<WindowBuffer> {
        &self.inner.window
    }
}

impl MuxInner {
    fn register_push(self: &Arc<Self>, key: SubscriptionKey, entry: &mut KeyEntry) {
        if entry.registration.is_some() {
            return;
        }
        let topic = if key.family.is_probe() {
            Topic::ServiceMonitorResult
        } else {
            Topic::ServerMetrics
        };
        let weak: Weak<MuxInner> = Arc::downgrade(self);
        let registered = self.bus.on(topic, move |event| {
            let Some(sample) = sample_for(&key, event) else {
                return;
            };
            if let Some(inner) = weak.upgrade() {
                inner.on_push(key, sample);
            }
        });
        match registered {
            Ok(handle) => {
                debug!(%key, %topic, "push registration added");
                entry.registration = Some(handle);
            }
            // consumers still get the seeded buffer
            Err(e) => warn!(%key, "push registration failed: {e}"),
        }
    }

    fn on_push(&self, key: SubscriptionKey, sample: Sample) {
        let added = self.window.lock().append(key, [sample.clone()]);
        if added == 0 {
            return;
        }
        let consumers: Vec<SampleCallback> = match self.entries.lock().get(&key) {
            Some(entry) => entry.consumers.values().cloned().collect(),
            None => return,
        };
        let batch = [sample];
        for consumer in consumers {
            consumer(&batch);
        }
    }

    /// Retires the in-flight seed of `key` and, on success, marks the key
    /// seeded. Both happen under the entries lock, so an `ensure` sees either
    /// the in-flight future or the seeded flag.
    fn finish_seed(&self, key: SubscriptionKey, succeeded: bool) -> Vec<SampleCallback> {
        let mut entries = self.entries.lock();
        self.in_flight.lock().remove(&key);
        if !succeeded {
            return Vec::new();
        }
        // a key released mid-seed stays released and is seeded again next time
        let Some(entry) = entries.get_mut(&key) else {
            return Vec::new();
        };
        entry.seeded = true;
        entry.consumers.values().cloned().collect()
    }

    fn release(&self, key: SubscriptionKey, id: u64) {
        let registration = {
            let mut entries = self.entries.lock();
            let Some(entry) = entries.get_mut(&key) else {
                return;
            };
            entry.consumers.remove(&id);
            if !entry.consumers.is_empty() {
                return;
            }
            entries.remove(&key).and_then(|entry| entry.registration)
        };
        if let Some(handle) = registration {
            self.bus.off(handle);
            info!(%key, "last consumer left, push registration removed");
        }
    }
}

/// The sample carried by `event` if it belongs to `key`.
fn sample_for(key: &SubscriptionKey, event: &SyncEvent) -> Option<Sample> {
    match event {
        SyncEvent::ServerMetrics { server_id, point }
            if !key.family.is_probe() && key.source.kind == SourceKind::Server && key.source.id == *server_id =>
        {
            Some(Sample::Metric(point.clone()))
        }
        SyncEvent::ServiceMonitorResult(result) if key.family.is_probe() => {
            let owner = match key.source.kind {
                SourceKind::Server => result.server_id,
                SourceKind::Monitor => result.monitor_id,
            };
            (owner == key.source.id).then(|| Sample::Probe(result.clone()))
        }
        _ => None,
    }
}

/// A consumer's claim on a key. Released by `unsubscribe()` or on drop.
pub struct SubscriptionHandle {
    mux: Option<Weak<MuxInner>>,
    key: SubscriptionKey,
    id: u64,
}

impl SubscriptionHandle {
    pub fn key(&self) -> SubscriptionKey {
        self.key
    }

    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(inner) = self.mux.take().and_then(|weak| weak.upgrade()) {
            inner.release(self.key, self.id);
        }
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("key", &self.key)
            .field("id", &self.id)
            .finish()
    }
}
