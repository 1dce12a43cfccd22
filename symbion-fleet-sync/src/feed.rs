/*!
SERIES FEED - One chart's data source, realtime or historical

ROLE:
Turns a `SeriesQuery` into a `SeriesState` (data, loading, error) and keeps
it current. Realtime reads the multiplexed window buffer; historical issues
one bounded request per query change and never touches the buffer.

HOW IT WORKS:
- `set_query` with an unchanged query does nothing
- leaving realtime, or moving to another key, releases the realtime
  subscription before anything else, so no orphan push listener is left;
  a realtime change on the same key (range only) keeps the subscription
- every change (and `close`) advances a generation; a response that comes
  back under an older generation is dropped
- with `preserve_data_on_fetch` the previous series stays visible while
  loading and after an error
*/

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::history::{with_timeout, FetchError, HistoryQuery, HistorySource};
use crate::models::{MetricFamily, SourceRef, SubscriptionKey};
use crate::series::{transform, ChartDataPoint};
use crate::state::Generation;
use crate::subscriptions::{SubscriptionHandle, SubscriptionMux};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViewMode {
    Realtime,
    Historical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TimeRange {
    #[serde(rename = "last_5m")]
    Last5m,
    #[serde(rename = "last_10m")]
    Last10m,
    #[serde(rename = "last_1h")]
    Last1h,
    #[serde(rename = "last_6h")]
    Last6h,
    #[serde(rename = "last_24h")]
    Last24h,
    #[serde(rename = "last_7d")]
    Last7d,
    #[serde(rename = "last_30d")]
    Last30d,
    #[serde(rename = "absolute")]
    Absolute {
        #[serde(with = "crate::models::rfc3339")]
        start: OffsetDateTime,
        #[serde(with = "crate::models::rfc3339")]
        end: OffsetDateTime,
    },
}

/// Resolved request window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedRange {
    pub start: OffsetDateTime,
    pub end: OffsetDateTime,
    /// Server-side aggregation step; `None` asks for raw points.
    pub interval: Option<Duration>,
}

impl TimeRange {
    fn span(&self) -> Option<time::Duration> {
        let span = match self {
            TimeRange::Last5m => time::Duration::minutes(5),
            TimeRange::Last10m => time::Duration::minutes(10),
            TimeRange::Last1h => time::Duration::hours(1),
            TimeRange::Last6h => time::Duration::hours(6),
            TimeRange::Last24h => time::Duration::hours(24),
            TimeRange::Last7d => time::Duration::days(7),
            TimeRange::Last30d => time::Duration::days(30),
            TimeRange::Absolute { .. } => return None,
        };
        Some(span)
    }

    pub fn resolve(&self, now: OffsetDateTime) -> ResolvedRange {
        let (start, end) = match (self, self.span()) {
            (TimeRange::Absolute { start, end }, _) => (*start, *end),
            (_, Some(span)) => (now - span, now),
            (_, None) => (now, now),
        };
        ResolvedRange {
            start,
            end,
            interval: interval_for(end - start),
        }
    }
}

/// Keeps long ranges to a few hundred points per series.
fn interval_for(span: time::Duration) -> Option<Duration> {
    let secs = span.whole_seconds();
    let step = match secs {
        s if s <= 10 * 60 => return None,
        s if s <= 3_600 => 60,
        s if s <= 6 * 3_600 => 5 * 60,
        s if s <= 24 * 3_600 => 15 * 60,
        s if s <= 7 * 86_400 => 3_600,
        _ => 6 * 3_600,
    };
    Some(Duration::from_secs(step))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SeriesQuery {
    pub source: SourceRef,
    pub family: MetricFamily,
    pub mode: ViewMode,
    pub range: TimeRange,
}

impl SeriesQuery {
    pub fn key(&self) -> SubscriptionKey {
        SubscriptionKey::new(self.source, self.family)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SeriesState {
    pub data: Vec<ChartDataPoint>,
    pub loading: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeedOptions {
    pub preserve_data_on_fetch: bool,
    pub request_timeout: Option<Duration>,
}

impl Default for FeedOptions {
    fn default() -> Self {
        Self {
            preserve_data_on_fetch: true,
            request_timeout: None,
        }
    }
}

struct FeedInner {
    mux: SubscriptionMux,
    history: Arc<dyn HistorySource>,
    clock: Arc<dyn Clock>,
    options: FeedOptions,
    state: watch::Sender<SeriesState>,
    query: Mutex<Option<SeriesQuery>>,
    subscription: Mutex<Option<SubscriptionHandle>>,
    generation: Generation,
    historical_fetches: AtomicU64,
}

#[derive(Clone)]
pub struct SeriesFeed {
    inner: Arc<FeedInner>,
}

impl SeriesFeed {
    pub fn new(
        mux: SubscriptionMux,
        history: Arc<dyn HistorySource>,
        clock: Arc<dyn Clock>,
        options: FeedOptions,
    ) -> Self {
        let (state, _) = watch::channel(SeriesState::default());
        Self {
            inner: Arc::new(FeedInner {
                mux,
                history,
                clock,
                options,
                state,
                query: Mutex::new(None),
                subscription: Mutex::new(None),
                generation: Generation::new(),
                historical_fetches: AtomicU64::new(0),
            }),
        }
    }

    /// Points the feed at `query` and loads it. Resolves once the seed (realtime)
    /// or the request (historical) is done, or superseded.
    pub async fn set_query(&self, query: SeriesQuery) {
        let key = query.key();
        let generation = {
            let mut slot = self.inner.subscription.lock();
            {
                let mut current = self.inner.query.lock();
                if *current == Some(query) {
                    return;
                }
                *current = Some(query);
            }
            let generation = self.inner.generation.advance();
            // staying realtime on the same key: the old handle is only dropped
            // once the new one holds the key, so the subscription survives
            let mut carried = None;
            if let Some(previous) = slot.take() {
                if query.mode == ViewMode::Realtime && previous.key() == key {
                    carried = Some(previous);
                } else {
                    debug!(key = %previous.key(), "releasing realtime subscription");
                    previous.unsubscribe();
                }
            }

            if !query.source.supports(query.family) {
                let message = FetchError::Unsupported(format!("{} has no {} series", query.source, query.family));
                self.inner.state.send_modify(|state| {
                    state.data.clear();
                    state.loading = false;
                    state.error = Some(message.to_string());
                });
                return;
            }

            self.inner.begin_loading();
            if query.mode == ViewMode::Realtime {
                let weak: Weak<FeedInner> = Arc::downgrade(&self.inner);
                *slot = Some(self.inner.mux.subscribe(key, move |_| {
                    if let Some(inner) = weak.upgrade() {
                        if inner.generation.is_current(generation) {
                            inner.refresh_from_buffer(key, false);
                        }
                    }
                }));
            }
            drop(carried);
            generation
        };

        match query.mode {
            ViewMode::Realtime => {
                let seeded = self.inner.mux.ensure(key).await;
                if !self.inner.generation.is_current(generation) {
                    return;
                }
                match seeded {
                    Ok(()) => self.inner.refresh_from_buffer(key, true),
                    Err(e) => self.inner.fail(&e),
                }
            }
            ViewMode::Historical => self.inner.fetch_historical(query, generation).await,
        }
    }

    pub fn query(&self) -> Option<SeriesQuery> {
        *self.inner.query.lock()
    }

    pub fn state(&self) -> SeriesState {
        self.inner.state.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<SeriesState> {
        self.inner.state.subscribe()
    }

    /// Historical requests issued by this feed since creation.
    pub fn historical_fetches(&self) -> u64 {
        self.inner.historical_fetches.load(Ordering::Relaxed)
    }

    /// Releases the subscription and ignores any response still in flight.
    pub fn close(&self) {
        let mut slot = self.inner.subscription.lock();
        self.inner.generation.advance();
        *self.inner.query.lock() = None;
        if let Some(handle) = slot.take() {
            handle.unsubscribe();
        }
        self.inner.state.send_modify(|state| state.loading = false);
    }
}

impl FeedInner {
    fn begin_loading(&self) {
        let preserve = self.options.preserve_data_on_fetch;
        self.state.send_modify(|state| {
            state.loading = true;
            state.error = None;
            if !preserve {
                state.data.clear();
            }
        });
    }

    fn refresh_from_buffer(&self, key: SubscriptionKey, done_loading: bool) {
        let data = transform(&self.mux.read(&key), &key);
        self.state.send_modify(|state| {
            state.data = data;
            if done_loading {
                state.loading = false;
                state.error = None;
            }
        });
    }

    fn fail(&self, error: &FetchError) {
        let preserve = self.options.preserve_data_on_fetch;
        self.state.send_modify(|state| {
            state.loading = false;
            state.error = Some(error.to_string());
            if !preserve {
                state.data.clear();
            }
        });
    }

    async fn fetch_historical(&self, query: SeriesQuery, generation: u64) {
        let range = query.range.resolve(self.clock.now());
        let request = HistoryQuery {
            source: query.source,
            family: query.family,
            start: range.start,
            end: range.end,
            interval: range.interval,
            limit: None,
        };
        self.historical_fetches.fetch_add(1, Ordering::Relaxed);

        let result = with_timeout(self.options.request_timeout, self.history.fetch(&request)).await;
        if !self.generation.is_current(generation) {
            debug!(key = %query.key(), "dropping stale historical response");
            return;
        }
        match result {
            Ok(samples) => {
                let data = transform(&samples, &query.key());
                self.state.send_modify(|state| {
                    state.data = data;
                    state.loading = false;
                    state.error = None;
                });
            }
            Err(e) => {
                warn!(key = %query.key(), "historical fetch failed: {e}");
                self.fail(&e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{from_epoch_ms, ManualClock};
    use crate::config::{RetentionConf, SeedConf};
    use crate::events::{EventBus, SyncEvent, Topic};
    use crate::models::{MetricPoint, Sample};
    use crate::state::new_state;
    use crate::window::WindowBuffer;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use time::macros::datetime;
    use tokio::sync::oneshot;

    const NOW: i64 = 1_700_000_000_000;

    type Reply = oneshot::Receiver<Result<Vec<Sample>, FetchError>>;

    /// Answers every fetch with the next scripted reply and records how many
    /// push listeners were live when the request went out.
    struct ScriptedHistory {
        bus: EventBus,
        replies: Mutex<VecDeque<Reply>>,
        listeners_at_fetch: Mutex<Vec<usize>>,
    }

    #[async_trait]
    impl HistorySource for ScriptedHistory {
        async fn fetch(&self, _: &HistoryQuery) -> Result<Vec<Sample>, FetchError> {
            self.listeners_at_fetch
                .lock()
                .push(self.bus.listener_count(Topic::ServerMetrics));
            let reply = self.replies.lock().pop_front();
            match reply {
                Some(reply) => reply.await.unwrap_or(Err(FetchError::Http("dropped".into()))),
                None => Ok(Vec::new()),
            }
        }
    }

    fn cpu(at_ms: i64, value: f64) -> Sample {
        let mut point = MetricPoint::at(from_epoch_ms(at_ms));
        point.cpu_percent = Some(value);
        Sample::Metric(point)
    }

    fn setup(preserve: bool) -> (EventBus, Arc<ScriptedHistory>, SeriesFeed, SubscriptionMux) {
        let bus = EventBus::new();
        let clock = Arc::new(ManualClock::at_ms(NOW));
        let history = Arc::new(ScriptedHistory {
            bus: bus.clone(),
            replies: Mutex::new(VecDeque::new()),
            listeners_at_fetch: Mutex::new(Vec::new()),
        });
        let window = new_state(WindowBuffer::new(clock.clone(), RetentionConf::default()));
        let mux = SubscriptionMux::new(bus.clone(), history.clone(), clock.clone(), window, SeedConf::default(), None);
        let feed = SeriesFeed::new(
            mux.clone(),
            history.clone(),
            clock,
            FeedOptions {
                preserve_data_on_fetch: preserve,
                request_timeout: None,
            },
        );
        (bus, history, feed, mux)
    }

    fn script(history: &ScriptedHistory) -> oneshot::Sender<Result<Vec<Sample>, FetchError>> {
        let (tx, rx) = oneshot::channel();
        history.replies.lock().push_back(rx);
        tx
    }

    fn query(mode: ViewMode, range: TimeRange) -> SeriesQuery {
        SeriesQuery {
            source: SourceRef::server(1),
            family: MetricFamily::Cpu,
            mode,
            range,
        }
    }

    #[test]
    fn test_presets_resolve_against_now() {
        let now = datetime!(2024-05-01 12:00:00 UTC);
        let last_hour = TimeRange::Last1h.resolve(now);
        assert_eq!(last_hour.start, datetime!(2024-05-01 11:00:00 UTC));
        assert_eq!(last_hour.end, now);
        assert_eq!(last_hour.interval, Some(Duration::from_secs(60)));
        assert_eq!(TimeRange::Last5m.resolve(now).interval, None);
        assert_eq!(TimeRange::Last30d.resolve(now).interval, Some(Duration::from_secs(6 * 3_600)));

        let absolute = TimeRange::Absolute {
            start: datetime!(2024-04-01 00:00:00 UTC),
            end: datetime!(2024-04-02 00:00:00 UTC),
        };
        assert_eq!(absolute.resolve(now).start, datetime!(2024-04-01 00:00:00 UTC));
        assert_eq!(absolute.resolve(now).interval, Some(Duration::from_secs(15 * 60)));
    }

    #[test]
    fn test_time_range_wire_names() {
        assert_eq!(serde_json::to_string(&TimeRange::Last24h).unwrap(), "\"last_24h\"");
        let parsed: TimeRange = serde_json::from_str("\"last_7d\"").unwrap();
        assert_eq!(parsed, TimeRange::Last7d);
    }

    #[tokio::test]
    async fn test_realtime_feed_follows_pushes() {
        let (bus, _history, feed, _mux) = setup(true);
        feed.set_query(query(ViewMode::Realtime, TimeRange::Last10m)).await;
        assert!(!feed.state().loading);

        let mut point = MetricPoint::at(from_epoch_ms(NOW));
        point.cpu_percent = Some(42.0);
        bus.emit(&SyncEvent::ServerMetrics { server_id: 1, point });

        let state = feed.state();
        assert_eq!(state.data.len(), 1);
        assert_eq!(state.data[0].get("cpu"), Some(42.0));
    }

    #[tokio::test]
    async fn test_switch_to_historical_unsubscribes_first() {
        let (bus, history, feed, mux) = setup(true);
        feed.set_query(query(ViewMode::Realtime, TimeRange::Last10m)).await;
        assert_eq!(mux.refcount(&SubscriptionKey::server(1, MetricFamily::Cpu)), 1);

        feed.set_query(query(ViewMode::Historical, TimeRange::Last1h)).await;
        assert_eq!(mux.active_registrations(), 0);
        assert_eq!(bus.listener_count(Topic::ServerMetrics), 0);
        // seed saw the listener, the historical request did not
        assert_eq!(*history.listeners_at_fetch.lock(), vec![1, 0]);
        assert_eq!(feed.historical_fetches(), 1);
    }

    #[tokio::test]
    async fn test_realtime_range_change_keeps_the_subscription() {
        let (bus, history, feed, mux) = setup(true);
        let key = SubscriptionKey::server(1, MetricFamily::Cpu);
        feed.set_query(query(ViewMode::Realtime, TimeRange::Last5m)).await;
        assert_eq!(mux.seed_fetches(), 1);
        assert_eq!(mux.active_registrations(), 1);

        feed.set_query(query(ViewMode::Realtime, TimeRange::Last10m)).await;
        assert_eq!(mux.seed_fetches(), 1);
        assert_eq!(mux.active_registrations(), 1);
        assert_eq!(mux.refcount(&key), 1);
        assert!(mux.is_seeded(&key));
        assert_eq!(history.listeners_at_fetch.lock().len(), 1);
        assert!(!feed.state().loading);

        // pushes still reach the feed under the new query
        let mut point = MetricPoint::at(from_epoch_ms(NOW));
        point.cpu_percent = Some(7.0);
        bus.emit(&SyncEvent::ServerMetrics { server_id: 1, point });
        assert_eq!(feed.state().data.last().and_then(|p| p.get("cpu")), Some(7.0));

        // another key does release the old one
        feed.set_query(SeriesQuery {
            source: SourceRef::server(2),
            ..query(ViewMode::Realtime, TimeRange::Last10m)
        })
        .await;
        assert_eq!(mux.refcount(&key), 0);
        assert_eq!(mux.active_registrations(), 1);
        assert_eq!(mux.seed_fetches(), 2);
    }

    #[tokio::test]
    async fn test_same_query_is_a_noop() {
        let (_bus, _history, feed, _mux) = setup(true);
        let q = query(ViewMode::Historical, TimeRange::Last1h);
        feed.set_query(q).await;
        feed.set_query(q).await;
        assert_eq!(feed.historical_fetches(), 1);
    }

    #[tokio::test]
    async fn test_stale_response_is_discarded() {
        let (_bus, history, feed, _mux) = setup(true);
        let slow = script(&history);
        let fast = script(&history);

        let first = tokio::spawn({
            let feed = feed.clone();
            async move { feed.set_query(query(ViewMode::Historical, TimeRange::Last1h)).await }
        });
        tokio::task::yield_now().await;
        let second = tokio::spawn({
            let feed = feed.clone();
            async move { feed.set_query(query(ViewMode::Historical, TimeRange::Last6h)).await }
        });
        tokio::task::yield_now().await;

        fast.send(Ok(vec![cpu(NOW, 2.0)])).unwrap();
        second.await.unwrap();
        slow.send(Ok(vec![cpu(NOW - 1_000, 1.0), cpu(NOW, 1.0)])).unwrap();
        first.await.unwrap();

        let state = feed.state();
        assert_eq!(state.data.len(), 1);
        assert_eq!(state.data[0].get("cpu"), Some(2.0));
    }

    #[tokio::test]
    async fn test_error_keeps_previous_series_when_preserving() {
        let (_bus, history, feed, _mux) = setup(true);
        script(&history).send(Ok(vec![cpu(NOW, 3.0)])).unwrap();
        feed.set_query(query(ViewMode::Historical, TimeRange::Last1h)).await;

        let failing = script(&history);
        let pending = tokio::spawn({
            let feed = feed.clone();
            async move { feed.set_query(query(ViewMode::Historical, TimeRange::Last24h)).await }
        });
        tokio::task::yield_now().await;
        let loading = feed.state();
        assert!(loading.loading);
        assert_eq!(loading.data.len(), 1);

        failing.send(Err(FetchError::Http("502".into()))).unwrap();
        pending.await.unwrap();
        let state = feed.state();
        assert!(!state.loading);
        assert_eq!(state.data.len(), 1);
        assert_eq!(state.error.as_deref(), Some("HTTP error: 502"));
    }

    #[tokio::test]
    async fn test_without_preserve_data_clears_on_fetch() {
        let (_bus, history, feed, _mux) = setup(false);
        script(&history).send(Ok(vec![cpu(NOW, 3.0)])).unwrap();
        feed.set_query(query(ViewMode::Historical, TimeRange::Last1h)).await;
        assert_eq!(feed.state().data.len(), 1);

        script(&history).send(Err(FetchError::Http("502".into()))).unwrap();
        feed.set_query(query(ViewMode::Historical, TimeRange::Last6h)).await;
        assert!(feed.state().data.is_empty());
    }

    #[tokio::test]
    async fn test_close_drops_late_response() {
        let (_bus, history, feed, _mux) = setup(true);
        let late = script(&history);
        let pending = tokio::spawn({
            let feed = feed.clone();
            async move { feed.set_query(query(ViewMode::Historical, TimeRange::Last1h)).await }
        });
        tokio::task::yield_now().await;

        feed.close();
        late.send(Ok(vec![cpu(NOW, 9.0)])).unwrap();
        pending.await.unwrap();
        assert!(feed.state().data.is_empty());
        assert!(!feed.state().loading);
    }
}
