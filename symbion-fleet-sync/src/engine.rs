/*!
FLEET SYNC ENGINE - Wiring of every component behind one handle

ROLE:
Owns the single connection, its event bus, the fleet store, the
multiplexer and its window buffers. Consumers (charts, lists) only go
through this facade.

USAGE:
  let engine = FleetSync::from_config(config);
  engine.init(auth_rx).await;
  let feed = engine.get_series(query).await;
*/

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use crate::clock::{Clock, SystemClock};
use crate::config::SyncConfig;
use crate::connection::ConnectionManager;
use crate::events::EventBus;
use crate::feed::{FeedOptions, SeriesFeed, SeriesQuery};
use crate::fleet::FleetStore;
use crate::health::{EngineHealth, HealthTracker};
use crate::history::{FetchError, HistorySource, HttpHistoryClient};
use crate::models::{AuthState, MetricFamily, MonitorId, Sample, ServerId, SubscriptionKey};
use crate::state::new_state;
use crate::subscriptions::{SubscriptionHandle, SubscriptionMux};
use crate::transport::{Transport, WsTransport};
use crate::window::WindowBuffer;

pub struct FleetSync {
    config: SyncConfig,
    connection: ConnectionManager,
    fleet: FleetStore,
    mux: SubscriptionMux,
    history: Arc<dyn HistorySource>,
    http_history: Option<Arc<HttpHistoryClient>>,
    clock: Arc<dyn Clock>,
    health: HealthTracker,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl FleetSync {
    pub fn new(
        config: SyncConfig,
        transport: Arc<dyn Transport>,
        history: Arc<dyn HistorySource>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let bus = EventBus::new();
        let connection = ConnectionManager::new(config.reconnect.clone(), transport, bus.clone());
        let fleet = FleetStore::new(connection.clone());
        let window = new_state(WindowBuffer::new(clock.clone(), config.retention.clone()));
        let mux = SubscriptionMux::new(
            bus,
            history.clone(),
            clock.clone(),
            window,
            config.seed.clone(),
            config.history.request_timeout(),
        );
        let health = HealthTracker::new(connection.clone(), fleet.clone(), mux.clone());

        Self {
            config,
            connection,
            fleet,
            mux,
            history,
            http_history: None,
            clock,
            health,
            tasks: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        }
    }

    /// Production wiring: WebSocket push, HTTP history, system clock.
    pub fn from_config(config: SyncConfig) -> Self {
        let transport = Arc::new(WsTransport::new(
            config.server.endpoint.clone(),
            config.server.public_endpoint.clone(),
        ));
        let http = Arc::new(HttpHistoryClient::new(config.server.history_base_url.clone()));
        let mut engine = Self::new(config, transport, http.clone(), Arc::new(SystemClock));
        engine.http_history = Some(http);
        engine
    }

    /// Connects and starts following `auth`. Idempotent.
    pub async fn init(&self, auth: watch::Receiver<AuthState>) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(http) = &self.http_history {
            let http = http.clone();
            let mut auth = auth.clone();
            http.set_credential(auth.borrow_and_update().credential());
            let follower = tokio::spawn(async move {
                while auth.changed().await.is_ok() {
                    let credential = auth.borrow_and_update().credential();
                    http.set_credential(credential);
                }
            });
            self.tasks.lock().push(follower);
        }

        self.fleet.init(auth).await;

        let every = Duration::from_secs(self.config.health.report_interval_secs.max(1));
        let reporter = self.health.spawn_reporter(every);
        self.tasks.lock().push(reporter);
        info!(endpoint = %self.config.server.endpoint, "fleet sync started");
    }

    pub async fn ensure_initial_metrics(&self, server_id: ServerId, family: MetricFamily) -> Result<(), FetchError> {
        self.mux.ensure(SubscriptionKey::server(server_id, family)).await
    }

    pub fn subscribe_to_metrics<F>(&self, server_id: ServerId, family: MetricFamily, callback: F) -> SubscriptionHandle
    where
        F: Fn(&[Sample]) + Send + Sync + 'static,
    {
        self.mux.subscribe(SubscriptionKey::server(server_id, family), callback)
    }

    pub async fn ensure_initial_monitor_results(&self, monitor_id: MonitorId) -> Result<(), FetchError> {
        self.mux.ensure(SubscriptionKey::monitor(monitor_id)).await
    }

    pub fn subscribe_to_monitor_results<F>(&self, monitor_id: MonitorId, callback: F) -> SubscriptionHandle
    where
        F: Fn(&[Sample]) + Send + Sync + 'static,
    {
        self.mux.subscribe(SubscriptionKey::monitor(monitor_id), callback)
    }

    /// A fresh feed, not pointed at anything yet.
    pub fn series_feed(&self) -> SeriesFeed {
        SeriesFeed::new(
            self.mux.clone(),
            self.history.clone(),
            self.clock.clone(),
            FeedOptions {
                preserve_data_on_fetch: self.config.series.preserve_data_on_fetch,
                request_timeout: self.config.history.request_timeout(),
            },
        )
    }

    /// A feed loaded with `query`.
    pub async fn get_series(&self, query: SeriesQuery) -> SeriesFeed {
        let feed = self.series_feed();
        feed.set_query(query).await;
        feed
    }

    pub fn fleet(&self) -> &FleetStore {
        &self.fleet
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    pub fn bus(&self) -> &EventBus {
        self.connection.bus()
    }

    pub fn subscriptions(&self) -> &SubscriptionMux {
        &self.mux
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn health(&self) -> EngineHealth {
        self.health.get_health()
    }

    pub async fn shutdown(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.fleet.shutdown().await;
        self.started.store(false, Ordering::SeqCst);
        info!("fleet sync stopped");
    }
}
