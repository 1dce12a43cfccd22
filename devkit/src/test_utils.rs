/*!
Test Harness pour le moteur fleet-sync

Monte un `FleetSync` complet sur des doubles :
- transport mock (connexions scriptées, frames injectées)
- source historique mock
- horloge manuelle
- état d'authentification pilotable (login / logout)
*/

use crate::mock_history::MockHistory;
use crate::mock_transport::MockTransport;
use anyhow::Result;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use symbion_fleet_sync::clock::ManualClock;
use symbion_fleet_sync::config::{ReconnectConf, SyncConfig};
use symbion_fleet_sync::models::{AuthState, ConnectionStatus, Credential};
use symbion_fleet_sync::FleetSync;
use tokio::sync::watch;

/// Fixed "now" of the harness clock (2023-11-14T22:13:20Z).
pub const HARNESS_NOW_MS: i64 = 1_700_000_000_000;

pub struct TestHarness {
    pub transport: MockTransport,
    pub history: Arc<MockHistory>,
    pub clock: Arc<ManualClock>,
    pub config: SyncConfig,
    auth: watch::Sender<AuthState>,
}

impl TestHarness {
    /// Harness with a short backoff (10ms doubling up to 80ms, 3 retries).
    pub fn new() -> Self {
        env_logger::try_init().ok(); // Init logging pour tests

        let mut config = SyncConfig::default();
        config.reconnect = ReconnectConf {
            base_delay_ms: 10,
            multiplier: 2.0,
            max_delay_ms: 80,
            max_retries: 3,
        };
        let (auth, _) = watch::channel(AuthState::Anonymous);

        Self {
            transport: MockTransport::new(),
            history: Arc::new(MockHistory::new()),
            clock: Arc::new(ManualClock::at_ms(HARNESS_NOW_MS)),
            config,
            auth,
        }
    }

    pub fn with_config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    /// A new engine wired to the harness doubles.
    pub fn engine(&self) -> FleetSync {
        FleetSync::new(
            self.config.clone(),
            Arc::new(self.transport.clone()),
            self.history.clone(),
            self.clock.clone(),
        )
    }

    /// An engine already initialized with the harness auth state.
    pub async fn started_engine(&self) -> FleetSync {
        let engine = self.engine();
        engine.init(self.auth_receiver()).await;
        engine
    }

    pub fn auth_receiver(&self) -> watch::Receiver<AuthState> {
        self.auth.subscribe()
    }

    pub fn login(&self, token: &str) {
        self.auth.send_replace(AuthState::Authenticated(Credential::new(token)));
        log::info!("🔑 Logged in");
    }

    pub fn logout(&self) {
        self.auth.send_replace(AuthState::Anonymous);
        log::info!("🚪 Logged out");
    }

    /// Pushes a JSON message from the "server".
    pub fn send(&self, message: &Value) -> Result<()> {
        self.transport.send_json(message)
    }

    /// Polls `condition` until it holds or `timeout_ms` elapses (tokio time,
    /// so it also works with a paused clock).
    pub async fn wait_until<F>(&self, timeout_ms: u64, mut condition: F) -> Result<()>
    where
        F: FnMut() -> bool,
    {
        let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
        while !condition() {
            if tokio::time::Instant::now() >= deadline {
                log::warn!("⏰ Timeout after {}ms", timeout_ms);
                anyhow::bail!("condition not met within {}ms", timeout_ms);
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        Ok(())
    }

    /// Waits for the transport to hold a live connection.
    pub async fn wait_connected(&self, timeout_ms: u64) -> Result<()> {
        let transport = self.transport.clone();
        self.wait_until(timeout_ms, move || transport.is_connected()).await
    }

    /// Waits until the fleet store of `engine` reports `status`.
    pub async fn wait_for_status(&self, engine: &FleetSync, status: ConnectionStatus, timeout_ms: u64) -> Result<()> {
        let mut fleet = engine.fleet().watch();
        with_timeout(timeout_ms, async move {
            fleet
                .wait_for(|state| state.status == status)
                .await
                .map(|_| ())
                .map_err(|_| anyhow::anyhow!("fleet store dropped"))
        })
        .await
        .map_err(|e| anyhow::anyhow!("status {} not reached: {}", status, e))
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

async fn with_timeout<F>(timeout_ms: u64, future: F) -> Result<()>
where
    F: Future<Output = Result<()>>,
{
    tokio::time::timeout(Duration::from_millis(timeout_ms), future)
        .await
        .map_err(|_| anyhow::anyhow!("timeout after {}ms", timeout_ms))?
}
