use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::info;

use crate::connection::ConnectionManager;
use crate::fleet::FleetStore;
use crate::models::ConnectionStatus;
use crate::subscriptions::SubscriptionMux;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineHealth {
    pub uptime_seconds: u64,
    pub connection_status: ConnectionStatus,
    pub reconnects: u32,
    pub connect_attempts: u32,
    pub servers_tracked: u32,
    pub active_subscriptions: u32,
    pub buffered_points: u64,
    pub seed_fetches: u64,
}

#[derive(Clone)]
pub struct HealthTracker {
    start_time: Instant,
    connection: ConnectionManager,
    fleet: FleetStore,
    mux: SubscriptionMux,
}

impl HealthTracker {
    pub fn new(connection: ConnectionManager, fleet: FleetStore, mux: SubscriptionMux) -> Self {
        Self {
            start_time: Instant::now(),
            connection,
            fleet,
            mux,
        }
    }

    pub fn get_health(&self) -> EngineHealth {
        EngineHealth {
            uptime_seconds: self.start_time.elapsed().as_secs(),
            connection_status: self.connection.status(),
            reconnects: self.connection.unplanned_closes(),
            connect_attempts: self.connection.connect_attempts(),
            servers_tracked: self.fleet.counts().total as u32,
            active_subscriptions: self.mux.active_registrations() as u32,
            buffered_points: self.mux.window().lock().total_points() as u64,
            seed_fetches: self.mux.seed_fetches(),
        }
    }

    /// Logs a health line every `every`, and prunes expired buffer entries
    /// on the same tick.
    pub fn spawn_reporter(&self, every: Duration) -> JoinHandle<()> {
        let tracker = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                interval.tick().await;
                let pruned = tracker.mux.window().lock().prune();
                let health = tracker.get_health();
                info!(
                    uptime = health.uptime_seconds,
                    status = %health.connection_status,
                    reconnects = health.reconnects,
                    servers = health.servers_tracked,
                    subscriptions = health.active_subscriptions,
                    points = health.buffered_points,
                    pruned,
                    "fleet-sync health"
                );
            }
        })
    }
}
