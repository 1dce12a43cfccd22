/**
 * SYMBION FLEET SYNC - Moteur client de synchronisation du dashboard de flotte
 *
 * RÔLE : Une seule connexion push persistante, réconciliation par snapshot complet,
 * abonnements métriques multiplexés, buffers glissants et séries prêtes pour graphiques.
 *
 * ARCHITECTURE : ConnectionManager → EventBus → FleetStore / SubscriptionMux → WindowBuffer
 * → series → SeriesFeed (realtime ou historique). `FleetSync` câble le tout.
 */

pub mod clock;
pub mod config;
pub mod connection;
pub mod engine;
pub mod events;
pub mod feed;
pub mod fleet;
pub mod health;
pub mod history;
pub mod models;
pub mod protocol;
pub mod series;
pub mod state;
pub mod subscriptions;
pub mod transport;
pub mod window;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{load_config, SyncConfig};
pub use connection::ConnectionManager;
pub use engine::FleetSync;
pub use events::{CloseInfo, EventBus, ListenerHandle, SyncEvent, Topic};
pub use feed::{FeedOptions, SeriesFeed, SeriesQuery, SeriesState, TimeRange, ViewMode};
pub use fleet::{FleetCounts, FleetFilter, FleetState, FleetStore};
pub use health::EngineHealth;
pub use history::{FetchError, HistoryQuery, HistorySource, HttpHistoryClient};
pub use models::{
    AuthState, ConnectionStatus, Credential, MetricFamily, MetricPoint, ProbeResult, Sample, Server,
    ServerStatus, SourceRef, SubscriptionKey,
};
pub use series::{ChartDataPoint, FieldSelector, GroupBy, MetricField};
pub use subscriptions::{SubscriptionHandle, SubscriptionMux};
pub use transport::{Frame, Transport, TransportError, TransportStream, WsTransport};
