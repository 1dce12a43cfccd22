use serde::{Deserialize, Serialize};
use std::fmt;
use time::OffsetDateTime;

use crate::clock::epoch_ms;

pub type ServerId = u64;
pub type MonitorId = u64;

/// A monitored server as pushed by the backend in `full_server_list`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Server {
    pub id: ServerId,
    pub name: String,
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub status: ServerStatus,
    #[serde(default)]
    pub latest_metrics: Option<MetricPoint>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ServerStatus {
    Online,
    Offline,
    #[default]
    Unknown,
}

impl ServerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerStatus::Online => "online",
            ServerStatus::Offline => "offline",
            ServerStatus::Unknown => "unknown",
        }
    }
}

impl From<String> for ServerStatus {
    fn from(raw: String) -> Self {
        match raw.to_ascii_lowercase().as_str() {
            "online" | "up" => ServerStatus::Online,
            "offline" | "down" => ServerStatus::Offline,
            _ => ServerStatus::Unknown,
        }
    }
}

impl From<ServerStatus> for String {
    fn from(status: ServerStatus) -> Self {
        status.as_str().to_string()
    }
}

/// Connection lifecycle as seen by the dashboard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Error,
    Reconnecting,
    PermanentlyFailed,
}

impl ConnectionStatus {
    /// Allowed edges of the connection state machine. Any state may fall
    /// back to `Disconnected`; `PermanentlyFailed` only leaves through a
    /// fresh connect.
    pub fn can_transition_to(self, next: ConnectionStatus) -> bool {
        use ConnectionStatus::*;
        if self == next {
            return true;
        }
        matches!(
            (self, next),
            (_, Disconnected)
                | (Disconnected | Error | PermanentlyFailed | Reconnecting, Connecting)
                | (Connecting | Reconnecting | Error, Connected)
                | (Connecting | Connected | Error, Reconnecting)
                | (Connecting | Connected, Error)
                | (Reconnecting, PermanentlyFailed)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Error => "error",
            ConnectionStatus::Reconnecting => "reconnecting",
            ConnectionStatus::PermanentlyFailed => "permanently_failed",
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One performance sample for a server. Every field is optional because
/// agents report different subsets depending on the platform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricPoint {
    #[serde(with = "rfc3339")]
    pub time: OffsetDateTime,
    #[serde(default)]
    pub cpu_percent: Option<f64>,
    #[serde(default)]
    pub memory_used: Option<u64>,
    #[serde(default)]
    pub memory_total: Option<u64>,
    #[serde(default)]
    pub swap_used: Option<u64>,
    #[serde(default)]
    pub swap_total: Option<u64>,
    #[serde(default)]
    pub disk_used: Option<u64>,
    #[serde(default)]
    pub disk_total: Option<u64>,
    #[serde(default)]
    pub net_in_bps: Option<f64>,
    #[serde(default)]
    pub net_out_bps: Option<f64>,
    #[serde(default)]
    pub disk_read_bps: Option<f64>,
    #[serde(default)]
    pub disk_write_bps: Option<f64>,
    #[serde(default)]
    pub load_1: Option<f64>,
    #[serde(default)]
    pub tcp_connections: Option<u64>,
    #[serde(default)]
    pub process_count: Option<u64>,
}

impl MetricPoint {
    /// Empty sample at `time`, fields filled in by the caller.
    pub fn at(time: OffsetDateTime) -> Self {
        Self {
            time,
            cpu_percent: None,
            memory_used: None,
            memory_total: None,
            swap_used: None,
            swap_total: None,
            disk_used: None,
            disk_total: None,
            net_in_bps: None,
            net_out_bps: None,
            disk_read_bps: None,
            disk_write_bps: None,
            load_1: None,
            tcp_connections: None,
            process_count: None,
        }
    }

    pub fn timestamp_ms(&self) -> i64 {
        epoch_ms(self.time)
    }
}

/// Outcome of one service-monitor probe, run by one agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeResult {
    pub monitor_id: MonitorId,
    #[serde(default)]
    pub monitor_name: Option<String>,
    pub server_id: ServerId,
    #[serde(default)]
    pub server_name: Option<String>,
    #[serde(with = "rfc3339")]
    pub time: OffsetDateTime,
    #[serde(alias = "success")]
    pub is_up: bool,
    #[serde(default, alias = "latency")]
    pub latency_ms: Option<f64>,
    #[serde(default)]
    pub message: Option<String>,
}

impl ProbeResult {
    pub fn timestamp_ms(&self) -> i64 {
        epoch_ms(self.time)
    }

    pub fn probe_label(&self) -> String {
        self.monitor_name
            .clone()
            .unwrap_or_else(|| format!("monitor-{}", self.monitor_id))
    }

    pub fn agent_label(&self) -> String {
        self.server_name
            .clone()
            .unwrap_or_else(|| format!("server-{}", self.server_id))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricFamily {
    Cpu,
    Memory,
    Network,
    DiskIo,
    Latency,
}

impl MetricFamily {
    pub const ALL: [MetricFamily; 5] = [
        MetricFamily::Cpu,
        MetricFamily::Memory,
        MetricFamily::Network,
        MetricFamily::DiskIo,
        MetricFamily::Latency,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MetricFamily::Cpu => "cpu",
            MetricFamily::Memory => "memory",
            MetricFamily::Network => "network",
            MetricFamily::DiskIo => "disk_io",
            MetricFamily::Latency => "latency",
        }
    }

    /// Probe-fed family (service monitor results) rather than server metrics.
    pub fn is_probe(&self) -> bool {
        matches!(self, MetricFamily::Latency)
    }
}

impl fmt::Display for MetricFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Server,
    Monitor,
}

/// What a chart is about: a server, or a service monitor seen across agents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SourceRef {
    pub kind: SourceKind,
    pub id: u64,
}

impl SourceRef {
    pub fn server(id: ServerId) -> Self {
        Self { kind: SourceKind::Server, id }
    }

    pub fn monitor(id: MonitorId) -> Self {
        Self { kind: SourceKind::Monitor, id }
    }

    pub fn supports(&self, family: MetricFamily) -> bool {
        match self.kind {
            SourceKind::Server => true,
            SourceKind::Monitor => family.is_probe(),
        }
    }
}

impl fmt::Display for SourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            SourceKind::Server => write!(f, "server/{}", self.id),
            SourceKind::Monitor => write!(f, "monitor/{}", self.id),
        }
    }
}

/// Identity of one multiplexed subscription and of one window buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionKey {
    pub source: SourceRef,
    pub family: MetricFamily,
}

impl SubscriptionKey {
    pub fn new(source: SourceRef, family: MetricFamily) -> Self {
        Self { source, family }
    }

    pub fn server(id: ServerId, family: MetricFamily) -> Self {
        Self::new(SourceRef::server(id), family)
    }

    pub fn monitor(id: MonitorId) -> Self {
        Self::new(SourceRef::monitor(id), MetricFamily::Latency)
    }
}

impl fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.source, self.family)
    }
}

/// Buffered time-series entry.
#[derive(Debug, Clone, PartialEq)]
pub enum Sample {
    Metric(MetricPoint),
    Probe(ProbeResult),
}

/// Ordering and identity of a sample inside a buffer: timestamp first, then
/// the (probe, agent) pair for probe results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SampleKey {
    pub timestamp_ms: i64,
    pub discriminator: (u64, u64),
}

impl Sample {
    pub fn timestamp_ms(&self) -> i64 {
        match self {
            Sample::Metric(point) => point.timestamp_ms(),
            Sample::Probe(result) => result.timestamp_ms(),
        }
    }

    pub fn key(&self) -> SampleKey {
        match self {
            Sample::Metric(point) => SampleKey {
                timestamp_ms: point.timestamp_ms(),
                discriminator: (0, 0),
            },
            Sample::Probe(result) => SampleKey {
                timestamp_ms: result.timestamp_ms(),
                discriminator: (result.monitor_id, result.server_id),
            },
        }
    }

    pub fn as_metric(&self) -> Option<&MetricPoint> {
        match self {
            Sample::Metric(point) => Some(point),
            Sample::Probe(_) => None,
        }
    }

    pub fn as_probe(&self) -> Option<&ProbeResult> {
        match self {
            Sample::Probe(result) => Some(result),
            Sample::Metric(_) => None,
        }
    }
}

/// Bearer token for the authenticated endpoint. Never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn token(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(***)")
    }
}

/// Session state provided by the (external) auth layer.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum AuthState {
    #[default]
    Anonymous,
    Authenticated(Credential),
}

impl AuthState {
    pub fn credential(&self) -> Option<Credential> {
        match self {
            AuthState::Anonymous => None,
            AuthState::Authenticated(credential) => Some(credential.clone()),
        }
    }
}

/// RFC 3339 (de)serialization for wire timestamps.
pub mod rfc3339 {
    use serde::{de, ser, Deserialize, Deserializer, Serializer};
    use time::format_description::well_known::Rfc3339;
    use time::OffsetDateTime;

    pub fn serialize<S: Serializer>(value: &OffsetDateTime, serializer: S) -> Result<S::Ok, S::Error> {
        let text = value.format(&Rfc3339).map_err(ser::Error::custom)?;
        serializer.serialize_str(&text)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<OffsetDateTime, D::Error> {
        let text = String::deserialize(deserializer)?;
        OffsetDateTime::parse(&text, &Rfc3339).map_err(de::Error::custom)
    }
}
