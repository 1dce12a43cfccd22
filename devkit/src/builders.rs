/*!
Builders de messages et d'échantillons de test

`FleetMessageBuilder` produit les frames JSON telles que le backend les
pousse ; `SampleBuilder` produit directement les types Rust du moteur.
Les horodatages sont en millisecondes epoch.
*/

use serde_json::{json, Value};
use symbion_fleet_sync::clock::from_epoch_ms;
use symbion_fleet_sync::models::{MetricPoint, ProbeResult, Sample};
use time::format_description::well_known::Rfc3339;

/// RFC 3339 text for an epoch-ms timestamp.
pub fn rfc3339(at_ms: i64) -> String {
    from_epoch_ms(at_ms).format(&Rfc3339).unwrap_or_default()
}

pub struct FleetMessageBuilder;

impl FleetMessageBuilder {
    pub fn server(id: u64, name: &str, status: &str) -> Value {
        json!({
            "id": id,
            "name": name,
            "status": status,
            "tags": []
        })
    }

    /// Server entry carrying an embedded metrics snapshot.
    pub fn server_with_metrics(id: u64, name: &str, at_ms: i64, cpu: f64) -> Value {
        json!({
            "id": id,
            "name": name,
            "status": "online",
            "latest_metrics": {
                "time": rfc3339(at_ms),
                "cpu_percent": cpu
            }
        })
    }

    pub fn full_server_list(servers: Vec<Value>) -> Value {
        json!({
            "type": "full_server_list",
            "data": { "servers": servers }
        })
    }

    pub fn server_metrics(server_id: u64, at_ms: i64, cpu: f64, memory_used: u64, memory_total: u64) -> Value {
        json!({
            "type": "server_metrics",
            "data": {
                "server_id": server_id,
                "metrics": {
                    "time": rfc3339(at_ms),
                    "cpu_percent": cpu,
                    "memory_used": memory_used,
                    "memory_total": memory_total
                }
            }
        })
    }

    pub fn service_monitor_result(
        monitor_id: u64,
        server_id: u64,
        server_name: &str,
        at_ms: i64,
        is_up: bool,
        latency_ms: f64,
    ) -> Value {
        json!({
            "type": "service_monitor_result",
            "data": {
                "monitor_id": monitor_id,
                "server_id": server_id,
                "server_name": server_name,
                "time": rfc3339(at_ms),
                "is_up": is_up,
                "latency_ms": latency_ms
            }
        })
    }
}

pub struct SampleBuilder;

impl SampleBuilder {
    pub fn cpu(at_ms: i64, cpu: f64) -> Sample {
        let mut point = MetricPoint::at(from_epoch_ms(at_ms));
        point.cpu_percent = Some(cpu);
        Sample::Metric(point)
    }

    pub fn memory(at_ms: i64, used: u64, total: u64) -> Sample {
        let mut point = MetricPoint::at(from_epoch_ms(at_ms));
        point.memory_used = Some(used);
        point.memory_total = Some(total);
        Sample::Metric(point)
    }

    pub fn probe(monitor_id: u64, server_id: u64, at_ms: i64, is_up: bool, latency_ms: f64) -> ProbeResult {
        ProbeResult {
            monitor_id,
            monitor_name: Some(format!("monitor-{monitor_id}")),
            server_id,
            server_name: Some(format!("agent-{server_id}")),
            time: from_epoch_ms(at_ms),
            is_up,
            latency_ms: Some(latency_ms),
            message: None,
        }
    }

    pub fn probe_sample(monitor_id: u64, server_id: u64, at_ms: i64, is_up: bool, latency_ms: f64) -> Sample {
        Sample::Probe(Self::probe(monitor_id, server_id, at_ms, is_up, latency_ms))
    }
}
