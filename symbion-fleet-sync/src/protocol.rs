//! Wire format of the push connection.
//!
//! Every text frame is a JSON envelope `{"type": <kind>, "data": <payload>}`.
//! Decoding turns one frame into zero or more bus events: a
//! `full_server_list` also fans out one `server_metrics` event per server
//! carrying embedded `latest_metrics`, which is how per-server charts are
//! fed when the backend has no dedicated metric stream.

use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;

use crate::events::SyncEvent;
use crate::models::{MetricPoint, ProbeResult, Server, ServerId};

pub const FULL_SERVER_LIST: &str = "full_server_list";
pub const SERVER_METRICS: &str = "server_metrics";
pub const SERVICE_MONITOR_RESULT: &str = "service_monitor_result";

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("invalid JSON envelope: {0}")]
    Envelope(#[source] serde_json::Error),
    #[error("invalid `{kind}` payload: {source}")]
    Payload {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Value,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ServerListPayload {
    Wrapped { servers: Vec<Server> },
    Bare(Vec<Server>),
}

#[derive(Debug, Deserialize)]
struct ServerMetricsPayload {
    server_id: ServerId,
    metrics: MetricPoint,
}

/// Decodes one text frame. Unknown kinds decode to no events.
pub fn decode_frame(text: &str) -> Result<Vec<SyncEvent>, DecodeError> {
    let envelope: Envelope = serde_json::from_str(text).map_err(DecodeError::Envelope)?;
    let payload_error = |source| DecodeError::Payload {
        kind: envelope.kind.clone(),
        source,
    };

    match envelope.kind.as_str() {
        FULL_SERVER_LIST => {
            let servers = match serde_json::from_value::<ServerListPayload>(envelope.data.clone())
                .map_err(payload_error)?
            {
                ServerListPayload::Wrapped { servers } => servers,
                ServerListPayload::Bare(servers) => servers,
            };
            let mut events = Vec::with_capacity(servers.len() + 1);
            for server in &servers {
                if let Some(point) = &server.latest_metrics {
                    events.push(SyncEvent::ServerMetrics {
                        server_id: server.id,
                        point: point.clone(),
                    });
                }
            }
            // the snapshot goes first so the fleet is current before charts react
            events.insert(0, SyncEvent::FullServerList(Arc::new(servers)));
            Ok(events)
        }
        SERVER_METRICS => {
            let payload: ServerMetricsPayload =
                serde_json::from_value(envelope.data.clone()).map_err(payload_error)?;
            Ok(vec![SyncEvent::ServerMetrics {
                server_id: payload.server_id,
                point: payload.metrics,
            }])
        }
        SERVICE_MONITOR_RESULT => {
            let result: ProbeResult =
                serde_json::from_value(envelope.data.clone()).map_err(payload_error)?;
            Ok(vec![SyncEvent::ServiceMonitorResult(result)])
        }
        other => {
            tracing::debug!(kind = other, "ignoring unknown push message");
            Ok(Vec::new())
        }
    }
}
