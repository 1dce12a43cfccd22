//! Chart-ready series.
//!
//! Every chart gets the same shape whatever the source: one
//! `ChartDataPoint` per timestamp with a set of named, nullable fields. A
//! null is a gap ("no data"), never a zero.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::models::{MetricFamily, MetricPoint, ProbeResult, Sample, SourceKind, SubscriptionKey};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChartDataPoint {
    /// Epoch milliseconds.
    pub time: i64,
    #[serde(flatten)]
    pub values: BTreeMap<String, Option<f64>>,
}

impl ChartDataPoint {
    /// Name of the timestamp key in the flattened JSON form.
    pub const TIME_FIELD: &'static str = "time";

    pub fn get(&self, field: &str) -> Option<f64> {
        self.values.get(field).copied().flatten()
    }
}

/// Raw numeric field of a `MetricPoint`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricField {
    CpuPercent,
    MemoryUsed,
    MemoryTotal,
    SwapUsed,
    SwapTotal,
    DiskUsed,
    DiskTotal,
    NetInBps,
    NetOutBps,
    DiskReadBps,
    DiskWriteBps,
    Load1,
    TcpConnections,
    ProcessCount,
}

impl MetricField {
    pub fn read(&self, point: &MetricPoint) -> Option<f64> {
        let raw = match self {
            MetricField::CpuPercent => point.cpu_percent,
            MetricField::MemoryUsed => point.memory_used.map(|v| v as f64),
            MetricField::MemoryTotal => point.memory_total.map(|v| v as f64),
            MetricField::SwapUsed => point.swap_used.map(|v| v as f64),
            MetricField::SwapTotal => point.swap_total.map(|v| v as f64),
            MetricField::DiskUsed => point.disk_used.map(|v| v as f64),
            MetricField::DiskTotal => point.disk_total.map(|v| v as f64),
            MetricField::NetInBps => point.net_in_bps,
            MetricField::NetOutBps => point.net_out_bps,
            MetricField::DiskReadBps => point.disk_read_bps,
            MetricField::DiskWriteBps => point.disk_write_bps,
            MetricField::Load1 => point.load_1,
            MetricField::TcpConnections => point.tcp_connections.map(|v| v as f64),
            MetricField::ProcessCount => point.process_count.map(|v| v as f64),
        };
        raw.filter(|v| v.is_finite())
    }
}

/// How one chart field is computed from a metric point.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldSelector {
    /// The raw field, as is.
    Value { name: String, field: MetricField },
    /// `used / total * 100`, null unless both are known and `total > 0`.
    Percent { name: String, used: MetricField, total: MetricField },
}

impl FieldSelector {
    pub fn value(name: impl Into<String>, field: MetricField) -> Self {
        FieldSelector::Value {
            name: name.into(),
            field,
        }
    }

    pub fn percent(name: impl Into<String>, used: MetricField, total: MetricField) -> Self {
        FieldSelector::Percent {
            name: name.into(),
            used,
            total,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            FieldSelector::Value { name, .. } | FieldSelector::Percent { name, .. } => name,
        }
    }

    pub fn evaluate(&self, point: &MetricPoint) -> Option<f64> {
        match self {
            FieldSelector::Value { field, .. } => field.read(point),
            FieldSelector::Percent { used, total, .. } => match (used.read(point), total.read(point)) {
                (Some(used), Some(total)) if total > 0.0 => Some(used / total * 100.0),
                _ => None,
            },
        }
    }
}

impl MetricFamily {
    /// Chart fields shown for this family. Empty for probe families, which
    /// are pivoted instead.
    pub fn default_selectors(&self) -> Vec<FieldSelector> {
        use MetricField::*;
        match self {
            MetricFamily::Cpu => vec![
                FieldSelector::value("cpu", CpuPercent),
                FieldSelector::value("load_1", Load1),
            ],
            MetricFamily::Memory => vec![
                FieldSelector::percent("memory", MemoryUsed, MemoryTotal),
                FieldSelector::percent("swap", SwapUsed, SwapTotal),
                FieldSelector::percent("disk", DiskUsed, DiskTotal),
            ],
            MetricFamily::Network => vec![
                FieldSelector::value("net_in", NetInBps),
                FieldSelector::value("net_out", NetOutBps),
                FieldSelector::value("tcp_connections", TcpConnections),
            ],
            MetricFamily::DiskIo => vec![
                FieldSelector::value("disk_read", DiskReadBps),
                FieldSelector::value("disk_write", DiskWriteBps),
            ],
            MetricFamily::Latency => Vec::new(),
        }
    }
}

/// Field key for a series name. A name equal to the timestamp key gets a
/// trailing underscore so the flattened JSON never holds `time` twice.
pub fn field_name(name: &str) -> String {
    if name == ChartDataPoint::TIME_FIELD {
        format!("{name}_")
    } else {
        name.to_string()
    }
}

/// One chart point per metric sample. Probe samples are skipped.
pub fn to_chart_series(samples: &[Sample], selectors: &[FieldSelector]) -> Vec<ChartDataPoint> {
    samples
        .iter()
        .filter_map(Sample::as_metric)
        .map(|point| ChartDataPoint {
            time: point.timestamp_ms(),
            values: selectors
                .iter()
                .map(|selector| (field_name(selector.name()), selector.evaluate(point)))
                .collect(),
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupBy {
    /// One field per probe (service monitor) name.
    Probe,
    /// One field per reporting agent (server) name.
    Agent,
}

/// Last-observation-carried-forward pivot of `(time, group, value)`
/// triples.
///
/// Triples are stably sorted by time, so equal timestamps keep their input
/// order and the last one applied wins. The output has one point per
/// distinct time with a field for every group seen anywhere in the input;
/// a group's field holds its latest value at or before that time, or null
/// if it has none yet (or its latest observation was null).
pub fn pivot_locf<I>(triples: I) -> Vec<ChartDataPoint>
where
    I: IntoIterator<Item = (i64, String, Option<f64>)>,
{
    let mut triples: Vec<_> = triples
        .into_iter()
        .map(|(time, group, value)| (time, field_name(&group), value))
        .collect();
    triples.sort_by_key(|(time, _, _)| *time);

    let groups: BTreeSet<String> = triples.iter().map(|(_, group, _)| group.clone()).collect();
    let mut latest: BTreeMap<String, Option<f64>> = groups.into_iter().map(|g| (g, None)).collect();
    let mut points: Vec<ChartDataPoint> = Vec::new();

    let mut rest = triples.as_slice();
    while let Some((time, _, _)) = rest.first() {
        let time = *time;
        let split = rest.iter().position(|(t, _, _)| *t != time).unwrap_or(rest.len());
        let (at_time, later) = rest.split_at(split);
        for (_, group, value) in at_time {
            latest.insert(group.clone(), *value);
        }
        points.push(ChartDataPoint {
            time,
            values: latest.clone(),
        });
        rest = later;
    }
    points
}

/// Pivots probe results into one field per group. A down result (or one
/// without latency) is a null observation.
///
/// Groups are keyed by id: when several ids share a display name, each of
/// them gets a `"<name> #<id>"` field instead of being merged.
pub fn pivot_probe_results<'a, I>(results: I, group_by: GroupBy) -> Vec<ChartDataPoint>
where
    I: IntoIterator<Item = &'a ProbeResult>,
{
    let results: Vec<&ProbeResult> = results.into_iter().collect();
    let identify = |result: &ProbeResult| match group_by {
        GroupBy::Probe => (result.monitor_id, result.probe_label()),
        GroupBy::Agent => (result.server_id, result.agent_label()),
    };

    let mut ids_by_label: BTreeMap<String, BTreeSet<u64>> = BTreeMap::new();
    for result in &results {
        let (id, label) = identify(*result);
        ids_by_label.entry(label).or_default().insert(id);
    }

    pivot_locf(results.into_iter().map(|result| {
        let (id, label) = identify(result);
        let shared = ids_by_label.get(&label).is_some_and(|ids| ids.len() > 1);
        let group = if shared { format!("{label} #{id}") } else { label };
        let value = if result.is_up {
            result.latency_ms.filter(|v| v.is_finite())
        } else {
            None
        };
        (result.timestamp_ms(), group, value)
    }))
}

/// The series a chart for `key` shows, from raw samples.
pub fn transform(samples: &[Sample], key: &SubscriptionKey) -> Vec<ChartDataPoint> {
    if key.family.is_probe() {
        // a server's chart compares its probes, a monitor's chart compares agents
        let group_by = match key.source.kind {
            SourceKind::Server => GroupBy::Probe,
            SourceKind::Monitor => GroupBy::Agent,
        };
        pivot_probe_results(samples.iter().filter_map(Sample::as_probe), group_by)
    } else {
        to_chart_series(samples, &key.family.default_selectors())
    }
}
