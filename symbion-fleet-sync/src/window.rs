//! Bounded sliding-window buffers, one per subscription key.
//!
//! Every buffer stays sorted by `SampleKey` and never holds two samples with
//! the same key, so replaying a seed or a push is harmless. Samples older
//! than `now - retention(family)` are dropped on every append.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::clock::Clock;
use crate::config::RetentionConf;
use crate::models::{MetricFamily, Sample, SubscriptionKey};

pub struct WindowBuffer {
    clock: Arc<dyn Clock>,
    retention: RetentionConf,
    series: HashMap<SubscriptionKey, Vec<Sample>>,
}

impl WindowBuffer {
    pub fn new(clock: Arc<dyn Clock>, retention: RetentionConf) -> Self {
        Self {
            clock,
            retention,
            series: HashMap::new(),
        }
    }

    pub fn retention_for(&self, family: MetricFamily) -> Duration {
        let secs = if family.is_probe() {
            self.retention.latency_secs
        } else {
            self.retention.metrics_secs
        };
        Duration::from_secs(secs)
    }

    fn cutoff_ms(&self, family: MetricFamily) -> i64 {
        self.clock.now_ms() - self.retention_for(family).as_millis() as i64
    }

    /// Merges `samples` into the buffer of `key` and returns how many were
    /// actually added (duplicates and already-expired samples are not).
    pub fn append(&mut self, key: SubscriptionKey, samples: impl IntoIterator<Item = Sample>) -> usize {
        let cutoff = self.cutoff_ms(key.family);
        let buffer = self.series.entry(key).or_default();

        buffer.retain(|s| s.timestamp_ms() >= cutoff);
        let before = buffer.len();

        buffer.extend(samples.into_iter().filter(|s| s.timestamp_ms() >= cutoff));
        if buffer.len() == before {
            return 0;
        }
        // stable sort: on equal keys the sample already buffered comes first and is kept
        buffer.sort_by_key(Sample::key);
        buffer.dedup_by(|later, earlier| later.key() == earlier.key());

        buffer.len() - before
    }

    /// Buffered samples of `key` still inside the window, oldest first.
    pub fn read(&self, key: &SubscriptionKey) -> Vec<Sample> {
        let cutoff = self.cutoff_ms(key.family);
        self.series
            .get(key)
            .map(|buffer| buffer.iter().filter(|s| s.timestamp_ms() >= cutoff).cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self, key: &SubscriptionKey) -> usize {
        self.series.get(key).map_or(0, Vec::len)
    }

    pub fn total_points(&self) -> usize {
        self.series.values().map(Vec::len).sum()
    }

    pub fn keys(&self) -> Vec<SubscriptionKey> {
        let mut keys: Vec<_> = self.series.keys().copied().collect();
        keys.sort();
        keys
    }

    /// Drops expired samples from every buffer, and empty buffers with them.
    pub fn prune(&mut self) -> usize {
        let now = self.clock.now_ms();
        let (metrics, latency) = (
            self.retention.metrics_secs as i64 * 1_000,
            self.retention.latency_secs as i64 * 1_000,
        );
        let mut dropped = 0;
        self.series.retain(|key, buffer| {
            let cutoff = now - if key.family.is_probe() { latency } else { metrics };
            let before = buffer.len();
            buffer.retain(|s| s.timestamp_ms() >= cutoff);
            dropped += before - buffer.len();
            !buffer.is_empty()
        });
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{from_epoch_ms, ManualClock};
    use crate::models::{MetricPoint, ProbeResult};

    const NOW: i64 = 1_700_000_000_000;

    fn buffer() -> (Arc<ManualClock>, WindowBuffer) {
        let clock = Arc::new(ManualClock::at_ms(NOW));
        let window = WindowBuffer::new(
            clock.clone(),
            RetentionConf {
                metrics_secs: 600,
                latency_secs: 300,
            },
        );
        (clock, window)
    }

    fn cpu(at_ms: i64, value: f64) -> Sample {
        let mut point = MetricPoint::at(from_epoch_ms(at_ms));
        point.cpu_percent = Some(value);
        Sample::Metric(point)
    }

    fn probe(at_ms: i64, monitor_id: u64, server_id: u64) -> Sample {
        Sample::Probe(ProbeResult {
            monitor_id,
            monitor_name: None,
            server_id,
            server_name: None,
            time: from_epoch_ms(at_ms),
            is_up: true,
            latency_ms: Some(10.0),
            message: None,
        })
    }

    fn timestamps(samples: &[Sample]) -> Vec<i64> {
        samples.iter().map(Sample::timestamp_ms).collect()
    }

    #[test]
    fn test_append_keeps_time_order() {
        let (_, mut window) = buffer();
        let key = SubscriptionKey::server(1, MetricFamily::Cpu);

        window.append(key, vec![cpu(NOW - 1_000, 1.0), cpu(NOW - 3_000, 3.0)]);
        window.append(key, vec![cpu(NOW - 2_000, 2.0), cpu(NOW, 0.0)]);

        assert_eq!(
            timestamps(&window.read(&key)),
            vec![NOW - 3_000, NOW - 2_000, NOW - 1_000, NOW]
        );
    }

    #[test]
    fn test_duplicate_timestamp_keeps_first_value() {
        let (_, mut window) = buffer();
        let key = SubscriptionKey::server(1, MetricFamily::Cpu);

        assert_eq!(window.append(key, vec![cpu(NOW, 10.0)]), 1);
        assert_eq!(window.append(key, vec![cpu(NOW, 99.0)]), 0);

        let samples = window.read(&key);
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].as_metric().unwrap().cpu_percent, Some(10.0));
    }

    #[test]
    fn test_replaying_a_batch_is_idempotent() {
        let (_, mut window) = buffer();
        let key = SubscriptionKey::server(2, MetricFamily::Cpu);
        let batch: Vec<_> = (0..5).map(|i| cpu(NOW - i * 1_000, i as f64)).collect();

        assert_eq!(window.append(key, batch.clone()), 5);
        let first = window.read(&key);
        assert_eq!(window.append(key, batch), 0);
        assert_eq!(window.read(&key), first);
    }

    #[test]
    fn test_probes_from_different_agents_share_a_timestamp() {
        let (_, mut window) = buffer();
        let key = SubscriptionKey::monitor(7);

        let added = window.append(key, vec![probe(NOW, 7, 1), probe(NOW, 7, 2), probe(NOW, 7, 1)]);
        assert_eq!(added, 2);
        assert_eq!(window.len(&key), 2);
    }

    #[test]
    fn test_append_evicts_expired_samples() {
        let (clock, mut window) = buffer();
        let key = SubscriptionKey::server(1, MetricFamily::Cpu);

        window.append(key, vec![cpu(NOW - 500_000, 1.0), cpu(NOW, 2.0)]);
        assert_eq!(window.len(&key), 2);

        clock.advance(time::Duration::seconds(200));
        window.append(key, vec![cpu(NOW + 200_000, 3.0)]);
        assert_eq!(timestamps(&window.read(&key)), vec![NOW, NOW + 200_000]);
    }

    #[test]
    fn test_expired_samples_are_never_inserted() {
        let (_, mut window) = buffer();
        let key = SubscriptionKey::monitor(3);

        // latency keeps five minutes only
        assert_eq!(window.append(key, vec![probe(NOW - 301_000, 3, 1)]), 0);
        assert_eq!(window.len(&key), 0);
    }

    #[test]
    fn test_read_hides_expired_samples_without_mutating() {
        let (clock, mut window) = buffer();
        let key = SubscriptionKey::server(1, MetricFamily::Memory);
        window.append(key, vec![cpu(NOW - 590_000, 1.0), cpu(NOW, 2.0)]);

        clock.advance(time::Duration::seconds(20));
        assert_eq!(window.read(&key).len(), 1);
        assert_eq!(window.len(&key), 2);

        assert_eq!(window.prune(), 1);
        assert_eq!(window.total_points(), 1);
    }
}
