//! Message ingest: topic matching, extraction and registry updates.

use std::io::Write;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, trace};

use crate::extract::extract;
use crate::registry::{MetricRegistry, MetricUpdate, SeriesKey};
use crate::rule::RuleSet;

/// Ingest statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestStats {
    /// Total messages handed to the coordinator.
    pub messages_received: u64,
    /// Messages no rule matched.
    pub messages_unmatched: u64,
    /// Messages dropped because the payload was not UTF-8.
    pub messages_invalid_utf8: u64,
    /// Metric updates that reached the registry.
    pub updates_applied: u64,
    /// Per-rule updates dropped by extraction or the registry.
    pub updates_dropped: u64,
}

/// Outcome of a single message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestReport {
    /// Number of rules that matched the topic.
    pub matched: usize,
    /// Number of updates applied.
    pub applied: usize,
    /// Number of matching rules whose update was dropped.
    pub dropped: usize,
}

/// Routes messages through the rules into the registry.
pub struct IngestCoordinator {
    rules: RuleSet,
    registry: MetricRegistry,
    stats: RwLock<IngestStats>,
}

/// Create a shareable coordinator handle.
pub type SharedIngest = Arc<IngestCoordinator>;

impl IngestCoordinator {
    pub fn new(rules: RuleSet) -> Self {
        Self {
            rules,
            registry: MetricRegistry::new(),
            stats: RwLock::new(IngestStats::default()),
        }
    }

    /// Handle one message. Failures are per rule and never propagate.
    pub fn on_message(&self, topic: &str, payload: &[u8]) -> IngestReport {
        self.stats.write().messages_received += 1;

        let Ok(payload) = std::str::from_utf8(payload) else {
            self.stats.write().messages_invalid_utf8 += 1;
            debug!(topic, payload_len = payload.len(), "Dropping non-UTF-8 payload");
            return IngestReport::default();
        };

        let matches = self.rules.match_topic(topic);
        if matches.is_empty() {
            self.stats.write().messages_unmatched += 1;
            debug!(topic, "No rule matches topic");
            return IngestReport::default();
        }

        let mut report = IngestReport {
            matched: matches.len(),
            ..IngestReport::default()
        };

        for m in matches {
            let extraction = match extract(m.rule, payload, &m.bindings) {
                Ok(extraction) => extraction,
                Err(e) => {
                    debug!(
                        topic,
                        rule = %m.rule.subscribe(),
                        metric = %m.metric_name,
                        error = %e,
                        "Dropping update"
                    );
                    report.dropped += 1;
                    continue;
                }
            };

            let update = MetricUpdate {
                key: SeriesKey::new(m.metric_name.clone(), extraction.labels),
                observation: extraction.observation,
            };

            match self.registry.apply(update) {
                Ok(()) => {
                    trace!(topic, metric = %m.metric_name, "Update applied");
                    report.applied += 1;
                }
                Err(e) => {
                    debug!(
                        topic,
                        rule = %m.rule.subscribe(),
                        metric = %m.metric_name,
                        error = %e,
                        "Dropping update"
                    );
                    report.dropped += 1;
                }
            }
        }

        let mut stats = self.stats.write();
        stats.updates_applied += report.applied as u64;
        stats.updates_dropped += report.dropped as u64;

        report
    }

    /// The compiled rules.
    pub fn rules(&self) -> &RuleSet {
        &self.rules
    }

    /// The metric registry.
    pub fn registry(&self) -> &MetricRegistry {
        &self.registry
    }

    /// Get ingest statistics.
    pub fn stats(&self) -> IngestStats {
        self.stats.read().clone()
    }

    /// Render all series followed by the exporter's own metrics.
    pub fn render(&self) -> String {
        let mut output = self.registry.render().into_bytes();

        let stats = self.stats();
        writeln!(output).ok();
        writeln!(output, "# TYPE mqtt_exporter_series gauge").ok();
        writeln!(output, "mqtt_exporter_series {}", self.registry.series_count()).ok();

        for (name, value) in [
            ("messages_received", stats.messages_received),
            ("messages_unmatched", stats.messages_unmatched),
            ("messages_invalid_utf8", stats.messages_invalid_utf8),
            ("updates_applied", stats.updates_applied),
            ("updates_dropped", stats.updates_dropped),
        ] {
            writeln!(output, "# TYPE mqtt_exporter_{}_total counter", name).ok();
            writeln!(output, "mqtt_exporter_{}_total {}", name, value).ok();
        }

        String::from_utf8(output).unwrap_or_default()
    }
}
