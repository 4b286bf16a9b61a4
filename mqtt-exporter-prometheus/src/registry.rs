//! Metric registry that owns every live series and renders them.

use std::collections::BTreeMap;
use std::io::Write;
use std::sync::Arc;

use parking_lot::RwLock;
use thiserror::Error;
use tracing::trace;

use crate::extract::Observation;
use crate::mapping::{Labels, MetricKind, enum_state_label, exposition_name, is_reserved_name};

/// Why an update could not be applied.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("metric '{name}' already exists as {existing}, refusing a {update} update")]
    KindMismatch {
        name: String,
        existing: MetricKind,
        update: MetricKind,
    },

    #[error("enum series of '{name}' was created with different states")]
    EnumStatesMismatch { name: String },

    #[error("label '{label}' of '{name}' collides with the enum state or info label")]
    StateLabelConflict { name: String, label: String },

    #[error("metric '{name}' is in the exporter's own namespace")]
    ReservedName { name: String },
}

/// A unique identifier for a metric time series.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SeriesKey {
    /// The metric (family) name, before any `_total`/`_info` suffix.
    pub name: String,
    /// Label key-value pairs sorted by key.
    pub labels: Vec<(String, String)>,
}

impl SeriesKey {
    /// Create a series key; labels come out sorted by name.
    pub fn new(name: impl Into<String>, labels: Labels) -> Self {
        Self {
            name: name.into(),
            labels: labels.into_iter().collect(),
        }
    }

    /// Format labels for Prometheus exposition format.
    pub fn format_labels(&self) -> String {
        format_labels(&self.labels)
    }
}

/// One update: which series, and what happened to it.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricUpdate {
    pub key: SeriesKey,
    pub observation: Observation,
}

impl MetricUpdate {
    pub fn kind(&self) -> MetricKind {
        match self.observation {
            Observation::Gauge(_) => MetricKind::Gauge,
            Observation::Counter(_) => MetricKind::Counter,
            Observation::Enum { .. } => MetricKind::Enum,
            Observation::Info { .. } => MetricKind::Info,
        }
    }
}

/// The stored state of one series.
#[derive(Debug, Clone, PartialEq)]
pub enum SeriesValue {
    /// Last observed value.
    Gauge(f64),
    /// Running total.
    Counter(f64),
    /// Exactly one of `states` is active.
    Enum { states: Arc<[String]>, active: usize },
    /// Latest text, exposed as `label` on a constant 1.
    Info { label: Arc<str>, value: String },
}

impl SeriesValue {
    fn kind(&self) -> MetricKind {
        match self {
            SeriesValue::Gauge(_) => MetricKind::Gauge,
            SeriesValue::Counter(_) => MetricKind::Counter,
            SeriesValue::Enum { .. } => MetricKind::Enum,
            SeriesValue::Info { .. } => MetricKind::Info,
        }
    }
}

impl SeriesValue {
    /// Per-state values of an enum series in declared order; empty otherwise.
    pub fn enum_values(&self) -> Vec<(&str, f64)> {
        match self {
            SeriesValue::Enum { states, active } => states
                .iter()
                .enumerate()
                .map(|(i, s)| (s.as_str(), if i == *active { 1.0 } else { 0.0 }))
                .collect(),
            _ => Vec::new(),
        }
    }
}

/// All series sharing a metric name.
#[derive(Debug, Clone)]
struct Family {
    kind: MetricKind,
    series: BTreeMap<Vec<(String, String)>, SeriesValue>,
}

/// Thread-safe store of every exported series.
///
/// A single lock guards all families: writers are serialized, and a render
/// sees one consistent snapshot. Families are keyed by their exposed name
/// (see [`exposition_name`]), which is also the name lookups take.
#[derive(Debug, Default)]
pub struct MetricRegistry {
    families: RwLock<BTreeMap<String, Family>>,
}

impl MetricRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply an update, creating the series on first observation.
    pub fn apply(&self, update: MetricUpdate) -> Result<(), RegistryError> {
        let kind = update.kind();
        let MetricUpdate { key, observation } = update;
        let name = exposition_name(&key.name, kind);

        if is_reserved_name(&name) {
            return Err(RegistryError::ReservedName { name });
        }

        let extra_label = match &observation {
            Observation::Enum { .. } => Some(enum_state_label(&name)),
            Observation::Info { label, .. } => Some(label.to_string()),
            Observation::Gauge(_) | Observation::Counter(_) => None,
        };
        if let Some(label) = extra_label
            && key.labels.iter().any(|(k, _)| *k == label)
        {
            return Err(RegistryError::StateLabelConflict { name, label });
        }

        let mut families = self.families.write();
        let family = families.entry(name.clone()).or_insert_with(|| Family {
            kind,
            series: BTreeMap::new(),
        });

        if family.kind != kind {
            return Err(RegistryError::KindMismatch {
                name,
                existing: family.kind,
                update: kind,
            });
        }

        match (family.series.get_mut(&key.labels), observation) {
            (Some(SeriesValue::Gauge(value)), Observation::Gauge(v)) => *value = v,
            (Some(SeriesValue::Counter(total)), Observation::Counter(v)) => *total += v,
            (
                Some(SeriesValue::Enum { states, active }),
                Observation::Enum {
                    states: new_states,
                    active: new_active,
                },
            ) => {
                if *states != new_states {
                    return Err(RegistryError::EnumStatesMismatch { name });
                }
                *active = new_active;
            }
            (
                Some(SeriesValue::Info { label, value }),
                Observation::Info {
                    label: new_label,
                    value: new_value,
                },
            ) => {
                *label = new_label;
                *value = new_value;
            }
            (Some(existing), _) => {
                return Err(RegistryError::KindMismatch {
                    name,
                    existing: existing.kind(),
                    update: kind,
                });
            }
            (None, observation) => {
                let value = match observation {
                    Observation::Gauge(v) => SeriesValue::Gauge(v),
                    Observation::Counter(v) => SeriesValue::Counter(v),
                    Observation::Enum { states, active } => SeriesValue::Enum { states, active },
                    Observation::Info { label, value } => SeriesValue::Info { label, value },
                };
                family.series.insert(key.labels.clone(), value);
            }
        }

        trace!(metric = %name, labels = %key.format_labels(), "Applied update");
        Ok(())
    }

    /// Snapshot of one series; `key.name` is the exposed name.
    pub fn get(&self, key: &SeriesKey) -> Option<SeriesValue> {
        self.families
            .read()
            .get(&key.name)
            .and_then(|f| f.series.get(&key.labels))
            .cloned()
    }

    /// Kind of the family exposed as `name`.
    pub fn kind_of(&self, name: &str) -> Option<MetricKind> {
        self.families.read().get(name).map(|f| f.kind)
    }

    /// Get the current number of stored series.
    pub fn series_count(&self) -> usize {
        self.families.read().values().map(|f| f.series.len()).sum()
    }

    /// Get the current number of metric names.
    pub fn family_count(&self) -> usize {
        self.families.read().len()
    }

    /// Render metrics in Prometheus exposition format.
    ///
    /// Families come out sorted by name and series by label set, so repeated
    /// scrapes of unchanged state are byte-identical.
    pub fn render(&self) -> String {
        let families = self.families.read();
        let mut output = Vec::with_capacity(families.len() * 100);

        for (exposed, family) in families.iter() {
            writeln!(
                output,
                "# TYPE {} {}",
                exposed,
                family.kind.exposition_type()
            )
            .ok();

            for (labels, value) in &family.series {
                match value {
                    SeriesValue::Gauge(v) | SeriesValue::Counter(v) => {
                        writeln!(output, "{}{} {}", exposed, format_labels(labels), format_value(*v))
                            .ok();
                    }
                    SeriesValue::Info { label, value } => {
                        let mut with_text = labels.clone();
                        with_text.push((label.to_string(), value.clone()));
                        with_text.sort_by(|a, b| a.0.cmp(&b.0));
                        writeln!(output, "{}{} 1", exposed, format_labels(&with_text)).ok();
                    }
                    SeriesValue::Enum { .. } => {
                        let state_label = enum_state_label(exposed);
                        for (state, v) in value.enum_values() {
                            let mut with_state = labels.clone();
                            with_state.push((state_label.clone(), state.to_string()));
                            with_state.sort_by(|a, b| a.0.cmp(&b.0));
                            writeln!(
                                output,
                                "{}{} {}",
                                exposed,
                                format_labels(&with_state),
                                format_value(v)
                            )
                            .ok();
                        }
                    }
                }
            }
        }

        String::from_utf8(output).unwrap_or_default()
    }
}

/// Escape special characters in label values.
fn escape_label_value(value: &str) -> String {
    let mut result = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => result.push_str("\\\\"),
            '"' => result.push_str("\\\""),
            '\n' => result.push_str("\\n"),
            _ => result.push(c),
        }
    }
    result
}

/// Format a floating point value for Prometheus.
pub(crate) fn format_value(value: f64) -> String {
    if value.is_nan() {
        "NaN".to_string()
    } else if value.is_infinite() {
        if value.is_sign_positive() {
            "+Inf".to_string()
        } else {
            "-Inf".to_string()
        }
    } else if value.fract() == 0.0 {
        format!("{:.0}", value)
    } else {
        format!("{}", value)
    }
}

/// Format labels for Prometheus exposition format.
fn format_labels(labels: &[(String, String)]) -> String {
    if labels.is_empty() {
        return String::new();
    }

    let parts: Vec<String> = labels
        .iter()
        .map(|(k, v)| format!("{}=\"{}\"", k, escape_label_value(v)))
        .collect();

    format!("{{{}}}", parts.join(","))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> Labels {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn gauge(name: &str, l: &[(&str, &str)], v: f64) -> MetricUpdate {
        MetricUpdate {
            key: SeriesKey::new(name, labels(l)),
            observation: Observation::Gauge(v),
        }
    }

    fn counter(name: &str, l: &[(&str, &str)]) -> MetricUpdate {
        MetricUpdate {
            key: SeriesKey::new(name, labels(l)),
            observation: Observation::Counter(1.0),
        }
    }

    fn state(name: &str, states: &Arc<[String]>, active: usize) -> MetricUpdate {
        MetricUpdate {
            key: SeriesKey::new(name, Labels::new()),
            observation: Observation::Enum {
                states: Arc::clone(states),
                active,
            },
        }
    }

    fn open_closed() -> Arc<[String]> {
        vec!["open".to_string(), "closed".to_string()].into()
    }

    #[test]
    fn test_series_key_sorted_labels() {
        let key = SeriesKey::new("m", labels(&[("b", "2"), ("a", "1")]));
        assert_eq!(key.format_labels(), "{a=\"1\",b=\"2\"}");
    }

    #[test]
    fn test_gauge_overwrites() {
        let registry = MetricRegistry::new();
        registry.apply(gauge("temp", &[], 19.0)).unwrap();
        registry.apply(gauge("temp", &[], 21.5)).unwrap();

        assert_eq!(
            registry.get(&SeriesKey::new("temp", Labels::new())),
            Some(SeriesValue::Gauge(21.5))
        );
        assert_eq!(registry.series_count(), 1);
    }

    #[test]
    fn test_counter_accumulates() {
        let registry = MetricRegistry::new();
        for _ in 0..5 {
            registry.apply(counter("sales", &[("product", "Mate")])).unwrap();
        }
        registry.apply(counter("sales", &[("product", "Tosti")])).unwrap();

        assert_eq!(
            registry.get(&SeriesKey::new("sales_total", labels(&[("product", "Mate")]))),
            Some(SeriesValue::Counter(5.0))
        );
        assert_eq!(registry.series_count(), 2);
        assert_eq!(registry.family_count(), 1);
    }

    #[test]
    fn test_enum_exclusive_state() {
        let registry = MetricRegistry::new();
        let states = open_closed();

        for active in [0, 1, 1, 0] {
            registry.apply(state("space_state", &states, active)).unwrap();
            let value = registry
                .get(&SeriesKey::new("space_state", Labels::new()))
                .unwrap();
            let values = value.enum_values();
            assert_eq!(values.iter().filter(|(_, v)| *v == 1.0).count(), 1);
            assert_eq!(values[active].1, 1.0);
        }
    }

    #[test]
    fn test_kind_mismatch_rejected() {
        let registry = MetricRegistry::new();
        registry.apply(gauge("bitlair_door_total", &[], 1.0)).unwrap();

        let err = registry.apply(counter("bitlair_door", &[])).unwrap_err();
        assert_eq!(
            err,
            RegistryError::KindMismatch {
                name: "bitlair_door_total".to_string(),
                existing: MetricKind::Gauge,
                update: MetricKind::Counter,
            }
        );
        assert_eq!(
            registry.get(&SeriesKey::new("bitlair_door_total", Labels::new())),
            Some(SeriesValue::Gauge(1.0))
        );
        assert_eq!(registry.kind_of("bitlair_door_total"), Some(MetricKind::Gauge));
        assert_eq!(registry.render().matches("# TYPE").count(), 1);
    }

    #[test]
    fn test_counters_with_and_without_suffix_share_family() {
        let registry = MetricRegistry::new();
        registry.apply(counter("hits", &[])).unwrap();
        registry.apply(counter("hits_total", &[])).unwrap();

        assert_eq!(registry.family_count(), 1);
        assert_eq!(
            registry.render(),
            "# TYPE hits_total counter\nhits_total 2\n"
        );
    }

    #[test]
    fn test_reserved_name_rejected() {
        let registry = MetricRegistry::new();

        assert_eq!(
            registry.apply(gauge("mqtt_exporter_series", &[], 1.0)),
            Err(RegistryError::ReservedName {
                name: "mqtt_exporter_series".to_string()
            })
        );
        assert!(matches!(
            registry.apply(counter("mqtt_exporter_messages_received", &[])),
            Err(RegistryError::ReservedName { .. })
        ));
        assert_eq!(registry.family_count(), 0);
    }

    fn info(name: &str, l: &[(&str, &str)], text: &str) -> MetricUpdate {
        MetricUpdate {
            key: SeriesKey::new(name, labels(l)),
            observation: Observation::Info {
                label: Arc::from("value"),
                value: text.to_string(),
            },
        }
    }

    #[test]
    fn test_info_keeps_latest_text() {
        let registry = MetricRegistry::new();
        registry.apply(info("sensors_version", &[("location", "foo")], "asdf")).unwrap();
        registry.apply(info("sensors_version", &[("location", "foo")], "qwer")).unwrap();

        assert_eq!(registry.series_count(), 1);
        assert_eq!(registry.kind_of("sensors_version_info"), Some(MetricKind::Info));
        assert_eq!(
            registry.render(),
            "# TYPE sensors_version_info gauge\n\
             sensors_version_info{location=\"foo\",value=\"qwer\"} 1\n"
        );
    }

    #[test]
    fn test_info_label_conflict() {
        let registry = MetricRegistry::new();
        assert!(matches!(
            registry.apply(info("build", &[("value", "x")], "1.0")),
            Err(RegistryError::StateLabelConflict { .. })
        ));
        assert_eq!(registry.series_count(), 0);
    }

    #[test]
    fn test_enum_states_mismatch_rejected() {
        let registry = MetricRegistry::new();
        registry.apply(state("s", &open_closed(), 0)).unwrap();

        let other: Arc<[String]> = vec!["on".to_string(), "off".to_string()].into();
        assert!(matches!(
            registry.apply(state("s", &other, 1)),
            Err(RegistryError::EnumStatesMismatch { .. })
        ));
    }

    #[test]
    fn test_enum_state_label_conflict() {
        let registry = MetricRegistry::new();
        let update = MetricUpdate {
            key: SeriesKey::new("s", labels(&[("s", "x")])),
            observation: Observation::Enum {
                states: open_closed(),
                active: 0,
            },
        };
        assert!(matches!(
            registry.apply(update),
            Err(RegistryError::StateLabelConflict { .. })
        ));
        assert_eq!(registry.series_count(), 0);
    }

    #[test]
    fn test_render_format() {
        let registry = MetricRegistry::new();
        registry
            .apply(gauge("bitlair_climate_temperature", &[("location", "Hoofdruimte")], 19.0))
            .unwrap();
        registry.apply(counter("bitlair_pos_product", &[("product", "Mate")])).unwrap();
        registry.apply(state("bitlair_state", &open_closed(), 0)).unwrap();
        registry.apply(gauge("bitlair_power", &[], 3.5)).unwrap();

        let expected = "\
# TYPE bitlair_climate_temperature gauge
bitlair_climate_temperature{location=\"Hoofdruimte\"} 19
# TYPE bitlair_pos_product_total counter
bitlair_pos_product_total{product=\"Mate\"} 1
# TYPE bitlair_power gauge
bitlair_power 3.5
# TYPE bitlair_state gauge
bitlair_state{bitlair_state=\"open\"} 1
bitlair_state{bitlair_state=\"closed\"} 0
";
        assert_eq!(registry.render(), expected);
    }

    #[test]
    fn test_render_is_deterministic() {
        let registry = MetricRegistry::new();
        for room in ["zolder", "hal", "keuken", "bar"] {
            registry.apply(gauge("temp", &[("room", room)], 20.0)).unwrap();
        }

        let first = registry.render();
        assert_eq!(first, registry.render());

        let rooms: Vec<&str> = first
            .lines()
            .filter(|l| !l.starts_with('#'))
            .map(|l| l.split('"').nth(1).unwrap())
            .collect();
        assert_eq!(rooms, vec!["bar", "hal", "keuken", "zolder"]);
    }

    #[test]
    fn test_render_enum_labels_sorted() {
        let registry = MetricRegistry::new();
        let update = MetricUpdate {
            key: SeriesKey::new("door", labels(&[("z_room", "hal"), ("a_site", "hq")])),
            observation: Observation::Enum {
                states: open_closed(),
                active: 1,
            },
        };
        registry.apply(update).unwrap();

        let output = registry.render();
        assert!(output.contains("door{a_site=\"hq\",door=\"open\",z_room=\"hal\"} 0"));
        assert!(output.contains("door{a_site=\"hq\",door=\"closed\",z_room=\"hal\"} 1"));
    }

    #[test]
    fn test_render_empty() {
        assert_eq!(MetricRegistry::new().render(), "");
    }

    #[test]
    fn test_escape_label_value() {
        assert_eq!(escape_label_value("simple"), "simple");
        assert_eq!(escape_label_value("with\"quote"), "with\\\"quote");
        assert_eq!(escape_label_value("with\\backslash"), "with\\\\backslash");
        assert_eq!(escape_label_value("with\nnewline"), "with\\nnewline");
    }

    #[test]
    fn test_format_value() {
        assert_eq!(format_value(42.0), "42");
        assert_eq!(format_value(1733278.79954734), "1733278.79954734");
        assert_eq!(format_value(f64::NAN), "NaN");
        assert_eq!(format_value(f64::INFINITY), "+Inf");
        assert_eq!(format_value(f64::NEG_INFINITY), "-Inf");
    }
}
