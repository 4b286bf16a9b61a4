//! Compilation of `export` declarations into immutable, matchable rules.
//!
//! Everything that can be checked without seeing a message is checked here, so
//! a bad configuration refuses to start instead of failing per message.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use mqtt_exporter_common::topic::{PatternSegment, parse_pattern, to_filter};
use regex::Regex;
use thiserror::Error;

use crate::config::Subscription;
use crate::extract::JsonPath;
use crate::mapping::{
    MetricKind, RESERVED_PREFIX, derive_metric_name, enum_state_label, exposition_name,
    is_reserved_name, is_valid_label_name, is_valid_metric_name,
};

/// Static label value meaning "use the message payload".
pub const PAYLOAD_LABEL: &str = "payload";

/// Label carrying an info metric's text unless `info_name` says otherwise.
pub const DEFAULT_INFO_LABEL: &str = "value";

/// Errors raised while compiling subscription declarations.
#[derive(Debug, Error)]
pub enum RuleError {
    #[error(transparent)]
    Pattern(#[from] mqtt_exporter_common::Error),

    #[error("'{pattern}': '{label}' is not a valid label name")]
    InvalidLabelName { pattern: String, label: String },

    #[error("'{pattern}': label '{label}' is bound more than once")]
    DuplicateLabel { pattern: String, label: String },

    #[error("'{pattern}': label '{label}' cannot take the payload on a {kind} metric")]
    PayloadLabelNotAllowed {
        pattern: String,
        label: String,
        kind: MetricKind,
    },

    #[error("'{pattern}': enum metrics need at least one entry in enum_states")]
    EmptyEnumStates { pattern: String },

    #[error("'{pattern}': enum state '{state}' is listed twice")]
    DuplicateEnumState { pattern: String, state: String },

    #[error("'{pattern}': enum_states is only valid for enum metrics, not {kind}")]
    UnexpectedEnumStates { pattern: String, kind: MetricKind },

    #[error("'{pattern}': info_name is only valid for info metrics, not {kind}")]
    UnexpectedInfoName { pattern: String, kind: MetricKind },

    #[error(
        "'{pattern}': label '{label}' holding the enum state or info text collides with another label"
    )]
    StateLabelConflict { pattern: String, label: String },

    #[error("'{pattern}': invalid value_regex: {source}")]
    InvalidRegex {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("'{pattern}': value_regex must have exactly one capture group, found {groups}")]
    RegexGroups { pattern: String, groups: usize },

    #[error("'{pattern}': value_regex and value_json are mutually exclusive")]
    ConflictingSelectors { pattern: String },

    #[error("'{pattern}': invalid value_json path '{path}': {reason}")]
    InvalidJsonPath {
        pattern: String,
        path: String,
        reason: String,
    },

    #[error("'{pattern}': '{name}' is not a valid metric name")]
    InvalidMetricName { pattern: String, name: String },

    #[error(
        "'{pattern}': metric '{name}' uses the reserved prefix '{prefix}'",
        prefix = RESERVED_PREFIX
    )]
    ReservedMetricName { pattern: String, name: String },

    #[error("'{pattern}': no literal topic level to derive a metric name from, set metric_name")]
    UnnamedMetric { pattern: String },

    #[error(
        "metric '{name}' is declared as {first_kind} by '{first}' and as {second_kind} by '{second}'"
    )]
    KindConflict {
        name: String,
        first: String,
        first_kind: MetricKind,
        second: String,
        second_kind: MetricKind,
    },

    #[error("enum metric '{name}' has different states in '{first}' and '{second}'")]
    EnumStatesConflict {
        name: String,
        first: String,
        second: String,
    },
}

/// Where a static label gets its value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LabelSource {
    Literal(String),
    /// The (selected, trimmed) message payload.
    Payload,
}

/// How the value text is isolated from a payload.
#[derive(Debug, Clone)]
pub enum ValueSelector {
    Whole,
    /// The first capture group of a regex.
    Regex(Regex),
    /// A path into a JSON document.
    Json(JsonPath),
}

/// Metric kind together with the data that kind needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleKind {
    Gauge,
    Counter,
    Enum { states: Arc<[String]> },
    /// `label` carries the payload text.
    Info { label: Arc<str> },
}

impl RuleKind {
    pub fn metric_kind(&self) -> MetricKind {
        match self {
            RuleKind::Gauge => MetricKind::Gauge,
            RuleKind::Counter => MetricKind::Counter,
            RuleKind::Enum { .. } => MetricKind::Enum,
            RuleKind::Info { .. } => MetricKind::Info,
        }
    }
}

/// A compiled subscription.
#[derive(Debug, Clone)]
pub struct Rule {
    pub(crate) subscribe: String,
    pub(crate) pattern: Vec<PatternSegment>,
    pub(crate) filter: String,
    pub(crate) metric_name: Option<String>,
    pub(crate) kind: RuleKind,
    pub(crate) static_labels: Vec<(String, LabelSource)>,
    pub(crate) selector: ValueSelector,
}

impl Rule {
    /// Compile a single declaration.
    pub fn compile(sub: &Subscription) -> Result<Self, RuleError> {
        let subscribe = sub.subscribe.clone();
        let pattern = parse_pattern(&subscribe)?;

        let mut bound = BTreeSet::new();
        for segment in &pattern {
            if let PatternSegment::Single(label) = segment {
                if !is_valid_label_name(label) {
                    return Err(RuleError::InvalidLabelName {
                        pattern: subscribe,
                        label: label.clone(),
                    });
                }
                if !bound.insert(label.clone()) {
                    return Err(RuleError::DuplicateLabel {
                        pattern: subscribe,
                        label: label.clone(),
                    });
                }
            }
        }

        if sub.metric_type != MetricKind::Enum && !sub.enum_states.is_empty() {
            return Err(RuleError::UnexpectedEnumStates {
                pattern: subscribe,
                kind: sub.metric_type,
            });
        }
        if sub.metric_type != MetricKind::Info && sub.info_name.is_some() {
            return Err(RuleError::UnexpectedInfoName {
                pattern: subscribe,
                kind: sub.metric_type,
            });
        }

        let kind = match sub.metric_type {
            MetricKind::Gauge => RuleKind::Gauge,
            MetricKind::Counter => RuleKind::Counter,
            MetricKind::Enum => {
                if sub.enum_states.is_empty() {
                    return Err(RuleError::EmptyEnumStates { pattern: subscribe });
                }
                let mut seen = BTreeSet::new();
                for state in &sub.enum_states {
                    if !seen.insert(state.as_str()) {
                        return Err(RuleError::DuplicateEnumState {
                            pattern: subscribe,
                            state: state.clone(),
                        });
                    }
                }
                RuleKind::Enum {
                    states: sub.enum_states.iter().cloned().collect(),
                }
            }
            MetricKind::Info => {
                let label = sub.info_name.as_deref().unwrap_or(DEFAULT_INFO_LABEL);
                if !is_valid_label_name(label) {
                    return Err(RuleError::InvalidLabelName {
                        pattern: subscribe,
                        label: label.to_string(),
                    });
                }
                RuleKind::Info {
                    label: Arc::from(label),
                }
            }
        };

        let mut static_labels = Vec::with_capacity(sub.labels.len());
        for (label, value) in &sub.labels {
            if !is_valid_label_name(label) {
                return Err(RuleError::InvalidLabelName {
                    pattern: subscribe,
                    label: label.clone(),
                });
            }
            if !bound.insert(label.clone()) {
                return Err(RuleError::DuplicateLabel {
                    pattern: subscribe,
                    label: label.clone(),
                });
            }
            let source = if value == PAYLOAD_LABEL {
                if kind != RuleKind::Counter {
                    return Err(RuleError::PayloadLabelNotAllowed {
                        pattern: subscribe,
                        label: label.clone(),
                        kind: sub.metric_type,
                    });
                }
                LabelSource::Payload
            } else {
                LabelSource::Literal(value.clone())
            };
            static_labels.push((label.clone(), source));
        }

        if let RuleKind::Info { label } = &kind
            && bound.contains(label.as_ref())
        {
            return Err(RuleError::StateLabelConflict {
                pattern: subscribe,
                label: label.to_string(),
            });
        }

        if let Some(name) = sub
            .metric_name
            .as_ref()
            .filter(|name| !is_valid_metric_name(name))
        {
            return Err(RuleError::InvalidMetricName {
                pattern: subscribe,
                name: name.clone(),
            });
        }

        let has_named_level = pattern.iter().any(|s| match s {
            PatternSegment::Literal(text) => text.chars().any(|c| c.is_ascii_alphanumeric()),
            _ => false,
        });
        if sub.metric_name.is_none() && !has_named_level {
            return Err(RuleError::UnnamedMetric { pattern: subscribe });
        }

        let selector = match (&sub.value_regex, &sub.value_json) {
            (Some(_), Some(_)) => {
                return Err(RuleError::ConflictingSelectors { pattern: subscribe });
            }
            (Some(expr), None) => {
                // Matches are anchored at the start of the payload
                let regex = Regex::new(&format!("^(?:{})", expr)).map_err(|source| {
                    RuleError::InvalidRegex {
                        pattern: subscribe.clone(),
                        source,
                    }
                })?;
                // captures_len counts the implicit whole-match group
                let groups = regex.captures_len() - 1;
                if groups != 1 {
                    return Err(RuleError::RegexGroups {
                        pattern: subscribe,
                        groups,
                    });
                }
                ValueSelector::Regex(regex)
            }
            (None, Some(path)) => {
                let json = JsonPath::parse(path).map_err(|reason| RuleError::InvalidJsonPath {
                    pattern: subscribe.clone(),
                    path: path.clone(),
                    reason,
                })?;
                ValueSelector::Json(json)
            }
            (None, None) => ValueSelector::Whole,
        };

        let filter = to_filter(&pattern);

        Ok(Self {
            subscribe,
            pattern,
            filter,
            metric_name: sub.metric_name.clone(),
            kind,
            static_labels,
            selector,
        })
    }

    /// The pattern as written in the configuration.
    pub fn subscribe(&self) -> &str {
        &self.subscribe
    }

    /// The MQTT filter to subscribe with (label names stripped).
    pub fn filter(&self) -> &str {
        &self.filter
    }

    pub fn pattern(&self) -> &[PatternSegment] {
        &self.pattern
    }

    pub fn kind(&self) -> &RuleKind {
        &self.kind
    }

    pub fn metric_kind(&self) -> MetricKind {
        self.kind.metric_kind()
    }

    pub fn metric_name_override(&self) -> Option<&str> {
        self.metric_name.as_deref()
    }

    pub fn static_labels(&self) -> &[(String, LabelSource)] {
        &self.static_labels
    }

    pub fn selector(&self) -> &ValueSelector {
        &self.selector
    }

    /// Whether the pattern ends in `#`.
    pub fn is_multi_level(&self) -> bool {
        matches!(self.pattern.last(), Some(PatternSegment::Multi))
    }

    /// Labels this rule always produces, wildcard and static.
    pub fn label_names(&self) -> impl Iterator<Item = &str> {
        self.pattern
            .iter()
            .filter_map(|s| match s {
                PatternSegment::Single(label) => Some(label.as_str()),
                _ => None,
            })
            .chain(self.static_labels.iter().map(|(label, _)| label.as_str()))
    }

    /// The metric name when it does not depend on the incoming topic.
    ///
    /// That is the case with an explicit name, or when the pattern has no `#`.
    pub fn static_metric_name(&self, prefix: &str) -> Option<String> {
        if let Some(name) = &self.metric_name {
            return Some(name.clone());
        }
        if self.is_multi_level() {
            return None;
        }
        let literals = self.pattern.iter().filter_map(|s| match s {
            PatternSegment::Literal(text) => Some(text.as_str()),
            _ => None,
        });
        Some(derive_metric_name(prefix, literals))
    }
}

/// Compiled rules in declaration order.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    pub(crate) rules: Vec<Rule>,
    pub(crate) prefix: String,
}

impl RuleSet {
    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Namespace token for derived metric names.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Distinct MQTT filters to subscribe to, in declaration order.
    pub fn subscription_filters(&self) -> Vec<String> {
        let mut seen = BTreeSet::new();
        self.rules
            .iter()
            .filter(|r| seen.insert(r.filter()))
            .map(|r| r.filter().to_string())
            .collect()
    }
}

/// Compile every declaration, then cross-check rules that share a metric name.
pub fn compile(subscriptions: &[Subscription], prefix: &str) -> Result<RuleSet, RuleError> {
    let rules = subscriptions
        .iter()
        .map(Rule::compile)
        .collect::<Result<Vec<_>, _>>()?;

    let mut by_name: HashMap<String, &Rule> = HashMap::new();
    for rule in &rules {
        let Some(name) = rule.static_metric_name(prefix) else {
            continue;
        };
        let name = exposition_name(&name, rule.metric_kind());

        if is_reserved_name(&name) {
            return Err(RuleError::ReservedMetricName {
                pattern: rule.subscribe.clone(),
                name,
            });
        }

        if let RuleKind::Enum { .. } = rule.kind {
            let state_label = enum_state_label(&name);
            if rule.label_names().any(|l| l == state_label) {
                return Err(RuleError::StateLabelConflict {
                    pattern: rule.subscribe.clone(),
                    label: state_label,
                });
            }
        }

        match by_name.get(&name) {
            Some(first) if first.metric_kind() != rule.metric_kind() => {
                return Err(RuleError::KindConflict {
                    name,
                    first: first.subscribe.clone(),
                    first_kind: first.metric_kind(),
                    second: rule.subscribe.clone(),
                    second_kind: rule.metric_kind(),
                });
            }
            Some(first) if rule.metric_kind() == MetricKind::Enum && first.kind != rule.kind => {
                return Err(RuleError::EnumStatesConflict {
                    name,
                    first: first.subscribe.clone(),
                    second: rule.subscribe.clone(),
                });
            }
            Some(_) => {}
            None => {
                by_name.insert(name, rule);
            }
        }
    }

    Ok(RuleSet {
        rules,
        prefix: prefix.to_string(),
    })
}
