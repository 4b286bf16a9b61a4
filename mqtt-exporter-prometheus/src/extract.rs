//! Turning a matched payload into an observation and its labels.

use std::borrow::Cow;
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;

use crate::mapping::Labels;
use crate::rule::{LabelSource, Rule, RuleKind, ValueSelector};

/// Why a payload could not be turned into an observation.
///
/// These only ever drop the offending message.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ExtractionError {
    #[error("value_regex did not match the payload")]
    NoRegexMatch,

    #[error("payload is not valid JSON: {0}")]
    InvalidJson(String),

    #[error("JSON path '{0}' not found in payload")]
    JsonPathMissing(String),

    #[error("JSON path '{0}' does not point at a number, string or bool")]
    JsonNotScalar(String),

    #[error("'{0}' is not a number")]
    NotNumeric(String),

    #[error("'{0}' is not a declared enum state")]
    UnknownEnumState(String),
}

/// The value part of an update.
#[derive(Debug, Clone, PartialEq)]
pub enum Observation {
    /// Replaces the stored value.
    Gauge(f64),
    /// Added to the stored total.
    Counter(f64),
    /// Index into `states` of the state that becomes active.
    Enum { states: Arc<[String]>, active: usize },
    /// Text exposed under `label`, replacing the previous text.
    Info { label: Arc<str>, value: String },
}

/// The result of extracting a payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Extraction {
    pub observation: Observation,
    pub labels: Labels,
}

/// Extract an observation from `payload` under `rule`.
///
/// Labels are the wildcard `bindings` plus the rule's static labels.
pub fn extract(rule: &Rule, payload: &str, bindings: &Labels) -> Result<Extraction, ExtractionError> {
    let selected = select(rule.selector(), payload)?;

    let mut labels = bindings.clone();
    for (label, source) in rule.static_labels() {
        let value = match source {
            LabelSource::Literal(value) => value.clone(),
            LabelSource::Payload => selected.trim().to_string(),
        };
        labels.insert(label.clone(), value);
    }

    let observation = match rule.kind() {
        RuleKind::Gauge => Observation::Gauge(parse_number(&selected)?),
        RuleKind::Counter => Observation::Counter(1.0),
        RuleKind::Enum { states } => {
            let state = selected.trim();
            let active = states
                .iter()
                .position(|s| s == state)
                .ok_or_else(|| ExtractionError::UnknownEnumState(state.to_string()))?;
            Observation::Enum {
                states: Arc::clone(states),
                active,
            }
        }
        RuleKind::Info { label } => Observation::Info {
            label: Arc::clone(label),
            value: selected.trim().to_string(),
        },
    };

    Ok(Extraction {
        observation,
        labels,
    })
}

/// Apply a selector, yielding the text the value is read from.
fn select<'p>(selector: &ValueSelector, payload: &'p str) -> Result<Cow<'p, str>, ExtractionError> {
    match selector {
        ValueSelector::Whole => Ok(Cow::Borrowed(payload)),
        ValueSelector::Regex(regex) => regex
            .captures(payload)
            .and_then(|caps| caps.get(1))
            .map(|m| Cow::Borrowed(m.as_str()))
            .ok_or(ExtractionError::NoRegexMatch),
        ValueSelector::Json(path) => path.select(payload).map(Cow::Owned),
    }
}

/// Parse the first whitespace-separated token as a float.
fn parse_number(text: &str) -> Result<f64, ExtractionError> {
    let token = text
        .split_whitespace()
        .next()
        .ok_or_else(|| ExtractionError::NotNumeric(text.to_string()))?;
    token
        .parse::<f64>()
        .map_err(|_| ExtractionError::NotNumeric(token.to_string()))
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum JsonStep {
    Key(String),
    Index(usize),
}

/// A jq-style path such as `.apower`, `.sensors[0].value` or `.`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JsonPath {
    source: String,
    steps: Vec<JsonStep>,
}

impl JsonPath {
    /// Parse a path. Keys may hold letters, digits, `_` and `-`.
    pub fn parse(path: &str) -> Result<Self, String> {
        let rest = path
            .strip_prefix('.')
            .ok_or_else(|| "path must start with '.'".to_string())?;

        let mut steps = Vec::new();
        if !rest.is_empty() {
            for part in rest.split('.') {
                let (key, mut indices) = match part.find('[') {
                    Some(pos) => (&part[..pos], &part[pos..]),
                    None => (part, ""),
                };

                if !key.is_empty() {
                    if !key
                        .chars()
                        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
                    {
                        return Err(format!("invalid key '{}'", key));
                    }
                    steps.push(JsonStep::Key(key.to_string()));
                } else if indices.is_empty() {
                    return Err("empty path component".to_string());
                }

                while !indices.is_empty() {
                    let close = indices
                        .find(']')
                        .ok_or_else(|| format!("unclosed '[' in '{}'", part))?;
                    let index = indices[1..close]
                        .parse::<usize>()
                        .map_err(|_| format!("invalid index in '{}'", part))?;
                    steps.push(JsonStep::Index(index));
                    indices = &indices[close + 1..];
                    if !indices.is_empty() && !indices.starts_with('[') {
                        return Err(format!("unexpected text after index in '{}'", part));
                    }
                }
            }
        }

        Ok(Self {
            source: path.to_string(),
            steps,
        })
    }

    /// Resolve the path in a JSON payload to its scalar text.
    pub fn select(&self, payload: &str) -> Result<String, ExtractionError> {
        let document: Value = serde_json::from_str(payload)
            .map_err(|e| ExtractionError::InvalidJson(e.to_string()))?;

        let mut current = &document;
        for step in &self.steps {
            let next = match step {
                JsonStep::Key(key) => current.get(key.as_str()),
                JsonStep::Index(index) => current.get(*index),
            };
            current = next.ok_or_else(|| ExtractionError::JsonPathMissing(self.source.clone()))?;
        }

        match current {
            Value::Number(n) => Ok(n.to_string()),
            Value::String(s) => Ok(s.clone()),
            Value::Bool(b) => Ok(if *b { "1" } else { "0" }.to_string()),
            _ => Err(ExtractionError::JsonNotScalar(self.source.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Subscription;
    use crate::mapping::MetricKind;

    fn rule(sub: Subscription) -> Rule {
        Rule::compile(&sub).unwrap()
    }

    fn no_labels() -> Labels {
        Labels::new()
    }

    #[test]
    fn test_gauge_first_token() {
        let r = rule(Subscription::new("bitlair/climate/+location/#"));
        let mut bindings = Labels::new();
        bindings.insert("location".to_string(), "Hoofdruimte".to_string());

        let result = extract(&r, "19 °C", &bindings).unwrap();

        assert_eq!(result.observation, Observation::Gauge(19.0));
        assert_eq!(result.labels, bindings);
    }

    #[test]
    fn test_gauge_leading_whitespace_and_floats() {
        let r = rule(Subscription::new("a/b"));
        assert_eq!(
            extract(&r, "  -3.25\n", &no_labels()).unwrap().observation,
            Observation::Gauge(-3.25)
        );
        assert_eq!(
            extract(&r, "1e3", &no_labels()).unwrap().observation,
            Observation::Gauge(1000.0)
        );
    }

    #[test]
    fn test_gauge_not_numeric() {
        let r = rule(Subscription::new("a/b"));
        assert_eq!(
            extract(&r, "open", &no_labels()),
            Err(ExtractionError::NotNumeric("open".to_string()))
        );
        assert!(matches!(
            extract(&r, "   ", &no_labels()),
            Err(ExtractionError::NotNumeric(_))
        ));
    }

    #[test]
    fn test_gauge_regex() {
        let r = rule(Subscription {
            value_regex: Some("^.+:(.+):.+".to_string()),
            ..Subscription::new("bitlair/snmp/tx")
        });
        assert_eq!(
            extract(&r, "1695557017:720167:29751", &no_labels())
                .unwrap()
                .observation,
            Observation::Gauge(720167.0)
        );
    }

    #[test]
    fn test_gauge_regex_no_match() {
        let r = rule(Subscription {
            value_regex: Some("^(\\d+):".to_string()),
            ..Subscription::new("a/b")
        });
        assert_eq!(
            extract(&r, "no colon here", &no_labels()),
            Err(ExtractionError::NoRegexMatch)
        );
    }

    #[test]
    fn test_gauge_regex_matches_from_start_only() {
        let r = rule(Subscription {
            value_regex: Some("(\\d+)".to_string()),
            ..Subscription::new("a/b")
        });
        assert_eq!(
            extract(&r, "42 C", &no_labels()).unwrap().observation,
            Observation::Gauge(42.0)
        );
        assert_eq!(
            extract(&r, "temp 42", &no_labels()),
            Err(ExtractionError::NoRegexMatch)
        );
    }

    #[test]
    fn test_gauge_json() {
        let r = rule(Subscription {
            value_json: Some(".apower".to_string()),
            ..Subscription::new("bitlair/power/shelly")
        });
        assert_eq!(
            extract(&r, r#"{"apower": 1337.0}"#, &no_labels())
                .unwrap()
                .observation,
            Observation::Gauge(1337.0)
        );
        assert_eq!(
            extract(&r, r#"{"voltage": 230}"#, &no_labels()),
            Err(ExtractionError::JsonPathMissing(".apower".to_string()))
        );
        assert!(matches!(
            extract(&r, "1337", &no_labels()),
            Err(ExtractionError::JsonPathMissing(_))
        ));
        assert!(matches!(
            extract(&r, "{not json", &no_labels()),
            Err(ExtractionError::InvalidJson(_))
        ));
    }

    #[test]
    fn test_counter_payload_label() {
        let mut sub = Subscription {
            metric_type: MetricKind::Counter,
            ..Subscription::new("bitlair/pos/product")
        };
        sub.labels
            .insert("product".to_string(), "payload".to_string());
        sub.labels.insert("site".to_string(), "hq".to_string());
        let r = rule(sub);

        let result = extract(&r, " Club-Mate Winter Edition\n", &no_labels()).unwrap();

        assert_eq!(result.observation, Observation::Counter(1.0));
        assert_eq!(result.labels["product"], "Club-Mate Winter Edition");
        assert_eq!(result.labels["site"], "hq");
    }

    #[test]
    fn test_counter_ignores_payload_value() {
        let r = rule(Subscription {
            metric_type: MetricKind::Counter,
            ..Subscription::new("bitlair/doorbell")
        });
        assert_eq!(
            extract(&r, "not a number", &no_labels())
                .unwrap()
                .observation,
            Observation::Counter(1.0)
        );
    }

    #[test]
    fn test_enum_state() {
        let r = rule(Subscription {
            metric_type: MetricKind::Enum,
            enum_states: vec!["open".to_string(), "closed".to_string()],
            ..Subscription::new("bitlair/state")
        });

        match extract(&r, "closed\n", &no_labels()).unwrap().observation {
            Observation::Enum { states, active } => {
                assert_eq!(states.len(), 2);
                assert_eq!(active, 1);
            }
            other => panic!("unexpected observation {:?}", other),
        }

        assert_eq!(
            extract(&r, "ajar", &no_labels()),
            Err(ExtractionError::UnknownEnumState("ajar".to_string()))
        );
        assert!(extract(&r, "Open", &no_labels()).is_err());
    }

    #[test]
    fn test_info_text() {
        let r = rule(Subscription {
            metric_type: MetricKind::Info,
            ..Subscription::new("sensors/+location/version")
        });
        let mut bindings = Labels::new();
        bindings.insert("location".to_string(), "foo".to_string());

        for version in ["asdf", "qwer"] {
            let result = extract(&r, version, &bindings).unwrap();
            assert_eq!(
                result.observation,
                Observation::Info {
                    label: Arc::from("value"),
                    value: version.to_string(),
                }
            );
            assert_eq!(result.labels, bindings);
        }
    }

    #[test]
    fn test_json_path_parse() {
        assert!(JsonPath::parse(".").unwrap().steps.is_empty());
        assert_eq!(
            JsonPath::parse(".a.b[0][2]").unwrap().steps,
            vec![
                JsonStep::Key("a".to_string()),
                JsonStep::Key("b".to_string()),
                JsonStep::Index(0),
                JsonStep::Index(2),
            ]
        );
        assert_eq!(
            JsonPath::parse(".[1]").unwrap().steps,
            vec![JsonStep::Index(1)]
        );

        assert!(JsonPath::parse("a").is_err());
        assert!(JsonPath::parse(".a..b").is_err());
        assert!(JsonPath::parse(".a.").is_err());
        assert!(JsonPath::parse(".a[x]").is_err());
        assert!(JsonPath::parse(".a[0").is_err());
        assert!(JsonPath::parse(".a[0]b").is_err());
        assert!(JsonPath::parse(".a b").is_err());
    }

    #[test]
    fn test_json_path_select() {
        let payload = r#"{"sensors": [{"value": 21.5}, {"value": "n/a"}], "on": true, "obj": {}}"#;

        assert_eq!(
            JsonPath::parse(".sensors[0].value").unwrap().select(payload),
            Ok("21.5".to_string())
        );
        assert_eq!(
            JsonPath::parse(".sensors[1].value").unwrap().select(payload),
            Ok("n/a".to_string())
        );
        assert_eq!(
            JsonPath::parse(".on").unwrap().select(payload),
            Ok("1".to_string())
        );
        assert_eq!(
            JsonPath::parse(".obj").unwrap().select(payload),
            Err(ExtractionError::JsonNotScalar(".obj".to_string()))
        );
        assert_eq!(JsonPath::parse(".").unwrap().select("42"), Ok("42".to_string()));
    }
}
