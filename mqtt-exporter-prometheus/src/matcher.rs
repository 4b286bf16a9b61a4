//! Matching incoming topics against compiled rules.

use mqtt_exporter_common::topic::{PatternSegment, is_system_topic, split_topic};

use crate::mapping::{Labels, derive_metric_name};
use crate::rule::{Rule, RuleSet};

/// A rule that matched a topic, with everything derived from the topic.
#[derive(Debug, Clone)]
pub struct MatchResult<'a> {
    pub rule: &'a Rule,
    /// Metric name: the override, or derived from the unbound topic levels.
    pub metric_name: String,
    /// Wildcard label bindings.
    pub bindings: Labels,
}

impl Rule {
    /// Match topic levels against this rule's pattern.
    ///
    /// On success returns the wildcard bindings and the indices of the topic
    /// levels that were not bound to a label.
    pub fn match_levels(&self, levels: &[&str]) -> Option<(Labels, Vec<usize>)> {
        let mut bindings = Labels::new();
        let mut unbound = Vec::with_capacity(levels.len());

        for (i, segment) in self.pattern.iter().enumerate() {
            match segment {
                PatternSegment::Multi => {
                    unbound.extend(i..levels.len());
                    return Some((bindings, unbound));
                }
                PatternSegment::Single(label) => {
                    let level = levels.get(i)?;
                    bindings.insert(label.clone(), (*level).to_string());
                }
                PatternSegment::Literal(text) => {
                    if levels.get(i) != Some(&text.as_str()) {
                        return None;
                    }
                    unbound.push(i);
                }
            }
        }

        (levels.len() == self.pattern.len()).then_some((bindings, unbound))
    }

    /// Match a topic, deriving the metric name when the rule has no override.
    pub fn match_topic(&self, topic: &str, prefix: &str) -> Option<MatchResult<'_>> {
        if is_system_topic(topic) && self.pattern.first().is_some_and(|s| s.is_wildcard()) {
            return None;
        }

        let levels = split_topic(topic);
        let (bindings, unbound) = self.match_levels(&levels)?;

        let metric_name = match &self.metric_name {
            Some(name) => name.clone(),
            None => derive_metric_name(prefix, unbound.iter().map(|&i| levels[i])),
        };

        Some(MatchResult {
            rule: self,
            metric_name,
            bindings,
        })
    }
}

impl RuleSet {
    /// Every rule matching `topic`, in declaration order.
    ///
    /// All matches fire: a catch-all and a more specific rule can both feed
    /// metrics from the same message.
    pub fn match_topic(&self, topic: &str) -> Vec<MatchResult<'_>> {
        self.rules
            .iter()
            .filter_map(|rule| rule.match_topic(topic, &self.prefix))
            .collect()
    }
}
