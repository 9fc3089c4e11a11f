use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Target type a topic rule converts extracted values into.
///
/// Closed set; every match over it is exhaustive so a new kind cannot be
/// added without visiting the extractor and the writer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueKind {
    #[serde(rename = "text", alias = "string")]
    Text,
    #[serde(rename = "boolean", alias = "bool")]
    Boolean,
    #[serde(rename = "integer", alias = "int")]
    Integer,
    #[serde(rename = "double", alias = "float")]
    Double,
}

impl ValueKind {
    /// Suffix of the per-kind value table (`<prefix>_<suffix>`).
    pub fn table_suffix(&self) -> &'static str {
        match self {
            ValueKind::Text => "string",
            ValueKind::Boolean => "boolean",
            ValueKind::Integer => "integer",
            ValueKind::Double => "double",
        }
    }

    /// Parse the catalog table's `datatype` column.
    pub fn parse(s: &str) -> Option<ValueKind> {
        match s {
            "string" | "text" => Some(ValueKind::Text),
            "bool" | "boolean" => Some(ValueKind::Boolean),
            "int" | "integer" => Some(ValueKind::Integer),
            "double" | "float" => Some(ValueKind::Double),
            _ => None,
        }
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.table_suffix())
    }
}

/// Identity under which time-series rows and last-value cache entries are
/// addressed. Deployments use either a numeric sensor id or a composite
/// group + name, selected by the shape of the rule that produced it; the
/// change detector and the writer are agnostic to which.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum PartitionKey {
    SensorId(i32),
    GroupName { group: String, name: String },
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PartitionKey::SensorId(id) => write!(f, "sensor {}", id),
            PartitionKey::GroupName { group, name } => write!(f, "{}/{}", group, name),
        }
    }
}

/// One configured topic rule: where to subscribe, how to extract a value
/// and under which identity to store it.
#[derive(Clone, Debug)]
pub struct TopicRule {
    /// Topic filter to subscribe with. Used once, at subscribe time; the
    /// router binds inbound topics back to the rule afterwards.
    pub pattern: String,
    /// Dotted path into a JSON payload. Empty/absent means the whole
    /// payload is taken as text.
    pub json_path: Option<String>,
    pub kind: ValueKind,
    /// Multiplier applied to double values right after conversion.
    pub scale: Option<f64>,
    pub group: String,
    pub name: String,
    /// Generated catalog identity. Rules without one are addressed by
    /// group + name instead.
    pub sensor_id: Option<i32>,
    pub unit: Option<String>,
}

impl TopicRule {
    /// The partition key this rule stores under.
    pub fn partition_key(&self) -> PartitionKey {
        match self.sensor_id {
            Some(id) => PartitionKey::SensorId(id),
            None => PartitionKey::GroupName {
                group: self.group.clone(),
                name: self.name.clone(),
            },
        }
    }
}

/// Binds inbound concrete topics to the rule whose subscription produced
/// them.
///
/// The binding is established per topic: exact patterns are known up front,
/// topics first seen under a wildcard filter are matched once against the
/// subscribed filters and the result is memoized. Dispatch after that is a
/// plain map lookup, never a per-message pattern re-evaluation.
pub struct TopicRouter {
    rules: Vec<TopicRule>,
    /// Concrete topic -> rule index (None = known to match no rule).
    bindings: HashMap<String, Option<usize>>,
    /// Indexes of rules whose pattern contains a wildcard.
    wildcard_rules: Vec<usize>,
}

impl TopicRouter {
    pub fn new(rules: Vec<TopicRule>) -> Self {
        let mut bindings = HashMap::new();
        let mut wildcard_rules = Vec::new();
        for (idx, rule) in rules.iter().enumerate() {
            if rule.pattern.contains('+') || rule.pattern.contains('#') {
                wildcard_rules.push(idx);
            } else {
                bindings.insert(rule.pattern.clone(), Some(idx));
            }
        }
        Self {
            rules,
            bindings,
            wildcard_rules,
        }
    }

    pub fn rules(&self) -> &[TopicRule] {
        &self.rules
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Resolve the rule for an inbound topic, if any.
    pub fn resolve(&mut self, topic: &str) -> Option<&TopicRule> {
        if !self.bindings.contains_key(topic) {
            let bound = self
                .wildcard_rules
                .iter()
                .copied()
                .find(|&idx| filter_matches(&self.rules[idx].pattern, topic));
            self.bindings.insert(topic.to_string(), bound);
        }
        match self.bindings[topic] {
            Some(idx) => Some(&self.rules[idx]),
            None => None,
        }
    }
}

/// First partition key shared by two rules, if any. Sensor identity must
/// be unique across all rules; two rules collapsing onto one key would
/// deduplicate one sensor's readings against the other's.
pub fn duplicate_partition_key(rules: &[TopicRule]) -> Option<PartitionKey> {
    let mut seen = std::collections::HashSet::new();
    for rule in rules {
        let key = rule.partition_key();
        if !seen.insert(key.clone()) {
            return Some(key);
        }
    }
    None
}

/// MQTT topic filter match (`+` single level, `#` trailing multi-level).
fn filter_matches(filter: &str, topic: &str) -> bool {
    let mut filter_parts = filter.split('/');
    let mut topic_parts = topic.split('/');

    loop {
        match (filter_parts.next(), topic_parts.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => continue,
            (Some(f), Some(t)) if f == t => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}
