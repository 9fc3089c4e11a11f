use crate::rule::{TopicRule, ValueKind};
use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Complete bridge configuration
#[derive(Debug, Clone, Deserialize)]
pub struct BridgeConfig {
    pub mqtt: MqttConfig,
    pub postgres: PostgresConfig,
    /// Inline topic rules; merged with the catalog table at startup
    #[serde(default, rename = "rule")]
    pub rules: Vec<RuleConfig>,
}

/// MQTT broker connection parameters
#[derive(Debug, Clone, Deserialize)]
pub struct MqttConfig {
    pub host: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub use_tls: bool,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_seconds: u64,
}

fn default_mqtt_port() -> u16 {
    8883
}

fn default_client_id() -> String {
    "mqtt2sql".to_string()
}

fn default_keep_alive() -> u64 {
    60
}

/// PostgreSQL connection parameters
#[derive(Debug, Clone, Deserialize)]
pub struct PostgresConfig {
    pub host: String,
    #[serde(default = "default_postgres_port")]
    pub port: u16,
    pub username: String,
    #[serde(default)]
    pub password: String,
    pub database: String,
    /// Table name prefix for all provisioned tables
    #[serde(default = "default_prefix")]
    pub prefix: String,
}

fn default_postgres_port() -> u16 {
    5432
}

fn default_prefix() -> String {
    "mqtt".to_string()
}

/// One `[[rule]]` entry from the config file
#[derive(Debug, Clone, Deserialize)]
pub struct RuleConfig {
    pub topic: String,
    #[serde(default)]
    pub jsonpath: Option<String>,
    pub datatype: ValueKind,
    #[serde(default)]
    pub scaling: Option<f64>,
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub sensor_id: Option<i32>,
    #[serde(default)]
    pub unit: Option<String>,
}

impl RuleConfig {
    /// Build the runtime rule. Group and name fall back to the topic so a
    /// minimal entry is still addressable.
    pub fn into_rule(self) -> TopicRule {
        let json_path = self.jsonpath.filter(|p| !p.is_empty());
        // NaN scaling in the catalog means "no scaling"
        let scale = self.scaling.filter(|s| s.is_finite());
        TopicRule {
            group: self.group.unwrap_or_default(),
            name: self.name.unwrap_or_else(|| self.topic.clone()),
            pattern: self.topic,
            json_path,
            kind: self.datatype,
            scale,
            sensor_id: self.sensor_id,
            unit: self.unit,
        }
    }
}

impl BridgeConfig {
    /// Validate invariants the type system cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.mqtt.host.is_empty() {
            bail!("mqtt.host is empty");
        }
        if self.postgres.host.is_empty() {
            bail!("postgres.host is empty");
        }
        // Sensor identity must be unique across rules; rules without an
        // explicit identity get a distinct catalog-generated id later.
        let mut keys = std::collections::HashSet::new();
        for rule in &self.rules {
            let key = match (rule.sensor_id, &rule.group, &rule.name) {
                (Some(id), _, _) => format!("sensor_id {}", id),
                (None, Some(group), Some(name)) => format!("group {}/{}", group, name),
                _ => continue,
            };
            if !keys.insert(key.clone()) {
                bail!("duplicate sensor identity ({}) across rules", key);
            }
        }
        Ok(())
    }
}

/// Load configuration from a TOML file
pub fn load_config(path: &str) -> Result<BridgeConfig> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path))?;
    let config: BridgeConfig =
        toml::from_str(&contents).with_context(|| format!("Failed to parse {}", path))?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [mqtt]
        host = "broker.example.com"

        [postgres]
        host = "db.example.com"
        username = "mqtt"
        database = "telemetry"
    "#;

    #[test]
    fn test_minimal_config_defaults() {
        let config: BridgeConfig = toml::from_str(MINIMAL).unwrap();
        config.validate().unwrap();
        assert_eq!(config.mqtt.port, 8883);
        assert_eq!(config.mqtt.client_id, "mqtt2sql");
        assert_eq!(config.mqtt.keep_alive_seconds, 60);
        assert!(!config.mqtt.use_tls);
        assert_eq!(config.postgres.port, 5432);
        assert_eq!(config.postgres.prefix, "mqtt");
        assert!(config.rules.is_empty());
    }

    #[test]
    fn test_rule_deserialization() {
        let toml = r#"
            [mqtt]
            host = "broker"

            [postgres]
            host = "db"
            username = "u"
            database = "d"

            [[rule]]
            topic = "sensors/livingroom/temp"
            jsonpath = "$.value"
            datatype = "double"
            scaling = 0.1
            group = "livingroom"
            name = "temperature"
            unit = "C"

            [[rule]]
            topic = "devices/door/state"
            datatype = "text"
        "#;

        let config: BridgeConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.rules.len(), 2);

        let rule = config.rules[0].clone().into_rule();
        assert_eq!(rule.pattern, "sensors/livingroom/temp");
        assert_eq!(rule.json_path.as_deref(), Some("$.value"));
        assert_eq!(rule.kind, ValueKind::Double);
        assert_eq!(rule.scale, Some(0.1));
        assert_eq!(rule.group, "livingroom");
        assert_eq!(rule.name, "temperature");

        let rule = config.rules[1].clone().into_rule();
        assert_eq!(rule.kind, ValueKind::Text);
        assert!(rule.json_path.is_none());
        assert!(rule.scale.is_none());
        // Name falls back to the topic
        assert_eq!(rule.name, "devices/door/state");
    }

    #[test]
    fn test_datatype_aliases() {
        for (alias, kind) in [
            ("string", ValueKind::Text),
            ("bool", ValueKind::Boolean),
            ("int", ValueKind::Integer),
            ("float", ValueKind::Double),
        ] {
            let toml = format!(
                r#"
                [mqtt]
                host = "b"
                [postgres]
                host = "d"
                username = "u"
                database = "d"
                [[rule]]
                topic = "t"
                datatype = "{}"
                "#,
                alias
            );
            let config: BridgeConfig = toml::from_str(&toml).unwrap();
            assert_eq!(config.rules[0].datatype, kind);
        }
    }

    #[test]
    fn test_duplicate_sensor_ids_rejected() {
        let toml = r#"
            [mqtt]
            host = "b"
            [postgres]
            host = "d"
            username = "u"
            database = "d"
            [[rule]]
            topic = "a"
            datatype = "int"
            sensor_id = 3
            [[rule]]
            topic = "b"
            datatype = "int"
            sensor_id = 3
        "#;
        let config: BridgeConfig = toml::from_str(toml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_duplicate_group_name_rejected() {
        // Same (group, name) pair with no sensor id is one partition key
        let toml = r#"
            [mqtt]
            host = "b"
            [postgres]
            host = "d"
            username = "u"
            database = "d"
            [[rule]]
            topic = "a"
            datatype = "double"
            group = "g"
            name = "n"
            [[rule]]
            topic = "b"
            datatype = "double"
            group = "g"
            name = "n"
        "#;
        let config: BridgeConfig = toml::from_str(toml).unwrap();
        assert!(config.validate().is_err());

        // Distinct names under one group are fine
        let toml = toml.replace(r#"name = "n""#, r#"name = "n2""#);
        let toml = toml.replacen(r#"name = "n2""#, r#"name = "n1""#, 1);
        let config: BridgeConfig = toml::from_str(&toml).unwrap();
        config.validate().unwrap();
    }

    #[test]
    fn test_nan_scaling_is_dropped() {
        let toml = r#"
            [mqtt]
            host = "b"
            [postgres]
            host = "d"
            username = "u"
            database = "d"
            [[rule]]
            topic = "t"
            datatype = "double"
            scaling = nan
        "#;
        let config: BridgeConfig = toml::from_str(toml).unwrap();
        let rule = config.rules[0].clone().into_rule();
        assert!(rule.scale.is_none());
    }
}
