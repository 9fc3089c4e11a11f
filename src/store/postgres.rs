//! PostgreSQL storage backend.
//!
//! Provisions the value tables, the seen-topics table and the rule catalog
//! at startup. Table names carry a configurable prefix, so statements are
//! built at runtime; all data flows through bind parameters.

use super::Store;
use crate::config::PostgresConfig;
use crate::extract::TypedValue;
use crate::rule::{PartitionKey, TopicRule, ValueKind};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{PgPool, Row};
use tracing::{info, warn};

/// SQL column type for a value kind.
fn sql_type(kind: ValueKind) -> &'static str {
    match kind {
        ValueKind::Text => "text",
        ValueKind::Boolean => "boolean",
        ValueKind::Integer => "bigint",
        ValueKind::Double => "double precision",
    }
}

fn value_table_name(prefix: &str, kind: ValueKind) -> String {
    format!("{}_{}", prefix, kind.table_suffix())
}

fn seen_table_name(prefix: &str) -> String {
    format!("{}_sensors_seen", prefix)
}

fn config_table_name(prefix: &str) -> String {
    format!("{}_config", prefix)
}

const ALL_KINDS: [ValueKind; 4] = [
    ValueKind::Text,
    ValueKind::Boolean,
    ValueKind::Integer,
    ValueKind::Double,
];

pub struct PgStore {
    pool: PgPool,
    prefix: String,
}

impl PgStore {
    /// Connect to PostgreSQL and provision the schema. Failure here is
    /// fatal at startup (exit code 2); the caller decides.
    pub async fn connect(config: &PostgresConfig) -> Result<Self> {
        info!(
            "Connecting to PostgreSQL at {}:{}/{}",
            config.host, config.port, config.database
        );

        let options = PgConnectOptions::new()
            .host(&config.host)
            .port(config.port)
            .username(&config.username)
            .password(&config.password)
            .database(&config.database);

        let pool = PgPoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .context("Failed to open database")?;

        let store = Self {
            pool,
            prefix: config.prefix.clone(),
        };
        store.ensure_schema().await?;
        Ok(store)
    }

    fn value_table(&self, kind: ValueKind) -> String {
        value_table_name(&self.prefix, kind)
    }

    fn seen_table(&self) -> String {
        seen_table_name(&self.prefix)
    }

    fn config_table(&self) -> String {
        config_table_name(&self.prefix)
    }

    /// Create all tables and indexes if they do not exist yet.
    ///
    /// The value tables carry columns for both addressing schemes
    /// (sensorid, groupname + sensor); each row fills the columns of the
    /// key shape it was stored under.
    async fn ensure_schema(&self) -> Result<()> {
        for kind in ALL_KINDS {
            let table = self.value_table(kind);
            sqlx::query(&format!(
                "CREATE TABLE IF NOT EXISTS {table} (
                    id bigint GENERATED ALWAYS AS IDENTITY PRIMARY KEY,
                    ts timestamptz NOT NULL,
                    sensorid integer,
                    groupname varchar(100),
                    sensor varchar(100),
                    value {} NOT NULL
                )",
                sql_type(kind)
            ))
            .execute(&self.pool)
            .await
            .with_context(|| format!("Error while creating {} table", table))?;

            for (name, columns) in [
                ("sensorid_idx", "(sensorid)"),
                ("group_idx", "(groupname, sensor)"),
                ("ts_idx", "(ts)"),
            ] {
                sqlx::query(&format!(
                    "CREATE INDEX IF NOT EXISTS {table}_{name} ON {table} {columns}"
                ))
                .execute(&self.pool)
                .await
                .with_context(|| format!("Error while creating index {}_{}", table, name))?;
            }
        }

        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {} (
                lastseen timestamptz NOT NULL,
                topic varchar(255) PRIMARY KEY,
                data text
            )",
            self.seen_table()
        ))
        .execute(&self.pool)
        .await
        .with_context(|| format!("Error while creating {} table", self.seen_table()))?;

        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {} (
                sensorid integer GENERATED ALWAYS AS IDENTITY PRIMARY KEY,
                groupname varchar(100),
                sensor varchar(100),
                topic varchar(100),
                jsonpath varchar(100),
                datatype varchar(10),
                scaling real,
                unit varchar(10),
                lastdata text
            )",
            self.config_table()
        ))
        .execute(&self.pool)
        .await
        .with_context(|| format!("Error while creating {} table", self.config_table()))?;

        Ok(())
    }

    /// Load topic rules from the catalog table. Rows with an unknown
    /// datatype or an empty topic are skipped with a warning.
    pub async fn load_rules(&self) -> Result<Vec<TopicRule>> {
        let rows = sqlx::query(&format!(
            "SELECT sensorid, groupname, sensor, topic, jsonpath, datatype, scaling, unit FROM {}",
            self.config_table()
        ))
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("Error while reading {} table", self.config_table()))?;

        let mut rules = Vec::new();
        for row in rows {
            let sensor_id: i32 = row.try_get("sensorid")?;
            let topic: Option<String> = row.try_get("topic")?;
            let datatype: Option<String> = row.try_get("datatype")?;

            let topic = match topic.filter(|t| !t.is_empty()) {
                Some(t) => t,
                None => {
                    warn!(sensor_id, "Catalog row without topic, skipping");
                    continue;
                }
            };
            let kind = match datatype.as_deref().and_then(ValueKind::parse) {
                Some(k) => k,
                None => {
                    warn!(
                        sensor_id,
                        datatype = datatype.as_deref().unwrap_or(""),
                        "Catalog row with unknown datatype, skipping"
                    );
                    continue;
                }
            };

            let group: Option<String> = row.try_get("groupname")?;
            let name: Option<String> = row.try_get("sensor")?;
            let jsonpath: Option<String> = row.try_get("jsonpath")?;
            let scaling: Option<f32> = row.try_get("scaling")?;
            let unit: Option<String> = row.try_get("unit")?;

            rules.push(TopicRule {
                json_path: jsonpath.filter(|p| !p.is_empty()),
                kind,
                scale: scaling.map(f64::from).filter(|s| s.is_finite()),
                group: group.unwrap_or_default(),
                name: name.unwrap_or_else(|| topic.clone()),
                pattern: topic,
                sensor_id: Some(sensor_id),
                unit,
            });
        }
        Ok(rules)
    }

    /// Register an inline rule in the catalog and return its generated
    /// sensor id. Called once per previously-unseen rule at startup.
    pub async fn register_rule(&self, rule: &TopicRule) -> Result<i32> {
        let row = sqlx::query(&format!(
            "INSERT INTO {} (groupname, sensor, topic, jsonpath, datatype, scaling, unit)
             VALUES ($1, $2, $3, $4, $5, $6, $7) RETURNING sensorid",
            self.config_table()
        ))
        .bind(&rule.group)
        .bind(&rule.name)
        .bind(&rule.pattern)
        .bind(rule.json_path.as_deref().unwrap_or(""))
        .bind(rule.kind.table_suffix())
        .bind(rule.scale.map(|s| s as f32))
        .bind(rule.unit.as_deref())
        .fetch_one(&self.pool)
        .await
        .with_context(|| format!("Error while registering rule for {}", rule.pattern))?;
        Ok(row.try_get("sensorid")?)
    }
}

/// WHERE clause + bind order for a partition key (parameters start at $1).
fn key_predicate(key: &PartitionKey) -> &'static str {
    match key {
        PartitionKey::SensorId(_) => "sensorid = $1",
        PartitionKey::GroupName { .. } => "groupname = $1 AND sensor = $2",
    }
}

#[async_trait]
impl Store for PgStore {
    async fn last_value(&self, key: &PartitionKey, kind: ValueKind) -> Result<Option<TypedValue>> {
        let sql = format!(
            "SELECT value FROM {} WHERE {} ORDER BY ts DESC LIMIT 1",
            self.value_table(kind),
            key_predicate(key)
        );
        let query = sqlx::query(&sql);
        let query = match key {
            PartitionKey::SensorId(id) => query.bind(id),
            PartitionKey::GroupName { group, name } => query.bind(group).bind(name),
        };
        let row = query
            .fetch_optional(&self.pool)
            .await
            .context("Failed to query last value")?;

        let row = match row {
            Some(row) => row,
            None => return Ok(None),
        };
        let value = match kind {
            ValueKind::Text => TypedValue::Text(row.try_get(0)?),
            ValueKind::Boolean => TypedValue::Boolean(row.try_get(0)?),
            ValueKind::Integer => TypedValue::Integer(row.try_get(0)?),
            ValueKind::Double => TypedValue::Double(row.try_get(0)?),
        };
        Ok(Some(value))
    }

    async fn insert_value(
        &self,
        key: &PartitionKey,
        ts: DateTime<Utc>,
        value: &TypedValue,
    ) -> Result<()> {
        let sql = format!(
            "INSERT INTO {} (ts, sensorid, groupname, sensor, value) VALUES ($1, $2, $3, $4, $5)",
            self.value_table(value.kind())
        );
        let (sensor_id, group, name) = match key {
            PartitionKey::SensorId(id) => (Some(*id), None, None),
            PartitionKey::GroupName { group, name } => {
                (None, Some(group.as_str()), Some(name.as_str()))
            }
        };
        let query = sqlx::query(&sql).bind(ts).bind(sensor_id).bind(group).bind(name);
        let query = match value {
            TypedValue::Text(s) => query.bind(s),
            TypedValue::Boolean(b) => query.bind(b),
            TypedValue::Integer(i) => query.bind(i),
            TypedValue::Double(d) => query.bind(d),
        };
        query
            .execute(&self.pool)
            .await
            .context("Failed to insert value row")?;
        Ok(())
    }

    async fn upsert_seen(&self, topic: &str, ts: DateTime<Utc>, payload: &str) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO {} (lastseen, topic, data) VALUES ($1, $2, $3)
             ON CONFLICT (topic) DO UPDATE SET lastseen = EXCLUDED.lastseen, data = EXCLUDED.data",
            self.seen_table()
        ))
        .bind(ts)
        .bind(topic)
        .bind(payload)
        .execute(&self.pool)
        .await
        .context("Failed to upsert seen topic")?;
        Ok(())
    }
}
