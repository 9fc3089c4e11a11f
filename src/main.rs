use clap::Parser;
use mqtt2sql::config::{self, RuleConfig};
use mqtt2sql::error::{FatalError, EXIT_CONFIG, EXIT_STORE_UNAVAILABLE};
use mqtt2sql::mqtt::Dispatcher;
use mqtt2sql::pipeline::Pipeline;
use mqtt2sql::rule::{duplicate_partition_key, TopicRule, TopicRouter};
use mqtt2sql::store::PgStore;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Subscribes to an MQTT broker and stores sensor values in a PostgreSQL
/// database.
#[derive(Parser, Debug)]
#[command(name = "mqtt2sql", version, about)]
struct Args {
    /// Path to the config file
    #[arg(short, long, default_value = "mqtt2sql.toml")]
    config: String,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mqtt2sql=info".into()),
        )
        .init();

    let args = Args::parse();

    if let Err(e) = run(&args).await {
        error!("{}", e.message);
        std::process::exit(e.exit_code);
    }
}

async fn run(args: &Args) -> Result<(), FatalError> {
    let config = config::load_config(&args.config).map_err(|e| {
        FatalError::new(
            format!("Error while reading config file {}: {:#}", args.config, e),
            EXIT_CONFIG,
        )
    })?;

    // Store must be reachable at startup; schema provisioning happens here
    let store = PgStore::connect(&config.postgres)
        .await
        .map_err(|e| FatalError::new(format!("{:#}", e), EXIT_STORE_UNAVAILABLE))?;
    let store = Arc::new(store);

    let rules = resolve_rules(&store, config.rules.clone())
        .await
        .map_err(|e| FatalError::new(format!("{:#}", e), EXIT_STORE_UNAVAILABLE))?;
    // Catalog ids and inline identities may collide only after the merge
    if let Some(key) = duplicate_partition_key(&rules) {
        return Err(FatalError::new(
            format!("Two rules share the same sensor identity ({})", key),
            EXIT_CONFIG,
        ));
    }
    if rules.is_empty() {
        warn!("No topic rules configured; only seen-topic bookkeeping will run");
    } else {
        info!(rules = rules.len(), "Loaded topic rules");
    }

    let router = TopicRouter::new(rules);
    let pipeline = Pipeline::new(store);
    Dispatcher::new(&config.mqtt, router, pipeline).run().await
}

/// Merge catalog rules with inline config rules.
///
/// Catalog rows win for rules they already cover. Inline rules without an
/// explicit identity (neither a sensor id nor a group + name pair) are
/// registered in the catalog once and keep the generated id for every
/// later run.
async fn resolve_rules(
    store: &PgStore,
    inline: Vec<RuleConfig>,
) -> anyhow::Result<Vec<TopicRule>> {
    let mut rules = store.load_rules().await?;

    for entry in inline {
        let has_identity =
            entry.sensor_id.is_some() || (entry.group.is_some() && entry.name.is_some());
        let mut rule = entry.into_rule();

        if let Some(existing) = rules.iter().find(|r| covers(r, &rule)) {
            info!(
                topic = %rule.pattern,
                sensor_id = existing.sensor_id,
                "Inline rule already in catalog"
            );
            continue;
        }

        if !has_identity {
            let id = store.register_rule(&rule).await?;
            info!(topic = %rule.pattern, sensor_id = id, "Registered new rule in catalog");
            rule.sensor_id = Some(id);
        }
        rules.push(rule);
    }

    Ok(rules)
}

/// Whether a catalog rule already covers an inline rule.
fn covers(catalog: &TopicRule, inline: &TopicRule) -> bool {
    catalog.pattern == inline.pattern
        && catalog.json_path == inline.json_path
        && catalog.kind == inline.kind
}
