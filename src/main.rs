use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use netquota::config::NetquotaConfig;
use netquota::ratelimit::{spawn_cleanup_task, ObjectType, Registry};

/// Inspect and exercise netquota rate limiting configuration.
#[derive(Debug, Parser)]
#[command(name = "netquota", version, about)]
struct Cli {
    /// Emit logs as JSON
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Parse every object's rules and print them
    Validate {
        /// Path to the YAML configuration file
        #[arg(short, long)]
        config: String,
    },
    /// Replay requests from one client address through the registry
    Check {
        /// Path to the YAML configuration file
        #[arg(short, long)]
        config: String,

        /// Type of the object to check, e.g. `channel`
        #[arg(long)]
        object_type: ObjectType,

        /// Name of the object to check
        #[arg(long)]
        object_name: String,

        /// Client address the requests come from
        #[arg(long)]
        from: String,

        /// How many requests to send
        #[arg(long, default_value_t = 1)]
        count: u32,

        /// Print each outcome as a JSON line
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Command::Validate { config } => validate(&config),
        Command::Check {
            config,
            object_type,
            object_name,
            from,
            count,
            json,
        } => check(&config, object_type, &object_name, &from, count, json).await,
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn validate(path: &str) -> anyhow::Result<()> {
    let config = NetquotaConfig::load(path)?;
    config.validate()?;

    for object in &config.objects {
        let rules = object.rule_set()?;
        println!(
            "{} (mode: {:?}, active: {}, parent: {})",
            object.object_info(),
            object.mode,
            object.is_active,
            object
                .parent
                .as_ref()
                .map(|p| p.to_string())
                .unwrap_or_else(|| "-".to_string())
        );
        for line in rules.to_string().lines() {
            println!("    {}", line);
        }
    }

    info!(objects = config.objects.len(), "Configuration is valid");
    Ok(())
}

async fn check(
    path: &str,
    object_type: ObjectType,
    object_name: &str,
    from: &str,
    count: u32,
    json: bool,
) -> anyhow::Result<()> {
    let config = NetquotaConfig::load(path)?;
    let registry = std::sync::Arc::new(Registry::from_config(&config)?);
    let sweeper = spawn_cleanup_task(registry.clone(), config.cleanup.interval());

    let mut admitted = 0u32;
    for n in 1..=count {
        let cid = uuid::Uuid::new_v4().to_string();
        let outcome = registry.check_by_name(&cid, object_type, object_name, from);

        match (&outcome, json) {
            (Ok(admission), true) => println!(
                "{}",
                serde_json::json!({
                    "request": n,
                    "cid": cid,
                    "admitted": true,
                    "requests": admission.requests,
                })
            ),
            (Err(rejection), true) => println!(
                "{}",
                serde_json::json!({
                    "request": n,
                    "cid": cid,
                    "admitted": false,
                    "rejection": rejection,
                })
            ),
            (Ok(admission), false) => println!(
                "#{} admitted ({} in current period)",
                n, admission.requests
            ),
            (Err(rejection), false) => println!("#{} rejected: {}", n, rejection),
        }

        if outcome.is_ok() {
            admitted += 1;
        }
    }

    sweeper.abort();
    if admitted < count {
        warn!(admitted = admitted, rejected = count - admitted, "Some requests were rejected");
    }
    Ok(())
}
