use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use a3s_sentinel::auth::{directory::DEFAULT_ITERATIONS, hash_password};
use a3s_sentinel::config::UserAccount;
use a3s_sentinel::{
    DetectedObject, FixedScoreModel, Pipeline, Role, ScoringModel, SentinelConfig, StaticDetector,
};
use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

/// A3S Sentinel - token authority and perception pipeline
#[derive(Debug, Parser)]
#[command(name = "a3s-sentinel", version, about)]
struct Cli {
    /// JSON configuration file; `SENTINEL_*` environment variables otherwise
    #[arg(long, global = true, env = "SENTINEL_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Print a PBKDF2 password hash for a user account entry
    HashPassword {
        password: String,

        #[arg(long, default_value_t = DEFAULT_ITERATIONS)]
        iterations: u32,
    },

    /// Run an in-memory pipeline over synthetic frames and print stats
    Demo {
        /// Number of frames to submit
        #[arg(long, default_value_t = 10)]
        frames: usize,

        /// Fixed model score; rule-based scoring when omitted
        #[arg(long)]
        score: Option<f64>,
    },

    /// Load and validate the configuration
    CheckConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::HashPassword {
            password,
            iterations,
        } => {
            println!("{}", hash_password(&password, iterations)?);
        }
        Commands::Demo { frames, score } => {
            let config = load_config(cli.config.as_ref())?;
            demo(config, frames, score).await?;
        }
        Commands::CheckConfig => {
            let config = load_config(cli.config.as_ref())?;
            config.validate()?;
            println!(
                "ok: {} user(s), {} service(s), queue={}, store={}",
                config.auth.users.len(),
                config.auth.services.len(),
                if config.nats.is_some() { "nats" } else { "memory" },
                if config.store.database_path.is_some() { "sqlite" } else { "memory" },
            );
        }
    }

    Ok(())
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<SentinelConfig> {
    let mut config = match path {
        Some(path) => SentinelConfig::from_file(path)?,
        None => SentinelConfig::default(),
    };
    config.apply_env(|key| std::env::var(key).ok())?;
    Ok(config)
}

async fn demo(mut config: SentinelConfig, frames: usize, score: Option<f64>) -> anyhow::Result<()> {
    // The demo always runs on in-memory backends with a throwaway admin
    config.nats = None;
    config.store.database_path = None;
    if config.auth.signing_secret.is_empty() {
        config.auth.signing_secret =
            format!("{}{}", uuid::Uuid::new_v4().simple(), uuid::Uuid::new_v4().simple());
    }
    let admin_password = uuid::Uuid::new_v4().to_string();
    config.auth.users.push(UserAccount {
        username: "demo-admin".to_string(),
        password_hash: hash_password(&admin_password, 1_000)?,
        role: Role::Admin,
    });

    let pipeline = Pipeline::from_config(config).await?;
    let admin = pipeline
        .authority()
        .login("demo-admin", &admin_password)
        .await
        .context("demo admin login failed")?;

    let detector = Arc::new(StaticDetector::new(vec![
        DetectedObject::new("person", [120.0, 80.0, 60.0, 170.0], 0.94),
        DetectedObject::new("person", [300.0, 90.0, 55.0, 160.0], 0.81),
        DetectedObject::new("car", [20.0, 200.0, 220.0, 110.0], 0.77),
        DetectedObject::new("dog", [400.0, 260.0, 40.0, 30.0], 0.42),
    ]));
    let model = score
        .map(|s| Arc::new(FixedScoreModel::new(s, "fixed-demo")) as Arc<dyn ScoringModel>);

    let handle = pipeline.start(admin.as_str(), detector, model).await?;
    for n in 0..frames {
        handle
            .detection()
            .submit(&format!("demo-cam-{}", n % 3), b"synthetic-frame")
            .await?;
    }
    if !handle.wait_idle(Duration::from_secs(30)).await? {
        tracing::warn!("Pipeline did not drain within 30s");
    }

    println!("{}", serde_json::to_string_pretty(&handle.stats().await?)?);
    let health = handle.health().await;
    if !health.healthy {
        tracing::warn!(health = ?health, "Pipeline unhealthy after demo run");
    }
    handle.shutdown().await?;
    Ok(())
}
