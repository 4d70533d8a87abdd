//! # Spedire: automation dispatcher
//!
//! Runs cron-scheduled automations with a per-automation distributed lock and
//! keeps a history of every run.
//!
//! Usage:
//!   spedire serve                        # HTTP gateway (cron endpoint + admin API)
//!   spedire serve --with-ticker          # ... plus an internal ticker
//!   spedire tick                         # one dispatcher pass, then exit
//!   spedire run low-balance-alert        # run one automation now
//!   spedire check-cron "0 2 1 * *"       # validate and preview a schedule

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use spedire_automations::cron;
use spedire_automations::{
    AutomationAdmin, AutomationDb, AutomationLock, Dispatcher, HandlerRegistry, register_webhooks,
    spawn_ticker,
};
use spedire_core::SpedireConfig;

#[derive(Parser)]
#[command(
    name = "spedire",
    version,
    about = "⏱️ Spedire: cron-driven automation dispatcher"
)]
struct Cli {
    /// Config file (default: ~/.spedire/config.toml, or SPEDIRE_CONFIG)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines (for log shippers)
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the HTTP gateway
    Serve {
        /// Override gateway.port
        #[arg(short, long)]
        port: Option<u16>,
        /// Also tick the dispatcher every dispatcher.tick_interval_secs
        #[arg(long)]
        with_ticker: bool,
    },
    /// Run one dispatcher pass and print the batch result
    Tick {
        /// Tolerance window in minutes (default: dispatcher.tolerance_minutes)
        #[arg(short, long)]
        tolerance: Option<u32>,
    },
    /// Run an automation now, ignoring schedule and enabled flag
    Run {
        slug: String,
        /// Recorded as the triggering user
        #[arg(long, default_value = "cli")]
        user: String,
    },
    /// List automations with their latest run
    List,
    /// Show the run history of an automation
    Runs {
        slug: String,
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
    /// Enable an automation
    Enable { slug: String },
    /// Disable an automation
    Disable { slug: String },
    /// Validate a cron expression and show its next occurrences
    CheckCron {
        expr: String,
        #[arg(short, long, default_value = "5")]
        count: usize,
    },
    /// Write a default config file
    InitConfig {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

fn config_path(cli: &Cli) -> PathBuf {
    cli.config
        .clone()
        .or_else(|| std::env::var("SPEDIRE_CONFIG").ok().map(PathBuf::from))
        .unwrap_or_else(SpedireConfig::default_path)
}

fn load_config(path: &std::path::Path) -> Result<SpedireConfig> {
    let mut config = if path.exists() {
        SpedireConfig::load_from(path)?
    } else {
        tracing::debug!("No config at {}, using defaults", path.display());
        SpedireConfig::default()
    };
    config.apply_env_overrides()?;
    Ok(config)
}

/// Store, lock, registry, dispatcher and admin, wired from config.
fn build_admin(config: &SpedireConfig) -> Result<Arc<AutomationAdmin>> {
    let db_path = config.database_path();
    let db = Arc::new(AutomationDb::open(&db_path)?);
    tracing::debug!("🗄️ Automations database: {}", db_path.display());

    let lock = Arc::new(AutomationLock::from_config(&config.lock)?);

    let mut registry = HandlerRegistry::new();
    register_webhooks(&mut registry, &config.webhooks);
    if registry.is_empty() {
        tracing::warn!("⚠️ No handlers registered: every due automation will be skipped");
    }

    let dispatcher = Arc::new(Dispatcher::new(
        db.clone(),
        db.clone(),
        lock,
        Arc::new(registry),
    ));
    Ok(Arc::new(AutomationAdmin::new(db.clone(), db, dispatcher)))
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "spedire=debug,spedire_automations=debug,spedire_gateway=debug,tower_http=debug"
    } else {
        "spedire=info,spedire_automations=info,spedire_gateway=info"
    };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));
    if cli.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .init();
    }

    let path = config_path(&cli);

    match cli.command {
        Command::InitConfig { force } => {
            if path.exists() && !force {
                println!("⚠️  Config already exists: {} (use --force)", path.display());
                return Ok(());
            }
            SpedireConfig::default().save_to(&path)?;
            println!("✅ Config written: {}", path.display());
        }
        Command::CheckCron { expr, count } => {
            if !cron::is_valid_cron(&expr) {
                anyhow::bail!("Invalid cron expression: '{expr}'");
            }
            println!("✅ '{expr}' is valid (UTC). Next runs:");
            let mut cursor = chrono::Utc::now();
            for _ in 0..count {
                let Some(next) = cron::next_run(&expr, cursor) else {
                    break;
                };
                println!("   {}", next.format("%Y-%m-%d %H:%M UTC"));
                cursor = next;
            }
        }
        Command::Serve { port, with_ticker } => {
            let mut config = load_config(&path)?;
            if let Some(port) = port {
                config.gateway.port = port;
            }
            let admin = build_admin(&config)?;
            let tolerance = config.dispatcher.tolerance_minutes;

            println!("⏱️ Spedire v{}", env!("CARGO_PKG_VERSION"));
            println!("   🌐 Gateway:   http://{}:{}", config.gateway.host, config.gateway.port);
            println!("   📡 Cron:      /api/cron/automation-dispatcher");
            println!("   🗄️  Database:  {}", config.database_path().display());
            println!("   🔒 Lock:      {} (fail {})", admin.dispatcher().lock().backend(), config.lock.fail_mode);
            println!();

            if with_ticker && config.dispatcher.tick_interval_secs > 0 {
                tokio::spawn(spawn_ticker(
                    admin.dispatcher().clone(),
                    config.dispatcher.tick_interval_secs,
                    tolerance,
                ));
            }

            let state = spedire_gateway::AppState::new(config.gateway.clone(), admin, tolerance);
            spedire_gateway::start(state).await?;
        }
        Command::Tick { tolerance } => {
            let config = load_config(&path)?;
            let admin = build_admin(&config)?;
            let tolerance = tolerance.unwrap_or(config.dispatcher.tolerance_minutes);
            let batch = admin.dispatcher().run_dispatcher(tolerance).await;
            print_json(&batch)?;
        }
        Command::Run { slug, user } => {
            let config = load_config(&path)?;
            let admin = build_admin(&config)?;
            let run = admin.run_automation_manually(&slug, &user).await?;
            print_json(&run)?;
        }
        Command::List => {
            let config = load_config(&path)?;
            let admin = build_admin(&config)?;
            for row in admin.get_automations().await? {
                let a = &row.automation;
                let last = row
                    .last_run
                    .as_ref()
                    .map(|r| format!("{} at {}", r.status, r.started_at.format("%Y-%m-%d %H:%M")))
                    .unwrap_or_else(|| "never".into());
                println!(
                    "{} {:<28} {:<14} last: {}",
                    if a.enabled { "🟢" } else { "⚪" },
                    a.slug,
                    a.schedule,
                    last
                );
            }
        }
        Command::Runs { slug, limit } => {
            let config = load_config(&path)?;
            let admin = build_admin(&config)?;
            print_json(&admin.get_automation_runs(&slug, limit).await?)?;
        }
        Command::Enable { slug } => {
            let config = load_config(&path)?;
            let admin = build_admin(&config)?;
            admin.toggle_automation_enabled(&slug, true).await?;
            println!("🟢 '{slug}' enabled");
        }
        Command::Disable { slug } => {
            let config = load_config(&path)?;
            let admin = build_admin(&config)?;
            admin.toggle_automation_enabled(&slug, false).await?;
            println!("⚪ '{slug}' disabled");
        }
    }

    Ok(())
}
