//! tollgate CLI - download entitlement inspection and admin tooling
//!
//! A command-line surface over the entitlement engine:
//! - register purchases and request guarded downloads
//! - inspect per-product eligibility and cooldown state
//! - watch the live countdown for a product
//! - admin-reset an entitlement across every store
//!
//! Logs go to stderr (filtered by `TOLLGATE_LOG`); stdout stays
//! machine-readable for `--format json`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tollgate::{
    ChannelTarget, DownloadGrant, EntitlementEngine, HttpAuthority, JsonFileOwnedProducts,
    JsonFileStore, KeyCodec, ProductStatus, ProductStore, ResetBroadcast, ResetReport,
    ScriptedAuthority, TollgateConfig, TollgateError,
};

// =============================================================================
// CLI Definition
// =============================================================================

/// tollgate - time-boxed, rate-limited download entitlements
#[derive(Parser, Debug)]
#[command(name = "tollgate")]
#[command(about = "Download entitlement engine", long_about = None)]
#[command(version)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Which download authority to talk to
    #[arg(long, global = true, value_enum)]
    authority: Option<AuthorityKind>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

/// Download authority backend selector.
#[derive(Clone, Copy, Debug, ValueEnum)]
enum AuthorityKind {
    /// The configured HTTP backend
    Http,
    /// In-process fake that self-counts downloads (offline demo)
    Scripted,
}

#[derive(Clone, Copy, Debug, Default, ValueEnum)]
enum OutputFormat {
    #[default]
    Human,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Register a confirmed purchase
    Purchase {
        /// Product key
        product_key: String,
    },

    /// Show eligibility and cooldown state for a product
    Status {
        product_key: String,

        #[arg(long, value_enum, default_value = "human")]
        format: OutputFormat,
    },

    /// Request a guarded download (cooldown, limits, authority grant)
    Download {
        product_key: String,

        /// Deadline for the authority call, in seconds
        #[arg(long)]
        timeout_secs: Option<u64>,

        #[arg(long, value_enum, default_value = "human")]
        format: OutputFormat,
    },

    /// Watch the live countdown until a terminal state or Ctrl-C
    Watch { product_key: String },

    /// Admin reset: invalidate the entitlement everywhere
    Reset {
        product_key: String,

        /// Leave the authoritative remote store untouched
        #[arg(long)]
        skip_remote: bool,

        #[arg(long, value_enum, default_value = "human")]
        format: OutputFormat,
    },

    /// List all locally stored entitlements with their states
    List {
        #[arg(long, value_enum, default_value = "human")]
        format: OutputFormat,
    },

    /// Show or modify configuration
    Config {
        #[command(subcommand)]
        action: ConfigCommands,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCommands {
    /// Print one configuration value
    Get { key: String },
    /// Set one configuration value and save the file
    Set { key: String, value: String },
    /// List every configuration key with its current value
    List,
    /// Print the configuration file path
    Path,
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        tracing_subscriber::EnvFilter::new("debug")
    } else {
        tracing_subscriber::EnvFilter::try_from_env("TOLLGATE_LOG")
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(TollgateConfig::default_path);
    let config = TollgateConfig::load_from(config_path.clone());

    match cli.command {
        Commands::Purchase { product_key } => {
            let engine = build_engine(&config, cli.authority)?;
            let record = engine.register_purchase(&product_key).await?;
            println!(
                "Purchase registered for '{product_key}' at {}",
                format_timestamp(record.purchase_timestamp)
            );
        }

        Commands::Status {
            product_key,
            format,
        } => {
            let engine = build_engine(&config, cli.authority)?;
            let status = engine.status(&product_key).await?;
            match format {
                OutputFormat::Human => print_status(&status),
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&status)?),
            }
        }

        Commands::Download {
            product_key,
            timeout_secs,
            format,
        } => {
            let engine = build_engine(&config, cli.authority)?;
            let timeout = timeout_secs.map(Duration::from_secs);
            match engine.request_download(&product_key, timeout).await {
                Ok(grant) => match format {
                    OutputFormat::Human => print_grant(&product_key, &grant),
                    OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&grant)?),
                },
                Err(err) => {
                    print_download_refusal(&err);
                    return Err(err.into());
                }
            }
        }

        Commands::Watch { product_key } => {
            let engine = build_engine(&config, cli.authority)?;
            watch(&engine, &product_key).await?;
        }

        Commands::Reset {
            product_key,
            skip_remote,
            format,
        } => {
            let engine = build_engine(&config, cli.authority)?;
            let report = engine.reset(&product_key, skip_remote).await?;
            match format {
                OutputFormat::Human => print_reset_report(&report),
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
            }
        }

        Commands::List { format } => {
            let engine = build_engine(&config, cli.authority)?;
            let statuses = engine.list().await?;
            match format {
                OutputFormat::Human => {
                    if statuses.is_empty() {
                        println!("No entitlements stored.");
                    }
                    for status in &statuses {
                        println!(
                            "{:<30} {:<14} {} left, {} downloads remaining",
                            status.product_key,
                            format!("{:?}", status.snapshot.state),
                            format_duration_ms(status.snapshot.remaining_time_ms),
                            status.snapshot.remaining_downloads,
                        );
                    }
                }
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&statuses)?),
            }
        }

        Commands::Config { action } => handle_config(action, config, config_path)?,
    }

    Ok(())
}

// =============================================================================
// Engine Wiring
// =============================================================================

fn build_engine(
    config: &TollgateConfig,
    authority: Option<AuthorityKind>,
) -> anyhow::Result<Arc<EntitlementEngine>> {
    let data_dir = config.data_dir();
    let store = ProductStore::new(
        Arc::new(JsonFileStore::new(data_dir.join("store"))),
        KeyCodec::default(),
    );
    let owned = Arc::new(JsonFileOwnedProducts::new(
        data_dir.join("owned-products.json"),
    ));
    let broadcast = Arc::new(ResetBroadcast::new(Some(data_dir.join("last-reset.json"))));

    let kind = match authority {
        Some(kind) => kind,
        None if config.authority.endpoint.is_empty() => {
            tracing::info!("no authority endpoint configured, using the scripted authority");
            AuthorityKind::Scripted
        }
        None => AuthorityKind::Http,
    };

    let timeout = Duration::from_secs(config.authority.timeout_seconds);
    let builder = match kind {
        AuthorityKind::Http => {
            if config.authority.endpoint.is_empty() {
                anyhow::bail!(
                    "no authority endpoint configured; set authority.endpoint or pass --authority scripted"
                );
            }
            let http = Arc::new(HttpAuthority::new(config.authority.endpoint.clone(), timeout));
            EntitlementEngine::builder(store, http.clone()).remote(http)
        }
        AuthorityKind::Scripted => {
            let scripted = Arc::new(ScriptedAuthority::demo());
            EntitlementEngine::builder(store, scripted.clone()).remote(scripted)
        }
    };

    Ok(builder
        .owned_products(owned)
        .broadcast(broadcast)
        .params(config.engine.params())
        .authority_timeout(timeout)
        .build())
}

// =============================================================================
// Watch Handler
// =============================================================================

async fn watch(engine: &Arc<EntitlementEngine>, product_key: &str) -> anyhow::Result<()> {
    let (target, mut rx) = ChannelTarget::new();
    let id = engine.registry().register(product_key, target).await;
    engine.start_countdown(product_key).await?;

    println!("Watching '{product_key}' (Ctrl-C to stop)");
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!();
                break;
            }
            snapshot = rx.recv() => {
                let Some((_, snapshot)) = snapshot else { break };
                println!(
                    "[{:?}] {} remaining, {} downloads left",
                    snapshot.state,
                    format_duration_ms(snapshot.remaining_time_ms),
                    snapshot.remaining_downloads,
                );
                if snapshot.state.is_terminal() {
                    break;
                }
            }
        }
    }

    engine.registry().unregister(product_key, id).await;
    engine.stop_countdown(product_key).await?;
    Ok(())
}

// =============================================================================
// Config Handler
// =============================================================================

fn handle_config(
    action: ConfigCommands,
    mut config: TollgateConfig,
    config_path: PathBuf,
) -> anyhow::Result<()> {
    match action {
        ConfigCommands::Get { key } => match config.get(&key) {
            Some(value) => println!("{value}"),
            None => anyhow::bail!("Unknown configuration key: {key}"),
        },
        ConfigCommands::Set { key, value } => {
            config.set(&key, &value)?;
            config.save_to(config_path)?;
            println!("Set {key} = {value}");
        }
        ConfigCommands::List => {
            for (key, value) in config.list() {
                println!("{key} = {value}");
            }
        }
        ConfigCommands::Path => println!("{}", config_path.display()),
    }
    Ok(())
}

// =============================================================================
// Output Formatting
// =============================================================================

fn print_status(status: &ProductStatus) {
    println!("Product:             {}", status.product_key);
    println!("State:               {:?}", status.snapshot.state);
    if let Some(record) = &status.record {
        println!(
            "Purchased:           {}",
            format_timestamp(record.purchase_timestamp)
        );
        println!("Downloads used:      {}", record.download_count);
    }
    println!(
        "Time remaining:      {}",
        format_duration_ms(status.snapshot.remaining_time_ms)
    );
    println!(
        "Downloads remaining: {}",
        status.snapshot.remaining_downloads
    );
    if status.cooldown.allowed {
        println!("Cooldown:            ready");
    } else {
        println!("Cooldown:            {}s left", status.cooldown.seconds_left);
    }
}

fn print_grant(product_key: &str, grant: &DownloadGrant) {
    println!("Download granted for '{product_key}'");
    println!("  File:                {}", grant.file_name);
    println!("  URL:                 {}", grant.download_url);
    println!("  URL valid for:       {}s", grant.expires_in);
    println!("  Downloads remaining: {}", grant.remaining_downloads);
}

fn print_download_refusal(err: &TollgateError) {
    match err {
        TollgateError::CooldownActive { seconds_left } => {
            eprintln!("Please wait {seconds_left}s before the next download.")
        }
        TollgateError::Expired { .. } => {
            eprintln!("The 48-hour download window for this purchase has expired.")
        }
        TollgateError::LimitReached { .. } => {
            eprintln!("All downloads for this purchase have been used.")
        }
        _ => {}
    }
}

fn print_reset_report(report: &ResetReport) {
    println!("Reset {} for '{}'", report.id, report.product_key);
    println!("  Aliases cleared:   {}", report.keys.join(", "));
    println!("  Local deletes:     {}", report.local_deleted);
    if report.remote_attempted == 0 {
        println!("  Remote:            skipped");
    } else if report.remote_clean() {
        println!("  Remote:            {} deleted", report.remote_attempted);
    } else {
        println!(
            "  Remote:            {} of {} failed (local reset is complete)",
            report.remote_failures.len(),
            report.remote_attempted
        );
        for failure in &report.remote_failures {
            println!("    {} -> {}: {}", failure.key, failure.code, failure.message);
        }
    }
}

fn format_timestamp(epoch_ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(epoch_ms)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| format!("{epoch_ms}ms"))
}

fn format_duration_ms(ms: i64) -> String {
    let total_secs = (ms.max(0)) / 1000;
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;
    format!("{hours:02}:{minutes:02}:{seconds:02}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_duration_clamps_and_renders() {
        assert_eq!(format_duration_ms(0), "00:00:00");
        assert_eq!(format_duration_ms(-500), "00:00:00");
        assert_eq!(format_duration_ms(61_000), "00:01:01");
        assert_eq!(format_duration_ms(48 * 60 * 60 * 1000), "48:00:00");
    }

    #[test]
    fn test_format_timestamp() {
        assert_eq!(
            format_timestamp(1_700_000_000_000),
            "2023-11-14 22:13:20 UTC"
        );
    }

    #[test]
    fn test_cli_parses() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
