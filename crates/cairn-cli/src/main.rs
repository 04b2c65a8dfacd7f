use clap::Parser;
use tracing::{info, warn};

use cairn_core::commands::host_update::{self, HostUpdateOptions};
use cairn_core::commands::pool_update::{self, PoolUpdateOptions};
use cairn_core::config::{self, CairnConfig};
use cairn_core::context::MaintenanceContext;
use cairn_core::error::{CairnError, Result};
use cairn_core::pool::SHARD_COUNT;
use cairn_core::progress::{ProgressSink, ProtocolProgress, SilentProgress};
use cairn_core::walker::BackupRefScanner;

#[derive(Parser)]
#[command(
    name = "cairn-refcount",
    version,
    about = "Update, verify, and clean pool reference counts",
    disable_help_flag = true,
    after_help = "\
Single-host mode (-h) folds the host's pending deltas; with -f it rebuilds
the host's counts from its backups, and -c additionally compares the rebuilt
counts against the existing ones.

Global mode (-m) reconciles every host, then aggregates per-shard pool
counts; -c reclaims unreferenced pool objects and -s prints per-shard stats.

Configuration file lookup order:
  1. --config <path>     (explicit flag)
  2. $CAIRN_CONFIG       (environment variable)
  3. ./cairn.yaml        (working directory)"
)]
struct Cli {
    /// Path to configuration file
    #[arg(long)]
    config: Option<String>,

    /// Single-host mode: process only this host
    #[arg(short = 'h', long = "host", value_name = "HOST")]
    host: Option<String>,

    /// Global mode: all hosts, then the pool shards
    #[arg(short = 'm', long = "pool")]
    global: bool,

    /// Rebuild host counts by walking the backups
    #[arg(short = 'f', long = "force")]
    force: bool,

    /// With -m: clean the pool. With -h -f: compare rebuilt counts
    #[arg(short = 'c', long = "clean")]
    clean: bool,

    /// Print per-shard pool statistics (implied by -m -c)
    #[arg(short = 's', long = "stats")]
    stats: bool,

    /// Suppress progress output
    #[arg(short = 'p', long = "no-progress")]
    no_progress: bool,

    /// Restrict the pool pass to directory range N-M (0-255)
    #[arg(short = 'r', long = "range", value_name = "N-M")]
    range: Option<String>,

    /// Full-scan phase slice
    #[arg(short = 'P', long = "phase", value_name = "PHASE",
          default_value_t = 0, value_parser = clap::value_parser!(u32).range(0..=15))]
    phase: u32,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    verbose: u8,

    #[arg(long, action = clap::ArgAction::Help, help = "Print help")]
    help: Option<bool>,
}

fn main() {
    let cli = Cli::parse();
    match run(cli) {
        Ok(exit_code) => std::process::exit(exit_code),
        Err(e) => {
            eprintln!("cairn-refcount: {e}");
            std::process::exit(1);
        }
    }
}

fn run(cli: Cli) -> Result<i32> {
    if cli.host.is_some() == cli.global {
        return Err(CairnError::BadArgs(
            "exactly one of -h HOST or -m is required".into(),
        ));
    }
    if cli.range.is_some() && !cli.global {
        return Err(CairnError::BadArgs("-r only applies to -m".into()));
    }
    let (shard_start, shard_end) = match cli.range.as_deref() {
        Some(spec) => parse_shard_range(spec)?,
        None => (0, SHARD_COUNT - 1),
    };

    let config_path = config::resolve_config_path(cli.config.as_deref()).ok_or_else(|| {
        CairnError::Config(
            "no configuration file found (try --config, $CAIRN_CONFIG, or ./cairn.yaml)".into(),
        )
    })?;
    let config = CairnConfig::load(&config_path)?;

    init_logging(&config, cli.verbose);
    info!("using config: {}", config_path.display());

    let mut progress: Box<dyn ProgressSink> = if cli.no_progress {
        Box::new(SilentProgress)
    } else {
        Box::new(ProtocolProgress)
    };
    progress.start();

    let errors = {
        let mut ctx = MaintenanceContext::new(&config, progress.as_mut());
        let walker = BackupRefScanner;

        if let Some(ref host) = cli.host {
            let opts = HostUpdateOptions {
                force_rebuild: cli.force,
                check_host_pool: cli.clean,
            };
            let stats = host_update::run(&mut ctx, host, &walker, &opts);
            info!(
                "host {host}: {} deltas applied, {} shards published, {} errors",
                stats.deltas_applied, stats.shards_published, stats.errors
            );
        } else {
            let hosts = ctx.config.hosts()?;
            for host in &hosts {
                let opts = HostUpdateOptions {
                    force_rebuild: cli.force,
                    check_host_pool: false,
                };
                host_update::run(&mut ctx, host, &walker, &opts);
            }

            if ctx.errors() > 0 {
                // Summing over inconsistent host databases would bake the
                // damage into the pool counts.
                warn!(
                    "skipping pool count update: host passes reported {} errors",
                    ctx.errors()
                );
            } else {
                let opts = PoolUpdateOptions {
                    shard_start,
                    shard_end,
                    phase: cli.phase,
                    clean: cli.clean,
                    emit_stats: cli.stats || cli.clean,
                };
                let totals = pool_update::run(&mut ctx, &hosts, &opts);
                info!(
                    "pool pass: {} objects, {} links, {} removed",
                    totals.file_cnt, totals.file_link_total, totals.file_cnt_rm
                );
            }
        }
        ctx.errors()
    };

    progress.finish();
    println!("total errors: {errors}");
    Ok(if errors > 0 { 1 } else { 0 })
}

fn init_logging(config: &CairnConfig, verbose: u8) {
    let level = (verbose as u32).max(config.xfer_log_level);
    let filter = match level {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

/// Parse `-r N-M` (0-255 directory indices) into an inclusive top-shard
/// range. The mapping divides by two, so adjacent odd/even indices land on
/// the same shard.
fn parse_shard_range(spec: &str) -> Result<(u8, u8)> {
    let invalid = || CairnError::BadArgs(format!("invalid range '{spec}' (expected N-M, 0-255)"));
    let (low, high) = spec.split_once('-').ok_or_else(invalid)?;
    let low: u16 = low.trim().parse().map_err(|_| invalid())?;
    let high: u16 = high.trim().parse().map_err(|_| invalid())?;
    if low > high || high > 255 {
        return Err(invalid());
    }
    Ok(((low / 2) as u8, (high / 2) as u8))
}
