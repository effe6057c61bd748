//! hmull - parallel writers, one shared store

use anyhow::{Context, Result};
use clap::Parser;
use owo_colors::{OwoColorize, Stream::Stderr};
use tracing::{Level, info};

use hmull::cli::{Cli, Commands, PoolArgs};
use hmull::coordinator::{Coordinator, CoordinatorConfig, RunReport, sweep_sizes};
use hmull::logging::{self, LogConfig, LogRouter};
use hmull::paths::AppPaths;

fn main() {
    let cli = Cli::parse();

    // Workers never touch the coordinator's logging or colors.
    if let Commands::Worker = cli.command {
        hmull::worker::run_worker_main();
    }

    if cli.no_color {
        owo_colors::set_override(false);
    }

    let result = run(&cli);

    if let Err(e) = result {
        eprintln!(
            "{}: {}",
            "error"
                .if_supports_color(Stderr, |text| text.red())
                .if_supports_color(Stderr, |text| text.bold()),
            e
        );
        // Print the error chain if there are causes
        for cause in e.chain().skip(1) {
            eprintln!(
                "  {}: {}",
                "caused by".if_supports_color(Stderr, |text| text.yellow()),
                cause
            );
        }
        std::process::exit(1);
    }
}

fn run(cli: &Cli) -> Result<()> {
    let paths = AppPaths::from_root(&cli.root)
        .with_context(|| format!("cannot prepare run directory {}", cli.root.display()))?;
    let log_config = log_config(cli, &paths);
    let log_filter = log_config.filter_directive();
    let router = logging::init(log_config).context("cannot initialize logging")?;

    match &cli.command {
        Commands::Run(args) => {
            let mut coordinator = start(&paths, &args.pool, log_filter, &router)?;
            let report = coordinator
                .process(args.jobs, args.ops)
                .with_context(|| format!("run of {} jobs x {} ops failed", args.jobs, args.ops))?;
            coordinator.shutdown()?;
            print_report(&report);
            Ok(())
        }
        Commands::Sweep(args) => {
            let sizes = sweep_sizes(args.start, args.stop, args.step)?;
            let mut coordinator = start(&paths, &args.pool, log_filter, &router)?;
            for n in sizes {
                let report = coordinator
                    .process(n, n)
                    .with_context(|| format!("sweep step {} failed", n))?;
                print_report(&report);
            }
            coordinator.shutdown()?;
            Ok(())
        }
        Commands::Worker => hmull::worker::run_worker_main(),
    }
}

fn log_config(cli: &Cli, paths: &AppPaths) -> LogConfig {
    let mut config = LogConfig::new().with_file(paths.log_file());
    if cli.no_color {
        config = config.with_ansi(false);
    }
    if let Some(format) = cli.log_format {
        config = config.with_format(format.into());
    }
    if let Some(rotation) = cli.log_rotation {
        config = config.with_rotation(rotation.into());
    }
    // Explicit flags win over HMULL_LOG / RUST_LOG.
    if cli.quiet {
        config = config.with_filter("error".to_string());
    } else if cli.verbose > 0 {
        let level = if cli.verbose == 1 {
            Level::DEBUG
        } else {
            Level::TRACE
        };
        config = config.with_filter(level.to_string().to_lowercase());
    }
    config.with_env_overrides()
}

fn start(
    paths: &AppPaths,
    args: &PoolArgs,
    log_filter: String,
    router: &LogRouter,
) -> Result<Coordinator> {
    let config = CoordinatorConfig::from_paths(paths)
        .with_workers(args.workers)
        .with_batch_size(args.batch_size)
        .with_progress(args.progress)
        .with_keep_store(args.keep_store)
        .with_work_delay_ms(args.work_delay_ms)
        .with_lock_trace(args.lock_trace.clone())
        .with_log_filter(log_filter);

    info!(root = %paths.root.display(), "starting coordinator");
    Coordinator::new(config, router).context("cannot start coordinator")
}

fn print_report(report: &RunReport) {
    println!(
        "jobs={} ops={} written={} total={} elapsed={:.3}s",
        report.jobs,
        report.ops,
        report.written,
        report.after,
        report.elapsed.as_secs_f64()
    );
}
