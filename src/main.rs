//! charms-builder CLI
//!
//! Entry point for the `charms-builder` command-line tool.

use std::env;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use charms_builder::catalog;
use charms_builder::config::{resolve_config_path, EffectiveConfig};
use charms_builder::isolation::{IdentityMapping, IsolationProvider, LxcRuntime};
use charms_builder::report::ExitCode;
use charms_builder::scheduler::{Collaborators, Scheduler, Selection};
use charms_builder::selection::NameFilter;
use charms_builder::signal::{SignalHandler, EXIT_CODE_CANCELLED};
use charms_builder::timeout::Deadlines;
use charms_builder::{generate_run_id, Base};
use charms_process::SystemRunner;
use clap::{ArgAction, Parser, Subcommand};
use serde_json::{json, Map, Value};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "charms-builder")]
#[command(about = "Build charms for every configured base", version)]
struct Cli {
    /// Path to config file (default: charms-builder.toml)
    #[arg(long, short = 'c', global = true)]
    config: Option<PathBuf>,

    /// Working directory; repositories live under <workdir>/repos
    #[arg(long, short = 'w', global = true)]
    workdir: Option<PathBuf>,

    /// Output directory for built charms
    #[arg(long, short = 'C', global = true)]
    charmsdir: Option<PathBuf>,

    /// More logging (-v debug, -vv trace); RUST_LOG overrides
    #[arg(long, short = 'v', action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Sync, resolve and build the selected charms for the selected bases
    Build {
        /// Bases to build for, as <name>-<channel> literals or globs
        #[arg(long, short = 's')]
        series: Vec<String>,

        /// Worker pool size
        #[arg(long, short = 'j')]
        jobs: Option<usize>,

        /// Per-build timeout in seconds
        #[arg(long)]
        timeout: Option<u64>,

        /// Overlay scratch backing
        #[arg(long, value_parser = ["memory", "disk"])]
        scratch: Option<String>,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,

        /// Charm names or glob patterns (default: all)
        patterns: Vec<String>,
    },

    /// List configured charms
    List {
        patterns: Vec<String>,
    },

    /// List charms with at least one built artifact
    ListBuilt {
        /// Only count artifacts built for this base
        #[arg(long, short = 's')]
        series: Option<String>,

        patterns: Vec<String>,
    },

    /// List configured charms that have not been built
    ListMissing {
        #[arg(long, short = 's')]
        series: Option<String>,

        patterns: Vec<String>,
    },

    /// List configured bases
    ListSeries,

    /// Stop instances leaked by earlier runs
    Clean,
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let mut overrides = Map::new();
    if let Some(ref workdir) = cli.workdir {
        overrides.insert("workdir".to_string(), json!(workdir));
    }
    if let Some(ref charmsdir) = cli.charmsdir {
        overrides.insert("charmsdir".to_string(), json!(charmsdir));
    }

    match cli.command {
        Commands::Build {
            series,
            jobs,
            timeout,
            scratch,
            json,
            patterns,
        } => {
            let mut build = Map::new();
            if let Some(jobs) = jobs {
                build.insert("jobs".to_string(), json!(jobs));
            }
            if let Some(timeout) = timeout {
                build.insert("timeout_seconds".to_string(), json!(timeout));
            }
            if let Some(scratch) = scratch {
                build.insert("scratch".to_string(), json!(scratch));
            }
            if !build.is_empty() {
                overrides.insert("build".to_string(), Value::Object(build));
            }
            let effective = load_config(cli.config, overrides);
            run_build(effective, &series, &patterns, json);
        }
        Commands::List { patterns } => {
            let effective = load_config(cli.config, overrides);
            let filter = name_filter(&patterns);
            print_lines(catalog::list(&effective.config, &filter));
        }
        Commands::ListBuilt { series, patterns } => {
            let effective = load_config(cli.config, overrides);
            let base = series.as_deref().map(parse_base);
            let filter = name_filter(&patterns);
            print_lines(catalog::list_built(
                &effective.config.charmsdir,
                base.as_ref(),
                &filter,
            ));
        }
        Commands::ListMissing { series, patterns } => {
            let effective = load_config(cli.config, overrides);
            let base = series.as_deref().map(parse_base);
            let filter = name_filter(&patterns);
            print_lines(catalog::list_missing(&effective.config, base.as_ref(), &filter));
        }
        Commands::ListSeries => {
            let effective = load_config(cli.config, overrides);
            print_lines(catalog::list_series(&effective.config));
        }
        Commands::Clean => {
            let effective = load_config(cli.config, overrides);
            run_clean(&effective);
        }
    }
}

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn fail(message: impl std::fmt::Display) -> ! {
    eprintln!("Error: {}", message);
    process::exit(ExitCode::Config.as_i32());
}

fn load_config(explicit: Option<PathBuf>, overrides: Map<String, Value>) -> EffectiveConfig {
    let cwd = env::current_dir().unwrap_or_else(|e| fail(format!("cannot read current directory: {}", e)));
    let path = resolve_config_path(explicit, &cwd);
    let overrides = if overrides.is_empty() {
        None
    } else {
        Some(Value::Object(overrides))
    };
    EffectiveConfig::build(&path, overrides, &cwd).unwrap_or_else(|e| fail(e))
}

fn name_filter(patterns: &[String]) -> NameFilter {
    NameFilter::new(patterns).unwrap_or_else(|e| fail(e))
}

fn parse_base(series: &str) -> Base {
    Base::parse_series(series).unwrap_or_else(|e| fail(e))
}

fn print_lines(lines: Vec<String>) {
    for line in lines {
        println!("{}", line);
    }
}

fn run_build(effective: EffectiveConfig, series: &[String], patterns: &[String], json_output: bool) {
    let config = &effective.config;
    let selection = Selection {
        charms: name_filter(patterns),
        bases: name_filter(series),
    };

    let signals = SignalHandler::new();
    if let Err(e) = signals.install() {
        warn!(error = %e, "could not install signal handler; interrupts will not cancel cleanly");
    }
    let state = signals.state();
    let deadlines = Deadlines::new(config.timeouts(), state.cancel_flag(), state.abort_flag());

    let run_id = generate_run_id();
    let scheduler = Scheduler::from_config(
        config,
        Collaborators::system(),
        deadlines,
        IdentityMapping::current(),
        run_id,
    );

    let report = scheduler
        .run(&config.charms(), &config.bases(), &selection)
        .with_config_sources(effective.sources.clone());

    let path = report.path_in(&config.runsdir());
    match report.write_to_file(&path) {
        Ok(()) => info!(path = %path.display(), "report written"),
        Err(e) => warn!(path = %path.display(), error = %e, "could not write report"),
    }

    if json_output {
        match report.to_json() {
            Ok(json) => println!("{}", json),
            Err(e) => {
                eprintln!("Error serializing report: {}", e);
                process::exit(ExitCode::Config.as_i32());
            }
        }
    } else {
        print!("{}", report.render());
    }

    if state.is_cancel_requested() {
        process::exit(EXIT_CODE_CANCELLED);
    }
    process::exit(report.exit_code);
}

fn run_clean(effective: &EffectiveConfig) {
    let config = &effective.config;
    let runner = Arc::new(SystemRunner::new());
    let provider = IsolationProvider::new(
        Arc::new(LxcRuntime::new(runner)),
        Deadlines::detached(config.timeouts()),
        config.build.scratch,
        "clean",
    );

    let reaped = provider.reap_leaked().unwrap_or_else(|e| fail(e));
    if reaped.is_empty() {
        println!("No leaked instances");
        return;
    }

    let mut failed = false;
    for instance in reaped {
        match instance.result {
            Ok(()) => println!("stopped {}", instance.name),
            Err(e) => {
                failed = true;
                println!("failed to stop {}: {}", instance.name, e.detail);
            }
        }
    }
    if failed {
        process::exit(ExitCode::TaskFailures.as_i32());
    }
}
