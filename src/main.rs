use std::{
    fs,
    path::{Path, PathBuf},
};

use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use capledger::{
    config::{AppConfig, CatalogKind},
    script::{self, Script, StepReport},
    Registry,
};

#[derive(Parser, Debug)]
#[command(
    name = "capledger",
    version,
    about = "Capability registry: create contracts, coerce references, exercise interface choices"
)]
struct Cli {
    /// JSON config file (seed, catalog, log_filter)
    #[arg(long, short = 'c', value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Contract id seed; random when neither this nor the config sets one
    #[arg(long, global = true)]
    seed: Option<u64>,

    /// Bundled catalog to load
    #[arg(long, value_enum, global = true)]
    catalog: Option<CatalogKind>,

    /// Log filter, e.g. `debug` or `capledger=trace` (overrides RUST_LOG)
    #[arg(long = "log", value_name = "FILTER", global = true)]
    log: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the canonical walkthrough for the selected catalog
    Scenario,
    /// Print the catalog's templates, interfaces and conformance as JSON
    Describe,
    /// Replay a JSON step script
    Run {
        script: PathBuf,
        /// Print the final ledger snapshot
        #[arg(long)]
        dump: bool,
    },
}

fn fail(code: i32, msg: impl std::fmt::Display) -> ! {
    eprintln!("error: {msg}");
    std::process::exit(code)
}

fn init_logging(cli_filter: Option<&str>, config: &AppConfig) {
    let filter = match cli_filter {
        Some(f) => EnvFilter::new(f),
        None => EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(config.log_filter())),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(cli: &Cli) -> AppConfig {
    let base = match &cli.config {
        Some(path) => match AppConfig::load(path) {
            Ok(config) => config,
            Err(err) => {
                eprintln!("error: {err}");
                std::process::exit(2);
            }
        },
        None => AppConfig::default(),
    };
    base.merge(cli.seed, cli.catalog, cli.log.clone())
}

fn build_registry(config: &AppConfig) -> Registry {
    let catalog = match config.catalog.build() {
        Ok(catalog) => catalog,
        Err(err) => fail(2, format!("catalog {:?}: {err}", config.catalog)),
    };
    let seed = config.seed_or_random();
    info!(catalog = ?config.catalog, seed, "registry initialised");
    Registry::new(catalog, seed)
}

fn to_json<T: serde::Serialize>(value: &T) -> String {
    match serde_json::to_string_pretty(value) {
        Ok(s) => s,
        Err(err) => fail(1, format!("json encode: {err}")),
    }
}

fn print_reports(reports: &[StepReport]) {
    for report in reports {
        let outcome = serde_json::to_string(&report.outcome).unwrap_or_default();
        println!("[{:02}] {:<15} {}", report.index, report.op, outcome);
    }
}

fn scenario_cmd(config: &AppConfig) {
    let mut registry = build_registry(config);
    match script::scenario(config.catalog).run(&mut registry) {
        Ok(reports) => {
            print_reports(&reports);
            println!("scenario ok ({} transactions)", registry.receipts().len());
        }
        Err(err) => fail(1, err),
    }
}

fn describe_cmd(config: &AppConfig) {
    let registry = build_registry(config);
    println!("{}", to_json(&registry.catalog().describe()));
}

fn run_cmd(config: &AppConfig, path: &Path, dump: bool) {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) => fail(2, format!("cannot read {}: {err}", path.display())),
    };
    let script = match Script::from_slice(&bytes) {
        Ok(script) => script,
        Err(err) => fail(2, format!("invalid script {}: {err}", path.display())),
    };
    let mut registry = build_registry(config);
    let result = script.run(&mut registry);
    if dump {
        println!("{}", to_json(&registry.snapshot()));
    }
    match result {
        Ok(reports) => print_reports(&reports),
        Err(err) => fail(1, err),
    }
}

fn main() {
    let cli = Cli::parse();
    let config = load_config(&cli);
    init_logging(cli.log.as_deref(), &config);

    match &cli.command {
        Command::Scenario => scenario_cmd(&config),
        Command::Describe => describe_cmd(&config),
        Command::Run { script, dump } => run_cmd(&config, script, *dump),
    }
}
