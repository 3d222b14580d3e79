//! Lab-automation protocol analyzer CLI.
//!
//! Provides the `labtrace` binary. `analyze` runs the full analysis
//! pipeline over one procedure in a source file, `resolve` compares a
//! saved analysis record with a physical deck layout, and `contracts`
//! lists the method contract table.
//!
//! Uses the same `Analyzer::analyze()` entry point as library callers, with
//! an in-memory cache that lives for the duration of the command.

use std::fs;
use std::path::{Path, PathBuf};
use std::process;

use clap::{Parser, Subcommand};
use serde::de::DeserializeOwned;
use tracing::debug;
use tracing_subscriber::EnvFilter;

use labtrace_check::{resolve_record, AnalysisConfig, Analyzer, ContractDatabase, PhysicalLayout};
use labtrace_core::{AnalysisRecord, DeckTopology, HierarchyRegistry, ResourceCatalog};
use labtrace_extract::ProcedureSource;
use labtrace_storage::InMemoryCache;

/// Static analysis for lab-automation procedures.
#[derive(Parser)]
#[command(name = "labtrace", about = "Static analysis for lab-automation procedures")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Available subcommands.
#[derive(Subcommand)]
enum Commands {
    /// Analyze one procedure of a source file.
    Analyze {
        /// Path to the source file.
        file: PathBuf,

        /// Name of the procedure to analyze.
        #[arg(short, long)]
        procedure: String,

        /// Deck topology: slot or carrier.
        #[arg(long, env = "LABTRACE_DECK", value_parser = parse_deck)]
        deck: Option<DeckTopology>,

        /// Resource catalog JSON file (default: built-in catalog).
        #[arg(long)]
        catalog: Option<PathBuf>,

        /// Analysis settings JSON file (default: built-in settings).
        #[arg(long)]
        config: Option<PathBuf>,

        /// Physical layout JSON file; prints the setup changes it needs.
        #[arg(long)]
        layout: Option<PathBuf>,

        /// Print the record as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Compare a saved analysis record with a physical layout.
    Resolve {
        /// Analysis record JSON file, as printed by `analyze --json`.
        record: PathBuf,

        /// Physical layout JSON file.
        #[arg(long)]
        layout: PathBuf,

        /// Print the setup delta as JSON.
        #[arg(long)]
        json: bool,
    },
    /// List the method contract table.
    Contracts {
        /// Print the table as JSON.
        #[arg(long)]
        json: bool,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let exit_code = match cli.command {
        Commands::Analyze { file, procedure, deck, catalog, config, layout, json } => {
            run_analyze(&file, procedure, deck, catalog.as_deref(), config.as_deref(), layout.as_deref(), json)
        }
        Commands::Resolve { record, layout, json } => run_resolve(&record, &layout, json),
        Commands::Contracts { json } => run_contracts(json),
    };
    process::exit(exit_code);
}

/// Execute the analyze subcommand.
///
/// Returns exit code: 0 = analyzable, 1 = usage or I/O error,
/// 2 = the procedure cannot be analyzed.
fn run_analyze(
    file: &Path,
    procedure: String,
    deck: Option<DeckTopology>,
    catalog: Option<&Path>,
    config: Option<&Path>,
    layout: Option<&Path>,
    json: bool,
) -> i32 {
    let source = match fs::read_to_string(file) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Error: failed to read '{}': {}", file.display(), e);
            return 1;
        }
    };

    let mut settings = match config {
        Some(path) => match load_json::<AnalysisConfig>(path) {
            Ok(c) => c,
            Err(code) => return code,
        },
        None => AnalysisConfig::default(),
    };
    if let Some(topology) = deck {
        settings.topology = topology;
    }
    let catalog = match catalog {
        Some(path) => match load_json::<ResourceCatalog>(path) {
            Ok(c) => c,
            Err(code) => return code,
        },
        None => ResourceCatalog::standard(),
    };
    let layout = match layout.map(load_json::<PhysicalLayout>).transpose() {
        Ok(l) => l,
        Err(code) => return code,
    };

    let analyzer =
        match Analyzer::new(ContractDatabase::standard(), HierarchyRegistry::standard(), catalog, settings) {
            Ok(a) => a,
            Err(e) => {
                eprintln!("Error: {}", e);
                return 1;
            }
        };
    debug!(version = analyzer.simulation_version(), "analyzer ready");

    let cache = InMemoryCache::new();
    let record = match analyzer.analyze(&ProcedureSource::new(procedure, source), &cache) {
        Ok(r) => r,
        Err(e) => {
            eprintln!("Error: {}", e);
            return 1;
        }
    };
    let delta = layout.as_ref().map(|l| resolve_record(&record, l));

    if json {
        let value = match &delta {
            Some(d) => serde_json::json!({ "record": record, "setup": d }),
            None => serde_json::json!(record),
        };
        print_json(&value);
    } else {
        print!("{}", record.summary());
        if let Some(d) = &delta {
            print_delta(d);
        }
    }

    if record.is_analyzable() {
        0
    } else {
        2
    }
}

/// Execute the resolve subcommand. Returns 0 on success, 1 on I/O error.
fn run_resolve(record: &Path, layout: &Path, json: bool) -> i32 {
    let record = match load_json::<AnalysisRecord>(record) {
        Ok(r) => r,
        Err(code) => return code,
    };
    let layout = match load_json::<PhysicalLayout>(layout) {
        Ok(l) => l,
        Err(code) => return code,
    };
    let delta = resolve_record(&record, &layout);
    if json {
        print_json(&delta);
    } else {
        print_delta(&delta);
    }
    0
}

fn run_contracts(json: bool) -> i32 {
    let contracts = ContractDatabase::standard();
    if json {
        print_json(&contracts);
        return 0;
    }
    println!("contracts {}", contracts.version());
    for entry in contracts.entries() {
        let params: Vec<&str> = entry.signature.params.iter().map(|p| p.name).collect();
        let marker = if entry.contract.is_some() { "" } else { " (no state effects)" };
        println!("  {}.{}({}){}", entry.receiver, entry.method, params.join(", "), marker);
    }
    0
}

fn print_delta(delta: &labtrace_check::SetupDelta) {
    if delta.is_ready() {
        println!("setup: layout is ready");
        return;
    }
    println!("setup: {} change(s) needed", delta.actions.len());
    for action in &delta.actions {
        let line = serde_json::to_string(action).unwrap_or_else(|e| format!("<unprintable action: {}>", e));
        println!("  {}", line);
    }
}

fn print_json<T: serde::Serialize>(value: &T) {
    let json = serde_json::to_string_pretty(value)
        .unwrap_or_else(|e| format!("{{\"error\": \"failed to serialize result: {}\"}}", e));
    println!("{}", json);
}

/// Reads and parses a JSON input file; the error is the exit code.
fn load_json<T: DeserializeOwned>(path: &Path) -> Result<T, i32> {
    let text = fs::read_to_string(path).map_err(|e| {
        eprintln!("Error: failed to read '{}': {}", path.display(), e);
        1
    })?;
    serde_json::from_str(&text).map_err(|e| {
        eprintln!("Error: invalid JSON in '{}': {}", path.display(), e);
        1
    })
}

/// Parse a deck topology name.
fn parse_deck(s: &str) -> Result<DeckTopology, String> {
    match s {
        "slot" | "slot_based" => Ok(DeckTopology::SlotBased),
        "carrier" | "carrier_based" => Ok(DeckTopology::CarrierBased),
        _ => Err(format!("invalid deck topology '{}', expected slot/carrier", s)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deck_names_parse() {
        assert_eq!(parse_deck("slot"), Ok(DeckTopology::SlotBased));
        assert_eq!(parse_deck("carrier"), Ok(DeckTopology::CarrierBased));
        assert!(parse_deck("rack").is_err());
    }

    #[test]
    fn arguments_parse() {
        let cli = Cli::parse_from(["labtrace", "analyze", "p.py", "--procedure", "run", "--deck", "carrier", "--json"]);
        match cli.command {
            Commands::Analyze { procedure, deck, json, .. } => {
                assert_eq!(procedure, "run");
                assert_eq!(deck, Some(DeckTopology::CarrierBased));
                assert!(json);
            }
            _ => panic!("expected analyze"),
        }
    }
}
