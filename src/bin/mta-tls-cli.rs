use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use serde_json::{json, Value};

use mta_tls::config::loader::{load_config, ConfigError};
use mta_tls::dh::DhParamCache;
use mta_tls::priority::{suite_key_bits, Priority};
use mta_tls::random::bounded_random;
use mta_tls::TlsConfig;

#[derive(Parser)]
#[command(name = "mta-tls-cli")]
#[command(about = "Inspection tool for the MTA TLS subsystem", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Parse and validate a configuration file
    CheckConfig {
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Load or generate the DH parameter cache file
    DhParams {
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Bit strength, overriding the configuration
        #[arg(short, long)]
        bits: Option<u32>,
    },
    /// Show what a priority expression selects
    Priority {
        expression: String,
    },
    /// Print a bounded random number
    Random {
        max: i64,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::CheckConfig { config } => check_config(&config),
        Commands::DhParams { config, bits } => dh_params(config, bits),
        Commands::Priority { expression } => priority(&expression),
        Commands::Random { max } => Ok(json!(bounded_random(max))),
    };

    match result {
        Ok(value) => {
            println!("{}", serde_json::to_string_pretty(&value).unwrap_or_default());
            ExitCode::SUCCESS
        }
        Err(message) => {
            eprintln!("error: {}", message);
            ExitCode::FAILURE
        }
    }
}

fn check_config(path: &PathBuf) -> Result<Value, String> {
    match load_config(path) {
        Ok(config) => Ok(json!({
            "status": "ok",
            "spool_directory": config.spool_directory,
            "dh_bits": config.dh.target_bits(),
            "on_connect": config.server.on_connect,
        })),
        Err(ConfigError::Validation(errors)) => Ok(json!({
            "status": "invalid",
            "errors": errors.iter().map(|e| e.to_string()).collect::<Vec<_>>(),
        })),
        Err(e) => Err(e.to_string()),
    }
}

fn dh_params(path: Option<PathBuf>, bits: Option<u32>) -> Result<Value, String> {
    let config = match path {
        Some(path) => load_config(&path).map_err(|e| e.to_string())?,
        None => TlsConfig::default(),
    };
    let bits = bits.unwrap_or_else(|| config.dh.target_bits());
    let cache = DhParamCache::from_config(&config);
    let params = cache.ensure_params(bits).map_err(|e| e.to_string())?;
    Ok(json!({
        "path": params.path(),
        "bits": params.bits(),
        "prime_bits": params.prime_bits(),
        "group": format!("{:?}", params.group()),
        "origin": params.origin(),
    }))
}

fn priority(expression: &str) -> Result<Value, String> {
    let provider = rustls::crypto::ring::default_provider();
    let priority = Priority::parse(expression, &provider).map_err(|e| e.to_string())?;
    Ok(json!({
        "expression": priority.expression(),
        "versions": priority
            .versions()
            .iter()
            .map(|v| format!("{:?}", v.version))
            .collect::<Vec<_>>(),
        "cipher_suites": priority
            .cipher_suites()
            .iter()
            .map(|s| json!({ "name": format!("{:?}", s.suite()), "key_bits": suite_key_bits(s) }))
            .collect::<Vec<_>>(),
        "groups": priority
            .kx_groups()
            .iter()
            .map(|g| format!("{:?}", g.name()))
            .collect::<Vec<_>>(),
        "compat": priority.compat(),
        "server_precedence": priority.server_precedence(),
    }))
}
