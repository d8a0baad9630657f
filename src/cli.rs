//! Command-line interface.
//!
//! With no subcommand the binary serves JSON-RPC on stdio. The other
//! commands operate on the configured database directly, for batch ingestion
//! and inspection.

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::ingest::{VerdictIngestor, VerdictPayload};
use crate::storage::{FunctionCallId, SqliteStorage, Storage};

/// Verdict store command line.
#[derive(Parser, Debug)]
#[command(name = "verdict-store", version, about)]
pub struct Cli {
    /// Subcommand to run; defaults to `serve`.
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Verdict store subcommands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Serve JSON-RPC requests on stdin/stdout
    Serve,

    /// Insert verdicts from a file with one JSON payload per line
    Ingest {
        /// Path to the JSON lines file
        file: PathBuf,

        /// Keep going after a rejected payload
        #[arg(long)]
        keep_going: bool,
    },

    /// Print a function call's path chain
    Chain {
        /// Function call id
        function_call: i64,
    },

    /// Print a function call's verdicts and observations
    Verdicts {
        /// Function call id
        function_call: i64,
    },
}

/// Result of CLI command execution.
#[derive(Debug)]
pub struct CliResult {
    /// Exit code (0 = success)
    pub exit_code: i32,
    /// Output message
    pub message: String,
}

impl CliResult {
    /// Create a success result with the given message.
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            message: message.into(),
        }
    }

    /// Create an error result with the given message.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            exit_code: 1,
            message: message.into(),
        }
    }
}

/// Execute a non-serving CLI command.
///
/// `Serve` is handled by the binary itself and reported as an error here.
pub async fn execute_command(
    command: Commands,
    storage: &SqliteStorage,
    ingestor: &VerdictIngestor,
) -> CliResult {
    match command {
        Commands::Serve => CliResult::error("serve is not a batch command"),
        Commands::Ingest { file, keep_going } => execute_ingest(ingestor, &file, keep_going).await,
        Commands::Chain { function_call } => {
            execute_chain(storage, FunctionCallId(function_call)).await
        }
        Commands::Verdicts { function_call } => {
            execute_verdicts(storage, FunctionCallId(function_call)).await
        }
    }
}

async fn execute_ingest(ingestor: &VerdictIngestor, file: &Path, keep_going: bool) -> CliResult {
    let handle = match tokio::fs::File::open(file).await {
        Ok(h) => h,
        Err(e) => return CliResult::error(format!("Cannot open {}: {}", file.display(), e)),
    };

    let mut lines = BufReader::new(handle).lines();
    let mut inserted = 0usize;
    let mut rejected = Vec::new();
    let mut line_number = 0usize;

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => return CliResult::error(format!("Read error after line {}: {}", line_number, e)),
        };
        line_number += 1;
        if line.trim().is_empty() {
            continue;
        }

        let outcome = match serde_json::from_str::<VerdictPayload>(&line) {
            Ok(payload) => ingestor.insert(&payload).await.map_err(|e| e.to_string()),
            Err(e) => Err(format!("invalid JSON: {}", e)),
        };

        match outcome {
            Ok(_) => inserted += 1,
            Err(reason) => {
                tracing::warn!(line = line_number, reason = %reason, "Payload rejected");
                rejected.push(format!("  line {}: {}", line_number, reason));
                if !keep_going {
                    break;
                }
            }
        }
    }

    let mut output = format!("Inserted {} verdict(s)", inserted);
    if rejected.is_empty() {
        return CliResult::success(output);
    }
    output.push_str(&format!(", rejected {}:\n{}", rejected.len(), rejected.join("\n")));
    CliResult::error(output)
}

async fn execute_chain(storage: &SqliteStorage, function_call: FunctionCallId) -> CliResult {
    let chain = match storage.load_chain(function_call).await {
        Ok(chain) => chain,
        Err(e) => return CliResult::error(format!("Failed to load chain: {}", e)),
    };
    if chain.is_empty() {
        return CliResult::success(format!("Function call {} has no chain", function_call));
    }

    let mut output = format!("Chain of function call {}:\n", function_call);
    for node in &chain {
        let text = match storage.condition_text(node.condition_atom).await {
            Ok(Some(text)) if text.is_empty() => "<root>".to_string(),
            Ok(Some(text)) => text,
            Ok(None) => "<unknown>".to_string(),
            Err(e) => return CliResult::error(format!("Failed to load condition: {}", e)),
        };
        output.push_str(&format!(
            "  [{}] node {} condition {}: {}\n",
            node.depth, node.id, node.condition_atom, text
        ));
    }
    CliResult::success(output)
}

async fn execute_verdicts(storage: &SqliteStorage, function_call: FunctionCallId) -> CliResult {
    let verdicts = match storage.verdicts_for_call(function_call).await {
        Ok(v) => v,
        Err(e) => return CliResult::error(format!("Failed to load verdicts: {}", e)),
    };

    let mut output = format!(
        "Function call {}: {} verdict(s)\n",
        function_call,
        verdicts.len()
    );
    for verdict in &verdicts {
        output.push_str(&format!(
            "  verdict {} {} at {} (binding {}, collapsing atom {})\n",
            verdict.id,
            if verdict.outcome { "PASS" } else { "FAIL" },
            verdict.time_obtained.to_rfc3339(),
            verdict.binding,
            verdict.collapsing_atom
        ));
        match storage.observations_for_verdict(verdict.id).await {
            Ok(observations) => {
                for obs in observations {
                    output.push_str(&format!(
                        "    atom {} = {} at node {}\n",
                        obs.atom_index, obs.observed_value, obs.chain_node
                    ));
                }
            }
            Err(e) => return CliResult::error(format!("Failed to load observations: {}", e)),
        }
    }
    CliResult::success(output)
}
