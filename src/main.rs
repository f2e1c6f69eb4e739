//! stepwise - Amazon States Language workflow runner
//!
//! Validates definitions and runs them locally against the built-in resources.

use clap::{Parser, Subcommand};
use colored::Colorize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use stepwise_core::{Definition, HistoryEvent, ResourceRegistry};
use stepwise_runtime::resources::register_builtins;
use stepwise_runtime::{Config, ExecutionDescription, ExecutionStatus, WorkflowEngine};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "stepwise")]
#[command(about = "Run Amazon States Language workflows locally")]
#[command(version)]
struct Cli {
    /// Path to a YAML config file
    #[arg(short, long, env = "STEPWISE_CONFIG", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check that a definition compiles
    Validate {
        /// Definition file (JSON)
        definition: PathBuf,
    },

    /// Run a definition to completion
    Run {
        /// Definition file (JSON)
        definition: PathBuf,

        /// Execution input JSON (or @file.json to read from file)
        #[arg(short, long)]
        input: Option<String>,

        /// Execution name (defaults to a UUID)
        #[arg(short, long)]
        name: Option<String>,

        /// State machine name
        #[arg(long, default_value = "local")]
        machine: String,

        /// Role ARN recorded on the state machine
        #[arg(long, default_value = "arn:aws:iam::123456789012:role/stepwise-local")]
        role_arn: String,

        /// Print the execution history
        #[arg(long)]
        history: bool,

        /// Print the result as JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// List the built-in resources
    Resources,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let config = match load_config(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}: {}", "Error".red(), e);
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.logging.level)),
        )
        .init();

    match cli.command {
        Commands::Validate { definition } => {
            let document = read_json(&definition)?;
            match Definition::compile(&document) {
                Ok(compiled) => {
                    println!(
                        "{} {} ({} states, checksum {})",
                        "Valid".green(),
                        definition.display(),
                        compiled.states.len(),
                        compiled.checksum
                    );
                }
                Err(e) => {
                    eprintln!("{} {}: {}", "Invalid".red(), definition.display(), e);
                    std::process::exit(1);
                }
            }
        }
        Commands::Run {
            definition,
            input,
            name,
            machine,
            role_arn,
            history,
            json,
        } => {
            let document = read_json(&definition)?;
            let input = input.as_deref().map(parse_json_arg).transpose()?;

            let registry = ResourceRegistry::new();
            register_builtins(&registry);
            let engine = WorkflowEngine::new(&config, Arc::new(registry));

            let machine_arn = engine.create_state_machine(&machine, &document, &role_arn)?;
            let started = engine.start_execution(&machine_arn, name.as_deref(), input)?;
            tracing::info!(execution = %started.execution_arn, "started");
            let execution = engine.execution(&started.execution_arn)?;

            let description = tokio::select! {
                description = execution.wait() => description,
                _ = tokio::signal::ctrl_c() => {
                    eprintln!("\n{}", "Stopping execution...".dimmed());
                    if let Err(e) = engine.stop_execution(
                        &started.execution_arn,
                        Some("Interrupted"),
                        Some("stopped from the command line"),
                    ) {
                        tracing::warn!(error = %e, "stop request ignored");
                    }
                    execution.wait().await
                }
            };
            let events = if history {
                engine.get_execution_history(&started.execution_arn)?
            } else {
                Vec::new()
            };

            if json {
                let mut report = serde_json::to_value(&description)?;
                if history {
                    report["events"] = serde_json::to_value(&events)?;
                }
                println!("{}", format_json(&report));
            } else {
                if history {
                    print_history(&events);
                }
                print_description(&description);
            }

            if description.status != ExecutionStatus::Succeeded {
                std::process::exit(1);
            }
        }
        Commands::Resources => {
            let registry = ResourceRegistry::new();
            register_builtins(&registry);
            for resource in registry.resources() {
                println!("{}", resource);
            }
        }
    }

    Ok(())
}

/// Loads the config file if given (else `STEPWISE_CONFIG`), then applies environment overrides.
fn load_config(path: Option<&Path>) -> Result<Config, Box<dyn std::error::Error>> {
    let config = match path {
        Some(path) => {
            let mut config = Config::from_file(path)?;
            config.apply_env_overrides();
            config
        }
        None => Config::load()?,
    };
    config.validate()?;
    Ok(config)
}

fn read_json(path: &Path) -> Result<Value, Box<dyn std::error::Error>> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| format!("failed to read '{}': {}", path.display(), e))?;
    Ok(serde_json::from_str(&content)
        .map_err(|e| format!("'{}' is not valid JSON: {}", path.display(), e))?)
}

/// Parses a JSON argument (either inline JSON or @file.json).
fn parse_json_arg(arg: &str) -> Result<Value, Box<dyn std::error::Error>> {
    if let Some(path) = arg.strip_prefix('@') {
        read_json(Path::new(path))
    } else {
        Ok(serde_json::from_str(arg)?)
    }
}

/// Formats JSON for display.
fn format_json(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}

fn print_history(events: &[HistoryEvent]) {
    for event in events {
        let details = if event.details.is_null() {
            String::new()
        } else {
            event.details.to_string()
        };
        println!(
            "{:>4} {:>4} {} {} {}",
            event.id,
            event.previous_event_id,
            event.timestamp_string().dimmed(),
            event.event_type.to_string().cyan(),
            details
        );
    }
    println!();
}

fn print_description(description: &ExecutionDescription) {
    let status = match description.status {
        ExecutionStatus::Succeeded => description.status.as_str().green(),
        ExecutionStatus::Running => description.status.as_str().yellow(),
        _ => description.status.as_str().red(),
    };
    println!("{}: {}", "Execution".bold(), description.execution_arn);
    println!("{}: {}", "Status".bold(), status);

    if let Some(stop_date) = description.stop_date {
        let elapsed = stop_date - description.start_date;
        println!("{}: {} ms", "Duration".bold(), elapsed.num_milliseconds());
    }
    if let Some(output) = &description.output {
        println!("{}:\n{}", "Output".bold(), format_json(output));
    }
    if let Some(error) = &description.error {
        println!("{}: {}", "Error".bold(), error.red());
    }
    if let Some(cause) = &description.cause {
        println!("{}: {}", "Cause".bold(), cause);
    }
}
