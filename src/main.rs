use std::io::Read;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use sqlpilot::analysis::lexer::split_statements;
use sqlpilot::export::{self, OutputFormat};
use sqlpilot::{
    BatchOptions, ConnectionDescriptor, DatabaseType, EngineConfig, QueryEngine, QueryOptions,
};

/// Run, batch and analyze SQL with pooling, caching and optimization advice
#[derive(Parser)]
#[command(version, about)]
struct Cli {
    /// Config file (defaults to the user config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Execute a single statement
    Query {
        #[command(flatten)]
        target: TargetArgs,
        /// SQL text, or `-` to read stdin
        sql: String,
        #[arg(short, long, default_value = "table")]
        format: OutputFormat,
        /// Command timeout in seconds
        #[arg(long)]
        timeout: Option<u64>,
        #[arg(long)]
        no_cache: bool,
        /// Reject dangerous statements before running
        #[arg(long)]
        validate: bool,
    },
    /// Execute a script as one ordered batch
    Batch {
        #[command(flatten)]
        target: TargetArgs,
        /// Script file, or `-` to read stdin
        script: String,
        #[arg(short, long, default_value = "table")]
        format: OutputFormat,
        /// Run statements without a surrounding transaction
        #[arg(long)]
        no_transaction: bool,
        /// Attempt every statement even after a failure
        #[arg(long)]
        continue_on_error: bool,
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Report optimization opportunities without executing
    Analyze {
        /// SQL text, or `-` to read stdin
        sql: String,
        #[arg(long = "db-type", default_value = "postgresql")]
        db_type: DatabaseType,
        #[arg(long)]
        json: bool,
    },
    /// Probe a connection
    Health {
        #[command(flatten)]
        target: TargetArgs,
    },
    /// List saved connections
    Connections,
}

#[derive(Args)]
struct TargetArgs {
    /// Saved connection name
    #[arg(short, long, conflicts_with = "url")]
    connection: Option<String>,
    /// Connection string
    #[arg(long)]
    url: Option<String>,
    #[arg(long = "db-type", default_value = "postgresql")]
    db_type: DatabaseType,
}

impl TargetArgs {
    fn descriptor(&self, config: &EngineConfig) -> Result<ConnectionDescriptor> {
        if let Some(name) = &self.connection {
            return Ok(config.connection(name)?.descriptor()?);
        }
        let url = match &self.url {
            Some(url) => url.clone(),
            None => std::env::var("SQLPILOT_URL")
                .context("pass --connection or --url, or set SQLPILOT_URL")?,
        };
        Ok(ConnectionDescriptor::new(url, self.db_type)?)
    }
}

fn read_input(arg: &str, from_file: bool) -> Result<String> {
    if arg == "-" {
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf)?;
        return Ok(buf);
    }
    if from_file {
        return std::fs::read_to_string(arg).with_context(|| format!("cannot read {}", arg));
    }
    Ok(arg.to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config_path = cli.config.unwrap_or_else(EngineConfig::default_path);
    let config = EngineConfig::load(&config_path)?;

    match cli.command {
        Command::Connections => {
            if config.connections.is_empty() {
                println!("No saved connections in {}", config_path.display());
            }
            for c in &config.connections {
                let descriptor = c.descriptor()?;
                println!("{:<20} {}", c.name, descriptor.display_string());
            }
        }
        Command::Analyze { sql, db_type, json } => {
            let sql = read_input(&sql, false)?;
            let engine = QueryEngine::new(config);
            let report = engine.analyze_query(&sql, db_type);
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!(
                    "complexity {}  improvement ~{}%  memory ~{}%  security {}  overall {}",
                    report.complexity_score,
                    report.estimated_improvement_percent,
                    report.estimated_memory_reduction_percent,
                    report.security_score,
                    report.overall_score
                );
                for r in &report.recommendations {
                    println!("[{}] {}\n    {}", r.category, r.description, r.recommendation);
                }
                if report.optimized_query != report.original_query {
                    println!("\nSuggested rewrite (review before use):\n{}", report.optimized_query);
                }
            }
        }
        Command::Health { target } => {
            let descriptor = target.descriptor(&config)?;
            let engine = QueryEngine::new(config);
            let status = engine.check_health(&descriptor).await;
            println!("{}", serde_json::to_string_pretty(&status)?);
            if !status.is_healthy() {
                std::process::exit(1);
            }
        }
        Command::Query {
            target,
            sql,
            format,
            timeout,
            no_cache,
            validate,
        } => {
            let descriptor = target.descriptor(&config)?;
            let sql = read_input(&sql, false)?;
            let engine = QueryEngine::new(config);
            let options = QueryOptions {
                timeout: timeout.map(Duration::from_secs),
                use_cache: !no_cache,
                validate: validate.then_some(true),
                ..QueryOptions::default()
            };
            let outcome = engine.execute_query(&descriptor, &sql, options).await?;
            print!("{}", export::render(&outcome.result, format));
            eprintln!(
                "{} ms, performance score {}",
                outcome.metrics.execution_time_ms, outcome.metrics.performance_score
            );
        }
        Command::Batch {
            target,
            script,
            format,
            no_transaction,
            continue_on_error,
            timeout,
        } => {
            let descriptor = target.descriptor(&config)?;
            let statements = split_statements(&read_input(&script, true)?);
            if statements.is_empty() {
                bail!("script contains no statements");
            }
            let engine = QueryEngine::new(config);
            let options = BatchOptions {
                transactional: !no_transaction,
                rollback_on_failure: !continue_on_error,
                timeout: timeout.map(Duration::from_secs),
                ..BatchOptions::default()
            };
            let batch = engine.execute_batch(&descriptor, &statements, options).await?;
            for step in &batch.steps {
                match (&step.result, &step.error) {
                    (Some(result), _) => {
                        eprintln!("-- step {} ok ({} ms)", step.ordinal, step.execution_time_ms);
                        print!("{}", export::render(result, format));
                    }
                    (None, error) => eprintln!(
                        "-- step {} failed: {}",
                        step.ordinal,
                        error.as_deref().unwrap_or("unknown error")
                    ),
                }
            }
            eprintln!(
                "{}/{} succeeded, {} skipped, transaction {:?}",
                batch.successful_steps,
                batch.total_steps,
                batch.skipped_steps(),
                batch.transaction
            );
            if !batch.is_successful {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}
