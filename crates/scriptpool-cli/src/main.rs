//! Run a Rhai script file through a scriptpool context pool.

use std::{fs, io::LineWriter, path::PathBuf, process::ExitCode};

use clap::{Parser, ValueEnum};
use owo_colors::OwoColorize;
use scriptpool::{
    CreationMode, ExecutionContextPool, ExecutionPolicy, PoolOptions, Result, RhaiFactory,
    ScriptExecutor, ScriptRequest, SessionConfiguration, ThreadPolicy,
};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod callbacks;

/// Run a Rhai script through a pool of interpreter contexts.
#[derive(Parser)]
#[command(name = "scriptpool", version)]
struct Cli {
    /// Script file to run.
    script: PathBuf,

    /// Script parameter as NAME=VALUE; VALUE is JSON or a plain string.
    #[arg(short = 'p', long = "param", value_name = "NAME=VALUE", value_parser = parse_binding)]
    params: Vec<(String, Value)>,

    /// Session variable as NAME=VALUE; VALUE is JSON or a plain string.
    #[arg(short = 'v', long = "var", value_name = "NAME=VALUE", value_parser = parse_binding)]
    vars: Vec<(String, Value)>,

    /// Session configuration file (JSON). Variables given with --var are added to it.
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Rhai module to preload as NAME=PATH.
    #[arg(short = 'm', long = "module", value_name = "NAME=PATH", value_parser = parse_module)]
    modules: Vec<(String, PathBuf)>,

    /// Contexts opened up front.
    #[arg(long, default_value_t = 1)]
    min: usize,

    /// Upper bound on live contexts.
    #[arg(long, default_value_t = 4)]
    max: usize,

    /// Start sessions with the core language only.
    #[arg(long)]
    restricted: bool,

    /// Execution policy.
    #[arg(long, value_enum)]
    policy: Option<Policy>,

    /// Keep each context on its own thread.
    #[arg(long)]
    reuse_thread: bool,

    /// Print every result as JSON, strings included.
    #[arg(long)]
    json: bool,

    /// Write diagnostics to FILE instead of the terminal.
    #[arg(long, value_name = "FILE")]
    log: Option<PathBuf>,
}

#[derive(Clone, Copy, ValueEnum)]
enum Policy {
    Default,
    Restricted,
}

impl From<Policy> for ExecutionPolicy {
    fn from(policy: Policy) -> Self {
        match policy {
            Policy::Default => Self::Default,
            Policy::Restricted => Self::Restricted,
        }
    }
}

fn parse_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn split_pair(raw: &str) -> std::result::Result<(&str, &str), String> {
    match raw.split_once('=') {
        Some((name, value)) if !name.is_empty() => Ok((name, value)),
        _ => Err(format!("expected NAME=VALUE, got '{raw}'")),
    }
}

fn parse_binding(raw: &str) -> std::result::Result<(String, Value), String> {
    let (name, value) = split_pair(raw)?;
    Ok((name.to_string(), parse_value(value)))
}

fn parse_module(raw: &str) -> std::result::Result<(String, PathBuf), String> {
    let (name, path) = split_pair(raw)?;
    Ok((name.to_string(), PathBuf::from(path)))
}

fn render(value: &Value, json: bool) -> String {
    match value {
        Value::String(s) if !json => s.clone(),
        other => other.to_string(),
    }
}

fn session(cli: &Cli) -> Result<SessionConfiguration> {
    let base = match &cli.config {
        Some(path) => SessionConfiguration::load(path)?,
        None => SessionConfiguration::default(),
    };
    let mut builder = base.into_builder();
    for (name, value) in &cli.vars {
        builder = builder.with_variable(name.clone(), value.clone());
    }
    for (name, _) in &cli.modules {
        builder = builder.with_module(name.clone());
    }
    if cli.restricted {
        builder = builder.with_creation_mode(CreationMode::Restricted);
    }
    if let Some(policy) = cli.policy {
        builder = builder.with_execution_policy(policy.into());
    }
    builder.build()
}

fn factory(cli: &Cli) -> Result<RhaiFactory> {
    let mut factory = RhaiFactory::new();
    for (name, path) in &cli.modules {
        let source = fs::read_to_string(path)?;
        factory = factory.with_module_source(name.clone(), &source)?;
    }
    Ok(factory)
}

async fn run(cli: Cli) -> Result<()> {
    let script = fs::read_to_string(&cli.script)?;
    let config = session(&cli)?;
    let policy = if cli.reuse_thread {
        ThreadPolicy::ReuseThread
    } else {
        ThreadPolicy::NewThreadPerUse
    };

    let pool = ExecutionContextPool::new(factory(&cli)?);
    pool.initialize(
        PoolOptions::new(cli.min, cli.max).with_thread_policy(policy),
        config,
    )
    .await?;

    let callbacks = match &cli.log {
        Some(path) => callbacks::writer_callbacks(LineWriter::new(fs::File::create(path)?)),
        None => callbacks::console_callbacks(),
    };

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupted, cancelling script");
            on_interrupt.cancel();
        }
    });

    let request = cli
        .params
        .iter()
        .fold(ScriptRequest::new(script), |request, (name, value)| {
            request.with_parameter(name.clone(), value.clone())
        });
    let result = ScriptExecutor::new(pool.clone())
        .execute(request, &callbacks, &cancel)
        .await;
    pool.dispose();

    for item in result?.items() {
        println!("{}", render(item, cli.json));
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "scriptpool=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    match run(Cli::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", format!("error: {e}").red());
            for fault in e.callback_faults() {
                eprintln!("  {fault}");
            }
            ExitCode::FAILURE
        }
    }
}
