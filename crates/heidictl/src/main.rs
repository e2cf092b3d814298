//! heidictl - CLI client for heidi-server
//!
//! Dispatches runs and loops over HTTP and calls the local engine socket.

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

mod client;
mod render;
mod rpc;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use client::{Client, LoopRequest, RunRequest};
use eyre::{Result, WrapErr};
use heidi_core::{Config, RunKind};
use rpc::{RpcClient, RpcConfig, RpcError, E_TRANSPORT_UNAVAILABLE};
use serde_json::Value;
use tracing_subscriber::{fmt, EnvFilter};

const DEFAULT_ADDR: &str = "http://127.0.0.1:7777";

/// CLI client for the heidi dispatch server.
#[derive(Parser)]
#[command(name = "heidictl")]
#[command(about = "Dispatch agent runs to heidi-server")]
#[command(version)]
struct Cli {
    /// Server address (default: http://127.0.0.1:7777)
    #[arg(long, global = true, env = "HEIDI_ADDR")]
    addr: Option<String>,

    /// API key for the server
    #[arg(long, global = true, env = "HEIDI_API_KEY", hide_env_values = true)]
    token: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a prompt once on an executor
    Run {
        /// Prompt text
        prompt: String,

        #[command(flatten)]
        target: Target,

        /// Stream the transcript until the run finishes
        #[arg(long, short)]
        follow: bool,
    },

    /// Run a task until it reports completion or retries run out
    Loop {
        /// Task description
        task: String,

        #[command(flatten)]
        target: Target,

        /// Retries after the first attempt
        #[arg(long)]
        max_retries: Option<u32>,

        /// Stream the transcript until the loop finishes
        #[arg(long, short)]
        follow: bool,
    },

    /// List recent runs
    List {
        /// Maximum number of runs to show
        #[arg(long, short, default_value_t = 10)]
        limit: usize,
    },

    /// Show a run's metadata, transcript and result
    Status {
        /// Run ID
        run_id: String,
    },

    /// Cancel a running run
    Cancel {
        /// Run ID
        run_id: String,
    },

    /// Stream a run's transcript
    Tail {
        /// Run ID
        run_id: String,
    },

    /// List executors known to the server
    Executors,

    /// Call a method on the local engine socket
    Rpc {
        /// Method name, e.g. provider.generate
        method: String,

        #[command(flatten)]
        engine: EngineArgs,
    },

    /// Call provider.generate on the local engine socket
    Generate {
        #[command(flatten)]
        engine: EngineArgs,
    },
}

#[derive(clap::Args)]
struct Target {
    /// Executor name
    #[arg(long, short)]
    executor: Option<String>,

    /// Model override
    #[arg(long, short)]
    model: Option<String>,

    /// Working directory (defaults to the current directory)
    #[arg(long, short)]
    workdir: Option<PathBuf>,

    /// Explicit run ID
    #[arg(long)]
    run_id: Option<String>,
}

impl Target {
    /// Workdir as sent to the server: explicit, else the current directory.
    fn workdir(&self) -> Result<String> {
        let dir = match &self.workdir {
            Some(dir) => dir.clone(),
            None => std::env::current_dir().wrap_err("failed to read current directory")?,
        };
        let dir = std::fs::canonicalize(&dir)
            .wrap_err_with(|| format!("workdir {} does not exist", dir.display()))?;
        Ok(dir.display().to_string())
    }
}

#[derive(clap::Args)]
struct EngineArgs {
    /// JSON params object
    #[arg(long, default_value = "{}")]
    params: String,

    /// Engine socket path (defaults to $HEIDI_HOME/run/heidid.sock)
    #[arg(long)]
    socket: Option<PathBuf>,
}

impl EngineArgs {
    fn params(&self) -> Result<Value> {
        serde_json::from_str(&self.params).wrap_err("--params must be valid JSON")
    }

    fn client(&self) -> Result<RpcClient> {
        let rpc = match (Config::load(), &self.socket) {
            (Ok(config), socket) => {
                let mut rpc = RpcConfig::from_config(&config);
                if let Some(socket) = socket {
                    rpc.socket_path.clone_from(socket);
                }
                rpc
            }
            (Err(_), Some(socket)) => RpcConfig::new(socket),
            (Err(err), None) => return Err(err).wrap_err("failed to load config"),
        };
        Ok(RpcClient::new(rpc))
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let addr = cli.addr.unwrap_or_else(|| DEFAULT_ADDR.to_string());
    let client = Client::new(&addr, cli.token.as_deref());

    let result = match cli.command {
        Command::Run {
            prompt,
            target,
            follow,
        } => run_submit(&client, prompt, &target, follow).await,
        Command::Loop {
            task,
            target,
            max_retries,
            follow,
        } => loop_submit(&client, task, &target, max_retries, follow).await,
        Command::List { limit } => run_list(&client, limit).await,
        Command::Status { run_id } => run_status(&client, &run_id).await,
        Command::Cancel { run_id } => run_cancel(&client, &run_id).await,
        Command::Tail { run_id } => run_tail(&client, &run_id).await,
        Command::Executors => run_executors(&client).await,
        Command::Rpc { method, engine } => rpc_call(&engine, Some(&method)).await,
        Command::Generate { engine } => rpc_call(&engine, None).await,
    };

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}

async fn run_submit(client: &Client, prompt: String, target: &Target, follow: bool) -> Result<()> {
    let request = RunRequest {
        prompt,
        executor: target.executor.clone(),
        model: target.model.clone(),
        workdir: Some(target.workdir()?),
        run_id: target.run_id.clone(),
    };
    let response = client.submit_run(&request).await?;
    render::print_submitted(RunKind::Run, &response);
    if follow {
        follow_run(client, response.run_id.as_str()).await?;
    }
    Ok(())
}

async fn loop_submit(
    client: &Client,
    task: String,
    target: &Target,
    max_retries: Option<u32>,
    follow: bool,
) -> Result<()> {
    let request = LoopRequest {
        task,
        executor: target.executor.clone(),
        max_retries,
        model: target.model.clone(),
        workdir: Some(target.workdir()?),
        run_id: target.run_id.clone(),
    };
    let response = client.submit_loop(&request).await?;
    render::print_submitted(RunKind::Loop, &response);
    if follow {
        follow_run(client, response.run_id.as_str()).await?;
    }
    Ok(())
}

/// Stream until the run is terminal, then print its outcome.
async fn follow_run(client: &Client, run_id: &str) -> Result<()> {
    println!();
    client.tail_run(run_id, render::print_event).await?;
    let record = client.get_run(run_id).await?;
    println!();
    render::print_run_details(&record);
    Ok(())
}

async fn run_list(client: &Client, limit: usize) -> Result<()> {
    let runs = client.list_runs(limit).await?;
    render::print_run_list(&runs);
    Ok(())
}

async fn run_status(client: &Client, run_id: &str) -> Result<()> {
    let record = client.get_run(run_id).await?;
    render::print_run_details(&record);
    Ok(())
}

async fn run_cancel(client: &Client, run_id: &str) -> Result<()> {
    client.cancel_run(run_id).await?;
    println!("Cancel requested: {run_id}");
    Ok(())
}

async fn run_tail(client: &Client, run_id: &str) -> Result<()> {
    client.tail_run(run_id, render::print_event).await?;
    Ok(())
}

async fn run_executors(client: &Client) -> Result<()> {
    for name in client.executors().await? {
        println!("{name}");
    }
    Ok(())
}

/// Call `method`, or `provider.generate` when none is given.
async fn rpc_call(engine: &EngineArgs, method: Option<&str>) -> Result<()> {
    let params = engine.params()?;
    let rpc = engine.client()?;

    let result = match method {
        Some(method) => rpc.call(method, params).await,
        None => rpc.generate(params).await,
    };
    match result {
        Ok(result) => {
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(())
        }
        Err(err @ RpcError::Remote { code: E_TRANSPORT_UNAVAILABLE, .. }) => Err(eyre::Report::new(err)
            .wrap_err("network transport is disabled in this engine build")),
        Err(err) if err.is_capability_unavailable() => {
            Err(eyre::Report::new(err).wrap_err("capability not available in this engine build"))
        }
        Err(err @ RpcError::Unavailable { .. }) => {
            Err(eyre::Report::new(err).wrap_err("is the engine running?"))
        }
        Err(err) => Err(err.into()),
    }
}
