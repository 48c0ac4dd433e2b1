// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use futures_util::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use serde_json::Value;
use tracing_subscriber::EnvFilter;

use pullbus::config::{Config, StorageBackend};
use pullbus::jobs::{JobQueue, JobRequest};
use pullbus::server::{shutdown_signal, Server};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Exit codes following sysexits.h conventions
mod exit_codes {
    /// The job ended failed or cancelled
    pub const JOB_FAILED: i32 = 1;
    /// Service unavailable - no pullbus server answering
    pub const SERVICE_UNAVAILABLE: i32 = 69;
    /// Configuration error - invalid or missing config
    pub const CONFIG: i32 = 78;
}

/// pullbus - background model transfers with live progress.
#[derive(Parser)]
#[command(name = "pullbus")]
#[command(version = VERSION)]
#[command(about = "Background model pulls, GGUF downloads and ejects with live progress.")]
#[command(long_about = "pullbus - background model transfers with live progress\n\n\
    Start server + workers:   pullbus serve\n\
    Separate worker process:  pullbus serve --no-workers  and  pullbus worker\n\
    Pull a model:             pullbus submit pull llama3 --watch\n\
    Check a job:              pullbus status <JOB_ID>\n\
    Follow a job:             pullbus watch <JOB_ID>")]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (defaults to ~/.pullbus/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Storage backend: memory or file
    #[arg(long, global = true)]
    storage: Option<StorageBackend>,

    /// Server URL for client commands (defaults to http://127.0.0.1:<port>)
    #[arg(long, global = true)]
    server: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP API (and, unless --no-workers, the job workers)
    ///
    /// Examples:
    ///   pullbus serve
    ///   pullbus serve --port 9000 --bind 0.0.0.0
    ///   pullbus serve --no-workers --storage file
    Serve {
        #[arg(short, long)]
        port: Option<u16>,
        /// Address to bind (127.0.0.1 for local-only access)
        #[arg(long)]
        bind: Option<String>,
        /// Only serve the API; jobs run in a separate `pullbus worker`
        #[arg(long)]
        no_workers: bool,
    },

    /// Run job workers against the file-backed store, without the API
    Worker,

    /// Submit a job to a running server and print its id
    Submit {
        #[command(subcommand)]
        job: SubmitCommands,
        /// Follow the job's progress until it ends
        #[arg(short, long, global = true)]
        watch: bool,
    },

    /// Show a job record
    Status {
        job_id: String,
    },

    /// Follow a job's progress stream
    Watch {
        job_id: String,
    },

    /// Request cancellation of a job
    Cancel {
        job_id: String,
    },
}

#[derive(Subcommand)]
enum SubmitCommands {
    /// Pull a model into the model server
    Pull { model: String },

    /// Download a GGUF file from the hub and register it as a model
    ///
    /// Examples:
    ///   pullbus submit gguf TheBloke/Mistral-7B-GGUF mistral-7b.Q4_K_M.gguf
    ///   pullbus submit gguf org/repo file.gguf --no-create
    Gguf {
        repo_id: String,
        filename: String,
        #[arg(long)]
        output_dir: Option<String>,
        /// Download only, do not create a model
        #[arg(long)]
        no_create: bool,
        /// Model name (defaults to the file stem)
        #[arg(long)]
        model_name: Option<String>,
    },

    /// Check whether a newer version of a model exists
    UpdateCheck { model: String },

    /// Unload a model (or every loaded model) and wait until it is gone
    Eject { model: Option<String> },
}

impl SubmitCommands {
    fn into_request(self) -> JobRequest {
        match self {
            SubmitCommands::Pull { model } => JobRequest::Pull { model },
            SubmitCommands::Gguf {
                repo_id,
                filename,
                output_dir,
                no_create,
                model_name,
            } => JobRequest::GgufDownload {
                repo_id,
                filename,
                output_dir,
                create_model: !no_create,
                model_name,
            },
            SubmitCommands::UpdateCheck { model } => JobRequest::UpdateCheck { model },
            SubmitCommands::Eject { model } => JobRequest::EjectForce { model },
        }
    }
}

fn init_tracing(default_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{} {:#}", "[!]".red(), e);
            std::process::exit(exit_codes::CONFIG);
        }
    };
    if let Some(storage) = cli.storage {
        config.storage = storage;
    }
    init_tracing(&config.log_level);

    let server_url = cli
        .server
        .clone()
        .unwrap_or_else(|| format!("http://127.0.0.1:{}", config.port));

    match cli.command {
        Commands::Serve {
            port,
            bind,
            no_workers,
        } => {
            if let Some(port) = port {
                config.port = port;
            }
            if let Some(bind) = bind {
                config.bind = bind;
            }
            serve(&config, !no_workers).await
        }
        Commands::Worker => run_worker(&config).await,
        Commands::Submit { job, watch } => {
            let client = ApiClient::new(&server_url)?;
            let job_id = client.submit(&job.into_request()).await?;
            println!("{}", job_id);
            if watch {
                follow(&client, &job_id).await?;
            }
            Ok(())
        }
        Commands::Status { job_id } => {
            let client = ApiClient::new(&server_url)?;
            print_job(&client.get(&format!("/api/jobs/{}", job_id)).await?);
            Ok(())
        }
        Commands::Watch { job_id } => {
            let client = ApiClient::new(&server_url)?;
            follow(&client, &job_id).await
        }
        Commands::Cancel { job_id } => {
            let client = ApiClient::new(&server_url)?;
            let job = client.post(&format!("/api/jobs/{}/cancel", job_id), &Value::Null).await?;
            print_job(&job);
            Ok(())
        }
    }
}

// ============================================================================
// Server and worker processes
// ============================================================================

async fn serve(config: &Config, run_workers: bool) -> Result<()> {
    if !run_workers && config.storage == StorageBackend::Memory {
        bail!("--no-workers needs shared storage; pass --storage file (or set \"storage\": \"file\")");
    }

    let queue = JobQueue::new(config.open_store()?, config.open_bus()?, config.queue_settings());
    let dispatcher = if run_workers {
        Some(queue.start(config.worker_env()?))
    } else {
        None
    };

    print_banner(config, if run_workers { "server + workers" } else { "server" });

    let server = Server::new(config.port, queue.clone(), config.ollama_client()?)
        .with_bind_address(&config.bind)
        .with_keep_alive(config.keep_alive());
    let result = server.start().await;

    queue.shutdown(config.shutdown_grace()).await;
    if let Some(dispatcher) = dispatcher {
        if let Err(e) = dispatcher.await {
            tracing::warn!(error = %e, "Dispatcher task ended abnormally");
        }
    }
    result
}

async fn run_worker(config: &Config) -> Result<()> {
    if config.storage == StorageBackend::Memory {
        bail!("A standalone worker needs shared storage; pass --storage file (or set \"storage\": \"file\")");
    }

    let queue = JobQueue::new(config.open_store()?, config.open_bus()?, config.queue_settings());
    let dispatcher = queue.start(config.worker_env()?);
    print_banner(config, "worker");
    tracing::info!(worker_id = %queue.worker_id(), "Worker ready");

    shutdown_signal().await;
    queue.shutdown(config.shutdown_grace()).await;
    if let Err(e) = dispatcher.await {
        tracing::warn!(error = %e, "Dispatcher task ended abnormally");
    }
    Ok(())
}

fn print_banner(config: &Config, role: &str) {
    println!("{} v{} ({})", "pullbus".bold().cyan(), VERSION, role);
    println!("  model server  {}", config.ollama_url);
    println!("  hub           {}", config.hub_url);
    if let Some(token) = config.masked_token() {
        println!("  hub token     {}", token.dimmed());
    }
    match config.storage {
        StorageBackend::Memory => println!("  storage       memory"),
        StorageBackend::File => match config.data_dir() {
            Ok(dir) => println!("  storage       file ({})", dir.display()),
            Err(_) => println!("  storage       file"),
        },
    }
    println!(
        "  limits        pull {} / gguf {} / update {} / eject {}",
        config.limits.pull,
        config.limits.gguf_download,
        config.limits.update_check,
        config.limits.eject_force
    );
    println!();
}

// ============================================================================
// Client commands
// ============================================================================

struct ApiClient {
    base: String,
    http: reqwest::Client,
}

impl ApiClient {
    fn new(base: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self {
            base: base.trim_end_matches('/').to_string(),
            http,
        })
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        let response = match request.send().await {
            Ok(response) => response,
            Err(e) if e.is_connect() => {
                eprintln!(
                    "{} No pullbus server at {}. Start one with: pullbus serve",
                    "[!]".red(),
                    self.base
                );
                std::process::exit(exit_codes::SERVICE_UNAVAILABLE);
            }
            Err(e) => return Err(e).context("Request failed"),
        };
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status();
        let body: Value = response.json().await.unwrap_or(Value::Null);
        let message = body
            .pointer("/error/message")
            .and_then(|m| m.as_str())
            .unwrap_or("request failed");
        bail!("{} ({})", message, status)
    }

    async fn get(&self, path: &str) -> Result<Value> {
        let response = self.send(self.http.get(format!("{}{}", self.base, path))).await?;
        response.json().await.context("Invalid response from server")
    }

    async fn post(&self, path: &str, body: &Value) -> Result<Value> {
        let request = self.http.post(format!("{}{}", self.base, path));
        let request = if body.is_null() { request } else { request.json(body) };
        let response = self.send(request).await?;
        response.json().await.context("Invalid response from server")
    }

    async fn submit(&self, request: &JobRequest) -> Result<String> {
        let body = serde_json::to_value(request)?;
        let accepted = self.post("/api/jobs", &body).await?;
        accepted
            .get("job_id")
            .and_then(|id| id.as_str())
            .map(str::to_string)
            .context("Server did not return a job id")
    }
}

fn print_job(job: &Value) {
    let field = |name: &str| job.get(name).and_then(|v| v.as_str()).unwrap_or("-");
    let state = field("state");
    let painted = match state {
        "succeeded" => state.green(),
        "failed" | "cancelled" => state.red(),
        "running" => state.cyan(),
        _ => state.yellow(),
    };
    println!("{} {} [{}]", field("id").bold(), field("kind"), painted);
    println!("  updated {}", field("updated_at").dimmed());
    if job.get("cancel_requested").and_then(|v| v.as_bool()) == Some(true) && state == "running" {
        println!("  {}", "cancellation requested".yellow());
    }
    if let Some(warnings) = job.get("warnings").and_then(|w| w.as_array()) {
        for warning in warnings.iter().filter_map(|w| w.as_str()) {
            println!("  {} {}", "[!]".yellow(), warning);
        }
    }
    if let Some(result) = job.get("result") {
        if let Ok(pretty) = serde_json::to_string_pretty(result) {
            println!("{}", pretty);
        }
    }
}

/// One `event:`/`data:` record from an SSE body.
struct SseRecord {
    event: String,
    data: Value,
}

/// Split complete records off the front of `buffer`.
fn drain_records(buffer: &mut String) -> Vec<SseRecord> {
    let mut records = Vec::new();
    while let Some(end) = buffer.find("\n\n") {
        let raw: String = buffer.drain(..end + 2).collect();
        let mut event = String::from("message");
        let mut data = String::new();
        for line in raw.lines() {
            if let Some(value) = line.strip_prefix("event:") {
                event = value.trim().to_string();
            } else if let Some(value) = line.strip_prefix("data:") {
                data.push_str(value.trim_start());
            }
        }
        if data.is_empty() {
            // keep-alive comment
            continue;
        }
        records.push(SseRecord {
            event,
            data: serde_json::from_str(&data).unwrap_or(Value::Null),
        });
    }
    records
}

fn progress_bar() -> ProgressBar {
    let pb = ProgressBar::new(0);
    let style = ProgressStyle::default_bar()
        .template("{spinner:.green} [{bar:40.cyan/blue}] {bytes}/{total_bytes} | {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▓░");
    pb.set_style(style);
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

/// Follow a job's SSE stream until its terminal event.
async fn follow(client: &ApiClient, job_id: &str) -> Result<()> {
    let url = format!("{}/api/stream/progress?job_id={}", client.base, job_id);
    let response = client.send(client.http.get(url)).await?;
    let mut body = response.bytes_stream();
    let mut buffer = String::new();
    let pb = progress_bar();

    while let Some(chunk) = body.next().await {
        let chunk = chunk.context("Progress stream interrupted")?;
        buffer.push_str(&String::from_utf8_lossy(&chunk).replace("\r\n", "\n"));

        for record in drain_records(&mut buffer) {
            let data = &record.data;
            match record.event.as_str() {
                "progress" => {
                    let done = data.get("bytes_completed").and_then(|v| v.as_u64()).unwrap_or(0);
                    if let Some(total) = data.get("bytes_total").and_then(|v| v.as_u64()) {
                        pb.set_length(total);
                    }
                    pb.set_position(done);
                    if let Some(phase) = data.get("phase").and_then(|v| v.as_str()) {
                        pb.set_message(phase.to_string());
                    }
                }
                "status" => {
                    if let Some(warning) = data.get("warning").and_then(|v| v.as_str()) {
                        pb.println(format!("{} {}", "[!]".yellow(), warning));
                    } else if let Some(message) = data.get("message").and_then(|v| v.as_str()) {
                        pb.set_message(message.to_string());
                    } else if let Some(state) = data.get("state").and_then(|v| v.as_str()) {
                        pb.set_message(state.to_string());
                    }
                }
                "done" => {
                    pb.finish_and_clear();
                    println!("{} job {} succeeded", "[OK]".green(), job_id);
                    if let Some(result) = data.get("result") {
                        println!("{}", serde_json::to_string_pretty(result).unwrap_or_default());
                    }
                    return Ok(());
                }
                "error" => {
                    pb.finish_and_clear();
                    let message = data.get("message").and_then(|v| v.as_str()).unwrap_or("failed");
                    let cause = data.get("cause").and_then(|v| v.as_str()).unwrap_or("internal");
                    eprintln!("{} job {} ended ({}): {}", "[X]".red(), job_id, cause, message);
                    std::process::exit(exit_codes::JOB_FAILED);
                }
                _ => {}
            }
        }
    }

    pb.finish_and_clear();
    bail!("Progress stream closed before job {} finished; try: pullbus status {}", job_id, job_id)
}
