mod config;
mod invoke_cmd;
mod serve_cmd;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use uuid::Uuid;

use conduit_core::{InvocationRequest, Orchestrator};

use config::{CliOverrides, ConduitConfig};

#[derive(Parser)]
#[command(
    name = "conduit",
    about = "Run an agent CLI and republish its output as canonical events"
)]
struct Cli {
    /// Agent binary (overrides CONDUIT_AGENT_BINARY env var)
    #[arg(long, global = true)]
    binary: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default conduit config file
    Init {
        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },
    /// Run one invocation and print its events as JSON lines
    Invoke {
        /// Prompt to send; omit to read user messages from stdin
        prompt: Option<String>,
        /// Resume an existing session
        #[arg(long)]
        resume: Option<String>,
        /// Working directory for the agent
        #[arg(long)]
        cwd: Option<PathBuf>,
        /// Project root, used when --cwd is not given
        #[arg(long)]
        project: Option<PathBuf>,
        /// Model for new sessions (ignored when resuming)
        #[arg(long)]
        model: Option<String>,
        /// Ask for incremental streaming output
        #[arg(long)]
        stream: bool,
        /// Correlation token echoed on every event (default: random)
        #[arg(long)]
        correlation: Option<String>,
        /// Timeout in seconds (0 disables; overrides CONDUIT_TIMEOUT_SECS)
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Serve invocations over a WebSocket at /ws
    Serve {
        /// Address to bind (default from config, else 127.0.0.1)
        #[arg(long)]
        bind: Option<String>,
        /// Port to listen on (default from config, else 7878)
        #[arg(long)]
        port: Option<u16>,
        /// Per-invocation timeout in seconds (0 disables)
        #[arg(long)]
        timeout: Option<u64>,
    },
}

fn cmd_init(force: bool) -> anyhow::Result<()> {
    let path = config::config_path();

    if path.exists() && !force {
        anyhow::bail!(
            "config file already exists at {}\nUse --force to overwrite.",
            path.display()
        );
    }

    let cfg = config::ConfigFile::default();
    config::save_config(&cfg)?;

    println!("Config written to {}", path.display());
    println!("  agent.binary = {}", cfg.agent.binary);
    println!("  server = {}:{}", cfg.server.bind, cfg.server.port);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init { force } => {
            cmd_init(force)?;
        }
        Commands::Invoke {
            prompt,
            resume,
            cwd,
            project,
            model,
            stream,
            correlation,
            timeout,
        } => {
            let resolved = ConduitConfig::resolve(&CliOverrides {
                binary: cli.binary,
                timeout_secs: timeout,
            })?;
            let orchestrator = Orchestrator::new(resolved.supervisor, resolved.orchestrator);

            let request = InvocationRequest {
                prior_session_id: resume,
                working_directory: cwd,
                project_path: project,
                model,
                prompt,
                streaming: stream,
                correlation_token: correlation.unwrap_or_else(|| Uuid::new_v4().to_string()),
            };

            let code = invoke_cmd::run_invoke(orchestrator, request).await?;
            if code != 0 {
                std::process::exit(code);
            }
        }
        Commands::Serve {
            bind,
            port,
            timeout,
        } => {
            let resolved = ConduitConfig::resolve(&CliOverrides {
                binary: cli.binary,
                timeout_secs: timeout,
            })?;
            let bind = bind.unwrap_or(resolved.server.bind);
            let port = port.unwrap_or(resolved.server.port);
            let orchestrator = Orchestrator::new(resolved.supervisor, resolved.orchestrator);
            serve_cmd::run_serve(orchestrator, &bind, port).await?;
        }
    }

    Ok(())
}
