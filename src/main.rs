//! deskpilot - CLI entry point.
//!
//! Two commands: `serve` starts the proxy, `run` executes one task against a
//! pre-provisioned computer. Exit codes: 0 success, 2 usage error (from
//! clap), 3 configuration error, 4 runtime error, 130 interrupted.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use deskpilot::api::{self, AppState, ServeMode};
use deskpilot::computer::remote::HttpProvisioner;
use deskpilot::computer::{ComputerSpec, OsType, Provisioner};
use deskpilot::config::Config;
use deskpilot::env::EnvSnapshot;
use deskpilot::error::RunStatus;
use deskpilot::llm::HttpLlm;
use deskpilot::session::{ComputerPool, RunRequest, SessionManager};

const EXIT_CONFIG: i32 = 3;
const EXIT_RUNTIME: i32 = 4;
const EXIT_INTERRUPTED: i32 = 130;

#[derive(Parser, Debug)]
#[command(
    name = "deskpilot",
    version,
    about = "Orchestration server for computer-use agents",
    long_about = "Drives a model-guided screenshot/decide/act loop over sandboxed desktops.\n\
                  `serve` hosts the HTTP and peer-channel proxy; `run` executes one task."
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the proxy server
    Serve(ServeArgs),
    /// Execute one run against a pre-provisioned computer
    Run(RunArgs),
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Mode {
    Http,
    P2p,
    Both,
}

impl From<Mode> for ServeMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Http => ServeMode::Http,
            Mode::P2p => ServeMode::P2p,
            Mode::Both => ServeMode::Both,
        }
    }
}

#[derive(Args, Debug)]
struct ServeArgs {
    /// Transports to expose
    #[arg(long, value_enum, default_value = "http")]
    mode: Mode,
    /// Bind host (overrides HOST)
    #[arg(long)]
    host: Option<String>,
    /// Bind port (overrides PORT)
    #[arg(long)]
    port: Option<u16>,
    /// Peer id announced on the data channel
    #[arg(long)]
    peer_id: Option<String>,
    /// Maximum concurrently open computers (overrides POOL_SIZE)
    #[arg(long)]
    pool_size: Option<usize>,
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Model string, e.g. anthropic/claude-3-5-sonnet-20241022
    #[arg(long)]
    model: Option<String>,
    /// The natural-language task
    #[arg(long)]
    task: String,
    /// Session to run under
    #[arg(long)]
    session_id: Option<String>,
    /// Save the trajectory under this directory
    #[arg(long)]
    save_trajectory: Option<PathBuf>,
    /// Computer name (overrides CUA_CONTAINER_NAME)
    #[arg(long)]
    computer_name: Option<String>,
    /// Computer OS family
    #[arg(long, default_value = "linux")]
    os_type: String,
    /// Step cap for the run
    #[arg(long)]
    max_steps: Option<usize>,
    /// Dollar budget for the run
    #[arg(long)]
    max_budget: Option<f64>,
}

fn main() {
    // Deep async chains (proxy → session → orchestrator → adapter) want more
    // stack than the 2 MB tokio default.
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_stack_size(8 * 1024 * 1024)
        .build()
        .expect("tokio runtime");
    let code = runtime.block_on(async_main());
    std::process::exit(code);
}

async fn async_main() -> i32 {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "deskpilot=info,tower_http=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let mut config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {e}");
            return EXIT_CONFIG;
        }
    };

    match cli.command {
        Command::Serve(args) => {
            if let Some(host) = args.host {
                config.host = host;
            }
            if let Some(port) = args.port {
                config.port = port;
            }
            if let Some(pool_size) = args.pool_size {
                config.pool_size = pool_size;
            }
            serve(config, args.mode.into(), args.peer_id).await
        }
        Command::Run(args) => run_once(config, args).await,
    }
}

fn build_manager(config: &Config) -> Arc<SessionManager> {
    let provisioner: Arc<dyn Provisioner> = Arc::new(HttpProvisioner::new(
        config.computer_url.clone(),
        config.api_key.clone(),
    ));
    let pool = Arc::new(ComputerPool::new(
        provisioner,
        config.pool_size,
        config.acquire_timeout,
    ));
    Arc::new(SessionManager::new(
        Arc::new(HttpLlm::new()),
        pool,
        deskpilot::session::ManagerOptions {
            session_idle_timeout: config.session_idle_timeout,
            shutdown_deadline: config.shutdown_deadline,
            scrub_pii: config.scrub_pii,
        },
    ))
}

async fn serve(config: Config, mode: ServeMode, peer_id: Option<String>) -> i32 {
    let manager = build_manager(&config);
    let sweeper = manager.spawn_sweeper();

    info!(model = %config.default_model, pool = config.pool_size, "starting proxy");
    let state = Arc::new(AppState {
        config,
        manager: Arc::clone(&manager),
        peer_id,
    });

    let result = api::serve(state, mode).await;
    sweeper.abort();
    match result {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("server error: {e}");
            EXIT_RUNTIME
        }
    }
}

async fn run_once(config: Config, args: RunArgs) -> i32 {
    let os_type: OsType = match args.os_type.parse() {
        Ok(os_type) => os_type,
        Err(e) => {
            eprintln!("configuration error: {e}");
            return EXIT_CONFIG;
        }
    };
    let name = args.computer_name.or_else(|| config.container_name.clone());
    if name.is_none() {
        eprintln!("configuration error: no computer name (use --computer-name or CUA_CONTAINER_NAME)");
        return EXIT_CONFIG;
    }

    let manager = build_manager(&config);
    let request = RunRequest {
        model: args.model.unwrap_or_else(|| config.default_model.clone()),
        input: vec![deskpilot::schema::Message::user_text(args.task)],
        session_id: args.session_id,
        computer_spec: ComputerSpec {
            os_type,
            name,
            ..Default::default()
        },
        env: EnvSnapshot::process(),
        max_steps: args.max_steps,
        max_trajectory_budget: args.max_budget,
        image_retention_window: None,
        trajectory_dir: args.save_trajectory,
    };

    let outcome = tokio::select! {
        outcome = manager.execute(request) => outcome,
        _ = tokio::signal::ctrl_c() => {
            eprintln!("interrupted");
            manager.shutdown().await;
            return EXIT_INTERRUPTED;
        }
    };
    manager.shutdown().await;

    match outcome {
        Ok(result) => {
            for message in &result.output {
                match serde_json::to_string(message) {
                    Ok(line) => println!("{line}"),
                    Err(e) => eprintln!("encode error: {e}"),
                }
            }
            eprintln!(
                "status: {} (tokens: {}, cost: ${:.4})",
                result.status, result.usage.total_tokens, result.usage.response_cost
            );
            match result.status {
                RunStatus::Completed => 0,
                RunStatus::Cancelled => EXIT_INTERRUPTED,
                RunStatus::Failed => EXIT_RUNTIME,
            }
        }
        Err(e) => {
            eprintln!("run error: {e}");
            EXIT_RUNTIME
        }
    }
}
