//! autosurf command line: run an instruction against a live browser, or
//! check the local setup.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;
use tracing_subscriber::EnvFilter;

use autosurf_agent::{AgentConfig, AgentEvent, AgentOrchestrator, EventRole};
use autosurf_browser::{
    detect_chrome_executable, BrowserConfig, BrowserSession, ChromiumTransport,
};
use autosurf_core_types::SurfaceId;
use autosurf_oracle::{OpenAiConfig, OpenAiOracle, OracleClient};

const SYSTEM_FRAMING: &str = "\
You are autosurf, an agent that operates a real web browser on the user's behalf.
Each turn you receive the current page (URL, title, an outline of its elements,
and usually a screenshot). Decide the next step and call exactly the tools you
need. Use execute_code to act on the page, ask_question_to_user when you are
missing information or about to do something irreversible, notify_user for
progress updates, and task_completed once the instruction is fulfilled.
Prefer small, verifiable steps over long speculative scripts.";

#[derive(Parser)]
#[command(name = "autosurf", version, about = "Oracle-driven web automation")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one instruction against a fresh browser page.
    Run {
        /// The instruction, e.g. "find the cheapest 13-inch laptop".
        task: String,
        /// Page to open before the run starts.
        #[arg(long, default_value = "about:blank")]
        url: String,
        /// Attach to a running browser instead of launching one.
        #[arg(long)]
        ws_url: Option<String>,
        /// Chrome/Chromium executable override.
        #[arg(long)]
        chrome: Option<PathBuf>,
        /// Show the browser window.
        #[arg(long)]
        headful: bool,
        /// Cap on oracle consultations for this run.
        #[arg(long)]
        max_steps: Option<u32>,
        /// Skip screenshots in observations.
        #[arg(long)]
        no_vision: bool,
    },
    /// Check chrome detection and oracle configuration.
    Doctor,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("autosurf=info,browser-host=warn,oracle=warn,agent-loop=info")
        }))
        .init();

    match Cli::parse().command {
        Command::Run {
            task,
            url,
            ws_url,
            chrome,
            headful,
            max_steps,
            no_vision,
        } => run(task, url, ws_url, chrome, headful, max_steps, no_vision).await,
        Command::Doctor => doctor(),
    }
}

async fn run(
    task: String,
    url: String,
    ws_url: Option<String>,
    chrome: Option<PathBuf>,
    headful: bool,
    max_steps: Option<u32>,
    no_vision: bool,
) -> Result<()> {
    let mut browser_cfg = BrowserConfig::default();
    if let Some(ws_url) = ws_url {
        browser_cfg = browser_cfg.with_websocket_url(ws_url);
    }
    if let Some(chrome) = chrome {
        browser_cfg = browser_cfg.with_executable(chrome);
    }
    if headful {
        browser_cfg = browser_cfg.headless(false);
    }

    let transport = Arc::new(ChromiumTransport::new(browser_cfg.clone()));
    let session = BrowserSession::new(browser_cfg, transport);
    session.start().await.context("failed to start browser")?;

    let (page, target_id) = session
        .create_page(&url)
        .await
        .context("failed to open the starting page")?;
    info!(%page, %url, "starting page ready");

    let surface = SurfaceId::new();
    session.bind_surface(surface, target_id);

    let oracle_cfg = OpenAiConfig::from_env().context("oracle configuration")?;
    let oracle = Arc::new(OpenAiOracle::new(oracle_cfg)?);
    let client = Arc::new(OracleClient::new(oracle, SYSTEM_FRAMING));

    let mut agent_cfg = AgentConfig::default().with_vision(!no_vision);
    if let Some(max_steps) = max_steps {
        agent_cfg = agent_cfg.with_max_steps(max_steps);
    }

    let (orchestrator, events) = AgentOrchestrator::new(session.clone(), client, surface, agent_cfg);

    let printer = tokio::spawn(print_events(events, orchestrator.clone()));

    let stopper = orchestrator.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nstopping...");
            stopper.stop();
        }
    });

    let outcome = orchestrator.run(&task).await;
    printer.abort();
    session.close().await;
    outcome.map_err(Into::into)
}

/// Prints run events; a question blocks on one line of stdin and feeds the
/// answer back into the run.
async fn print_events(
    mut events: tokio::sync::mpsc::UnboundedReceiver<AgentEvent>,
    orchestrator: Arc<AgentOrchestrator>,
) {
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    while let Some(event) = events.recv().await {
        match event {
            AgentEvent::Message { role, content } => match role {
                EventRole::Assistant => println!("agent: {content}"),
                EventRole::System => println!("-- {content}"),
            },
            AgentEvent::Question { content } => {
                println!("agent asks: {content}");
                print!("> ");
                let _ = std::io::Write::flush(&mut std::io::stdout());
                match stdin.next_line().await {
                    Ok(Some(answer)) => orchestrator.provide_user_response(answer),
                    _ => orchestrator.stop(),
                }
            }
            AgentEvent::Log(entry) => {
                println!("  [console:{}] {}", entry.severity.as_str(), entry.render());
            }
            AgentEvent::Error { message } => eprintln!("error: {message}"),
            AgentEvent::Completed => println!("-- Task completed."),
        }
    }
}

fn doctor() -> Result<()> {
    match detect_chrome_executable() {
        Some(path) => println!("chrome executable: {}", path.display()),
        None => println!("chrome executable: NOT FOUND (set AUTOSURF_CHROME)"),
    }
    match OpenAiConfig::from_env() {
        Ok(cfg) => println!(
            "oracle: {} key(s), model {}, endpoint {}",
            cfg.api_keys.len(),
            cfg.model,
            cfg.api_base
        ),
        Err(err) => println!("oracle: not configured ({err})"),
    }
    let defaults = BrowserConfig::default();
    println!(
        "profile dir: {} (headless: {})",
        defaults.user_data_dir.display(),
        defaults.headless
    );
    Ok(())
}
