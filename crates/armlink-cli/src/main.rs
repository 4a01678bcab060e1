//! `armlink` – ArmLink command line interface
//!
//! 1. Checks for `~/.armlink/config.toml`; runs a **First-Run Wizard** when
//!    the file is absent.
//! 2. `armlink serve` (the default) connects to the arm, starts the prompt
//!    worker and runs the TCP gateway until **Ctrl-C**.
//! 3. `armlink chat` opens an interactive console conversation with the
//!    path planner instead.

mod config;
mod repl;

use std::sync::Arc;

use armlink_gateway::{CommandContext, GatewayServer};
use armlink_hal::{ArmController, ArmHandle, SimArm};
use armlink_runtime::{
    ChatHistory, ConversationManager, LlmDriver, LogFormat, PromptQueue, TrajectorySink,
    init_tracing,
};
use colored::Colorize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{ActuatorBackend, ApiKey, Config};

/// What the process was asked to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Serve,
    Chat,
    Help,
}

fn parse_mode(arg: Option<&str>) -> Option<Mode> {
    match arg {
        None | Some("serve") => Some(Mode::Serve),
        Some("chat") => Some(Mode::Chat),
        Some("help" | "-h" | "--help") => Some(Mode::Help),
        Some(_) => None,
    }
}

fn main() {
    let _otel = init_tracing("armlink", "info", LogFormat::from_env());

    let arg = std::env::args().nth(1);
    let Some(mode) = parse_mode(arg.as_deref()) else {
        eprintln!("{} '{}'", "Unknown command:".red(), arg.unwrap_or_default().yellow());
        print_usage();
        std::process::exit(2);
    };

    print_banner();
    if mode == Mode::Help {
        print_usage();
        return;
    }

    let cfg = match config::load() {
        Ok(Some(cfg)) => {
            println!(
                "  Config loaded from {}",
                config::config_path().display().to_string().bold()
            );
            cfg
        }
        Ok(None) => run_first_run_wizard(),
        Err(e) => {
            println!("{}: {}", "Config error".red(), e);
            println!("  Using default configuration.");
            let mut cfg = Config::default();
            config::apply_env_overrides(&mut cfg);
            cfg
        }
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            error!(error = %e, "failed to start the async runtime");
            std::process::exit(1);
        }
    };

    // ── Ctrl-C handler ────────────────────────────────────────────────────
    let cancel = CancellationToken::new();
    let cancel_on_signal = cancel.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        println!();
        println!("{}", "⚠  Ctrl-C received – shutting down …".yellow().bold());
        cancel_on_signal.cancel();
    }) {
        warn!(error = %e, "Failed to install Ctrl-C handler; graceful shutdown on Ctrl-C will not be available");
    }

    let result = runtime.block_on(async {
        match mode {
            Mode::Serve => serve(cfg, cancel).await,
            Mode::Chat => repl::run(Arc::new(build_manager(&cfg)), cancel).await,
            Mode::Help => Ok(()),
        }
    });

    if let Err(e) = result {
        error!(error = %e, "armlink stopped with an error");
        eprintln!("{}: {}", "Error".red().bold(), e);
        std::process::exit(1);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Serve mode
// ─────────────────────────────────────────────────────────────────────────────

fn build_controller(cfg: &Config) -> Box<dyn ArmController> {
    match cfg.actuator.backend {
        ActuatorBackend::Sim => Box::new(SimArm::with_envelope(
            cfg.actuator.min_reach_mm,
            cfg.actuator.max_reach_mm,
        )),
    }
}

fn build_manager(cfg: &Config) -> ConversationManager {
    if cfg.llm.api_key.is_empty() {
        warn!("no API key configured; conversation requests will likely be rejected");
    }
    let history = cfg
        .llm
        .few_shot
        .iter()
        .fold(ChatHistory::new(cfg.llm.priming_prompt.clone()), |h, ex| {
            h.with_example(ex.user.clone(), ex.assistant.clone())
        });
    let driver = LlmDriver::new(cfg.llm.base_url.clone(), cfg.llm.api_key.expose());
    ConversationManager::new(
        history,
        Arc::new(driver),
        cfg.llm.model.clone(),
        cfg.token_budget(),
        TrajectorySink::new(cfg.llm.trajectory_path.clone()),
    )
}

async fn serve(cfg: Config, cancel: CancellationToken) -> Result<(), String> {
    let controller = build_controller(&cfg);
    serve_with(cfg, controller, cancel).await
}

async fn serve_with(
    cfg: Config,
    controller: Box<dyn ArmController>,
    cancel: CancellationToken,
) -> Result<(), String> {
    let arm = ArmHandle::new(controller);
    let procedures = cfg.procedures();

    match arm
        .startup(&cfg.actuator.host, &procedures, cfg.actuator.run_on_startup)
        .await
    {
        Ok(()) => info!(
            backend = %cfg.actuator.backend,
            host = %cfg.actuator.host,
            "actuator ready"
        ),
        Err(e) if cfg.actuator.allow_degraded => {
            warn!(error = %e, "actuator startup failed; serving in degraded mode");
        }
        Err(e) => {
            return Err(format!(
                "actuator startup failed ({e}); set actuator.allow_degraded = true to serve anyway"
            ));
        }
    }

    let manager = Arc::new(build_manager(&cfg));
    let (prompts, _worker) = PromptQueue::spawn(manager, cfg.server.prompt_queue_capacity);
    let ctx = CommandContext::new(arm.clone(), procedures)
        .with_prompts(prompts)
        .with_calibration_in_prompts(cfg.llm.include_calibration);

    let server = GatewayServer::bind(&cfg.gateway(), arm, ctx)
        .await
        .map_err(|e| e.to_string())?;
    let addr = server.local_addr().map_err(|e| e.to_string())?;

    println!();
    println!("  {} Gateway listening on {}", "✓".green().bold(), addr.to_string().bold());
    println!(
        "  Trajectories are written to {}",
        cfg.llm.trajectory_path.display().to_string().dimmed()
    );
    println!("  Press {} to stop.\n", "Ctrl-C".bold());

    server.run(cancel).await.map_err(|e| e.to_string())?;
    println!("{}", "  ✓ Gateway stopped.".green());
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// First-Run Wizard
// ─────────────────────────────────────────────────────────────────────────────

fn run_first_run_wizard() -> Config {
    println!();
    println!("{}", "  ╔══════════════════════════════════════╗".bold().cyan());
    println!("{}", "  ║       ArmLink First-Run Wizard       ║".bold().cyan());
    println!("{}", "  ╚══════════════════════════════════════╝".bold().cyan());
    println!();
    println!("  No configuration found.  Let's set up ArmLink.\n");

    let mut cfg = Config::default();

    // API key: required, ask until we get one or stdin closes.
    loop {
        match prompt_line("  Conversation service API key: ") {
            Some(key) if !key.is_empty() => {
                cfg.llm.api_key = ApiKey::new(key);
                break;
            }
            Some(_) => println!("  {}", "An API key is required.".yellow()),
            None => {
                println!("  {}", "No input; continuing without an API key.".yellow());
                break;
            }
        }
    }

    let port = prompt_line(&format!("  Gateway TCP port [{}]: ", cfg.server.port));
    if let Some(p) = port.and_then(|s| s.parse::<u16>().ok()) {
        cfg.server.port = p;
    }

    let host = prompt_line(&format!("  Robot controller host [{}]: ", cfg.actuator.host));
    if let Some(h) = host.filter(|h| !h.is_empty()) {
        cfg.actuator.host = h;
    }

    match config::save(&cfg) {
        Ok(()) => println!(
            "\n  {} Config saved to {}\n",
            "✓".green().bold(),
            config::config_path().display().to_string().bold()
        ),
        Err(e) => println!("{}: {}", "Error saving config".red(), e),
    }

    config::apply_env_overrides(&mut cfg);
    cfg
}

// ─────────────────────────────────────────────────────────────────────────────
// Banner
// ─────────────────────────────────────────────────────────────────────────────

fn print_banner() {
    println!();
    println!("{}", r#"    ___                 __    _       __  "#.bold().cyan());
    println!("{}", r#"   /   |  _________ ___/ /   (_)___  / /__"#.bold().cyan());
    println!("{}", r#"  / /| | / ___/ __ `__ \/ /   / / __ \/ //_/"#.bold().cyan());
    println!("{}", r#" / ___ |/ /  / / / / / / /___/ / / / / ,<   "#.bold().cyan());
    println!("{}", r#"/_/  |_/_/  /_/ /_/ /_/_____/_/_/ /_/_/|_|  "#.bold().cyan());
    println!();
    println!(
        "  {} {}",
        "ArmLink".bold(),
        format!("v{}", env!("CARGO_PKG_VERSION")).dimmed()
    );
    println!("  Robot arm telemetry and command gateway");
    println!();
}

fn print_usage() {
    println!("{}", "Usage".bold().underline());
    println!("  {}   – run the TCP gateway (default)", "armlink serve".bold().cyan());
    println!("  {}    – chat with the path planner", "armlink chat".bold().cyan());
    println!("  {}    – show this help", "armlink help".bold().cyan());
    println!();
}

// ─────────────────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────────────────

/// Print `msg` and read one trimmed line.  `None` on end of input.
fn prompt_line(msg: &str) -> Option<String> {
    use std::io::{BufRead, Write};
    print!("{msg}");
    std::io::stdout().flush().ok();
    let mut line = String::new();
    match std::io::stdin().lock().read_line(&mut line) {
        Ok(0) | Err(_) => None,
        Ok(_) => Some(line.trim().to_string()),
    }
}
