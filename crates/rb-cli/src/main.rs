//! RegexBlock CLI
//!
//! Runs the background controller outside a browser, against a JSON state
//! file and the in-process rule engine.

mod file_store;

use std::fs;
use std::path::PathBuf;
use std::rc::Rc;

use clap::{Parser, Subcommand};
use log::info;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use rb_core::{
    dispatch_json, validate, Controller, ControllerConfig, LocalEngine, MatchObserver,
    ResourceType,
};

use crate::file_store::JsonFileStore;

type CliController = Controller<LocalEngine, JsonFileStore>;

#[derive(Parser)]
#[command(name = "rb-cli")]
#[command(about = "RegexBlock controller host and tools")]
struct Cli {
    /// State file holding the pattern, enabled flag and counter
    #[arg(long, global = true, default_value = "regexblock-state.json")]
    state: PathBuf,

    /// Controller configuration (JSON)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Do not load, save or report the blocked counter
    #[arg(long, global = true)]
    no_stats: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a pattern without touching any state
    Validate {
        /// Pattern to validate
        pattern: String,
    },

    /// Send one protocol command, e.g. '{"type":"enable"}'
    Send {
        /// Command as JSON
        message: String,
    },

    /// Show the controller state
    Status {
        /// Also print the rule installed in the engine
        #[arg(short, long)]
        verbose: bool,
    },

    /// Run a request URL through the rule engine
    Check {
        /// Request URL
        url: String,

        /// Resource type of the request
        #[arg(short = 't', long = "type", default_value = "xmlhttprequest")]
        request_type: String,
    },

    /// Serve JSON-lines commands on stdin/stdout
    Serve,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CheckRequest {
    url: String,
    #[serde(default = "default_check_type")]
    request_type: String,
}

fn default_check_type() -> String {
    ResourceType::XmlHttpRequest.as_str().to_string()
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();

    let result = match &cli.command {
        // Validation is pure; no state file or engine needed.
        Commands::Validate { pattern } => cmd_validate(pattern),
        _ => run_async(&cli),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

fn run_async(cli: &Cli) -> Result<(), String> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| format!("Failed to start tokio runtime: {}", e))?;
    let local = tokio::task::LocalSet::new();

    runtime.block_on(local.run_until(async {
        let config = load_config(cli)?;
        let (controller, observer) = start_controller(cli, config).await;

        match &cli.command {
            Commands::Send { message } => cmd_send(&controller, message).await,
            Commands::Status { verbose } => cmd_status(&controller, *verbose).await,
            Commands::Check { url, request_type } => {
                cmd_check(&controller, observer, url, request_type).await
            }
            Commands::Serve => cmd_serve(controller, observer).await,
            Commands::Validate { pattern } => cmd_validate(pattern),
        }
    }))
}

fn load_config(cli: &Cli) -> Result<ControllerConfig, String> {
    let mut config = match &cli.config {
        Some(path) => {
            let text = fs::read_to_string(path)
                .map_err(|e| format!("Failed to read '{}': {}", path.display(), e))?;
            serde_json::from_str(&text)
                .map_err(|e| format!("Invalid config '{}': {}", path.display(), e))?
        }
        None => ControllerConfig::default(),
    };
    if cli.no_stats {
        config.track_stats = false;
    }
    Ok(config)
}

async fn start_controller(
    cli: &Cli,
    config: ControllerConfig,
) -> (Rc<CliController>, MatchObserver<LocalEngine, JsonFileStore>) {
    let (engine, matches) = LocalEngine::new();
    let store = JsonFileStore::new(&cli.state);
    info!("Using state file '{}'", store.path().display());

    let controller = Rc::new(Controller::new(engine, store, config));
    controller.startup().await;

    let observer = MatchObserver::new(controller.clone(), matches);
    (controller, observer)
}

fn cmd_validate(pattern: &str) -> Result<(), String> {
    let result = validate(pattern);
    if !result.valid {
        return Err(format!(
            "Invalid regex: {}",
            result.error.unwrap_or_default()
        ));
    }

    println!("Pattern is valid");
    for warning in &result.warnings {
        println!("  warning: {}", warning);
    }
    Ok(())
}

async fn cmd_send(controller: &CliController, message: &str) -> Result<(), String> {
    let response = dispatch_json(controller, message).await;
    let text = serde_json::to_string(&response)
        .map_err(|e| format!("Failed to encode response: {}", e))?;
    println!("{text}");
    Ok(())
}

async fn cmd_status(controller: &CliController, verbose: bool) -> Result<(), String> {
    let state = controller.status().await;

    println!("Blocking:    {}", if state.enabled { "enabled" } else { "disabled" });
    println!("Pattern:     {}", state.pattern);
    if controller.config().track_stats {
        println!("Blocked:     {}", state.blocked_count);
    }

    if verbose {
        let rule = controller
            .adapter()
            .installed_rule()
            .await
            .map_err(|e| format!("Failed to read installed rule: {}", e))?;
        match rule {
            Some(rule) => {
                let text = serde_json::to_string_pretty(&rule)
                    .map_err(|e| format!("Failed to encode rule: {}", e))?;
                println!("Installed rule:\n{text}");
            }
            None => println!("Installed rule: none"),
        }
    }
    Ok(())
}

async fn cmd_check(
    controller: &CliController,
    mut observer: MatchObserver<LocalEngine, JsonFileStore>,
    url: &str,
    request_type: &str,
) -> Result<(), String> {
    let request_type: ResourceType = request_type.parse()?;
    let outcome = controller.adapter().engine().evaluate(url, request_type);
    observer.drain().await;

    println!("{}", if outcome.blocked { "blocked" } else { "allowed" });
    if controller.config().track_stats {
        println!("Blocked count: {}", controller.blocked_count());
    }
    Ok(())
}

async fn cmd_serve(
    controller: Rc<CliController>,
    mut observer: MatchObserver<LocalEngine, JsonFileStore>,
) -> Result<(), String> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|e| format!("Failed to read stdin: {}", e))?
    {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let reply = handle_line(&controller, line).await;
        // Count matches from this line before the next command can read them.
        observer.drain().await;
        let mut text = reply.to_string();
        text.push('\n');
        stdout
            .write_all(text.as_bytes())
            .await
            .map_err(|e| format!("Failed to write stdout: {}", e))?;
        stdout
            .flush()
            .await
            .map_err(|e| format!("Failed to write stdout: {}", e))?;
    }

    observer.drain().await;
    info!("stdin closed, shutting down");
    Ok(())
}

async fn handle_line(controller: &CliController, line: &str) -> Value {
    let is_check = serde_json::from_str::<Value>(line)
        .map(|v| v.get("type").and_then(Value::as_str) == Some("check"))
        .unwrap_or(false);

    if !is_check {
        let response = dispatch_json(controller, line).await;
        return serde_json::to_value(&response)
            .unwrap_or_else(|e| json!({ "success": false, "error": e.to_string() }));
    }

    let request = match serde_json::from_str::<CheckRequest>(line) {
        Ok(request) => request,
        Err(e) => return json!({ "success": false, "error": format!("Malformed check: {e}") }),
    };
    let request_type = match request.request_type.parse::<ResourceType>() {
        Ok(ty) => ty,
        Err(e) => return json!({ "success": false, "error": e }),
    };

    let outcome = controller.adapter().engine().evaluate(&request.url, request_type);
    json!({ "blocked": outcome.blocked, "ruleId": outcome.rule_id })
}
