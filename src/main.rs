use std::io::BufRead;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use loopgrid::engine::Controller;
use loopgrid::{Config, Engine, EngineDeps};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// Path to the TOML configuration file. Defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Run for this many seconds, then shut down cleanly.
    #[arg(long)]
    duration: Option<u64>,
}

/// Translate line-based stdin commands into key events:
/// `d3` holds key 3 down, `u3` releases it, `q` quits.
fn spawn_stdin_driver(controller: Controller) {
    std::thread::Builder::new()
        .name("stdin-keys".into())
        .spawn(move || {
            let stdin = std::io::stdin();
            for line in stdin.lock().lines() {
                let Ok(line) = line else { break };
                match parse_command(line.trim()) {
                    Some(StdinCommand::Down(key)) => controller.key_down(key),
                    Some(StdinCommand::Up(key)) => controller.key_up(key),
                    Some(StdinCommand::Quit) => {
                        controller.shutdown();
                        break;
                    }
                    None => {
                        if !line.trim().is_empty() {
                            warn!(input = %line.trim(), "unrecognised command (try d1..d9, u1..u9, q)");
                        }
                    }
                }
            }
        })
        .ok();
}

enum StdinCommand {
    Down(u8),
    Up(u8),
    Quit,
}

fn parse_command(line: &str) -> Option<StdinCommand> {
    match line.as_bytes() {
        [b'q'] => Some(StdinCommand::Quit),
        [b'd', key @ b'1'..=b'9'] => Some(StdinCommand::Down(key - b'0')),
        [b'u', key @ b'1'..=b'9'] => Some(StdinCommand::Up(key - b'0')),
        _ => None,
    }
}

fn build_deps(config: &Config) -> Result<EngineDeps> {
    match config.camera.source.as_str() {
        "synthetic" => Ok(EngineDeps::headless()),
        other => anyhow::bail!("unsupported camera source '{other}'"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = CliArgs::parse();
    let config = match &args.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => Config::default(),
    };

    let deps = build_deps(&config)?;
    let engine = Engine::new(config, deps);
    let handles = engine.handles();

    spawn_stdin_driver(handles.controller());

    if let Some(secs) = args.duration {
        let controller = handles.controller();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(secs)).await;
            info!(secs, "scripted run complete, shutting down");
            controller.shutdown();
        });
    }

    info!("engine starting (keys: d1..d9 hold, u1..u9 release, q quit)");
    let exit_code = engine.run().await;

    let stats = handles.monitor().stats();
    info!(
        verdict = ?handles.monitor().verdict(),
        avg_fps = format!("{:.1}", stats.avg_fps),
        drops = stats.drops,
        exit_code,
        "engine finished"
    );

    std::process::exit(exit_code)
}
