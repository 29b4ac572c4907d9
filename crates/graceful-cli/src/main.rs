//! graceful - host process for the shutdown switch
//!
//! Runs a small TCP service or a shutdown drill on top of
//! `graceful-core`, with every subsystem registered as a named shutdown task.

use std::io::IsTerminal;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};
use indicatif::MultiProgress;

mod cmd;
mod config;

use config::Config;

#[derive(Parser)]
#[command(name = "graceful")]
#[command(about = "Graceful shutdown host: serve or rehearse a shutdown")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    /// Config file path (default: ./graceful.toml or ~/.config/graceful/config.toml)
    #[arg(short, long, global = true)]
    config: Option<std::path::PathBuf>,

    /// Shutdown deadline in milliseconds
    #[arg(long, global = true)]
    timeout_ms: Option<u64>,
}

#[derive(Subcommand)]
enum Command {
    /// Run a line-oriented TCP server until interrupted or sent `exit`
    Serve(cmd::serve::ServeArgs),
    /// Register simulated tasks, trigger shutdown and report the outcome
    Drill(cmd::drill::DrillArgs),
    /// Show current configuration
    Config,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    // Spinners only make sense on a terminal; elsewhere logs are the only indicator.
    let multi = std::io::stderr().is_terminal().then(MultiProgress::new);
    let drill_ui = matches!(cli.command, Command::Drill(_));
    let quiet = drill_ui && multi.is_some() && !cli.debug;
    graceful_core::init_logging(quiet, cli.debug, multi.as_ref().filter(|_| drill_ui));

    match run(cli, multi.as_ref()) {
        Ok(code) => code,
        Err(e) => {
            log::error!("{e:#}");
            ExitCode::from(2)
        }
    }
}

fn run(cli: Cli, multi: Option<&MultiProgress>) -> Result<ExitCode> {
    let config = if let Some(path) = &cli.config {
        Config::from_file(path)?
    } else {
        Config::load()?
    };

    match cli.command {
        Command::Serve(args) => {
            cmd::serve::run(args, &config, cli.timeout_ms)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Drill(args) => cmd::drill::run(args, &config, cli.timeout_ms, multi),
        Command::Config => {
            show_config(&config, cli.timeout_ms);
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn show_config(config: &Config, timeout_ms: Option<u64>) {
    use comfy_table::{Cell, Color, Table, modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL};

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_header(vec![
            Cell::new("Setting").fg(Color::Cyan),
            Cell::new("Value").fg(Color::Cyan),
        ]);

    table.add_row(vec![
        "Shutdown timeout",
        &format!("{}ms", timeout_ms.unwrap_or(config.shutdown.timeout_ms)),
    ]);
    table.add_row(vec!["Signals", &config.shutdown.signals.join(", ")]);
    table.add_row(vec![
        "Force exit on repeat",
        if config.shutdown.force_exit_on_repeat {
            "yes"
        } else {
            "no"
        },
    ]);
    table.add_row(vec!["Listen", &config.serve.listen]);
    table.add_row(vec!["Drain", &format!("{}ms", config.serve.drain_ms)]);
    table.add_row(vec![
        "Journal",
        &config
            .serve
            .journal
            .as_ref()
            .map_or_else(|| "-".to_string(), |p| p.display().to_string()),
    ]);

    eprintln!("\n{table}");
}
