//! Drill subcommand - rehearse a shutdown with simulated tasks

use std::collections::BTreeMap;
use std::process::ExitCode;
use std::sync::mpsc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Args;
use comfy_table::{Cell, Color, Table, modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};

use graceful_core::Outcome;

use crate::config::Config;

#[derive(Args, Debug)]
pub struct DrillArgs {
    /// Simulated task as NAME=MILLISECONDS (repeatable)
    #[arg(short, long = "task", value_parser = parse_task, required = true)]
    pub tasks: Vec<DrillTask>,

    /// Trigger shutdown after this many milliseconds
    #[arg(long, default_value_t = 0)]
    pub trigger_after_ms: u64,

    /// Wait for a configured OS signal instead of triggering
    #[arg(long, conflicts_with = "trigger_after_ms")]
    pub wait_signal: bool,

    /// Make the named task panic instead of sleeping (repeatable)
    #[arg(long = "panic", value_name = "NAME")]
    pub panics: Vec<String>,

    /// Print the outcome as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DrillTask {
    pub name: String,
    pub duration: Duration,
}

fn parse_task(s: &str) -> Result<DrillTask, String> {
    let (name, ms) = s
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=MILLISECONDS, got {s:?}"))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(format!("task name is empty in {s:?}"));
    }
    let ms: u64 = ms
        .trim()
        .parse()
        .map_err(|e| format!("invalid milliseconds in {s:?}: {e}"))?;
    Ok(DrillTask {
        name: name.to_string(),
        duration: Duration::from_millis(ms),
    })
}

/// Spinner for one task; hidden when no progress display is active.
fn task_spinner(multi: Option<&MultiProgress>, name: &str) -> ProgressBar {
    let Some(multi) = multi else {
        return ProgressBar::hidden();
    };
    let pb = multi.add(ProgressBar::new_spinner());
    pb.set_style(
        ProgressStyle::with_template("{spinner:.green} {prefix:<16.cyan.bold} {wide_msg}")
            .expect("invalid template"),
    );
    pb.set_prefix(name.to_string());
    pb.set_message("waiting for shutdown");
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

fn status_table(tasks: &[DrillTask], outcome: &Outcome) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_header(vec![
            Cell::new("Task").fg(Color::Cyan),
            Cell::new("Planned").fg(Color::Cyan),
            Cell::new("Status").fg(Color::Cyan),
        ]);

    for task in tasks {
        let stuck = outcome.stuck_tasks().contains(&task.name);
        table.add_row(vec![
            Cell::new(&task.name),
            Cell::new(format!("{}ms", task.duration.as_millis())),
            if stuck {
                Cell::new("stuck").fg(Color::Red)
            } else {
                Cell::new("done").fg(Color::Green)
            },
        ]);
    }
    table
}

pub fn run(
    args: DrillArgs,
    config: &Config,
    timeout_ms: Option<u64>,
    multi: Option<&MultiProgress>,
) -> Result<ExitCode> {
    let mut builder = super::switch_builder(&config.shutdown, timeout_ms)?;
    if !args.wait_signal {
        builder = builder.without_signals();
    }
    let (tx, rx) = mpsc::channel();
    let switch = builder.done(tx).build();

    // Later duplicates replace earlier ones, same as the registry does.
    let tasks: Vec<DrillTask> = args
        .tasks
        .into_iter()
        .map(|t| (t.name.clone(), t))
        .collect::<BTreeMap<_, _>>()
        .into_values()
        .collect();

    let mut spinners = BTreeMap::new();
    for task in &tasks {
        let pb = task_spinner(multi, &task.name);
        spinners.insert(task.name.clone(), pb.clone());

        let duration = task.duration;
        let name = task.name.clone();
        let panics = args.panics.contains(&task.name);
        switch.on_shutdown(task.name.clone(), move || {
            pb.set_message("running");
            if panics {
                pb.abandon_with_message("panicked");
                panic!("drill task {name} failed on purpose");
            }
            std::thread::sleep(duration);
            pb.finish_with_message(format!("done in {}ms", duration.as_millis()));
        });
    }

    if args.wait_signal {
        let names: Vec<&str> = switch
            .signals()
            .iter()
            .map(|&sig| graceful_core::signal_name(sig).unwrap_or("?"))
            .collect();
        log::info!("Waiting for {}", names.join(" or "));
    } else {
        std::thread::sleep(Duration::from_millis(args.trigger_after_ms));
        log::info!("Triggering shutdown");
        switch.shutdown();
    }

    let outcome = rx.recv().context("Shutdown switch closed without a result")?;

    for name in outcome.stuck_tasks() {
        if let Some(pb) = spinners.get(name) {
            pb.abandon_with_message("still running at deadline");
        }
    }

    if args.json {
        println!("{}", serde_json::to_string(&outcome)?);
    } else {
        eprintln!("\n{}", status_table(&tasks, &outcome));
    }

    match outcome.into_result() {
        Ok(()) => Ok(ExitCode::SUCCESS),
        Err(e) => {
            log::error!("{e}");
            Ok(ExitCode::from(1))
        }
    }
}
