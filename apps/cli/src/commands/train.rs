//! Training command implementation.

use crate::backend::BigramBackend;
use crate::commands::types::RunOptions;
use crate::config::CliConfig;
use anyhow::{Context, Result};
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::debug;
use tuneforge_training::{
    export_model, AttemptOutcome, RunConfig, RunEvent, RunPhase, RunSummary, RunSupervisor,
};

pub async fn execute(options: RunOptions, export: bool, json: bool, cli_config: &CliConfig) -> Result<()> {
    let raw = options.to_raw(cli_config)?;
    let config = RunConfig::from_raw(&raw).context("Invalid run configuration")?;
    let total_epochs = config.hyperparams.epochs;

    let supervisor = Arc::new(RunSupervisor::new(Arc::new(BigramBackend)));
    let mut events = supervisor.subscribe();
    let run_id = supervisor.start_from_config(config.clone()).context("Failed to start run")?;

    if !json {
        println!();
        println!("{}", "tuneforge train".bold().cyan());
        println!("  Run:     {}", run_id.to_string().dimmed());
        println!("  Model:   {}", config.model_id.cyan());
        println!("  Dataset: {}", config.dataset_path.display().to_string().dimmed());
        println!("  Output:  {}", config.output_dir.display().to_string().dimmed());
        println!();
    }

    let stopper = Arc::clone(&supervisor);
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("{}", "Stop requested, finishing the current epoch...".yellow());
            if let Err(e) = stopper.stop() {
                debug!(error = %e, "Stop request ignored");
            }
        }
    });

    let progress = if json { ProgressBar::hidden() } else { epoch_bar(total_epochs) };
    // Events are drained first; `wait` wins only when the worker ends without `Finished`.
    let outcome = loop {
        tokio::select! {
            biased;
            event = events.recv() => match event {
                Ok(RunEvent::Finished { .. }) | Err(RecvError::Closed) => break supervisor.wait().await,
                Ok(_) if json => {}
                Ok(event) => render_event(&progress, &event),
                Err(RecvError::Lagged(missed)) => debug!(missed, "Progress display fell behind"),
            },
            result = supervisor.wait() => break result,
        }
    };
    interrupt.abort();
    progress.finish_and_clear();

    let summary = outcome.context("Run did not report a result")?;

    let exported = if export && matches!(summary.phase, RunPhase::Completed | RunPhase::EarlyStopped) {
        Some(export_model(&config).context("Failed to export model")?)
    } else {
        None
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print_summary(&summary, total_epochs);
        if let Some(report) = &exported {
            println!("  Exported:   {}", report.export_dir.display().to_string().green());
        }
        println!();
    }

    if let Some(err) = &summary.error {
        anyhow::bail!("Run {} failed: {}", summary.run_id, err);
    }
    Ok(())
}

fn epoch_bar(total_epochs: u32) -> ProgressBar {
    let bar = ProgressBar::new(u64::from(total_epochs));
    if let Ok(style) = ProgressStyle::default_bar().template("{spinner:.cyan} [{bar:30.cyan/blue}] epoch {pos}/{len} {msg}")
    {
        bar.set_style(style.progress_chars("=> "));
    }
    bar.set_message("loading model");
    bar
}

/// Prints above the bar, or straight to stdout when the bar is not drawn.
fn say(progress: &ProgressBar, line: &str) {
    if progress.is_hidden() {
        println!("{line}");
    } else {
        progress.println(line);
    }
}

fn render_event(progress: &ProgressBar, event: &RunEvent) {
    match event {
        RunEvent::LoadAttempt { attempt, .. } => match attempt.outcome {
            AttemptOutcome::Success => say(progress, &format!(
                "  {} model loaded (attempt {}/{})",
                "✓".green(),
                attempt.attempt,
                attempt.max_attempts
            )),
            AttemptOutcome::Failure => {
                let retry = attempt
                    .backoff
                    .map_or_else(String::new, |b| format!(", retrying in {:.1}s", b.as_secs_f64()));
                say(progress, &format!(
                    "  {} load attempt {}/{} failed: {}{}",
                    "!".yellow(),
                    attempt.attempt,
                    attempt.max_attempts,
                    attempt.error.as_deref().unwrap_or("unknown error"),
                    retry
                ));
            }
        },
        RunEvent::PhaseChanged { to, .. } => match to {
            RunPhase::Training => progress.set_message("training"),
            RunPhase::Paused => progress.set_message("paused"),
            RunPhase::Stopping => progress.set_message("stopping"),
            _ => {}
        },
        RunEvent::EpochSample { epoch, total_epochs, loss, learning_rate, .. } => {
            progress.set_position(u64::from(*epoch));
            progress.set_message(format!("loss {loss:.4}"));
            say(progress, &format!(
                "  Epoch {epoch}/{total_epochs}  loss {}  lr {learning_rate:.2e}",
                format!("{loss:.4}").cyan()
            ));
        }
        RunEvent::CheckpointSaved { record, .. } => {
            if record.is_best {
                say(progress, &format!("    {} new best model ({:.4})", "★".yellow(), record.loss));
            }
        }
        RunEvent::Finished { .. } => {}
    }
}

fn print_summary(summary: &RunSummary, total_epochs: u32) {
    let status = match summary.phase {
        RunPhase::Completed => "completed".green(),
        RunPhase::EarlyStopped => "early stopped".green(),
        RunPhase::Cancelled => "cancelled".yellow(),
        RunPhase::Failed => "failed".red(),
        other => other.to_string().normal(),
    };

    println!("{}", "Run finished".bold());
    println!("  Status:     {status}");
    println!("  Epochs:     {}/{}", summary.epochs_completed, total_epochs);
    if let Some(best) = summary.best_loss {
        println!("  Best loss:  {best:.4}");
    }
    if let Some(path) = &summary.best_checkpoint {
        println!("  Best model: {}", path.display().to_string().dimmed());
    }
    if let Some(err) = &summary.error {
        println!("  Error:      {}", err.to_string().red());
    }
}
