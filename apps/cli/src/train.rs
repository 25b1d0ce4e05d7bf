//! The training command.

use crate::{logging, Args};
use anyhow::{Context, Result};
use colored::Colorize;
use mosaic_training::{
    parse_device, parse_override, CancellationToken, ConfigContext, Namespaces, RunOptions, Termination, Trainer,
    TrainOutcome,
};
use serde_json::Value;
use tracing::{info, warn};

/// Translates flags into run options. `--lr` and `--bs` apply before `--set`.
pub fn run_options(args: &Args) -> Result<RunOptions> {
    let device = args.device.as_deref().map(parse_device).transpose()?;

    let mut overrides = Vec::new();
    if let Some(lr) = args.lr {
        overrides.push(("optimizer.args.lr".to_string(), Value::from(lr)));
    }
    if let Some(bs) = args.bs {
        overrides.push(("data_loader.args.batch_size".to_string(), Value::from(bs)));
    }
    for spec in &args.overrides {
        overrides.push(parse_override(spec)?);
    }

    Ok(RunOptions {
        config: args.config.clone(),
        resume: args.resume.clone(),
        device,
        observe: args.observe,
        overrides,
        run_id: args.run_id.clone(),
    })
}

pub async fn execute(args: Args) -> Result<Termination> {
    let options = run_options(&args)?;
    let ctx = ConfigContext::from_options(&options).context("Failed to resolve the run configuration")?;

    let level = match &args.log_level {
        Some(level) => level.clone(),
        None => ctx.trainer()?.log_level().to_string(),
    };
    logging::init(&level, args.log_format, &ctx.layout().log_file())?;
    info!(run = %ctx.layout().name(), run_id = %ctx.layout().run_id(), "Resolved configuration");

    let namespaces = Namespaces::builtin()?;
    let mut trainer = Trainer::from_context(ctx, &namespaces).context("Failed to build training components")?;

    let token = CancellationToken::new();
    trainer = trainer.with_cancellation(token.clone());
    let watcher = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping after the current step");
            token.cancel();
        }
    });

    let outcome = trainer.train().await;
    watcher.abort();
    let outcome = outcome.context("Training failed")?;

    print_summary(&trainer, &outcome);
    Ok(outcome.termination)
}

fn print_summary(trainer: &Trainer, outcome: &TrainOutcome) {
    let headline = match outcome.termination {
        Termination::Completed => "Training complete".bold().green(),
        Termination::EarlyStopped { stale } => format!("Stopped early after {stale} stale validations").bold().yellow(),
        Termination::Interrupted => "Training interrupted".bold().yellow(),
    };

    println!();
    println!("{headline}");
    println!("  Run: {}", format!("{}/{}", trainer.layout().name(), trainer.layout().run_id()).cyan());
    println!("  Epochs: {}  Steps: {}", outcome.state.epoch, outcome.state.step);
    println!("  Validations: {}  Checkpoints written: {}", outcome.validations, outcome.checkpoints_written);
    if let Some(best) = outcome.state.best {
        println!("  Best {}: {best:.6}", trainer.settings().monitor);
    }
    if let Some(path) = &outcome.best_checkpoint {
        println!("  Best checkpoint: {}", path.display().to_string().dimmed());
    }
    if let Some(path) = &outcome.last_checkpoint {
        println!("  Last checkpoint: {}", path.display().to_string().dimmed());
    }
    println!();
}

/// Prints every registered type, one namespace per block.
pub fn list_components() -> Result<()> {
    let ns = Namespaces::builtin()?;
    let blocks = [
        ("data_loader", ns.data_loaders.names()),
        ("arch", ns.models.names()),
        ("arch.args.text_params.model", ns.tokenizers.names()),
        ("loss", ns.losses.names()),
        ("metrics", ns.metrics.names()),
        ("optimizer", ns.optimizers.names()),
        ("lr_scheduler", ns.schedulers.names()),
        ("visualizer", ns.visualizers.names()),
    ];
    for (section, names) in blocks {
        println!("{}", section.bold().cyan());
        for name in names {
            println!("  {name}");
        }
    }
    Ok(())
}
