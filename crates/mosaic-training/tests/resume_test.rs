//! Resuming runs from checkpoints.

mod common;

use common::{base_config, context, patched, recorded_trainer, trainer, Recorder};
use mosaic_training::{
    CancellationToken, Checkpoint, ConfigContext, Namespaces, RunOptions, Termination, Trainer, TrainingError,
};
use serde_json::json;
use std::fs;
use std::path::PathBuf;
use tempfile::TempDir;

fn assert_close(a: &[f32], b: &[f32]) {
    assert_eq!(a.len(), b.len());
    for (x, y) in a.iter().zip(b) {
        assert!((x - y).abs() < 1e-5, "{a:?} != {b:?}");
    }
}

#[tokio::test]
async fn test_resume_from_epoch_checkpoint_restores_counters() {
    let temp = TempDir::new().unwrap();
    let config = patched(base_config(temp.path()), &[("trainer.epochs", json!(1))]);
    let mut first = trainer(config, "first");
    first.train().await.unwrap();
    let path = first.checkpoint_dir().join("checkpoint-epoch1.json");

    let options = RunOptions {
        resume: Some(path.clone()),
        overrides: vec![("trainer.epochs".to_string(), json!(3))],
        run_id: Some("second".to_string()),
        ..RunOptions::default()
    };
    let recorder = Recorder::new();
    let events = recorder.events.clone();
    let mut second =
        recorded_trainer(ConfigContext::from_options(&options).unwrap(), &Namespaces::builtin().unwrap(), recorder);
    let outcome = second.train().await.unwrap();

    assert_eq!(outcome.state.epoch, 3);
    assert_eq!(outcome.state.step, 15);
    let steps: Vec<u64> = Recorder::named(&events, "train/loss").into_iter().map(|(_, s)| s).collect();
    assert_eq!(steps.first(), Some(&6));
    assert!(second.checkpoint_dir().join("checkpoint-epoch3.json").exists());
    assert!(!second.checkpoint_dir().join("checkpoint-epoch1.json").exists());
}

#[tokio::test]
async fn test_interrupted_run_resumes_mid_epoch_deterministically() {
    let temp = TempDir::new().unwrap();
    let config = patched(base_config(temp.path()), &[("trainer.save_steps", json!(3))]);

    let mut reference = trainer(config.clone(), "reference");
    let expected = reference.train().await.unwrap();
    assert_eq!(expected.state.step, 10);
    let expected_params = reference.components().model.parameters().to_vec();

    let token = CancellationToken::new();
    let mut interrupted =
        recorded_trainer(context(config, None, "interrupted"), &Namespaces::builtin().unwrap(), Recorder::cancelling_at(7, token.clone()))
            .with_cancellation(token);
    let outcome = interrupted.train().await.unwrap();
    assert_eq!(outcome.termination, Termination::Interrupted);
    assert_eq!(outcome.state.step, 7);
    let last = outcome.last_checkpoint.clone().unwrap();
    assert_eq!(last.file_name().unwrap(), "checkpoint-step6.json");

    let saved = Checkpoint::load(&last).unwrap();
    assert_eq!(saved.training_state.epoch, 1);
    assert_eq!(saved.training_state.step, 6);
    assert_eq!(saved.training_state.epoch_batches, 1);

    let options = RunOptions { resume: Some(last), run_id: Some("resumed".to_string()), ..RunOptions::default() };
    let recorder = Recorder::new();
    let events = recorder.events.clone();
    let mut resumed =
        recorded_trainer(ConfigContext::from_options(&options).unwrap(), &Namespaces::builtin().unwrap(), recorder);
    let outcome = resumed.train().await.unwrap();

    assert_eq!(outcome.termination, Termination::Completed);
    assert_eq!(outcome.state.step, 10);
    let steps: Vec<u64> = Recorder::named(&events, "train/loss").into_iter().map(|(_, s)| s).collect();
    assert_eq!(steps, vec![7, 8, 9, 10]);
    assert_close(resumed.components().model.parameters(), &expected_params);
}

#[tokio::test]
async fn test_resumed_scheduler_continues_from_saved_position() {
    let temp = TempDir::new().unwrap();
    let config = patched(
        base_config(temp.path()),
        &[
            ("trainer.epochs", json!(3)),
            ("lr_scheduler", json!({"type": "StepLR", "args": {"step_size": 1, "gamma": 0.5}})),
        ],
    );

    let recorder = Recorder::new();
    let reference_events = recorder.events.clone();
    let mut reference =
        recorded_trainer(context(config.clone(), None, "reference"), &Namespaces::builtin().unwrap(), recorder);
    reference.train().await.unwrap();
    let reference_lrs: Vec<(f64, u64)> =
        Recorder::named(&reference_events, "train/lr").into_iter().filter(|(_, step)| *step > 5).collect();

    let mut first = trainer(patched(config, &[("trainer.epochs", json!(1))]), "first");
    first.train().await.unwrap();

    let options = RunOptions {
        resume: Some(first.checkpoint_dir().join("checkpoint-epoch1.json")),
        overrides: vec![("trainer.epochs".to_string(), json!(3))],
        run_id: Some("resumed".to_string()),
        ..RunOptions::default()
    };
    let recorder = Recorder::new();
    let events = recorder.events.clone();
    let mut resumed =
        recorded_trainer(ConfigContext::from_options(&options).unwrap(), &Namespaces::builtin().unwrap(), recorder);
    assert!((resumed.components().optimizer.learning_rate() - 0.05).abs() < 1e-12);
    resumed.train().await.unwrap();

    let resumed_lrs = Recorder::named(&events, "train/lr");
    assert_eq!(resumed_lrs.len(), reference_lrs.len());
    for ((lr, step), (expected, expected_step)) in resumed_lrs.iter().zip(&reference_lrs) {
        assert_eq!(step, expected_step);
        assert!((lr - expected).abs() < 1e-12, "step {step}: {resumed_lrs:?} vs {reference_lrs:?}");
    }
    assert!((resumed_lrs[0].0 - 0.025).abs() < 1e-12);
}

async fn checkpoint_with_scheduler(temp: &TempDir) -> PathBuf {
    let config = patched(
        base_config(temp.path()),
        &[("trainer.epochs", json!(1)), ("lr_scheduler", json!({"type": "StepLR", "args": {"step_size": 1}}))],
    );
    let mut first = trainer(config, "scheduled");
    first.train().await.unwrap();
    first.checkpoint_dir().join("checkpoint-epoch1.json")
}

#[tokio::test]
async fn test_scheduler_presence_mismatch_is_fatal() {
    let temp = TempDir::new().unwrap();
    let path = checkpoint_with_scheduler(&temp).await;

    let config = patched(base_config(temp.path()), &[("trainer.epochs", json!(2))]);
    let mut trainer = Trainer::from_context_with(context(config, Some(path), "nosched"), &Namespaces::builtin().unwrap(), |_| None)
        .unwrap();
    let err = trainer.train().await.unwrap_err();

    assert!(matches!(err, TrainingError::IncompatibleResume(ref reason) if reason.contains("StepLR")), "{err}");
    assert_eq!(trainer.state().step, 0);
}

#[tokio::test]
async fn test_scheduler_kind_mismatch_is_fatal() {
    let temp = TempDir::new().unwrap();
    let path = checkpoint_with_scheduler(&temp).await;

    let config = patched(
        base_config(temp.path()),
        &[(
            "lr_scheduler",
            json!({"type": "get_constant_schedule_with_warmup", "args": {"num_warmup_steps": 2}}),
        )],
    );
    let mut trainer =
        Trainer::from_context_with(context(config, Some(path), "othersched"), &Namespaces::builtin().unwrap(), |_| None)
            .unwrap();
    let err = trainer.train().await.unwrap_err();
    assert!(matches!(err, TrainingError::IncompatibleResume(_)), "{err}");
}

#[tokio::test]
async fn test_optimizer_mismatch_is_fatal() {
    let temp = TempDir::new().unwrap();
    let config = patched(base_config(temp.path()), &[("trainer.epochs", json!(1))]);
    let mut first = trainer(config.clone(), "adamw");
    first.train().await.unwrap();
    let path = first.checkpoint_dir().join("checkpoint-epoch1.json");

    let config = patched(config, &[("optimizer", json!({"type": "SGD", "args": {"lr": 0.1}}))]);
    let mut trainer =
        Trainer::from_context_with(context(config, Some(path), "sgd"), &Namespaces::builtin().unwrap(), |_| None).unwrap();
    let err = trainer.train().await.unwrap_err();
    assert!(matches!(err, TrainingError::IncompatibleResume(ref reason) if reason.contains("optimizer")), "{err}");
}

#[tokio::test]
async fn test_partial_checkpoint_is_rejected() {
    let temp = TempDir::new().unwrap();
    let config = patched(base_config(temp.path()), &[("trainer.epochs", json!(1))]);
    let mut first = trainer(config, "partial");
    first.train().await.unwrap();

    let source = first.checkpoint_dir().join("checkpoint-epoch1.json");
    let mut value: serde_json::Value = serde_json::from_slice(&fs::read(&source).unwrap()).unwrap();
    value.as_object_mut().unwrap().remove("optimizer");
    let partial = temp.path().join("partial.json");
    fs::write(&partial, serde_json::to_vec(&value).unwrap()).unwrap();

    let options = RunOptions { resume: Some(partial), ..RunOptions::default() };
    let err = ConfigContext::from_options(&options).unwrap_err();
    assert!(matches!(err, TrainingError::CorruptCheckpoint { ref reason, .. } if reason.contains("optimizer")), "{err}");
}
