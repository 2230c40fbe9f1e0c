use anyhow::{Context, Result};
use clap::Parser;
use facetrain_trainer::{run_training, TrainConfig};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = TrainConfig::parse();
    config.validate()?;

    if let Some(gpu) = &config.gpu_id {
        std::env::set_var("CUDA_VISIBLE_DEVICES", gpu);
        tracing::info!(gpu = %gpu, "CUDA_VISIBLE_DEVICES set");
    }

    let run_dir = config.run_dir();
    std::fs::create_dir_all(&run_dir)
        .with_context(|| format!("creating run directory {}", run_dir.display()))?;
    config.write_toml(&run_dir.join("config.toml"))?;
    tracing::info!(run_dir = %run_dir.display(), "facetrain-train starting");

    // Training is blocking work; keep it off the async runtime.
    let stop = Arc::new(AtomicBool::new(false));
    let (reply_tx, mut reply_rx) = oneshot::channel();
    let worker = std::thread::Builder::new()
        .name("facetrain-trainer".into())
        .spawn({
            let stop = Arc::clone(&stop);
            let run_dir = run_dir.clone();
            move || {
                let result = run_training(&config, &run_dir, stop);
                let _ = reply_tx.send(result);
            }
        })
        .context("failed to spawn training thread")?;

    let result = tokio::select! {
        result = &mut reply_rx => result,
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!("interrupt received, stopping after the current batch");
            stop.store(true, Ordering::Relaxed);
            reply_rx.await
        }
    };
    let summary = result.context("training thread exited without a result")??;
    if worker.join().is_err() {
        tracing::error!("training thread panicked after reporting");
    }

    if let Some(last) = summary.epochs.last() {
        tracing::info!(
            epochs = summary.epochs.len(),
            last_epoch = last.epoch,
            avg_loss = last.avg_loss,
            train_accuracy = ?last.train_accuracy,
            test_accuracy = ?summary.test.as_ref().map(|r| r.mean_accuracy),
            stopped = summary.stopped,
            "facetrain-train finished"
        );
    }
    Ok(())
}
