use anyhow::{bail, Context, Result};
use rollcall_core::{Config, DetectorCascade, IdentityGallery, LbphRecognizer};
use rollcall_hw::Camera;
use std::io::BufRead;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod engine;
mod ledger;
mod policy;
mod sink;

use engine::{Pipeline, PipelineError, RunSummary, SystemClock};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::load().context("failed to load configuration")?;
    tracing::info!(
        camera = %config.camera_device,
        data_dir = %config.data_dir.display(),
        office_start = %config.office_start.format("%H:%M"),
        "rollcalld starting"
    );

    // Every startup resource is checked before the camera is touched.
    let model_dir = config.model_dir();
    let detectors = DetectorCascade::load(&model_dir, config.detection_params()).with_context(|| {
        format!(
            "cannot load face detectors from {} — put the three Haar cascade XML files there",
            model_dir.display()
        )
    })?;
    tracing::info!(dir = %model_dir.display(), "face detectors loaded");

    let recognizer = LbphRecognizer::load(&config.model_path()).context("cannot load trained model")?;
    if recognizer.face_size() != config.face_size {
        bail!(
            "trained model uses face size {} but face_size is {} — retrain with `rollcall train --face-size {}` or change the setting",
            recognizer.face_size(),
            config.face_size,
            config.face_size
        );
    }

    let gallery = IdentityGallery::load(&config.labels_path()).context("cannot load label mapping")?;

    let camera = Camera::open(&config.camera_device, config.frame_width, config.frame_height)
        .with_context(|| format!("camera {} is not opening", config.camera_device))?;

    let mut pipeline = Pipeline::new(&config, detectors, Box::new(recognizer), gallery, SystemClock)
        .context("cannot prepare output directories")?;

    let quit = Arc::new(AtomicBool::new(false));
    spawn_stdin_watcher(quit.clone());

    tracing::info!("camera started; press Ctrl-C or type q then Enter to quit");

    let loop_quit = quit.clone();
    let mut capture = tokio::task::spawn_blocking(move || -> Result<RunSummary, PipelineError> {
        let mut stream = camera.stream()?;
        pipeline.run(&mut stream, &loop_quit)
    });

    let joined = tokio::select! {
        res = &mut capture => res,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupt received; stopping after the current frame");
            quit.store(true, Ordering::SeqCst);
            (&mut capture).await
        }
    };

    let summary = joined.context("capture loop panicked")?.context("capture loop failed")?;
    tracing::info!(
        frames = summary.frames,
        faces = summary.faces,
        recorded = summary.recorded,
        unknown_captured = summary.unknown_captured,
        "rollcalld stopped"
    );

    Ok(())
}

/// Raise `quit` when a `q` line arrives on stdin.
fn spawn_stdin_watcher(quit: Arc<AtomicBool>) {
    let spawned = std::thread::Builder::new()
        .name("rollcall-stdin".into())
        .spawn(move || {
            for line in std::io::stdin().lock().lines() {
                match line {
                    Ok(line) if line.trim().eq_ignore_ascii_case("q") => {
                        quit.store(true, Ordering::SeqCst);
                        break;
                    }
                    Ok(_) => {}
                    Err(_) => break,
                }
            }
        });
    if let Err(e) = spawned {
        tracing::warn!(error = %e, "stdin watcher unavailable; use Ctrl-C to quit");
    }
}
