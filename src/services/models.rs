use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::providers::{ChatBackend, ModelInfo, PullEvent, PullProgress, TransportError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PullOutcome {
    Completed,
    Aborted,
    Failed(TransportError),
}

pub async fn list_models(backend: &dyn ChatBackend) -> Result<Vec<ModelInfo>, TransportError> {
    let models = backend.list_models().await?;
    tracing::debug!("Server reports {} models", models.len());
    Ok(models)
}

pub async fn delete_model(backend: &dyn ChatBackend, name: &str) -> Result<(), TransportError> {
    backend.delete_model(name).await?;
    tracing::info!("Deleted model {}", name);
    Ok(())
}

pub async fn check_connection(backend: &dyn ChatBackend) -> bool {
    backend.check_connection().await
}

/// Download a model, reporting each progress line until the pull ends.
pub async fn pull_model<F>(
    backend: Arc<dyn ChatBackend>,
    name: &str,
    cancel: CancellationToken,
    mut on_progress: F,
) -> PullOutcome
where
    F: FnMut(&PullProgress) + Send,
{
    let (tx, mut rx) = mpsc::channel::<PullEvent>(64);
    let model = name.to_string();
    let _pull_handle = tokio::spawn(async move {
        if let Err(e) = backend.pull_model(&model, tx.clone(), cancel).await {
            let _ = tx.send(PullEvent::Error(e)).await;
        }
    });

    let outcome = loop {
        match rx.recv().await {
            Some(PullEvent::Progress(progress)) => on_progress(&progress),
            Some(PullEvent::Done) => break PullOutcome::Completed,
            Some(PullEvent::Aborted) => break PullOutcome::Aborted,
            Some(PullEvent::Error(e)) => break PullOutcome::Failed(e),
            None => {
                break PullOutcome::Failed(TransportError::Stream(
                    "Pull ended unexpectedly".to_string(),
                ))
            }
        }
    };

    match &outcome {
        PullOutcome::Completed => tracing::info!("Pulled model {}", name),
        PullOutcome::Aborted => tracing::info!("Pull of {} cancelled", name),
        PullOutcome::Failed(e) => tracing::error!("Pull of {} failed: {}", name, e),
    }
    outcome
}

/// `"{status} - {percent}%"` once the size is known, otherwise the bare status.
pub fn format_progress(progress: &PullProgress) -> String {
    match (progress.completed, progress.total) {
        (Some(completed), Some(total)) if total > 0 => {
            let percent = ((completed as f64 / total as f64) * 100.0).round() as u64;
            format!("{} - {}%", progress.status, percent)
        }
        _ => progress.status.clone(),
    }
}
