use std::sync::Arc;

use futures::Stream;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{EngineError, Result};
use crate::model::ModelHandle;
use crate::types::{GenerationRequest, ResponseSnapshot};

use super::Generator;

impl Generator {
    /// Run `evaluate` on the blocking pool and forward its snapshots to an
    /// async consumer. Dropping the stream abandons the evaluation.
    pub fn evaluate_stream(
        self: &Arc<Self>,
        model: Arc<ModelHandle>,
        request: GenerationRequest,
    ) -> impl Stream<Item = Result<ResponseSnapshot>> + Send + 'static {
        let (tx, rx) = mpsc::channel(self.config.runtime.pipe_capacity.max(1));
        let generator = Arc::clone(self);

        let task = tokio::task::spawn_blocking(move || {
            let evaluation = match generator.evaluate(Some(&model), &request) {
                Ok(evaluation) => evaluation,
                Err(err) => {
                    let _ = tx.blocking_send(Err(err));
                    return;
                }
            };
            for item in evaluation {
                if tx.blocking_send(item).is_err() {
                    debug!("Snapshot consumer went away, abandoning evaluation");
                    break;
                }
            }
        });

        futures::stream::unfold((rx, Some(task)), |(mut rx, task)| async move {
            if let Some(item) = rx.recv().await {
                return Some((item, (rx, task)));
            }
            match task?.await {
                Ok(()) => None,
                Err(err) => Some((Err(EngineError::WorkerPanicked(err.to_string())), (rx, None))),
            }
        })
    }
}
