/// Evaluation Slots - Host-Wide Bound on Concurrent Evaluations
///
/// Workers hold a permit for the whole compile/evaluate/persist pass.
/// With a single slot the host judges strictly one run at a time.
use crate::error::{JudgeError, JudgeResult};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

#[derive(Clone)]
pub struct EvaluationSlots {
    semaphore: Arc<Semaphore>,
}

impl EvaluationSlots {
    pub fn new(slots: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(slots.max(1))),
        }
    }

    pub async fn acquire(&self) -> JudgeResult<OwnedSemaphorePermit> {
        self.semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| JudgeError::SlotsClosed)
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }
}
