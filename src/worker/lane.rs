use super::request::{GenerationOutcome, GenerationRequest};
use crate::config::ReliabilityConfig;
use crate::error::WorkerError;
use crate::providers::ModelGateway;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::{Notify, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

struct PendingRequest {
    request: GenerationRequest,
    reply: oneshot::Sender<GenerationOutcome>,
}

/// Single-slot (or, in queue mode, FIFO) mailbox shared between the
/// submitting caller and the lane's worker task.
struct Mailbox {
    pending: Mutex<VecDeque<PendingRequest>>,
    notify: Notify,
    queue_submissions: bool,
}

impl Mailbox {
    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<PendingRequest>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn take(&self) -> Option<PendingRequest> {
        self.lock().pop_front()
    }

    /// Place a request. Under the default replace policy any request
    /// still waiting in the slot is dropped; dropping its reply sender
    /// is what tells the superseded caller its prompt was replaced.
    fn put(&self, pending: PendingRequest) {
        let mut slot = self.lock();
        if !self.queue_submissions {
            slot.clear();
        }
        slot.push_back(pending);
        drop(slot);
        self.notify.notify_one();
    }

    fn clear(&self) {
        self.lock().clear();
    }
}

/// One generation pipeline: accepts at most one in-flight request at a
/// time, runs it against the gateway with bounded linear-backoff retry,
/// and emits exactly one terminal outcome per accepted request.
pub struct WorkerLane {
    mailbox: Arc<Mailbox>,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
    label: &'static str,
}

impl WorkerLane {
    pub fn spawn(
        label: &'static str,
        gateway: Arc<dyn ModelGateway>,
        reliability: &ReliabilityConfig,
    ) -> Self {
        let mailbox = Arc::new(Mailbox {
            pending: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            queue_submissions: reliability.queue_submissions,
        });
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_loop(
            label,
            Arc::clone(&mailbox),
            gateway,
            reliability.max_retries.max(1),
            Duration::from_millis(reliability.base_delay_ms),
            cancel.clone(),
        ));
        Self {
            mailbox,
            cancel,
            handle,
            label,
        }
    }

    /// Submit a request and get the receiver for its terminal outcome.
    ///
    /// If the lane is already stopping the request is refused up front.
    /// If a later submission replaces this one before the worker starts
    /// it, the returned receiver resolves with a closed-channel error.
    pub fn submit(
        &self,
        request: GenerationRequest,
    ) -> Result<oneshot::Receiver<GenerationOutcome>, WorkerError> {
        if self.cancel.is_cancelled() {
            return Err(WorkerError::ShuttingDown);
        }
        let (reply, receiver) = oneshot::channel();
        self.mailbox.put(PendingRequest { request, reply });
        Ok(receiver)
    }

    /// Drop any request that has not been started yet.
    pub fn cancel_pending(&self) {
        self.mailbox.clear();
    }

    /// Signal the worker to stop at its next wait or backoff boundary.
    /// An attempt already in flight is allowed to finish; its outcome is
    /// discarded.
    pub fn shutdown(&self) {
        self.cancel.cancel();
        self.mailbox.notify.notify_one();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Await worker-task exit after [`WorkerLane::shutdown`].
    pub async fn join(self) {
        if let Err(error) = self.handle.await {
            tracing::warn!(lane = self.label, %error, "worker task join failed");
        }
    }
}

async fn run_loop(
    label: &'static str,
    mailbox: Arc<Mailbox>,
    gateway: Arc<dyn ModelGateway>,
    max_retries: u32,
    base_delay: Duration,
    cancel: CancellationToken,
) {
    tracing::debug!(lane = label, "worker lane started");
    loop {
        let Some(pending) = mailbox.take() else {
            tokio::select! {
                () = cancel.cancelled() => break,
                () = mailbox.notify.notified() => continue,
            }
        };

        if cancel.is_cancelled() {
            // Reply sender drops here; the caller sees the lane stop.
            break;
        }

        let outcome =
            run_attempts(label, gateway.as_ref(), &pending.request, max_retries, base_delay, &cancel)
                .await;

        match outcome {
            Some(outcome) if !cancel.is_cancelled() => {
                if pending.reply.send(outcome).is_err() {
                    tracing::debug!(lane = label, "caller went away before the outcome landed");
                }
            }
            Some(_) => {
                tracing::info!(lane = label, "discarding outcome completed during shutdown");
            }
            None => {}
        }
    }
    tracing::debug!(lane = label, "worker lane stopped");
}

/// Execute up to `max_retries` attempts with a linearly growing delay
/// between them: attempt N sleeps N × base before the next try.
async fn run_attempts(
    label: &'static str,
    gateway: &dyn ModelGateway,
    request: &GenerationRequest,
    max_retries: u32,
    base_delay: Duration,
    cancel: &CancellationToken,
) -> Option<GenerationOutcome> {
    let started = Instant::now();

    for attempt in 1..=max_retries {
        match gateway
            .invoke(&request.prompt, &request.history, request.image.as_ref())
            .await
        {
            Ok(completion) => {
                if attempt > 1 {
                    tracing::info!(lane = label, attempt, "generation recovered after retries");
                }
                return Some(GenerationOutcome::Success {
                    text: completion.text,
                    elapsed: started.elapsed(),
                });
            }
            Err(error) => {
                tracing::warn!(
                    lane = label,
                    attempt,
                    max_retries,
                    kind = error.kind(),
                    %error,
                    "generation attempt failed"
                );
                if attempt < max_retries {
                    let delay = base_delay * attempt;
                    tokio::select! {
                        () = cancel.cancelled() => return None,
                        () = tokio::time::sleep(delay) => {}
                    }
                } else {
                    return Some(GenerationOutcome::Failure {
                        error: WorkerError::RetryExhausted {
                            source: error,
                            attempts: max_retries,
                        },
                    });
                }
            }
        }
    }

    // max_retries >= 1, so the loop always returns above.
    None
}
