/// Background prefetch pipeline
///
/// Worker threads pull samples from their producer, stack them into
/// mini-batches and push the batches into a bounded queue; the training
/// thread dequeues one batch per step.
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use super::queue::{bounded_queue, BatchReceiver, BatchSender, CancelToken, QueueError};
use super::{MiniBatch, Sample, SampleProducer};
use crate::config::SampleShape;
use crate::PoseError;

/// First fatal worker error, shared with the consumer
type FailureSlot = Arc<Mutex<Option<String>>>;

/// Bounded, concurrently-fed batch buffer
pub struct PrefetchQueue {
    receiver: BatchReceiver<MiniBatch>,
    workers: Vec<JoinHandle<()>>,
    cancel: CancelToken,
    failure: FailureSlot,
}

impl PrefetchQueue {
    /// Spawn one worker per producer
    ///
    /// # Arguments
    /// * `producers` - One producer (dataset shard) per worker
    /// * `shape` - Expected per-sample geometry; mismatching samples are skipped
    /// * `batch_size` - Samples per mini-batch
    /// * `capacity` - Queue capacity, in batches
    /// * `cancel` - Coordinator token; cancelling stops every worker
    pub fn start(
        producers: Vec<Box<dyn SampleProducer>>,
        shape: SampleShape,
        batch_size: usize,
        capacity: usize,
        cancel: CancelToken,
    ) -> crate::Result<Self> {
        let total = producers.len();
        let producers: Vec<Box<dyn SampleProducer>> =
            producers.into_iter().filter(|p| !p.is_empty()).collect();
        if producers.is_empty() {
            return Err(PoseError::Pipeline(format!(
                "none of {} sample producers has any samples",
                total
            )));
        }
        if producers.len() < total {
            log::debug!("Skipping {} empty producers", total - producers.len());
        }
        if batch_size == 0 || capacity == 0 {
            return Err(PoseError::Pipeline(
                "batch_size and queue capacity must be > 0".to_string(),
            ));
        }

        let (sender, receiver) = bounded_queue(capacity, &cancel);
        let failure: FailureSlot = Arc::new(Mutex::new(None));

        let mut queue = Self {
            receiver,
            workers: Vec::with_capacity(producers.len()),
            cancel: cancel.clone(),
            failure: failure.clone(),
        };

        for (id, producer) in producers.into_iter().enumerate() {
            let worker = Worker {
                id,
                producer,
                shape,
                batch_size,
                sender: sender.clone(),
                cancel: cancel.clone(),
            };
            let failure = failure.clone();
            let cancel = cancel.clone();
            // Held until the failure is recorded, so the consumer never sees a
            // disconnect before the reason is available.
            let keepalive = sender.clone();

            let spawned = thread::Builder::new()
                .name(format!("prefetch-{}", id))
                .spawn(move || {
                    let outcome = catch_unwind(AssertUnwindSafe(move || worker.run()));
                    let message = match outcome {
                        Ok(Ok(())) => None,
                        Ok(Err(e)) => Some(format!("worker {} failed: {}", id, e)),
                        Err(panic) => Some(format!(
                            "worker {} panicked: {}",
                            id,
                            panic_message(panic.as_ref())
                        )),
                    };
                    if let Some(message) = message {
                        log::error!("{}", message);
                        record_failure(&failure, message);
                        cancel.cancel();
                    }
                    drop(keepalive);
                });

            match spawned {
                Ok(handle) => queue.workers.push(handle),
                Err(e) => {
                    // Stops and joins the workers spawned so far
                    queue.shutdown();
                    return Err(PoseError::Pipeline(format!(
                        "failed to spawn prefetch worker {}: {}",
                        id, e
                    )));
                }
            }
        }

        log::info!(
            "Prefetch queue started: {} workers, capacity {} batches of {}",
            queue.workers.len(),
            capacity,
            batch_size
        );

        Ok(queue)
    }

    /// Block until a batch is available
    ///
    /// Fails with the recorded worker failure, or a shutdown error, once the
    /// pipeline has been cancelled or every worker has exited.
    pub fn dequeue(&self) -> crate::Result<MiniBatch> {
        match self.receiver.pop() {
            Ok(batch) => Ok(batch),
            Err(QueueError::Cancelled) => Err(self.take_failure().unwrap_or_else(|| {
                PoseError::Pipeline("prefetch queue was shut down".to_string())
            })),
            Err(QueueError::Disconnected) => Err(self.take_failure().unwrap_or_else(|| {
                PoseError::Pipeline("all prefetch workers exited".to_string())
            })),
        }
    }

    /// Batches currently buffered
    pub fn buffered(&self) -> usize {
        self.receiver.len()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Cancel all workers and join them; idempotent
    pub fn shutdown(&mut self) {
        self.cancel.cancel();
        let mut joined = 0;
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                log::warn!("prefetch worker exited abnormally during shutdown");
            }
            joined += 1;
        }
        if joined > 0 {
            log::debug!("Prefetch queue stopped, joined {} workers", joined);
        }
    }

    fn take_failure(&self) -> Option<PoseError> {
        let slot = self
            .failure
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        slot.as_ref().map(|message| PoseError::Pipeline(message.clone()))
    }
}

impl Drop for PrefetchQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct Worker {
    id: usize,
    producer: Box<dyn SampleProducer>,
    shape: SampleShape,
    batch_size: usize,
    sender: BatchSender<MiniBatch>,
    cancel: CancelToken,
}

impl Worker {
    fn run(mut self) -> crate::Result<()> {
        let mut pending: Vec<Sample> = Vec::with_capacity(self.batch_size);
        let mut accepted_this_pass = 0usize;

        while !self.cancel.is_cancelled() {
            match self.producer.next_sample() {
                Some(Ok(sample)) => {
                    if let Err(e) = sample.check_shape(&self.shape) {
                        log::warn!("worker {}: skipping sample: {}", self.id, e);
                        continue;
                    }
                    accepted_this_pass += 1;
                    pending.push(sample);

                    if pending.len() == self.batch_size {
                        let batch = MiniBatch::stack(&pending)?;
                        pending.clear();
                        match self.sender.push(batch) {
                            Ok(()) => {}
                            Err(QueueError::Cancelled) | Err(QueueError::Disconnected) => break,
                        }
                    }
                }
                Some(Err(PoseError::Sample(msg))) => {
                    log::warn!("worker {}: skipping sample: {}", self.id, msg);
                }
                Some(Err(e)) => return Err(e),
                None => {
                    if accepted_this_pass == 0 {
                        return Err(PoseError::Pipeline(format!(
                            "producer {} yielded no usable samples in a full pass",
                            self.id
                        )));
                    }
                    log::debug!(
                        "worker {}: pass complete ({} samples), restarting",
                        self.id,
                        accepted_this_pass
                    );
                    accepted_this_pass = 0;
                    self.producer.reset();
                }
            }
        }

        log::debug!("worker {}: stopping", self.id);
        Ok(())
    }
}

fn record_failure(slot: &FailureSlot, message: String) {
    let mut slot = slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    if slot.is_none() {
        *slot = Some(message);
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
