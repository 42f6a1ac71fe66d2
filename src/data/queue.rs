/// Bounded hand-off between prefetch workers and the training thread
///
/// Producers block on a full queue and the consumer blocks on an empty one.
/// Both waits also watch a `CancelToken`, so cancelling wakes every blocked
/// party with `QueueError::Cancelled` instead of leaving it hanging.
use crossbeam_channel::{bounded, select, Receiver, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("queue cancelled")]
    Cancelled,
    #[error("queue disconnected")]
    Disconnected,
}

struct CancelInner {
    flag: AtomicBool,
    // Dropping the sender disconnects `watch` for every clone at once.
    trigger: Mutex<Option<Sender<()>>>,
    watch: Receiver<()>,
}

/// Cooperative cancellation flag shared by the coordinator and all workers
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (trigger, watch) = bounded(0);
        Self {
            inner: Arc::new(CancelInner {
                flag: AtomicBool::new(false),
                trigger: Mutex::new(Some(trigger)),
                watch,
            }),
        }
    }

    /// Signal cancellation; idempotent
    pub fn cancel(&self) {
        self.inner.flag.store(true, Ordering::SeqCst);
        let mut trigger = self
            .inner
            .trigger
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        trigger.take();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.flag.load(Ordering::SeqCst)
    }

    /// Channel that becomes ready (disconnected) once cancelled
    fn watch(&self) -> &Receiver<()> {
        &self.inner.watch
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Create a queue holding at most `capacity` items
pub fn bounded_queue<T>(capacity: usize, cancel: &CancelToken) -> (BatchSender<T>, BatchReceiver<T>) {
    let (tx, rx) = bounded(capacity);
    (
        BatchSender {
            tx,
            cancel: cancel.clone(),
        },
        BatchReceiver {
            rx,
            cancel: cancel.clone(),
        },
    )
}

/// Producer side; one clone per worker
pub struct BatchSender<T> {
    tx: Sender<T>,
    cancel: CancelToken,
}

impl<T> Clone for BatchSender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            cancel: self.cancel.clone(),
        }
    }
}

impl<T> BatchSender<T> {
    /// Push an item, blocking while the queue is full
    pub fn push(&self, item: T) -> Result<(), QueueError> {
        if self.cancel.is_cancelled() {
            return Err(QueueError::Cancelled);
        }
        select! {
            send(self.tx, item) -> res => res.map_err(|_| QueueError::Disconnected),
            recv(self.cancel.watch()) -> _ => Err(QueueError::Cancelled),
        }
    }
}

/// Consumer side, owned by the training thread
pub struct BatchReceiver<T> {
    rx: Receiver<T>,
    cancel: CancelToken,
}

impl<T> BatchReceiver<T> {
    /// Pop an item, blocking while the queue is empty
    pub fn pop(&self) -> Result<T, QueueError> {
        if self.cancel.is_cancelled() {
            return Err(QueueError::Cancelled);
        }
        select! {
            recv(self.rx) -> msg => msg.map_err(|_| QueueError::Disconnected),
            recv(self.cancel.watch()) -> _ => Err(QueueError::Cancelled),
        }
    }

    /// Items currently buffered
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn capacity(&self) -> Option<usize> {
        self.rx.capacity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;
    use std::time::{Duration, Instant};

    fn wait_until(deadline: Duration, cond: impl Fn() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        cond()
    }

    #[test]
    fn test_fifo_from_single_producer() {
        let token = CancelToken::new();
        let (tx, rx) = bounded_queue(4, &token);

        for i in 0..4 {
            tx.push(i).unwrap();
        }

        let popped: Vec<i32> = (0..4).map(|_| rx.pop().unwrap()).collect();
        assert_eq!(popped, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_full_queue_blocks_producer() {
        let token = CancelToken::new();
        let (tx, rx) = bounded_queue(2, &token);
        let pushed = Arc::new(AtomicUsize::new(0));

        let counter = pushed.clone();
        let handle = thread::spawn(move || {
            for i in 0..3 {
                tx.push(i).unwrap();
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        assert!(wait_until(Duration::from_secs(2), || pushed.load(Ordering::SeqCst) == 2));
        thread::sleep(Duration::from_millis(100));
        assert_eq!(pushed.load(Ordering::SeqCst), 2, "third push must block");

        assert_eq!(rx.pop().unwrap(), 0);
        assert!(wait_until(Duration::from_secs(2), || pushed.load(Ordering::SeqCst) == 3));
        handle.join().unwrap();
        assert_eq!(rx.len(), 2);
    }

    #[test]
    fn test_pop_unblocks_exactly_one_push() {
        let token = CancelToken::new();
        let (tx, rx) = bounded_queue(1, &token);
        tx.push(0).unwrap();

        let done = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for i in 1..=2 {
            let tx = tx.clone();
            let done = done.clone();
            handles.push(thread::spawn(move || {
                if tx.push(i).is_ok() {
                    done.fetch_add(1, Ordering::SeqCst);
                }
            }));
        }

        thread::sleep(Duration::from_millis(100));
        assert_eq!(done.load(Ordering::SeqCst), 0);

        rx.pop().unwrap();
        assert!(wait_until(Duration::from_secs(2), || done.load(Ordering::SeqCst) == 1));
        thread::sleep(Duration::from_millis(100));
        assert_eq!(done.load(Ordering::SeqCst), 1);

        // Release the remaining pusher
        rx.pop().unwrap();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(done.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_cancel_releases_blocked_producer() {
        let token = CancelToken::new();
        let (tx, _rx) = bounded_queue(1, &token);
        tx.push(0u8).unwrap();

        let handle = thread::spawn(move || tx.push(1));
        thread::sleep(Duration::from_millis(50));

        let start = Instant::now();
        token.cancel();
        let result = handle.join().unwrap();

        assert_eq!(result, Err(QueueError::Cancelled));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_cancel_releases_blocked_consumer() {
        let token = CancelToken::new();
        let (_tx, rx) = bounded_queue::<u8>(1, &token);

        let waiter = token.clone();
        let handle = thread::spawn(move || rx.pop());
        thread::sleep(Duration::from_millis(50));
        waiter.cancel();

        assert_eq!(handle.join().unwrap(), Err(QueueError::Cancelled));
    }

    #[test]
    fn test_dropped_producers_disconnect() {
        let token = CancelToken::new();
        let (tx, rx) = bounded_queue::<u8>(1, &token);
        drop(tx);

        assert_eq!(rx.pop(), Err(QueueError::Disconnected));
        assert!(!token.is_cancelled());
    }
}
