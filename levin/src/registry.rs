//! Per-connection invocation registry: tracks outstanding `invoke` calls and
//! matches them to responses. Levin carries no request id, so correlation is
//! purely FIFO — the next response on the wire always answers the oldest
//! still-outstanding call.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{oneshot, Notify};
use tokio::time::Instant;

use crate::error::{LevinError, LevinResult};

/// Bytes of partial-response progress needed before an in-flight call's
/// timer is pushed back out. Keeps a slow-but-alive transfer from timing
/// out while giving up quickly on a genuinely stalled peer.
const MIN_BYTES_WANTED_FOR_RESET: usize = 512;

struct Shared {
    responder: Mutex<Option<oneshot::Sender<LevinResult<Vec<u8>>>>>,
    settled: AtomicBool,
    bytes_since_reset: AtomicUsize,
    kick: Notify,
}

impl Shared {
    /// The sole arbiter of who gets to deliver the result: whichever of
    /// "response arrived" / "timer fired" / "connection torn down" wins
    /// this compare-exchange is the only one that ever calls the sender,
    /// giving an exactly-once guarantee without the original's timer
    /// cancellation-count bookkeeping.
    fn settle(&self, result: LevinResult<Vec<u8>>) -> bool {
        if self.settled.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst).is_ok() {
            if let Some(tx) = self.responder.lock().take() {
                let _ = tx.send(result);
            }
            true
        } else {
            false
        }
    }

    fn note_progress(&self, bytes: usize) {
        let total = self.bytes_since_reset.fetch_add(bytes, Ordering::Relaxed) + bytes;
        if total >= MIN_BYTES_WANTED_FOR_RESET {
            self.bytes_since_reset.store(0, Ordering::Relaxed);
            self.kick.notify_one();
        }
    }
}

struct PendingCall {
    command: u32,
    shared: Arc<Shared>,
}

/// FIFO queue of response handlers awaiting their matching frame, one
/// instance per connection.
#[derive(Default)]
pub struct InvocationRegistry {
    queue: Mutex<VecDeque<PendingCall>>,
    /// Set once by [`Self::cancel_all`]; rejects further [`Self::register`]
    /// calls instead of letting them queue behind a teardown that has
    /// already happened (spec.md §4.3 `add()`: "fails with 'protocol
    /// released' if the connection is tearing down").
    released: AtomicBool,
}

impl InvocationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new outstanding call, spawns its timeout timer on the
    /// current tokio runtime, and returns a receiver that resolves with the
    /// response payload, a timeout error, or a teardown error — whichever
    /// happens first. Fails immediately with [`LevinError::ConnectionDestroyed`]
    /// if the connection has already been released.
    ///
    /// `on_timeout` runs exactly once, only along the timer-fired path —
    /// never on a real response or a teardown — and only if this call's
    /// timer actually wins the settle race. Callers use it to close the
    /// owning connection, mirroring the reference timer callback's
    /// `cb(LEVIN_ERROR_CONNECTION_TIMEDOUT, ...); con->close();` pair.
    pub fn register<F>(
        &self,
        command: u32,
        timeout: Duration,
        on_timeout: F,
    ) -> LevinResult<oneshot::Receiver<LevinResult<Vec<u8>>>>
    where
        F: FnOnce() + Send + 'static,
    {
        // Checking `released` and pushing the new record happen under the
        // same queue lock `cancel_all` swaps out under, so a release that
        // races a registration either fully precedes it (seen here as
        // `released == true`) or fully follows it (the new record is still
        // in the queue when `cancel_all` drains it) — never both missed.
        let mut queue = self.queue.lock();
        if self.released.load(Ordering::SeqCst) {
            return Err(LevinError::ConnectionDestroyed);
        }

        let (tx, rx) = oneshot::channel();
        let shared = Arc::new(Shared {
            responder: Mutex::new(Some(tx)),
            settled: AtomicBool::new(false),
            bytes_since_reset: AtomicUsize::new(0),
            kick: Notify::new(),
        });

        let timer_shared = shared.clone();
        tokio::spawn(async move {
            let mut deadline = Instant::now() + timeout;
            loop {
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => {
                        if timer_shared.settle(Err(LevinError::Timeout)) {
                            on_timeout();
                        }
                        break;
                    }
                    _ = timer_shared.kick.notified() => {
                        deadline = Instant::now() + timeout;
                    }
                }
                if timer_shared.settled.load(Ordering::SeqCst) {
                    break;
                }
            }
        });

        queue.push_back(PendingCall { command, shared });
        Ok(rx)
    }

    /// Delivers a result to the oldest outstanding call — `Ok` for a
    /// successful response payload, `Err` when the peer's return code
    /// signalled a failure. Errors if nothing is outstanding to match
    /// against, which is a protocol violation by the peer, not a local bug.
    pub fn deliver(&self, result: LevinResult<Vec<u8>>) -> LevinResult<()> {
        let call = self.queue.lock().pop_front();
        match call {
            Some(call) => {
                if !call.shared.settle(result) {
                    log::debug!("discarding late response for command {} that already timed out", call.command);
                }
                Ok(())
            }
            None => Err(LevinError::Registry("received a response with no outstanding invocation".into())),
        }
    }

    /// Convenience wrapper over [`Self::deliver`] for the common successful
    /// case.
    pub fn deliver_response(&self, payload: Vec<u8>) -> LevinResult<()> {
        self.deliver(Ok(payload))
    }

    /// Reports that `bytes` more of the current in-flight response frame
    /// have arrived, resetting the oldest call's timeout once enough
    /// progress has accumulated.
    pub fn note_progress(&self, bytes: usize) {
        if let Some(call) = self.queue.lock().front() {
            call.shared.note_progress(bytes);
        }
    }

    pub fn outstanding(&self) -> usize {
        self.queue.lock().len()
    }

    /// Cancels every outstanding call with a connection-closed error.
    ///
    /// Drains the queue under the lock, then releases it before settling
    /// any call, so that settling one (which may wake another task) never
    /// happens while this registry's own mutex is held — the swap-and-cancel
    /// pattern that keeps teardown deadlock-free.
    pub fn cancel_all(&self) {
        let drained: VecDeque<PendingCall> = {
            let mut queue = self.queue.lock();
            self.released.store(true, Ordering::SeqCst);
            std::mem::take(&mut *queue)
        };
        for call in drained {
            call.shared.settle(Err(LevinError::ConnectionDestroyed));
        }
    }
}
