//! # Cancellation
//!
//! One token is shared by the dialer, every driver, and the writer. The
//! first `cancel` call records its cause and wakes everything blocked on
//! the token; later calls are no-ops. Built on a crossbeam channel that is
//! never sent on: dropping the sole sender disconnects every receiver
//! clone, which `select!` observes as a ready `recv` arm.

use std::sync::{Arc, Mutex};

use crossbeam_channel::{bounded, Receiver, Sender, TryRecvError};

#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

struct Inner {
    // Taken and dropped by the winning cancel call.
    sender: Mutex<Option<Sender<()>>>,
    receiver: Receiver<()>,
    cause: Mutex<Option<String>>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (sender, receiver) = bounded::<()>(0);

        CancelToken {
            inner: Arc::new(Inner {
                sender: Mutex::new(Some(sender)),
                receiver,
                cause: Mutex::new(None),
            }),
        }
    }

    /// Cancel with a cause. Idempotent: only the first call's cause is
    /// kept, and the token wakes its observers exactly once.
    pub fn cancel(&self, cause: &str) {
        // Whoever takes the sender wins and records the cause; the sender
        // drops at the end of this call, after the cause is visible.
        let sender = self.inner.sender.lock().unwrap().take();
        if sender.is_some() {
            *self.inner.cause.lock().unwrap() = Some(cause.to_string());
        }
    }

    /// Channel to watch from `select!`; it becomes ready (disconnected)
    /// once the token is cancelled.
    pub fn done(&self) -> &Receiver<()> {
        &self.inner.receiver
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(
            self.inner.receiver.try_recv(),
            Err(TryRecvError::Disconnected)
        )
    }

    /// The first cancel call's cause, once cancelled.
    pub fn cause(&self) -> Option<String> {
        self.inner.cause.lock().unwrap().clone()
    }
}
