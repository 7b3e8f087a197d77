//! Wake-up signal shared by every waiter on one buffer.
//!
//! Interrupts are level-triggered: once asserted, every wait (current and
//! future) returns `Interrupted` until the interrupt is cleared. An abort is
//! permanent for the buffer.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use arc_swap::ArcSwapOption;
use tokio::{sync::Notify, time::Instant};

use crate::error::{MeshError, MeshResult};

#[derive(Debug, Default)]
pub struct WaitSignal {
    notify: Notify,
    interrupted: AtomicBool,
    aborted: ArcSwapOption<String>,
}

impl WaitSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wakes all current waiters so they re-check their condition.
    pub fn notify(&self) {
        self.notify.notify_waiters();
    }

    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    pub fn clear_interrupt(&self) {
        self.interrupted.store(false, Ordering::Release);
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::Acquire)
    }

    /// Returns false if the buffer was already aborted; the first reason sticks.
    pub fn abort(&self, reason: impl Into<String>) -> bool {
        let previous = self
            .aborted
            .compare_and_swap(&None::<Arc<String>>, Some(Arc::new(reason.into())));
        let first = previous.is_none();
        self.notify.notify_waiters();
        first
    }

    pub fn abort_reason(&self) -> Option<Arc<String>> {
        self.aborted.load_full()
    }

    /// Fails when the buffer is aborted or interrupted.
    pub fn check(&self) -> MeshResult<()> {
        if let Some(reason) = self.aborted.load_full() {
            return Err(MeshError::BufferAborted(reason.to_string()));
        }
        if self.is_interrupted() {
            return Err(MeshError::Interrupted);
        }
        Ok(())
    }

    /// Waits until `ready` returns true, re-checking on every notification.
    pub async fn wait_until<F>(&self, what: &'static str, timeout: Duration, mut ready: F) -> MeshResult<()>
    where
        F: FnMut() -> MeshResult<bool>,
    {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a notification between the check
            // and the await is not lost.
            notified.as_mut().enable();

            self.check()?;
            if ready()? {
                return Ok(());
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                self.check()?;
                if ready()? {
                    return Ok(());
                }
                return Err(MeshError::Timeout {
                    what,
                    after: timeout,
                });
            }
        }
    }
}
