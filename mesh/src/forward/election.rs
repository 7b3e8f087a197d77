//! Single-owner election.
//!
//! N cooperating tasks share one armed flag; the first to claim it disarms it
//! for everyone and becomes the sole doer. Re-arming starts a new round.

use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug)]
pub struct Election {
    armed: AtomicBool,
}

impl Default for Election {
    fn default() -> Self {
        Self::new()
    }
}

impl Election {
    pub const fn new() -> Self {
        Self {
            armed: AtomicBool::new(true),
        }
    }

    /// True for exactly one caller per round.
    pub fn claim(&self) -> bool {
        self.armed
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn rearm(&self) {
        self.armed.store(true, Ordering::Release);
    }

    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::Acquire)
    }
}
