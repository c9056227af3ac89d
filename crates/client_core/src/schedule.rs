use std::{future::Future, time::Duration};

use tokio::task::JoinHandle;

/// Identifies one issued request; only the newest token may commit state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SequenceToken(pub u64);

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Sequence {
    current: u64,
}

impl Sequence {
    /// Issues a new token, making every earlier one stale.
    pub fn advance(&mut self) -> SequenceToken {
        self.current += 1;
        SequenceToken(self.current)
    }

    pub fn current(&self) -> SequenceToken {
        SequenceToken(self.current)
    }

    pub fn is_current(&self, token: SequenceToken) -> bool {
        self.current == token.0
    }
}

/// Holds at most one spawned task. Replacing, cancelling or dropping the slot
/// aborts whatever it held.
#[derive(Debug, Default)]
pub struct TaskSlot {
    handle: Option<JoinHandle<()>>,
}

impl TaskSlot {
    pub fn replace(&mut self, handle: JoinHandle<()>) {
        if let Some(previous) = self.handle.replace(handle) {
            previous.abort();
        }
    }

    /// Returns true if a still-running task was aborted.
    pub fn cancel(&mut self) -> bool {
        match self.handle.take() {
            Some(handle) => {
                let active = !handle.is_finished();
                handle.abort();
                active
            }
            None => false,
        }
    }

    pub fn is_active(&self) -> bool {
        self.handle
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }
}

impl Drop for TaskSlot {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// One-shot timer. Starting it again before it fires replaces the pending
/// action, which is what debouncing needs.
#[derive(Debug, Default)]
pub struct DelayTimer {
    slot: TaskSlot,
}

impl DelayTimer {
    pub fn start<F>(&mut self, delay: Duration, action: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.slot.replace(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            action.await;
        }));
    }

    pub fn cancel(&mut self) -> bool {
        self.slot.cancel()
    }

    pub fn is_pending(&self) -> bool {
        self.slot.is_active()
    }
}
