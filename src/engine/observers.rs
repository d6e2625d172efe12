//! Generation-scoped cancellation of everything a trigger armed.
//!
//! Each `run()` works against one [`Arm`]: a generation number plus a
//! cancellation token. Listeners and observers register a cancel handler for
//! the generation they were created in. `cancel_all()` cancels the token, runs
//! every handler of the current generation and opens the next one. A handler
//! registered for a generation that is already gone runs immediately, so a
//! late attach from a stale wait can never leak.

use std::sync::{Mutex, MutexGuard};

use tokio_util::sync::CancellationToken;
use tracing::trace;

type CancelHandler = Box<dyn FnOnce() + Send>;

/// Handle on one arming generation.
#[derive(Debug, Clone)]
pub struct Arm {
    generation: u64,
    token: CancellationToken,
}

impl Arm {
    fn new(generation: u64) -> Self {
        Self {
            generation,
            token: CancellationToken::new(),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Whether a later `cancel_all()` superseded this generation.
    pub fn is_stale(&self) -> bool {
        self.token.is_cancelled()
    }
}

struct Generation {
    arm: Arm,
    handlers: Vec<CancelHandler>,
}

pub struct ObserverSet {
    current: Mutex<Generation>,
}

impl Default for ObserverSet {
    fn default() -> Self {
        Self::new()
    }
}

impl ObserverSet {
    pub fn new() -> Self {
        Self {
            current: Mutex::new(Generation {
                arm: Arm::new(0),
                handlers: Vec::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Generation> {
        super::lock(&self.current)
    }

    /// The generation new attachments belong to.
    pub fn current(&self) -> Arm {
        self.lock().arm.clone()
    }

    /// Tear down the current generation and return the next one.
    pub fn cancel_all(&self) -> Arm {
        let (stale, handlers, fresh) = {
            let mut current = self.lock();
            let fresh = Arm::new(current.arm.generation + 1);
            let stale = std::mem::replace(&mut current.arm, fresh.clone());
            let handlers = std::mem::take(&mut current.handlers);
            (stale, handlers, fresh)
        };
        stale.token.cancel();
        let count = handlers.len();
        // Handlers touch the page; run them without our lock held.
        for handler in handlers {
            handler();
        }
        trace!(target: "pagetrigger::observers", generation = stale.generation, handlers = count, "Cancelled generation");
        fresh
    }

    /// Register `handler` to run when `arm`'s generation is cancelled.
    pub fn add_cancel_handler(&self, arm: &Arm, handler: impl FnOnce() + Send + 'static) {
        {
            let mut current = self.lock();
            if current.arm.generation == arm.generation {
                current.handlers.push(Box::new(handler));
                return;
            }
        }
        trace!(target: "pagetrigger::observers", generation = arm.generation, "Late registration for stale generation");
        handler();
    }

    /// Handlers waiting on the current generation.
    pub fn pending(&self) -> usize {
        self.lock().handlers.len()
    }
}
