/*!
Trigger lifecycle engine.

- [`TriggerInstance`]: install / run / uninstall state machine per trigger
- [`FiringPipeline`]: read context, run eligible automations, aggregate failures
- [`ReportGate`]: once/all dedup of telemetry per automation
- [`IntervalRunner`]: self-correcting cancellable schedule
- [`ObserverSet`]: generation-scoped cleanup of listeners and observers
- [`Debouncer`] / [`DebouncedDispatcher`]: leading/trailing coalescing of firings
*/

use std::sync::{
    Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard,
};

pub mod debounce;
pub mod firing;
pub mod interval;
pub mod observers;
pub mod report;
pub mod trigger;

#[cfg(test)]
pub(crate) mod testing;

pub use debounce::{DebouncedDispatcher, Debouncer};
pub use firing::{Eligibility, Firing, FiringPipeline, FiringReport};
pub use interval::IntervalRunner;
pub use observers::{Arm, ObserverSet};
pub use report::{ReportGate, ReportKind};
pub use trigger::{APPEAR_THRESHOLD, LifecycleState, TriggerInstance};

/// Lock ignoring poisoning: the guarded sets stay consistent across a panic.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}
