//! Leading/trailing debounce for trigger dispatch.
//!
//! Semantics follow the usual `debounce(fn, wait, {leading, trailing})`:
//! - the first call of a quiet period opens a window of `wait`;
//!   with `leading` it is invoked right away
//! - every call inside the window pushes its end back by `wait`
//! - when the window closes, the latest arguments are invoked if `trailing`
//!   and at least one call was not already consumed by the leading edge
//!
//! Invocations run on spawned tasks, so `call` never blocks the caller.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::{Instant, sleep_until};
use tracing::trace;

use super::lock;
use crate::config::DebounceOptions;

pub type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

type Invoke<A> = Arc<dyn Fn(A) -> BoxFuture + Send + Sync>;

struct Window<A> {
    deadline: Option<Instant>,
    pending: Option<A>,
    /// Bumped on cancel so an in-flight timer knows it is orphaned.
    epoch: u64,
}

pub struct Debouncer<A> {
    wait: Duration,
    leading: bool,
    trailing: bool,
    invoke: Invoke<A>,
    window: Arc<Mutex<Window<A>>>,
}

impl<A: Send + 'static> Debouncer<A> {
    pub fn new(
        options: DebounceOptions,
        invoke: impl Fn(A) -> BoxFuture + Send + Sync + 'static,
    ) -> Self {
        Self::with_invoke(options, Arc::new(invoke))
    }

    fn with_invoke(options: DebounceOptions, invoke: Invoke<A>) -> Self {
        Self {
            wait: Duration::from_millis(options.wait_millis),
            leading: options.leading,
            trailing: options.trailing,
            invoke,
            window: Arc::new(Mutex::new(Window {
                deadline: None,
                pending: None,
                epoch: 0,
            })),
        }
    }

    pub fn call(&self, args: A) {
        let (leading, open_timer) = {
            let mut window = lock(&self.window);
            let opening = window.deadline.is_none();
            window.deadline = Some(Instant::now() + self.wait);
            if opening && self.leading {
                (Some(args), Some(window.epoch))
            } else {
                if self.trailing {
                    window.pending = Some(args);
                }
                (None, opening.then_some(window.epoch))
            }
        };

        if let Some(args) = leading {
            trace!(target: "pagetrigger::debounce", "Leading edge");
            tokio::spawn((self.invoke)(args));
        }
        if let Some(epoch) = open_timer {
            tokio::spawn(Self::close_window(
                self.window.clone(),
                self.invoke.clone(),
                epoch,
            ));
        }
    }

    /// Drop any pending trailing call and close the window.
    pub fn cancel(&self) {
        let mut window = lock(&self.window);
        window.deadline = None;
        window.pending = None;
        window.epoch += 1;
    }

    async fn close_window(window: Arc<Mutex<Window<A>>>, invoke: Invoke<A>, epoch: u64) {
        loop {
            let deadline = {
                let w = lock(&window);
                match w.deadline {
                    Some(deadline) if w.epoch == epoch => deadline,
                    _ => return,
                }
            };
            sleep_until(deadline).await;

            let pending = {
                let mut w = lock(&window);
                if w.epoch != epoch {
                    return;
                }
                if w.deadline.is_some_and(|d| d > Instant::now()) {
                    // Extended while we slept.
                    None
                } else {
                    w.deadline = None;
                    Some(w.pending.take())
                }
            };

            match pending {
                None => continue,
                Some(Some(args)) => {
                    trace!(target: "pagetrigger::debounce", "Trailing edge");
                    invoke(args).await;
                    return;
                }
                Some(None) => return,
            }
        }
    }
}

/// Routes dispatches either straight through (awaited) or via a [`Debouncer`].
pub struct DebouncedDispatcher<A> {
    run: Invoke<A>,
    debouncer: Option<Debouncer<A>>,
}

impl<A: Send + 'static> DebouncedDispatcher<A> {
    pub fn new(
        options: Option<DebounceOptions>,
        run: impl Fn(A) -> BoxFuture + Send + Sync + 'static,
    ) -> Self {
        let run: Invoke<A> = Arc::new(run);
        Self {
            debouncer: options.map(|options| Debouncer::with_invoke(options, run.clone())),
            run,
        }
    }

    pub fn is_debounced(&self) -> bool {
        self.debouncer.is_some()
    }

    /// Dispatch `args`. Without debouncing this awaits the run itself.
    pub async fn dispatch(&self, args: A) {
        match &self.debouncer {
            Some(debouncer) => debouncer.call(args),
            None => (self.run)(args).await,
        }
    }

    pub fn cancel_pending(&self) {
        if let Some(debouncer) = &self.debouncer {
            debouncer.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::sleep;

    fn recording() -> (
        Arc<Mutex<Vec<u32>>>,
        impl Fn(u32) -> BoxFuture + Send + Sync + 'static,
    ) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        let invoke = move |n: u32| -> BoxFuture {
            let s = s.clone();
            Box::pin(async move { s.lock().unwrap().push(n) })
        };
        (seen, invoke)
    }

    fn options(wait_millis: u64, leading: bool, trailing: bool) -> DebounceOptions {
        DebounceOptions {
            wait_millis,
            leading,
            trailing,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_trailing_uses_latest_arguments() {
        let (seen, invoke) = recording();
        let debouncer = Debouncer::new(options(100, false, true), invoke);
        for n in 1..=5 {
            debouncer.call(n);
            sleep(Duration::from_millis(20)).await;
        }
        assert!(seen.lock().unwrap().is_empty());
        sleep(Duration::from_millis(200)).await;
        assert_eq!(*seen.lock().unwrap(), vec![5]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_extends_on_each_call() {
        let (seen, invoke) = recording();
        let debouncer = Debouncer::new(options(100, false, true), invoke);
        debouncer.call(1);
        sleep(Duration::from_millis(90)).await;
        debouncer.call(2);
        sleep(Duration::from_millis(90)).await;
        // 180ms after the first call, but only 90ms after the last one.
        assert!(seen.lock().unwrap().is_empty());
        sleep(Duration::from_millis(20)).await;
        assert_eq!(*seen.lock().unwrap(), vec![2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_leading_only() {
        let (seen, invoke) = recording();
        let debouncer = Debouncer::new(options(100, true, false), invoke);
        debouncer.call(1);
        debouncer.call(2);
        debouncer.call(3);
        sleep(Duration::from_millis(150)).await;
        assert_eq!(*seen.lock().unwrap(), vec![1]);

        debouncer.call(4);
        sleep(Duration::from_millis(1)).await;
        assert_eq!(*seen.lock().unwrap(), vec![1, 4]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_leading_and_trailing() {
        let (seen, invoke) = recording();
        let debouncer = Debouncer::new(options(100, true, true), invoke);
        debouncer.call(1);
        sleep(Duration::from_millis(150)).await;
        // A lone call is only invoked on the leading edge.
        assert_eq!(*seen.lock().unwrap(), vec![1]);

        debouncer.call(2);
        debouncer.call(3);
        sleep(Duration::from_millis(150)).await;
        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_drops_pending_call() {
        let (seen, invoke) = recording();
        let debouncer = Debouncer::new(options(100, false, true), invoke);
        debouncer.call(1);
        debouncer.cancel();
        sleep(Duration::from_millis(200)).await;
        assert!(seen.lock().unwrap().is_empty());

        debouncer.call(2);
        sleep(Duration::from_millis(200)).await;
        assert_eq!(*seen.lock().unwrap(), vec![2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatcher_without_debounce_awaits_run() {
        let (seen, invoke) = recording();
        let dispatcher = DebouncedDispatcher::new(None, invoke);
        assert!(!dispatcher.is_debounced());
        dispatcher.dispatch(7).await;
        assert_eq!(*seen.lock().unwrap(), vec![7]);
    }
}
