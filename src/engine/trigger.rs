//! The trigger state machine.
//!
//! A [`TriggerInstance`] owns everything one configured trigger attaches to
//! the page. `run()` always starts by cancelling the previous arming
//! generation, so calling it again (e.g. after a same-page navigation) never
//! leaves two sets of listeners or observers alive.

use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use serde_json::Value;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::debounce::{BoxFuture, DebouncedDispatcher};
use super::firing::{Eligibility, Firing, FiringPipeline, every_automation};
use super::interval::IntervalRunner;
use super::lock;
use super::observers::{Arm, ObserverSet};
use super::report::{ReportGate, ReportKind};
use crate::config::{
    AttachMode, AutomationDef, ReportMode, TargetMode, TriggerDefinition, TriggerKind,
};
use crate::error::TriggerError;
use crate::page::{
    ElementId, EventCallback, ListenerKey, NativeEvent, ObserverHandle, Page, Root,
};
use crate::ports::Services;

/// Visible fraction at which an element counts as having appeared.
pub const APPEAR_THRESHOLD: f64 = 0.2;

static NEXT_LISTENER_KEY: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Uninstalled,
    /// Available on the page, nothing attached yet.
    Installed,
    Armed,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LifecycleState::Uninstalled => "uninstalled",
            LifecycleState::Installed => "installed",
            LifecycleState::Armed => "armed",
        })
    }
}

/// What `run()` attaches, resolved from the definition before anything is touched.
#[derive(Debug)]
enum Plan {
    Load { selector: Option<String> },
    Interval { period: Duration },
    Initialize { selector: Option<String> },
    Appear { selector: String },
    Listen { event: String, selector: Option<String> },
}

pub struct TriggerInstance {
    shared: Arc<TriggerShared>,
}

struct TriggerShared {
    definition: TriggerDefinition,
    key: ListenerKey,
    services: Services,
    pipeline: FiringPipeline,
    observers: ObserverSet,
    /// Built on first install and reused afterwards, so debounce state is shared.
    dispatcher: OnceLock<DebouncedDispatcher<Firing>>,
    handler: OnceLock<EventCallback>,
    installed_events: Mutex<BTreeSet<String>>,
    /// Listener slots (generation, target, event) bound under each arming.
    bound: Arc<Mutex<HashSet<(u64, Root, String)>>>,
    state: Mutex<LifecycleState>,
}

impl TriggerInstance {
    pub fn new(mut definition: TriggerDefinition, services: Services) -> Self {
        let automations = std::mem::take(&mut definition.extensions);
        let pipeline = FiringPipeline::new(
            &definition.id,
            definition.show_errors,
            services.clone(),
            ReportGate::new(definition.effective_report_mode()),
            automations,
        );
        Self {
            shared: Arc::new(TriggerShared {
                definition,
                key: ListenerKey(NEXT_LISTENER_KEY.fetch_add(1, Ordering::Relaxed)),
                services,
                pipeline,
                observers: ObserverSet::new(),
                dispatcher: OnceLock::new(),
                handler: OnceLock::new(),
                installed_events: Mutex::new(BTreeSet::new()),
                bound: Arc::new(Mutex::new(HashSet::new())),
                state: Mutex::new(LifecycleState::Uninstalled),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.shared.definition.id
    }

    pub fn kind(&self) -> Option<&TriggerKind> {
        self.shared.definition.trigger.as_ref()
    }

    pub fn state(&self) -> LifecycleState {
        self.shared.state()
    }

    pub fn report_mode(&self) -> ReportMode {
        self.shared.pipeline.gate().mode()
    }

    /// Whether an outcome of `kind` was ever recorded for `automation_id`.
    pub fn has_reported(&self, kind: ReportKind, automation_id: &str) -> bool {
        self.shared.pipeline.gate().has_seen(kind, automation_id)
    }

    /// Native event names this instance currently listens to.
    pub fn installed_event_names(&self) -> Vec<String> {
        lock(&self.shared.installed_events).iter().cloned().collect()
    }

    /// Add an automation, replacing any with the same id.
    pub fn register_extension(&self, automation: AutomationDef) {
        debug!(target: "pagetrigger::trigger", trigger = %self.id(), automation = %automation.id, "Registering automation");
        self.shared.pipeline.register(automation);
    }

    /// Observers belong to the instance, not to single automations: nothing to do.
    pub fn remove_extensions(&self) {
        trace!(target: "pagetrigger::trigger", trigger = %self.id(), "remove_extensions is a no-op");
    }

    /// Check availability and get ready to run. Returns whether the trigger is available.
    pub async fn install(&self) -> Result<bool, TriggerError> {
        let shared = &self.shared;
        let available = shared
            .services
            .availability
            .is_available()
            .await
            .map_err(|error| TriggerError::Availability { error })?;
        if !available {
            debug!(target: "pagetrigger::trigger", trigger = %self.id(), url = %shared.services.page.url(), "Trigger not available");
            return Ok(false);
        }

        shared.wire();
        {
            let mut state = lock(&shared.state);
            if *state == LifecycleState::Uninstalled {
                *state = LifecycleState::Installed;
            }
        }
        info!(target: "pagetrigger::trigger", trigger = %self.id(), kind = ?shared.definition.trigger, "Trigger installed");
        Ok(true)
    }

    /// (Re)arm the trigger. Safe to call repeatedly.
    pub async fn run(&self) -> Result<(), TriggerError> {
        let shared = &self.shared;
        if shared.state() == LifecycleState::Uninstalled {
            return Err(TriggerError::NotInstalled(self.id().to_string()));
        }

        let arm = shared.observers.cancel_all();
        let plan = match shared.plan() {
            Ok(plan) => plan,
            Err(e) => {
                error!(target: "pagetrigger::trigger", trigger = %self.id(), error = %e, "Cannot arm trigger");
                shared
                    .services
                    .telemetry
                    .report_error(None, &anyhow::Error::msg(e.to_string()));
                shared.transition(LifecycleState::Installed);
                return Err(e);
            }
        };
        if !shared.transition(LifecycleState::Armed) {
            return Err(TriggerError::NotInstalled(self.id().to_string()));
        }
        debug!(target: "pagetrigger::trigger", trigger = %self.id(), generation = arm.generation(), ?plan, "Arming trigger");

        let watch = shared.definition.attach_mode == AttachMode::Watch;
        match plan {
            Plan::Load { selector } => shared.run_load(&arm, selector.as_deref()).await,
            Plan::Interval { period } => shared.arm_interval(&arm, period),
            Plan::Initialize { selector } => {
                shared.run_initialize(&arm, selector.as_deref()).await
            }
            Plan::Appear { selector } => shared.arm_appear(&arm, &selector),
            Plan::Listen { event, selector } => {
                shared.attach_listeners(&arm, &event, selector.as_deref(), watch)
            }
        }
        Ok(())
    }

    /// Detach everything. Synchronous and best effort.
    pub fn uninstall(&self) {
        let shared = &self.shared;
        shared.observers.cancel_all();
        if let Some(dispatcher) = shared.dispatcher.get() {
            dispatcher.cancel_pending();
        }

        let events = std::mem::take(&mut *lock(&shared.installed_events));
        if !events.is_empty() {
            let page = &shared.services.page;
            let mut targets = vec![Root::Document];
            if let Some(selector) = shared.selector() {
                targets.extend(page.query_all(selector).into_iter().map(Root::Element));
            }
            for event in &events {
                for target in &targets {
                    page.remove_listener(*target, event, shared.key);
                }
            }
        }

        *lock(&shared.state) = LifecycleState::Uninstalled;
        info!(target: "pagetrigger::trigger", trigger = %self.id(), "Trigger uninstalled");
    }
}

impl Drop for TriggerInstance {
    fn drop(&mut self) {
        if self.state() != LifecycleState::Uninstalled {
            self.uninstall();
        }
    }
}

impl fmt::Debug for TriggerInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TriggerInstance")
            .field("id", &self.id())
            .field("kind", &self.kind())
            .field("state", &self.state())
            .finish()
    }
}

impl TriggerShared {
    fn state(&self) -> LifecycleState {
        *lock(&self.state)
    }

    /// Move to `next` unless uninstalled meanwhile.
    fn transition(&self, next: LifecycleState) -> bool {
        let mut state = lock(&self.state);
        if *state == LifecycleState::Uninstalled {
            return false;
        }
        *state = next;
        true
    }

    fn selector(&self) -> Option<&str> {
        self.definition
            .root_selector
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    fn plan(&self) -> Result<Plan, TriggerError> {
        let Some(kind) = self
            .definition
            .trigger
            .as_ref()
            .filter(|kind| !kind.as_str().trim().is_empty())
        else {
            return Err(TriggerError::configuration(
                "no trigger kind configured; automations cannot run",
            ));
        };
        let selector = self.selector().map(str::to_string);
        Ok(match kind {
            TriggerKind::Load => Plan::Load { selector },
            TriggerKind::Initialize => Plan::Initialize { selector },
            TriggerKind::Interval => {
                let millis = self
                    .definition
                    .interval_millis
                    .filter(|ms| *ms > 0)
                    .ok_or_else(|| {
                        TriggerError::configuration("interval trigger requires intervalMillis")
                    })?;
                Plan::Interval {
                    period: Duration::from_millis(millis),
                }
            }
            TriggerKind::Appear => Plan::Appear {
                selector: selector.ok_or_else(|| {
                    TriggerError::configuration("appear trigger requires a rootSelector")
                })?,
            },
            TriggerKind::Custom => Plan::Listen {
                event: self
                    .definition
                    .custom_event
                    .clone()
                    .filter(|name| !name.trim().is_empty())
                    .ok_or_else(|| {
                        TriggerError::configuration("custom trigger requires a customEvent")
                    })?,
                selector,
            },
            kind if kind.is_document_scoped() => Plan::Listen {
                event: kind.as_str().to_string(),
                selector: None,
            },
            kind => {
                let name = kind.as_str();
                let selector = selector.ok_or_else(|| {
                    TriggerError::configuration(format!(
                        "'{name}' trigger cannot listen on the whole document; set a rootSelector"
                    ))
                })?;
                Plan::Listen {
                    event: name.to_string(),
                    selector: Some(selector),
                }
            }
        })
    }

    /// Build the dispatcher and the shared event handler once.
    fn wire(self: &Arc<Self>) {
        self.dispatcher.get_or_init(|| {
            let weak = Arc::downgrade(self);
            DebouncedDispatcher::new(self.definition.debounce, move |firing: Firing| -> BoxFuture {
                let weak = weak.clone();
                Box::pin(async move {
                    if let Some(shared) = weak.upgrade() {
                        shared.fire(firing).await;
                    }
                })
            })
        });
        self.handler.get_or_init(|| {
            let weak = Arc::downgrade(self);
            let handler: EventCallback = Arc::new(move |event: &NativeEvent| {
                if let Some(shared) = weak.upgrade() {
                    shared.handle_event(event);
                }
            });
            handler
        });
    }

    async fn fire(&self, firing: Firing) {
        if self.state() == LifecycleState::Uninstalled {
            debug!(target: "pagetrigger::trigger", trigger = %self.definition.id, ?firing, "Dropping firing after uninstall");
            return;
        }
        self.pipeline.run_triggers_and_notify(firing).await;
    }

    async fn dispatch(&self, firing: Firing) {
        match self.dispatcher.get() {
            Some(dispatcher) => dispatcher.dispatch(firing).await,
            None => warn!(target: "pagetrigger::trigger", trigger = %self.definition.id, "Fired before install; ignoring"),
        }
    }

    /// Dispatch from a page callback without blocking it.
    fn spawn_dispatch(self: &Arc<Self>, firing: Firing) {
        match Handle::try_current() {
            Ok(runtime) => {
                let shared = self.clone();
                runtime.spawn(async move { shared.dispatch(firing).await });
            }
            Err(_) => {
                warn!(target: "pagetrigger::trigger", trigger = %self.definition.id, "No async runtime; dropping firing");
            }
        }
    }

    fn handle_event(self: &Arc<Self>, event: &NativeEvent) {
        let Some(kind) = &self.definition.trigger else {
            return;
        };
        let root = self.resolve_root(kind, event);
        trace!(target: "pagetrigger::trigger", trigger = %self.definition.id, event = %event.name, %root, "Native event");
        let firing = Firing::new(vec![root])
            .with_event(event.clone())
            .with_eligibility(eligibility(kind, event));
        self.spawn_dispatch(firing);
    }

    fn resolve_root(&self, kind: &TriggerKind, event: &NativeEvent) -> Root {
        let page = &self.services.page;
        if *kind == TriggerKind::SelectionChange {
            return page.selection_anchor().map_or(Root::Document, Root::Element);
        }
        match self.definition.target_mode {
            TargetMode::EventTarget => event.target,
            TargetMode::Root => event
                .target
                .element()
                .zip(self.selector())
                .and_then(|(element, selector)| page.closest(element, selector))
                .map_or(event.current_target, Root::Element),
        }
    }

    fn current_roots(&self) -> Vec<Root> {
        match self.selector() {
            None => vec![Root::Document],
            Some(selector) => self
                .services
                .page
                .query_all(selector)
                .into_iter()
                .map(Root::Element)
                .collect(),
        }
    }

    /// Wait for `selector` to match, honouring the configured timeout.
    ///
    /// `None` when the wait timed out or a newer arming superseded it.
    async fn wait_for(&self, arm: &Arm, selector: &str) -> Option<Vec<ElementId>> {
        let wait = await_element_once(self.services.page.as_ref(), selector, arm.token());
        let found = match self.definition.wait_timeout_millis {
            Some(ms) => match tokio::time::timeout(Duration::from_millis(ms), wait).await {
                Ok(found) => found,
                Err(_) => {
                    warn!(target: "pagetrigger::trigger", trigger = %self.definition.id, %selector, timeout_ms = ms, "Root selector never matched");
                    None
                }
            },
            None => wait.await,
        };
        if arm.is_stale() {
            debug!(target: "pagetrigger::trigger", trigger = %self.definition.id, generation = arm.generation(), "Discarding stale selector wait");
            return None;
        }
        found
    }

    async fn run_load(self: &Arc<Self>, arm: &Arm, selector: Option<&str>) {
        let roots = match selector {
            None => vec![Root::Document],
            Some(selector) => match self.wait_for(arm, selector).await {
                Some(found) => found.into_iter().map(Root::Element).collect(),
                None => return,
            },
        };
        self.dispatch(Firing::new(roots)).await;
    }

    fn arm_interval(self: &Arc<Self>, arm: &Arm, period: Duration) {
        let mut runner = IntervalRunner::new(period, arm.token().clone());
        if !self.definition.background {
            runner = runner.yield_to_frame(self.services.page.clone());
        }
        let weak = Arc::downgrade(self);
        tokio::spawn(runner.run(move || {
            let weak = weak.clone();
            async move {
                let Some(shared) = weak.upgrade() else {
                    return Ok(());
                };
                let roots = shared.current_roots();
                if roots.is_empty() {
                    trace!(target: "pagetrigger::trigger", trigger = %shared.definition.id, "No roots on this tick");
                    return Ok(());
                }
                shared.dispatch(Firing::new(roots)).await;
                Ok(())
            }
        }));
    }

    async fn run_initialize(self: &Arc<Self>, arm: &Arm, selector: Option<&str>) {
        let Some(selector) = selector else {
            self.dispatch(Firing::new(vec![Root::Document])).await;
            return;
        };

        if self.definition.attach_mode == AttachMode::Once {
            if let Some(found) = self.wait_for(arm, selector).await {
                self.dispatch(Firing::new(found.into_iter().map(Root::Element).collect()))
                    .await;
            }
            return;
        }

        // Watch: observe first, then sweep what is already there. `seen`
        // keeps an element inserted in between from firing twice.
        let seen: Arc<Mutex<HashSet<ElementId>>> = Arc::default();
        let page = &self.services.page;
        let weak = Arc::downgrade(self);
        let watch_arm = arm.clone();
        let watch_seen = seen.clone();
        let handle = page.observe_insertions(
            selector,
            Arc::new(move |element: ElementId| {
                if watch_arm.is_stale() || !lock(&watch_seen).insert(element) {
                    return;
                }
                if let Some(shared) = weak.upgrade() {
                    shared.spawn_dispatch(Firing::new(vec![Root::Element(element)]));
                }
            }),
        );
        self.observers.add_cancel_handler(arm, move || handle.cancel());

        let matches = page.query_all(selector);
        let present: Vec<Root> = {
            let mut seen = lock(&seen);
            matches
                .into_iter()
                .filter(|element| seen.insert(*element))
                .map(Root::Element)
                .collect()
        };
        if !present.is_empty() {
            self.dispatch(Firing::new(present)).await;
        }
    }

    fn arm_appear(self: &Arc<Self>, arm: &Arm, selector: &str) {
        let page = &self.services.page;
        for element in page.query_all(selector) {
            self.observe_appearance(arm, element);
        }
        if self.definition.attach_mode == AttachMode::Watch {
            let weak = Arc::downgrade(self);
            let watch_arm = arm.clone();
            let handle = page.observe_insertions(
                selector,
                Arc::new(move |element: ElementId| {
                    if let Some(shared) = weak.upgrade() {
                        shared.observe_appearance(&watch_arm, element);
                    }
                }),
            );
            self.observers.add_cancel_handler(arm, move || handle.cancel());
        }
    }

    fn observe_appearance(self: &Arc<Self>, arm: &Arm, element: ElementId) {
        if arm.is_stale() {
            return;
        }
        let weak = Arc::downgrade(self);
        let fire_arm = arm.clone();
        let handle = self.services.page.observe_intersection(
            element,
            APPEAR_THRESHOLD,
            Arc::new(move |element: ElementId| {
                if fire_arm.is_stale() {
                    return;
                }
                if let Some(shared) = weak.upgrade() {
                    shared.spawn_dispatch(Firing::new(vec![Root::Element(element)]));
                }
            }),
        );
        self.observers.add_cancel_handler(arm, move || handle.cancel());
    }

    /// Bind the shared handler for `event` on the document or on every
    /// element matching `selector`. With `watch`, each match inserted later
    /// is bound on its own without watching again.
    fn attach_listeners(self: &Arc<Self>, arm: &Arm, event: &str, selector: Option<&str>, watch: bool) {
        if arm.is_stale() {
            return;
        }
        let page = &self.services.page;
        let targets: Vec<Root> = match selector {
            None => vec![Root::Document],
            Some(selector) => page
                .query_all(selector)
                .into_iter()
                .map(Root::Element)
                .collect(),
        };
        for target in &targets {
            self.bind(arm, *target, event);
        }
        lock(&self.installed_events).insert(event.to_string());
        self.unbind_on_cancel(arm);
        debug!(target: "pagetrigger::trigger", trigger = %self.definition.id, %event, targets = targets.len(), watch, "Listeners attached");

        let Some(selector) = selector.filter(|_| watch) else {
            return;
        };
        let weak = Arc::downgrade(self);
        let watch_arm = arm.clone();
        let event_name = event.to_string();
        let watched = selector.to_string();
        let handle = page.observe_insertions(
            selector,
            Arc::new(move |element: ElementId| {
                if let Some(shared) = weak.upgrade() {
                    shared.bind_inserted(&watch_arm, element, &event_name, &watched);
                }
            }),
        );
        self.observers.add_cancel_handler(arm, move || handle.cancel());
    }

    /// Bind a freshly inserted match, forgetting slots of elements that have
    /// left the page since.
    fn bind_inserted(&self, arm: &Arm, element: ElementId, event: &str, selector: &str) {
        if arm.is_stale() {
            return;
        }
        let live: HashSet<ElementId> = self.services.page.query_all(selector).into_iter().collect();
        lock(&self.bound).retain(|(generation, target, _)| {
            *generation != arm.generation() || target.element().is_none_or(|e| live.contains(&e))
        });
        self.bind(arm, Root::Element(element), event);
    }

    /// Detach-then-attach so a target never carries two copies of the handler.
    fn bind(&self, arm: &Arm, target: Root, event: &str) {
        let Some(handler) = self.handler.get() else {
            return;
        };
        let page = &self.services.page;
        page.remove_listener(target, event, self.key);
        page.add_listener(target, event, self.key, handler.clone());
        lock(&self.bound).insert((arm.generation(), target, event.to_string()));
    }

    /// One cancel handler per arming removes every listener bound under it.
    fn unbind_on_cancel(&self, arm: &Arm) {
        let page = self.services.page.clone();
        let bound = self.bound.clone();
        let key = self.key;
        let generation = arm.generation();
        self.observers.add_cancel_handler(arm, move || {
            let slots: Vec<(u64, Root, String)> = {
                let mut bound = lock(&bound);
                let mine = bound
                    .iter()
                    .filter(|slot| slot.0 == generation)
                    .cloned()
                    .collect();
                bound.retain(|slot| slot.0 != generation);
                mine
            };
            for (_, target, event) in slots {
                page.remove_listener(target, &event, key);
            }
        });
    }
}

/// Which automations a native event applies to.
fn eligibility(kind: &TriggerKind, event: &NativeEvent) -> Eligibility {
    if *kind != TriggerKind::StateChange {
        return every_automation();
    }
    let changed = event
        .detail
        .as_ref()
        .and_then(|detail| detail.get("stateKey"))
        .and_then(Value::as_str)
        .map(str::to_string);
    Arc::new(move |automation: &AutomationDef| match &automation.state_key {
        None => true,
        Some(wanted) => changed.as_deref() == Some(wanted.as_str()),
    })
}

/// Resolve once `selector` matches, with every current match.
///
/// `None` when `token` is cancelled first.
async fn await_element_once(
    page: &dyn Page,
    selector: &str,
    token: &CancellationToken,
) -> Option<Vec<ElementId>> {
    let present = page.query_all(selector);
    if !present.is_empty() {
        return Some(present);
    }

    let inserted = Arc::new(Notify::new());
    let notify = inserted.clone();
    // Disconnects on every exit, including when a timeout drops this future.
    let _observer = DisconnectOnDrop(Some(page.observe_insertions(
        selector,
        Arc::new(move |_: ElementId| notify.notify_one()),
    )));

    loop {
        let matches = page.query_all(selector);
        if !matches.is_empty() {
            return Some(matches);
        }
        tokio::select! {
            biased;
            _ = token.cancelled() => return None,
            _ = inserted.notified() => {}
        }
    }
}

struct DisconnectOnDrop(Option<ObserverHandle>);

impl Drop for DisconnectOnDrop {
    fn drop(&mut self) {
        if let Some(handle) = self.0.take() {
            handle.cancel();
        }
    }
}
