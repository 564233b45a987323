//! Components: the unit of scheduling, owning interfaces, mailboxes and a
//! state table.
//!
//! User logic lives in a [`Task`]. Periodic and continuous components run it
//! on their own thread (see [`crate::scheduling::executor`]); passive
//! components have no thread and all their commands execute in the caller's
//! thread.

use crate::communication::interface::{
    InterfaceDescription, ProvidedInterface, RequiredDescription, RequiredInterface,
};
use crate::communication::mailbox::{Doorbell, Mailbox, DEFAULT_MAILBOX_CAPACITY};
use crate::core::state::{ComponentState, StateCell};
use crate::core::state_table::{StateTable, DEFAULT_STATE_TABLE_CAPACITY};
use crate::error::{MtaskError, MtaskResult};
use crate::manager::context::Context;
use crate::scheduling::executor;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// User logic of a component
pub trait Task: Send {
    /// Called once, on the component thread, before the component becomes Ready.
    /// An error ends the component in Finished with its failure flag set.
    fn startup(&mut self, _ctx: &mut TaskContext) -> MtaskResult<()> {
        Ok(())
    }

    /// One cycle of work while Active. Not called for passive components.
    fn run(&mut self, ctx: &mut TaskContext);

    /// Called once before the component becomes Finished.
    fn cleanup(&mut self, _ctx: &mut TaskContext) {}
}

/// How a component is scheduled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ComponentKind {
    /// No thread; commands always run in the caller's thread
    Passive,
    /// Own thread, one cycle per period
    Periodic(Duration),
    /// Own thread, cycles back to back
    Continuous,
}

impl ComponentKind {
    pub fn has_thread(&self) -> bool {
        !matches!(self, ComponentKind::Passive)
    }

    pub fn period(&self) -> Option<Duration> {
        match self {
            ComponentKind::Periodic(period) => Some(*period),
            _ => None,
        }
    }
}

impl fmt::Display for ComponentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ComponentKind::Passive => write!(f, "passive"),
            ComponentKind::Periodic(period) => write!(f, "periodic({:?})", period),
            ComponentKind::Continuous => write!(f, "continuous"),
        }
    }
}

/// Queue and history sizes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ComponentOptions {
    pub mailbox_capacity: usize,
    pub state_table_capacity: usize,
}

impl Default for ComponentOptions {
    fn default() -> Self {
        Self {
            mailbox_capacity: DEFAULT_MAILBOX_CAPACITY,
            state_table_capacity: DEFAULT_STATE_TABLE_CAPACITY,
        }
    }
}

/// Serializable summary of a component, as registered with a global manager
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentDescription {
    pub name: String,
    pub kind: ComponentKind,
    pub provided: Vec<InterfaceDescription>,
    pub required: Vec<RequiredDescription>,
}

/// State shared by the component handle and its thread.
pub(crate) struct ComponentShared {
    pub(crate) name: String,
    pub(crate) kind: ComponentKind,
    pub(crate) state: StateCell,
    pub(crate) doorbell: Arc<Doorbell>,
    pub(crate) commands: Option<Mailbox>,
    pub(crate) events: Option<Mailbox>,
    pub(crate) state_table: Arc<StateTable>,
    pub(crate) cycles: AtomicU64,
    pub(crate) overruns: AtomicU64,
    pub(crate) context: RwLock<Option<Context>>,
}

impl ComponentShared {
    pub(crate) fn mailboxes(&self) -> impl Iterator<Item = &Mailbox> {
        self.commands.iter().chain(self.events.iter())
    }

    /// Run every pending command, event and completion
    pub(crate) fn drain_mailboxes(&self) -> usize {
        self.mailboxes().map(|m| m.drain_all()).sum()
    }

    pub(crate) fn close_mailboxes(&self) {
        for mailbox in self.mailboxes() {
            mailbox.close();
        }
    }

    pub(crate) fn reject_remaining(&self) -> usize {
        self.mailboxes().map(|m| m.reject_remaining()).sum()
    }

    pub(crate) fn wake(&self) {
        self.doorbell.ring();
        self.state.notify();
    }
}

/// Handle given to [`Task`] methods
pub struct TaskContext {
    shared: Arc<ComponentShared>,
}

impl TaskContext {
    pub(crate) fn new(shared: Arc<ComponentShared>) -> Self {
        Self { shared }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn kind(&self) -> ComponentKind {
        self.shared.kind
    }

    pub fn period(&self) -> Option<Duration> {
        self.shared.kind.period()
    }

    /// Number of completed Active cycles
    pub fn cycle(&self) -> u64 {
        self.shared.cycles.load(Ordering::Relaxed)
    }

    pub fn overruns(&self) -> u64 {
        self.shared.overruns.load(Ordering::Relaxed)
    }

    pub fn state(&self) -> ComponentState {
        self.shared.state.get()
    }

    pub fn state_table(&self) -> &StateTable {
        &self.shared.state_table
    }

    /// Manager context, once the component has been added to a manager
    pub fn context(&self) -> Option<Context> {
        self.shared.context.read().clone()
    }

    /// Execute pending mail now (continuous tasks blocking inside `run`).
    pub fn process_mailboxes(&self) -> usize {
        self.shared.drain_mailboxes()
    }

    /// Block until mail arrives, the lifecycle changes or `timeout` elapses.
    pub fn wait_for_mail(&self, timeout: Duration) -> bool {
        self.shared.doorbell.wait(timeout)
    }
}

pub struct Component {
    shared: Arc<ComponentShared>,
    task: Mutex<Option<Box<dyn Task>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
    provided: RwLock<BTreeMap<String, Arc<ProvidedInterface>>>,
    required: RwLock<BTreeMap<String, Arc<RequiredInterface>>>,
}

impl Component {
    pub fn new<T: Task + 'static>(
        name: &str,
        kind: ComponentKind,
        task: T,
        options: ComponentOptions,
    ) -> Self {
        Self::from_boxed(name, kind, Box::new(task), options)
    }

    pub fn from_boxed(
        name: &str,
        kind: ComponentKind,
        task: Box<dyn Task>,
        options: ComponentOptions,
    ) -> Self {
        let doorbell = Arc::new(Doorbell::new());
        let mailbox = |suffix: &str| {
            kind.has_thread().then(|| {
                Mailbox::with_doorbell(
                    format!("{}.{}", name, suffix),
                    options.mailbox_capacity,
                    doorbell.clone(),
                )
            })
        };
        let commands = mailbox("commands");
        let events = mailbox("events");
        let shared = Arc::new(ComponentShared {
            name: name.to_string(),
            kind,
            state: StateCell::new(),
            doorbell,
            commands,
            events,
            state_table: Arc::new(StateTable::new(name, options.state_table_capacity)),
            cycles: AtomicU64::new(0),
            overruns: AtomicU64::new(0),
            context: RwLock::new(None),
        });
        Self {
            shared,
            task: Mutex::new(Some(task)),
            thread: Mutex::new(None),
            provided: RwLock::new(BTreeMap::new()),
            required: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn passive<T: Task + 'static>(name: &str, task: T) -> Self {
        Self::new(name, ComponentKind::Passive, task, ComponentOptions::default())
    }

    pub fn periodic<T: Task + 'static>(name: &str, period: Duration, task: T) -> Self {
        Self::new(
            name,
            ComponentKind::Periodic(period),
            task,
            ComponentOptions::default(),
        )
    }

    pub fn continuous<T: Task + 'static>(name: &str, task: T) -> Self {
        Self::new(
            name,
            ComponentKind::Continuous,
            task,
            ComponentOptions::default(),
        )
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn kind(&self) -> ComponentKind {
        self.shared.kind
    }

    pub fn state(&self) -> ComponentState {
        self.shared.state.get()
    }

    pub fn has_failed(&self) -> bool {
        self.shared.state.has_failed()
    }

    pub fn failure(&self) -> Option<String> {
        self.shared.state.failure()
    }

    pub fn cycles(&self) -> u64 {
        self.shared.cycles.load(Ordering::Relaxed)
    }

    /// Cycles whose work exceeded the period
    pub fn overruns(&self) -> u64 {
        self.shared.overruns.load(Ordering::Relaxed)
    }

    pub fn state_table(&self) -> &StateTable {
        &self.shared.state_table
    }

    /// Queue for commands and completions; `None` for passive components
    pub fn command_mailbox(&self) -> Option<&Mailbox> {
        self.shared.commands.as_ref()
    }

    pub fn event_mailbox(&self) -> Option<&Mailbox> {
        self.shared.events.as_ref()
    }

    pub(crate) fn attach_context(&self, context: Context) {
        *self.shared.context.write() = Some(context);
    }

    pub fn add_interface_provided(&self, name: &str) -> MtaskResult<Arc<ProvidedInterface>> {
        let mut provided = self.provided.write();
        if provided.contains_key(name) {
            log::warn!("{}: provided interface '{}' already exists", self.name(), name);
            return Err(MtaskError::already_exists(format!(
                "provided interface '{}.{}'",
                self.name(),
                name
            )));
        }
        let interface = Arc::new(ProvidedInterface::new(
            self.name(),
            name,
            self.shared.commands.clone(),
        ));
        provided.insert(name.to_string(), interface.clone());
        Ok(interface)
    }

    pub fn add_interface_required(&self, name: &str) -> MtaskResult<Arc<RequiredInterface>> {
        let mut required = self.required.write();
        if required.contains_key(name) {
            log::warn!("{}: required interface '{}' already exists", self.name(), name);
            return Err(MtaskError::already_exists(format!(
                "required interface '{}.{}'",
                self.name(),
                name
            )));
        }
        let interface = Arc::new(RequiredInterface::new(
            self.name(),
            name,
            self.shared.events.clone(),
            self.shared.commands.clone(),
        ));
        required.insert(name.to_string(), interface.clone());
        Ok(interface)
    }

    pub fn provided_interface(&self, name: &str) -> Option<Arc<ProvidedInterface>> {
        self.provided.read().get(name).cloned()
    }

    pub fn required_interface(&self, name: &str) -> Option<Arc<RequiredInterface>> {
        self.required.read().get(name).cloned()
    }

    pub fn provided_interfaces(&self) -> Vec<Arc<ProvidedInterface>> {
        self.provided.read().values().cloned().collect()
    }

    pub fn required_interfaces(&self) -> Vec<Arc<RequiredInterface>> {
        self.required.read().values().cloned().collect()
    }

    pub fn provided_interface_names(&self) -> Vec<String> {
        self.provided.read().keys().cloned().collect()
    }

    pub fn required_interface_names(&self) -> Vec<String> {
        self.required.read().keys().cloned().collect()
    }

    pub fn describe(&self) -> ComponentDescription {
        ComponentDescription {
            name: self.name().to_string(),
            kind: self.kind(),
            provided: self.provided_interfaces().iter().map(|i| i.describe()).collect(),
            required: self.required_interfaces().iter().map(|i| i.describe()).collect(),
        }
    }

    fn invalid_transition(&self, to: ComponentState) -> MtaskError {
        MtaskError::InvalidTransition {
            component: self.name().to_string(),
            from: self.state().to_string(),
            to: to.to_string(),
        }
    }

    /// Constructed -> Initializing. Threaded components spawn their thread,
    /// which runs startup and moves on to Ready; passive ones run startup here.
    pub fn create(&self) -> MtaskResult<()> {
        if !self
            .shared
            .state
            .transition(ComponentState::Constructed, ComponentState::Initializing)
        {
            return Err(self.invalid_transition(ComponentState::Initializing));
        }
        // Held until the thread handle is stored so a concurrent kill waits for it
        let mut thread = self.thread.lock();
        let task = self.task.lock().take().ok_or_else(|| {
            MtaskError::component(self.name(), "task already handed to a thread")
        })?;
        log::debug!("{}: creating ({})", self.name(), self.kind());

        if !self.kind().has_thread() {
            let mut task = task;
            let ok = executor::run_startup(&self.shared, task.as_mut());
            if ok {
                self.shared
                    .state
                    .transition(ComponentState::Initializing, ComponentState::Ready);
                *self.task.lock() = Some(task);
            }
            return Ok(());
        }

        let shared = self.shared.clone();
        let handle = std::thread::Builder::new()
            .name(format!("mtask-{}", self.name()))
            .spawn(move || executor::run(shared, task))
            .map_err(|e| {
                self.shared
                    .state
                    .mark_failed(format!("cannot spawn thread: {}", e));
                self.shared.close_mailboxes();
                self.shared.reject_remaining();
                self.shared.state.finish();
                MtaskError::component(self.name(), format!("cannot spawn thread: {}", e))
            })?;
        *thread = Some(handle);
        Ok(())
    }

    /// Ready -> Active
    pub fn start(&self) -> MtaskResult<()> {
        if !self
            .shared
            .state
            .transition(ComponentState::Ready, ComponentState::Active)
        {
            return Err(self.invalid_transition(ComponentState::Active));
        }
        log::info!("{}: started", self.name());
        self.shared.wake();
        Ok(())
    }

    /// Active -> Ready. The thread keeps draining its mailboxes.
    pub fn suspend(&self) -> MtaskResult<()> {
        if !self
            .shared
            .state
            .transition(ComponentState::Active, ComponentState::Ready)
        {
            return Err(self.invalid_transition(ComponentState::Ready));
        }
        log::info!("{}: suspended", self.name());
        self.shared.wake();
        Ok(())
    }

    /// Any state but Finishing/Finished -> Finishing. Mailboxes and commands
    /// stop accepting calls before this returns; the thread finishes its cycle, drains one
    /// last time, runs cleanup and reaches Finished.
    ///
    /// Killing an already finishing component is a no-op.
    pub fn kill(&self) -> MtaskResult<()> {
        self.shared.close_mailboxes();
        // Direct commands have no mailbox to refuse them
        for interface in self.provided_interfaces() {
            interface.disable_all();
        }
        let previous = match self.shared.state.begin_finishing() {
            Some(previous) => previous,
            None => return Ok(()),
        };
        log::info!("{}: killed while {}", self.name(), previous);

        let threaded = self.thread.lock().is_some();
        if threaded {
            self.shared.wake();
            return Ok(());
        }
        // No thread to finish the job: passive, or never created
        self.shared.reject_remaining();
        if let Some(mut task) = self.task.lock().take() {
            if previous != ComponentState::Constructed {
                let mut ctx = TaskContext::new(self.shared.clone());
                task.cleanup(&mut ctx);
            }
        }
        if self.shared.state.finish() {
            log::info!("{}: finished", self.name());
        }
        Ok(())
    }

    /// Block the caller until `target` is reached or `timeout` elapses.
    pub fn wait_for_state(&self, target: ComponentState, timeout: Duration) -> bool {
        self.shared.state.wait_for(target, timeout)
    }

    pub(crate) fn wait_for_state_until(&self, target: ComponentState, deadline: Instant) -> bool {
        self.shared.state.wait_until(target, deadline)
    }

    pub fn create_and_wait(&self, timeout: Duration) -> MtaskResult<bool> {
        self.create()?;
        Ok(self.wait_for_state(ComponentState::Ready, timeout))
    }

    pub fn start_and_wait(&self, timeout: Duration) -> MtaskResult<bool> {
        self.start()?;
        Ok(self.wait_for_state(ComponentState::Active, timeout))
    }

    pub fn kill_and_wait(&self, timeout: Duration) -> MtaskResult<bool> {
        self.kill()?;
        Ok(self.wait_for_state(ComponentState::Finished, timeout))
    }

    /// Join the component thread once Finished. Returns false if still running.
    pub fn join(&self) -> bool {
        if self.state() != ComponentState::Finished {
            return false;
        }
        if let Some(handle) = self.thread.lock().take() {
            if handle.join().is_err() {
                log::error!("{}: thread panicked", self.name());
            }
        }
        true
    }
}

impl Drop for Component {
    fn drop(&mut self) {
        if self.thread.lock().is_some() {
            let _ = self.kill();
            if self.wait_for_state(ComponentState::Finished, Duration::from_secs(5)) {
                self.join();
            } else {
                log::warn!("{}: thread did not finish, detaching", self.name());
            }
        }
    }
}

impl fmt::Debug for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Component")
            .field("name", &self.shared.name)
            .field("kind", &self.shared.kind)
            .field("state", &self.state())
            .field("provided", &self.provided_interface_names())
            .field("required", &self.required_interface_names())
            .finish()
    }
}
