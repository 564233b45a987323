//! Provided and required interfaces.
//!
//! A provided interface is a named set of commands and event generators; a
//! required interface is a named set of functions and event handlers. A
//! connection binds the second to the first by name, once.

use crate::communication::command::{Command, CommandDescription, CommandRole};
use crate::communication::event::{
    EventDescription, EventGenerator, EventHandler, EventVoid, EventWrite,
};
use crate::communication::function::{
    FunctionCore, FunctionDescription, FunctionPolicy, FunctionQualifiedRead, FunctionRead,
    FunctionVoid, FunctionVoidReturn, FunctionWrite, FunctionWriteReturn,
};
use crate::communication::mailbox::{Handler, Mailbox};
use crate::core::payload::{BoxedValue, Payload, TypeDescriptor, TypeTag, Value};
use crate::core::state_table::StateAccessor;
use crate::error::{MtaskError, MtaskResult};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Serializable description of a provided interface, enough to build a proxy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceDescription {
    pub component: String,
    pub name: String,
    pub commands: Vec<CommandDescription>,
    pub events: Vec<EventDescription>,
}

/// Serializable description of a required interface
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequiredDescription {
    pub component: String,
    pub name: String,
    pub functions: Vec<FunctionDescription>,
    pub event_handlers: Vec<String>,
}

fn downcast_arg<T: Payload>(arg: Option<&dyn Value>) -> Option<&T> {
    arg.and_then(|a| a.as_any().downcast_ref::<T>())
}

pub struct ProvidedInterface {
    component: String,
    name: String,
    mailbox: Option<Mailbox>,
    commands: RwLock<BTreeMap<String, Arc<Command>>>,
    events: RwLock<BTreeMap<String, Arc<EventGenerator>>>,
}

impl ProvidedInterface {
    /// `mailbox` is the owning component's command mailbox; `None` makes
    /// every command direct.
    pub fn new(component: &str, name: &str, mailbox: Option<Mailbox>) -> Self {
        Self {
            component: component.to_string(),
            name: name.to_string(),
            mailbox,
            commands: RwLock::new(BTreeMap::new()),
            events: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn component(&self) -> &str {
        &self.component
    }

    /// Register an already built command (local or proxy)
    pub fn insert_command(&self, command: Command) -> MtaskResult<Arc<Command>> {
        let mut commands = self.commands.write();
        if commands.contains_key(command.name()) {
            log::warn!(
                "{}.{}: command '{}' already exists, ignoring new registration",
                self.component,
                self.name,
                command.name()
            );
            return Err(MtaskError::already_exists(format!(
                "command '{}' in interface '{}.{}'",
                command.name(),
                self.component,
                self.name
            )));
        }
        let command = Arc::new(command);
        commands.insert(command.name().to_string(), command.clone());
        Ok(command)
    }

    fn add_command(
        &self,
        name: &str,
        role: CommandRole,
        argument: Option<TypeDescriptor>,
        result: Option<TypeDescriptor>,
        handler: Handler,
    ) -> MtaskResult<()> {
        let command = Command::local(name, role, argument, result, handler, self.mailbox.clone());
        self.insert_command(command).map(|_| ())
    }

    pub fn add_command_void<F>(&self, name: &str, f: F) -> MtaskResult<()>
    where
        F: Fn() + Send + Sync + 'static,
    {
        let handler: Handler = Arc::new(move |_| {
            f();
            None
        });
        self.add_command(name, CommandRole::Void, None, None, handler)
    }

    pub fn add_command_write<T, F>(&self, name: &str, f: F) -> MtaskResult<()>
    where
        T: Payload,
        F: Fn(&T) + Send + Sync + 'static,
    {
        let handler: Handler = Arc::new(move |arg| {
            if let Some(value) = downcast_arg::<T>(arg) {
                f(value);
            }
            None
        });
        self.add_command(
            name,
            CommandRole::Write,
            Some(TypeDescriptor::of::<T>()),
            None,
            handler,
        )
    }

    pub fn add_command_read<R, F>(&self, name: &str, f: F) -> MtaskResult<()>
    where
        R: Payload,
        F: Fn() -> R + Send + Sync + 'static,
    {
        let handler: Handler = Arc::new(move |_| Some(Box::new(f()) as BoxedValue));
        self.add_command(
            name,
            CommandRole::Read,
            None,
            Some(TypeDescriptor::of::<R>()),
            handler,
        )
    }

    pub fn add_command_qualified_read<A, R, F>(&self, name: &str, f: F) -> MtaskResult<()>
    where
        A: Payload,
        R: Payload,
        F: Fn(&A) -> R + Send + Sync + 'static,
    {
        let handler: Handler =
            Arc::new(move |arg| downcast_arg::<A>(arg).map(|a| Box::new(f(a)) as BoxedValue));
        self.add_command(
            name,
            CommandRole::QualifiedRead,
            Some(TypeDescriptor::of::<A>()),
            Some(TypeDescriptor::of::<R>()),
            handler,
        )
    }

    pub fn add_command_void_return<R, F>(&self, name: &str, f: F) -> MtaskResult<()>
    where
        R: Payload,
        F: Fn() -> R + Send + Sync + 'static,
    {
        let handler: Handler = Arc::new(move |_| Some(Box::new(f()) as BoxedValue));
        self.add_command(
            name,
            CommandRole::VoidReturn,
            None,
            Some(TypeDescriptor::of::<R>()),
            handler,
        )
    }

    pub fn add_command_write_return<A, R, F>(&self, name: &str, f: F) -> MtaskResult<()>
    where
        A: Payload,
        R: Payload,
        F: Fn(&A) -> R + Send + Sync + 'static,
    {
        let handler: Handler =
            Arc::new(move |arg| downcast_arg::<A>(arg).map(|a| Box::new(f(a)) as BoxedValue));
        self.add_command(
            name,
            CommandRole::WriteReturn,
            Some(TypeDescriptor::of::<A>()),
            Some(TypeDescriptor::of::<R>()),
            handler,
        )
    }

    /// Expose a state table column as a Read command returning its latest
    /// committed value. Fails with `Disabled` until a first row exists.
    pub fn add_command_read_state<T: Payload>(
        &self,
        name: &str,
        accessor: StateAccessor<T>,
    ) -> MtaskResult<()> {
        let attempts = 4;
        let handler: Handler = Arc::new(move |_| {
            // A miss means the writer overwrote the row mid-read: retry
            (0..attempts)
                .find_map(|_| accessor.get_latest())
                .map(|(_, value)| Box::new(value) as BoxedValue)
        });
        let command = Command::local(
            name,
            CommandRole::Read,
            None,
            Some(TypeDescriptor::of::<T>()),
            handler,
            None,
        );
        self.insert_command(command).map(|_| ())
    }

    pub fn insert_event(&self, generator: EventGenerator) -> MtaskResult<Arc<EventGenerator>> {
        let mut events = self.events.write();
        if events.contains_key(generator.name()) {
            log::warn!(
                "{}.{}: event '{}' already exists",
                self.component,
                self.name,
                generator.name()
            );
            return Err(MtaskError::already_exists(format!(
                "event '{}' in interface '{}.{}'",
                generator.name(),
                self.component,
                self.name
            )));
        }
        let generator = Arc::new(generator);
        events.insert(generator.name().to_string(), generator.clone());
        Ok(generator)
    }

    pub fn add_event_void(&self, name: &str) -> MtaskResult<EventVoid> {
        self.insert_event(EventGenerator::new(name, None))
            .map(EventVoid::new)
    }

    pub fn add_event_write<T: Payload>(&self, name: &str) -> MtaskResult<EventWrite<T>> {
        self.insert_event(EventGenerator::new(name, Some(TypeDescriptor::of::<T>())))
            .map(EventWrite::new)
    }

    pub fn command(&self, name: &str) -> Option<Arc<Command>> {
        self.commands.read().get(name).cloned()
    }

    pub fn event(&self, name: &str) -> Option<Arc<EventGenerator>> {
        self.events.read().get(name).cloned()
    }

    pub fn command_names(&self) -> Vec<String> {
        self.commands.read().keys().cloned().collect()
    }

    pub fn event_names(&self) -> Vec<String> {
        self.events.read().keys().cloned().collect()
    }

    /// Disable every command, e.g. when the owner is removed
    pub fn disable_all(&self) {
        for command in self.commands.read().values() {
            command.disable();
        }
    }

    pub fn describe(&self) -> InterfaceDescription {
        InterfaceDescription {
            component: self.component.clone(),
            name: self.name.clone(),
            commands: self.commands.read().values().map(|c| c.describe()).collect(),
            events: self.events.read().values().map(|e| e.describe()).collect(),
        }
    }
}

impl fmt::Debug for ProvidedInterface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProvidedInterface")
            .field("component", &self.component)
            .field("name", &self.name)
            .field("commands", &self.command_names())
            .field("events", &self.event_names())
            .finish()
    }
}

pub struct RequiredInterface {
    component: String,
    name: String,
    /// Queue for event handlers
    event_mailbox: Option<Mailbox>,
    /// Where finished callbacks of asynchronous calls are delivered
    caller_mailbox: Option<Mailbox>,
    functions: RwLock<BTreeMap<String, Arc<FunctionCore>>>,
    handlers: RwLock<BTreeMap<String, (Arc<EventHandler>, FunctionPolicy)>>,
}

impl RequiredInterface {
    pub fn new(
        component: &str,
        name: &str,
        event_mailbox: Option<Mailbox>,
        caller_mailbox: Option<Mailbox>,
    ) -> Self {
        Self {
            component: component.to_string(),
            name: name.to_string(),
            event_mailbox,
            caller_mailbox,
            functions: RwLock::new(BTreeMap::new()),
            handlers: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn component(&self) -> &str {
        &self.component
    }

    fn add_function(
        &self,
        name: &str,
        role: CommandRole,
        argument: Option<TypeTag>,
        result: Option<TypeTag>,
        policy: FunctionPolicy,
    ) -> MtaskResult<Arc<FunctionCore>> {
        let mut functions = self.functions.write();
        if functions.contains_key(name) {
            log::warn!(
                "{}.{}: function '{}' already exists",
                self.component,
                self.name,
                name
            );
            return Err(MtaskError::already_exists(format!(
                "function '{}' in interface '{}.{}'",
                name, self.component, self.name
            )));
        }
        let core = Arc::new(FunctionCore::new(
            name,
            role,
            argument,
            result,
            policy,
            self.caller_mailbox.clone(),
        ));
        functions.insert(name.to_string(), core.clone());
        Ok(core)
    }

    pub fn add_function_void(&self, name: &str, policy: FunctionPolicy) -> MtaskResult<FunctionVoid> {
        self.add_function(name, CommandRole::Void, None, None, policy)
            .map(FunctionVoid::from_core)
    }

    pub fn add_function_write<T: Payload>(
        &self,
        name: &str,
        policy: FunctionPolicy,
    ) -> MtaskResult<FunctionWrite<T>> {
        self.add_function(name, CommandRole::Write, Some(TypeTag::of::<T>()), None, policy)
            .map(FunctionWrite::from_core)
    }

    pub fn add_function_read<R: Payload>(
        &self,
        name: &str,
        policy: FunctionPolicy,
    ) -> MtaskResult<FunctionRead<R>> {
        self.add_function(name, CommandRole::Read, None, Some(TypeTag::of::<R>()), policy)
            .map(FunctionRead::from_core)
    }

    pub fn add_function_qualified_read<A: Payload, R: Payload>(
        &self,
        name: &str,
        policy: FunctionPolicy,
    ) -> MtaskResult<FunctionQualifiedRead<A, R>> {
        self.add_function(
            name,
            CommandRole::QualifiedRead,
            Some(TypeTag::of::<A>()),
            Some(TypeTag::of::<R>()),
            policy,
        )
        .map(FunctionQualifiedRead::from_core)
    }

    pub fn add_function_void_return<R: Payload>(
        &self,
        name: &str,
        policy: FunctionPolicy,
    ) -> MtaskResult<FunctionVoidReturn<R>> {
        self.add_function(
            name,
            CommandRole::VoidReturn,
            None,
            Some(TypeTag::of::<R>()),
            policy,
        )
        .map(FunctionVoidReturn::from_core)
    }

    pub fn add_function_write_return<A: Payload, R: Payload>(
        &self,
        name: &str,
        policy: FunctionPolicy,
    ) -> MtaskResult<FunctionWriteReturn<A, R>> {
        self.add_function(
            name,
            CommandRole::WriteReturn,
            Some(TypeTag::of::<A>()),
            Some(TypeTag::of::<R>()),
            policy,
        )
        .map(FunctionWriteReturn::from_core)
    }

    fn add_event_handler(
        &self,
        name: &str,
        payload: Option<TypeDescriptor>,
        callback: Handler,
        policy: FunctionPolicy,
    ) -> MtaskResult<()> {
        let mut handlers = self.handlers.write();
        if handlers.contains_key(name) {
            log::warn!(
                "{}.{}: event handler '{}' already exists",
                self.component,
                self.name,
                name
            );
            return Err(MtaskError::already_exists(format!(
                "event handler '{}' in interface '{}.{}'",
                name, self.component, self.name
            )));
        }
        let handler = EventHandler::new(name, payload, callback, self.event_mailbox.clone());
        handlers.insert(name.to_string(), (Arc::new(handler), policy));
        Ok(())
    }

    /// Handler for a payload-less event, run on the owner's thread
    pub fn add_event_handler_void<F>(
        &self,
        name: &str,
        policy: FunctionPolicy,
        f: F,
    ) -> MtaskResult<()>
    where
        F: Fn() + Send + Sync + 'static,
    {
        let callback: Handler = Arc::new(move |_| {
            f();
            None
        });
        self.add_event_handler(name, None, callback, policy)
    }

    pub fn add_event_handler_write<T, F>(
        &self,
        name: &str,
        policy: FunctionPolicy,
        f: F,
    ) -> MtaskResult<()>
    where
        T: Payload,
        F: Fn(&T) + Send + Sync + 'static,
    {
        let callback: Handler = Arc::new(move |arg| {
            if let Some(value) = downcast_arg::<T>(arg) {
                f(value);
            }
            None
        });
        self.add_event_handler(name, Some(TypeDescriptor::of::<T>()), callback, policy)
    }

    pub fn function(&self, name: &str) -> Option<Arc<FunctionCore>> {
        self.functions.read().get(name).cloned()
    }

    pub fn functions(&self) -> Vec<Arc<FunctionCore>> {
        self.functions.read().values().cloned().collect()
    }

    pub fn event_handler(&self, name: &str) -> Option<Arc<EventHandler>> {
        self.handlers.read().get(name).map(|(h, _)| h.clone())
    }

    pub fn event_handlers(&self) -> Vec<(Arc<EventHandler>, FunctionPolicy)> {
        self.handlers.read().values().cloned().collect()
    }

    pub fn function_names(&self) -> Vec<String> {
        self.functions.read().keys().cloned().collect()
    }

    pub fn event_handler_names(&self) -> Vec<String> {
        self.handlers.read().keys().cloned().collect()
    }

    pub fn unbind_all(&self) {
        for function in self.functions.read().values() {
            function.unbind();
        }
    }

    pub fn describe(&self) -> RequiredDescription {
        RequiredDescription {
            component: self.component.clone(),
            name: self.name.clone(),
            functions: self
                .functions
                .read()
                .values()
                .map(|f| f.describe())
                .collect(),
            event_handlers: self.event_handler_names(),
        }
    }
}

impl fmt::Debug for RequiredInterface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequiredInterface")
            .field("component", &self.component)
            .field("name", &self.name)
            .field("functions", &self.function_names())
            .field("event_handlers", &self.event_handler_names())
            .finish()
    }
}
