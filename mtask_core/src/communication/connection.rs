//! Binding of a required interface to a provided interface.

use crate::communication::event::EventGenerator;
use crate::communication::function::FunctionPolicy;
use crate::communication::interface::{ProvidedInterface, RequiredInterface};
use crate::error::{MtaskError, MtaskResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

pub type ConnectionId = u64;

/// `process:component.interface`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Endpoint {
    pub process: String,
    pub component: String,
    pub interface: String,
}

impl Endpoint {
    pub fn new(process: &str, component: &str, interface: &str) -> Self {
        Self {
            process: process.to_string(),
            component: component.to_string(),
            interface: interface.to_string(),
        }
    }

    /// Parse `[process:]component.interface`, filling in `default_process`.
    pub fn parse(text: &str, default_process: &str) -> MtaskResult<Self> {
        let (process, rest) = match text.split_once(':') {
            Some((process, rest)) => (process, rest),
            None => (default_process, text),
        };
        let (component, interface) = rest.split_once('.').ok_or_else(|| {
            MtaskError::invalid_input(format!(
                "'{}' is not of the form [process:]component.interface",
                text
            ))
        })?;
        if process.is_empty() || component.is_empty() || interface.is_empty() {
            return Err(MtaskError::invalid_input(format!(
                "'{}' has an empty process, component or interface name",
                text
            )));
        }
        Ok(Self::new(process, component, interface))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}.{}", self.process, self.component, self.interface)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionDescription {
    pub id: ConnectionId,
    pub required: Endpoint,
    pub provided: Endpoint,
}

impl fmt::Display for ConnectionDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} {} -> {}", self.id, self.required, self.provided)
    }
}

/// Result of name-based resolution between two interfaces. Functions hold
/// direct (weak) references to their commands from here on.
pub struct Binding {
    required: Arc<RequiredInterface>,
    provided: Arc<ProvidedInterface>,
    bound_functions: Vec<String>,
    unbound_functions: Vec<String>,
    attached: Vec<(Arc<EventGenerator>, u64)>,
}

impl Binding {
    /// Resolve every function and event handler of `required` against
    /// `provided`. Optional names without a match stay unbound; a required one
    /// rolls the whole binding back.
    pub fn establish(
        required: Arc<RequiredInterface>,
        provided: Arc<ProvidedInterface>,
    ) -> MtaskResult<Self> {
        let mut binding = Binding {
            required,
            provided,
            bound_functions: Vec::new(),
            unbound_functions: Vec::new(),
            attached: Vec::new(),
        };
        if let Err(e) = binding.resolve() {
            binding.release();
            return Err(e);
        }
        Ok(binding)
    }

    /// Check that `establish` would succeed without touching either side:
    /// every `Required` function and handler has a compatible counterpart.
    pub fn check(required: &RequiredInterface, provided: &ProvidedInterface) -> MtaskResult<()> {
        let target = format!("{}.{}", provided.component(), provided.name());
        for function in required.functions() {
            if function.policy() != FunctionPolicy::Required {
                continue;
            }
            match provided.command(function.name()) {
                Some(command) => function.accepts(&command)?,
                None => {
                    return Err(MtaskError::not_found(format!(
                        "command '{}' in '{}'",
                        function.name(),
                        target
                    )))
                }
            }
        }
        for (handler, policy) in required.event_handlers() {
            if policy != FunctionPolicy::Required {
                continue;
            }
            match provided.event(handler.name()) {
                Some(generator) => generator.accepts(&handler)?,
                None => {
                    return Err(MtaskError::not_found(format!(
                        "event '{}' in '{}'",
                        handler.name(),
                        target
                    )))
                }
            }
        }
        Ok(())
    }

    fn resolve(&mut self) -> MtaskResult<()> {
        let provided = self.provided.clone();
        let required = self.required.clone();
        let target = format!("{}.{}", provided.component(), provided.name());

        for function in required.functions() {
            let outcome = match provided.command(function.name()) {
                Some(command) => function.bind(&command),
                None => Err(MtaskError::not_found(format!(
                    "command '{}' in '{}'",
                    function.name(),
                    target
                ))),
            };
            match outcome {
                Ok(()) => self.bound_functions.push(function.name().to_string()),
                Err(e) => {
                    if function.policy() == FunctionPolicy::Required {
                        log::error!(
                            "{}.{}: required function '{}' cannot be bound: {}",
                            required.component(),
                            required.name(),
                            function.name(),
                            e
                        );
                        return Err(e);
                    }
                    log::debug!(
                        "{}.{}: function '{}' left unbound: {}",
                        required.component(),
                        required.name(),
                        function.name(),
                        e
                    );
                    self.unbound_functions.push(function.name().to_string());
                }
            }
        }

        for (handler, policy) in required.event_handlers() {
            let outcome = match provided.event(handler.name()) {
                Some(generator) => generator.add_handler(&handler).map(|_| generator),
                None => Err(MtaskError::not_found(format!(
                    "event '{}' in '{}'",
                    handler.name(),
                    target
                ))),
            };
            match outcome {
                Ok(generator) => self.attached.push((generator, handler.id())),
                Err(e) if policy == FunctionPolicy::Required => {
                    log::error!(
                        "{}.{}: required event handler '{}' cannot be bound: {}",
                        required.component(),
                        required.name(),
                        handler.name(),
                        e
                    );
                    return Err(e);
                }
                Err(e) => log::debug!(
                    "{}.{}: event handler '{}' left unbound: {}",
                    required.component(),
                    required.name(),
                    handler.name(),
                    e
                ),
            }
        }
        Ok(())
    }

    /// Undo the binding: unbind functions and detach handlers.
    pub fn release(&self) {
        for name in &self.bound_functions {
            if let Some(function) = self.required.function(name) {
                function.unbind();
            }
        }
        for (generator, handler_id) in &self.attached {
            generator.remove_handler(*handler_id);
        }
    }

    pub fn required(&self) -> &Arc<RequiredInterface> {
        &self.required
    }

    pub fn provided(&self) -> &Arc<ProvidedInterface> {
        &self.provided
    }

    pub fn bound_functions(&self) -> &[String] {
        &self.bound_functions
    }

    pub fn unbound_functions(&self) -> &[String] {
        &self.unbound_functions
    }

    pub fn attached_handlers(&self) -> usize {
        self.attached.len()
    }
}

/// An established connection, owning its binding and any proxy resources.
pub struct Connection {
    description: ConnectionDescription,
    binding: Binding,
    teardown: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Connection {
    pub fn new(description: ConnectionDescription, binding: Binding) -> Self {
        Self {
            description,
            binding,
            teardown: None,
        }
    }

    /// Extra cleanup run on close (remote unsubscription, proxy shutdown)
    pub fn with_teardown<F: FnOnce() + Send + Sync + 'static>(mut self, f: F) -> Self {
        self.teardown = Some(Box::new(f));
        self
    }

    pub fn id(&self) -> ConnectionId {
        self.description.id
    }

    pub fn description(&self) -> &ConnectionDescription {
        &self.description
    }

    pub fn binding(&self) -> &Binding {
        &self.binding
    }

    pub fn close(mut self) {
        self.binding.release();
        if let Some(teardown) = self.teardown.take() {
            teardown();
        }
        log::info!("connection {} closed", self.description);
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("description", &self.description)
            .field("bound", &self.binding.bound_functions)
            .field("unbound", &self.binding.unbound_functions)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::result::ExecutionResult;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_endpoint_parse() {
        let ep = Endpoint::parse("arm.Control", "local").unwrap();
        assert_eq!(ep, Endpoint::new("local", "arm", "Control"));
        let ep = Endpoint::parse("p1:arm.Control", "local").unwrap();
        assert_eq!(ep.process, "p1");
        assert_eq!(ep.to_string(), "p1:arm.Control");
        assert!(Endpoint::parse("arm", "local").is_err());
        assert!(Endpoint::parse("p1:.Control", "local").is_err());
    }

    #[test]
    fn test_subset_binding_leaves_unmatched_unbound() {
        let provided = Arc::new(ProvidedInterface::new("server", "Api", None));
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        provided
            .add_command_void("Ping", move || {
                c.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        provided.add_command_void("Reset", || {}).unwrap();

        let required = Arc::new(RequiredInterface::new("client", "Server", None, None));
        let ping = required
            .add_function_void("Ping", FunctionPolicy::Optional)
            .unwrap();
        let missing = required
            .add_function_void("Shutdown", FunctionPolicy::Optional)
            .unwrap();

        let binding = Binding::establish(required.clone(), provided).unwrap();
        assert_eq!(binding.bound_functions(), &["Ping".to_string()]);
        assert_eq!(binding.unbound_functions(), &["Shutdown".to_string()]);
        assert_eq!(ping.execute(), ExecutionResult::Succeeded);
        assert_eq!(missing.execute(), ExecutionResult::FunctionNotBound);
        assert_eq!(count.load(Ordering::SeqCst), 1);

        binding.release();
        assert_eq!(ping.execute(), ExecutionResult::FunctionNotBound);
    }

    #[test]
    fn test_required_function_rolls_back() {
        let provided = Arc::new(ProvidedInterface::new("server", "Api", None));
        provided.add_command_void("Ping", || {}).unwrap();
        let fired = provided.add_event_void("Pinged").unwrap();

        let required = Arc::new(RequiredInterface::new("client", "Server", None, None));
        let ping = required
            .add_function_void("Ping", FunctionPolicy::Optional)
            .unwrap();
        let heard = Arc::new(AtomicUsize::new(0));
        let h = heard.clone();
        required
            .add_event_handler_void("Pinged", FunctionPolicy::Optional, move || {
                h.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        required
            .add_function_write::<u32>("Configure", FunctionPolicy::Required)
            .unwrap();

        assert!(Binding::establish(required, provided).is_err());
        assert!(!ping.is_bound());
        fired.fire();
        assert_eq!(heard.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_role_mismatch_leaves_function_unbound() {
        let provided = Arc::new(ProvidedInterface::new("server", "Api", None));
        provided.add_command_read("Value", || 3i32).unwrap();
        let required = Arc::new(RequiredInterface::new("client", "Server", None, None));
        let wrong = required
            .add_function_void("Value", FunctionPolicy::Optional)
            .unwrap();
        let binding = Binding::establish(required, provided).unwrap();
        assert!(binding.bound_functions().is_empty());
        assert_eq!(wrong.execute(), ExecutionResult::FunctionNotBound);
    }

    #[test]
    fn test_events_bound_and_released() {
        let provided = Arc::new(ProvidedInterface::new("server", "Api", None));
        let moved = provided.add_event_write::<i32>("Moved").unwrap();
        let required = Arc::new(RequiredInterface::new("client", "Server", None, None));
        let total = Arc::new(AtomicUsize::new(0));
        let t = total.clone();
        required
            .add_event_handler_write::<i32, _>("Moved", FunctionPolicy::Optional, move |v| {
                t.fetch_add(*v as usize, Ordering::SeqCst);
            })
            .unwrap();

        let binding = Binding::establish(required, provided).unwrap();
        assert_eq!(binding.attached_handlers(), 1);
        moved.fire(&5);
        let connection = Connection::new(
            ConnectionDescription {
                id: 1,
                required: Endpoint::new("p", "client", "Server"),
                provided: Endpoint::new("p", "server", "Api"),
            },
            binding,
        );
        connection.close();
        moved.fire(&5);
        assert_eq!(total.load(Ordering::SeqCst), 5);
    }
}
