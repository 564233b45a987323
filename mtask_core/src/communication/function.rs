//! Functions: caller-side handles bound to at most one command.
//!
//! A function resolves its command once, at connect time, and keeps a weak
//! reference to it. Calling an unbound function fails with
//! `FunctionNotBound`; calling one whose command has since been dropped fails
//! with `Disabled`.

use crate::communication::command::{CallMode, Command, CommandRole};
use crate::communication::mailbox::{CallReply, Completion, Mailbox};
use crate::core::payload::{Payload, TypeTag, Value};
use crate::core::result::ExecutionResult;
use crate::error::{MtaskError, MtaskResult};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Whether a connection may leave the function unbound
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FunctionPolicy {
    /// Unmatched names stay unbound
    #[default]
    Optional,
    /// An unmatched name makes the connection fail
    Required,
}

/// Serializable summary of a function or event handler
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionDescription {
    pub name: String,
    pub role: CommandRole,
    pub argument: Option<TypeTag>,
    pub result: Option<TypeTag>,
    pub policy: FunctionPolicy,
}

/// Untyped state shared by the typed function handles and the required interface
pub struct FunctionCore {
    name: String,
    role: CommandRole,
    argument: Option<TypeTag>,
    result: Option<TypeTag>,
    policy: FunctionPolicy,
    command: RwLock<Option<Weak<Command>>>,
    caller_mailbox: Option<Mailbox>,
}

impl FunctionCore {
    pub(crate) fn new(
        name: &str,
        role: CommandRole,
        argument: Option<TypeTag>,
        result: Option<TypeTag>,
        policy: FunctionPolicy,
        caller_mailbox: Option<Mailbox>,
    ) -> Self {
        Self {
            name: name.to_string(),
            role,
            argument,
            result,
            policy,
            command: RwLock::new(None),
            caller_mailbox,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn role(&self) -> CommandRole {
        self.role
    }

    pub fn policy(&self) -> FunctionPolicy {
        self.policy
    }

    pub fn describe(&self) -> FunctionDescription {
        FunctionDescription {
            name: self.name.clone(),
            role: self.role,
            argument: self.argument.clone(),
            result: self.result.clone(),
            policy: self.policy,
        }
    }

    /// Bind to `command`. The roles must agree; argument and result types are
    /// checked on every call.
    pub fn bind(&self, command: &Arc<Command>) -> MtaskResult<()> {
        self.accepts(command)?;
        *self.command.write() = Some(Arc::downgrade(command));
        Ok(())
    }

    /// Whether `bind` would accept `command`, without binding.
    pub fn accepts(&self, command: &Command) -> MtaskResult<()> {
        if command.role() != self.role {
            return Err(MtaskError::invalid_input(format!(
                "function '{}' is {} but command '{}' is {}",
                self.name,
                self.role,
                command.name(),
                command.role()
            )));
        }
        Ok(())
    }

    pub fn unbind(&self) {
        *self.command.write() = None;
    }

    pub fn is_bound(&self) -> bool {
        self.command.read().is_some()
    }

    /// The bound command if it still exists
    pub fn command(&self) -> Option<Arc<Command>> {
        self.command.read().as_ref().and_then(Weak::upgrade)
    }

    fn resolve(&self) -> Result<Arc<Command>, ExecutionResult> {
        let guard = self.command.read();
        match guard.as_ref() {
            None => Err(ExecutionResult::FunctionNotBound),
            Some(weak) => weak.upgrade().ok_or(ExecutionResult::Disabled),
        }
    }

    fn invoke(&self, argument: Option<&dyn Value>, mode: CallMode) -> CallReply {
        match self.resolve() {
            Ok(command) => command.call(argument, mode),
            Err(result) => (result, None),
        }
    }

    fn expects_result<R: Payload>(&self, command: &Command) -> bool {
        command
            .result_type()
            .map(|desc| desc.matches::<R>())
            .unwrap_or(false)
    }

    fn read_into<R: Payload>(
        &self,
        argument: Option<&dyn Value>,
        mode: CallMode,
        output: &mut R,
    ) -> ExecutionResult {
        let command = match self.resolve() {
            Ok(command) => command,
            Err(result) => return result,
        };
        if !self.expects_result::<R>(&command) {
            return ExecutionResult::InvalidInputType;
        }
        let (result, reply) = command.call(argument, mode);
        if result == ExecutionResult::Succeeded {
            match reply.map(|r| r.into_typed::<R>()) {
                Some(Ok(value)) => *output = value,
                Some(Err(code)) => return code,
                None => {}
            }
        }
        result
    }

    fn read_async<R, F>(&self, argument: Option<&dyn Value>, on_finished: F) -> ExecutionResult
    where
        R: Payload,
        F: FnOnce(ExecutionResult, Option<R>) + Send + 'static,
    {
        let command = match self.resolve() {
            Ok(command) => command,
            Err(result) => return result,
        };
        if !self.expects_result::<R>(&command) {
            return ExecutionResult::InvalidInputType;
        }
        let completion = Completion::new(
            self.name.clone(),
            self.caller_mailbox.clone(),
            move |result, reply| {
                let value = reply.and_then(|r| r.into_typed::<R>().ok());
                let result = match (result, &value) {
                    (ExecutionResult::Succeeded, None) => ExecutionResult::InvalidInputType,
                    (other, _) => other,
                };
                on_finished(result, value)
            },
        );
        command.call(argument, CallMode::Async(completion)).0
    }
}

impl fmt::Debug for FunctionCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionCore")
            .field("name", &self.name)
            .field("role", &self.role)
            .field("bound", &self.is_bound())
            .finish()
    }
}

macro_rules! function_handle {
    ($(#[$doc:meta])* $name:ident $(< $($param:ident),+ >)?) => {
        $(#[$doc])*
        pub struct $name $(< $($param),+ >)? {
            core: Arc<FunctionCore>,
            $(_types: PhantomData<fn($($param),+)>,)?
        }

        impl $(< $($param),+ >)? Clone for $name $(< $($param),+ >)? {
            fn clone(&self) -> Self {
                Self {
                    core: self.core.clone(),
                    $(_types: PhantomData::<fn($($param),+)>,)?
                }
            }
        }

        impl $(< $($param: Payload),+ >)? $name $(< $($param),+ >)? {
            pub(crate) fn from_core(core: Arc<FunctionCore>) -> Self {
                Self {
                    core,
                    $(_types: PhantomData::<fn($($param),+)>,)?
                }
            }

            pub fn name(&self) -> &str {
                self.core.name()
            }

            pub fn is_bound(&self) -> bool {
                self.core.is_bound()
            }
        }
    };
}

function_handle!(
    /// Calls a command that takes no argument and returns nothing
    FunctionVoid
);
function_handle!(
    /// Calls a command that consumes an argument
    FunctionWrite<T>
);
function_handle!(
    /// Calls a command that fills an output argument, always in the caller's thread
    FunctionRead<R>
);
function_handle!(
    /// Calls a command that consumes an input and fills an output
    FunctionQualifiedRead<A, R>
);
function_handle!(
    /// Calls a command without argument that returns a value
    FunctionVoidReturn<R>
);
function_handle!(
    /// Calls a command that consumes an argument and returns a value
    FunctionWriteReturn<A, R>
);

impl FunctionVoid {
    /// Queued targets return `Queued` immediately.
    pub fn execute(&self) -> ExecutionResult {
        self.core.invoke(None, CallMode::Default).0
    }

    /// Wait until the target has executed the command.
    pub fn execute_blocking(&self) -> ExecutionResult {
        self.core.invoke(None, CallMode::Blocking(None)).0
    }

    pub fn execute_blocking_timeout(&self, timeout: Duration) -> ExecutionResult {
        self.core.invoke(None, CallMode::Blocking(Some(timeout))).0
    }
}

impl<T: Payload> FunctionWrite<T> {
    pub fn execute(&self, argument: &T) -> ExecutionResult {
        self.core.invoke(Some(argument), CallMode::Default).0
    }

    pub fn execute_blocking(&self, argument: &T) -> ExecutionResult {
        self.core.invoke(Some(argument), CallMode::Blocking(None)).0
    }

    pub fn execute_blocking_timeout(&self, argument: &T, timeout: Duration) -> ExecutionResult {
        self.core
            .invoke(Some(argument), CallMode::Blocking(Some(timeout)))
            .0
    }
}

impl<R: Payload> FunctionRead<R> {
    pub fn execute(&self, output: &mut R) -> ExecutionResult {
        self.core.read_into(None, CallMode::Default, output)
    }
}

impl<A: Payload, R: Payload> FunctionQualifiedRead<A, R> {
    pub fn execute(&self, input: &A, output: &mut R) -> ExecutionResult {
        self.core.read_into(Some(input), CallMode::Default, output)
    }
}

impl<R: Payload> FunctionVoidReturn<R> {
    /// Blocks until the result is available
    pub fn execute(&self, output: &mut R) -> ExecutionResult {
        self.core.read_into(None, CallMode::Default, output)
    }

    pub fn execute_timeout(&self, output: &mut R, timeout: Duration) -> ExecutionResult {
        self.core
            .read_into(None, CallMode::Blocking(Some(timeout)), output)
    }

    /// Returns at once; `on_finished` runs on the caller component's thread
    /// when the result arrives.
    pub fn execute_async<F>(&self, on_finished: F) -> ExecutionResult
    where
        F: FnOnce(ExecutionResult, Option<R>) + Send + 'static,
    {
        self.core.read_async(None, on_finished)
    }
}

impl<A: Payload, R: Payload> FunctionWriteReturn<A, R> {
    /// Blocks until the result is available
    pub fn execute(&self, input: &A, output: &mut R) -> ExecutionResult {
        self.core.read_into(Some(input), CallMode::Default, output)
    }

    pub fn execute_timeout(&self, input: &A, output: &mut R, timeout: Duration) -> ExecutionResult {
        self.core
            .read_into(Some(input), CallMode::Blocking(Some(timeout)), output)
    }

    pub fn execute_async<F>(&self, input: &A, on_finished: F) -> ExecutionResult
    where
        F: FnOnce(ExecutionResult, Option<R>) + Send + 'static,
    {
        self.core.read_async(Some(input), on_finished)
    }
}
