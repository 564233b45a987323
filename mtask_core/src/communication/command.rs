//! Commands: named, typed units of work offered by a provided interface.
//!
//! A command either runs its body in the caller's thread (direct) or appends an
//! invocation to the owning component's mailbox (queued). Read and qualified
//! read commands are always direct. A command may also stand in for a command
//! living in another process, in which case calls are forwarded through a
//! [`RemoteInvoker`].

use crate::communication::mailbox::{
    run_handler, CallReply, Completion, Handler, Mailbox, MailboxEntry, Reply,
};
use crate::core::payload::{Envelope, ReplyValue, TypeDescriptor, TypeTag, Value};
use crate::core::result::ExecutionResult;
use crossbeam::channel::{bounded, RecvTimeoutError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Arity and result shape of a command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommandRole {
    Void,
    Read,
    Write,
    QualifiedRead,
    VoidReturn,
    WriteReturn,
}

impl CommandRole {
    pub fn takes_argument(&self) -> bool {
        matches!(
            self,
            CommandRole::Write | CommandRole::QualifiedRead | CommandRole::WriteReturn
        )
    }

    pub fn has_result(&self) -> bool {
        matches!(
            self,
            CommandRole::Read
                | CommandRole::QualifiedRead
                | CommandRole::VoidReturn
                | CommandRole::WriteReturn
        )
    }

    /// Roles that never go through a mailbox
    pub fn is_always_direct(&self) -> bool {
        matches!(self, CommandRole::Read | CommandRole::QualifiedRead)
    }

    /// Roles whose default call blocks until the result is available
    pub fn blocks_by_default(&self) -> bool {
        matches!(self, CommandRole::VoidReturn | CommandRole::WriteReturn)
    }
}

impl fmt::Display for CommandRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CommandRole::Void => "Void",
            CommandRole::Read => "Read",
            CommandRole::Write => "Write",
            CommandRole::QualifiedRead => "QualifiedRead",
            CommandRole::VoidReturn => "VoidReturn",
            CommandRole::WriteReturn => "WriteReturn",
        };
        f.write_str(name)
    }
}

/// Caller-requested semantics of one call
pub enum CallMode {
    /// Role default: queued roles return `Queued`, return-value roles block
    Default,
    /// Wait for the owner thread to run the call, optionally bounded
    Blocking(Option<Duration>),
    /// Return immediately and report through the completion
    Async(Completion),
}

impl fmt::Debug for CallMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallMode::Default => write!(f, "Default"),
            CallMode::Blocking(timeout) => write!(f, "Blocking({:?})", timeout),
            CallMode::Async(_) => write!(f, "Async"),
        }
    }
}

/// Call kind carried to the providing process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallKind {
    NonBlocking,
    Blocking { timeout_ms: Option<u64> },
}

impl CallKind {
    pub fn mode(&self) -> CallMode {
        match self {
            CallKind::NonBlocking => CallMode::Default,
            CallKind::Blocking { timeout_ms } => {
                CallMode::Blocking(timeout_ms.map(Duration::from_millis))
            }
        }
    }
}

/// Forwards calls to a command owned by another process.
pub trait RemoteInvoker: Send + Sync {
    /// Round trip; blocks until the reply, a network failure or the request timeout.
    fn invoke(&self, command: &str, kind: CallKind, argument: Option<Envelope>) -> CallReply;

    /// Send the request and report the reply through `completion`.
    fn invoke_async(
        &self,
        command: &str,
        argument: Option<Envelope>,
        completion: Completion,
    ) -> ExecutionResult;
}

/// Serializable summary of a command (introspection and remote prototypes)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandDescription {
    pub name: String,
    pub role: CommandRole,
    pub argument: Option<TypeTag>,
    pub result: Option<TypeTag>,
}

enum CommandTarget {
    Local {
        handler: Handler,
        mailbox: Option<Mailbox>,
    },
    Remote(Arc<dyn RemoteInvoker>),
}

pub struct Command {
    name: String,
    role: CommandRole,
    argument: Option<TypeDescriptor>,
    result: Option<TypeDescriptor>,
    target: CommandTarget,
    enabled: AtomicBool,
}

impl Command {
    /// Command backed by a local handler. With a mailbox, non-read roles are queued.
    pub fn local(
        name: impl Into<String>,
        role: CommandRole,
        argument: Option<TypeDescriptor>,
        result: Option<TypeDescriptor>,
        handler: Handler,
        mailbox: Option<Mailbox>,
    ) -> Self {
        Self {
            name: name.into(),
            role,
            argument,
            result,
            target: CommandTarget::Local { handler, mailbox },
            enabled: AtomicBool::new(true),
        }
    }

    /// Proxy command built from a remote description
    pub fn remote(description: &CommandDescription, invoker: Arc<dyn RemoteInvoker>) -> Self {
        Self {
            name: description.name.clone(),
            role: description.role,
            argument: description.argument.clone().map(TypeDescriptor::remote),
            result: description.result.clone().map(TypeDescriptor::remote),
            target: CommandTarget::Remote(invoker),
            enabled: AtomicBool::new(true),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn role(&self) -> CommandRole {
        self.role
    }

    pub fn argument_type(&self) -> Option<&TypeDescriptor> {
        self.argument.as_ref()
    }

    pub fn result_type(&self) -> Option<&TypeDescriptor> {
        self.result.as_ref()
    }

    pub fn is_queued(&self) -> bool {
        match &self.target {
            CommandTarget::Local { mailbox, .. } => {
                mailbox.is_some() && !self.role.is_always_direct()
            }
            CommandTarget::Remote(_) => false,
        }
    }

    pub fn is_remote(&self) -> bool {
        matches!(self.target, CommandTarget::Remote(_))
    }

    pub fn enable(&self) {
        self.enabled.store(true, Ordering::Release);
    }

    pub fn disable(&self) {
        self.enabled.store(false, Ordering::Release);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn describe(&self) -> CommandDescription {
        CommandDescription {
            name: self.name.clone(),
            role: self.role,
            argument: self.argument.as_ref().map(|d| d.tag().clone()),
            result: self.result.as_ref().map(|d| d.tag().clone()),
        }
    }

    /// Execute the command. Failures are encoded in the returned result.
    pub fn call(&self, argument: Option<&dyn Value>, mode: CallMode) -> CallReply {
        if !self.is_enabled() {
            return (ExecutionResult::Disabled, None);
        }
        match (&self.argument, argument) {
            (None, _) => {}
            (Some(expected), Some(arg)) if expected.matches_value(arg) => {}
            (Some(expected), supplied) => {
                log::debug!(
                    "command '{}' expects {}, got {}",
                    self.name,
                    expected.tag(),
                    supplied
                        .map(|a| a.type_tag().to_string())
                        .unwrap_or_else(|| "nothing".to_string())
                );
                return (ExecutionResult::InvalidInputType, None);
            }
        }
        let argument = if self.argument.is_some() { argument } else { None };

        match &self.target {
            CommandTarget::Local { handler, mailbox } => {
                let queue = mailbox.as_ref().filter(|_| !self.role.is_always_direct());
                match queue {
                    Some(mailbox) => self.call_queued(handler, mailbox, argument, mode),
                    None => self.call_direct(handler, argument, mode),
                }
            }
            CommandTarget::Remote(invoker) => self.call_remote(invoker.as_ref(), argument, mode),
        }
    }

    fn call_direct(
        &self,
        handler: &Handler,
        argument: Option<&dyn Value>,
        mode: CallMode,
    ) -> CallReply {
        let output = match run_handler(handler, argument) {
            Ok(output) => output.map(ReplyValue::Local),
            Err(message) => {
                log::error!("command '{}' panicked: {}", self.name, message);
                if let CallMode::Async(completion) = mode {
                    completion.complete(ExecutionResult::CommandFailed, None);
                }
                return (ExecutionResult::CommandFailed, None);
            }
        };
        if self.role.has_result() && output.is_none() {
            // Nothing to return (e.g. a state column without committed rows)
            if let CallMode::Async(completion) = mode {
                completion.complete(ExecutionResult::Disabled, None);
            }
            return (ExecutionResult::Disabled, None);
        }
        match mode {
            CallMode::Async(completion) => {
                completion.complete(ExecutionResult::Succeeded, output);
                (ExecutionResult::Succeeded, None)
            }
            _ => (ExecutionResult::Succeeded, output),
        }
    }

    fn call_queued(
        &self,
        handler: &Handler,
        mailbox: &Mailbox,
        argument: Option<&dyn Value>,
        mode: CallMode,
    ) -> CallReply {
        let mode = match mode {
            CallMode::Default if self.role.blocks_by_default() => CallMode::Blocking(None),
            other => other,
        };
        let owned = argument.map(|a| a.clone_value());

        match mode {
            CallMode::Default => {
                let entry = MailboxEntry::invoke(&self.name, handler.clone(), owned, Reply::None);
                (mailbox.push(entry), None)
            }
            CallMode::Async(completion) => {
                let entry = MailboxEntry::invoke(
                    &self.name,
                    handler.clone(),
                    owned,
                    Reply::Finished(completion),
                );
                (mailbox.push(entry), None)
            }
            CallMode::Blocking(timeout) => {
                if mailbox.is_owner_thread() {
                    // Waiting on our own mailbox would never return
                    return self.call_direct(handler, argument, CallMode::Default);
                }
                let (tx, rx) = bounded(1);
                let entry =
                    MailboxEntry::invoke(&self.name, handler.clone(), owned, Reply::Blocking(tx));
                let pushed = mailbox.push(entry);
                if pushed != ExecutionResult::Queued {
                    return (pushed, None);
                }
                let received = match timeout {
                    Some(timeout) => rx.recv_timeout(timeout),
                    None => rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
                };
                match received {
                    Ok(reply) => reply,
                    Err(RecvTimeoutError::Timeout) => {
                        log::warn!(
                            "blocking call to '{}' timed out after {:?}",
                            self.name,
                            timeout
                        );
                        (ExecutionResult::Timeout, None)
                    }
                    // Entry dropped without a reply: the target went away
                    Err(RecvTimeoutError::Disconnected) => (ExecutionResult::Disabled, None),
                }
            }
        }
    }

    fn call_remote(
        &self,
        invoker: &dyn RemoteInvoker,
        argument: Option<&dyn Value>,
        mode: CallMode,
    ) -> CallReply {
        let envelope = match argument.map(Envelope::seal).transpose() {
            Ok(envelope) => envelope,
            Err(e) => {
                log::warn!("cannot serialize argument of '{}': {}", self.name, e);
                return (ExecutionResult::InvalidInputType, None);
            }
        };
        match mode {
            CallMode::Async(completion) => {
                (invoker.invoke_async(&self.name, envelope, completion), None)
            }
            CallMode::Blocking(timeout) => invoker.invoke(
                &self.name,
                CallKind::Blocking {
                    timeout_ms: timeout.map(|t| t.as_millis() as u64),
                },
                envelope,
            ),
            CallMode::Default if self.role.blocks_by_default() || self.role.is_always_direct() => {
                invoker.invoke(
                    &self.name,
                    CallKind::Blocking { timeout_ms: None },
                    envelope,
                )
            }
            CallMode::Default => invoker.invoke(&self.name, CallKind::NonBlocking, envelope),
        }
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("name", &self.name)
            .field("role", &self.role)
            .field("queued", &self.is_queued())
            .field("remote", &self.is_remote())
            .field("enabled", &self.is_enabled())
            .finish()
    }
}
