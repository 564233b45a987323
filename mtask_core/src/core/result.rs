use serde::{Deserialize, Serialize};
use std::fmt;

/// Outcome of every command, function, event and proxy call.
///
/// The set is closed: callers can match exhaustively and distributed calls
/// surface exactly the same codes as local ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExecutionResult {
    /// The command ran to completion
    Succeeded,
    /// The invocation was appended to the target mailbox and will run later
    Queued,
    /// The command or its owning component no longer accepts calls
    Disabled,
    /// The function is not bound to any command
    FunctionNotBound,
    /// The supplied argument type does not match the command prototype
    InvalidInputType,
    /// A blocking call or a remote reply did not complete in time
    Timeout,
    /// Transport failure while talking to another process
    NetworkError,
    /// Connection endpoints could not be resolved
    ComponentNotFound,
    /// The target mailbox was full and the entry was dropped
    MailboxFull,
    /// The command body panicked; its component keeps running
    CommandFailed,
}

impl ExecutionResult {
    /// `Succeeded` or `Queued`
    pub fn is_ok(&self) -> bool {
        matches!(self, ExecutionResult::Succeeded | ExecutionResult::Queued)
    }

    pub fn is_err(&self) -> bool {
        !self.is_ok()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Succeeded => "SUCCEEDED",
            Self::Queued => "QUEUED",
            Self::Disabled => "DISABLED",
            Self::FunctionNotBound => "FUNCTION_NOT_BOUND",
            Self::InvalidInputType => "INVALID_INPUT_TYPE",
            Self::Timeout => "TIMEOUT",
            Self::NetworkError => "NETWORK_ERROR",
            Self::ComponentNotFound => "COMPONENT_NOT_FOUND",
            Self::MailboxFull => "MAILBOX_FULL",
            Self::CommandFailed => "COMMAND_FAILED",
        }
    }
}

impl fmt::Display for ExecutionResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
