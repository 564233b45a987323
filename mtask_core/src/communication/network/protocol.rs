//! Messages exchanged between processes and with the global manager.

use crate::communication::command::CallKind;
use crate::communication::connection::{ConnectionDescription, ConnectionId, Endpoint};
use crate::communication::interface::InterfaceDescription;
use crate::core::component::ComponentDescription;
use crate::core::payload::Envelope;
use crate::core::result::ExecutionResult;
use crate::error::{MtaskError, MtaskResult};
use serde::{Deserialize, Serialize};

/// Correlates a response with its request on one link
pub type RequestId = u64;

/// Identifies one remote event subscription on the subscriber side
pub type SubscriptionId = u64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub name: String,
    pub address: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Request {
    Ping,

    // Served by every process
    Execute {
        component: String,
        interface: String,
        command: String,
        kind: CallKind,
        argument: Option<Envelope>,
    },
    Describe {
        component: String,
        interface: String,
    },
    Subscribe {
        component: String,
        interface: String,
        event: String,
        subscriber: String,
        subscription: SubscriptionId,
    },
    Unsubscribe {
        subscriber: String,
        subscription: SubscriptionId,
    },
    EventDelivery {
        subscription: SubscriptionId,
        payload: Option<Envelope>,
    },

    // Served by the global manager
    RegisterProcess {
        process: String,
        address: String,
    },
    UnregisterProcess {
        process: String,
    },
    RegisterComponent {
        process: String,
        component: ComponentDescription,
    },
    UnregisterComponent {
        process: String,
        component: String,
    },
    LookupInterface {
        process: String,
        component: String,
        interface: String,
    },
    Connect {
        required: Endpoint,
        provided: Endpoint,
    },
    Disconnect {
        id: ConnectionId,
    },
    ListProcesses,
    ListComponents {
        process: Option<String>,
    },
    ListConnections,
}

impl Request {
    pub fn kind(&self) -> &'static str {
        match self {
            Request::Ping => "ping",
            Request::Execute { .. } => "execute",
            Request::Describe { .. } => "describe",
            Request::Subscribe { .. } => "subscribe",
            Request::Unsubscribe { .. } => "unsubscribe",
            Request::EventDelivery { .. } => "event",
            Request::RegisterProcess { .. } => "register-process",
            Request::UnregisterProcess { .. } => "unregister-process",
            Request::RegisterComponent { .. } => "register-component",
            Request::UnregisterComponent { .. } => "unregister-component",
            Request::LookupInterface { .. } => "lookup-interface",
            Request::Connect { .. } => "connect",
            Request::Disconnect { .. } => "disconnect",
            Request::ListProcesses => "list-processes",
            Request::ListComponents { .. } => "list-components",
            Request::ListConnections => "list-connections",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Response {
    Done,
    Pong {
        process: String,
    },
    Executed {
        result: ExecutionResult,
        output: Option<Envelope>,
    },
    Interface(InterfaceDescription),
    Connected {
        id: ConnectionId,
        address: String,
        interface: InterfaceDescription,
    },
    Processes(Vec<ProcessInfo>),
    Components(Vec<(String, ComponentDescription)>),
    Connections(Vec<ConnectionDescription>),
    Error {
        code: ExecutionResult,
        message: String,
    },
}

impl Response {
    pub fn error(code: ExecutionResult, message: impl Into<String>) -> Self {
        Response::Error {
            code,
            message: message.into(),
        }
    }

    pub fn unsupported(request: &Request) -> Self {
        Response::error(
            ExecutionResult::Disabled,
            format!("'{}' is not served here", request.kind()),
        )
    }

    /// Turn an error response into an `MtaskError`
    pub fn into_result(self) -> MtaskResult<Response> {
        match self {
            Response::Error { code, message } => Err(match code {
                ExecutionResult::ComponentNotFound => MtaskError::NotFound(message),
                ExecutionResult::InvalidInputType => MtaskError::InvalidInput(message),
                ExecutionResult::Timeout => MtaskError::Timeout(message),
                ExecutionResult::NetworkError => MtaskError::Network(message),
                _ => MtaskError::Communication(message),
            }),
            other => Ok(other),
        }
    }
}

/// Unit carried by a transport
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Frame {
    Request { id: RequestId, request: Request },
    Response { id: RequestId, response: Response },
    /// One-way message, no response expected
    Notify(Request),
}
