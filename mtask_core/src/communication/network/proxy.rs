//! Requiring side of cross-process connections.
//!
//! A proxy interface mirrors a remote provided interface: each command
//! forwards calls through a [`RemoteInterface`] invoker and each event is a
//! local generator fed by the remote process.

use crate::communication::command::{CallKind, Command, RemoteInvoker};
use crate::communication::mailbox::CallReply;
use crate::communication::event::EventGenerator;
use crate::communication::interface::{InterfaceDescription, ProvidedInterface};
use crate::communication::mailbox::Completion;
use crate::communication::network::protocol::{Request, Response};
use crate::communication::network::transport::Transport;
use crate::core::payload::{Envelope, ReplyValue, TypeDescriptor};
use crate::core::result::ExecutionResult;
use crate::error::MtaskResult;
use std::sync::Arc;
use std::time::Duration;

/// Forwards command calls to one interface of a remote process
pub struct RemoteInterface {
    transport: Arc<dyn Transport>,
    address: String,
    component: String,
    interface: String,
    timeout: Duration,
}

impl RemoteInterface {
    pub fn new(
        transport: Arc<dyn Transport>,
        address: &str,
        component: &str,
        interface: &str,
        timeout: Duration,
    ) -> Self {
        Self {
            transport,
            address: address.to_string(),
            component: component.to_string(),
            interface: interface.to_string(),
            timeout,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    fn execute_request(
        &self,
        command: &str,
        kind: CallKind,
        argument: Option<Envelope>,
    ) -> Request {
        Request::Execute {
            component: self.component.clone(),
            interface: self.interface.clone(),
            command: command.to_string(),
            kind,
            argument,
        }
    }

    /// The remote side may wait up to `timeout_ms` for its own mailbox; allow
    /// for that on top of the link timeout.
    fn wait_for(&self, kind: CallKind) -> Duration {
        match kind {
            CallKind::Blocking {
                timeout_ms: Some(ms),
            } => self.timeout.max(Duration::from_millis(ms)),
            _ => self.timeout,
        }
    }

    fn roundtrip(
        transport: &dyn Transport,
        address: &str,
        request: Request,
        timeout: Duration,
    ) -> CallReply {
        Self::decode_reply(address, transport.request(address, request, timeout))
    }

    fn decode_reply(address: &str, reply: MtaskResult<Response>) -> CallReply {
        match reply {
            Ok(Response::Executed { result, output }) => (result, output.map(ReplyValue::Encoded)),
            Ok(Response::Error { code, message }) => {
                log::warn!("remote call to {} failed: {}", address, message);
                (code, None)
            }
            Ok(other) => {
                log::warn!("unexpected reply from {}: {:?}", address, other);
                (ExecutionResult::NetworkError, None)
            }
            Err(e) => {
                log::warn!("remote call to {} failed: {}", address, e);
                (e.execution_result(), None)
            }
        }
    }
}

impl RemoteInvoker for RemoteInterface {
    fn invoke(&self, command: &str, kind: CallKind, argument: Option<Envelope>) -> CallReply {
        match kind {
            CallKind::NonBlocking => {
                let request = self.execute_request(command, kind, argument);
                match self.transport.notify(&self.address, request) {
                    Ok(()) => (ExecutionResult::Queued, None),
                    Err(e) => {
                        log::warn!("remote call '{}' not sent: {}", command, e);
                        (e.execution_result(), None)
                    }
                }
            }
            CallKind::Blocking { .. } => {
                let timeout = self.wait_for(kind);
                let request = self.execute_request(command, kind, argument);
                Self::roundtrip(self.transport.as_ref(), &self.address, request, timeout)
            }
        }
    }

    fn invoke_async(
        &self,
        command: &str,
        argument: Option<Envelope>,
        completion: Completion,
    ) -> ExecutionResult {
        let kind = CallKind::Blocking { timeout_ms: None };
        let request = self.execute_request(command, kind, argument);
        let address = self.address.clone();
        self.transport.request_async(
            &self.address,
            request,
            self.timeout,
            Box::new(move |reply| {
                let (result, output) = Self::decode_reply(&address, reply);
                completion.complete(result, output);
            }),
        );
        ExecutionResult::Queued
    }
}

/// Build a local stand-in for a remote provided interface.
pub fn build_proxy_interface(
    description: &InterfaceDescription,
    invoker: Arc<RemoteInterface>,
) -> MtaskResult<Arc<ProvidedInterface>> {
    let proxy = Arc::new(ProvidedInterface::new(
        &description.component,
        &description.name,
        None,
    ));
    for command in &description.commands {
        proxy.insert_command(Command::remote(command, invoker.clone()))?;
    }
    for event in &description.events {
        proxy.insert_event(EventGenerator::new(
            &event.name,
            event.payload.clone().map(TypeDescriptor::remote),
        ))?;
    }
    Ok(proxy)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::communication::network::loopback::LoopbackNetwork;
    use crate::communication::network::transport::RequestHandler;

    fn calculator() -> Arc<dyn RequestHandler> {
        Arc::new(|request: Request| match request {
            Request::Execute {
                command, argument, ..
            } if command == "Square" => {
                let x: i32 = argument.unwrap().open_typed().unwrap();
                Response::Executed {
                    result: ExecutionResult::Succeeded,
                    output: Some(Envelope::seal_typed(&(x * x)).unwrap()),
                }
            }
            Request::Execute { .. } => Response::Executed {
                result: ExecutionResult::FunctionNotBound,
                output: None,
            },
            other => Response::unsupported(&other),
        })
    }

    #[test]
    fn test_blocking_invoke_returns_encoded_output() {
        let net = LoopbackNetwork::new();
        net.listen("calc", calculator()).unwrap();
        let remote = RemoteInterface::new(net, "calc", "calc", "Api", Duration::from_secs(1));
        let (result, output) = remote.invoke(
            "Square",
            CallKind::Blocking { timeout_ms: None },
            Some(Envelope::seal_typed(&7i32).unwrap()),
        );
        assert_eq!(result, ExecutionResult::Succeeded);
        assert_eq!(output.unwrap().into_typed::<i32>().unwrap(), 49);

        let (result, _) = remote.invoke("Cube", CallKind::Blocking { timeout_ms: None }, None);
        assert_eq!(result, ExecutionResult::FunctionNotBound);
    }

    #[test]
    fn test_unreachable_process_is_network_error() {
        let net = LoopbackNetwork::new();
        let remote = RemoteInterface::new(net, "gone", "calc", "Api", Duration::from_secs(1));
        let (result, _) = remote.invoke("Square", CallKind::NonBlocking, None);
        assert_eq!(result, ExecutionResult::NetworkError);
        let (result, _) = remote.invoke("Square", CallKind::Blocking { timeout_ms: None }, None);
        assert_eq!(result, ExecutionResult::NetworkError);
    }

    #[test]
    fn test_async_invoke_completes_once() {
        let net = LoopbackNetwork::new();
        net.listen("calc", calculator()).unwrap();
        let remote = RemoteInterface::new(net, "calc", "calc", "Api", Duration::from_secs(1));
        let (tx, rx) = crossbeam::channel::bounded(1);
        let completion = Completion::new("Square", None, move |result, output| {
            let value = output.and_then(|o: ReplyValue| o.into_typed::<i32>().ok());
            let _ = tx.send((result, value));
        });
        let queued =
            remote.invoke_async("Square", Some(Envelope::seal_typed(&3i32).unwrap()), completion);
        assert_eq!(queued, ExecutionResult::Queued);
        let (result, value) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(result, ExecutionResult::Succeeded);
        assert_eq!(value, Some(9));
    }
}
