//! Providing side of cross-process connections.
//!
//! Every networked process serves a [`ProcessService`]: it executes commands
//! on behalf of remote functions, describes interfaces, installs event
//! forwarders for remote subscribers and routes incoming event deliveries to
//! local subscriptions.

use crate::communication::command::CallKind;
use crate::communication::event::{EventGenerator, EventHandler};
use crate::communication::interface::ProvidedInterface;
use crate::communication::network::protocol::{Request, Response, SubscriptionId};
use crate::communication::network::transport::{RequestHandler, Transport};
use crate::core::payload::{Envelope, Value};
use crate::core::result::ExecutionResult;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Lookup of the provided interfaces of this process
pub trait InterfaceDirectory: Send + Sync {
    fn provided_interface(&self, component: &str, interface: &str)
        -> Option<Arc<ProvidedInterface>>;
}

struct Forwarder {
    generator: Arc<EventGenerator>,
    handler_id: u64,
}

pub struct ProcessService {
    process: String,
    directory: Weak<dyn InterfaceDirectory>,
    transport: Arc<dyn Transport>,
    blocking_timeout: Duration,
    /// Installed for remote subscribers, keyed by (subscriber, subscription)
    forwarders: RwLock<HashMap<(String, SubscriptionId), Forwarder>>,
    /// Local proxy generators fed by remote providers
    subscriptions: RwLock<HashMap<SubscriptionId, Arc<EventGenerator>>>,
}

impl ProcessService {
    pub fn new(
        process: &str,
        directory: Weak<dyn InterfaceDirectory>,
        transport: Arc<dyn Transport>,
        blocking_timeout: Duration,
    ) -> Self {
        Self {
            process: process.to_string(),
            directory,
            transport,
            blocking_timeout,
            forwarders: RwLock::new(HashMap::new()),
            subscriptions: RwLock::new(HashMap::new()),
        }
    }

    pub fn process(&self) -> &str {
        &self.process
    }

    /// Route deliveries for `subscription` into `generator`
    pub fn add_subscription(&self, subscription: SubscriptionId, generator: Arc<EventGenerator>) {
        self.subscriptions.write().insert(subscription, generator);
    }

    pub fn remove_subscription(&self, subscription: SubscriptionId) -> bool {
        self.subscriptions.write().remove(&subscription).is_some()
    }

    pub fn forwarder_count(&self) -> usize {
        self.forwarders.read().len()
    }

    fn interface(&self, component: &str, interface: &str) -> Result<Arc<ProvidedInterface>, Response> {
        let directory = self.directory.upgrade().ok_or_else(|| {
            Response::error(ExecutionResult::Disabled, "process is shutting down")
        })?;
        directory
            .provided_interface(component, interface)
            .ok_or_else(|| {
                Response::error(
                    ExecutionResult::ComponentNotFound,
                    format!(
                        "no provided interface '{}.{}' in process '{}'",
                        component, interface, self.process
                    ),
                )
            })
    }

    fn execute(
        &self,
        component: &str,
        interface: &str,
        command: &str,
        kind: CallKind,
        argument: Option<Envelope>,
    ) -> Response {
        let provided = match self.interface(component, interface) {
            Ok(provided) => provided,
            Err(response) => return response,
        };
        let command = match provided.command(command) {
            Some(command) => command,
            None => {
                return Response::Executed {
                    result: ExecutionResult::FunctionNotBound,
                    output: None,
                }
            }
        };
        let argument = match (command.argument_type(), argument) {
            (Some(descriptor), Some(envelope)) => match descriptor.open(&envelope) {
                Ok(value) => Some(value),
                Err(code) => {
                    return Response::Executed {
                        result: code,
                        output: None,
                    }
                }
            },
            (Some(_), None) => {
                return Response::Executed {
                    result: ExecutionResult::InvalidInputType,
                    output: None,
                }
            }
            (None, _) => None,
        };
        let kind = match kind {
            CallKind::Blocking { timeout_ms: None } => CallKind::Blocking {
                timeout_ms: Some(self.blocking_timeout.as_millis() as u64),
            },
            other => other,
        };
        let (result, output) = command.call(argument.as_deref(), kind.mode());
        let output = match output.map(|o| o.into_envelope()).transpose() {
            Ok(output) => output,
            Err(e) => {
                log::warn!("cannot serialize result of '{}': {}", command.name(), e);
                return Response::Executed {
                    result: ExecutionResult::InvalidInputType,
                    output: None,
                };
            }
        };
        Response::Executed { result, output }
    }

    fn subscribe(
        &self,
        component: &str,
        interface: &str,
        event: &str,
        subscriber: String,
        subscription: SubscriptionId,
    ) -> Response {
        let provided = match self.interface(component, interface) {
            Ok(provided) => provided,
            Err(response) => return response,
        };
        let generator = match provided.event(event) {
            Some(generator) => generator,
            None => {
                return Response::error(
                    ExecutionResult::FunctionNotBound,
                    format!("no event '{}' on '{}.{}'", event, component, interface),
                )
            }
        };

        let transport = self.transport.clone();
        let target = subscriber.clone();
        let name = event.to_string();
        let forward = Arc::new(move |payload: Option<&dyn Value>| {
            let payload = match payload.map(Envelope::seal).transpose() {
                Ok(payload) => payload,
                Err(e) => {
                    log::warn!("cannot serialize event '{}': {}", name, e);
                    return None;
                }
            };
            if let Err(e) = transport.notify(
                &target,
                Request::EventDelivery {
                    subscription,
                    payload,
                },
            ) {
                log::warn!("event '{}' not forwarded to {}: {}", name, target, e);
            }
            None
        });
        let handler = Arc::new(EventHandler::new(
            event,
            generator.payload_type().cloned(),
            forward,
            None,
        ));
        if let Err(e) = generator.add_handler(&handler) {
            return Response::error(e.execution_result(), e.to_string());
        }
        log::info!(
            "{}: forwarding {}.{}.{} to {} (#{})",
            self.process,
            component,
            interface,
            event,
            subscriber,
            subscription
        );
        let previous = self.forwarders.write().insert(
            (subscriber, subscription),
            Forwarder {
                generator,
                handler_id: handler.id(),
            },
        );
        if let Some(previous) = previous {
            previous.generator.remove_handler(previous.handler_id);
        }
        Response::Done
    }

    fn unsubscribe(&self, subscriber: String, subscription: SubscriptionId) -> Response {
        match self.forwarders.write().remove(&(subscriber, subscription)) {
            Some(forwarder) => {
                forwarder.generator.remove_handler(forwarder.handler_id);
                Response::Done
            }
            None => Response::error(
                ExecutionResult::ComponentNotFound,
                format!("no subscription #{}", subscription),
            ),
        }
    }

    fn deliver(&self, subscription: SubscriptionId, payload: Option<Envelope>) -> Response {
        let generator = self.subscriptions.read().get(&subscription).cloned();
        match generator {
            Some(generator) => {
                let result = generator.fire_encoded(payload.as_ref());
                if result.is_err() {
                    return Response::error(result, format!("event '{}' rejected", generator.name()));
                }
                Response::Done
            }
            None => Response::error(
                ExecutionResult::ComponentNotFound,
                format!("no local subscription #{}", subscription),
            ),
        }
    }

    /// Drop every forwarder installed for remote subscribers
    pub fn clear(&self) {
        for (_, forwarder) in self.forwarders.write().drain() {
            forwarder.generator.remove_handler(forwarder.handler_id);
        }
        self.subscriptions.write().clear();
    }
}

impl RequestHandler for ProcessService {
    fn handle(&self, request: Request) -> Response {
        match request {
            Request::Ping => Response::Pong {
                process: self.process.clone(),
            },
            Request::Execute {
                component,
                interface,
                command,
                kind,
                argument,
            } => self.execute(&component, &interface, &command, kind, argument),
            Request::Describe {
                component,
                interface,
            } => match self.interface(&component, &interface) {
                Ok(provided) => Response::Interface(provided.describe()),
                Err(response) => response,
            },
            Request::Subscribe {
                component,
                interface,
                event,
                subscriber,
                subscription,
            } => self.subscribe(&component, &interface, &event, subscriber, subscription),
            Request::Unsubscribe {
                subscriber,
                subscription,
            } => self.unsubscribe(subscriber, subscription),
            Request::EventDelivery {
                subscription,
                payload,
            } => self.deliver(subscription, payload),
            other => Response::unsupported(&other),
        }
    }
}

impl std::fmt::Debug for ProcessService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessService")
            .field("process", &self.process)
            .field("forwarders", &self.forwarder_count())
            .field("subscriptions", &self.subscriptions.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::communication::command::CallKind;
    use crate::communication::network::loopback::LoopbackNetwork;
    use crate::core::payload::{TypeDescriptor, TypeTag};
    use std::sync::atomic::{AtomicI64, Ordering};

    struct OneInterface(Arc<ProvidedInterface>);

    impl InterfaceDirectory for OneInterface {
        fn provided_interface(
            &self,
            component: &str,
            interface: &str,
        ) -> Option<Arc<ProvidedInterface>> {
            (component == self.0.component() && interface == self.0.name()).then(|| self.0.clone())
        }
    }

    fn service(net: &Arc<LoopbackNetwork>, provided: Arc<ProvidedInterface>) -> (Arc<OneInterface>, ProcessService) {
        let directory = Arc::new(OneInterface(provided));
        let weak: Weak<dyn InterfaceDirectory> = Arc::downgrade(&directory) as Weak<dyn InterfaceDirectory>;
        let transport: Arc<dyn Transport> = net.clone();
        (
            directory,
            ProcessService::new("p1", weak, transport, Duration::from_secs(1)),
        )
    }

    #[test]
    fn test_execute_decodes_and_encodes() {
        let provided = Arc::new(ProvidedInterface::new("calc", "Api", None));
        provided
            .add_command_write_return("Double", |x: &i64| x * 2)
            .unwrap();
        let net = LoopbackNetwork::new();
        let (_directory, service) = service(&net, provided);

        let response = service.handle(Request::Execute {
            component: "calc".to_string(),
            interface: "Api".to_string(),
            command: "Double".to_string(),
            kind: CallKind::Blocking { timeout_ms: None },
            argument: Some(Envelope::seal_typed(&21i64).unwrap()),
        });
        match response {
            Response::Executed { result, output } => {
                assert_eq!(result, ExecutionResult::Succeeded);
                assert_eq!(output.unwrap().open_typed::<i64>().unwrap(), 42);
            }
            other => panic!("unexpected {:?}", other),
        }

        let response = service.handle(Request::Execute {
            component: "calc".to_string(),
            interface: "Api".to_string(),
            command: "Double".to_string(),
            kind: CallKind::NonBlocking,
            argument: Some(Envelope::seal_typed(&1.5f32).unwrap()),
        });
        assert_eq!(
            response,
            Response::Executed {
                result: ExecutionResult::InvalidInputType,
                output: None
            }
        );

        match service.handle(Request::Describe {
            component: "calc".to_string(),
            interface: "Missing".to_string(),
        }) {
            Response::Error { code, .. } => assert_eq!(code, ExecutionResult::ComponentNotFound),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_subscription_forwards_events() {
        let provided = Arc::new(ProvidedInterface::new("arm", "Status", None));
        let moved = provided.add_event_write::<i64>("Moved").unwrap();
        let net = LoopbackNetwork::new();
        let (_directory, provider) = service(&net, provided.clone());

        // Subscriber process with one proxy generator
        let other = Arc::new(ProvidedInterface::new("none", "None", None));
        let (_sub_directory, subscriber) = service(&net, other);
        let subscriber = Arc::new(subscriber);
        let proxy = Arc::new(EventGenerator::new(
            "Moved",
            Some(TypeDescriptor::remote(TypeTag::of::<i64>())),
        ));
        let seen = Arc::new(AtomicI64::new(0));
        let sink = seen.clone();
        proxy
            .add_handler(&Arc::new(EventHandler::new(
                "Moved",
                Some(TypeDescriptor::of::<i64>()),
                Arc::new(move |p| {
                    if let Some(v) = p.and_then(|p| p.as_any().downcast_ref::<i64>()) {
                        sink.store(*v, Ordering::SeqCst);
                    }
                    None
                }),
                None,
            )))
            .unwrap();
        subscriber.add_subscription(7, proxy);
        net.listen("p2", subscriber.clone()).unwrap();

        let response = provider.handle(Request::Subscribe {
            component: "arm".to_string(),
            interface: "Status".to_string(),
            event: "Moved".to_string(),
            subscriber: "p2".to_string(),
            subscription: 7,
        });
        assert_eq!(response, Response::Done);
        assert_eq!(provider.forwarder_count(), 1);

        moved.fire(&-12);
        assert_eq!(seen.load(Ordering::SeqCst), -12);

        assert_eq!(
            provider.handle(Request::Unsubscribe {
                subscriber: "p2".to_string(),
                subscription: 7
            }),
            Response::Done
        );
        moved.fire(&5);
        assert_eq!(seen.load(Ordering::SeqCst), -12);
    }
}
