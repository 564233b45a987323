//! Global component manager: the registry of processes, components and
//! cross-process connections, plus the client used to query it.

use crate::communication::connection::{ConnectionDescription, ConnectionId, Endpoint};
use crate::communication::interface::InterfaceDescription;
use crate::communication::network::protocol::{ProcessInfo, Request, Response};
use crate::communication::network::transport::{RequestHandler, Transport};
use crate::core::component::ComponentDescription;
use crate::core::result::ExecutionResult;
use crate::error::{MtaskError, MtaskResult};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Name the global manager answers pings with
pub const GLOBAL_PROCESS_NAME: &str = "global";

#[derive(Default)]
struct Registry {
    processes: BTreeMap<String, String>,
    components: BTreeMap<(String, String), ComponentDescription>,
    connections: BTreeMap<ConnectionId, ConnectionDescription>,
}

impl Registry {
    fn touches(connection: &ConnectionDescription, process: &str, component: Option<&str>) -> bool {
        [&connection.required, &connection.provided].iter().any(|ep| {
            ep.process == process && component.map(|c| ep.component == c).unwrap_or(true)
        })
    }

    fn drop_connections(&mut self, process: &str, component: Option<&str>) -> usize {
        let before = self.connections.len();
        self.connections
            .retain(|_, c| !Self::touches(c, process, component));
        before - self.connections.len()
    }
}

/// What a requiring process needs to build its proxy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionPlan {
    pub id: ConnectionId,
    pub address: String,
    pub interface: InterfaceDescription,
}

pub struct GlobalManager {
    registry: RwLock<Registry>,
    next_connection: AtomicU64,
}

impl Default for GlobalManager {
    fn default() -> Self {
        Self::new()
    }
}

impl GlobalManager {
    pub fn new() -> Self {
        Self {
            registry: RwLock::new(Registry::default()),
            next_connection: AtomicU64::new(1),
        }
    }

    /// Serve the registry on `address`; returns the address peers should use
    pub fn serve(self: &Arc<Self>, transport: &Arc<dyn Transport>, address: &str) -> MtaskResult<String> {
        let address = transport.listen(address, self.clone())?;
        log::info!("global component manager serving on {} ({})", address, transport.name());
        Ok(address)
    }

    /// Add a process. Registering a name again replaces the old entry along
    /// with its components and connections (the process restarted).
    pub fn register_process(&self, process: &str, address: &str) -> MtaskResult<()> {
        if process.is_empty() || address.is_empty() {
            return Err(MtaskError::invalid_input("process name and address are required"));
        }
        let mut registry = self.registry.write();
        if let Some(old) = registry.processes.insert(process.to_string(), address.to_string()) {
            log::warn!("process '{}' re-registered ({} -> {})", process, old, address);
            registry.components.retain(|(p, _), _| p != process);
            registry.drop_connections(process, None);
        } else {
            log::info!("process '{}' registered at {}", process, address);
        }
        Ok(())
    }

    pub fn unregister_process(&self, process: &str) -> bool {
        let mut registry = self.registry.write();
        if registry.processes.remove(process).is_none() {
            return false;
        }
        registry.components.retain(|(p, _), _| p != process);
        let dropped = registry.drop_connections(process, None);
        log::info!(
            "process '{}' unregistered ({} connections dropped)",
            process,
            dropped
        );
        true
    }

    pub fn register_component(
        &self,
        process: &str,
        component: ComponentDescription,
    ) -> MtaskResult<()> {
        let mut registry = self.registry.write();
        if !registry.processes.contains_key(process) {
            return Err(MtaskError::not_found(format!("process '{}'", process)));
        }
        log::debug!("component '{}:{}' registered", process, component.name);
        registry
            .components
            .insert((process.to_string(), component.name.clone()), component);
        Ok(())
    }

    pub fn unregister_component(&self, process: &str, component: &str) -> bool {
        let mut registry = self.registry.write();
        let removed = registry
            .components
            .remove(&(process.to_string(), component.to_string()))
            .is_some();
        if removed {
            registry.drop_connections(process, Some(component));
        }
        removed
    }

    pub fn process_address(&self, process: &str) -> MtaskResult<String> {
        self.registry
            .read()
            .processes
            .get(process)
            .cloned()
            .ok_or_else(|| MtaskError::not_found(format!("process '{}'", process)))
    }

    pub fn lookup_interface(
        &self,
        process: &str,
        component: &str,
        interface: &str,
    ) -> MtaskResult<InterfaceDescription> {
        let registry = self.registry.read();
        let description = registry
            .components
            .get(&(process.to_string(), component.to_string()))
            .ok_or_else(|| MtaskError::not_found(format!("component '{}:{}'", process, component)))?;
        description
            .provided
            .iter()
            .find(|i| i.name == interface)
            .cloned()
            .ok_or_else(|| {
                MtaskError::not_found(format!(
                    "provided interface '{}:{}.{}'",
                    process, component, interface
                ))
            })
    }

    /// Validate both ends and record the connection
    pub fn connect(&self, required: &Endpoint, provided: &Endpoint) -> MtaskResult<ConnectionPlan> {
        let interface =
            self.lookup_interface(&provided.process, &provided.component, &provided.interface)?;
        let address = self.process_address(&provided.process)?;
        let mut registry = self.registry.write();
        let requirer = registry
            .components
            .get(&(required.process.clone(), required.component.clone()))
            .ok_or_else(|| {
                MtaskError::not_found(format!(
                    "component '{}:{}'",
                    required.process, required.component
                ))
            })?;
        if !requirer.required.iter().any(|r| r.name == required.interface) {
            return Err(MtaskError::not_found(format!(
                "required interface '{}'",
                required
            )));
        }
        let id = self.next_connection.fetch_add(1, Ordering::Relaxed);
        let description = ConnectionDescription {
            id,
            required: required.clone(),
            provided: provided.clone(),
        };
        log::info!("connection {} brokered", description);
        registry.connections.insert(id, description);
        Ok(ConnectionPlan {
            id,
            address,
            interface,
        })
    }

    pub fn disconnect(&self, id: ConnectionId) -> bool {
        self.registry.write().connections.remove(&id).is_some()
    }

    pub fn processes(&self) -> Vec<ProcessInfo> {
        self.registry
            .read()
            .processes
            .iter()
            .map(|(name, address)| ProcessInfo {
                name: name.clone(),
                address: address.clone(),
            })
            .collect()
    }

    pub fn components(&self, process: Option<&str>) -> Vec<(String, ComponentDescription)> {
        self.registry
            .read()
            .components
            .iter()
            .filter(|((p, _), _)| process.map(|want| want == p).unwrap_or(true))
            .map(|((p, _), d)| (p.clone(), d.clone()))
            .collect()
    }

    pub fn connections(&self) -> Vec<ConnectionDescription> {
        self.registry.read().connections.values().cloned().collect()
    }
}

fn error_response(e: MtaskError) -> Response {
    Response::error(e.execution_result(), e.to_string())
}

fn done(outcome: MtaskResult<()>) -> Response {
    match outcome {
        Ok(()) => Response::Done,
        Err(e) => error_response(e),
    }
}

fn found(found: bool, what: String) -> Response {
    if found {
        Response::Done
    } else {
        Response::error(ExecutionResult::ComponentNotFound, format!("{} not registered", what))
    }
}

impl RequestHandler for GlobalManager {
    fn handle(&self, request: Request) -> Response {
        match request {
            Request::Ping => Response::Pong {
                process: GLOBAL_PROCESS_NAME.to_string(),
            },
            Request::RegisterProcess { process, address } => {
                done(self.register_process(&process, &address))
            }
            Request::UnregisterProcess { process } => {
                let removed = self.unregister_process(&process);
                found(removed, format!("process '{}'", process))
            }
            Request::RegisterComponent { process, component } => {
                done(self.register_component(&process, component))
            }
            Request::UnregisterComponent { process, component } => {
                let removed = self.unregister_component(&process, &component);
                found(removed, format!("component '{}:{}'", process, component))
            }
            Request::LookupInterface {
                process,
                component,
                interface,
            } => match self.lookup_interface(&process, &component, &interface) {
                Ok(description) => Response::Interface(description),
                Err(e) => error_response(e),
            },
            Request::Connect { required, provided } => match self.connect(&required, &provided) {
                Ok(plan) => Response::Connected {
                    id: plan.id,
                    address: plan.address,
                    interface: plan.interface,
                },
                Err(e) => error_response(e),
            },
            Request::Disconnect { id } => {
                let removed = self.disconnect(id);
                found(removed, format!("connection #{}", id))
            }
            Request::ListProcesses => Response::Processes(self.processes()),
            Request::ListComponents { process } => {
                Response::Components(self.components(process.as_deref()))
            }
            Request::ListConnections => Response::Connections(self.connections()),
            other => Response::unsupported(&other),
        }
    }
}

impl std::fmt::Debug for GlobalManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let registry = self.registry.read();
        f.debug_struct("GlobalManager")
            .field("processes", &registry.processes.len())
            .field("components", &registry.components.len())
            .field("connections", &registry.connections.len())
            .finish()
    }
}

/// Talks to a global manager over a transport
#[derive(Clone)]
pub struct GlobalClient {
    transport: Arc<dyn Transport>,
    address: String,
    timeout: Duration,
}

impl GlobalClient {
    pub fn new(transport: Arc<dyn Transport>, address: &str, timeout: Duration) -> Self {
        Self {
            transport,
            address: address.to_string(),
            timeout,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    fn call(&self, request: Request) -> MtaskResult<Response> {
        self.transport
            .request(&self.address, request, self.timeout)?
            .into_result()
    }

    fn unexpected<T>(response: Response) -> MtaskResult<T> {
        Err(MtaskError::Communication(format!(
            "unexpected reply from global manager: {:?}",
            response
        )))
    }

    /// Round trip to the global manager; returns the name it answers with
    pub fn ping(&self) -> MtaskResult<String> {
        match self.call(Request::Ping)? {
            Response::Pong { process } => Ok(process),
            other => Self::unexpected(other),
        }
    }

    pub fn register_process(&self, process: &str, address: &str) -> MtaskResult<()> {
        self.call(Request::RegisterProcess {
            process: process.to_string(),
            address: address.to_string(),
        })
        .map(|_| ())
    }

    pub fn unregister_process(&self, process: &str) -> MtaskResult<()> {
        self.call(Request::UnregisterProcess {
            process: process.to_string(),
        })
        .map(|_| ())
    }

    pub fn register_component(
        &self,
        process: &str,
        component: ComponentDescription,
    ) -> MtaskResult<()> {
        self.call(Request::RegisterComponent {
            process: process.to_string(),
            component,
        })
        .map(|_| ())
    }

    pub fn unregister_component(&self, process: &str, component: &str) -> MtaskResult<()> {
        self.call(Request::UnregisterComponent {
            process: process.to_string(),
            component: component.to_string(),
        })
        .map(|_| ())
    }

    pub fn lookup_interface(
        &self,
        process: &str,
        component: &str,
        interface: &str,
    ) -> MtaskResult<InterfaceDescription> {
        match self.call(Request::LookupInterface {
            process: process.to_string(),
            component: component.to_string(),
            interface: interface.to_string(),
        })? {
            Response::Interface(description) => Ok(description),
            other => Self::unexpected(other),
        }
    }

    pub fn connect(&self, required: &Endpoint, provided: &Endpoint) -> MtaskResult<ConnectionPlan> {
        match self.call(Request::Connect {
            required: required.clone(),
            provided: provided.clone(),
        })? {
            Response::Connected {
                id,
                address,
                interface,
            } => Ok(ConnectionPlan {
                id,
                address,
                interface,
            }),
            other => Self::unexpected(other),
        }
    }

    pub fn disconnect(&self, id: ConnectionId) -> MtaskResult<()> {
        self.call(Request::Disconnect { id }).map(|_| ())
    }

    pub fn processes(&self) -> MtaskResult<Vec<ProcessInfo>> {
        match self.call(Request::ListProcesses)? {
            Response::Processes(processes) => Ok(processes),
            other => Self::unexpected(other),
        }
    }

    pub fn components(
        &self,
        process: Option<&str>,
    ) -> MtaskResult<Vec<(String, ComponentDescription)>> {
        match self.call(Request::ListComponents {
            process: process.map(str::to_string),
        })? {
            Response::Components(components) => Ok(components),
            other => Self::unexpected(other),
        }
    }

    pub fn connections(&self) -> MtaskResult<Vec<ConnectionDescription>> {
        match self.call(Request::ListConnections)? {
            Response::Connections(connections) => Ok(connections),
            other => Self::unexpected(other),
        }
    }
}

impl std::fmt::Debug for GlobalClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GlobalClient")
            .field("address", &self.address)
            .field("transport", &self.transport.name())
            .finish()
    }
}
