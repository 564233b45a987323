//! Local component manager
//!
//! Owns the components of one process, fans lifecycle requests out to them,
//! binds required interfaces to provided ones and, once joined to a network,
//! brokers cross-process connections through the global manager.

use crate::communication::connection::{
    Binding, Connection, ConnectionDescription, ConnectionId, Endpoint,
};
use crate::communication::interface::{InterfaceDescription, ProvidedInterface, RequiredInterface};
use crate::communication::network::protocol::{Request, SubscriptionId};
use crate::communication::network::proxy::{build_proxy_interface, RemoteInterface};
use crate::communication::network::server::{InterfaceDirectory, ProcessService};
use crate::communication::network::transport::Transport;
use crate::config::ManagerConfig;
use crate::core::component::{Component, ComponentDescription};
use crate::core::state::ComponentState;
use crate::error::{MtaskError, MtaskResult};
use crate::manager::context::Context;
use crate::manager::global::{GlobalClient, GlobalManager};
use crate::manager::registry::ComponentRegistry;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

struct NetworkLink {
    transport: Arc<dyn Transport>,
    address: String,
    service: Arc<ProcessService>,
    global: Option<GlobalClient>,
}

struct LocalInner {
    context: Context,
    components: RwLock<BTreeMap<String, Arc<Component>>>,
    connections: Mutex<BTreeMap<ConnectionId, Connection>>,
    next_connection: AtomicU64,
    next_subscription: AtomicU64,
    network: RwLock<Option<NetworkLink>>,
}

impl InterfaceDirectory for LocalInner {
    fn provided_interface(
        &self,
        component: &str,
        interface: &str,
    ) -> Option<Arc<ProvidedInterface>> {
        self.components
            .read()
            .get(component)
            .and_then(|c| c.provided_interface(interface))
    }
}

pub struct LocalManager {
    inner: Arc<LocalInner>,
}

impl LocalManager {
    pub fn new(config: ManagerConfig) -> Self {
        Self {
            inner: Arc::new(LocalInner {
                context: Context::new(config),
                components: RwLock::new(BTreeMap::new()),
                connections: Mutex::new(BTreeMap::new()),
                next_connection: AtomicU64::new(1),
                next_subscription: AtomicU64::new(1),
                network: RwLock::new(None),
            }),
        }
    }

    /// Manager with default settings and no network
    pub fn standalone(process_name: &str) -> Self {
        Self::new(ManagerConfig::new(process_name))
    }

    pub fn process_name(&self) -> &str {
        self.inner.context.process_name()
    }

    pub fn context(&self) -> &Context {
        &self.inner.context
    }

    pub fn config(&self) -> &ManagerConfig {
        self.inner.context.config()
    }

    // ---- components ----

    /// Take ownership of `component`. Names are unique per process.
    pub fn add_component(&self, component: Component) -> MtaskResult<Arc<Component>> {
        let name = component.name().to_string();
        if name.is_empty() || name.contains('.') || name.contains(':') {
            return Err(MtaskError::invalid_input(format!(
                "component name '{}' must be non-empty without '.' or ':'",
                name
            )));
        }
        let component = Arc::new(component);
        {
            let mut components = self.inner.components.write();
            if components.contains_key(&name) {
                log::warn!("{}: component '{}' already added", self.process_name(), name);
                return Err(MtaskError::already_exists(format!("component '{}'", name)));
            }
            component.attach_context(self.inner.context.clone());
            components.insert(name.clone(), component.clone());
        }
        log::debug!("{}: component '{}' added", self.process_name(), name);
        self.publish(&component);
        Ok(component)
    }

    /// Disconnect everything touching the component, kill it and drop it from
    /// the manager. The returned handle can be used to wait for Finished.
    pub fn remove_component(&self, name: &str) -> MtaskResult<Arc<Component>> {
        let component = self
            .inner
            .components
            .write()
            .remove(name)
            .ok_or_else(|| MtaskError::not_found(format!("component '{}'", name)))?;

        let own = self.process_name().to_string();
        let doomed: Vec<Connection> = {
            let mut connections = self.inner.connections.lock();
            let ids: Vec<ConnectionId> = connections
                .values()
                .filter(|c| {
                    let d = c.description();
                    (d.required.process == own && d.required.component == name)
                        || (d.provided.process == own && d.provided.component == name)
                })
                .map(|c| c.id())
                .collect();
            ids.iter().filter_map(|id| connections.remove(id)).collect()
        };
        for connection in doomed {
            connection.close();
        }

        component.kill()?;
        if let Some(global) = self.global() {
            if let Err(e) = global.unregister_component(&own, name) {
                log::warn!("{}: cannot unregister '{}': {}", own, name, e);
            }
        }
        log::info!("{}: component '{}' removed", own, name);
        Ok(component)
    }

    pub fn component(&self, name: &str) -> Option<Arc<Component>> {
        self.inner.components.read().get(name).cloned()
    }

    pub fn component_names(&self) -> Vec<String> {
        self.inner.components.read().keys().cloned().collect()
    }

    fn components(&self) -> Vec<Arc<Component>> {
        self.inner.components.read().values().cloned().collect()
    }

    fn require_component(&self, name: &str) -> MtaskResult<Arc<Component>> {
        self.component(name)
            .ok_or_else(|| MtaskError::not_found(format!("component '{}'", name)))
    }

    // ---- lifecycle ----

    /// Apply `op` to every component. All are attempted; the first error is
    /// returned.
    fn fan_out<F>(&self, what: &str, op: F) -> MtaskResult<()>
    where
        F: Fn(&Component) -> MtaskResult<()>,
    {
        let mut first = None;
        for component in self.components() {
            if let Err(e) = op(&component) {
                log::warn!("{}: {} '{}' failed: {}", self.process_name(), what, component.name(), e);
                first.get_or_insert(e);
            }
        }
        first.map_or(Ok(()), Err)
    }

    pub fn create_all(&self) -> MtaskResult<()> {
        self.fan_out("create", |c| c.create())
    }

    pub fn start_all(&self) -> MtaskResult<()> {
        self.fan_out("start", |c| c.start())
    }

    pub fn suspend_all(&self) -> MtaskResult<()> {
        self.fan_out("suspend", |c| c.suspend())
    }

    pub fn kill_all(&self) -> MtaskResult<()> {
        self.fan_out("kill", |c| c.kill())
    }

    /// Wait until every component reaches `target`. The timeout covers the
    /// whole call, not each component.
    pub fn wait_for_state_all(&self, target: ComponentState, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut reached = true;
        for component in self.components() {
            if !component.wait_for_state_until(target, deadline) {
                log::warn!(
                    "{}: '{}' still {} (waiting for {})",
                    self.process_name(),
                    component.name(),
                    component.state(),
                    target
                );
                reached = false;
            }
        }
        reached
    }

    pub fn create_all_and_wait(&self, timeout: Duration) -> MtaskResult<bool> {
        self.create_all()?;
        Ok(self.wait_for_state_all(ComponentState::Ready, timeout))
    }

    pub fn start_all_and_wait(&self, timeout: Duration) -> MtaskResult<bool> {
        self.start_all()?;
        Ok(self.wait_for_state_all(ComponentState::Active, timeout))
    }

    pub fn kill_all_and_wait(&self, timeout: Duration) -> MtaskResult<bool> {
        self.kill_all()?;
        Ok(self.wait_for_state_all(ComponentState::Finished, timeout))
    }

    // ---- connections ----

    /// Bind a required interface of this process to a provided interface,
    /// local or remote. Reconnecting a required interface replaces its
    /// previous connection, which is only closed once the new provided side
    /// has been resolved and checked; a failed reconnect leaves it in place.
    pub fn connect(&self, required: &Endpoint, provided: &Endpoint) -> MtaskResult<ConnectionId> {
        if required.process != self.process_name() {
            return Err(MtaskError::invalid_input(format!(
                "required side {} is not in process '{}'",
                required,
                self.process_name()
            )));
        }
        let requirer = self
            .require_component(&required.component)?
            .required_interface(&required.interface)
            .ok_or_else(|| {
                MtaskError::not_found(format!("required interface '{}'", required))
            })?;

        let id = self.inner.next_connection.fetch_add(1, Ordering::Relaxed);
        let description = ConnectionDescription {
            id,
            required: required.clone(),
            provided: provided.clone(),
        };
        let connection = if provided.process == self.process_name() {
            let provider = self
                .require_component(&provided.component)?
                .provided_interface(&provided.interface)
                .ok_or_else(|| {
                    MtaskError::not_found(format!("provided interface '{}'", provided))
                })?;
            Binding::check(&requirer, &provider)?;
            self.close_previous(required);
            Connection::new(description, Binding::establish(requirer, provider)?)
        } else {
            self.connect_remote(description, requirer)?
        };

        log::info!(
            "{}: connected {} ({} bound, {} unbound)",
            self.process_name(),
            connection.description(),
            connection.binding().bound_functions().len(),
            connection.binding().unbound_functions().len()
        );
        self.inner.connections.lock().insert(id, connection);
        Ok(id)
    }

    /// Close the connection currently serving `required`, if any
    fn close_previous(&self, required: &Endpoint) {
        let previous = {
            let mut connections = self.inner.connections.lock();
            let id = connections
                .values()
                .find(|c| &c.description().required == required)
                .map(|c| c.id());
            id.and_then(|id| connections.remove(&id))
        };
        if let Some(previous) = previous {
            log::info!("{}: replacing connection {}", self.process_name(), previous.description());
            previous.close();
        }
    }

    /// Shorthand for a connection between two components of this process
    pub fn connect_local(
        &self,
        required_component: &str,
        required_interface: &str,
        provided_component: &str,
        provided_interface: &str,
    ) -> MtaskResult<ConnectionId> {
        let own = self.process_name();
        self.connect(
            &Endpoint::new(own, required_component, required_interface),
            &Endpoint::new(own, provided_component, provided_interface),
        )
    }

    fn connect_remote(
        &self,
        description: ConnectionDescription,
        requirer: Arc<RequiredInterface>,
    ) -> MtaskResult<Connection> {
        let (transport, own_address, service, global) = {
            let network = self.inner.network.read();
            let link = network.as_ref().ok_or_else(|| {
                MtaskError::network(format!(
                    "'{}' is not joined to a network; cannot reach {}",
                    self.process_name(),
                    description.provided
                ))
            })?;
            let global = link.global.clone().ok_or_else(|| {
                MtaskError::network(format!(
                    "no global manager configured to resolve {}",
                    description.provided
                ))
            })?;
            (
                link.transport.clone(),
                link.address.clone(),
                link.service.clone(),
                global,
            )
        };
        let timeout = self.config().network.request_timeout();

        let plan = global.connect(&description.required, &description.provided)?;
        let provided = &description.provided;
        let invoker = Arc::new(RemoteInterface::new(
            transport.clone(),
            &plan.address,
            &provided.component,
            &provided.interface,
            timeout,
        ));
        let release_global = |global: &GlobalClient| {
            if let Err(e) = global.disconnect(plan.id) {
                log::debug!("global disconnect #{} failed: {}", plan.id, e);
            }
        };
        let binding = match build_proxy_interface(&plan.interface, invoker).and_then(|proxy| {
            Binding::check(&requirer, &proxy)?;
            self.close_previous(&description.required);
            Binding::establish(requirer, proxy)
        }) {
            Ok(binding) => binding,
            Err(e) => {
                release_global(&global);
                return Err(e);
            }
        };

        let mut subscriptions: Vec<SubscriptionId> = Vec::new();
        for event in binding.provided().event_names() {
            let generator = match binding.provided().event(&event) {
                Some(generator) if generator.handler_count() > 0 => generator,
                _ => continue,
            };
            let subscription = self.inner.next_subscription.fetch_add(1, Ordering::Relaxed);
            service.add_subscription(subscription, generator);
            let subscribed = transport
                .request(
                    &plan.address,
                    Request::Subscribe {
                        component: provided.component.clone(),
                        interface: provided.interface.clone(),
                        event: event.clone(),
                        subscriber: own_address.clone(),
                        subscription,
                    },
                    timeout,
                )
                .and_then(|response| response.into_result());
            subscriptions.push(subscription);
            if let Err(e) = subscribed {
                log::error!(
                    "{}: cannot subscribe to '{}' of {}: {}",
                    self.process_name(),
                    event,
                    provided,
                    e
                );
                unsubscribe(&transport, &plan.address, &own_address, &service, &subscriptions);
                binding.release();
                release_global(&global);
                return Err(e);
            }
        }

        let global_id = plan.id;
        let address = plan.address.clone();
        Ok(Connection::new(description, binding).with_teardown(move || {
            unsubscribe(&transport, &address, &own_address, &service, &subscriptions);
            if let Err(e) = global.disconnect(global_id) {
                log::debug!("global disconnect #{} failed: {}", global_id, e);
            }
        }))
    }

    pub fn disconnect(&self, id: ConnectionId) -> MtaskResult<()> {
        let connection = self
            .inner
            .connections
            .lock()
            .remove(&id)
            .ok_or_else(|| MtaskError::not_found(format!("connection #{}", id)))?;
        connection.close();
        Ok(())
    }

    pub fn connections(&self) -> Vec<ConnectionDescription> {
        self.inner
            .connections
            .lock()
            .values()
            .map(|c| c.description().clone())
            .collect()
    }

    // ---- introspection ----

    pub fn provided_interface_names(&self, component: &str) -> MtaskResult<Vec<String>> {
        Ok(self.require_component(component)?.provided_interface_names())
    }

    pub fn required_interface_names(&self, component: &str) -> MtaskResult<Vec<String>> {
        Ok(self.require_component(component)?.required_interface_names())
    }

    fn provided(&self, component: &str, interface: &str) -> MtaskResult<Arc<ProvidedInterface>> {
        self.require_component(component)?
            .provided_interface(interface)
            .ok_or_else(|| {
                MtaskError::not_found(format!("provided interface '{}.{}'", component, interface))
            })
    }

    fn required(&self, component: &str, interface: &str) -> MtaskResult<Arc<RequiredInterface>> {
        self.require_component(component)?
            .required_interface(interface)
            .ok_or_else(|| {
                MtaskError::not_found(format!("required interface '{}.{}'", component, interface))
            })
    }

    pub fn command_names(&self, component: &str, interface: &str) -> MtaskResult<Vec<String>> {
        Ok(self.provided(component, interface)?.command_names())
    }

    pub fn event_names(&self, component: &str, interface: &str) -> MtaskResult<Vec<String>> {
        Ok(self.provided(component, interface)?.event_names())
    }

    pub fn function_names(&self, component: &str, interface: &str) -> MtaskResult<Vec<String>> {
        Ok(self.required(component, interface)?.function_names())
    }

    pub fn event_handler_names(&self, component: &str, interface: &str) -> MtaskResult<Vec<String>> {
        Ok(self.required(component, interface)?.event_handler_names())
    }

    pub fn describe_interface(
        &self,
        component: &str,
        interface: &str,
    ) -> MtaskResult<InterfaceDescription> {
        Ok(self.provided(component, interface)?.describe())
    }

    pub fn describe_component(&self, component: &str) -> MtaskResult<ComponentDescription> {
        Ok(self.require_component(component)?.describe())
    }

    // ---- configuration ----

    /// Instantiate the configured components and perform the configured
    /// connections.
    pub fn configure(&self, config: &ManagerConfig, registry: &ComponentRegistry) -> MtaskResult<()> {
        config.validate()?;
        for component_config in &config.components {
            let component = registry.build(component_config, &self.inner.context)?;
            self.add_component(component)?;
        }
        for connection in &config.connections {
            let required = Endpoint::parse(&connection.required, self.process_name())?;
            let provided = Endpoint::parse(&connection.provided, self.process_name())?;
            self.connect(&required, &provided)?;
        }
        log::info!(
            "{}: configured {} components, {} connections",
            self.process_name(),
            config.components.len(),
            config.connections.len()
        );
        Ok(())
    }

    // ---- network ----

    /// Serve this process on `transport` and, when a global address is
    /// configured, register it and its components with the global manager.
    /// An unreachable global manager fails the join.
    pub fn join_network(&self, transport: Arc<dyn Transport>) -> MtaskResult<String> {
        if self.inner.network.read().is_some() {
            return Err(MtaskError::already_exists(format!(
                "network link of '{}'",
                self.process_name()
            )));
        }
        let network = self.config().network.clone();
        let inner: Arc<dyn InterfaceDirectory> = self.inner.clone();
        let directory: Weak<dyn InterfaceDirectory> = Arc::downgrade(&inner);
        drop(inner);
        let service = Arc::new(ProcessService::new(
            self.process_name(),
            directory,
            transport.clone(),
            self.config().blocking_timeout(),
        ));
        let listen = network
            .listen_address
            .clone()
            .unwrap_or_else(|| self.process_name().to_string());
        let address = transport.listen(&listen, service.clone())?;

        let global = match &network.global_address {
            Some(global_address) => {
                let client =
                    GlobalClient::new(transport.clone(), global_address, network.request_timeout());
                if let Err(e) = client.register_process(self.process_name(), &address) {
                    log::error!(
                        "{}: global manager at {} unreachable: {}",
                        self.process_name(),
                        global_address,
                        e
                    );
                    transport.stop(&address);
                    return Err(e);
                }
                Some(client)
            }
            None => None,
        };

        self.inner.context.set_global(global.clone());
        *self.inner.network.write() = Some(NetworkLink {
            transport: transport.clone(),
            address: address.clone(),
            service,
            global,
        });
        for component in self.components() {
            self.publish(&component);
        }
        log::info!(
            "{}: serving on {} ({})",
            self.process_name(),
            address,
            transport.name()
        );
        Ok(address)
    }

    /// Host a global manager in this process at `address`. Join the network
    /// afterwards with `global_address` pointing at it.
    pub fn host_global(
        &self,
        transport: &Arc<dyn Transport>,
        address: &str,
    ) -> MtaskResult<(Arc<GlobalManager>, String)> {
        let global = Arc::new(GlobalManager::new());
        let address = global.serve(transport, address)?;
        Ok((global, address))
    }

    /// Close remote connections, unregister from the global manager and stop
    /// serving.
    pub fn leave_network(&self) {
        let link = match self.inner.network.write().take() {
            Some(link) => link,
            None => return,
        };
        let own = self.process_name().to_string();
        let remote: Vec<Connection> = {
            let mut connections = self.inner.connections.lock();
            let ids: Vec<ConnectionId> = connections
                .values()
                .filter(|c| c.description().provided.process != own)
                .map(|c| c.id())
                .collect();
            ids.iter().filter_map(|id| connections.remove(id)).collect()
        };
        for connection in remote {
            connection.close();
        }
        if let Some(global) = &link.global {
            if let Err(e) = global.unregister_process(&own) {
                log::warn!("{}: cannot unregister from global manager: {}", own, e);
            }
        }
        link.service.clear();
        link.transport.stop(&link.address);
        self.inner.context.set_global(None);
        log::info!("{}: left the network", own);
    }

    /// Address this process serves on, once joined
    pub fn address(&self) -> Option<String> {
        self.inner.network.read().as_ref().map(|l| l.address.clone())
    }

    pub fn global(&self) -> Option<GlobalClient> {
        self.inner.context.global()
    }

    /// Push the current description of `component` to the global manager.
    /// Call again after adding interfaces to an already added component.
    pub fn publish_component(&self, name: &str) -> MtaskResult<()> {
        let component = self.require_component(name)?;
        match self.global() {
            Some(global) => global.register_component(self.process_name(), component.describe()),
            None => Ok(()),
        }
    }

    fn publish(&self, component: &Component) {
        if let Some(global) = self.global() {
            if let Err(e) = global.register_component(self.process_name(), component.describe()) {
                log::warn!(
                    "{}: cannot register '{}' with the global manager: {}",
                    self.process_name(),
                    component.name(),
                    e
                );
            }
        }
    }
}

fn unsubscribe(
    transport: &Arc<dyn Transport>,
    address: &str,
    subscriber: &str,
    service: &ProcessService,
    subscriptions: &[SubscriptionId],
) {
    for &subscription in subscriptions {
        service.remove_subscription(subscription);
        let request = Request::Unsubscribe {
            subscriber: subscriber.to_string(),
            subscription,
        };
        if let Err(e) = transport.notify(address, request) {
            log::debug!("unsubscribe #{} from {} failed: {}", subscription, address, e);
        }
    }
}

impl Drop for LocalManager {
    fn drop(&mut self) {
        let connections: Vec<Connection> = {
            let mut connections = self.inner.connections.lock();
            std::mem::take(&mut *connections).into_values().collect()
        };
        for connection in connections {
            connection.close();
        }
        self.leave_network();
        let _ = self.kill_all();
    }
}

impl std::fmt::Debug for LocalManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalManager")
            .field("process", &self.process_name())
            .field("components", &self.component_names())
            .field("connections", &self.inner.connections.lock().len())
            .field("address", &self.address())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::communication::function::FunctionPolicy;
    use crate::communication::network::loopback::LoopbackNetwork;
    use crate::core::component::{Task, TaskContext};
    use crate::core::result::ExecutionResult;
    use std::sync::atomic::AtomicI64;

    struct Idle;

    impl Task for Idle {
        fn run(&mut self, _ctx: &mut TaskContext) {}
    }

    fn counter(manager: &LocalManager, name: &str) -> Arc<AtomicI64> {
        let total = Arc::new(AtomicI64::new(0));
        let component = Component::periodic(name, Duration::from_millis(2), Idle);
        let provided = component.add_interface_provided("Counter").unwrap();
        let sink = total.clone();
        provided
            .add_command_write("Add", move |x: &i64| {
                sink.fetch_add(*x, Ordering::SeqCst);
            })
            .unwrap();
        let source = total.clone();
        provided
            .add_command_read("Total", move || source.load(Ordering::SeqCst))
            .unwrap();
        manager.add_component(component).unwrap();
        total
    }

    #[test]
    fn test_unique_component_names() {
        let manager = LocalManager::standalone("p");
        manager.add_component(Component::passive("a", Idle)).unwrap();
        assert!(manager
            .add_component(Component::passive("a", Idle))
            .unwrap_err()
            .is_already_exists());
        assert!(manager.add_component(Component::passive("a.b", Idle)).is_err());
        assert_eq!(manager.component_names(), vec!["a".to_string()]);
        assert!(manager.component("a").unwrap().state() == ComponentState::Constructed);
    }

    #[test]
    fn test_lifecycle_fan_out() {
        let manager = LocalManager::standalone("p");
        manager
            .add_component(Component::periodic("fast", Duration::from_millis(1), Idle))
            .unwrap();
        manager.add_component(Component::continuous("busy", Idle)).unwrap();
        manager.add_component(Component::passive("device", Idle)).unwrap();

        assert!(manager.create_all_and_wait(Duration::from_secs(2)).unwrap());
        assert!(manager.start_all_and_wait(Duration::from_secs(2)).unwrap());
        manager.suspend_all().unwrap();
        assert!(manager.wait_for_state_all(ComponentState::Ready, Duration::from_secs(2)));
        // Already suspended: every component refuses, the first error is reported
        assert!(manager.suspend_all().is_err());
        assert!(manager.kill_all_and_wait(Duration::from_secs(2)).unwrap());
        assert!(!manager.wait_for_state_all(ComponentState::Active, Duration::from_millis(20)));
    }

    #[test]
    fn test_local_connect_and_introspection() {
        let manager = LocalManager::standalone("p");
        let total = counter(&manager, "counter");
        let client = Component::passive("client", Idle);
        let required = client.add_interface_required("Counter").unwrap();
        let add = required
            .add_function_write::<i64>("Add", FunctionPolicy::Required)
            .unwrap();
        let missing = required
            .add_function_void("Reset", FunctionPolicy::Optional)
            .unwrap();
        manager.add_component(client).unwrap();

        let id = manager
            .connect_local("client", "Counter", "counter", "Counter")
            .unwrap();
        assert_eq!(manager.connections().len(), 1);
        assert_eq!(
            manager.command_names("counter", "Counter").unwrap(),
            vec!["Add".to_string(), "Total".to_string()]
        );
        assert_eq!(
            manager.function_names("client", "Counter").unwrap(),
            vec!["Add".to_string(), "Reset".to_string()]
        );
        assert!(manager.describe_interface("counter", "Nope").is_err());

        manager.create_all_and_wait(Duration::from_secs(2)).unwrap();
        manager.start_all_and_wait(Duration::from_secs(2)).unwrap();
        assert_eq!(add.execute_blocking(&5), ExecutionResult::Succeeded);
        assert_eq!(total.load(Ordering::SeqCst), 5);
        assert_eq!(missing.execute(), ExecutionResult::FunctionNotBound);

        // Reconnecting replaces the old connection
        let again = manager
            .connect_local("client", "Counter", "counter", "Counter")
            .unwrap();
        assert_ne!(id, again);
        assert_eq!(manager.connections().len(), 1);

        manager.disconnect(again).unwrap();
        assert!(manager.disconnect(again).unwrap_err().is_not_found());
        assert_eq!(add.execute(&1), ExecutionResult::FunctionNotBound);
        manager.kill_all_and_wait(Duration::from_secs(2)).unwrap();
    }

    #[test]
    fn test_required_function_without_command_fails_connect() {
        let manager = LocalManager::standalone("p");
        counter(&manager, "counter");
        let client = Component::passive("client", Idle);
        let required = client.add_interface_required("Counter").unwrap();
        let add = required
            .add_function_write::<i64>("Add", FunctionPolicy::Optional)
            .unwrap();
        required
            .add_function_void("Reset", FunctionPolicy::Required)
            .unwrap();
        manager.add_component(client).unwrap();

        assert!(manager
            .connect_local("client", "Counter", "counter", "Counter")
            .is_err());
        assert!(manager.connections().is_empty());
        // Rolled back
        assert_eq!(add.execute(&1), ExecutionResult::FunctionNotBound);
    }

    #[test]
    fn test_remove_component_closes_connections() {
        let manager = LocalManager::standalone("p");
        counter(&manager, "counter");
        let client = Component::passive("client", Idle);
        client.add_interface_required("Counter").unwrap();
        manager.add_component(client).unwrap();
        manager
            .connect_local("client", "Counter", "counter", "Counter")
            .unwrap();

        let removed = manager.remove_component("counter").unwrap();
        assert!(removed.wait_for_state(ComponentState::Finished, Duration::from_secs(2)));
        assert!(manager.connections().is_empty());
        assert!(manager.remove_component("counter").unwrap_err().is_not_found());
    }

    #[test]
    fn test_remote_connect_without_network_fails() {
        let manager = LocalManager::standalone("p");
        let client = Component::passive("client", Idle);
        client.add_interface_required("Counter").unwrap();
        manager.add_component(client).unwrap();
        let err = manager
            .connect(
                &Endpoint::new("p", "client", "Counter"),
                &Endpoint::new("other", "counter", "Counter"),
            )
            .unwrap_err();
        assert!(matches!(err, MtaskError::Network(_)));
    }

    #[test]
    fn test_join_fails_when_global_unreachable() {
        let net = LoopbackNetwork::new();
        let mut config = ManagerConfig::new("p2");
        config.network.global_address = Some("global".to_string());
        let manager = LocalManager::new(config);
        assert!(manager.join_network(net.clone()).is_err());
        assert!(manager.address().is_none());
        // The listener was withdrawn again
        assert!(net.addresses().is_empty());
    }
}
