//! Component factories keyed by type name, used to instantiate components
//! listed in a [`ManagerConfig`](crate::config::ManagerConfig).

use crate::config::ComponentConfig;
use crate::core::component::Component;
use crate::error::{MtaskError, MtaskResult};
use crate::manager::context::Context;
use std::collections::BTreeMap;

pub type ComponentFactory =
    Box<dyn Fn(&ComponentConfig, &Context) -> MtaskResult<Component> + Send + Sync>;

#[derive(Default)]
pub struct ComponentRegistry {
    factories: BTreeMap<String, ComponentFactory>,
}

impl ComponentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, type_name: &str, factory: F) -> MtaskResult<()>
    where
        F: Fn(&ComponentConfig, &Context) -> MtaskResult<Component> + Send + Sync + 'static,
    {
        if self.factories.contains_key(type_name) {
            return Err(MtaskError::already_exists(format!(
                "component type '{}'",
                type_name
            )));
        }
        self.factories.insert(type_name.to_string(), Box::new(factory));
        Ok(())
    }

    /// Builder form of [`register`](Self::register); a later registration of
    /// the same type replaces the earlier one.
    pub fn with<F>(mut self, type_name: &str, factory: F) -> Self
    where
        F: Fn(&ComponentConfig, &Context) -> MtaskResult<Component> + Send + Sync + 'static,
    {
        self.factories.insert(type_name.to_string(), Box::new(factory));
        self
    }

    pub fn contains(&self, type_name: &str) -> bool {
        self.factories.contains_key(type_name)
    }

    pub fn type_names(&self) -> Vec<String> {
        self.factories.keys().cloned().collect()
    }

    pub fn build(&self, config: &ComponentConfig, context: &Context) -> MtaskResult<Component> {
        let factory = self.factories.get(&config.type_name).ok_or_else(|| {
            MtaskError::not_found(format!("component type '{}'", config.type_name))
        })?;
        let component = factory(config, context)?;
        if component.name() != config.name {
            return Err(MtaskError::config(format!(
                "factory '{}' built '{}' instead of '{}'",
                config.type_name,
                component.name(),
                config.name
            )));
        }
        Ok(component)
    }
}

impl std::fmt::Debug for ComponentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComponentRegistry")
            .field("types", &self.type_names())
            .finish()
    }
}
