//! # Component managers
//!
//! - [`LocalManager`]: owns the components of one process
//! - [`GlobalManager`]: registry of processes, components and connections,
//!   hosted by one designated process and reached through a [`GlobalClient`]
//! - [`ComponentRegistry`]: factories used to build configured components
//! - [`Context`]: what every component can reach of its process

pub mod context;
pub mod global;
pub mod local;
pub mod registry;

pub use context::Context;
pub use global::{ConnectionPlan, GlobalClient, GlobalManager, GLOBAL_PROCESS_NAME};
pub use local::LocalManager;
pub use registry::{ComponentFactory, ComponentRegistry};
