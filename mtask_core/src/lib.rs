//! # MTASK Core
//!
//! Component-based messaging middleware for real-time and distributed
//! robotics software.
//!
//! - **Components**: independently scheduled units (passive, periodic or
//!   continuous) with a managed lifecycle
//! - **Interfaces**: provided commands and events, required functions and
//!   handlers, bound by name
//! - **Mailboxes**: every cross-thread call runs on the owner's thread, one at
//!   a time
//! - **State tables**: circular, time-indexed history of periodic state
//! - **Managers**: a local manager per process and a global registry that
//!   brokers cross-process connections over a transport
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use mtask_core::{Component, FunctionPolicy, LocalManager, Task, TaskContext};
//! use std::time::Duration;
//!
//! struct Servo;
//!
//! impl Task for Servo {
//!     fn run(&mut self, _ctx: &mut TaskContext) {}
//! }
//!
//! let manager = LocalManager::standalone("robot");
//! let servo = Component::periodic("servo", Duration::from_millis(5), Servo);
//! servo
//!     .add_interface_provided("Control")
//!     .unwrap()
//!     .add_command_write("Move", |target: &f64| println!("moving to {}", target))
//!     .unwrap();
//! manager.add_component(servo).unwrap();
//! manager.create_all_and_wait(Duration::from_secs(1)).unwrap();
//! manager.start_all().unwrap();
//! ```

pub mod communication;
pub mod config;
pub mod core;
pub mod error;
pub mod manager;
pub mod scheduling;

// Re-export commonly used types for easy access
pub use communication::{
    CallMode, Command, CommandRole, Connection, ConnectionDescription, ConnectionId, Endpoint,
    EventGenerator, EventVoid, EventWrite, FunctionPolicy, FunctionQualifiedRead, FunctionRead,
    FunctionVoid, FunctionVoidReturn, FunctionWrite, FunctionWriteReturn, InterfaceDescription,
    Mailbox, ProvidedInterface, RequiredInterface,
};
pub use config::{ComponentConfig, ConnectionConfig, ManagerConfig, NetworkConfig};
pub use core::{
    Component, ComponentDescription, ComponentKind, ComponentOptions, ComponentState,
    ExecutionResult, Payload, StateData, StateIndex, StateTable, Task, TaskContext,
};
pub use error::{MtaskError, MtaskResult};
pub use manager::{ComponentRegistry, Context, GlobalClient, GlobalManager, LocalManager};

// Transports
pub use communication::network::{LoopbackNetwork, TcpTransport, Transport};
