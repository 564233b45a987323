//! # Component core
//!
//! - **component**: components, their lifecycle and the `Task` they run
//! - **state**: the lifecycle state machine shared with component threads
//! - **state_table**: circular, time-indexed history of periodic state
//! - **payload**: type tags and the serialization boundary for arguments
//! - **result**: the closed `ExecutionResult` outcome set

pub mod component;
pub mod payload;
pub mod result;
pub mod state;
pub mod state_table;

pub use component::{
    Component, ComponentDescription, ComponentKind, ComponentOptions, Task, TaskContext,
};
pub use payload::{Envelope, Payload, ReplyValue, TypeDescriptor, TypeTag, Value};
pub use result::ExecutionResult;
pub use state::ComponentState;
pub use state_table::{StateAccessor, StateData, StateIndex, StateTable, StateTableReader};
