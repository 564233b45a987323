//! # MTASK
//!
//! Component-based messaging middleware for distributed control
//! applications.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use mtask::prelude::*;
//! use std::time::Duration;
//!
//! struct Controller;
//!
//! impl Task for Controller {
//!     fn run(&mut self, ctx: &mut TaskContext) {
//!         let _ = ctx.cycle();
//!     }
//! }
//!
//! let manager = LocalManager::standalone("robot");
//! manager
//!     .add_component(Component::periodic("controller", Duration::from_millis(10), Controller))
//!     .unwrap();
//! manager.create_all_and_wait(Duration::from_secs(1)).unwrap();
//! manager.start_all().unwrap();
//! ```

// Re-export core components
pub use mtask_core::{self, *};

// Re-export serde so payload types can derive without a direct dependency
pub use serde;

/// The MTASK prelude - everything needed to write and wire components
pub mod prelude {
    // ============================================
    // Components
    // ============================================
    pub use mtask_core::core::{
        Component, ComponentKind, ComponentOptions, ComponentState, Task, TaskContext,
    };

    // ============================================
    // Interfaces and calls
    // ============================================
    pub use mtask_core::communication::{
        EventVoid, EventWrite, FunctionPolicy, FunctionQualifiedRead, FunctionRead, FunctionVoid,
        FunctionVoidReturn, FunctionWrite, FunctionWriteReturn, ProvidedInterface,
        RequiredInterface,
    };
    pub use mtask_core::core::{ExecutionResult, Payload};

    // ============================================
    // State tables
    // ============================================
    pub use mtask_core::core::{StateData, StateIndex, StateTable};

    // ============================================
    // Managers and configuration
    // ============================================
    pub use mtask_core::communication::Endpoint;
    pub use mtask_core::config::{ComponentConfig, ManagerConfig};
    pub use mtask_core::manager::{ComponentRegistry, Context, GlobalManager, LocalManager};

    // ============================================
    // Transports
    // ============================================
    pub use mtask_core::communication::network::{LoopbackNetwork, TcpTransport, Transport};

    // ============================================
    // Errors
    // ============================================
    pub use mtask_core::error::{MtaskError, MtaskResult};

    pub use serde::{Deserialize, Serialize};
}
