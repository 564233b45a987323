//! # Communication layer for MTASK
//!
//! Components talk through interfaces:
//!
//! - **Provided interfaces** expose named **commands** and **event generators**
//! - **Required interfaces** hold **functions** and **event handlers**, bound to
//!   a provided interface by name when a **connection** is made
//!
//! Calls into a threaded component are queued in its **mailbox** and run on
//! the component's own thread, one at a time.
//!
//! ```rust,ignore
//! let provided = server.add_interface_provided("Robot")?;
//! provided.add_command_write("Move", move |target: &f64| { /* ... */ })?;
//!
//! let required = client.add_interface_required("Robot")?;
//! let move_to = required.add_function_write::<f64>("Move", FunctionPolicy::Required)?;
//! manager.connect_local("client", "Robot", "server", "Robot")?;
//! move_to.execute(&1.5);
//! ```

pub mod command;
pub mod connection;
pub mod event;
pub mod function;
pub mod interface;
pub mod mailbox;
pub mod network;

pub use command::{CallKind, CallMode, Command, CommandDescription, CommandRole};
pub use connection::{Binding, Connection, ConnectionDescription, ConnectionId, Endpoint};
pub use event::{EventDescription, EventGenerator, EventHandler, EventVoid, EventWrite};
pub use function::{
    FunctionPolicy, FunctionQualifiedRead, FunctionRead, FunctionVoid, FunctionVoidReturn,
    FunctionWrite, FunctionWriteReturn,
};
pub use interface::{InterfaceDescription, ProvidedInterface, RequiredDescription, RequiredInterface};
pub use mailbox::{Completion, Mailbox, MailboxMetrics};
