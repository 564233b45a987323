//! Cross-process plumbing: the wire protocol, transports and the proxy and
//! service ends of remote connections.
//!
//! Two transports are provided: [`TcpTransport`] for real deployments and
//! [`LoopbackNetwork`], an in-memory network for hermetic tests.

pub mod codec;
pub mod loopback;
pub mod protocol;
pub mod proxy;
pub mod server;
pub mod tcp;
pub mod transport;

pub use loopback::LoopbackNetwork;
pub use protocol::{Frame, ProcessInfo, Request, Response};
pub use proxy::{build_proxy_interface, RemoteInterface};
pub use server::{InterfaceDirectory, ProcessService};
pub use tcp::TcpTransport;
pub use transport::{RequestHandler, Transport};
