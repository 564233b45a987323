//! Transport abstraction shared by the loopback and TCP backends.

use crate::communication::network::protocol::{Request, Response};
use crate::error::MtaskResult;
use std::sync::Arc;
use std::time::Duration;

/// Receives the outcome of [`Transport::request_async`]
pub type ReplyCallback = Box<dyn FnOnce(MtaskResult<Response>) + Send>;

/// Serves requests arriving at a listening address.
///
/// Called from transport threads; implementations must not assume any
/// particular thread and may block for as long as the request needs.
pub trait RequestHandler: Send + Sync {
    fn handle(&self, request: Request) -> Response;
}

/// Point-to-point reliable channel between processes.
///
/// Failures are `MtaskError::Network` (peer unreachable, link lost) or
/// `MtaskError::Timeout` (no response in time); callers map them onto
/// `ExecutionResult` through [`crate::error::MtaskError::execution_result`].
pub trait Transport: Send + Sync {
    /// Send `request` to `address` and wait up to `timeout` for its response.
    fn request(&self, address: &str, request: Request, timeout: Duration)
        -> MtaskResult<Response>;

    /// Send `request` without waiting. `on_reply` runs exactly once, on a
    /// transport thread, with the response, a network failure or a timeout.
    fn request_async(
        &self,
        address: &str,
        request: Request,
        timeout: Duration,
        on_reply: ReplyCallback,
    );

    /// Send a one-way message. Returns once it is handed to the link; never
    /// waits for the peer to process it. Notifications to one address are
    /// handled in the order they were sent.
    fn notify(&self, address: &str, request: Request) -> MtaskResult<()>;

    /// Start serving `address`. Returns the address peers should use, which
    /// differs from `address` when an ephemeral port was requested.
    fn listen(&self, address: &str, handler: Arc<dyn RequestHandler>) -> MtaskResult<String>;

    /// Stop serving a previously returned listening address.
    fn stop(&self, address: &str);

    fn name(&self) -> &'static str;
}

impl<F> RequestHandler for F
where
    F: Fn(Request) -> Response + Send + Sync,
{
    fn handle(&self, request: Request) -> Response {
        self(request)
    }
}
