//! In-memory transport for hermetic multi-process tests.
//!
//! Addresses are plain names. Requests are served on a fresh thread with no
//! added latency (asynchronous requests also wait on one); notifications are served on the sender's thread, which keeps
//! them ordered. [`LoopbackNetwork::sever`] cuts a link, failing in-flight and
//! future requests with a network error.

use crate::communication::network::protocol::{Request, Response};
use crate::communication::network::transport::{ReplyCallback, RequestHandler, Transport};
use crate::error::{MtaskError, MtaskResult};
use crossbeam::channel::{bounded, Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

struct Link {
    handler: Arc<dyn RequestHandler>,
    /// Dropped on sever; every receiver clone then wakes up
    cut: Mutex<Option<Sender<()>>>,
    severed: Receiver<()>,
}

impl Link {
    fn is_severed(&self) -> bool {
        self.cut.lock().is_none()
    }
}

#[derive(Default)]
pub struct LoopbackNetwork {
    links: RwLock<HashMap<String, Arc<Link>>>,
}

impl LoopbackNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn link(&self, address: &str) -> MtaskResult<Arc<Link>> {
        let link = self
            .links
            .read()
            .get(address)
            .cloned()
            .ok_or_else(|| MtaskError::network(format!("nothing listening at '{}'", address)))?;
        if link.is_severed() {
            return Err(MtaskError::network(format!("link to '{}' severed", address)));
        }
        Ok(link)
    }

    /// Simulate losing the link to `address`
    pub fn sever(&self, address: &str) {
        if let Some(link) = self.links.write().remove(address) {
            link.cut.lock().take();
            log::info!("loopback link to '{}' severed", address);
        }
    }

    pub fn addresses(&self) -> Vec<String> {
        let mut addresses: Vec<_> = self.links.read().keys().cloned().collect();
        addresses.sort();
        addresses
    }
}

/// Serve `request` on a fresh thread and wait for its response, the link
/// being severed, or `timeout`.
fn roundtrip(
    link: &Link,
    address: &str,
    request: Request,
    timeout: Duration,
) -> MtaskResult<Response> {
    let (tx, rx) = bounded(1);
    let handler = link.handler.clone();
    std::thread::Builder::new()
        .name("mtask-loopback".to_string())
        .spawn(move || {
            let _ = tx.send(handler.handle(request));
        })?;

    crossbeam::select! {
        recv(rx) -> response => response.map_err(|_| {
            MtaskError::network(format!("'{}' dropped the request", address))
        }),
        recv(link.severed) -> _ => Err(MtaskError::network(format!(
            "link to '{}' lost during the request",
            address
        ))),
        default(timeout) => Err(MtaskError::Timeout(format!(
            "no response from '{}' within {:?}",
            address, timeout
        ))),
    }
}

impl Transport for LoopbackNetwork {
    fn request(
        &self,
        address: &str,
        request: Request,
        timeout: Duration,
    ) -> MtaskResult<Response> {
        let link = self.link(address)?;
        roundtrip(&link, address, request, timeout)
    }

    fn request_async(
        &self,
        address: &str,
        request: Request,
        timeout: Duration,
        on_reply: ReplyCallback,
    ) {
        let link = match self.link(address) {
            Ok(link) => link,
            Err(e) => return on_reply(Err(e)),
        };
        let address = address.to_string();
        let (tx, rx) = bounded::<ReplyCallback>(1);
        let spawned = std::thread::Builder::new()
            .name("mtask-loopback-async".to_string())
            .spawn(move || {
                if let Ok(on_reply) = rx.recv() {
                    on_reply(roundtrip(&link, &address, request, timeout));
                }
            });
        match spawned {
            Ok(_) => {
                let _ = tx.send(on_reply);
            }
            Err(e) => on_reply(Err(MtaskError::network(format!(
                "cannot start loopback request: {}",
                e
            )))),
        }
    }

    fn notify(&self, address: &str, request: Request) -> MtaskResult<()> {
        let link = self.link(address)?;
        let response = link.handler.handle(request);
        if let Response::Error { code, message } = response {
            log::debug!("notification to '{}' failed: {} ({})", address, message, code);
        }
        Ok(())
    }

    fn listen(&self, address: &str, handler: Arc<dyn RequestHandler>) -> MtaskResult<String> {
        let mut links = self.links.write();
        if links.contains_key(address) {
            return Err(MtaskError::already_exists(format!(
                "loopback listener '{}'",
                address
            )));
        }
        let (cut, severed) = bounded(0);
        links.insert(
            address.to_string(),
            Arc::new(Link {
                handler,
                cut: Mutex::new(Some(cut)),
                severed,
            }),
        );
        Ok(address.to_string())
    }

    fn stop(&self, address: &str) {
        self.sever(address);
    }

    fn name(&self) -> &'static str {
        "loopback"
    }
}
