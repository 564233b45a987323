/// TCP transport between processes
///
/// One outbound connection per peer address, multiplexing requests by id.
/// Each link is served by a reader and a writer task on a private Tokio
/// runtime; callers block on a crossbeam channel, never on the runtime.
///
/// - TCP_NODELAY on every socket
/// - Length-prefixed bincode frames (see `codec`)
/// - Requests served concurrently on the blocking pool, notifications in order
/// - Asynchronous replies delivered on the blocking pool, timed out by the runtime
use crate::communication::network::codec::{encode_frame, read_frame, write_encoded};
use crate::communication::network::protocol::{Frame, Request, RequestId, Response};
use crate::communication::network::transport::{ReplyCallback, RequestHandler, Transport};
use crate::error::{MtaskError, MtaskResult};
use crossbeam::channel::{bounded, RecvTimeoutError, Sender};
use log::{debug, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::{Handle, Runtime};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Who is waiting for a response
enum Waiter {
    /// A caller thread blocked in `request`
    Blocking(Sender<Response>),
    /// An asynchronous request; run on the blocking pool
    Callback(ReplyCallback),
}

impl Waiter {
    fn resolve(self, reply: MtaskResult<Response>) {
        match self {
            Waiter::Blocking(tx) => {
                // Failures reach the caller as a disconnected channel
                if let Ok(response) = reply {
                    let _ = tx.send(response);
                }
            }
            Waiter::Callback(on_reply) => match Handle::try_current() {
                Ok(handle) => {
                    handle.spawn_blocking(move || on_reply(reply));
                }
                Err(_) => on_reply(reply),
            },
        }
    }
}

type Pending = Arc<Mutex<HashMap<RequestId, Waiter>>>;

/// Outbound link to one peer
struct Peer {
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    pending: Pending,
    alive: Arc<AtomicBool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Peer {
    /// Mark dead and fail every pending waiter
    fn fail_all(alive: &AtomicBool, pending: &Pending, peer: &str) {
        alive.store(false, Ordering::Release);
        let waiters: Vec<Waiter> = pending.lock().drain().map(|(_, w)| w).collect();
        for waiter in waiters {
            waiter.resolve(Err(MtaskError::network(format!(
                "link to {} lost during the request",
                peer
            ))));
        }
    }
}

struct Listener {
    accept: JoinHandle<()>,
    connections: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl Listener {
    fn abort(&self) {
        self.accept.abort();
        for task in self.connections.lock().drain(..) {
            task.abort();
        }
    }
}

pub struct TcpTransport {
    runtime: Option<Runtime>,
    handle: Handle,
    connect_timeout: Duration,
    peers: Mutex<HashMap<String, Arc<Peer>>>,
    listeners: Mutex<HashMap<String, Listener>>,
    next_id: AtomicU64,
}

impl TcpTransport {
    pub fn new(connect_timeout: Duration) -> MtaskResult<Arc<Self>> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("mtask-net")
            .enable_all()
            .build()?;
        let handle = runtime.handle().clone();
        Ok(Arc::new(Self {
            runtime: Some(runtime),
            handle,
            connect_timeout,
            peers: Mutex::new(HashMap::new()),
            listeners: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }))
    }

    fn resolve(address: &str) -> MtaskResult<SocketAddr> {
        address
            .to_socket_addrs()
            .map_err(|e| MtaskError::network(format!("cannot resolve '{}': {}", address, e)))?
            .next()
            .ok_or_else(|| MtaskError::network(format!("'{}' resolves to nothing", address)))
    }

    /// Live link to `address`, connecting outside the peers lock so an
    /// unreachable address does not stall calls to the others.
    fn peer(&self, address: &str) -> MtaskResult<Arc<Peer>> {
        if let Some(peer) = self.peers.lock().get(address) {
            if peer.alive.load(Ordering::Acquire) {
                return Ok(peer.clone());
            }
            debug!("reconnecting to {}", address);
        }
        let fresh = Arc::new(self.connect(address)?);
        let mut peers = self.peers.lock();
        match peers.get(address) {
            // Another caller connected first; keep its link
            Some(existing) if existing.alive.load(Ordering::Acquire) => {
                for task in &fresh.tasks {
                    task.abort();
                }
                Ok(existing.clone())
            }
            _ => {
                peers.insert(address.to_string(), fresh.clone());
                Ok(fresh)
            }
        }
    }

    fn connect(&self, address: &str) -> MtaskResult<Peer> {
        let addr = Self::resolve(address)?;
        let stream = std::net::TcpStream::connect_timeout(&addr, self.connect_timeout)
            .map_err(|e| MtaskError::network(format!("failed to connect to {}: {}", addr, e)))?;
        stream
            .set_nodelay(true)
            .map_err(|e| MtaskError::network(format!("failed to set TCP_NODELAY: {}", e)))?;
        stream.set_nonblocking(true)?;

        let _guard = self.handle.enter();
        let stream = TcpStream::from_std(stream)?;
        let (mut reader, mut writer) = stream.into_split();
        let (outbound, mut queue) = mpsc::unbounded_channel::<Vec<u8>>();
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let alive = Arc::new(AtomicBool::new(true));

        let (w_alive, w_pending, w_name) = (alive.clone(), pending.clone(), address.to_string());
        let write_task = self.handle.spawn(async move {
            while let Some(bytes) = queue.recv().await {
                if let Err(e) = write_encoded(&mut writer, &bytes).await {
                    warn!("[Tcp] write to peer failed: {}", e);
                    break;
                }
            }
            Peer::fail_all(&w_alive, &w_pending, &w_name);
        });

        let (r_alive, r_pending) = (alive.clone(), pending.clone());
        let peer_name = address.to_string();
        let read_task = self.handle.spawn(async move {
            loop {
                match read_frame(&mut reader).await {
                    Ok(Some(Frame::Response { id, response })) => {
                        let waiter = r_pending.lock().remove(&id);
                        if let Some(waiter) = waiter {
                            waiter.resolve(Ok(response));
                        }
                    }
                    Ok(Some(other)) => {
                        warn!("[Tcp] unexpected frame from {}: {:?}", peer_name, other)
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!("[Tcp] link to {} lost: {}", peer_name, e);
                        break;
                    }
                }
            }
            Peer::fail_all(&r_alive, &r_pending, &peer_name);
        });

        debug!("[Tcp] connected to {}", addr);
        Ok(Peer {
            outbound,
            pending,
            alive,
            tasks: vec![write_task, read_task],
        })
    }

    fn send(&self, peer: &Peer, frame: &Frame, address: &str) -> MtaskResult<()> {
        let bytes = encode_frame(frame)?;
        peer.outbound
            .send(bytes)
            .map_err(|_| MtaskError::network(format!("link to {} closed", address)))
    }

    async fn accept_loop(
        listener: TcpListener,
        handler: Arc<dyn RequestHandler>,
        connections: Arc<Mutex<Vec<JoinHandle<()>>>>,
    ) {
        loop {
            match listener.accept().await {
                Ok((stream, from)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        warn!("[Tcp] failed to set TCP_NODELAY for {}: {}", from, e);
                    }
                    debug!("[Tcp] accepted {}", from);
                    let task = tokio::spawn(Self::serve_connection(stream, handler.clone()));
                    let mut connections = connections.lock();
                    connections.retain(|t| !t.is_finished());
                    connections.push(task);
                }
                Err(e) => {
                    warn!("[Tcp] accept failed: {}", e);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            }
        }
    }

    async fn serve_connection(stream: TcpStream, handler: Arc<dyn RequestHandler>) {
        let (mut reader, mut writer) = stream.into_split();
        let (replies, mut queue) = mpsc::unbounded_channel::<Vec<u8>>();
        tokio::spawn(async move {
            while let Some(bytes) = queue.recv().await {
                if write_encoded(&mut writer, &bytes).await.is_err() {
                    break;
                }
            }
        });

        loop {
            match read_frame(&mut reader).await {
                Ok(Some(Frame::Request { id, request })) => {
                    let handler = handler.clone();
                    let replies = replies.clone();
                    tokio::task::spawn_blocking(move || {
                        let response = handler.handle(request);
                        match encode_frame(&Frame::Response { id, response }) {
                            Ok(bytes) => {
                                let _ = replies.send(bytes);
                            }
                            Err(e) => warn!("[Tcp] cannot encode response {}: {}", id, e),
                        }
                    });
                }
                Ok(Some(Frame::Notify(request))) => {
                    let handler = handler.clone();
                    if tokio::task::spawn_blocking(move || handler.handle(request))
                        .await
                        .is_err()
                    {
                        warn!("[Tcp] notification handler panicked");
                    }
                }
                Ok(Some(Frame::Response { id, .. })) => {
                    warn!("[Tcp] stray response {} on a served connection", id)
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("[Tcp] dropping connection: {}", e);
                    break;
                }
            }
        }
    }
}

impl Transport for TcpTransport {
    fn request(
        &self,
        address: &str,
        request: Request,
        timeout: Duration,
    ) -> MtaskResult<Response> {
        let peer = self.peer(address)?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = bounded(1);
        peer.pending.lock().insert(id, Waiter::Blocking(tx));
        if !peer.alive.load(Ordering::Acquire) {
            peer.pending.lock().remove(&id);
            return Err(MtaskError::network(format!("link to {} lost", address)));
        }
        if let Err(e) = self.send(&peer, &Frame::Request { id, request }, address) {
            peer.pending.lock().remove(&id);
            return Err(e);
        }
        match rx.recv_timeout(timeout) {
            Ok(response) => Ok(response),
            Err(RecvTimeoutError::Timeout) => {
                peer.pending.lock().remove(&id);
                Err(MtaskError::Timeout(format!(
                    "no response from {} within {:?}",
                    address, timeout
                )))
            }
            Err(RecvTimeoutError::Disconnected) => Err(MtaskError::network(format!(
                "link to {} lost during the request",
                address
            ))),
        }
    }

    fn request_async(
        &self,
        address: &str,
        request: Request,
        timeout: Duration,
        on_reply: ReplyCallback,
    ) {
        let peer = match self.peer(address) {
            Ok(peer) => peer,
            Err(e) => return on_reply(Err(e)),
        };
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        peer.pending.lock().insert(id, Waiter::Callback(on_reply));
        let sent = if peer.alive.load(Ordering::Acquire) {
            self.send(&peer, &Frame::Request { id, request }, address)
        } else {
            Err(MtaskError::network(format!("link to {} lost", address)))
        };
        if let Err(e) = sent {
            let waiter = peer.pending.lock().remove(&id);
            if let Some(waiter) = waiter {
                waiter.resolve(Err(e));
            }
            return;
        }

        let pending = peer.pending.clone();
        let address = address.to_string();
        self.handle.spawn(async move {
            tokio::time::sleep(timeout).await;
            let waiter = pending.lock().remove(&id);
            if let Some(waiter) = waiter {
                waiter.resolve(Err(MtaskError::Timeout(format!(
                    "no response from {} within {:?}",
                    address, timeout
                ))));
            }
        });
    }

    fn notify(&self, address: &str, request: Request) -> MtaskResult<()> {
        let peer = self.peer(address)?;
        self.send(&peer, &Frame::Notify(request), address)
    }

    fn listen(&self, address: &str, handler: Arc<dyn RequestHandler>) -> MtaskResult<String> {
        let listener = std::net::TcpListener::bind(address)
            .map_err(|e| MtaskError::network(format!("failed to bind to {}: {}", address, e)))?;
        listener.set_nonblocking(true)?;
        let local = listener.local_addr()?.to_string();

        let _guard = self.handle.enter();
        let listener = TcpListener::from_std(listener)?;
        let connections = Arc::new(Mutex::new(Vec::new()));
        let accept = self.handle.spawn(Self::accept_loop(
            listener,
            handler,
            connections.clone(),
        ));
        self.listeners.lock().insert(
            local.clone(),
            Listener {
                accept,
                connections,
            },
        );
        log::info!("[Tcp] listening on {}", local);
        Ok(local)
    }

    fn stop(&self, address: &str) {
        if let Some(listener) = self.listeners.lock().remove(address) {
            listener.abort();
            log::info!("[Tcp] stopped listening on {}", address);
        }
    }

    fn name(&self) -> &'static str {
        "tcp"
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        for (_, listener) in self.listeners.lock().drain() {
            listener.abort();
        }
        let peers: Vec<(String, Arc<Peer>)> = self.peers.lock().drain().collect();
        for (address, peer) in peers {
            for task in &peer.tasks {
                task.abort();
            }
            Peer::fail_all(&peer.alive, &peer.pending, &address);
        }
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

impl std::fmt::Debug for TcpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpTransport")
            .field("peers", &self.peers.lock().len())
            .field("listeners", &self.listeners.lock().len())
            .finish()
    }
}
