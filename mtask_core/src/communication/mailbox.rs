//! Bounded multi-producer, single-consumer queue of pending invocations.
//!
//! Every cross-thread call into a component goes through its mailbox, so the
//! component's commands are only ever executed by its own thread, one at a
//! time, in arrival order.

use crate::core::payload::{BoxedValue, ReplyValue, Value};
use crate::core::result::ExecutionResult;
use crossbeam::channel::Sender;
use crossbeam::queue::ArrayQueue;
use parking_lot::{Condvar, Mutex, RwLock};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::Duration;

/// Default number of pending entries per mailbox
pub const DEFAULT_MAILBOX_CAPACITY: usize = 64;

/// Type-erased command or event body. The argument is absent for Void roles.
pub type Handler = Arc<dyn Fn(Option<&dyn Value>) -> Option<BoxedValue> + Send + Sync>;

/// Outcome sent back to a blocked caller
pub type CallReply = (ExecutionResult, Option<ReplyValue>);

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Run a command or event body, turning a panic into an error message.
pub(crate) fn run_handler(
    handler: &Handler,
    argument: Option<&dyn Value>,
) -> Result<Option<BoxedValue>, String> {
    catch_unwind(AssertUnwindSafe(|| handler(argument)))
        .map_err(|payload| panic_message(payload.as_ref()))
}

/// One-shot "finished" callback of an asynchronous call.
///
/// When `deliver_to` is set the callback is queued onto that (the caller's)
/// mailbox and runs on the caller's thread. Otherwise it runs on whichever
/// thread completes the call.
pub struct Completion {
    label: String,
    callback: Box<dyn FnOnce(ExecutionResult, Option<ReplyValue>) + Send>,
    deliver_to: Option<Mailbox>,
}

impl Completion {
    pub fn new<F>(label: impl Into<String>, deliver_to: Option<Mailbox>, callback: F) -> Self
    where
        F: FnOnce(ExecutionResult, Option<ReplyValue>) + Send + 'static,
    {
        Self {
            label: label.into(),
            callback: Box::new(callback),
            deliver_to,
        }
    }

    pub fn complete(self, result: ExecutionResult, output: Option<ReplyValue>) {
        let Completion {
            label,
            callback,
            deliver_to,
        } = self;
        match deliver_to {
            Some(mailbox) => {
                let entry =
                    MailboxEntry::notify(label.clone(), move || callback(result, output));
                let pushed = mailbox.push(entry);
                if pushed.is_err() {
                    log::warn!(
                        "completion of '{}' dropped: caller mailbox '{}' returned {}",
                        label,
                        mailbox.name(),
                        pushed
                    );
                }
            }
            None => callback(result, output),
        }
    }
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("label", &self.label)
            .field("queued", &self.deliver_to.is_some())
            .finish()
    }
}

/// How the result of a queued invocation reaches the caller
pub enum Reply {
    /// Fire and forget
    None,
    /// The caller is blocked on the receiving end
    Blocking(Sender<CallReply>),
    /// The caller registered a finished callback
    Finished(Completion),
}

impl Reply {
    fn send(self, result: ExecutionResult, output: Option<BoxedValue>) {
        match self {
            Reply::None => {}
            Reply::Blocking(tx) => {
                // The waiter may have timed out already
                let _ = tx.send((result, output.map(ReplyValue::Local)));
            }
            Reply::Finished(completion) => {
                completion.complete(result, output.map(ReplyValue::Local))
            }
        }
    }
}

enum Work {
    Invoke {
        handler: Handler,
        argument: Option<BoxedValue>,
        reply: Reply,
    },
    Notify(Box<dyn FnOnce() + Send>),
}

/// A pending invocation, owning its argument until the owner thread runs it.
pub struct MailboxEntry {
    label: String,
    work: Work,
}

impl MailboxEntry {
    pub fn invoke(
        label: impl Into<String>,
        handler: Handler,
        argument: Option<BoxedValue>,
        reply: Reply,
    ) -> Self {
        Self {
            label: label.into(),
            work: Work::Invoke {
                handler,
                argument,
                reply,
            },
        }
    }

    pub fn notify<F: FnOnce() + Send + 'static>(label: impl Into<String>, f: F) -> Self {
        Self {
            label: label.into(),
            work: Work::Notify(Box::new(f)),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Run the entry on the owner thread. A panicking body is reported to
    /// the caller as `CommandFailed`; false is returned.
    fn execute(self, mailbox: &str) -> bool {
        let label = self.label;
        let failure = match self.work {
            Work::Invoke {
                handler,
                argument,
                reply,
            } => match run_handler(&handler, argument.as_deref()) {
                Ok(output) => {
                    reply.send(ExecutionResult::Succeeded, output);
                    None
                }
                Err(message) => {
                    reply.send(ExecutionResult::CommandFailed, None);
                    Some(message)
                }
            },
            Work::Notify(f) => catch_unwind(AssertUnwindSafe(f))
                .err()
                .map(|payload| panic_message(payload.as_ref())),
        };
        match failure {
            Some(message) => {
                log::error!("mailbox '{}': '{}' panicked: {}", mailbox, label, message);
                false
            }
            None => true,
        }
    }

    fn reject(self) {
        if let Work::Invoke { reply, .. } = self.work {
            reply.send(ExecutionResult::Disabled, None);
        }
    }
}

impl fmt::Debug for MailboxEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MailboxEntry")
            .field("label", &self.label)
            .finish()
    }
}

/// Wakes the owner thread when mail arrives or its lifecycle changes.
#[derive(Default)]
pub struct Doorbell {
    rung: Mutex<bool>,
    signal: Condvar,
}

impl Doorbell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ring(&self) {
        let mut rung = self.rung.lock();
        *rung = true;
        self.signal.notify_all();
    }

    /// Wait until rung or `timeout` elapses. Returns true if it was rung.
    pub fn wait(&self, timeout: Duration) -> bool {
        let mut rung = self.rung.lock();
        if !*rung {
            self.signal.wait_for(&mut rung, timeout);
        }
        std::mem::replace(&mut *rung, false)
    }
}

/// Lock-free counters
#[derive(Debug, Default)]
pub struct MailboxMetrics {
    pub pushed: AtomicU64,
    pub rejected_full: AtomicU64,
    pub rejected_closed: AtomicU64,
    pub executed: AtomicU64,
    pub failed: AtomicU64,
}

struct MailboxInner {
    name: String,
    queue: ArrayQueue<MailboxEntry>,
    /// Write-locked only by `close`; pushes hold the read lock so that no
    /// entry is accepted once `close` returns.
    closed: RwLock<bool>,
    owner: Mutex<Option<ThreadId>>,
    doorbell: Arc<Doorbell>,
    metrics: MailboxMetrics,
}

/// Cloneable handle to a mailbox
#[derive(Clone)]
pub struct Mailbox {
    inner: Arc<MailboxInner>,
}

impl Mailbox {
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        Self::with_doorbell(name, capacity, Arc::new(Doorbell::new()))
    }

    /// Mailbox sharing a doorbell with its owner's other mailboxes
    pub fn with_doorbell(name: impl Into<String>, capacity: usize, doorbell: Arc<Doorbell>) -> Self {
        Self {
            inner: Arc::new(MailboxInner {
                name: name.into(),
                queue: ArrayQueue::new(capacity.max(1)),
                closed: RwLock::new(false),
                owner: Mutex::new(None),
                doorbell,
                metrics: MailboxMetrics::default(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn capacity(&self) -> usize {
        self.inner.queue.capacity()
    }

    pub fn len(&self) -> usize {
        self.inner.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.queue.is_empty()
    }

    pub fn metrics(&self) -> &MailboxMetrics {
        &self.inner.metrics
    }

    pub fn doorbell(&self) -> &Arc<Doorbell> {
        &self.inner.doorbell
    }

    /// Append an entry. Never blocks: a full or closed mailbox drops the entry
    /// and reports `MailboxFull` or `Disabled`.
    pub fn push(&self, entry: MailboxEntry) -> ExecutionResult {
        let closed = self.inner.closed.read();
        if *closed {
            self.inner
                .metrics
                .rejected_closed
                .fetch_add(1, Ordering::Relaxed);
            return ExecutionResult::Disabled;
        }
        match self.inner.queue.push(entry) {
            Ok(()) => {
                drop(closed);
                self.inner.metrics.pushed.fetch_add(1, Ordering::Relaxed);
                self.inner.doorbell.ring();
                ExecutionResult::Queued
            }
            Err(entry) => {
                self.inner
                    .metrics
                    .rejected_full
                    .fetch_add(1, Ordering::Relaxed);
                log::warn!(
                    "mailbox '{}' full ({} entries), dropping '{}'",
                    self.inner.name,
                    self.capacity(),
                    entry.label
                );
                ExecutionResult::MailboxFull
            }
        }
    }

    /// Execute the entries present when the call starts, in arrival order.
    ///
    /// Must only be called from the owner thread.
    pub fn drain_all(&self) -> usize {
        let pending = self.inner.queue.len();
        let mut executed = 0;
        for _ in 0..pending {
            match self.inner.queue.pop() {
                Some(entry) => {
                    if !entry.execute(&self.inner.name) {
                        self.inner.metrics.failed.fetch_add(1, Ordering::Relaxed);
                    }
                    executed += 1;
                }
                None => break,
            }
        }
        if executed > 0 {
            self.inner
                .metrics
                .executed
                .fetch_add(executed as u64, Ordering::Relaxed);
        }
        executed
    }

    /// Refuse every future push. Idempotent.
    pub fn close(&self) {
        *self.inner.closed.write() = true;
        self.inner.doorbell.ring();
    }

    pub fn is_closed(&self) -> bool {
        *self.inner.closed.read()
    }

    /// Fail whatever is still queued with `Disabled`, waking blocked callers.
    pub fn reject_remaining(&self) -> usize {
        let mut rejected = 0;
        while let Some(entry) = self.inner.queue.pop() {
            log::debug!(
                "mailbox '{}' rejecting '{}' after close",
                self.inner.name,
                entry.label
            );
            entry.reject();
            rejected += 1;
        }
        rejected
    }

    /// Record the calling thread as the single consumer
    pub fn bind_owner_thread(&self) {
        *self.inner.owner.lock() = Some(thread::current().id());
    }

    pub fn is_owner_thread(&self) -> bool {
        *self.inner.owner.lock() == Some(thread::current().id())
    }

    pub fn ptr_eq(&self, other: &Mailbox) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for Mailbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mailbox")
            .field("name", &self.inner.name)
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .field("closed", &self.is_closed())
            .finish()
    }
}
