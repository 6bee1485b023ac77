/**
 * p2p/channel.rs
 *
 * Topic-addressed request/reply channel over traversed UDP sockets
 */

use super::frame::{Frame, FrameKind, Status, MAX_FRAME_LEN};
use crate::error::ChannelError;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

/// Request ids remembered for duplicate suppression
const RECENT_REQUESTS: usize = 512;

/// Payload exchanged over a channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub topic: String,
    pub data: Vec<u8>,
}

impl Message {
    pub fn new(topic: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            data: data.into(),
        }
    }
}

enum Reply {
    Ok(Vec<u8>),
    Error(String),
}

/// One inbound request. Replying consumes the context, so a request can be
/// answered at most once. A handler that returns `Ok` without replying sends
/// an empty OK reply; one that returns `Err` sends the error text.
pub struct Context {
    request: Message,
    reply: oneshot::Sender<Reply>,
}

impl Context {
    pub fn topic(&self) -> &str {
        &self.request.topic
    }

    pub fn request(&self) -> &Message {
        &self.request
    }

    pub fn data(&self) -> &[u8] {
        &self.request.data
    }

    /// Acknowledge with an empty reply
    pub fn ok(self) -> anyhow::Result<()> {
        self.ok_with_reply(Vec::new())
    }

    pub fn ok_with_reply(self, data: impl Into<Vec<u8>>) -> anyhow::Result<()> {
        let _ = self.reply.send(Reply::Ok(data.into()));
        Ok(())
    }

    /// Answer with an error the caller sees as `ChannelError::Remote`
    pub fn error(self, reason: impl Into<String>) -> anyhow::Result<()> {
        let _ = self.reply.send(Reply::Error(reason.into()));
        Ok(())
    }
}

type Handler = Arc<dyn Fn(Context) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

type Waiter = oneshot::Sender<Result<Message, ChannelError>>;

#[derive(Default)]
struct PendingTable {
    closed: bool,
    waiters: HashMap<u64, Waiter>,
}

enum Seen {
    New,
    InFlight,
    Answered(Vec<u8>),
}

/// Recently handled request ids and their encoded replies
#[derive(Default)]
struct RecentRequests {
    order: VecDeque<u64>,
    replies: HashMap<u64, Option<Vec<u8>>>,
}

impl RecentRequests {
    fn check(&mut self, id: u64) -> Seen {
        match self.replies.get(&id) {
            Some(Some(reply)) => Seen::Answered(reply.clone()),
            Some(None) => Seen::InFlight,
            None => {
                if self.order.len() == RECENT_REQUESTS {
                    if let Some(oldest) = self.order.pop_front() {
                        self.replies.remove(&oldest);
                    }
                }
                self.order.push_back(id);
                self.replies.insert(id, None);
                Seen::New
            }
        }
    }

    fn answer(&mut self, id: u64, reply: Vec<u8>) {
        if let Some(slot) = self.replies.get_mut(&id) {
            *slot = Some(reply);
        }
    }
}

struct Inner {
    sockets: Vec<UdpSocket>,
    peers: Vec<SocketAddr>,
    pending: Mutex<PendingTable>,
    handlers: RwLock<HashMap<String, Handler>>,
    recent: Mutex<RecentRequests>,
    next_id: AtomicU64,
    rotation: AtomicUsize,
    live_readers: AtomicUsize,
    resend_interval: Duration,
    closed: watch::Sender<bool>,
}

/// Multiplexed request/reply channel to one peer.
///
/// Clones share the channel. It stays up until `close` is called, the peer
/// closes it, or every socket fails; handlers keep being served until then.
/// Registering a handler for a topic that already has one replaces it.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<Inner>,
}

impl Channel {
    /// Take ownership of connected sockets and start serving them.
    /// Must be called from within a tokio runtime.
    pub fn new(sockets: Vec<UdpSocket>, resend_interval: Duration) -> Result<Self, ChannelError> {
        let channel = Self::idle(sockets, resend_interval)?;
        channel.start();
        Ok(channel)
    }

    /// Build the channel without reading from its sockets yet, so handlers
    /// can be installed before the first request is dispatched
    pub(crate) fn idle(sockets: Vec<UdpSocket>, resend_interval: Duration) -> Result<Self, ChannelError> {
        if sockets.is_empty() {
            return Err(ChannelError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                "channel needs at least one socket",
            )));
        }
        let peers = sockets
            .iter()
            .map(|s| s.peer_addr())
            .collect::<io::Result<Vec<_>>>()?;

        let (closed, _) = watch::channel(false);
        let inner = Arc::new(Inner {
            live_readers: AtomicUsize::new(sockets.len()),
            sockets,
            peers,
            pending: Mutex::new(PendingTable::default()),
            handlers: RwLock::new(HashMap::new()),
            recent: Mutex::new(RecentRequests::default()),
            next_id: AtomicU64::new(1),
            rotation: AtomicUsize::new(0),
            resend_interval,
            closed,
        });
        Ok(Self { inner })
    }

    pub(crate) fn start(&self) {
        for index in 0..self.inner.sockets.len() {
            tokio::spawn(read_loop(Arc::clone(&self.inner), index));
        }
        debug!(peers = ?self.inner.peers, "channel open");
    }

    /// Send `data` on `topic` and wait for the peer's reply
    pub async fn send(&self, topic: &str, data: impl Into<Vec<u8>>, timeout: Duration) -> Result<Message, ChannelError> {
        let inner = &self.inner;
        let id = inner.next_id.fetch_add(1, Ordering::Relaxed);
        let bytes = Frame::request(id, topic, data.into()).encode()?;

        let (tx, mut rx) = oneshot::channel();
        {
            let mut pending = lock(&inner.pending);
            if pending.closed {
                return Err(ChannelError::Closed);
            }
            pending.waiters.insert(id, tx);
        }
        let _guard = PendingGuard { inner, id };

        let deadline = tokio::time::sleep_until(Instant::now() + timeout);
        tokio::pin!(deadline);
        let mut resend = tokio::time::interval(inner.resend_interval);
        let mut slot = inner.rotation.fetch_add(1, Ordering::Relaxed);
        let mut first = true;

        loop {
            tokio::select! {
                reply = &mut rx => return reply.unwrap_or(Err(ChannelError::Closed)),
                _ = &mut deadline => {
                    debug!(id, topic, "request timed out");
                    return Err(ChannelError::Timeout);
                }
                _ = resend.tick() => {
                    trace!(id, topic, first, "transmitting request");
                    if let Err(e) = inner.write_frame(&bytes, slot).await {
                        if first {
                            return Err(e);
                        }
                        debug!(id, error = %e, "retransmission failed");
                    }
                    slot = slot.wrapping_add(1);
                    first = false;
                }
            }
        }
    }

    /// Register the handler for `topic`, replacing any previous one
    pub fn handle<F, Fut>(&self, topic: impl Into<String>, handler: F)
    where
        F: Fn(Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let topic = topic.into();
        let handler: Handler = Arc::new(move |ctx| -> BoxFuture<'static, anyhow::Result<()>> {
            Box::pin(handler(ctx))
        });
        let replaced = self
            .inner
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(topic.clone(), handler)
            .is_some();
        debug!(topic = %topic, replaced, "handler registered");
    }

    /// Tear the channel down and tell the peer. Pending sends fail with
    /// `ChannelError::Closed`.
    pub async fn close(&self) {
        if !self.inner.shutdown() {
            return;
        }
        if let Ok(bytes) = Frame::close().encode() {
            for socket in &self.inner.sockets {
                let _ = socket.send(&bytes).await;
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        *self.inner.closed.borrow()
    }

    /// Resolves once the channel has been torn down, locally or by the peer
    pub async fn closed(&self) {
        let mut rx = self.inner.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    pub fn socket_count(&self) -> usize {
        self.inner.sockets.len()
    }

    pub fn peer_addrs(&self) -> &[SocketAddr] {
        &self.inner.peers
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("peers", &self.inner.peers)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// Drops the waiter when `send` returns or is cancelled, so a late reply
/// finds nothing to resolve
struct PendingGuard<'a> {
    inner: &'a Inner,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        lock(&self.inner.pending).waiters.remove(&self.id);
    }
}

impl Inner {
    /// Returns false if the channel was already closed
    fn shutdown(&self) -> bool {
        let waiters = {
            let mut pending = lock(&self.pending);
            if pending.closed {
                return false;
            }
            pending.closed = true;
            std::mem::take(&mut pending.waiters)
        };
        let failed = waiters.len();
        for (_, waiter) in waiters {
            let _ = waiter.send(Err(ChannelError::Closed));
        }
        self.closed.send_replace(true);
        debug!(peers = ?self.peers, failed, "channel closed");
        true
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Write on the preferred socket, falling back to the others in turn
    async fn write_frame(&self, bytes: &[u8], preferred: usize) -> Result<(), ChannelError> {
        let count = self.sockets.len();
        let mut last_error = None;
        for offset in 0..count {
            let index = (preferred + offset) % count;
            match self.sockets[index].send(bytes).await {
                Ok(_) => return Ok(()),
                Err(e) => {
                    trace!(socket = index, error = %e, "write failed, trying next socket");
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.map_or(ChannelError::Closed, ChannelError::Io))
    }

    fn dispatch(self: &Arc<Self>, datagram: &[u8], socket: usize) {
        let frame = match Frame::decode(datagram) {
            Ok(frame) => frame,
            Err(e) => {
                trace!(socket, error = %e, "ignoring non-frame datagram");
                return;
            }
        };

        match frame.kind {
            FrameKind::Reply => self.resolve(frame),
            FrameKind::Request => self.serve(frame, socket),
            FrameKind::Close => {
                debug!(peers = ?self.peers, "peer closed the channel");
                self.shutdown();
            }
        }
    }

    fn resolve(&self, frame: Frame) {
        let Some(waiter) = lock(&self.pending).waiters.remove(&frame.id) else {
            trace!(id = frame.id, "discarding reply for unknown or resolved request");
            return;
        };
        let result = match frame.status {
            Status::Ok => Ok(Message {
                topic: frame.topic,
                data: frame.data,
            }),
            Status::Error => Err(ChannelError::Remote(
                String::from_utf8_lossy(&frame.data).into_owned(),
            )),
            Status::UnknownTopic => Err(ChannelError::UnknownTopic(frame.topic)),
        };
        let _ = waiter.send(result);
    }

    fn serve(self: &Arc<Self>, frame: Frame, socket: usize) {
        let id = frame.id;
        match lock(&self.recent).check(id) {
            Seen::New => {}
            Seen::InFlight => {
                trace!(id, "request already being handled");
                return;
            }
            Seen::Answered(reply) => {
                trace!(id, "repeating reply for duplicate request");
                let inner = Arc::clone(self);
                tokio::spawn(async move {
                    let _ = inner.write_frame(&reply, socket).await;
                });
                return;
            }
        }

        let handler = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&frame.topic)
            .cloned();
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let reply = match handler {
                Some(handler) => run_handler(handler, frame).await,
                None => {
                    debug!(topic = %frame.topic, "request for unknown topic");
                    Frame::reply(id, Status::UnknownTopic, frame.topic, Vec::new())
                }
            };
            let bytes = match reply.encode() {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(id, error = %e, "reply cannot be sent");
                    match Frame::reply(id, Status::Error, reply.topic, e.to_string().into_bytes()).encode() {
                        Ok(bytes) => bytes,
                        Err(_) => return,
                    }
                }
            };
            lock(&inner.recent).answer(id, bytes.clone());
            if inner.is_closed() {
                return;
            }
            if let Err(e) = inner.write_frame(&bytes, socket).await {
                debug!(id, error = %e, "reply write failed");
            }
        });
    }
}

async fn run_handler(handler: Handler, frame: Frame) -> Frame {
    let (tx, rx) = oneshot::channel();
    let ctx = Context {
        request: Message {
            topic: frame.topic.clone(),
            data: frame.data,
        },
        reply: tx,
    };

    let outcome = match AssertUnwindSafe(handler(ctx)).catch_unwind().await {
        Ok(outcome) => outcome,
        Err(_) => {
            warn!(topic = %frame.topic, "handler panicked");
            Err(anyhow::anyhow!("handler panicked"))
        }
    };

    let (status, data) = match (rx.await, outcome) {
        (Ok(Reply::Ok(data)), _) => (Status::Ok, data),
        (Ok(Reply::Error(reason)), _) => (Status::Error, reason.into_bytes()),
        (Err(_), Err(e)) => (Status::Error, format!("{:#}", e).into_bytes()),
        (Err(_), Ok(())) => (Status::Ok, Vec::new()),
    };
    Frame::reply(frame.id, status, frame.topic, data)
}

async fn read_loop(inner: Arc<Inner>, index: usize) {
    let mut closed = inner.closed.subscribe();
    let mut buffer = vec![0u8; MAX_FRAME_LEN];

    loop {
        tokio::select! {
            _ = closed.wait_for(|closed| *closed).map(|_| ()) => break,
            received = inner.sockets[index].recv(&mut buffer) => match received {
                Ok(len) => inner.dispatch(&buffer[..len], index),
                // ICMP unreachable from a pairing the peer did not keep
                Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => {
                    trace!(socket = index, "peer port unreachable");
                }
                Err(e) => {
                    warn!(socket = index, error = %e, "socket read failed");
                    break;
                }
            }
        }
    }

    if inner.live_readers.fetch_sub(1, Ordering::AcqRel) == 1 && !inner.is_closed() {
        debug!("all channel sockets failed");
        inner.shutdown();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
