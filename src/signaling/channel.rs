use crate::error::ChannelError;
use crate::signaling::message::SignalingMessage;
use crate::signaling::transport::{SignalLink, SignalTransport};
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub type OnMessageHdlrFn = Box<
    dyn (Fn(SignalingMessage) -> Pin<Box<dyn Future<Output = ()> + Send + 'static>>)
        + Send
        + Sync,
>;

pub type OnCloseHdlrFn = Box<
    dyn (Fn(ChannelError) -> Pin<Box<dyn Future<Output = ()> + Send + 'static>>) + Send + Sync,
>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Idle,
    Connecting,
    Open,
    Closed,
}

struct Inner {
    state: ChannelState,
    pending: VecDeque<String>,
    link_tx: Option<mpsc::UnboundedSender<String>>,
    task: Option<JoinHandle<()>>,
}

/// Ordered text channel to the paired peer through the relay.
///
/// Messages sent before the link is up are queued and flushed in FIFO order
/// when it opens. Cloning yields another handle to the same channel.
#[derive(Clone)]
pub struct SignalingChannel {
    transport: Arc<dyn SignalTransport>,
    inner: Arc<Mutex<Inner>>,
    on_message: Arc<Mutex<Option<Arc<OnMessageHdlrFn>>>>,
    on_close: Arc<Mutex<Option<Arc<OnCloseHdlrFn>>>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl SignalingChannel {
    pub fn new(transport: Arc<dyn SignalTransport>) -> Self {
        Self {
            transport,
            inner: Arc::new(Mutex::new(Inner {
                state: ChannelState::Idle,
                pending: VecDeque::new(),
                link_tx: None,
                task: None,
            })),
            on_message: Arc::new(Mutex::new(None)),
            on_close: Arc::new(Mutex::new(None)),
        }
    }

    pub fn state(&self) -> ChannelState {
        lock(&self.inner).state
    }

    /// Messages waiting for the link to open.
    pub fn pending_len(&self) -> usize {
        lock(&self.inner).pending.len()
    }

    /// Invoked once per inbound message, in arrival order.
    pub fn on_message(&self, f: OnMessageHdlrFn) {
        *lock(&self.on_message) = Some(Arc::new(f));
    }

    /// Invoked once when the link fails to open or is dropped by the remote
    /// side. Not invoked for a local [`SignalingChannel::close`].
    pub fn on_close(&self, f: OnCloseHdlrFn) {
        *lock(&self.on_close) = Some(Arc::new(f));
    }

    /// Starts connecting and returns immediately; sends issued meanwhile are queued.
    pub fn open(&self, endpoint: impl Into<String>) {
        let endpoint = endpoint.into();
        {
            let mut inner = lock(&self.inner);
            if inner.state != ChannelState::Idle {
                warn!("open({}) ignored, channel is {:?}", endpoint, inner.state);
                return;
            }
            inner.state = ChannelState::Connecting;
        }

        let this = self.clone();
        let handle = tokio::spawn(async move { this.run(endpoint).await });

        let mut inner = lock(&self.inner);
        if inner.state == ChannelState::Closed {
            handle.abort();
        } else {
            inner.task = Some(handle);
        }
    }

    pub fn send(&self, msg: &SignalingMessage) -> Result<(), ChannelError> {
        let text = msg.to_json();
        let mut inner = lock(&self.inner);
        match inner.state {
            ChannelState::Open => {
                let sent = inner
                    .link_tx
                    .as_ref()
                    .is_some_and(|tx| tx.send(text).is_ok());
                if sent {
                    debug!("Sent {} message", msg.kind());
                    Ok(())
                } else {
                    warn!("Failed to send {} message, link is gone", msg.kind());
                    Err(ChannelError::Dropped("link is gone".into()))
                }
            }
            ChannelState::Idle | ChannelState::Connecting => {
                inner.pending.push_back(text);
                debug!(
                    "Queued {} message, {} pending",
                    msg.kind(),
                    inner.pending.len()
                );
                Ok(())
            }
            ChannelState::Closed => {
                debug!("Dropping {} message, channel closed", msg.kind());
                Err(ChannelError::Closed)
            }
        }
    }

    /// Closes the channel and discards the pending queue. Idempotent; returns
    /// true only when a link or connection attempt was actually released.
    pub fn close(&self) -> bool {
        let mut inner = lock(&self.inner);
        let was = inner.state;
        if was == ChannelState::Closed {
            return false;
        }
        inner.state = ChannelState::Closed;
        inner.pending.clear();
        inner.link_tx = None;
        if let Some(task) = inner.task.take() {
            task.abort();
        }
        if was != ChannelState::Idle {
            info!("Signaling channel closed");
        }
        matches!(was, ChannelState::Connecting | ChannelState::Open)
    }

    async fn run(self, endpoint: String) {
        let link = match self.transport.connect(&endpoint).await {
            Ok(link) => link,
            Err(e) => {
                error!("Signaling channel failed to open: {}", e);
                self.finish(e).await;
                return;
            }
        };
        let SignalLink {
            outgoing,
            mut incoming,
        } = link;

        {
            let mut inner = lock(&self.inner);
            if inner.state == ChannelState::Closed {
                return;
            }
            let queued = inner.pending.len();
            while let Some(text) = inner.pending.pop_front() {
                if outgoing.send(text).is_err() {
                    break;
                }
            }
            inner.state = ChannelState::Open;
            inner.link_tx = Some(outgoing);
            info!("Signaling channel open at {}, flushed {} queued", endpoint, queued);
        }

        while let Some(text) = incoming.recv().await {
            match SignalingMessage::parse(&text) {
                Ok(msg) => {
                    let handler = lock(&self.on_message).clone();
                    if let Some(f) = handler {
                        f(msg).await;
                    }
                }
                Err(e) => debug!("Dropping inbound message: {}", e),
            }
        }

        self.finish(ChannelError::Dropped("relay closed the connection".into()))
            .await;
    }

    async fn finish(&self, reason: ChannelError) {
        {
            let mut inner = lock(&self.inner);
            if inner.state == ChannelState::Closed {
                return;
            }
            inner.state = ChannelState::Closed;
            inner.pending.clear();
            inner.link_tx = None;
            inner.task = None;
        }
        warn!("Signaling channel lost: {}", reason);
        let handler = lock(&self.on_close).clone();
        if let Some(f) = handler {
            f(reason).await;
        }
    }
}
