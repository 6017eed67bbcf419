//! Client side of the bridge.

use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::stream::{self, Stream};
use futures_util::StreamExt;
use hearth_cache::{
    ListenError, Listener, RemoteStore, SnapshotStream, StoreError, WriteOp, WriteReceipt,
};
use hearth_core::{Handle, Snapshot};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, trace, warn};
use uuid::Uuid;

use crate::{BridgeError, BridgeEvent, BridgeRequest, QueryOptions, Target, WireError, WireSnapshot};

type Reply = Result<Value, WireError>;
type SubscriptionSender = mpsc::UnboundedSender<Result<Snapshot, ListenError>>;

struct ClientInner {
    requests: mpsc::UnboundedSender<BridgeRequest>,
    subscriptions: DashMap<Uuid, SubscriptionSender>,
    pending: DashMap<Uuid, oneshot::Sender<Reply>>,
    connected: AtomicBool,
}

impl ClientInner {
    fn dispatch(&self, event: BridgeEvent) {
        match event {
            BridgeEvent::Value {
                subscription_id,
                value,
            } => match self.subscriptions.get(&subscription_id) {
                Some(tx) => {
                    if tx.send(Ok(value.into_snapshot())).is_err() {
                        trace!(%subscription_id, "value for dropped subscription");
                    }
                }
                None => trace!(%subscription_id, "value for unknown subscription"),
            },
            BridgeEvent::Error {
                subscription_id,
                error,
            } => {
                if let Some((_, tx)) = self.subscriptions.remove(&subscription_id) {
                    let _ = tx.send(Err(error.into_listen_error()));
                }
            }
            BridgeEvent::Complete { subscription_id } => {
                self.subscriptions.remove(&subscription_id);
            }
            BridgeEvent::Reply {
                request_id,
                value,
                error,
            } => {
                let Some((_, tx)) = self.pending.remove(&request_id) else {
                    warn!(%request_id, "reply for unknown request");
                    return;
                };
                let reply = match error {
                    Some(error) => Err(error),
                    None => Ok(value.unwrap_or(Value::Null)),
                };
                let _ = tx.send(reply);
            }
        }
    }

    /// Fail every open subscription and pending request.
    fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        let open: Vec<Uuid> = self.subscriptions.iter().map(|e| *e.key()).collect();
        for id in open {
            if let Some((_, tx)) = self.subscriptions.remove(&id) {
                let _ = tx.send(Err(ListenError::Unavailable("worker disconnected".into())));
            }
        }
        self.pending.clear();
    }
}

/// Talks to a [`WorkerHost`](crate::WorkerHost) and presents it as a
/// [`RemoteStore`], so a `LiveCache` can run on top of a store that lives
/// in another process.
///
/// Cloning is cheap; clones share the connection.
#[derive(Clone)]
pub struct WorkerClient {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for WorkerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerClient")
            .field("subscriptions", &self.inner.subscriptions.len())
            .field("pending", &self.inner.pending.len())
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl WorkerClient {
    /// Start talking to a host. Must be called within a Tokio runtime.
    pub fn connect<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (requests, outgoing) = mpsc::unbounded_channel();
        let inner = Arc::new(ClientInner {
            requests,
            subscriptions: DashMap::new(),
            pending: DashMap::new(),
            connected: AtomicBool::new(true),
        });

        tokio::spawn(async move {
            if let Err(e) = write_requests(writer, outgoing).await {
                error!(error = %e, "request writer failed");
            }
        });

        // Only clients keep the request channel open; the reader must not.
        let reading = Arc::downgrade(&inner);
        tokio::spawn(async move {
            if let Err(e) = read_events(reader, &reading).await {
                error!(error = %e, "event reader failed");
            }
            debug!("worker connection closed");
            if let Some(inner) = reading.upgrade() {
                inner.disconnect();
            }
        });

        Self { inner }
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    /// Number of subscriptions the host is still serving for this client.
    pub fn open_subscriptions(&self) -> usize {
        self.inner.subscriptions.len()
    }

    /// Subscribe to `handle`, asking the host to expand references.
    pub fn listen_with(&self, handle: &Handle, options: QueryOptions) -> SnapshotStream {
        let subscription_id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.subscriptions.insert(subscription_id, tx);

        let request = BridgeRequest::Subscribe {
            subscription_id,
            target: Target::from(handle),
            options,
        };
        if !self.is_connected() || self.inner.requests.send(request).is_err() {
            self.inner.subscriptions.remove(&subscription_id);
            return stream::once(async {
                Err::<Snapshot, _>(ListenError::Unavailable("worker disconnected".into()))
            })
            .boxed();
        }
        trace!(%subscription_id, key = %handle.key(), "remote subscription opened");

        RemoteSubscription {
            id: subscription_id,
            rx,
            inner: self.inner.clone(),
        }
        .boxed()
    }

    /// Read `handle` once, asking the host to expand references.
    pub async fn get_with(&self, handle: &Handle, options: QueryOptions) -> Result<Snapshot, StoreError> {
        let request_id = Uuid::new_v4();
        let value = self
            .request(
                request_id,
                BridgeRequest::Get {
                    request_id,
                    target: Target::from(handle),
                    options,
                },
            )
            .await?;
        let snapshot: WireSnapshot = serde_json::from_value(value).map_err(BridgeError::from)?;
        Ok(snapshot.into_snapshot())
    }

    async fn request(&self, request_id: Uuid, request: BridgeRequest) -> Result<Value, BridgeError> {
        let (tx, rx) = oneshot::channel();
        self.inner.pending.insert(request_id, tx);
        if !self.is_connected() || self.inner.requests.send(request).is_err() {
            self.inner.pending.remove(&request_id);
            return Err(BridgeError::Disconnected);
        }
        match rx.await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(error)) => Err(BridgeError::Store(error.into_store_error())),
            Err(_) => Err(BridgeError::Disconnected),
        }
    }
}

impl Listener for WorkerClient {
    fn listen(&self, handle: &Handle) -> SnapshotStream {
        self.listen_with(handle, QueryOptions::default())
    }
}

#[async_trait]
impl RemoteStore for WorkerClient {
    async fn get(&self, handle: &Handle) -> Result<Snapshot, StoreError> {
        self.get_with(handle, QueryOptions::default()).await
    }

    async fn commit(&self, writes: Vec<WriteOp>) -> Result<WriteReceipt, StoreError> {
        let request_id = Uuid::new_v4();
        let value = self
            .request(request_id, BridgeRequest::Write { request_id, writes })
            .await?;
        Ok(serde_json::from_value(value).map_err(BridgeError::from)?)
    }
}

/// Values for one remote subscription. Dropping it unsubscribes.
struct RemoteSubscription {
    id: Uuid,
    rx: mpsc::UnboundedReceiver<Result<Snapshot, ListenError>>,
    inner: Arc<ClientInner>,
}

impl Stream for RemoteSubscription {
    type Item = Result<Snapshot, ListenError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for RemoteSubscription {
    fn drop(&mut self) {
        // Already over if the host completed or failed it.
        if self.inner.subscriptions.remove(&self.id).is_none() {
            return;
        }
        let request = BridgeRequest::Unsubscribe {
            subscription_id: self.id,
        };
        if self.inner.requests.send(request).is_err() {
            trace!(subscription_id = %self.id, "connection gone; nothing to unsubscribe");
        }
    }
}

async fn read_events<R>(reader: R, inner: &Weak<ClientInner>) -> Result<(), BridgeError>
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let event = match serde_json::from_str::<BridgeEvent>(&line) {
            Ok(event) => event,
            Err(e) => {
                error!(error = %e, "failed to parse event");
                continue;
            }
        };
        match inner.upgrade() {
            Some(inner) => inner.dispatch(event),
            None => return Ok(()),
        }
    }
    Ok(())
}

async fn write_requests<W>(
    mut writer: W,
    mut outgoing: mpsc::UnboundedReceiver<BridgeRequest>,
) -> Result<(), BridgeError>
where
    W: AsyncWrite + Unpin,
{
    while let Some(request) = outgoing.recv().await {
        let line = serde_json::to_string(&request)?;
        writer.write_all(line.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
    }
    writer.shutdown().await?;
    Ok(())
}
