//! Worker side of the bridge: serves a store over a line-delimited channel.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures_util::StreamExt;
use hearth_cache::RemoteStore;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::expand::expand_snapshot;
use crate::{BridgeError, BridgeEvent, BridgeRequest, QueryOptions, Target, WireError, WireSnapshot};

/// A running subscription; `token` tells a replaced task from its successor.
struct Running {
    token: u64,
    task: AbortHandle,
}

/// Runs a [`RemoteStore`] on behalf of a client in another process.
///
/// Each `Subscribe` request opens one store listener; its values are sent
/// back as `Value` events until the client unsubscribes, the listener
/// fails, or the channel closes.
pub struct WorkerHost<S> {
    store: Arc<S>,
    subscriptions: Arc<DashMap<Uuid, Running>>,
    next_token: AtomicU64,
}

impl<S: RemoteStore> WorkerHost<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            subscriptions: Arc::new(DashMap::new()),
            next_token: AtomicU64::new(0),
        }
    }

    /// Number of subscriptions currently running.
    pub fn active_subscriptions(&self) -> usize {
        self.subscriptions.len()
    }

    /// Serve requests from `reader` until it closes, writing events to
    /// `writer`.
    pub async fn serve<R, W>(&self, reader: R, writer: W) -> Result<(), BridgeError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        info!("worker host starting");
        let (events, outgoing) = mpsc::unbounded_channel();
        let writer_task = tokio::spawn(write_events(writer, outgoing));

        let mut lines = BufReader::new(reader).lines();
        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<BridgeRequest>(&line) {
                Ok(request) => self.handle_request(request, &events),
                Err(e) => error!(error = %e, "failed to parse request"),
            }
        }

        let open = self.subscriptions.len();
        for running in self.subscriptions.iter() {
            running.task.abort();
        }
        self.subscriptions.clear();
        drop(events);
        info!(open, "worker host shutting down");

        match writer_task.await {
            Ok(result) => result,
            Err(e) => Err(BridgeError::Protocol(format!("event writer failed: {e}"))),
        }
    }

    fn handle_request(&self, request: BridgeRequest, events: &mpsc::UnboundedSender<BridgeEvent>) {
        match request {
            BridgeRequest::Subscribe {
                subscription_id,
                target,
                options,
            } => self.subscribe(subscription_id, target, options, events.clone()),
            BridgeRequest::Unsubscribe { subscription_id } => {
                match self.subscriptions.remove(&subscription_id) {
                    Some((_, running)) => {
                        running.task.abort();
                        debug!(%subscription_id, "unsubscribed");
                    }
                    None => debug!(%subscription_id, "unsubscribe for unknown subscription"),
                }
            }
            BridgeRequest::Get {
                request_id,
                target,
                options,
            } => {
                let store = self.store.clone();
                let events = events.clone();
                tokio::spawn(async move {
                    let reply = match get(store.as_ref(), &target, &options).await {
                        Ok(value) => BridgeEvent::success(request_id, value),
                        Err(e) => BridgeEvent::failure(request_id, WireError::from(&e)),
                    };
                    let _ = events.send(reply);
                });
            }
            BridgeRequest::Write { request_id, writes } => {
                let store = self.store.clone();
                let events = events.clone();
                tokio::spawn(async move {
                    let reply = match store.commit(writes).await {
                        Ok(receipt) => match serde_json::to_value(&receipt) {
                            Ok(value) => BridgeEvent::success(request_id, value),
                            Err(e) => BridgeEvent::failure(
                                request_id,
                                WireError::from(&BridgeError::from(e)),
                            ),
                        },
                        Err(e) => BridgeEvent::failure(request_id, WireError::from(&e)),
                    };
                    let _ = events.send(reply);
                });
            }
        }
    }

    fn subscribe(
        &self,
        subscription_id: Uuid,
        target: Target,
        options: QueryOptions,
        events: mpsc::UnboundedSender<BridgeEvent>,
    ) {
        let handle = match target.to_handle() {
            Ok(handle) => handle,
            Err(e) => {
                warn!(%subscription_id, error = %e, "rejected subscription");
                let _ = events.send(BridgeEvent::Error {
                    subscription_id,
                    error: WireError::from(&e),
                });
                return;
            }
        };
        debug!(%subscription_id, key = %handle.key(), "subscribed");

        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let store = self.store.clone();
        let subscriptions = self.subscriptions.clone();

        // The slot stays locked until the task is registered, so the task
        // cannot deregister before it is recorded.
        let slot = self.subscriptions.entry(subscription_id);
        let task = tokio::spawn(async move {
            let mut values = store.listen(&handle);
            let last = loop {
                match values.next().await {
                    Some(Ok(snapshot)) => {
                        let mut value = WireSnapshot::from(&snapshot);
                        if let Err(e) =
                            expand_snapshot(store.as_ref(), &mut value, &options.expands).await
                        {
                            break BridgeEvent::Error {
                                subscription_id,
                                error: WireError::from(&e),
                            };
                        }
                        if events
                            .send(BridgeEvent::Value {
                                subscription_id,
                                value,
                            })
                            .is_err()
                        {
                            return;
                        }
                    }
                    Some(Err(e)) => {
                        break BridgeEvent::Error {
                            subscription_id,
                            error: WireError::from(&e),
                        };
                    }
                    None => break BridgeEvent::Complete { subscription_id },
                }
            };
            subscriptions.remove_if(&subscription_id, |_, running| running.token == token);
            let _ = events.send(last);
        });

        let running = Running {
            token,
            task: task.abort_handle(),
        };
        match slot {
            Entry::Occupied(mut occupied) => {
                warn!(%subscription_id, "subscription id reused; replacing");
                occupied.insert(running).task.abort();
            }
            Entry::Vacant(vacant) => {
                vacant.insert(running);
            }
        }
    }
}

async fn get<S>(store: &S, target: &Target, options: &QueryOptions) -> Result<serde_json::Value, BridgeError>
where
    S: RemoteStore + ?Sized,
{
    let handle = target.to_handle()?;
    let snapshot = store.get(&handle).await?;
    let mut value = WireSnapshot::from(&snapshot);
    expand_snapshot(store, &mut value, &options.expands).await?;
    Ok(serde_json::to_value(value)?)
}

async fn write_events<W>(
    mut writer: W,
    mut outgoing: mpsc::UnboundedReceiver<BridgeEvent>,
) -> Result<(), BridgeError>
where
    W: AsyncWrite + Unpin,
{
    while let Some(event) = outgoing.recv().await {
        let line = serde_json::to_string(&event)?;
        writer.write_all(line.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
    }
    writer.shutdown().await?;
    Ok(())
}
