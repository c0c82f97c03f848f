//! TCP bridge client.
//!
//! A [`BrokerLink`] maintains one connection to the broker for the life
//! of the process. A background task dials, handshakes, replays the
//! subscription set, and pumps frames; when the connection drops it
//! flips the state watch to [`BridgeState::Degraded`], fails requests in
//! flight, and redials with exponential backoff. Subscribers observe the
//! `Degraded` → `Connected` edge to run gap recovery, because anything
//! published while the link was down is gone.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use banter_core::InstanceId;
use banter_settings::{ClusterSettings, RetrySettings};
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, timeout};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backoff::ExponentialBackoff;
use crate::bridge::{BridgeMessage, BridgeState, ClusterBridge, MessageHandler};
use crate::errors::ClusterError;
use crate::frame::{BrokerCodec, Frame, PROTOCOL_VERSION};
use crate::store::{StoreRequest, StoreResponse};

const PING_INTERVAL: Duration = Duration::from_secs(15);
/// No frame from the broker for this long means the connection is dead
/// even if the socket has not errored.
const LINK_TIMEOUT: Duration = Duration::from_secs(45);
const OUTBOUND_QUEUE: usize = 256;

type PendingMap = DashMap<u64, oneshot::Sender<StoreResponse>>;

/// Bridge implementation backed by a TCP broker connection.
pub struct BrokerLink {
    instance: InstanceId,
    handlers: Arc<DashMap<String, MessageHandler>>,
    pending: Arc<PendingMap>,
    out_tx: mpsc::Sender<Frame>,
    next_req: AtomicU64,
    state_tx: Arc<watch::Sender<BridgeState>>,
    cancel: CancellationToken,
    request_timeout: Duration,
    closed: AtomicBool,
}

impl BrokerLink {
    /// Spawns the link's maintainer task and returns immediately. The
    /// link starts [`BridgeState::Degraded`] and flips once the first
    /// dial succeeds; callers that need the broker up front should
    /// follow with [`BrokerLink::wait_for_state`].
    pub fn open(
        addr: impl Into<String>,
        instance: InstanceId,
        settings: &ClusterSettings,
    ) -> Arc<Self> {
        let addr = addr.into();
        let handlers: Arc<DashMap<String, MessageHandler>> = Arc::new(DashMap::new());
        let pending: Arc<PendingMap> = Arc::new(DashMap::new());
        let (state_tx, _) = watch::channel(BridgeState::Degraded);
        let state_tx = Arc::new(state_tx);
        let (out_tx, out_rx) = mpsc::channel(OUTBOUND_QUEUE);
        let cancel = CancellationToken::new();

        let link = Arc::new(Self {
            instance: instance.clone(),
            handlers: Arc::clone(&handlers),
            pending: Arc::clone(&pending),
            out_tx,
            next_req: AtomicU64::new(1),
            state_tx: Arc::clone(&state_tx),
            cancel: cancel.clone(),
            request_timeout: settings.request_timeout(),
            closed: AtomicBool::new(false),
        });

        let _ = tokio::spawn(run_link(
            addr,
            instance,
            handlers,
            pending,
            state_tx,
            out_rx,
            cancel,
            settings.connect_timeout(),
            settings.retry.clone(),
        ));
        link
    }

    /// Waits until the link reaches `target`, up to `deadline`.
    pub async fn wait_for_state(&self, target: BridgeState, deadline: Duration) -> bool {
        let mut rx = self.state_tx.subscribe();
        if *rx.borrow() == target {
            return true;
        }
        timeout(deadline, async {
            loop {
                if rx.changed().await.is_err() {
                    return false;
                }
                if *rx.borrow() == target {
                    return true;
                }
            }
        })
        .await
        .unwrap_or(false)
    }

    fn ensure_ready(&self) -> Result<(), ClusterError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ClusterError::Closed);
        }
        match *self.state_tx.borrow() {
            BridgeState::Connected => Ok(()),
            BridgeState::Degraded => Err(ClusterError::BrokerUnavailable),
        }
    }

    fn send_frame(&self, frame: Frame) -> Result<(), ClusterError> {
        self.out_tx.try_send(frame).map_err(|error| match error {
            TrySendError::Full(_) => ClusterError::BrokerUnavailable,
            TrySendError::Closed(_) => ClusterError::Closed,
        })
    }
}

#[async_trait]
impl ClusterBridge for BrokerLink {
    fn instance_id(&self) -> &InstanceId {
        &self.instance
    }

    fn state(&self) -> BridgeState {
        if self.closed.load(Ordering::Acquire) {
            return BridgeState::Degraded;
        }
        *self.state_tx.borrow()
    }

    fn watch_state(&self) -> watch::Receiver<BridgeState> {
        self.state_tx.subscribe()
    }

    async fn publish(&self, topic: &str, payload: String) -> Result<(), ClusterError> {
        self.ensure_ready()?;
        self.send_frame(Frame::Pub {
            topic: topic.to_owned(),
            payload,
        })
    }

    async fn subscribe(&self, topic: &str, handler: MessageHandler) -> Result<(), ClusterError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ClusterError::Closed);
        }
        let _ = self.handlers.insert(topic.to_owned(), handler);
        // While degraded the subscription is only recorded locally; the
        // maintainer replays the whole set on the next connect.
        if *self.state_tx.borrow() == BridgeState::Connected {
            self.send_frame(Frame::Sub {
                topic: topic.to_owned(),
            })?;
        }
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), ClusterError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ClusterError::Closed);
        }
        let _ = self.handlers.remove(topic);
        if *self.state_tx.borrow() == BridgeState::Connected {
            self.send_frame(Frame::Unsub {
                topic: topic.to_owned(),
            })?;
        }
        Ok(())
    }

    async fn request(&self, request: StoreRequest) -> Result<StoreResponse, ClusterError> {
        self.ensure_ready()?;
        let body = serde_json::to_string(&request)
            .map_err(|error| ClusterError::Protocol(error.to_string()))?;
        let id = self.next_req.fetch_add(1, Ordering::Relaxed);
        let (reply_tx, reply_rx) = oneshot::channel();
        let _ = self.pending.insert(id, reply_tx);

        if let Err(error) = self.send_frame(Frame::Req { id, body }) {
            let _ = self.pending.remove(&id);
            return Err(error);
        }

        match timeout(self.request_timeout, reply_rx).await {
            Ok(Ok(response)) => Ok(response),
            // The session died and dropped our reply sender.
            Ok(Err(_)) => Err(ClusterError::ConnectionLost),
            Err(_) => {
                let _ = self.pending.remove(&id);
                Err(ClusterError::Timeout)
            }
        }
    }

    async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cancel.cancel();
    }
}

enum SessionEnd {
    Cancelled,
    Disconnected,
}

#[allow(clippy::too_many_arguments)]
async fn run_link(
    addr: String,
    instance: InstanceId,
    handlers: Arc<DashMap<String, MessageHandler>>,
    pending: Arc<PendingMap>,
    state_tx: Arc<watch::Sender<BridgeState>>,
    mut out_rx: mpsc::Receiver<Frame>,
    cancel: CancellationToken,
    connect_timeout: Duration,
    retry: RetrySettings,
) {
    let mut backoff = ExponentialBackoff::new(&retry);
    loop {
        if cancel.is_cancelled() {
            break;
        }
        // Anything queued for a dead session is stale; the resubscribe
        // pass rebuilds the broker's view from scratch.
        while out_rx.try_recv().is_ok() {}

        match open_session(&addr, &instance, &handlers, connect_timeout).await {
            Ok(framed) => {
                backoff.reset();
                let _ = state_tx.send(BridgeState::Connected);
                info!(%addr, instance = %instance, "broker link established");

                let end = drive_session(framed, &handlers, &pending, &mut out_rx, &cancel).await;
                let _ = state_tx.send(BridgeState::Degraded);
                pending.clear();
                match end {
                    SessionEnd::Cancelled => break,
                    SessionEnd::Disconnected => {
                        warn!(%addr, "broker link lost, reconnecting");
                    }
                }
            }
            Err(error) => {
                debug!(%addr, %error, "broker dial failed");
            }
        }

        let delay = backoff.next_delay();
        tokio::select! {
            () = cancel.cancelled() => break,
            () = tokio::time::sleep(delay) => {}
        }
    }
    let _ = state_tx.send(BridgeState::Degraded);
    pending.clear();
    debug!(%addr, "broker link task stopped");
}

async fn open_session(
    addr: &str,
    instance: &InstanceId,
    handlers: &DashMap<String, MessageHandler>,
    connect_timeout: Duration,
) -> Result<Framed<TcpStream, BrokerCodec>, ClusterError> {
    let stream = timeout(connect_timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| ClusterError::Timeout)??;
    let _ = stream.set_nodelay(true);
    let mut framed = Framed::new(stream, BrokerCodec);

    framed
        .send(Frame::Hello {
            protocol_version: PROTOCOL_VERSION,
            instance_id: instance.as_str().to_owned(),
        })
        .await?;
    match timeout(connect_timeout, framed.next()).await {
        Ok(Some(Ok(Frame::Hello {
            protocol_version, ..
        }))) => {
            if protocol_version != PROTOCOL_VERSION {
                return Err(ClusterError::HandshakeRejected(format!(
                    "broker speaks protocol {protocol_version}, we speak {PROTOCOL_VERSION}"
                )));
            }
        }
        Ok(Some(Ok(Frame::Bye))) => {
            return Err(ClusterError::HandshakeRejected("broker refused HELLO".into()));
        }
        Ok(Some(Ok(other))) => {
            return Err(ClusterError::Protocol(format!(
                "expected HELLO reply, got {other:?}"
            )));
        }
        Ok(Some(Err(error))) => return Err(error.into()),
        Ok(None) => return Err(ClusterError::ConnectionLost),
        Err(_) => return Err(ClusterError::Timeout),
    }

    // Replay the subscription set so fan-out resumes where it left off.
    let topics: Vec<String> = handlers.iter().map(|entry| entry.key().clone()).collect();
    for topic in topics {
        framed.send(Frame::Sub { topic }).await?;
    }
    Ok(framed)
}

async fn drive_session(
    framed: Framed<TcpStream, BrokerCodec>,
    handlers: &DashMap<String, MessageHandler>,
    pending: &PendingMap,
    out_rx: &mut mpsc::Receiver<Frame>,
    cancel: &CancellationToken,
) -> SessionEnd {
    let (mut sink, mut stream) = framed.split();
    let mut ping = tokio::time::interval(PING_INTERVAL);
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut last_activity = Instant::now();

    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                let _ = sink.send(Frame::Bye).await;
                return SessionEnd::Cancelled;
            }
            _ = ping.tick() => {
                if last_activity.elapsed() > LINK_TIMEOUT {
                    warn!("broker silent past liveness timeout");
                    return SessionEnd::Disconnected;
                }
                if sink.send(Frame::Ping).await.is_err() {
                    return SessionEnd::Disconnected;
                }
            }
            outbound = out_rx.recv() => {
                match outbound {
                    Some(frame) => {
                        if sink.send(frame).await.is_err() {
                            return SessionEnd::Disconnected;
                        }
                    }
                    None => return SessionEnd::Cancelled,
                }
            }
            inbound = stream.next() => {
                let frame = match inbound {
                    Some(Ok(frame)) => frame,
                    Some(Err(error)) => {
                        warn!(%error, "broker stream error");
                        return SessionEnd::Disconnected;
                    }
                    None => return SessionEnd::Disconnected,
                };
                last_activity = Instant::now();
                match frame {
                    Frame::Msg { topic, origin, payload } => {
                        let handler = handlers
                            .get(&topic)
                            .map(|entry| Arc::clone(entry.value()));
                        if let Some(handler) = handler {
                            handler(BridgeMessage {
                                topic,
                                origin: InstanceId::from(origin),
                                payload,
                            });
                        }
                    }
                    Frame::Resp { id, body } => {
                        if let Some((_, reply)) = pending.remove(&id) {
                            match serde_json::from_str::<StoreResponse>(&body) {
                                Ok(response) => {
                                    let _ = reply.send(response);
                                }
                                Err(error) => {
                                    warn!(%error, "malformed store response");
                                }
                            }
                        }
                    }
                    Frame::Ping => {
                        if sink.send(Frame::Pong).await.is_err() {
                            return SessionEnd::Disconnected;
                        }
                    }
                    Frame::Pong => {}
                    Frame::Bye => return SessionEnd::Disconnected,
                    Frame::Hello { .. }
                    | Frame::Sub { .. }
                    | Frame::Unsub { .. }
                    | Frame::Pub { .. }
                    | Frame::Req { .. } => {
                        warn!("unexpected frame from broker");
                        return SessionEnd::Disconnected;
                    }
                }
            }
        }
    }
}
