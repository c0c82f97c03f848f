//! Standalone TCP broker.
//!
//! One broker process carries the shared store and relays published
//! messages between instances. Each accepted connection handshakes with
//! a HELLO exchange, then runs a per-client task that serves store
//! requests and fans publishes out to every subscriber of the topic,
//! including the publisher itself.

use std::collections::HashSet;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use banter_core::InstanceId;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{Instant, timeout};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::frame::{BrokerCodec, Frame, PROTOCOL_VERSION};
use crate::store::SharedState;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
/// A client that has sent nothing (not even a ping) for this long is
/// presumed dead and dropped.
const CLIENT_TIMEOUT: Duration = Duration::from_secs(45);
const PURGE_INTERVAL: Duration = Duration::from_secs(30);
const OUTBOUND_QUEUE: usize = 1024;

struct ClientHandle {
    instance_id: String,
    tx: mpsc::Sender<Frame>,
}

#[derive(Default)]
struct Registry {
    clients: DashMap<u64, ClientHandle>,
    topics: DashMap<String, HashSet<u64>>,
    next_client: AtomicU64,
}

impl Registry {
    fn register(&self, instance_id: String, tx: mpsc::Sender<Frame>) -> u64 {
        let id = self.next_client.fetch_add(1, Ordering::Relaxed);
        let _ = self.clients.insert(id, ClientHandle { instance_id, tx });
        id
    }

    fn remove(&self, id: u64) {
        let _ = self.clients.remove(&id);
        for mut entry in self.topics.iter_mut() {
            let _ = entry.remove(&id);
        }
    }

    fn subscribe(&self, topic: &str, id: u64) {
        let _ = self.topics.entry(topic.to_owned()).or_default().insert(id);
    }

    fn unsubscribe(&self, topic: &str, id: u64) {
        if let Some(mut entry) = self.topics.get_mut(topic) {
            let _ = entry.remove(&id);
        }
    }

    fn subscribers(&self, topic: &str) -> Vec<(u64, mpsc::Sender<Frame>)> {
        match self.topics.get(topic) {
            Some(ids) => ids
                .iter()
                .filter_map(|id| {
                    self.clients
                        .get(id)
                        .map(|handle| (*id, handle.tx.clone()))
                })
                .collect(),
            None => Vec::new(),
        }
    }
}

/// TCP broker: accepts instance connections and relays between them.
pub struct BrokerServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    broker_id: InstanceId,
    state: Arc<Mutex<SharedState>>,
    registry: Arc<Registry>,
    cancel: CancellationToken,
}

impl BrokerServer {
    /// Binds the broker. Pass port `0` to let the OS choose (tests).
    pub async fn bind(addr: &str, ring_capacity: usize) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener,
            local_addr,
            broker_id: InstanceId::new(),
            state: Arc::new(Mutex::new(SharedState::new(ring_capacity))),
            registry: Arc::new(Registry::default()),
            cancel: CancellationToken::new(),
        })
    }

    /// Address the broker is listening on.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Token that stops the accept loop and every client task.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Runs the accept loop until the cancel token fires.
    pub async fn run(self) {
        info!(addr = %self.local_addr, "broker listening");
        let mut purge = tokio::time::interval(PURGE_INTERVAL);
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                _ = purge.tick() => {
                    self.state.lock().purge_expired(Instant::now());
                }
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let _ = stream.set_nodelay(true);
                            let state = Arc::clone(&self.state);
                            let registry = Arc::clone(&self.registry);
                            let broker_id = self.broker_id.clone();
                            let cancel = self.cancel.child_token();
                            let _ = tokio::spawn(async move {
                                serve_client(stream, peer, broker_id, state, registry, cancel)
                                    .await;
                            });
                        }
                        Err(error) => {
                            warn!(%error, "broker accept failed");
                            tokio::time::sleep(Duration::from_millis(100)).await;
                        }
                    }
                }
            }
        }
        info!("broker stopped");
    }
}

async fn serve_client(
    stream: TcpStream,
    peer: SocketAddr,
    broker_id: InstanceId,
    state: Arc<Mutex<SharedState>>,
    registry: Arc<Registry>,
    cancel: CancellationToken,
) {
    let mut framed = Framed::new(stream, BrokerCodec);

    // HELLO exchange before anything else.
    let hello = timeout(HANDSHAKE_TIMEOUT, framed.next()).await;
    let instance_id = match hello {
        Ok(Some(Ok(Frame::Hello {
            protocol_version,
            instance_id,
        }))) => {
            if protocol_version != PROTOCOL_VERSION {
                warn!(
                    %peer,
                    theirs = protocol_version,
                    ours = PROTOCOL_VERSION,
                    "rejecting client with mismatched protocol version"
                );
                let _ = framed.send(Frame::Bye).await;
                return;
            }
            instance_id
        }
        Ok(Some(Ok(other))) => {
            warn!(%peer, frame = ?other, "expected HELLO as first frame");
            return;
        }
        Ok(Some(Err(error))) => {
            warn!(%peer, %error, "handshake decode failed");
            return;
        }
        Ok(None) | Err(_) => {
            debug!(%peer, "client vanished before handshake");
            return;
        }
    };
    if framed
        .send(Frame::Hello {
            protocol_version: PROTOCOL_VERSION,
            instance_id: broker_id.as_str().to_owned(),
        })
        .await
        .is_err()
    {
        return;
    }

    let (tx, mut rx) = mpsc::channel(OUTBOUND_QUEUE);
    let client_id = registry.register(instance_id.clone(), tx);
    info!(%peer, instance = %instance_id, "client connected");

    let (mut sink, mut stream) = framed.split();
    let mut last_activity = Instant::now();
    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                let _ = sink.send(Frame::Bye).await;
                break;
            }
            () = tokio::time::sleep_until(last_activity + CLIENT_TIMEOUT) => {
                warn!(instance = %instance_id, "client idle past timeout, dropping");
                break;
            }
            outbound = rx.recv() => {
                match outbound {
                    Some(frame) => {
                        if sink.send(frame).await.is_err() {
                            break;
                        }
                    }
                    // Handle dropped by the registry (slow consumer).
                    None => break,
                }
            }
            inbound = stream.next() => {
                let frame = match inbound {
                    Some(Ok(frame)) => frame,
                    Some(Err(error)) => {
                        warn!(instance = %instance_id, %error, "client stream error");
                        break;
                    }
                    None => break,
                };
                last_activity = Instant::now();
                match frame {
                    Frame::Sub { topic } => registry.subscribe(&topic, client_id),
                    Frame::Unsub { topic } => registry.unsubscribe(&topic, client_id),
                    Frame::Pub { topic, payload } => {
                        fan_out(&registry, &topic, &instance_id, payload);
                    }
                    Frame::Req { id, body } => {
                        let response = match serde_json::from_str(&body) {
                            Ok(request) => state.lock().apply(request, Instant::now()),
                            Err(error) => {
                                warn!(instance = %instance_id, %error, "malformed store request");
                                break;
                            }
                        };
                        let body = match serde_json::to_string(&response) {
                            Ok(body) => body,
                            Err(error) => {
                                warn!(%error, "store response serialization failed");
                                break;
                            }
                        };
                        if sink.send(Frame::Resp { id, body }).await.is_err() {
                            break;
                        }
                    }
                    Frame::Ping => {
                        if sink.send(Frame::Pong).await.is_err() {
                            break;
                        }
                    }
                    Frame::Pong => {}
                    Frame::Bye => break,
                    Frame::Hello { .. } | Frame::Msg { .. } | Frame::Resp { .. } => {
                        warn!(instance = %instance_id, "unexpected frame from client");
                        break;
                    }
                }
            }
        }
    }

    registry.remove(client_id);
    info!(%peer, instance = %instance_id, "client disconnected");
}

fn fan_out(registry: &Registry, topic: &str, origin: &str, payload: String) {
    for (client_id, tx) in registry.subscribers(topic) {
        let frame = Frame::Msg {
            topic: topic.to_owned(),
            origin: origin.to_owned(),
            payload: payload.clone(),
        };
        if let Err(error) = tx.try_send(frame) {
            // A full queue means the client stopped draining; drop it
            // rather than stall every other subscriber.
            warn!(client_id, %error, "subscriber queue full, dropping client");
            registry.remove(client_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn start_broker() -> (SocketAddr, CancellationToken) {
        let broker = BrokerServer::bind("127.0.0.1:0", 64).await.unwrap();
        let addr = broker.local_addr();
        let cancel = broker.cancel_token();
        let _ = tokio::spawn(broker.run());
        (addr, cancel)
    }

    async fn handshake(addr: SocketAddr, instance: &str) -> Framed<TcpStream, BrokerCodec> {
        let stream = TcpStream::connect(addr).await.unwrap();
        let mut framed = Framed::new(stream, BrokerCodec);
        framed
            .send(Frame::Hello {
                protocol_version: PROTOCOL_VERSION,
                instance_id: instance.to_owned(),
            })
            .await
            .unwrap();
        match framed.next().await.unwrap().unwrap() {
            Frame::Hello { .. } => framed,
            other => panic!("expected HELLO reply, got {other:?}"),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn publish_is_relayed_to_subscribers_including_the_publisher() {
        let (addr, cancel) = start_broker().await;
        let mut a = handshake(addr, "inst-a").await;
        let mut b = handshake(addr, "inst-b").await;

        a.send(Frame::Sub { topic: "t".into() }).await.unwrap();
        b.send(Frame::Sub { topic: "t".into() }).await.unwrap();
        // Give the broker a beat to process the subscriptions.
        tokio::time::sleep(Duration::from_millis(50)).await;

        a.send(Frame::Pub {
            topic: "t".into(),
            payload: "hello".into(),
        })
        .await
        .unwrap();

        let got_b = timeout(Duration::from_secs(2), b.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(
            got_b,
            Frame::Msg {
                topic: "t".into(),
                origin: "inst-a".into(),
                payload: "hello".into(),
            }
        );

        let got_a = timeout(Duration::from_secs(2), a.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(
            got_a,
            Frame::Msg {
                topic: "t".into(),
                origin: "inst-a".into(),
                payload: "hello".into(),
            }
        );

        cancel.cancel();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn store_requests_are_served_with_matching_ids() {
        let (addr, cancel) = start_broker().await;
        let mut client = handshake(addr, "inst-a").await;

        client
            .send(Frame::Req {
                id: 7,
                body: "{\"op\":\"put\",\"key\":\"k\",\"value\":\"v\",\"ttlMs\":null}".into(),
            })
            .await
            .unwrap();
        let put = timeout(Duration::from_secs(2), client.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(
            put,
            Frame::Resp {
                id: 7,
                body: "{\"result\":\"unit\"}".into()
            }
        );

        client
            .send(Frame::Req {
                id: 8,
                body: "{\"op\":\"get\",\"key\":\"k\"}".into(),
            })
            .await
            .unwrap();
        let get = timeout(Duration::from_secs(2), client.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(
            get,
            Frame::Resp {
                id: 8,
                body: "{\"result\":\"value\",\"value\":\"v\"}".into()
            }
        );

        cancel.cancel();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn mismatched_protocol_version_is_rejected() {
        let (addr, cancel) = start_broker().await;
        let stream = TcpStream::connect(addr).await.unwrap();
        let mut framed = Framed::new(stream, BrokerCodec);
        framed
            .send(Frame::Hello {
                protocol_version: PROTOCOL_VERSION + 1,
                instance_id: "inst-x".into(),
            })
            .await
            .unwrap();

        let reply = timeout(Duration::from_secs(2), framed.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(reply, Frame::Bye);

        cancel.cancel();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn ping_gets_pong() {
        let (addr, cancel) = start_broker().await;
        let mut client = handshake(addr, "inst-a").await;

        client.send(Frame::Ping).await.unwrap();
        let reply = timeout(Duration::from_secs(2), client.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(reply, Frame::Pong);

        cancel.cancel();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unsubscribed_topics_are_not_delivered() {
        let (addr, cancel) = start_broker().await;
        let mut a = handshake(addr, "inst-a").await;
        let mut b = handshake(addr, "inst-b").await;

        b.send(Frame::Sub { topic: "t".into() }).await.unwrap();
        b.send(Frame::Unsub { topic: "t".into() }).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        a.send(Frame::Pub {
            topic: "t".into(),
            payload: "x".into(),
        })
        .await
        .unwrap();

        let got = timeout(Duration::from_millis(300), b.next()).await;
        assert!(got.is_err(), "expected no delivery after unsubscribe");

        cancel.cancel();
    }
}
