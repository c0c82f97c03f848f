//! The channel hub: one per instance, multiplexing every live channel.
//!
//! The hub owns the per-channel fabric on this instance — subscriber sets,
//! the local retention ring, the reorder buffer, and the writer gate that
//! serializes sequence assignment. Publishes happen under a cluster lease so
//! exactly one instance numbers a channel's stream; everything the owner
//! assigns is persisted (watermark, then retention ring) before bridge
//! fan-out, so peers and successors can always reconstruct the stream.
//!
//! Cross-instance arrivals flow through a background worker: in-order events
//! deliver immediately, out-of-order ones park in the reorder buffer, and a
//! hole that outlives the reorder window is backfilled from the shared
//! retention ring. The same backfill runs on the bridge's `Degraded` →
//! `Connected` edge to recover whatever fan-out the outage swallowed.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Duration;

use banter_cluster::{
    BridgeState, ClusterBridge, ClusterError, LeaseOutcome, MessageHandler, RingSlice,
};
use banter_core::{ChannelId, ConnectionId, PublishError, SequenceGapError, SubscribeError, codes};
use banter_events::{ControlSignal, Event, EventKind, ServerFrame};
use banter_settings::ChannelSettings;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior, interval, sleep};
use tracing::{debug, info, warn};

use crate::reorder::{Offer, ReorderBuffer};
use crate::ring::RetentionRing;

/// Depth of the worker's command queue. Overflow drops bridge events,
/// which the next backfill recovers.
const COMMAND_QUEUE: usize = 1024;

/// How often subscriber-free channels are checked against the idle horizon.
const IDLE_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

fn topic(channel_id: &ChannelId) -> String {
    format!("events/{channel_id}")
}

fn lease_key(channel_id: &ChannelId) -> String {
    format!("seq-writer/{channel_id}")
}

fn watermark_key(channel_id: &ChannelId) -> String {
    format!("seq/{channel_id}")
}

fn closed_key(channel_id: &ChannelId) -> String {
    format!("closed/{channel_id}")
}

fn event_frame(event: &Event) -> Arc<String> {
    let json = serde_json::to_string(&ServerFrame::Event {
        event: event.clone(),
    })
    .unwrap_or_else(|_| String::from("{}"));
    Arc::new(json)
}

fn event_json(event: &Event) -> String {
    serde_json::to_string(event).unwrap_or_else(|_| String::from("{}"))
}

/// One attached connection's delivery state.
enum Subscriber {
    /// Receiving live fan-out.
    Live { tx: mpsc::Sender<Arc<String>> },
    /// Mid-replay: live events accumulate in the backlog until the replay
    /// finishes, then everything above the replay high-water mark flushes.
    Replaying {
        tx: mpsc::Sender<Arc<String>>,
        backlog: Vec<(u64, Arc<String>)>,
    },
}

/// Mutable per-channel state, guarded by a sync lock (never held across
/// awaits).
struct ChannelState {
    subscribers: HashMap<ConnectionId, Subscriber>,
    ring: RetentionRing,
    reorder: ReorderBuffer,
    /// Next sequence to hand to local subscribers; 0 until anchored by the
    /// cluster watermark or the first arrival.
    next_expected: u64,
    closed: bool,
    bridge_subscribed: bool,
    gap_check_armed: bool,
    last_activity: Instant,
}

/// Writer-side state, guarded by an async lock so one publish at a time
/// assigns sequences and talks to the broker for a given channel.
struct WriterGate {
    /// Local view of the sequence lease; authoritative only until expiry.
    lease_deadline: Option<Instant>,
    /// Next sequence to assign; 0 until loaded from the watermark.
    next_sequence: u64,
    /// Events accepted while the broker was unreachable, awaiting flush.
    pending_forward: VecDeque<Event>,
}

struct ChannelEntry {
    state: Mutex<ChannelState>,
    writer: tokio::sync::Mutex<WriterGate>,
}

enum HubCommand {
    /// Bridge fan-out from another instance.
    Remote { event: Event },
    /// Reorder window elapsed for a hole first observed at `expected`.
    CheckGap { channel_id: ChannelId, expected: u64 },
}

/// Per-instance channel multiplexer.
pub struct ChannelHub {
    bridge: Arc<dyn ClusterBridge>,
    settings: ChannelSettings,
    lease_ttl: Duration,
    channels: DashMap<ChannelId, Arc<ChannelEntry>>,
    memberships: DashMap<ConnectionId, HashSet<ChannelId>>,
    /// Connections evicted for outbound overflow; the server closes them.
    evictions: mpsc::UnboundedSender<ConnectionId>,
    commands: mpsc::Sender<HubCommand>,
}

impl ChannelHub {
    /// Creates the hub and spawns its worker. The returned receiver yields
    /// connections evicted for outbound queue overflow; the caller must
    /// close them.
    pub fn new(
        bridge: Arc<dyn ClusterBridge>,
        settings: ChannelSettings,
        lease_ttl: Duration,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<ConnectionId>) {
        let (evict_tx, evict_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE);
        let hub = Arc::new(Self {
            bridge,
            settings,
            lease_ttl,
            channels: DashMap::new(),
            memberships: DashMap::new(),
            evictions: evict_tx,
            commands: command_tx,
        });
        let _ = tokio::spawn(run_worker(Arc::downgrade(&hub), command_rx));
        (hub, evict_rx)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Subscribe / unsubscribe
    // ─────────────────────────────────────────────────────────────────────

    /// Attaches a connection to a channel's live stream.
    ///
    /// With `last_seen`, events after that sequence are replayed first (from
    /// the local ring when possible, otherwise the shared store) and live
    /// delivery is spliced on without a gap or duplicate. Returns the
    /// highest replayed sequence, if any.
    pub async fn subscribe(
        &self,
        channel_id: &ChannelId,
        connection_id: &ConnectionId,
        sender: mpsc::Sender<Arc<String>>,
        last_seen: Option<u64>,
    ) -> Result<Option<u64>, SubscribeError> {
        let entry = self.entry(channel_id).await;
        self.ensure_bridge_subscription(channel_id, &entry).await?;

        let replayed_to = match last_seen {
            None => {
                let mut state = entry.state.lock();
                state.last_activity = Instant::now();
                let _ = state
                    .subscribers
                    .insert(connection_id.clone(), Subscriber::Live { tx: sender });
                None
            }
            Some(last_seen) => {
                self.attach_resuming(channel_id, connection_id, sender, last_seen, &entry)
                    .await?
            }
        };

        let _ = self
            .memberships
            .entry(connection_id.clone())
            .or_default()
            .insert(channel_id.clone());
        debug!(channel = %channel_id, connection = %connection_id, ?replayed_to, "subscribed");
        Ok(replayed_to)
    }

    /// Detaches a connection from one channel.
    pub fn unsubscribe(&self, channel_id: &ChannelId, connection_id: &ConnectionId) {
        if let Some(entry) = self.channels.get(channel_id) {
            let mut state = entry.state.lock();
            let _ = state.subscribers.remove(connection_id);
            state.last_activity = Instant::now();
        }
        if let Some(mut channels) = self.memberships.get_mut(connection_id) {
            let _ = channels.remove(channel_id);
            if channels.is_empty() {
                drop(channels);
                let _ = self.memberships.remove(connection_id);
            }
        }
    }

    /// Detaches a connection from every channel, e.g. on disconnect.
    pub fn unsubscribe_all(&self, connection_id: &ConnectionId) {
        let Some((_, channels)) = self.memberships.remove(connection_id) else {
            return;
        };
        for channel_id in channels {
            if let Some(entry) = self.channels.get(&channel_id) {
                let _ = entry.state.lock().subscribers.remove(connection_id);
            }
        }
    }

    /// Channels a connection is attached to.
    pub fn channels_of(&self, connection_id: &ConnectionId) -> Vec<ChannelId> {
        self.memberships
            .get(connection_id)
            .map(|channels| channels.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Live channels tracked by this instance.
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Local subscribers attached to one channel.
    pub fn subscriber_count(&self, channel_id: &ChannelId) -> usize {
        self.channels
            .get(channel_id)
            .map_or(0, |entry| entry.state.lock().subscribers.len())
    }

    // ─────────────────────────────────────────────────────────────────────
    // Publish
    // ─────────────────────────────────────────────────────────────────────

    /// Publishes one event, assigning the next sequence under this
    /// instance's lease. Persists the watermark and retention entry before
    /// fan-out, delivers to local subscribers, and forwards to peers.
    ///
    /// While the broker is down, a holder with an unexpired local lease
    /// keeps numbering: events deliver locally and queue for forwarding on
    /// reconnect.
    pub async fn publish(
        &self,
        channel_id: &ChannelId,
        kind: EventKind,
        payload: Value,
    ) -> Result<u64, PublishError> {
        let entry = self.entry(channel_id).await;
        let mut writer = entry.writer.lock().await;

        let degraded = self.bridge.state() == BridgeState::Degraded;
        if entry.state.lock().closed {
            // The local flag can be stale after a remote reopen; recheck
            // the cluster-visible flag before rejecting.
            let still_closed = match self.bridge.get_value(&closed_key(channel_id)).await {
                Ok(None) => false,
                Ok(Some(_)) | Err(_) => true,
            };
            if still_closed {
                return Err(PublishError::ChannelClosed {
                    channel_id: channel_id.clone(),
                });
            }
            entry.state.lock().closed = false;
        }

        self.ensure_lease(channel_id, &mut writer, degraded).await?;
        if writer.next_sequence == 0 {
            writer.next_sequence = self.stream_head(channel_id, &entry).await + 1;
        }

        let sequence = writer.next_sequence;
        let event = Event::new(channel_id.clone(), sequence, kind, payload);
        let frame = event_frame(&event);
        let encoded = event_json(&event);
        let terminal = event.is_terminal();
        let reopened = matches!(event.control_signal(), Some(ControlSignal::Reopened));

        let mut parked = degraded;
        if !degraded {
            // Watermark first so a successor can never reuse this
            // sequence, then retention, then fan-out.
            let forwarded: Result<(), ClusterError> = async {
                self.bridge
                    .put_value(&watermark_key(channel_id), &sequence.to_string(), None)
                    .await?;
                self.bridge
                    .ring_append(channel_id.as_str(), sequence, &encoded)
                    .await?;
                if terminal {
                    self.bridge
                        .put_value(&closed_key(channel_id), "1", None)
                        .await?;
                }
                if reopened {
                    let _ = self.bridge.remove_value(&closed_key(channel_id)).await;
                }
                self.bridge.publish(&topic(channel_id), encoded.clone()).await
            }
            .await;
            if let Err(error) = forwarded {
                if error.is_retryable() {
                    warn!(
                        %error, channel = %channel_id, sequence,
                        "broker lost mid-publish, queueing for reconcile"
                    );
                    parked = true;
                } else {
                    return Err(PublishError::BrokerUnavailable);
                }
            }
        }
        if parked {
            writer.pending_forward.push_back(event.clone());
            if writer.pending_forward.len() > self.settings.window_size {
                let _ = writer.pending_forward.pop_front();
                warn!(channel = %channel_id, "pending-forward overflow, oldest event will not reach peers");
            }
        }

        {
            let mut state = entry.state.lock();
            state.last_activity = Instant::now();
            self.deliver_ordered(&mut state, &event, &frame);
            state.next_expected = sequence + 1;
        }
        writer.next_sequence = sequence + 1;
        metrics::counter!("events_published_total", "kind" => kind.as_str()).increment(1);
        debug!(channel = %channel_id, sequence, ?kind, "published");
        Ok(sequence)
    }

    /// Reopens a channel ended by a terminal control event. Clears the
    /// cluster-visible closed flag and announces the reopen on the stream,
    /// continuing the sequence from the watermark.
    pub async fn reopen(&self, channel_id: &ChannelId) -> Result<u64, PublishError> {
        let entry = self.entry(channel_id).await;
        entry.state.lock().closed = false;
        let _ = self.bridge.remove_value(&closed_key(channel_id)).await;
        self.publish(channel_id, EventKind::Control, json!({ "signal": "reopened" }))
            .await
    }

    /// Releases writer leases so a successor can take over immediately.
    pub async fn shutdown(&self) {
        let entries: Vec<(ChannelId, Arc<ChannelEntry>)> = self
            .channels
            .iter()
            .map(|item| (item.key().clone(), Arc::clone(item.value())))
            .collect();
        for (channel_id, entry) in entries {
            let mut writer = entry.writer.lock().await;
            if writer.lease_deadline.take().is_some() {
                let _ = self.bridge.release_lease(&lease_key(&channel_id)).await;
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Internals: attach / replay
    // ─────────────────────────────────────────────────────────────────────

    async fn entry(&self, channel_id: &ChannelId) -> Arc<ChannelEntry> {
        if let Some(entry) = self.channels.get(channel_id) {
            return Arc::clone(&entry);
        }
        // Cold load: anchor the local view on the cluster's watermark and
        // closed flag. Failures (degraded broker) fall back to blanks.
        let closed = matches!(
            self.bridge.get_value(&closed_key(channel_id)).await,
            Ok(Some(_))
        );
        let anchor = match self.bridge.get_value(&watermark_key(channel_id)).await {
            Ok(Some(raw)) => raw.parse::<u64>().ok(),
            _ => None,
        };
        let entry = Arc::new(ChannelEntry {
            state: Mutex::new(ChannelState {
                subscribers: HashMap::new(),
                ring: RetentionRing::new(self.settings.window_size),
                reorder: ReorderBuffer::new(self.settings.window_size),
                next_expected: anchor.map_or(0, |watermark| watermark + 1),
                closed,
                bridge_subscribed: false,
                gap_check_armed: false,
                last_activity: Instant::now(),
            }),
            writer: tokio::sync::Mutex::new(WriterGate {
                lease_deadline: None,
                next_sequence: 0,
                pending_forward: VecDeque::new(),
            }),
        });
        Arc::clone(
            self.channels
                .entry(channel_id.clone())
                .or_insert(entry)
                .value(),
        )
    }

    async fn ensure_bridge_subscription(
        &self,
        channel_id: &ChannelId,
        entry: &ChannelEntry,
    ) -> Result<(), SubscribeError> {
        let first = {
            let mut state = entry.state.lock();
            if state.bridge_subscribed {
                false
            } else {
                state.bridge_subscribed = true;
                true
            }
        };
        if first {
            if let Err(error) = self
                .bridge
                .subscribe(&topic(channel_id), self.remote_handler())
                .await
            {
                entry.state.lock().bridge_subscribed = false;
                warn!(%error, channel = %channel_id, "bridge subscription failed");
                return Err(SubscribeError::BrokerUnavailable);
            }
        }
        Ok(())
    }

    fn remote_handler(&self) -> MessageHandler {
        let commands = self.commands.clone();
        let own = self.bridge.instance_id().clone();
        Arc::new(move |message| {
            // Events this instance published were already delivered on the
            // publish path; only peer origins flow in.
            if message.origin == own {
                return;
            }
            match serde_json::from_str::<Event>(&message.payload) {
                Ok(event) => {
                    if commands.try_send(HubCommand::Remote { event }).is_err() {
                        warn!(topic = %message.topic, "hub queue full, dropping bridge event");
                    }
                }
                Err(error) => warn!(%error, topic = %message.topic, "malformed bridge event"),
            }
        })
    }

    /// Resume path: replay everything after `last_seen`, then attach live,
    /// without a gap or duplicate between the two.
    async fn attach_resuming(
        &self,
        channel_id: &ChannelId,
        connection_id: &ConnectionId,
        sender: mpsc::Sender<Arc<String>>,
        last_seen: u64,
        entry: &Arc<ChannelEntry>,
    ) -> Result<Option<u64>, SubscribeError> {
        let mut frames: Vec<(u64, Arc<String>)> = Vec::new();
        {
            let mut state = entry.state.lock();
            state.last_activity = Instant::now();
            let head = state
                .next_expected
                .saturating_sub(1)
                .max(state.ring.newest().unwrap_or(0));
            if head <= last_seen {
                let _ = state
                    .subscribers
                    .insert(connection_id.clone(), Subscriber::Live { tx: sender });
                return Ok(None);
            }
            if state.ring.covers_after(last_seen) {
                frames = state
                    .ring
                    .collect_after(last_seen)
                    .into_iter()
                    .map(|retained| (retained.sequence, retained.frame))
                    .collect();
                // Attach in replaying mode under the same lock that built
                // the replay list: every event is either in the list or
                // lands in the backlog, never both, never neither.
                let _ = state.subscribers.insert(
                    connection_id.clone(),
                    Subscriber::Replaying {
                        tx: sender.clone(),
                        backlog: Vec::new(),
                    },
                );
            }
        }

        if frames.is_empty() {
            // The local ring cannot serve this resume; use the shared
            // store's copy.
            let slice = self
                .bridge
                .ring_fetch(channel_id.as_str(), last_seen)
                .await
                .map_err(|error| {
                    warn!(%error, channel = %channel_id, "replay fetch failed");
                    SubscribeError::BrokerUnavailable
                })?;
            if slice.oldest.is_some_and(|oldest| oldest > last_seen + 1) || slice.events.is_empty()
            {
                metrics::counter!("resyncs_required_total").increment(1);
                return Err(SubscribeError::ResyncRequired {
                    channel_id: channel_id.clone(),
                    requested: last_seen,
                    oldest_retained: slice.oldest,
                });
            }
            for item in &slice.events {
                let Ok(event) = serde_json::from_str::<Event>(&item.event) else {
                    warn!(channel = %channel_id, sequence = item.sequence, "malformed retained event");
                    continue;
                };
                frames.push((item.sequence, event_frame(&event)));
            }
            let mut state = entry.state.lock();
            // Top up with anything the local ring gained while fetching.
            let fetched_to = frames.last().map_or(last_seen, |(sequence, _)| *sequence);
            for retained in state.ring.collect_after(fetched_to) {
                frames.push((retained.sequence, retained.frame));
            }
            let _ = state.subscribers.insert(
                connection_id.clone(),
                Subscriber::Replaying {
                    tx: sender.clone(),
                    backlog: Vec::new(),
                },
            );
        }

        let replayed_to = frames.last().map(|(sequence, _)| *sequence);
        for (_, frame) in frames {
            // Replay flows with backpressure; only live fan-out may evict.
            if sender.send(frame).await.is_err() {
                let _ = entry.state.lock().subscribers.remove(connection_id);
                return Ok(replayed_to);
            }
        }
        self.finish_replay(connection_id, entry, replayed_to.unwrap_or(last_seen));
        Ok(replayed_to)
    }

    /// Flushes the live backlog above the replay high-water mark and flips
    /// the subscriber to live delivery.
    fn finish_replay(&self, connection_id: &ConnectionId, entry: &ChannelEntry, high: u64) {
        let mut state = entry.state.lock();
        let finished = match state.subscribers.get_mut(connection_id) {
            Some(Subscriber::Replaying { tx, backlog }) => {
                Some((tx.clone(), std::mem::take(backlog)))
            }
            _ => None,
        };
        let Some((tx, backlog)) = finished else {
            return;
        };
        let mut alive = true;
        let mut flushed = 0u64;
        for (sequence, frame) in backlog {
            if sequence <= high {
                continue;
            }
            if tx.try_send(frame).is_err() {
                alive = false;
                break;
            }
            flushed += 1;
        }
        if flushed > 0 {
            metrics::counter!("events_delivered_total").increment(flushed);
        }
        if alive {
            let _ = state
                .subscribers
                .insert(connection_id.clone(), Subscriber::Live { tx });
        } else {
            let _ = state.subscribers.remove(connection_id);
            metrics::counter!("delivery_drops_total").increment(1);
            let _ = self.evictions.send(connection_id.clone());
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Internals: delivery and ordering
    // ─────────────────────────────────────────────────────────────────────

    /// Delivers an in-order event: closed-flag bookkeeping, retention, then
    /// subscriber fan-out.
    fn deliver_ordered(&self, state: &mut ChannelState, event: &Event, frame: &Arc<String>) {
        match event.control_signal() {
            Some(signal) if signal.is_terminal() => state.closed = true,
            Some(ControlSignal::Reopened) => state.closed = false,
            _ => {}
        }
        state.ring.push(event.sequence, Arc::clone(frame));
        self.deliver_frame(state, event.sequence, frame);
    }

    fn deliver_frame(&self, state: &mut ChannelState, sequence: u64, frame: &Arc<String>) {
        let mut delivered = 0u64;
        let mut dropped: Vec<ConnectionId> = Vec::new();
        for (connection_id, subscriber) in &mut state.subscribers {
            match subscriber {
                Subscriber::Live { tx } => {
                    if tx.try_send(Arc::clone(frame)).is_err() {
                        dropped.push(connection_id.clone());
                    } else {
                        delivered += 1;
                    }
                }
                Subscriber::Replaying { backlog, .. } => {
                    if backlog.len() >= self.settings.window_size {
                        dropped.push(connection_id.clone());
                    } else {
                        backlog.push((sequence, Arc::clone(frame)));
                    }
                }
            }
        }
        if delivered > 0 {
            metrics::counter!("events_delivered_total").increment(delivered);
        }
        for connection_id in dropped {
            let _ = state.subscribers.remove(&connection_id);
            warn!(connection = %connection_id, "outbound queue overflow, evicting subscriber");
            metrics::counter!("delivery_drops_total").increment(1);
            let _ = self.evictions.send(connection_id);
        }
    }

    /// Applies one cross-instance event in sequence order.
    async fn apply_remote(&self, event: Event) {
        let channel_id = event.channel_id.clone();
        let entry = self.entry(&channel_id).await;
        let frame = event_frame(&event);
        let sequence = event.sequence;

        let mut state = entry.state.lock();
        state.last_activity = Instant::now();
        if state.next_expected == 0 {
            // Cold channel with no recorded watermark: adopt the first
            // arrival as the stream position.
            state.next_expected = sequence;
        }
        if sequence < state.next_expected {
            debug!(channel = %channel_id, sequence, "duplicate bridge event ignored");
            return;
        }
        if sequence == state.next_expected {
            self.deliver_ordered(&mut state, &event, &frame);
            state.next_expected = sequence + 1;
            let expected = state.next_expected;
            let (ready, advanced) = state.reorder.take_ready(expected);
            state.next_expected = advanced;
            for pending in ready {
                self.deliver_ordered(&mut state, &pending.event, &pending.frame);
            }
            if state.reorder.is_empty() {
                state.gap_check_armed = false;
            }
            return;
        }

        // Hole below `sequence`: park it and arm one check per episode.
        match state.reorder.offer(sequence, event, frame) {
            Offer::Duplicate => return,
            Offer::Evicted => {
                debug!(channel = %channel_id, "reorder buffer full, furthest event dropped");
            }
            Offer::Buffered => {}
        }
        if !state.gap_check_armed {
            state.gap_check_armed = true;
            metrics::counter!("sequence_gaps_total").increment(1);
            let gap = SequenceGapError {
                channel_id: channel_id.clone(),
                expected: state.next_expected,
                observed: sequence,
            };
            debug!(%gap, "sequence hole observed, scheduling backfill check");
            self.schedule_gap_check(channel_id, state.next_expected);
        }
    }

    fn schedule_gap_check(&self, channel_id: ChannelId, expected: u64) {
        let commands = self.commands.clone();
        let delay = self.settings.reorder_timeout();
        let _ = tokio::spawn(async move {
            sleep(delay).await;
            let _ = commands
                .send(HubCommand::CheckGap {
                    channel_id,
                    expected,
                })
                .await;
        });
    }

    /// Runs when the reorder window elapses for a hole armed at `expected`.
    async fn check_gap(&self, channel_id: &ChannelId, expected: u64) {
        let Some(entry) = self
            .channels
            .get(channel_id)
            .map(|item| Arc::clone(item.value()))
        else {
            return;
        };
        let stalled = {
            let mut state = entry.state.lock();
            if state.reorder.is_empty() {
                state.gap_check_armed = false;
                false
            } else if state.next_expected > expected {
                // The hole moved; give the new one a full window.
                self.schedule_gap_check(channel_id.clone(), state.next_expected);
                false
            } else {
                true
            }
        };
        if stalled {
            self.backfill(channel_id, &entry, true).await;
        }
    }

    /// Fetches the missing range from the shared retention ring and splices
    /// it into the local stream. With `require_parked`, runs only while the
    /// reorder buffer holds events (the gap-check path); otherwise it is
    /// the reconnect sweep and runs for any channel with subscribers.
    async fn backfill(&self, channel_id: &ChannelId, entry: &Arc<ChannelEntry>, require_parked: bool) {
        let after = {
            let mut state = entry.state.lock();
            if require_parked && state.reorder.is_empty() {
                state.gap_check_armed = false;
                return;
            }
            if !require_parked && (state.subscribers.is_empty() || state.next_expected == 0) {
                return;
            }
            state.next_expected.saturating_sub(1)
        };

        let slice = match self.bridge.ring_fetch(channel_id.as_str(), after).await {
            Ok(slice) => slice,
            Err(error) => {
                debug!(%error, channel = %channel_id, "backfill fetch failed, retrying after the reorder window");
                self.schedule_gap_check(channel_id.clone(), after + 1);
                return;
            }
        };
        metrics::counter!("backfills_total").increment(1);

        let mut state = entry.state.lock();
        self.splice_slice(&mut state, channel_id, &slice);

        // Anything still parked is missing from the store too: the range
        // below it is gone for good. Skip ahead rather than stall, and
        // tell subscribers a range was lost.
        if let Some(first) = state.reorder.first_sequence() {
            if first > state.next_expected {
                let gap = SequenceGapError {
                    channel_id: channel_id.clone(),
                    expected: state.next_expected,
                    observed: first,
                };
                warn!(%gap, "sequence range unrecoverable, skipping ahead");
                self.notify_gap(&mut state, channel_id, &gap);
                state.next_expected = first;
            }
            let expected = state.next_expected;
            let (ready, advanced) = state.reorder.take_ready(expected);
            state.next_expected = advanced;
            for pending in ready {
                self.deliver_ordered(&mut state, &pending.event, &pending.frame);
            }
        }
        if state.reorder.is_empty() {
            state.gap_check_armed = false;
        } else {
            state.gap_check_armed = true;
            self.schedule_gap_check(channel_id.clone(), state.next_expected);
        }
    }

    /// Delivers ring entries at and above the expectation, draining the
    /// reorder buffer as the expectation advances.
    fn splice_slice(&self, state: &mut ChannelState, channel_id: &ChannelId, slice: &RingSlice) {
        for item in &slice.events {
            if item.sequence < state.next_expected {
                continue;
            }
            if item.sequence > state.next_expected {
                // The store ring itself has a hole (writer crashed between
                // watermark persist and append). Skip ahead with notice.
                let gap = SequenceGapError {
                    channel_id: channel_id.clone(),
                    expected: state.next_expected,
                    observed: item.sequence,
                };
                warn!(%gap, "retention ring has a hole, skipping ahead");
                self.notify_gap(state, channel_id, &gap);
                state.next_expected = item.sequence;
            }
            match serde_json::from_str::<Event>(&item.event) {
                Ok(event) => {
                    let frame = event_frame(&event);
                    self.deliver_ordered(state, &event, &frame);
                }
                Err(error) => {
                    warn!(%error, channel = %channel_id, sequence = item.sequence, "malformed retained event");
                }
            }
            state.next_expected = item.sequence + 1;
            let expected = state.next_expected;
            let (ready, advanced) = state.reorder.take_ready(expected);
            state.next_expected = advanced;
            for pending in ready {
                self.deliver_ordered(state, &pending.event, &pending.frame);
            }
        }
        state.reorder.discard_below(state.next_expected);
    }

    /// Status notice to live subscribers that a sequence range was lost.
    fn notify_gap(&self, state: &mut ChannelState, channel_id: &ChannelId, gap: &SequenceGapError) {
        let frame = ServerFrame::status(codes::SEQUENCE_GAP, gap.to_string(), Some(channel_id.clone()));
        let Ok(json) = serde_json::to_string(&frame) else {
            return;
        };
        let notice = Arc::new(json);
        let mut dropped: Vec<ConnectionId> = Vec::new();
        for (connection_id, subscriber) in &mut state.subscribers {
            if let Subscriber::Live { tx } = subscriber {
                if tx.try_send(Arc::clone(&notice)).is_err() {
                    dropped.push(connection_id.clone());
                }
            }
        }
        for connection_id in dropped {
            let _ = state.subscribers.remove(&connection_id);
            let _ = self.evictions.send(connection_id);
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Internals: lease and degraded-mode reconciliation
    // ─────────────────────────────────────────────────────────────────────

    async fn ensure_lease(
        &self,
        channel_id: &ChannelId,
        writer: &mut WriterGate,
        degraded: bool,
    ) -> Result<(), PublishError> {
        let now = Instant::now();
        if let Some(deadline) = writer.lease_deadline {
            if degraded {
                // Keep numbering on a still-valid local lease; peers catch
                // up through the shared ring once the broker returns.
                if now < deadline {
                    return Ok(());
                }
                writer.lease_deadline = None;
                return Err(PublishError::BrokerUnavailable);
            }
            if deadline.saturating_duration_since(now) > self.lease_ttl / 2 {
                return Ok(());
            }
        } else if degraded {
            return Err(PublishError::BrokerUnavailable);
        }

        match self
            .bridge
            .acquire_lease(&lease_key(channel_id), self.lease_ttl)
            .await
        {
            Ok(LeaseOutcome::Granted) => {
                writer.lease_deadline = Some(now + self.lease_ttl);
                metrics::counter!("lease_acquisitions_total").increment(1);
                Ok(())
            }
            Ok(LeaseOutcome::Held { holder }) => {
                writer.lease_deadline = None;
                metrics::counter!("lease_conflicts_total").increment(1);
                Err(PublishError::LeaseConflict {
                    channel_id: channel_id.clone(),
                    holder,
                })
            }
            Ok(LeaseOutcome::Lost) => {
                writer.lease_deadline = None;
                Err(PublishError::BrokerUnavailable)
            }
            Err(error) if error.is_retryable() && writer.lease_deadline.is_some_and(|d| now < d) => {
                debug!(%error, channel = %channel_id, "lease renewal deferred, broker unreachable");
                Ok(())
            }
            Err(error) => {
                warn!(%error, channel = %channel_id, "lease acquisition failed");
                Err(PublishError::BrokerUnavailable)
            }
        }
    }

    /// Highest sequence the cluster or this instance has seen for the
    /// channel.
    async fn stream_head(&self, channel_id: &ChannelId, entry: &Arc<ChannelEntry>) -> u64 {
        let stored = match self.bridge.get_value(&watermark_key(channel_id)).await {
            Ok(Some(raw)) => raw.parse::<u64>().unwrap_or(0),
            Ok(None) => 0,
            Err(error) => {
                debug!(%error, channel = %channel_id, "watermark read failed, using local view");
                0
            }
        };
        let state = entry.state.lock();
        stored
            .max(state.ring.newest().unwrap_or(0))
            .max(state.next_expected.saturating_sub(1))
    }

    /// Runs on the bridge's `Degraded` → `Connected` edge: flush events
    /// parked during the outage, then backfill whatever fan-out was missed.
    async fn reconcile_after_reconnect(&self) {
        info!("broker restored, reconciling channels");
        let entries: Vec<(ChannelId, Arc<ChannelEntry>)> = self
            .channels
            .iter()
            .map(|item| (item.key().clone(), Arc::clone(item.value())))
            .collect();
        for (channel_id, entry) in entries {
            self.flush_pending(&channel_id, &entry).await;
            self.backfill(&channel_id, &entry, false).await;
        }
    }

    async fn flush_pending(&self, channel_id: &ChannelId, entry: &Arc<ChannelEntry>) {
        let mut writer = entry.writer.lock().await;
        if writer.pending_forward.is_empty() {
            return;
        }
        match self
            .bridge
            .acquire_lease(&lease_key(channel_id), self.lease_ttl)
            .await
        {
            Ok(LeaseOutcome::Granted) => {
                writer.lease_deadline = Some(Instant::now() + self.lease_ttl);
                metrics::counter!("lease_acquisitions_total").increment(1);
                info!(
                    channel = %channel_id,
                    queued = writer.pending_forward.len(),
                    "flushing events parked during the outage"
                );
                while let Some(event) = writer.pending_forward.front().cloned() {
                    let encoded = event_json(&event);
                    let forwarded: Result<(), ClusterError> = async {
                        self.bridge
                            .put_value(&watermark_key(channel_id), &event.sequence.to_string(), None)
                            .await?;
                        self.bridge
                            .ring_append(channel_id.as_str(), event.sequence, &encoded)
                            .await?;
                        if event.is_terminal() {
                            self.bridge
                                .put_value(&closed_key(channel_id), "1", None)
                                .await?;
                        }
                        if matches!(event.control_signal(), Some(ControlSignal::Reopened)) {
                            let _ = self.bridge.remove_value(&closed_key(channel_id)).await;
                        }
                        self.bridge.publish(&topic(channel_id), encoded.clone()).await
                    }
                    .await;
                    match forwarded {
                        Ok(()) => {
                            let _ = writer.pending_forward.pop_front();
                        }
                        Err(error) => {
                            debug!(%error, channel = %channel_id, "broker lost again mid-flush");
                            return;
                        }
                    }
                }
            }
            Ok(LeaseOutcome::Held { holder }) => {
                // Another instance took over sequencing during the outage;
                // the locally numbered tail conflicts with the cluster's
                // stream and cannot be merged.
                metrics::counter!("lease_conflicts_total").increment(1);
                warn!(
                    channel = %channel_id, %holder,
                    discarded = writer.pending_forward.len(),
                    "lease lost during outage, local tail discarded"
                );
                writer.pending_forward.clear();
                writer.lease_deadline = None;
                writer.next_sequence = 0;
                self.force_resync(channel_id, entry);
            }
            Ok(LeaseOutcome::Lost) | Err(_) => {}
        }
    }

    /// Drops local stream state that diverged from the cluster and tells
    /// subscribers to resync.
    fn force_resync(&self, channel_id: &ChannelId, entry: &ChannelEntry) {
        metrics::counter!("resyncs_required_total").increment(1);
        let mut state = entry.state.lock();
        let frame = ServerFrame::status(
            codes::RESYNC_REQUIRED,
            "stream diverged during broker outage, resubscribe",
            Some(channel_id.clone()),
        );
        let notice = Arc::new(serde_json::to_string(&frame).unwrap_or_else(|_| String::from("{}")));
        let connections: Vec<ConnectionId> = state.subscribers.keys().cloned().collect();
        for connection_id in connections {
            if let Some(subscriber) = state.subscribers.remove(&connection_id) {
                let tx = match subscriber {
                    Subscriber::Live { tx } | Subscriber::Replaying { tx, .. } => tx,
                };
                let _ = tx.try_send(Arc::clone(&notice));
            }
            let _ = self.evictions.send(connection_id);
        }
        state.ring.clear();
        state.reorder.clear();
        state.next_expected = 0;
        state.gap_check_armed = false;
    }

    /// Evicts channels with no subscribers, no pending events, and no live
    /// lease once they pass the idle horizon.
    async fn sweep_idle(&self) {
        let horizon = self.settings.idle_channel();
        let now = Instant::now();
        let mut parked = 0usize;
        let mut stale: Vec<ChannelId> = Vec::new();
        for item in self.channels.iter() {
            let entry = item.value();
            let state_idle = {
                let state = entry.state.lock();
                parked += state.reorder.len();
                state.subscribers.is_empty()
                    && now.saturating_duration_since(state.last_activity) >= horizon
            };
            if !state_idle {
                continue;
            }
            let writer_idle = entry
                .writer
                .try_lock()
                .map(|writer| {
                    writer.pending_forward.is_empty()
                        && writer.lease_deadline.is_none_or(|deadline| deadline <= now)
                })
                .unwrap_or(false);
            if writer_idle {
                stale.push(item.key().clone());
            }
        }
        #[allow(clippy::cast_precision_loss)]
        metrics::gauge!("reorder_buffered").set(parked as f64);
        for channel_id in stale {
            let _ = self.channels.remove(&channel_id);
            let _ = self.bridge.unsubscribe(&topic(&channel_id)).await;
            debug!(channel = %channel_id, "idle channel evicted");
        }
    }
}

/// Hub worker: applies bridge arrivals in order, runs gap checks, watches
/// the bridge state for the reconnect edge, and sweeps idle channels.
async fn run_worker(hub: Weak<ChannelHub>, mut commands: mpsc::Receiver<HubCommand>) {
    let mut state_watch = {
        let Some(hub) = hub.upgrade() else { return };
        hub.bridge.watch_state()
    };
    let mut last_state = *state_watch.borrow();
    let mut idle = interval(IDLE_SWEEP_INTERVAL);
    idle.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            command = commands.recv() => {
                let Some(command) = command else { break };
                let Some(hub) = hub.upgrade() else { break };
                match command {
                    HubCommand::Remote { event } => hub.apply_remote(event).await,
                    HubCommand::CheckGap { channel_id, expected } => {
                        hub.check_gap(&channel_id, expected).await;
                    }
                }
            }
            changed = state_watch.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = *state_watch.borrow();
                let previous = std::mem::replace(&mut last_state, current);
                if previous == BridgeState::Degraded && current == BridgeState::Connected {
                    let Some(hub) = hub.upgrade() else { break };
                    hub.reconcile_after_reconnect().await;
                }
            }
            _ = idle.tick() => {
                let Some(hub) = hub.upgrade() else { break };
                hub.sweep_idle().await;
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
