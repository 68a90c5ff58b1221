//! The connection state machine.
//!
//! One background task owns the upstream stream, the subscription set, and
//! the offline queue; every mutation of that state happens on this task, so
//! the machine needs no locking. The public facade talks to it over an mpsc
//! command channel and observes it through a watch channel.
//!
//! Lifecycle per session:
//!
//! 1. Open the stream (`disconnected/error -> connecting`)
//! 2. On open: reset the retry counter, replay subscriptions as one batch,
//!    flush the offline queue (`-> connected`)
//! 3. Read frames, pinging on the heartbeat interval
//! 4. On unexpected loss: exponential backoff with an attempt budget
//!    (`-> error`, then `-> connecting` when the backoff expires)
//!
//! Heartbeat and backoff deadlines are locals of the loops below; a state
//! transition resets them as one atomic step, so a timer can never fire
//! against a stale connection generation.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;
use wavelink_core::{
    ConnectionAction, ConnectionHistoryEntry, MessageRouter, OfflineQueue, StatsCollector,
};
use wavelink_protocol::{kinds, Message, PublishOptions};

use crate::config::ClientConfig;
use crate::control::ControlPlane;
use crate::instrument;
use crate::registry::SubscriptionRegistry;
use crate::transport::{StreamConnection, StreamTransport};

/// Deadline value for "not armed". Far enough ahead to never fire.
const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 3600);

/// Connection states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

/// Immutable snapshot of the machine, published on every transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    /// Connection-attempt generation; each attempt increments it.
    pub generation: u64,
    /// Consecutive failed attempts so far.
    pub attempts: u32,
}

impl ConnectionStatus {
    pub(crate) fn initial() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            generation: 0,
            attempts: 0,
        }
    }
}

/// Where an outbound publish is addressed.
#[derive(Debug, Clone)]
pub enum PublishTarget {
    Broadcast,
    Topic(String),
    Topics(Vec<String>),
}

/// What became of an outbound publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Dispatched to the control plane, which accepted it.
    Sent,
    /// Buffered in the offline queue; an optimistic echo was dispatched.
    Queued,
    /// The control plane refused or the call failed; nothing was queued,
    /// the caller may retry explicitly.
    Rejected(Option<String>),
}

/// Commands from the facade to the actor.
pub(crate) enum Command {
    Connect,
    Disconnect,
    Subscribe {
        topic: String,
        reply: oneshot::Sender<bool>,
    },
    Unsubscribe {
        topic: String,
        reply: oneshot::Sender<bool>,
    },
    Publish {
        target: PublishTarget,
        data: Value,
        options: PublishOptions,
        reply: oneshot::Sender<PublishOutcome>,
    },
    Topics {
        reply: oneshot::Sender<Vec<String>>,
    },
    Shutdown,
}

/// How a connected session ended.
enum SessionEnd {
    /// Locally requested disconnect; no reconnection.
    Manual,
    /// The network-availability signal went down; reconnect on network-up.
    NetworkDown,
    /// Remote close or transport error; reconnect with backoff.
    Remote,
    /// No pong within the timeout window; reconnect with backoff.
    HeartbeatTimeout,
    /// The client is being disposed.
    Shutdown,
}

/// The exponential backoff schedule: `min(base * 2^attempt, cap)`.
pub(crate) fn backoff_delay(base_ms: u64, cap_ms: u64, attempt: u32) -> Duration {
    let exp = base_ms.saturating_mul(2u64.saturating_pow(attempt));
    Duration::from_millis(exp.min(cap_ms))
}

pub(crate) struct ConnectionActor {
    pub(crate) config: ClientConfig,
    pub(crate) client_id: String,
    pub(crate) transport: Arc<dyn StreamTransport>,
    pub(crate) control: Arc<dyn ControlPlane>,
    pub(crate) router: Arc<MessageRouter>,
    pub(crate) stats: Arc<StatsCollector>,
    pub(crate) registry: SubscriptionRegistry,
    pub(crate) queue: OfflineQueue,
    pub(crate) cmd_rx: mpsc::Receiver<Command>,
    pub(crate) status_tx: watch::Sender<ConnectionStatus>,
    pub(crate) net_rx: watch::Receiver<bool>,
    pub(crate) state: ConnectionState,
    pub(crate) generation: u64,
    pub(crate) attempts: u32,
    pub(crate) connect_requested: bool,
    pub(crate) backoff_deadline: Option<Instant>,
    pub(crate) net_watch_live: bool,
    pub(crate) shutdown: bool,
}

impl ConnectionActor {
    pub(crate) async fn run(mut self) {
        info!(client = %self.client_id, transport = self.transport.name(), "Stream client started");

        while !self.shutdown {
            if self.connect_requested {
                self.connect_requested = false;
                if !self.net_up() {
                    debug!("Network down, deferring connect until it returns");
                } else {
                    match self.try_connect().await {
                        Ok(conn) => {
                            let end = self.run_connected(conn).await;
                            self.handle_session_end(end);
                        }
                        Err(reason) => {
                            warn!(error = %reason, "Connection attempt failed");
                            self.stats.record_history(
                                ConnectionHistoryEntry::now(ConnectionAction::Error)
                                    .with_reason(reason),
                            );
                            self.set_state(ConnectionState::Error);
                            self.schedule_reconnect();
                        }
                    }
                    continue;
                }
            }

            if let Some(deadline) = self.backoff_deadline {
                self.wait_backoff(deadline).await;
                continue;
            }

            self.wait_idle().await;
        }

        info!(client = %self.client_id, "Stream client stopped");
    }

    fn net_up(&self) -> bool {
        *self.net_rx.borrow()
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            trace!(from = ?self.state, to = ?state, "State transition");
        }
        self.state = state;
        let status = ConnectionStatus {
            state,
            generation: self.generation,
            attempts: self.attempts,
        };
        self.status_tx.send_replace(status);
        instrument::set_connection_state(state);
    }

    /// Open the stream, then replay subscriptions and flush the queue.
    async fn try_connect(&mut self) -> Result<Box<dyn StreamConnection>, String> {
        self.generation += 1;
        self.set_state(ConnectionState::Connecting);
        self.stats.record_attempt();
        instrument::record_connect_attempt();
        debug!(
            generation = self.generation,
            attempts = self.attempts,
            "Opening stream"
        );

        let timeout = Duration::from_millis(self.config.reconnect.connect_timeout_ms);
        let conn = match tokio::time::timeout(timeout, self.transport.open(&self.client_id)).await {
            Ok(Ok(conn)) => conn,
            Ok(Err(e)) => return Err(e.to_string()),
            Err(_) => return Err(format!("connect timed out after {}ms", timeout.as_millis())),
        };

        self.attempts = 0;
        self.set_state(ConnectionState::Connected);
        self.stats
            .record_history(ConnectionHistoryEntry::now(ConnectionAction::Connect));
        info!(generation = self.generation, "Stream connected");

        // One atomic batch, so handlers never observe a partially
        // resubscribed state after reconnect.
        self.registry
            .resubscribe_all(self.control.as_ref(), &self.client_id)
            .await;
        self.flush_queue().await;

        Ok(conn)
    }

    /// The connected read loop: frames, commands, heartbeat, network signal.
    async fn run_connected(&mut self, mut conn: Box<dyn StreamConnection>) -> SessionEnd {
        let connected_at = Instant::now();
        let hb_interval = Duration::from_millis(self.config.heartbeat.interval_ms);
        let hb_timeout = Duration::from_millis(self.config.heartbeat.timeout_ms);

        let mut hb_deadline = Instant::now() + hb_interval;
        let mut pong_deadline = Instant::now() + FAR_FUTURE;
        let mut awaiting_pong = false;
        let mut ping_sent_at: Option<Instant> = None;

        loop {
            let hb_sleep = sleep_until(hb_deadline);
            tokio::pin!(hb_sleep);
            let pong_sleep = sleep_until(pong_deadline);
            tokio::pin!(pong_sleep);

            tokio::select! {
                biased;

                // No pong within the window: the stream is silently dead.
                _ = &mut pong_sleep, if awaiting_pong => {
                    warn!(timeout_ms = hb_timeout.as_millis() as u64, "Heartbeat timed out, forcing close");
                    conn.close().await;
                    self.end_session("heartbeat timeout", connected_at);
                    return SessionEnd::HeartbeatTimeout;
                }

                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        None | Some(Command::Shutdown) => {
                            conn.close().await;
                            self.record_disconnect("client disposed", Some(connected_at));
                            return SessionEnd::Shutdown;
                        }
                        Some(Command::Disconnect) => {
                            conn.close().await;
                            self.record_disconnect("client disconnected", Some(connected_at));
                            return SessionEnd::Manual;
                        }
                        Some(Command::Connect) => {
                            // Already connected.
                        }
                        Some(other) => self.handle_command(other, true).await,
                    }
                }

                changed = self.net_rx.changed(), if self.net_watch_live => {
                    match changed {
                        Ok(()) if !self.net_up() => {
                            conn.close().await;
                            self.record_disconnect("network down", Some(connected_at));
                            return SessionEnd::NetworkDown;
                        }
                        Ok(()) => {}
                        Err(_) => self.net_watch_live = false,
                    }
                }

                _ = &mut hb_sleep => {
                    trace!("Sending heartbeat ping");
                    ping_sent_at = Some(Instant::now());
                    match self.control.ping(&self.client_id, Utc::now()).await {
                        Ok(response) if response.success => {}
                        Ok(response) => warn!(
                            reason = response.message.as_deref().unwrap_or("unknown"),
                            "Heartbeat ping rejected"
                        ),
                        // The pong deadline below decides whether the link
                        // is actually dead.
                        Err(e) => warn!(error = %e, "Heartbeat ping failed"),
                    }
                    awaiting_pong = true;
                    pong_deadline = Instant::now() + hb_timeout;
                    hb_deadline = Instant::now() + hb_interval;
                }

                event = conn.next_message() => {
                    match event {
                        Ok(Some(message)) if message.is_heartbeat() => {
                            trace!(kind = %message.kind, "Heartbeat frame received");
                            if awaiting_pong {
                                if let Some(sent_at) = ping_sent_at.take() {
                                    instrument::record_heartbeat_rtt(sent_at.elapsed().as_secs_f64());
                                }
                            }
                            awaiting_pong = false;
                            pong_deadline = Instant::now() + FAR_FUTURE;
                        }
                        Ok(Some(message)) => {
                            self.stats.record_message();
                            instrument::record_message(&message.kind);
                            self.router.dispatch(&message);
                        }
                        Ok(None) => {
                            // Remote-initiated close is not clean from our
                            // side; reconnect.
                            self.end_session("stream closed by server", connected_at);
                            return SessionEnd::Remote;
                        }
                        Err(e) => {
                            self.end_session(&e.to_string(), connected_at);
                            return SessionEnd::Remote;
                        }
                    }
                }
            }
        }
    }

    /// Record an unexpected session end and move to `error`.
    fn end_session(&mut self, reason: &str, connected_at: Instant) {
        let duration_ms = connected_at.elapsed().as_millis() as u64;
        warn!(reason = %reason, duration_ms, "Stream lost");
        self.stats.record_history(
            ConnectionHistoryEntry::now(ConnectionAction::Error)
                .with_reason(reason)
                .with_duration_ms(duration_ms),
        );
        self.set_state(ConnectionState::Error);
    }

    /// Record a clean local disconnect and move to `disconnected`.
    fn record_disconnect(&mut self, reason: &str, connected_at: Option<Instant>) {
        let mut entry =
            ConnectionHistoryEntry::now(ConnectionAction::Disconnect).with_reason(reason);
        if let Some(connected_at) = connected_at {
            entry = entry.with_duration_ms(connected_at.elapsed().as_millis() as u64);
        }
        info!(reason = %reason, "Disconnected");
        self.stats.record_history(entry);
        self.set_state(ConnectionState::Disconnected);
    }

    fn handle_session_end(&mut self, end: SessionEnd) {
        match end {
            SessionEnd::Shutdown => self.shutdown = true,
            SessionEnd::Manual => {}
            // Not a retry: the counter is untouched and reconnection waits
            // for the network-up signal.
            SessionEnd::NetworkDown => {}
            SessionEnd::Remote | SessionEnd::HeartbeatTimeout => self.schedule_reconnect(),
        }
    }

    /// Arm the backoff timer, or park in `error` once the budget is spent.
    fn schedule_reconnect(&mut self) {
        let max = self.config.reconnect.max_attempts;
        if self.attempts >= max {
            error!(attempts = self.attempts, "Max reconnect attempts exceeded");
            self.stats.record_history(
                ConnectionHistoryEntry::now(ConnectionAction::Error)
                    .with_reason("max reconnect attempts exceeded"),
            );
            self.set_state(ConnectionState::Error);
            self.backoff_deadline = None;
            return;
        }

        self.attempts += 1;
        let delay = backoff_delay(
            self.config.reconnect.base_delay_ms,
            self.config.reconnect.max_delay_ms,
            self.attempts,
        );
        info!(
            attempt = self.attempts,
            max,
            delay_ms = delay.as_millis() as u64,
            "Reconnect scheduled"
        );
        self.stats.record_history(
            ConnectionHistoryEntry::now(ConnectionAction::Reconnect).with_reason(format!(
                "attempt {}/{} in {}ms",
                self.attempts,
                max,
                delay.as_millis()
            )),
        );
        instrument::record_reconnect_scheduled();
        self.set_state(ConnectionState::Error);
        self.backoff_deadline = Some(Instant::now() + delay);
    }

    /// Wait out the backoff delay, still serving commands.
    async fn wait_backoff(&mut self, deadline: Instant) {
        let backoff_sleep = sleep_until(deadline);
        tokio::pin!(backoff_sleep);

        tokio::select! {
            biased;

            cmd = self.cmd_rx.recv() => {
                match cmd {
                    None | Some(Command::Shutdown) => {
                        self.backoff_deadline = None;
                        self.shutdown = true;
                    }
                    Some(Command::Disconnect) => {
                        info!("Reconnect canceled by disconnect");
                        self.backoff_deadline = None;
                        self.record_disconnect("client disconnected", None);
                    }
                    Some(Command::Connect) => {
                        // Manual connect: fresh budget, retry immediately.
                        self.attempts = 0;
                        self.backoff_deadline = None;
                        self.connect_requested = true;
                    }
                    Some(other) => self.handle_command(other, false).await,
                }
            }

            changed = self.net_rx.changed(), if self.net_watch_live => {
                match changed {
                    Ok(()) if !self.net_up() => {
                        // Stop retrying until the network returns.
                        self.backoff_deadline = None;
                        self.record_disconnect("network down", None);
                    }
                    Ok(()) => {
                        self.attempts = 0;
                        self.backoff_deadline = None;
                        self.connect_requested = true;
                    }
                    Err(_) => self.net_watch_live = false,
                }
            }

            _ = &mut backoff_sleep => {
                self.backoff_deadline = None;
                self.connect_requested = true;
            }
        }
    }

    /// Parked (disconnected, or error with the budget spent): wait for a
    /// command or the network signal.
    async fn wait_idle(&mut self) {
        tokio::select! {
            biased;

            cmd = self.cmd_rx.recv() => {
                match cmd {
                    None | Some(Command::Shutdown) => self.shutdown = true,
                    Some(Command::Connect) => {
                        self.attempts = 0;
                        self.connect_requested = true;
                    }
                    Some(Command::Disconnect) => {
                        // Already disconnected.
                    }
                    Some(other) => self.handle_command(other, false).await,
                }
            }

            changed = self.net_rx.changed(), if self.net_watch_live => {
                match changed {
                    Ok(()) if self.net_up() => {
                        info!("Network restored, reconnecting");
                        self.attempts = 0;
                        self.connect_requested = true;
                    }
                    Ok(()) => {}
                    Err(_) => self.net_watch_live = false,
                }
            }
        }
    }

    /// Commands that work the same in every phase.
    async fn handle_command(&mut self, cmd: Command, connected: bool) {
        match cmd {
            Command::Subscribe { topic, reply } => {
                let ok = self.subscribe_topic(&topic, connected).await;
                let _ = reply.send(ok);
            }
            Command::Unsubscribe { topic, reply } => {
                let ok = self.unsubscribe_topic(&topic, connected).await;
                let _ = reply.send(ok);
            }
            Command::Publish {
                target,
                data,
                options,
                reply,
            } => {
                let outcome = self.publish(target, data, options, connected).await;
                let _ = reply.send(outcome);
            }
            Command::Topics { reply } => {
                let _ = reply.send(self.registry.topics());
            }
            // Handled by the phase loops before delegating here.
            Command::Connect | Command::Disconnect | Command::Shutdown => {}
        }
    }

    /// Idempotent subscribe. While connected the control-plane call comes
    /// first and a failure leaves the set unchanged; while disconnected the
    /// topic is recorded locally and replayed on the next connect.
    async fn subscribe_topic(&mut self, topic: &str, connected: bool) -> bool {
        if self.registry.contains(topic) {
            return true;
        }
        if !connected {
            self.registry.insert(topic);
            return true;
        }
        match self.control.subscribe(&self.client_id, topic).await {
            Ok(response) if response.success => {
                self.registry.insert(topic);
                true
            }
            Ok(response) => {
                warn!(
                    topic = %topic,
                    reason = response.message.as_deref().unwrap_or("unknown"),
                    "Subscribe rejected"
                );
                false
            }
            Err(e) => {
                warn!(topic = %topic, error = %e, "Subscribe failed");
                false
            }
        }
    }

    /// Removes the topic locally regardless of connectivity; the
    /// control-plane call is only issued while connected, and its failure
    /// does not resurrect the topic.
    async fn unsubscribe_topic(&mut self, topic: &str, connected: bool) -> bool {
        let removed = self.registry.remove(topic);
        if removed && connected {
            match self.control.unsubscribe(&self.client_id, topic).await {
                Ok(response) if response.success => {}
                Ok(response) => warn!(
                    topic = %topic,
                    reason = response.message.as_deref().unwrap_or("unknown"),
                    "Unsubscribe rejected"
                ),
                Err(e) => warn!(topic = %topic, error = %e, "Unsubscribe failed"),
            }
        }
        true
    }

    async fn publish(
        &mut self,
        target: PublishTarget,
        data: Value,
        options: PublishOptions,
        connected: bool,
    ) -> PublishOutcome {
        if !connected || !self.net_up() {
            return self.enqueue_offline(target, data, options);
        }

        let result = match &target {
            PublishTarget::Broadcast => {
                let message = self.build_outbound(None, data, &options, None);
                self.control.broadcast(&message).await
            }
            PublishTarget::Topic(topic) => {
                let message = self.build_outbound(Some(topic), data, &options, None);
                self.control.publish(topic, &message).await
            }
            PublishTarget::Topics(topics) => {
                let message = self.build_outbound(None, data, &options, None);
                self.control.publish_multi(topics, &message).await
            }
        };

        match result {
            Ok(response) if response.success => {
                instrument::record_publish("sent");
                PublishOutcome::Sent
            }
            Ok(response) => {
                warn!(
                    reason = response.message.as_deref().unwrap_or("unknown"),
                    "Publish rejected"
                );
                instrument::record_publish("rejected");
                PublishOutcome::Rejected(response.message)
            }
            Err(e) => {
                warn!(error = %e, "Publish failed");
                instrument::record_publish("rejected");
                PublishOutcome::Rejected(Some(e.to_string()))
            }
        }
    }

    /// Queue while offline and push an optimistic echo through the router
    /// so local state reflects the attempted send.
    fn enqueue_offline(
        &mut self,
        target: PublishTarget,
        data: Value,
        options: PublishOptions,
    ) -> PublishOutcome {
        let topics: Vec<Option<String>> = match target {
            PublishTarget::Broadcast => vec![None],
            PublishTarget::Topic(topic) => vec![Some(topic)],
            PublishTarget::Topics(topics) => topics.into_iter().map(Some).collect(),
        };

        for topic in topics {
            let entry = self.queue.enqueue(topic, data.clone(), options.clone());
            let echo = entry.local_echo(&self.client_id);
            self.router.dispatch(&echo);
        }
        instrument::set_queue_depth(self.queue.len());
        instrument::record_publish("queued");
        PublishOutcome::Queued
    }

    /// Drain the offline queue in FIFO order.
    ///
    /// Drop-on-dispatch: an entry leaves the queue once its call has been
    /// issued; a failed call is logged, not re-queued.
    async fn flush_queue(&mut self) {
        if self.queue.is_empty() {
            return;
        }
        info!(pending = self.queue.len(), "Flushing offline queue");

        while let Some(entry) = self.queue.pop_front() {
            let message = self.build_outbound(
                entry.topic.as_deref(),
                entry.data.clone(),
                &entry.options,
                Some(entry.local_id.clone()),
            );
            let result = match &entry.topic {
                Some(topic) => self.control.publish(topic, &message).await,
                None => self.control.broadcast(&message).await,
            };
            match result {
                Ok(response) if response.success => {
                    debug!(
                        topic = entry.topic.as_deref().unwrap_or("<broadcast>"),
                        "Queued publish dispatched"
                    );
                }
                Ok(response) => warn!(
                    topic = entry.topic.as_deref().unwrap_or("<broadcast>"),
                    reason = response.message.as_deref().unwrap_or("unknown"),
                    "Queued publish rejected after dispatch"
                ),
                Err(e) => warn!(
                    topic = entry.topic.as_deref().unwrap_or("<broadcast>"),
                    error = %e,
                    "Queued publish failed after dispatch"
                ),
            }
        }
        instrument::set_queue_depth(0);
    }

    fn build_outbound(
        &self,
        topic: Option<&str>,
        data: Value,
        options: &PublishOptions,
        id: Option<String>,
    ) -> Message {
        let kind = if topic.is_some() {
            kinds::TOPIC_MESSAGE
        } else {
            kinds::BROADCAST
        };
        let mut message = Message::new(kind)
            .with_data(data)
            .with_sender(&self.client_id)
            .with_id(id.unwrap_or_else(|| Uuid::new_v4().to_string()));
        if let Some(topic) = topic {
            message = message.with_topic(topic);
        }
        if let Some(priority) = options.priority {
            message = message.with_priority(priority);
        }
        if let Some(ttl) = options.ttl {
            message = message.with_ttl(ttl);
        }
        message.metadata = options.metadata.clone();
        message
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_sequence() {
        // base 1000ms, cap 30000ms: attempts 1..6 double then saturate.
        let delays: Vec<u64> = (1..=6)
            .map(|attempt| backoff_delay(1_000, 30_000, attempt).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![2_000, 4_000, 8_000, 16_000, 30_000, 30_000]);
    }

    #[test]
    fn test_backoff_saturates_without_overflow() {
        let delay = backoff_delay(1_000, 30_000, u32::MAX);
        assert_eq!(delay, Duration::from_millis(30_000));
    }

    #[test]
    fn test_initial_status() {
        let status = ConnectionStatus::initial();
        assert_eq!(status.state, ConnectionState::Disconnected);
        assert_eq!(status.generation, 0);
        assert_eq!(status.attempts, 0);
    }
}
