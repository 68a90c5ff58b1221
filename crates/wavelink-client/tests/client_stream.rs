//! End-to-end tests of the client over scripted transports.
//!
//! Time is virtual (`start_paused`), so heartbeat and backoff schedules run
//! deterministically without real waiting.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::watch;
use wavelink_client::{
    ClientConfig, ConnectionState, Message, PublishOptions, PublishOutcome, StreamClient,
};

use support::{ControlCall, ScriptedControl, ScriptedTransport, StreamEvent};

fn test_config() -> ClientConfig {
    ClientConfig {
        client_id: Some("test-client".to_string()),
        ..ClientConfig::default()
    }
}

fn build_client(
    config: ClientConfig,
    transport: &Arc<ScriptedTransport>,
    control: &Arc<ScriptedControl>,
) -> StreamClient {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    StreamClient::builder(config)
        .transport(transport.clone())
        .control_plane(control.clone())
        .build()
        .expect("client builds")
}

async fn wait_state(client: &StreamClient, state: ConnectionState) {
    let mut rx = client.status_watch();
    rx.wait_for(|status| status.state == state)
        .await
        .expect("status watch closed");
}

/// Poll a condition under virtual time.
async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..10_000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("condition not met in time");
}

#[tokio::test(start_paused = true)]
async fn subscribe_is_idempotent() {
    let transport = ScriptedTransport::new();
    let _stream = transport.push_ok();
    let control = ScriptedControl::new();
    let client = build_client(test_config(), &transport, &control);

    client.connect().await.unwrap();
    wait_state(&client, ConnectionState::Connected).await;

    assert!(client.subscribe_topic("alerts").await.unwrap());
    assert!(client.subscribe_topic("alerts").await.unwrap());

    let subscribes = control
        .calls()
        .iter()
        .filter(|call| matches!(call, ControlCall::Subscribe(_)))
        .count();
    assert_eq!(subscribes, 1);
    assert_eq!(client.topics().await.unwrap(), vec!["alerts"]);
}

#[tokio::test(start_paused = true)]
async fn resubscribes_whole_set_after_reconnect() {
    let transport = ScriptedTransport::new();
    let stream1 = transport.push_ok();
    let _stream2 = transport.push_ok();
    let control = ScriptedControl::new();
    let client = build_client(test_config(), &transport, &control);

    client.connect().await.unwrap();
    wait_state(&client, ConnectionState::Connected).await;
    client.subscribe_topic("orders").await.unwrap();
    client.subscribe_topic("alerts").await.unwrap();

    // Force an unexpected stream loss.
    stream1
        .send(StreamEvent::Error("link reset".to_string()))
        .unwrap();
    wait_state(&client, ConnectionState::Error).await;
    wait_state(&client, ConnectionState::Connected).await;

    let batches: Vec<_> = control
        .calls()
        .into_iter()
        .filter_map(|call| match call {
            ControlCall::SubscribeBatch(topics) => Some(topics),
            _ => None,
        })
        .collect();
    // Exactly one batched replay, carrying exactly the subscribed set.
    assert_eq!(batches, vec![vec!["alerts".to_string(), "orders".to_string()]]);
    assert_eq!(transport.opened(), 2);
}

#[tokio::test(start_paused = true)]
async fn offline_topics_replay_on_first_connect() {
    let transport = ScriptedTransport::new();
    let _stream = transport.push_ok();
    let control = ScriptedControl::new();
    let client = build_client(test_config(), &transport, &control);

    // Wanting a topic does not require a connection.
    assert!(client.subscribe_topic("alerts").await.unwrap());
    assert!(control.calls().is_empty());

    client.connect().await.unwrap();
    wait_state(&client, ConnectionState::Connected).await;

    wait_until(|| {
        control
            .calls()
            .iter()
            .any(|call| matches!(call, ControlCall::SubscribeBatch(_)))
    })
    .await;
    let calls = control.calls();
    assert!(calls.contains(&ControlCall::SubscribeBatch(vec!["alerts".to_string()])));
}

#[tokio::test(start_paused = true)]
async fn offline_publishes_flush_in_fifo_order() {
    let transport = ScriptedTransport::new();
    let control = ScriptedControl::new();
    let client = build_client(test_config(), &transport, &control);

    let first = client
        .publish_to_topic("topic1", json!({"n": 1}), PublishOptions::default())
        .await
        .unwrap();
    let second = client
        .publish_to_topic("topic2", json!({"n": 2}), PublishOptions::default())
        .await
        .unwrap();
    assert_eq!(first, PublishOutcome::Queued);
    assert_eq!(second, PublishOutcome::Queued);

    // Optimistic echoes are visible locally, tagged as offline.
    let cached = client.cached_messages();
    assert_eq!(cached.len(), 2);
    assert!(cached.iter().all(|entry| {
        entry.message.metadata.as_ref().and_then(|m| m.get("offline")) == Some(&json!(true))
    }));

    let _stream = transport.push_ok();
    client.connect().await.unwrap();
    wait_state(&client, ConnectionState::Connected).await;

    wait_until(|| {
        control
            .calls()
            .iter()
            .filter(|call| matches!(call, ControlCall::Publish(_, _)))
            .count()
            == 2
    })
    .await;

    let publishes: Vec<String> = control
        .calls()
        .into_iter()
        .filter_map(|call| match call {
            ControlCall::Publish(topic, _) => Some(topic),
            _ => None,
        })
        .collect();
    assert_eq!(publishes, vec!["topic1".to_string(), "topic2".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn parks_in_error_after_attempt_budget() {
    let transport = ScriptedTransport::new();
    // The initial attempt plus the five-retry budget; nothing further may
    // be consumed until the manual connect below.
    for _ in 0..6 {
        transport.push_fail();
    }
    let control = ScriptedControl::new();
    let config = ClientConfig {
        client_id: Some("test-client".to_string()),
        reconnect: wavelink_client::config::ReconnectConfig {
            base_delay_ms: 100,
            max_delay_ms: 500,
            max_attempts: 5,
            connect_timeout_ms: 1_000,
        },
        ..ClientConfig::default()
    };
    let client = build_client(config, &transport, &control);

    client.connect().await.unwrap();

    // Initial attempt plus five retries, then the machine parks.
    wait_until(|| transport.opened() == 6 && client.state() == ConnectionState::Error).await;
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(transport.opened(), 6);
    assert_eq!(client.state(), ConnectionState::Error);
    assert!(client
        .connection_history()
        .iter()
        .any(|entry| entry.reason.as_deref() == Some("max reconnect attempts exceeded")));

    // Only a manual connect resumes, with a fresh budget.
    let _stream = transport.push_ok();
    client.connect().await.unwrap();
    wait_state(&client, ConnectionState::Connected).await;
    assert_eq!(transport.opened(), 7);
    assert_eq!(client.status().attempts, 0);
}

#[tokio::test(start_paused = true)]
async fn heartbeat_timeout_forces_reconnect() {
    let transport = ScriptedTransport::new();
    let _stream1 = transport.push_ok();
    let _stream2 = transport.push_ok();
    let control = ScriptedControl::new();
    let client = build_client(test_config(), &transport, &control);

    // Record every state transition.
    let states = Arc::new(std::sync::Mutex::new(Vec::new()));
    let mut status_rx = client.status_watch();
    let states_in = states.clone();
    tokio::spawn(async move {
        while status_rx.changed().await.is_ok() {
            states_in.lock().unwrap().push(status_rx.borrow().state);
        }
    });

    client.connect().await.unwrap();
    wait_state(&client, ConnectionState::Connected).await;

    // The ping goes out on the interval; no pong ever arrives, so the
    // timeout must force a close and a reconnect - with no transport error
    // having been reported.
    wait_until(|| control.calls().iter().any(|call| matches!(call, ControlCall::Ping))).await;
    wait_until(|| transport.opened() == 2 && client.state() == ConnectionState::Connected).await;

    assert_eq!(
        *states.lock().unwrap(),
        vec![
            ConnectionState::Connecting,
            ConnectionState::Connected,
            ConnectionState::Error,
            ConnectionState::Connecting,
            ConnectionState::Connected,
        ]
    );
    assert!(client
        .connection_history()
        .iter()
        .any(|entry| entry.reason.as_deref() == Some("heartbeat timeout")));
}

#[tokio::test(start_paused = true)]
async fn pong_frame_keeps_the_connection_alive() {
    let transport = ScriptedTransport::new();
    let stream = transport.push_ok();
    let control = ScriptedControl::new();
    let client = build_client(test_config(), &transport, &control);

    client.connect().await.unwrap();
    wait_state(&client, ConnectionState::Connected).await;

    wait_until(|| control.calls().iter().any(|call| matches!(call, ControlCall::Ping))).await;
    stream.send(StreamEvent::Frame(Message::new("pong"))).unwrap();

    // Well past the pong window: still connected, no second stream.
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(client.state(), ConnectionState::Connected);
    assert_eq!(transport.opened(), 1);

    // Heartbeats are bookkeeping, not data: nothing was stored or counted.
    assert_eq!(client.stats().messages_received, 0);
    assert!(client.archived_messages("global").is_empty());
}

#[tokio::test(start_paused = true)]
async fn inbound_messages_reach_handlers_and_stores() {
    let transport = ScriptedTransport::new();
    let stream = transport.push_ok();
    let control = ScriptedControl::new();
    let client = build_client(test_config(), &transport, &control);

    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    let seen_in = seen.clone();
    let _guard = client.on("topic:alerts", move |message: &Message| {
        seen_in.lock().unwrap().push(message.data.clone());
    });

    client.connect().await.unwrap();
    wait_state(&client, ConnectionState::Connected).await;

    stream
        .send(StreamEvent::Frame(
            Message::new("topic_message")
                .with_topic("alerts")
                .with_data(json!({"text": "disk full"})),
        ))
        .unwrap();

    wait_until(|| client.archived_messages("topic:alerts").len() == 1).await;
    assert_eq!(*seen.lock().unwrap(), vec![json!({"text": "disk full"})]);
    assert_eq!(client.stats().messages_received, 1);
    assert_eq!(client.cached_by_topic("alerts").len(), 1);
    assert_eq!(client.archived_messages("global").len(), 1);
    assert_eq!(client.archived_messages("kind:topic_message").len(), 1);
}

#[tokio::test(start_paused = true)]
async fn network_loss_pauses_without_burning_attempts() {
    let transport = ScriptedTransport::new();
    let _stream1 = transport.push_ok();
    let _stream2 = transport.push_ok();
    let control = ScriptedControl::new();
    let (net_tx, net_rx) = watch::channel(true);
    let client = StreamClient::builder(test_config())
        .transport(transport.clone())
        .control_plane(control.clone())
        .network_watch(net_rx)
        .build()
        .unwrap();

    client.connect().await.unwrap();
    wait_state(&client, ConnectionState::Connected).await;
    assert!(client.is_online());

    net_tx.send(false).unwrap();
    wait_state(&client, ConnectionState::Disconnected).await;
    assert_eq!(client.status().attempts, 0);
    assert!(!client.is_online());

    // Publishing while the network is down queues.
    let outcome = client
        .publish_to_topic("alerts", json!("later"), PublishOptions::default())
        .await
        .unwrap();
    assert_eq!(outcome, PublishOutcome::Queued);

    // No reconnection churn while down.
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(transport.opened(), 1);

    net_tx.send(true).unwrap();
    wait_state(&client, ConnectionState::Connected).await;
    assert_eq!(transport.opened(), 2);
    wait_until(|| {
        control
            .calls()
            .iter()
            .any(|call| matches!(call, ControlCall::Publish(topic, _) if topic == "alerts"))
    })
    .await;
    assert!(client
        .connection_history()
        .iter()
        .any(|entry| entry.reason.as_deref() == Some("network down")));
}

#[tokio::test(start_paused = true)]
async fn rejected_subscribe_leaves_set_unchanged() {
    let transport = ScriptedTransport::new();
    let _stream = transport.push_ok();
    let control = ScriptedControl::new();
    control.set_subscribe_success(false);
    let client = build_client(test_config(), &transport, &control);

    client.connect().await.unwrap();
    wait_state(&client, ConnectionState::Connected).await;

    assert!(!client.subscribe_topic("alerts").await.unwrap());
    assert!(client.topics().await.unwrap().is_empty());

    // The caller retries explicitly once the control plane recovers.
    control.set_subscribe_success(true);
    assert!(client.subscribe_topic("alerts").await.unwrap());
    assert_eq!(client.topics().await.unwrap(), vec!["alerts"]);
}

#[tokio::test(start_paused = true)]
async fn disconnect_cancels_pending_reconnect() {
    let transport = ScriptedTransport::new();
    transport.push_fail();
    let control = ScriptedControl::new();
    let client = build_client(test_config(), &transport, &control);

    client.connect().await.unwrap();
    wait_state(&client, ConnectionState::Error).await;

    client.disconnect().await.unwrap();
    wait_state(&client, ConnectionState::Disconnected).await;

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(transport.opened(), 1);
    assert_eq!(client.state(), ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn dispose_stops_the_actor() {
    let transport = ScriptedTransport::new();
    let _stream = transport.push_ok();
    let control = ScriptedControl::new();
    let mut client = build_client(test_config(), &transport, &control);

    client.connect().await.unwrap();
    wait_state(&client, ConnectionState::Connected).await;

    client.dispose().await;
    assert!(client.connect().await.is_err());
}

mod support {
    //! Scripted in-process stand-ins for the transport and control plane.

    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use serde_json::Value;
    use tokio::sync::mpsc;
    use wavelink_client::{
        ControlError, ControlPlane, Message, StreamConnection, StreamTransport, TransportError,
    };
    use wavelink_protocol::ControlResponse;

    /// What a scripted stream yields next.
    pub enum StreamEvent {
        Frame(Message),
        Error(String),
    }

    enum ConnectScript {
        Ok(mpsc::UnboundedReceiver<StreamEvent>),
        Fail,
    }

    /// A transport whose connections are scripted ahead of time. Opening
    /// with no script left hangs in `connecting` until the attempt times
    /// out.
    pub struct ScriptedTransport {
        scripts: Mutex<VecDeque<ConnectScript>>,
        opened: AtomicUsize,
    }

    impl ScriptedTransport {
        pub fn new() -> Arc<Self> {
            Arc::new(Self {
                scripts: Mutex::new(VecDeque::new()),
                opened: AtomicUsize::new(0),
            })
        }

        /// Script a successful connection; returns the event sender that
        /// drives it. Dropping the sender reads as a remote close.
        pub fn push_ok(&self) -> mpsc::UnboundedSender<StreamEvent> {
            let (tx, rx) = mpsc::unbounded_channel();
            self.scripts.lock().unwrap().push_back(ConnectScript::Ok(rx));
            tx
        }

        /// Script a failed connection attempt.
        pub fn push_fail(&self) {
            self.scripts.lock().unwrap().push_back(ConnectScript::Fail);
        }

        /// How many times `open` has been called.
        pub fn opened(&self) -> usize {
            self.opened.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl StreamTransport for ScriptedTransport {
        async fn open(
            &self,
            _client_id: &str,
        ) -> Result<Box<dyn StreamConnection>, TransportError> {
            self.opened.fetch_add(1, Ordering::SeqCst);
            // A real dial suspends at least once; observers of the status
            // watch rely on seeing the `connecting` state.
            tokio::task::yield_now().await;
            let script = self.scripts.lock().unwrap().pop_front();
            match script {
                Some(ConnectScript::Ok(rx)) => Ok(Box::new(ScriptedConnection { rx })),
                Some(ConnectScript::Fail) => {
                    Err(TransportError::ConnectFailed("scripted failure".to_string()))
                }
                None => std::future::pending().await,
            }
        }

        fn name(&self) -> &'static str {
            "scripted"
        }
    }

    struct ScriptedConnection {
        rx: mpsc::UnboundedReceiver<StreamEvent>,
    }

    #[async_trait]
    impl StreamConnection for ScriptedConnection {
        async fn next_message(&mut self) -> Result<Option<Message>, TransportError> {
            match self.rx.recv().await {
                Some(StreamEvent::Frame(message)) => Ok(Some(message)),
                Some(StreamEvent::Error(e)) => Err(TransportError::ReceiveFailed(e)),
                None => Ok(None),
            }
        }

        async fn close(&mut self) {
            self.rx.close();
        }
    }

    /// A recorded control-plane call.
    #[derive(Debug, Clone, PartialEq)]
    pub enum ControlCall {
        Subscribe(String),
        Unsubscribe(String),
        SubscribeBatch(Vec<String>),
        Publish(String, Value),
        PublishMulti(Vec<String>),
        Broadcast(Value),
        Ping,
    }

    /// A control plane that records calls and answers from flags.
    pub struct ScriptedControl {
        calls: Mutex<Vec<ControlCall>>,
        subscribe_success: AtomicBool,
    }

    impl ScriptedControl {
        pub fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                subscribe_success: AtomicBool::new(true),
            })
        }

        pub fn calls(&self) -> Vec<ControlCall> {
            self.calls.lock().unwrap().clone()
        }

        pub fn set_subscribe_success(&self, success: bool) {
            self.subscribe_success.store(success, Ordering::SeqCst);
        }

        fn record(&self, call: ControlCall) {
            self.calls.lock().unwrap().push(call);
        }

        fn subscribe_response(&self) -> ControlResponse {
            if self.subscribe_success.load(Ordering::SeqCst) {
                ControlResponse::ok()
            } else {
                ControlResponse::failed("subscribe refused")
            }
        }
    }

    #[async_trait]
    impl ControlPlane for ScriptedControl {
        async fn subscribe(
            &self,
            _client_id: &str,
            topic: &str,
        ) -> Result<ControlResponse, ControlError> {
            self.record(ControlCall::Subscribe(topic.to_string()));
            Ok(self.subscribe_response())
        }

        async fn unsubscribe(
            &self,
            _client_id: &str,
            topic: &str,
        ) -> Result<ControlResponse, ControlError> {
            self.record(ControlCall::Unsubscribe(topic.to_string()));
            Ok(ControlResponse::ok())
        }

        async fn subscribe_batch(
            &self,
            _client_id: &str,
            topics: &[String],
        ) -> Result<ControlResponse, ControlError> {
            self.record(ControlCall::SubscribeBatch(topics.to_vec()));
            Ok(self.subscribe_response())
        }

        async fn publish(
            &self,
            topic: &str,
            message: &Message,
        ) -> Result<ControlResponse, ControlError> {
            self.record(ControlCall::Publish(topic.to_string(), message.data.clone()));
            Ok(ControlResponse::ok())
        }

        async fn publish_multi(
            &self,
            topics: &[String],
            _message: &Message,
        ) -> Result<ControlResponse, ControlError> {
            self.record(ControlCall::PublishMulti(topics.to_vec()));
            Ok(ControlResponse::ok())
        }

        async fn broadcast(&self, message: &Message) -> Result<ControlResponse, ControlError> {
            self.record(ControlCall::Broadcast(message.data.clone()));
            Ok(ControlResponse::ok())
        }

        async fn ping(
            &self,
            _client_id: &str,
            _timestamp: DateTime<Utc>,
        ) -> Result<ControlResponse, ControlError> {
            self.record(ControlCall::Ping);
            Ok(ControlResponse::ok())
        }
    }
}
