//! In-process topic pub/sub.
//!
//! Each topic is a `tokio::sync::broadcast` channel with its own sequence
//! counter. Publishing assigns the sequence and sends under one lock, so
//! events from a single publisher to a single topic are observed in send
//! order. Delivery is best effort within the process: a subscriber that falls
//! behind the buffer skips the overwritten events and keeps going.
//!
//! A closed topic stays closed: later publishes are dropped until someone
//! subscribes to it or reopens it, and its sequence resumes where it stopped.

use std::collections::HashMap;
use std::pin::Pin;

use arbor_protocol::{
    AgentAddress, AuditEvent, AuditSink, EventId, EventKind, EventRecord, ExecutionId,
};
use chrono::Utc;
use futures_util::Stream;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tracing::{debug, warn};

/// Topic that security audit events are published on.
pub const SECURITY_TOPIC: &str = "security";

pub const DEFAULT_BUFFER: usize = 1024;

pub type EventStream = Pin<Box<dyn Stream<Item = EventRecord> + Send>>;

#[derive(Debug)]
struct Topic {
    sender: broadcast::Sender<EventRecord>,
    last_sequence: u64,
}

impl Topic {
    fn new(buffer: usize) -> Self {
        let (sender, _) = broadcast::channel(buffer);
        Self {
            sender,
            last_sequence: 0,
        }
    }
}

#[derive(Debug, Default)]
struct Topics {
    open: HashMap<String, Topic>,
    /// Last sequence of each closed topic.
    closed: HashMap<String, u64>,
}

impl Topics {
    fn ensure_open(&mut self, topic: &str, buffer: usize) -> &mut Topic {
        let closed = &mut self.closed;
        self.open.entry(topic.to_owned()).or_insert_with(|| {
            let mut channel = Topic::new(buffer);
            if let Some(last_sequence) = closed.remove(topic) {
                channel.last_sequence = last_sequence;
                debug!(topic, last_sequence, "topic reopened");
            }
            channel
        })
    }
}

#[derive(Debug)]
pub struct EventBus {
    topics: Mutex<Topics>,
    firehose: broadcast::Sender<EventRecord>,
    buffer: usize,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER)
    }
}

impl EventBus {
    pub fn new(buffer: usize) -> Self {
        let buffer = buffer.max(1);
        let (firehose, _) = broadcast::channel(buffer);
        Self {
            topics: Mutex::new(Topics::default()),
            firehose,
            buffer,
        }
    }

    /// Publish `kind` on `topic`. Publishing to a topic nobody listens on is
    /// not an error; the event is simply dropped after sequencing. A closed
    /// topic takes nothing and yields `None`.
    pub fn publish(
        &self,
        topic: &str,
        source: AgentAddress,
        kind: EventKind,
    ) -> Option<EventRecord> {
        let mut topics = self.topics.lock();
        if topics.closed.contains_key(topic) {
            drop(topics);
            debug!(topic, event = kind.name(), "topic closed; event dropped");
            return None;
        }
        let channel = topics.ensure_open(topic, self.buffer);
        channel.last_sequence += 1;
        let record = EventRecord {
            event_id: EventId::default(),
            topic: topic.to_owned(),
            source,
            sequence: channel.last_sequence,
            timestamp: Utc::now(),
            kind,
        };
        let delivered = channel.sender.send(record.clone()).unwrap_or(0);
        let _ = self.firehose.send(record.clone());
        drop(topics);

        debug!(
            topic,
            sequence = record.sequence,
            event = record.kind.name(),
            delivered,
            "event published"
        );
        Some(record)
    }

    /// Lazy stream of events published on `topic` after this call. Reopens
    /// the topic if it was closed.
    pub fn subscribe(&self, topic: &str) -> EventStream {
        let receiver = self.topics.lock().ensure_open(topic, self.buffer).sender.subscribe();
        lag_tolerant(receiver, topic.to_owned())
    }

    /// Make a closed topic accept events again. No-op for open topics.
    pub fn reopen_topic(&self, topic: &str) {
        self.topics.lock().ensure_open(topic, self.buffer);
    }

    /// Every event on every topic.
    pub fn subscribe_all(&self) -> EventStream {
        lag_tolerant(self.firehose.subscribe(), "*".to_owned())
    }

    /// Events for one execution on `topic`, ending after its terminal event.
    /// Subscribe before the execution is started or early events are missed.
    pub fn execution_events(&self, topic: &str, execution_id: ExecutionId) -> EventStream {
        let mut events = self.subscribe(topic);
        Box::pin(async_stream::stream! {
            while let Some(event) = events.next().await {
                if event.execution_id() != Some(&execution_id) {
                    continue;
                }
                let terminal = event.kind.is_terminal_for_execution();
                yield event;
                if terminal {
                    break;
                }
            }
        })
    }

    /// Close a topic. Its subscribers drain what is buffered and then end.
    pub fn close_topic(&self, topic: &str) -> bool {
        let mut topics = self.topics.lock();
        let Some(channel) = topics.open.remove(topic) else {
            return false;
        };
        topics.closed.insert(topic.to_owned(), channel.last_sequence);
        debug!(topic, "topic closed");
        true
    }

    pub fn is_closed(&self, topic: &str) -> bool {
        self.topics.lock().closed.contains_key(topic)
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .lock()
            .open
            .get(topic)
            .map_or(0, |channel| channel.sender.receiver_count())
    }

    pub fn last_sequence(&self, topic: &str) -> u64 {
        let topics = self.topics.lock();
        topics
            .open
            .get(topic)
            .map(|channel| channel.last_sequence)
            .or_else(|| topics.closed.get(topic).copied())
            .unwrap_or(0)
    }
}

impl AuditSink for EventBus {
    fn record(&self, event: AuditEvent) {
        self.publish(
            SECURITY_TOPIC,
            AgentAddress::Gateway,
            EventKind::SecurityAudit { event },
        );
    }
}

fn lag_tolerant(receiver: broadcast::Receiver<EventRecord>, topic: String) -> EventStream {
    Box::pin(
        BroadcastStream::new(receiver).filter_map(move |item| match item {
            Ok(event) => Some(event),
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                warn!(topic = %topic, skipped, "subscriber lagged; events dropped");
                None
            }
        }),
    )
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use anyhow::Result;
    use arbor_protocol::{AuditAction, ErrorKind, SessionId};
    use serde_json::json;
    use tokio::time::timeout;

    use super::*;

    fn custom(n: u64) -> EventKind {
        EventKind::Custom {
            event_type: "tick".into(),
            data: json!({ "n": n }),
        }
    }

    fn n_of(event: &EventRecord) -> Option<u64> {
        match &event.kind {
            EventKind::Custom { data, .. } => data["n"].as_u64(),
            _ => None,
        }
    }

    #[tokio::test]
    async fn same_publisher_order_is_preserved() -> Result<()> {
        let bus = EventBus::new(64);
        let topic = SessionId::from_string("S1").topic();
        let mut stream = bus.subscribe(&topic);

        for n in 1..=10 {
            bus.publish(&topic, AgentAddress::Gateway, custom(n));
        }
        let mut seen = Vec::new();
        for _ in 0..10 {
            let event = timeout(Duration::from_secs(1), stream.next()).await?;
            seen.push(event.and_then(|e| n_of(&e).map(|n| (n, e.sequence))));
        }
        let expected: Vec<_> = (1..=10).map(|n| Some((n, n))).collect();
        assert_eq!(seen, expected);
        assert_eq!(bus.last_sequence(&topic), 10);
        Ok(())
    }

    #[tokio::test]
    async fn topics_are_isolated_and_sequenced_independently() -> Result<()> {
        let bus = EventBus::default();
        let mut a = bus.subscribe("session:a");
        bus.publish("session:b", AgentAddress::Gateway, custom(1));
        bus.publish("session:a", AgentAddress::Gateway, custom(2));

        let event = timeout(Duration::from_secs(1), a.next()).await?;
        let event = event.ok_or_else(|| anyhow::anyhow!("stream ended"))?;
        assert_eq!(n_of(&event), Some(2));
        assert_eq!(event.sequence, 1);
        assert_eq!(bus.last_sequence("session:b"), 1);
        Ok(())
    }

    #[tokio::test]
    async fn lagging_subscriber_skips_and_continues() -> Result<()> {
        let bus = EventBus::new(2);
        let stream = bus.subscribe("t");
        for n in 1..=5 {
            bus.publish("t", AgentAddress::Gateway, custom(n));
        }
        assert!(bus.close_topic("t"));

        let received: Vec<_> = timeout(Duration::from_secs(1), stream.collect::<Vec<_>>()).await?;
        let ns: Vec<_> = received.iter().filter_map(n_of).collect();
        assert_eq!(ns, vec![4, 5]);
        Ok(())
    }

    #[tokio::test]
    async fn execution_stream_ends_at_terminal_event() -> Result<()> {
        let bus = EventBus::default();
        let topic = "session:S1";
        let execution_id = ExecutionId::from_string("E1");
        let stream = bus.execution_events(topic, execution_id.clone());

        bus.publish(
            topic,
            AgentAddress::Gateway,
            EventKind::ExecutionProgress {
                execution_id: ExecutionId::from_string("other"),
                percent: 10,
                message: "noise".into(),
            },
        );
        bus.publish(
            topic,
            AgentAddress::Gateway,
            EventKind::ExecutionProgress {
                execution_id: execution_id.clone(),
                percent: 50,
                message: "half".into(),
            },
        );
        bus.publish(
            topic,
            AgentAddress::Gateway,
            EventKind::ExecutionFailed {
                execution_id: execution_id.clone(),
                error_kind: ErrorKind::Execution,
                error: "first attempt".into(),
                will_retry: true,
            },
        );
        bus.publish(
            topic,
            AgentAddress::Gateway,
            EventKind::ExecutionCompleted {
                execution_id: execution_id.clone(),
                output: json!(42),
            },
        );

        let names: Vec<_> = timeout(Duration::from_secs(1), stream.collect::<Vec<_>>())
            .await?
            .iter()
            .map(|event| event.kind.name())
            .collect();
        assert_eq!(
            names,
            vec!["execution_progress", "execution_failed", "execution_completed"]
        );
        Ok(())
    }

    #[tokio::test]
    async fn audit_sink_publishes_on_security_topic() -> Result<()> {
        let bus = EventBus::default();
        let mut security = bus.subscribe(SECURITY_TOPIC);
        let mut all = bus.subscribe_all();

        bus.record(AuditEvent::new(Utc::now(), AuditAction::Denied).reason("expired"));

        for stream in [&mut security, &mut all] {
            let event = timeout(Duration::from_secs(1), stream.next())
                .await?
                .ok_or_else(|| anyhow::anyhow!("stream ended"))?;
            assert_eq!(event.topic, SECURITY_TOPIC);
            assert!(matches!(
                event.kind,
                EventKind::SecurityAudit { ref event } if event.action == AuditAction::Denied
            ));
        }
        Ok(())
    }

    #[test]
    fn publish_without_subscribers_is_fine() {
        let bus = EventBus::default();
        let record = bus.publish("nobody", AgentAddress::Gateway, custom(1));
        assert_eq!(record.map(|record| record.sequence), Some(1));
        assert_eq!(bus.subscriber_count("nobody"), 0);
        assert!(!bus.close_topic("never-created"));
    }

    #[tokio::test]
    async fn closed_topics_stay_closed_until_reopened() -> Result<()> {
        let bus = EventBus::default();
        let topic = "session:S1";
        let stream = bus.subscribe(topic);
        bus.publish(topic, AgentAddress::Gateway, custom(1));
        assert!(bus.close_topic(topic));

        assert!(bus.publish(topic, AgentAddress::Gateway, custom(2)).is_none());
        assert!(bus.is_closed(topic));
        assert_eq!(bus.subscriber_count(topic), 0);
        assert_eq!(bus.last_sequence(topic), 1);
        let drained: Vec<_> = timeout(Duration::from_secs(1), stream.collect::<Vec<_>>()).await?;
        assert_eq!(drained.iter().filter_map(n_of).collect::<Vec<_>>(), vec![1]);

        let mut again = bus.subscribe(topic);
        assert!(!bus.is_closed(topic));
        let record = bus.publish(topic, AgentAddress::Gateway, custom(3));
        assert_eq!(record.map(|record| record.sequence), Some(2));
        let event = timeout(Duration::from_secs(1), again.next())
            .await?
            .ok_or_else(|| anyhow::anyhow!("stream ended"))?;
        assert_eq!(n_of(&event), Some(3));

        bus.close_topic(topic);
        bus.reopen_topic(topic);
        assert!(bus.publish(topic, AgentAddress::Gateway, custom(4)).is_some());
        Ok(())
    }
}
