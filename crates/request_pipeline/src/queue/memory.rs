//! In-process broker with the queue semantics the pipeline relies on.
//!
//! Declared queues and exchanges survive for the life of the [`MemoryBroker`]. Each
//! [`MemoryChannel`] tracks its own unacknowledged deliveries and prefetch limit; closing a channel
//! hands its unacknowledged messages back to their queues, flagged as redelivered. A
//! `nack` without requeue moves the message into the queue's dead-letter exchange, where it can be
//! inspected with [`MemoryBroker::dead_letters`].

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::watch;

use super::{Acknowledger, BrokerChannel, Delivery, DeliveryStream, QueueError};

#[derive(Clone, Debug)]
struct Message {
    body: Bytes,
    persistent: bool,
    redelivered: bool,
}

#[derive(Debug)]
struct QueueState {
    dead_letter_exchange: String,
    ready: VecDeque<Message>,
}

#[derive(Debug, Default)]
struct ChannelState {
    prefetch: u16,
    next_tag: u64,
    unacked: HashMap<u64, (String, Message)>,
}

#[derive(Debug, Default)]
struct BrokerState {
    connected: bool,
    exchanges: HashMap<String, Vec<Bytes>>,
    queues: HashMap<String, QueueState>,
    channels: HashMap<u64, ChannelState>,
    next_channel_id: u64,
}

#[derive(Debug)]
struct Shared {
    state: Mutex<BrokerState>,
    changed: watch::Sender<u64>,
}

enum Poll {
    Deliver(Delivery),
    Wait,
    Closed,
}

#[derive(Clone, Debug)]
pub struct MemoryBroker {
    shared: Arc<Shared>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        let (changed, _) = watch::channel(0);
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(BrokerState {
                    connected: true,
                    ..BrokerState::default()
                }),
                changed,
            }),
        }
    }

    pub fn channel(&self) -> MemoryChannel {
        let mut state = self.shared.state.lock();
        let id = state.next_channel_id;
        state.next_channel_id += 1;
        state.channels.insert(id, ChannelState::default());
        MemoryChannel {
            broker: self.clone(),
            id,
        }
    }

    /// Messages waiting in `queue`, not counting deliveries still unacknowledged.
    pub fn ready_count(&self, queue: &str) -> usize {
        self.shared
            .state
            .lock()
            .queues
            .get(queue)
            .map_or(0, |q| q.ready.len())
    }

    pub fn open_channels(&self) -> usize {
        self.shared.state.lock().channels.len()
    }

    pub fn unacked_count(&self) -> usize {
        self.shared
            .state
            .lock()
            .channels
            .values()
            .map(|c| c.unacked.len())
            .sum()
    }

    /// Whether every message currently waiting in `queue` was published as persistent.
    pub fn all_persistent(&self, queue: &str) -> bool {
        self.shared
            .state
            .lock()
            .queues
            .get(queue)
            .is_some_and(|q| q.ready.iter().all(|m| m.persistent))
    }

    pub fn dead_letters(&self, exchange: &str) -> Vec<Bytes> {
        self.shared
            .state
            .lock()
            .exchanges
            .get(exchange)
            .cloned()
            .unwrap_or_default()
    }

    /// Drops the connection: every consume stream ends and further operations fail.
    pub fn disconnect(&self) {
        self.shared.state.lock().connected = false;
        self.notify();
    }

    fn notify(&self) {
        self.shared.changed.send_modify(|v| *v = v.wrapping_add(1));
    }

    fn with_open_channel<T>(
        &self,
        channel_id: u64,
        f: impl FnOnce(&mut BrokerState) -> Result<T, QueueError>,
    ) -> Result<T, QueueError> {
        let mut state = self.shared.state.lock();
        if !state.connected {
            return Err(QueueError::ConnectionLost);
        }
        match state.channels.get(&channel_id) {
            Some(_) => f(&mut state),
            None => Err(QueueError::ChannelClosed),
        }
    }

    fn poll_delivery(&self, channel_id: u64, queue: &str) -> Poll {
        let mut state = self.shared.state.lock();
        let BrokerState {
            connected,
            queues,
            channels,
            ..
        } = &mut *state;
        let Some(channel) = channels.get_mut(&channel_id) else {
            return Poll::Closed;
        };
        if !*connected {
            return Poll::Closed;
        }
        if channel.prefetch != 0 && channel.unacked.len() >= usize::from(channel.prefetch) {
            return Poll::Wait;
        }
        let Some(message) = queues.get_mut(queue).and_then(|q| q.ready.pop_front()) else {
            return Poll::Wait;
        };

        channel.next_tag += 1;
        let delivery_tag = channel.next_tag;
        let delivery = Delivery::new(
            delivery_tag,
            message.redelivered,
            message.body.clone(),
            Box::new(MemoryAcker {
                broker: self.clone(),
                channel_id,
                delivery_tag,
            }),
        );
        channel
            .unacked
            .insert(delivery_tag, (queue.to_string(), message));
        Poll::Deliver(delivery)
    }

    fn settle(&self, channel_id: u64, delivery_tag: u64, requeue: Option<bool>) -> Result<(), QueueError> {
        self.with_open_channel(channel_id, |state| {
            let (queue_name, mut message) = state
                .channels
                .get_mut(&channel_id)
                .and_then(|c| c.unacked.remove(&delivery_tag))
                .ok_or_else(|| QueueError::Broker {
                    source: format!("unknown delivery tag {}", delivery_tag).into(),
                })?;

            match requeue {
                None => {}
                Some(true) => {
                    message.redelivered = true;
                    if let Some(queue) = state.queues.get_mut(&queue_name) {
                        queue.ready.push_front(message);
                    }
                }
                Some(false) => {
                    let exchange = state
                        .queues
                        .get(&queue_name)
                        .map(|q| q.dead_letter_exchange.clone());
                    // Without a declared dead-letter exchange the message is dropped.
                    if let Some(dead_letters) = exchange.and_then(|e| state.exchanges.get_mut(&e)) {
                        dead_letters.push(message.body);
                    }
                }
            }
            Ok(())
        })?;
        self.notify();
        Ok(())
    }
}

#[derive(Debug)]
pub struct MemoryChannel {
    broker: MemoryBroker,
    id: u64,
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn declare_dead_letter_exchange(&self, exchange: &str) -> Result<(), QueueError> {
        self.broker.with_open_channel(self.id, |state| {
            state.exchanges.entry(exchange.to_string()).or_default();
            Ok(())
        })
    }

    async fn declare_queue(
        &self,
        queue: &str,
        dead_letter_exchange: &str,
    ) -> Result<(), QueueError> {
        self.broker.with_open_channel(self.id, |state| {
            match state.queues.get(queue) {
                Some(existing) if existing.dead_letter_exchange != dead_letter_exchange => {
                    Err(QueueError::Broker {
                        source: format!(
                            "inequivalent arg 'x-dead-letter-exchange' for queue '{}': received '{}' but current is '{}'",
                            queue, dead_letter_exchange, existing.dead_letter_exchange
                        )
                        .into(),
                    })
                }
                Some(_) => Ok(()),
                None => {
                    state.queues.insert(
                        queue.to_string(),
                        QueueState {
                            dead_letter_exchange: dead_letter_exchange.to_string(),
                            ready: VecDeque::new(),
                        },
                    );
                    Ok(())
                }
            }
        })
    }

    async fn publish(&self, queue: &str, body: Bytes, persistent: bool) -> Result<(), QueueError> {
        self.broker.with_open_channel(self.id, |state| {
            let target = state
                .queues
                .get_mut(queue)
                .ok_or_else(|| QueueError::UnknownQueue {
                    queue: queue.to_string(),
                })?;
            target.ready.push_back(Message {
                body,
                persistent,
                redelivered: false,
            });
            Ok(())
        })?;
        self.broker.notify();
        Ok(())
    }

    async fn set_prefetch(&self, count: u16) -> Result<(), QueueError> {
        self.broker.with_open_channel(self.id, |state| {
            if let Some(channel) = state.channels.get_mut(&self.id) {
                channel.prefetch = count;
            }
            Ok(())
        })
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, QueueError> {
        self.broker.with_open_channel(self.id, |state| {
            if state.queues.contains_key(queue) {
                Ok(())
            } else {
                Err(QueueError::UnknownQueue {
                    queue: queue.to_string(),
                })
            }
        })?;
        debug!(target: "request_pipeline::queue", queue, consumer_tag, channel = self.id, "Consumer attached");

        let broker = self.broker.clone();
        let changed = broker.shared.changed.subscribe();
        let init = (broker, self.id, queue.to_string(), changed);
        let stream = futures::stream::unfold(init, |(broker, channel_id, queue, mut changed)| async move {
            loop {
                changed.borrow_and_update();
                match broker.poll_delivery(channel_id, &queue) {
                    Poll::Deliver(delivery) => {
                        return Some((Ok(delivery), (broker, channel_id, queue, changed)));
                    }
                    Poll::Closed => return None,
                    Poll::Wait => {
                        if changed.changed().await.is_err() {
                            return None;
                        }
                    }
                }
            }
        });
        Ok(stream.boxed())
    }

    async fn close(&self) -> Result<(), QueueError> {
        {
            let mut state = self.broker.shared.state.lock();
            let BrokerState {
                queues, channels, ..
            } = &mut *state;
            let Some(mut channel) = channels.remove(&self.id) else {
                return Ok(());
            };

            let mut returned: Vec<(u64, (String, Message))> = channel.unacked.drain().collect();
            // Highest tag first so that push_front restores the original order.
            returned.sort_by(|a, b| b.0.cmp(&a.0));
            for (_, (queue, mut message)) in returned {
                message.redelivered = true;
                if let Some(queue) = queues.get_mut(&queue) {
                    queue.ready.push_front(message);
                }
            }
        }
        self.broker.notify();
        Ok(())
    }
}

struct MemoryAcker {
    broker: MemoryBroker,
    channel_id: u64,
    delivery_tag: u64,
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self) -> Result<(), QueueError> {
        self.broker.settle(self.channel_id, self.delivery_tag, None)
    }

    async fn nack(&self, requeue: bool) -> Result<(), QueueError> {
        self.broker
            .settle(self.channel_id, self.delivery_tag, Some(requeue))
    }
}
