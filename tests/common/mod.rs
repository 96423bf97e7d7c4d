// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! In-memory broker implementing the transport traits.
//!
//! Supports what the reliability layer relies on: durable declarations with
//! argument checks, default/direct/fanout routing, per channel prefetch,
//! ack/nack with requeue, message TTL with dead-lettering, and connection loss
//! that requeues every unacked delivery.

#![allow(dead_code)]

use amqp_reliability::{
    envelope::Envelope,
    errors::AmqpError,
    queue::{AMQP_HEADERS_DEAD_LETTER_EXCHANGE, AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY, AMQP_HEADERS_MESSAGE_TTL},
    transport::{
        BrokerChannel, BrokerConnection, Connector, DeliveryStream, ExchangeKind, InboundDelivery,
        LossCallback,
    },
    BrokerConfig,
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    types::{AMQPValue, FieldTable},
    BasicProperties,
};
use std::{
    collections::{BTreeMap, HashMap, HashSet, VecDeque},
    future::Future,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use tokio::sync::mpsc;

pub fn config() -> BrokerConfig {
    BrokerConfig::default()
        .with_connection_name("test")
        .with_retry_delay(Duration::from_secs(1))
        .with_reconnect_interval(Duration::from_secs(2))
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Polls `condition` until it holds; with a paused clock the sleeps are free.
pub async fn eventually(condition: impl Fn() -> bool) {
    for _ in 0..5_000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met in time");
}

/// Like [`eventually`], for conditions that need to await.
pub async fn eventually_async<F, Fut>(condition: F)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..5_000 {
        if condition().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met in time");
}

#[derive(Clone)]
struct FakeMessage {
    seq: u64,
    data: Vec<u8>,
    properties: BasicProperties,
    redelivered: bool,
}

struct FakeConsumer {
    tag: String,
    channel: u64,
    sender: mpsc::UnboundedSender<Result<InboundDelivery, AmqpError>>,
}

struct FakeQueue {
    durable: bool,
    args: FieldTable,
    messages: VecDeque<FakeMessage>,
    consumers: Vec<FakeConsumer>,
}

struct FakeExchange {
    kind: ExchangeKind,
    durable: bool,
    args: FieldTable,
    bindings: Vec<(String, String)>,
}

#[derive(Default)]
struct FakeChannelState {
    connection: u64,
    open: bool,
    prefetch: u16,
    unacked: BTreeMap<u64, (String, FakeMessage)>,
}

#[derive(Default)]
struct FakeConnectionState {
    open: bool,
    callback: Option<Arc<LossCallback>>,
}

#[derive(Default)]
struct State {
    exchanges: HashMap<String, FakeExchange>,
    queues: HashMap<String, FakeQueue>,
    channels: HashMap<u64, FakeChannelState>,
    connections: HashMap<u64, FakeConnectionState>,
    next_id: u64,
    next_seq: u64,
    next_delivery_tag: u64,
    queue_declarations: HashMap<String, usize>,
    consumer_tags_seen: Vec<String>,
    duplicate_consumer_tags: usize,
    published: usize,
}

#[derive(Default)]
struct Inner {
    state: Mutex<State>,
    connects: AtomicUsize,
    unreachable: AtomicBool,
}

#[derive(Clone, Default)]
pub struct FakeBroker {
    inner: Arc<Inner>,
}

impl FakeBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(FakeConnector {
            inner: self.inner.clone(),
        })
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.inner.unreachable.store(!reachable, Ordering::SeqCst);
    }

    pub fn connect_count(&self) -> usize {
        self.inner.connects.load(Ordering::SeqCst)
    }

    /// Kills every open connection as a network failure would.
    pub fn drop_connections(&self) {
        let callbacks: Vec<Arc<LossCallback>> = {
            let mut state = self.inner.state.lock().unwrap();
            let ids: Vec<u64> = state
                .connections
                .iter()
                .filter(|(_, conn)| conn.open)
                .map(|(id, _)| *id)
                .collect();

            let mut callbacks = vec![];
            for id in ids {
                if let Some(callback) = close_connection(&mut state, id) {
                    callbacks.push(callback);
                }
            }
            callbacks
        };

        for callback in callbacks {
            (callback.as_ref())("connection reset by peer".to_owned());
        }
    }

    /// Declares a queue behind the client's back.
    pub fn declare_queue(&self, name: &str, args: FieldTable) {
        let mut state = self.inner.state.lock().unwrap();
        state.queues.insert(
            name.to_owned(),
            FakeQueue {
                durable: true,
                args,
                messages: VecDeque::new(),
                consumers: vec![],
            },
        );
    }

    /// Publishes raw bytes straight into `queue`.
    pub fn publish_raw(&self, queue: &str, data: &[u8]) {
        let mut state = self.inner.state.lock().unwrap();
        enqueue(&self.inner, &mut state, queue, data.to_vec(), BasicProperties::default());
    }

    pub fn queue_exists(&self, name: &str) -> bool {
        self.inner.state.lock().unwrap().queues.contains_key(name)
    }

    pub fn queue_len(&self, name: &str) -> usize {
        self.inner
            .state
            .lock()
            .unwrap()
            .queues
            .get(name)
            .map(|q| q.messages.len())
            .unwrap_or_default()
    }

    pub fn queue_arguments(&self, name: &str) -> Option<FieldTable> {
        self.inner
            .state
            .lock()
            .unwrap()
            .queues
            .get(name)
            .map(|q| q.args.clone())
    }

    /// Ready messages of `queue`, decoded as envelopes.
    pub fn messages(&self, name: &str) -> Vec<Envelope> {
        self.inner
            .state
            .lock()
            .unwrap()
            .queues
            .get(name)
            .map(|q| {
                q.messages
                    .iter()
                    .map(|m| Envelope::from_delivery(m.data.clone(), &m.properties, name))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn bindings(&self, exchange: &str) -> Vec<(String, String)> {
        self.inner
            .state
            .lock()
            .unwrap()
            .exchanges
            .get(exchange)
            .map(|ex| ex.bindings.clone())
            .unwrap_or_default()
    }

    pub fn queue_declarations(&self, name: &str) -> usize {
        self.inner
            .state
            .lock()
            .unwrap()
            .queue_declarations
            .get(name)
            .copied()
            .unwrap_or_default()
    }

    /// Tags of the consumers currently attached to `queue`.
    pub fn consumer_tags(&self, queue: &str) -> Vec<String> {
        self.inner
            .state
            .lock()
            .unwrap()
            .queues
            .get(queue)
            .map(|q| q.consumers.iter().map(|c| c.tag.clone()).collect())
            .unwrap_or_default()
    }

    pub fn duplicate_consumer_tags(&self) -> usize {
        self.inner.state.lock().unwrap().duplicate_consumer_tags
    }

    pub fn unacked(&self) -> usize {
        self.inner
            .state
            .lock()
            .unwrap()
            .channels
            .values()
            .map(|ch| ch.unacked.len())
            .sum()
    }

    pub fn published(&self) -> usize {
        self.inner.state.lock().unwrap().published
    }
}

struct FakeConnector {
    inner: Arc<Inner>,
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>, AmqpError> {
        self.inner.connects.fetch_add(1, Ordering::SeqCst);
        if self.inner.unreachable.load(Ordering::SeqCst) {
            return Err(AmqpError::ConnectionError("connection refused".to_owned()));
        }

        let mut state = self.inner.state.lock().unwrap();
        state.next_id += 1;
        let id = state.next_id;
        state.connections.insert(
            id,
            FakeConnectionState {
                open: true,
                callback: None,
            },
        );

        Ok(Arc::new(FakeConnection {
            inner: self.inner.clone(),
            id,
        }))
    }
}

struct FakeConnection {
    inner: Arc<Inner>,
    id: u64,
}

#[async_trait]
impl BrokerConnection for FakeConnection {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        let mut state = self.inner.state.lock().unwrap();
        if !state.connections.get(&self.id).is_some_and(|c| c.open) {
            return Err(AmqpError::Transport("connection is closed".to_owned()));
        }

        state.next_id += 1;
        let id = state.next_id;
        state.channels.insert(
            id,
            FakeChannelState {
                connection: self.id,
                open: true,
                ..Default::default()
            },
        );

        Ok(Arc::new(FakeChannel {
            inner: self.inner.clone(),
            id,
        }))
    }

    fn is_connected(&self) -> bool {
        self.inner
            .state
            .lock()
            .unwrap()
            .connections
            .get(&self.id)
            .is_some_and(|c| c.open)
    }

    fn on_lost(&self, callback: LossCallback) {
        if let Some(conn) = self.inner.state.lock().unwrap().connections.get_mut(&self.id) {
            conn.callback = Some(Arc::new(callback));
        }
    }

    async fn close(&self) -> Result<(), AmqpError> {
        let mut state = self.inner.state.lock().unwrap();
        close_connection(&mut state, self.id);
        Ok(())
    }
}

struct FakeChannel {
    inner: Arc<Inner>,
    id: u64,
}

impl FakeChannel {
    fn with_open<R>(
        &self,
        f: impl FnOnce(&Arc<Inner>, &mut State) -> Result<R, AmqpError>,
    ) -> Result<R, AmqpError> {
        let mut state = self.inner.state.lock().unwrap();
        if !state.channels.get(&self.id).is_some_and(|ch| ch.open) {
            return Err(AmqpError::ChannelError("channel is closed".to_owned()));
        }

        let result = f(&self.inner, &mut state);
        // the broker closes a channel on any channel level error
        if result.is_err() {
            close_channel(&mut state, self.id);
        }
        result
    }
}

#[async_trait]
impl BrokerChannel for FakeChannel {
    fn is_open(&self) -> bool {
        self.inner
            .state
            .lock()
            .unwrap()
            .channels
            .get(&self.id)
            .is_some_and(|ch| ch.open)
    }

    async fn exchange_declare(
        &self,
        name: &str,
        kind: ExchangeKind,
        durable: bool,
        args: FieldTable,
    ) -> Result<(), AmqpError> {
        self.with_open(|_, state| match state.exchanges.get(name) {
            Some(existing) if existing.kind != kind || existing.durable != durable || existing.args != args => {
                Err(AmqpError::TopologyMismatch(name.to_owned()))
            }
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(
                    name.to_owned(),
                    FakeExchange {
                        kind,
                        durable,
                        args,
                        bindings: vec![],
                    },
                );
                Ok(())
            }
        })
    }

    async fn queue_declare(&self, name: &str, durable: bool, args: FieldTable) -> Result<(), AmqpError> {
        self.with_open(|_, state| {
            *state.queue_declarations.entry(name.to_owned()).or_default() += 1;
            match state.queues.get(name) {
                Some(existing) if existing.durable != durable || existing.args != args => {
                    Err(AmqpError::TopologyMismatch(name.to_owned()))
                }
                Some(_) => Ok(()),
                None => {
                    state.queues.insert(
                        name.to_owned(),
                        FakeQueue {
                            durable,
                            args,
                            messages: VecDeque::new(),
                            consumers: vec![],
                        },
                    );
                    Ok(())
                }
            }
        })
    }

    async fn queue_bind(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<(), AmqpError> {
        self.with_open(|_, state| {
            if !state.queues.contains_key(queue) {
                return Err(AmqpError::BindingExchangeToQueueError(exchange.to_owned(), queue.to_owned()));
            }
            let Some(ex) = state.exchanges.get_mut(exchange) else {
                return Err(AmqpError::BindingExchangeToQueueError(exchange.to_owned(), queue.to_owned()));
            };
            let binding = (queue.to_owned(), routing_key.to_owned());
            if !ex.bindings.contains(&binding) {
                ex.bindings.push(binding);
            }
            Ok(())
        })
    }

    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), AmqpError> {
        self.with_open(|_, state| {
            if let Some(ch) = state.channels.get_mut(&self.id) {
                ch.prefetch = prefetch_count;
            }
            Ok(())
        })
    }

    async fn confirm_select(&self) -> Result<(), AmqpError> {
        self.with_open(|_, _| Ok(()))
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
        _await_confirm: bool,
    ) -> Result<(), AmqpError> {
        self.with_open(|inner, state| {
            state.published += 1;
            route(inner, state, exchange, routing_key, payload.to_vec(), properties)
        })
    }

    async fn basic_consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, AmqpError> {
        let receiver = self.with_open(|_, state| {
            let duplicate = state
                .queues
                .values()
                .flat_map(|q| q.consumers.iter())
                .any(|c| c.tag == consumer_tag);
            if duplicate {
                state.duplicate_consumer_tags += 1;
                return Err(AmqpError::ConsumerDeclarationError(consumer_tag.to_owned()));
            }

            let (sender, receiver) = mpsc::unbounded_channel();
            let Some(q) = state.queues.get_mut(queue) else {
                return Err(AmqpError::ConsumerDeclarationError(format!("NOT_FOUND - no queue '{queue}'")));
            };
            q.consumers.push(FakeConsumer {
                tag: consumer_tag.to_owned(),
                channel: self.id,
                sender,
            });
            state.consumer_tags_seen.push(consumer_tag.to_owned());
            dispatch(state, queue);
            Ok(receiver)
        })?;

        Ok(futures_util::stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.map(|delivery| (delivery, receiver))
        })
        .boxed())
    }

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        self.with_open(|_, state| {
            for q in state.queues.values_mut() {
                q.consumers
                    .retain(|c| !(c.tag == consumer_tag && c.channel == self.id));
            }
            Ok(())
        })
    }

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        self.with_open(|_, state| {
            let entry = state
                .channels
                .get_mut(&self.id)
                .and_then(|ch| ch.unacked.remove(&delivery_tag));
            let Some((queue, _)) = entry else {
                return Err(AmqpError::AckMessageError);
            };
            dispatch(state, &queue);
            Ok(())
        })
    }

    async fn basic_nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        self.with_open(|inner, state| {
            let entry = state
                .channels
                .get_mut(&self.id)
                .and_then(|ch| ch.unacked.remove(&delivery_tag));
            let Some((queue, mut message)) = entry else {
                return Err(AmqpError::NackMessageError);
            };

            if requeue {
                message.redelivered = true;
                if let Some(q) = state.queues.get_mut(&queue) {
                    q.messages.push_front(message);
                }
            } else {
                dead_letter(inner, state, &queue, message);
            }
            dispatch(state, &queue);
            Ok(())
        })
    }

    async fn close(&self) -> Result<(), AmqpError> {
        let mut state = self.inner.state.lock().unwrap();
        close_channel(&mut state, self.id);
        Ok(())
    }
}

fn close_connection(state: &mut State, id: u64) -> Option<Arc<LossCallback>> {
    let conn = state.connections.get_mut(&id)?;
    if !conn.open {
        return None;
    }
    conn.open = false;
    let callback = conn.callback.take();

    let channels: Vec<u64> = state
        .channels
        .iter()
        .filter(|(_, ch)| ch.connection == id)
        .map(|(id, _)| *id)
        .collect();
    for channel in channels {
        close_channel(state, channel);
    }

    callback
}

/// Closes a channel: its consumers go away and unacked deliveries return to
/// the head of their queues.
fn close_channel(state: &mut State, id: u64) {
    let Some(ch) = state.channels.get_mut(&id) else {
        return;
    };
    if !ch.open {
        return;
    }
    ch.open = false;
    let unacked = std::mem::take(&mut ch.unacked);

    for q in state.queues.values_mut() {
        q.consumers.retain(|c| c.channel != id);
    }

    let mut touched = HashSet::new();
    for (_, (queue, mut message)) in unacked.into_iter().rev() {
        message.redelivered = true;
        if let Some(q) = state.queues.get_mut(&queue) {
            q.messages.push_front(message);
        }
        touched.insert(queue);
    }
    for queue in touched {
        dispatch(state, &queue);
    }
}

fn route(
    inner: &Arc<Inner>,
    state: &mut State,
    exchange: &str,
    routing_key: &str,
    data: Vec<u8>,
    properties: BasicProperties,
) -> Result<(), AmqpError> {
    if exchange.is_empty() {
        enqueue(inner, state, routing_key, data, properties);
        return Ok(());
    }

    let Some(ex) = state.exchanges.get(exchange) else {
        return Err(AmqpError::ChannelError(format!("NOT_FOUND - no exchange '{exchange}'")));
    };
    let targets: Vec<String> = ex
        .bindings
        .iter()
        .filter(|(_, key)| ex.kind == ExchangeKind::Fanout || key == routing_key)
        .map(|(queue, _)| queue.clone())
        .collect();

    for queue in targets {
        enqueue(inner, state, &queue, data.clone(), properties.clone());
    }
    Ok(())
}

fn enqueue(inner: &Arc<Inner>, state: &mut State, queue: &str, data: Vec<u8>, properties: BasicProperties) {
    state.next_seq += 1;
    let seq = state.next_seq;

    let Some(q) = state.queues.get_mut(queue) else {
        return;
    };
    q.messages.push_back(FakeMessage {
        seq,
        data,
        properties,
        redelivered: false,
    });

    if let Some(ttl) = q.args.inner().get(AMQP_HEADERS_MESSAGE_TTL).and_then(as_u64) {
        let inner = inner.clone();
        let queue = queue.to_owned();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(ttl)).await;
            let mut state = inner.state.lock().unwrap();
            expire(&inner, &mut state, &queue, seq);
        });
    }

    dispatch(state, queue);
}

fn expire(inner: &Arc<Inner>, state: &mut State, queue: &str, seq: u64) {
    let Some(q) = state.queues.get_mut(queue) else {
        return;
    };
    let Some(position) = q.messages.iter().position(|m| m.seq == seq) else {
        return;
    };
    if let Some(message) = q.messages.remove(position) {
        dead_letter(inner, state, queue, message);
    }
}

fn dead_letter(inner: &Arc<Inner>, state: &mut State, queue: &str, message: FakeMessage) {
    let Some(q) = state.queues.get(queue) else {
        return;
    };
    let args = q.args.inner();
    let Some(exchange) = args.get(AMQP_HEADERS_DEAD_LETTER_EXCHANGE).and_then(as_text) else {
        return;
    };
    let routing_key = args
        .get(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY)
        .and_then(as_text)
        .unwrap_or_else(|| queue.to_owned());

    let _ = route(inner, state, &exchange, &routing_key, message.data, message.properties);
}

/// Hands ready messages to consumers whose channel is below its prefetch limit.
fn dispatch(state: &mut State, queue: &str) {
    loop {
        let Some(q) = state.queues.get_mut(queue) else {
            return;
        };
        if q.messages.is_empty() {
            return;
        }

        let target = q.consumers.iter().position(|c| {
            state.channels.get(&c.channel).is_some_and(|ch| {
                ch.open && (ch.prefetch == 0 || ch.unacked.len() < usize::from(ch.prefetch))
            })
        });
        let Some(index) = target else {
            return;
        };
        let Some(message) = q.messages.pop_front() else {
            return;
        };

        let consumer = q.consumers.remove(index);
        state.next_delivery_tag += 1;
        let delivery_tag = state.next_delivery_tag;
        let delivery = InboundDelivery {
            delivery_tag,
            redelivered: message.redelivered,
            data: message.data.clone(),
            properties: message.properties.clone(),
        };

        if consumer.sender.send(Ok(delivery)).is_err() {
            q.messages.push_front(message);
            continue;
        }

        if let Some(ch) = state.channels.get_mut(&consumer.channel) {
            ch.unacked.insert(delivery_tag, (queue.to_owned(), message));
        }
        q.consumers.push(consumer);
    }
}

fn as_u64(value: &AMQPValue) -> Option<u64> {
    match value {
        AMQPValue::LongLongInt(v) => u64::try_from(*v).ok(),
        AMQPValue::LongInt(v) => u64::try_from(*v).ok(),
        AMQPValue::LongUInt(v) => Some(u64::from(*v)),
        _ => None,
    }
}

fn as_text(value: &AMQPValue) -> Option<String> {
    match value {
        AMQPValue::LongString(v) => Some(String::from_utf8_lossy(v.as_bytes()).into_owned()),
        AMQPValue::ShortString(v) => Some(v.to_string()),
        _ => None,
    }
}
