//! In-memory AMQP broker for testing.
//!
//! A lightweight broker that:
//! - Implements [`Connector`] so the harness can run without a real broker
//! - Routes through fanout, direct, topic and the default exchange
//! - Records every session call
//! - Fails chosen operations on demand
//!
//! Deleting a missing queue or exchange answers 404 (`NotFound`), as AMQP
//! 0-9-1 specifies. Some brokers treat those deletes as no-ops.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::debug;

use crate::broker::{
    BrokerSession, Connector, DeclareOptions, Delivery, Envelope, ExchangeKind, OutboundMessage,
    Subscription,
};
use crate::error::{BrokerError, BrokerResult, ResourceKind};

/// Target reported in connection errors.
const MEMORY_TARGET: &str = "in-memory broker";

/// Operations recorded in the call log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BrokerOperation {
    Connect,
    DeclareExchange,
    DeclareQueue,
    BindQueue,
    DeleteQueue,
    DeleteExchange,
    Publish,
    Consume,
    Cancel,
    Close,
}

impl fmt::Display for BrokerOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Connect => "connect",
            Self::DeclareExchange => "exchange.declare",
            Self::DeclareQueue => "queue.declare",
            Self::BindQueue => "queue.bind",
            Self::DeleteQueue => "queue.delete",
            Self::DeleteExchange => "exchange.delete",
            Self::Publish => "basic.publish",
            Self::Consume => "basic.consume",
            Self::Cancel => "basic.cancel",
            Self::Close => "connection.close",
        };
        f.write_str(name)
    }
}

/// A recorded broker call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerCall {
    /// Label of the session that made the call.
    pub session: String,
    /// The operation.
    pub operation: BrokerOperation,
    /// Exchange, queue or session name the call targeted.
    pub target: String,
}

#[derive(Debug)]
struct InjectedFailure {
    operation: BrokerOperation,
    target: Option<String>,
}

#[derive(Debug, Clone)]
struct Binding {
    queue: String,
    routing_key: String,
}

#[derive(Debug)]
struct ExchangeEntry {
    kind: ExchangeKind,
    options: DeclareOptions,
    bindings: Vec<Binding>,
}

#[derive(Debug)]
struct ConsumerEntry {
    tag: String,
    session_id: u64,
    tx: mpsc::UnboundedSender<Delivery>,
}

#[derive(Debug)]
struct QueueEntry {
    options: DeclareOptions,
    backlog: VecDeque<Delivery>,
    consumers: Vec<ConsumerEntry>,
    next_consumer: usize,
}

impl QueueEntry {
    fn new(options: DeclareOptions) -> Self {
        Self {
            options,
            backlog: VecDeque::new(),
            consumers: Vec::new(),
            next_consumer: 0,
        }
    }

    /// Hand a delivery to the next live consumer, or keep it in the backlog.
    fn deliver(&mut self, delivery: Delivery) {
        let mut delivery = delivery;
        while !self.consumers.is_empty() {
            let idx = self.next_consumer % self.consumers.len();
            match self.consumers[idx].tx.send(delivery) {
                Ok(()) => {
                    self.next_consumer = idx + 1;
                    return;
                }
                Err(mpsc::error::SendError(returned)) => {
                    // Receiver dropped without cancel.
                    self.consumers.remove(idx);
                    delivery = returned;
                }
            }
        }
        self.backlog.push_back(delivery);
    }
}

struct BrokerState {
    exchanges: DashMap<String, ExchangeEntry>,
    queues: DashMap<String, QueueEntry>,
    sessions: DashMap<u64, Arc<AtomicBool>>,
    call_log: RwLock<Vec<BrokerCall>>,
    failures: Mutex<Vec<InjectedFailure>>,
    reachable: AtomicBool,
    next_session_id: AtomicU64,
    next_delivery_tag: AtomicU64,
    next_consumer_id: AtomicU64,
}

impl BrokerState {
    async fn record(&self, session: &str, operation: BrokerOperation, target: &str) {
        self.call_log.write().await.push(BrokerCall {
            session: session.to_string(),
            operation,
            target: target.to_string(),
        });
    }

    async fn take_failure(&self, operation: BrokerOperation, target: &str) -> BrokerResult<()> {
        let mut failures = self.failures.lock().await;
        let hit = failures.iter().position(|f| {
            f.operation == operation && f.target.as_deref().map_or(true, |t| t == target)
        });
        match hit {
            Some(idx) => {
                failures.remove(idx);
                Err(BrokerError::Injected {
                    operation: operation.to_string(),
                    target: target.to_string(),
                })
            }
            None => Ok(()),
        }
    }

    fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        options: DeclareOptions,
    ) -> BrokerResult<()> {
        if name.is_empty() {
            return Ok(());
        }
        if let Some(existing) = self.exchanges.get(name) {
            if existing.kind != kind || existing.options != options {
                return Err(BrokerError::PreconditionFailed {
                    kind: ResourceKind::Exchange,
                    name: name.to_string(),
                    message: format!(
                        "already declared as {} with {:?}",
                        existing.kind.as_str(),
                        existing.options
                    ),
                });
            }
            return Ok(());
        }
        self.exchanges.insert(
            name.to_string(),
            ExchangeEntry {
                kind,
                options,
                bindings: Vec::new(),
            },
        );
        Ok(())
    }

    fn declare_queue(&self, name: &str, options: DeclareOptions) -> BrokerResult<()> {
        if let Some(existing) = self.queues.get(name) {
            if existing.options != options {
                return Err(BrokerError::PreconditionFailed {
                    kind: ResourceKind::Queue,
                    name: name.to_string(),
                    message: format!("already declared with {:?}", existing.options),
                });
            }
            return Ok(());
        }
        self.queues
            .insert(name.to_string(), QueueEntry::new(options));
        Ok(())
    }

    fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> BrokerResult<()> {
        if !self.queues.contains_key(queue) {
            return Err(not_found(ResourceKind::Queue, queue));
        }
        let mut entry = self
            .exchanges
            .get_mut(exchange)
            .ok_or_else(|| not_found(ResourceKind::Exchange, exchange))?;
        let exists = entry
            .bindings
            .iter()
            .any(|b| b.queue == queue && b.routing_key == routing_key);
        if !exists {
            entry.bindings.push(Binding {
                queue: queue.to_string(),
                routing_key: routing_key.to_string(),
            });
        }
        Ok(())
    }

    fn delete_queue(&self, name: &str) -> BrokerResult<u32> {
        let (_, entry) = self
            .queues
            .remove(name)
            .ok_or_else(|| not_found(ResourceKind::Queue, name))?;
        self.unbind_queue(name);
        // Dropping the senders ends every subscription on the queue.
        Ok(u32::try_from(entry.backlog.len()).unwrap_or(u32::MAX))
    }

    /// Remove every binding to `queue`, then auto-delete exchanges left unbound.
    fn unbind_queue(&self, queue: &str) {
        let mut orphaned = Vec::new();
        for mut exchange in self.exchanges.iter_mut() {
            let before = exchange.bindings.len();
            exchange.bindings.retain(|b| b.queue != queue);
            if exchange.options.auto_delete && before > 0 && exchange.bindings.is_empty() {
                orphaned.push(exchange.key().clone());
            }
        }
        for name in orphaned {
            debug!(exchange = %name, "auto-deleting unbound exchange");
            self.exchanges.remove(&name);
        }
    }

    fn delete_exchange(&self, name: &str) -> BrokerResult<()> {
        self.exchanges
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| not_found(ResourceKind::Exchange, name))
    }

    fn route(&self, exchange: &str, routing_key: &str) -> BrokerResult<Vec<String>> {
        if exchange.is_empty() {
            return Ok(vec![routing_key.to_string()]);
        }
        let entry = self
            .exchanges
            .get(exchange)
            .ok_or_else(|| not_found(ResourceKind::Exchange, exchange))?;
        let mut targets: Vec<String> = entry
            .bindings
            .iter()
            .filter(|b| match entry.kind {
                ExchangeKind::Fanout => true,
                ExchangeKind::Direct => b.routing_key == routing_key,
                ExchangeKind::Topic => topic_matches(&b.routing_key, routing_key),
            })
            .map(|b| b.queue.clone())
            .collect();
        targets.dedup();
        Ok(targets)
    }

    fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &OutboundMessage,
    ) -> BrokerResult<usize> {
        let targets = self.route(exchange, routing_key)?;
        let mut routed = 0;
        for queue in targets {
            // Unroutable messages are dropped, as with mandatory = false.
            if let Some(mut entry) = self.queues.get_mut(&queue) {
                entry.deliver(Delivery {
                    envelope: Envelope {
                        delivery_tag: self.next_delivery_tag.fetch_add(1, Ordering::Relaxed) + 1,
                        redelivered: false,
                        exchange: exchange.to_string(),
                        routing_key: routing_key.to_string(),
                    },
                    properties: message.properties.clone(),
                    payload: message.payload.clone(),
                });
                routed += 1;
            }
        }
        Ok(routed)
    }

    fn add_consumer(
        &self,
        queue: &str,
        session_id: u64,
    ) -> BrokerResult<(String, mpsc::UnboundedReceiver<Delivery>)> {
        let mut entry = self
            .queues
            .get_mut(queue)
            .ok_or_else(|| not_found(ResourceKind::Queue, queue))?;
        let tag = format!(
            "ctag-{session_id}-{}",
            self.next_consumer_id.fetch_add(1, Ordering::Relaxed)
        );
        let (tx, rx) = mpsc::unbounded_channel();
        while let Some(delivery) = entry.backlog.pop_front() {
            // The receiver is alive, so this cannot fail.
            let _ = tx.send(delivery);
        }
        entry.consumers.push(ConsumerEntry {
            tag: tag.clone(),
            session_id,
            tx,
        });
        Ok((tag, rx))
    }

    fn cancel_consumer(
        &self,
        queue: &str,
        tag: &str,
        mut rx: mpsc::UnboundedReceiver<Delivery>,
    ) {
        let auto_delete = match self.queues.get_mut(queue) {
            Some(mut entry) => {
                entry.consumers.retain(|c| c.tag != tag);
                // Unread deliveries go back to the head of the queue.
                let mut unread = Vec::new();
                while let Ok(mut delivery) = rx.try_recv() {
                    delivery.envelope.redelivered = true;
                    unread.push(delivery);
                }
                for delivery in unread.into_iter().rev() {
                    entry.backlog.push_front(delivery);
                }
                entry.options.auto_delete && entry.consumers.is_empty()
            }
            None => false,
        };
        if auto_delete {
            self.auto_delete_queue(queue);
        }
    }

    fn auto_delete_queue(&self, queue: &str) {
        debug!(queue, "auto-deleting queue after last consumer");
        self.queues.remove(queue);
        self.unbind_queue(queue);
    }

    fn drop_session_consumers(&self, session_id: u64) {
        let mut emptied = Vec::new();
        for mut entry in self.queues.iter_mut() {
            let before = entry.consumers.len();
            entry.consumers.retain(|c| c.session_id != session_id);
            if entry.options.auto_delete && before > 0 && entry.consumers.is_empty() {
                emptied.push(entry.key().clone());
            }
        }
        for queue in emptied {
            self.auto_delete_queue(&queue);
        }
    }
}

fn not_found(kind: ResourceKind, name: &str) -> BrokerError {
    BrokerError::NotFound {
        kind,
        name: name.to_string(),
    }
}

/// Match a routing key against a topic binding pattern.
///
/// `*` matches exactly one word, `#` matches zero or more.
fn topic_matches(pattern: &str, key: &str) -> bool {
    fn matches(pattern: &[&str], key: &[&str]) -> bool {
        match pattern.split_first() {
            None => key.is_empty(),
            Some((&"#", rest)) => (0..=key.len()).any(|i| matches(rest, &key[i..])),
            Some((&"*", rest)) => !key.is_empty() && matches(rest, &key[1..]),
            Some((word, rest)) => key.first() == Some(word) && matches(rest, &key[1..]),
        }
    }

    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = key.split('.').collect();
    matches(&pattern, &key)
}

/// In-memory broker for testing.
#[derive(Clone)]
pub struct InMemoryBroker {
    state: Arc<BrokerState>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    /// Create an empty, reachable broker.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(BrokerState {
                exchanges: DashMap::new(),
                queues: DashMap::new(),
                sessions: DashMap::new(),
                call_log: RwLock::new(Vec::new()),
                failures: Mutex::new(Vec::new()),
                reachable: AtomicBool::new(true),
                next_session_id: AtomicU64::new(0),
                next_delivery_tag: AtomicU64::new(0),
                next_consumer_id: AtomicU64::new(0),
            }),
        }
    }

    /// Refuse (`false`) or accept (`true`) new connections.
    pub fn set_reachable(&self, reachable: bool) {
        self.state.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Fail the next matching call. `target` of `None` matches any target.
    pub async fn fail_next(&self, operation: BrokerOperation, target: Option<&str>) {
        self.state.failures.lock().await.push(InjectedFailure {
            operation,
            target: target.map(str::to_string),
        });
    }

    /// Get all recorded calls.
    pub async fn calls(&self) -> Vec<BrokerCall> {
        self.state.call_log.read().await.clone()
    }

    /// Get calls filtered by operation.
    pub async fn calls_for(&self, operation: BrokerOperation) -> Vec<BrokerCall> {
        self.state
            .call_log
            .read()
            .await
            .iter()
            .filter(|c| c.operation == operation)
            .cloned()
            .collect()
    }

    /// Clear the call log.
    pub async fn clear_calls(&self) {
        self.state.call_log.write().await.clear();
    }

    #[must_use]
    pub fn has_exchange(&self, name: &str) -> bool {
        self.state.exchanges.contains_key(name)
    }

    #[must_use]
    pub fn has_queue(&self, name: &str) -> bool {
        self.state.queues.contains_key(name)
    }

    /// Kind and flags of a declared exchange.
    #[must_use]
    pub fn exchange_info(&self, name: &str) -> Option<(ExchangeKind, DeclareOptions)> {
        self.state
            .exchanges
            .get(name)
            .map(|e| (e.kind, e.options))
    }

    /// Flags of a declared queue.
    #[must_use]
    pub fn queue_options(&self, name: &str) -> Option<DeclareOptions> {
        self.state.queues.get(name).map(|q| q.options)
    }

    /// Queues bound to an exchange.
    #[must_use]
    pub fn bound_queues(&self, exchange: &str) -> Vec<String> {
        self.state
            .exchanges
            .get(exchange)
            .map(|e| e.bindings.iter().map(|b| b.queue.clone()).collect())
            .unwrap_or_default()
    }

    /// Messages waiting in a queue with no consumer to take them.
    #[must_use]
    pub fn queue_depth(&self, name: &str) -> Option<usize> {
        self.state.queues.get(name).map(|q| q.backlog.len())
    }

    /// Consumers registered on a queue.
    #[must_use]
    pub fn consumer_count(&self, name: &str) -> Option<usize> {
        self.state.queues.get(name).map(|q| q.consumers.len())
    }

    /// Number of sessions still open.
    #[must_use]
    pub fn open_sessions(&self) -> usize {
        self.state
            .sessions
            .iter()
            .filter(|s| s.value().load(Ordering::SeqCst))
            .count()
    }

    /// Simulate a broker restart.
    ///
    /// Closes every session, drops non-durable exchanges and queues, and
    /// drops transient messages from durable queues.
    pub fn restart(&self) {
        for session in self.state.sessions.iter() {
            session.value().store(false, Ordering::SeqCst);
        }
        self.state.sessions.clear();

        self.state.exchanges.retain(|_, e| e.options.durable);
        self.state.queues.retain(|_, q| q.options.durable);
        for mut queue in self.state.queues.iter_mut() {
            queue.consumers.clear();
            queue.backlog.retain(|d| d.properties.is_persistent());
        }
        let queues = &self.state.queues;
        for mut exchange in self.state.exchanges.iter_mut() {
            exchange.bindings.retain(|b| queues.contains_key(&b.queue));
        }
    }
}

#[async_trait]
impl Connector for InMemoryBroker {
    async fn connect(&self, label: &str) -> BrokerResult<Box<dyn BrokerSession>> {
        self.state
            .record(label, BrokerOperation::Connect, label)
            .await;
        if !self.state.reachable.load(Ordering::SeqCst) {
            return Err(BrokerError::Connection {
                target: MEMORY_TARGET.to_string(),
                message: "connection refused".to_string(),
            });
        }
        self.state
            .take_failure(BrokerOperation::Connect, label)
            .await?;

        let id = self.state.next_session_id.fetch_add(1, Ordering::Relaxed) + 1;
        let open = Arc::new(AtomicBool::new(true));
        self.state.sessions.insert(id, Arc::clone(&open));
        debug!(session = label, id, "in-memory session opened");

        Ok(Box::new(MemorySession {
            id,
            label: label.to_string(),
            open,
            state: Arc::clone(&self.state),
        }))
    }
}

/// A session on an [`InMemoryBroker`].
pub struct MemorySession {
    id: u64,
    label: String,
    open: Arc<AtomicBool>,
    state: Arc<BrokerState>,
}

impl MemorySession {
    fn ensure_open(&self) -> BrokerResult<()> {
        if self.open.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BrokerError::SessionClosed {
                label: self.label.clone(),
            })
        }
    }

    /// Record the call, then apply the open check and any injected failure.
    async fn begin(&self, operation: BrokerOperation, target: &str) -> BrokerResult<()> {
        self.state.record(&self.label, operation, target).await;
        self.ensure_open()?;
        self.state.take_failure(operation, target).await
    }
}

#[async_trait]
impl BrokerSession for MemorySession {
    fn label(&self) -> &str {
        &self.label
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        options: DeclareOptions,
    ) -> BrokerResult<()> {
        self.begin(BrokerOperation::DeclareExchange, name).await?;
        self.state.declare_exchange(name, kind, options)
    }

    async fn declare_queue(&self, name: &str, options: DeclareOptions) -> BrokerResult<()> {
        self.begin(BrokerOperation::DeclareQueue, name).await?;
        self.state.declare_queue(name, options)
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> BrokerResult<()> {
        self.begin(BrokerOperation::BindQueue, queue).await?;
        self.state.bind_queue(queue, exchange, routing_key)
    }

    async fn delete_queue(&self, name: &str) -> BrokerResult<u32> {
        self.begin(BrokerOperation::DeleteQueue, name).await?;
        self.state.delete_queue(name)
    }

    async fn delete_exchange(&self, name: &str) -> BrokerResult<()> {
        self.begin(BrokerOperation::DeleteExchange, name).await?;
        self.state.delete_exchange(name)
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &OutboundMessage,
    ) -> BrokerResult<()> {
        self.begin(BrokerOperation::Publish, exchange).await?;
        let routed = self.state.publish(exchange, routing_key, message)?;
        debug!(session = %self.label, exchange, routing_key, routed, "published");
        Ok(())
    }

    async fn subscribe(&self, queue: &str) -> BrokerResult<Box<dyn Subscription>> {
        self.begin(BrokerOperation::Consume, queue).await?;
        let (consumer_tag, rx) = self.state.add_consumer(queue, self.id)?;
        Ok(Box::new(MemorySubscription {
            session_label: self.label.clone(),
            open: Arc::clone(&self.open),
            state: Arc::clone(&self.state),
            consumer_tag,
            queue: queue.to_string(),
            rx,
        }))
    }

    async fn close(&self) -> BrokerResult<()> {
        self.begin(BrokerOperation::Close, &self.label).await?;
        self.open.store(false, Ordering::SeqCst);
        self.state.sessions.remove(&self.id);
        self.state.drop_session_consumers(self.id);
        Ok(())
    }
}

struct MemorySubscription {
    session_label: String,
    open: Arc<AtomicBool>,
    state: Arc<BrokerState>,
    consumer_tag: String,
    queue: String,
    rx: mpsc::UnboundedReceiver<Delivery>,
}

#[async_trait]
impl Subscription for MemorySubscription {
    fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }

    fn queue(&self) -> &str {
        &self.queue
    }

    async fn next_delivery(&mut self) -> Option<BrokerResult<Delivery>> {
        self.rx.recv().await.map(Ok)
    }

    async fn cancel(self: Box<Self>) -> BrokerResult<()> {
        let this = *self;
        this.state
            .record(&this.session_label, BrokerOperation::Cancel, &this.queue)
            .await;
        if !this.open.load(Ordering::SeqCst) {
            return Err(BrokerError::SessionClosed {
                label: this.session_label,
            });
        }
        this.state
            .take_failure(BrokerOperation::Cancel, &this.queue)
            .await?;
        this.state
            .cancel_consumer(&this.queue, &this.consumer_tag, this.rx);
        Ok(())
    }
}
