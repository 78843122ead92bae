use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use clawlite_config::ChannelConfig;
use clawlite_core::{
    ClawLiteError, Event, EventBus, InboundMessage, MessageBus, OutboundMessage, OutboundReceiver,
    ReplyHandle, Result, SessionId,
};

use crate::adapter::{ChannelConnector, ChannelEvent};
use crate::health::{evaluate_outbound_health, OutboundHealth};
use crate::outbound::{backoff_duration, OutboundDispatcher, OutboundMetrics};

/// Status snapshot of one channel instance, for the gateway dashboard.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerStatus {
    pub channel: String,
    pub account: String,
    pub connected: bool,
    pub last_connected_at: Option<DateTime<Utc>>,
    pub reconnects: u32,
    pub outbound: OutboundMetrics,
    pub outbound_health: OutboundHealth,
}

struct Instance {
    connector: Arc<dyn ChannelConnector>,
    dispatcher: Arc<OutboundDispatcher>,
    shutdown: watch::Sender<bool>,
    /// Queue feeding this instance's delivery worker. Dropping the
    /// instance closes the queue and ends the worker.
    outbound_tx: mpsc::UnboundedSender<OutboundMessage>,
    last_connected_at: parking_lot::Mutex<Option<DateTime<Utc>>>,
    reconnects: AtomicU32,
}

/// Owns the lifecycle of per-(channel, account) instances: inbound pumps
/// with allowlist enforcement and session binding, reconnect supervision,
/// and the outbound pump with per-instance resilience. Clones share the
/// instance table.
#[derive(Clone)]
pub struct ChannelManager {
    bus: MessageBus,
    events: EventBus,
    instances: Arc<RwLock<HashMap<(String, String), Arc<Instance>>>>,
}

fn sender_allowed(allow_from: &[String], sender_id: &str) -> bool {
    allow_from.iter().any(|a| a == "*" || a == sender_id)
}

impl ChannelManager {
    pub fn new(bus: MessageBus, events: EventBus) -> Self {
        Self {
            bus,
            events,
            instances: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Start one channel instance. Per (channel, account) only one worker
    /// may be alive; a second start for the same pair is rejected.
    pub async fn start_instance(
        &self,
        connector: Arc<dyn ChannelConnector>,
        config: &ChannelConfig,
        dedupe_window: Duration,
    ) -> Result<()> {
        let key = (
            connector.channel_type().to_string(),
            connector.account().to_string(),
        );
        if self.instances.read().contains_key(&key) {
            return Err(ClawLiteError::ChannelUnavailable {
                channel: key.0,
                reason: format!("worker for account '{}' already running", key.1),
            });
        }

        let dispatcher = Arc::new(OutboundDispatcher::new(
            key.0.clone(),
            key.1.clone(),
            Duration::from_secs(config.send_timeout_secs.max(1)),
            config.max_send_attempts,
            dedupe_window,
            config.fallback_channel.clone(),
            self.events.clone(),
        ));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let instance = Arc::new(Instance {
            connector: Arc::clone(&connector),
            dispatcher: Arc::clone(&dispatcher),
            shutdown: shutdown_tx,
            outbound_tx,
            last_connected_at: parking_lot::Mutex::new(None),
            reconnects: AtomicU32::new(0),
        });
        self.instances.write().insert(key.clone(), Arc::clone(&instance));

        self.spawn_outbound_worker(connector, dispatcher, outbound_rx);
        self.spawn_supervisor(key, instance, config.allow_from.clone(), shutdown_rx);
        Ok(())
    }

    /// Supervision loop: (re)start the connector's event stream and pump
    /// it. A dead stream is reconnected with backoff; the instance only
    /// exits when explicitly disabled.
    fn spawn_supervisor(
        &self,
        key: (String, String),
        instance: Arc<Instance>,
        allow_from: Vec<String>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        let bus = self.bus.clone();
        let events = self.events.clone();

        tokio::spawn(async move {
            let (channel, account) = key;
            let mut attempt: u32 = 0;

            loop {
                if *shutdown_rx.borrow() {
                    break;
                }

                let mut rx = match instance.connector.start().await {
                    Ok(rx) => {
                        attempt = 0;
                        *instance.last_connected_at.lock() = Some(Utc::now());
                        events.publish(Event::ChannelConnected {
                            channel: channel.clone(),
                            account: account.clone(),
                        });
                        rx
                    }
                    Err(e) => {
                        attempt += 1;
                        warn!(
                            channel = %channel,
                            account = %account,
                            attempt,
                            error = %e,
                            "channel start failed, backing off"
                        );
                        tokio::select! {
                            _ = tokio::time::sleep(backoff_duration(attempt, 60)) => continue,
                            _ = shutdown_rx.changed() => break,
                        }
                    }
                };

                // Pump the event stream until it dies or we shut down
                loop {
                    tokio::select! {
                        _ = shutdown_rx.changed() => {
                            instance.connector.stop().await;
                            return;
                        }
                        event = rx.recv() => match event {
                            Some(ChannelEvent::Message(incoming)) => {
                                if !sender_allowed(&allow_from, &incoming.sender_id) {
                                    warn!(
                                        channel = %channel,
                                        sender = %incoming.sender_id,
                                        reason = "not_in_allowlist",
                                        "channels.inbound.rejected"
                                    );
                                    events.publish(Event::InboundRejected {
                                        channel: channel.clone(),
                                        sender_id: incoming.sender_id.clone(),
                                        reason: "not_in_allowlist".into(),
                                    });
                                    continue;
                                }
                                let Some(text) = incoming.text else { continue };
                                let session_id = SessionId::for_channel(
                                    &channel,
                                    &incoming.chat_id,
                                    incoming.thread_id.as_deref(),
                                );
                                events.publish(Event::InboundReceived {
                                    session_id: session_id.to_string(),
                                    channel: channel.clone(),
                                });
                                let msg = InboundMessage::new(
                                    session_id,
                                    incoming.sender_id,
                                    text,
                                )
                                .with_reply_handle(ReplyHandle {
                                    channel: channel.clone(),
                                    account: account.clone(),
                                    chat_id: incoming.chat_id,
                                    thread_id: incoming.thread_id,
                                });
                                if let Err(e) = bus.publish_inbound(msg).await {
                                    warn!(error = %e, "failed to publish inbound message");
                                }
                            }
                            Some(ChannelEvent::Connected) => {
                                *instance.last_connected_at.lock() = Some(Utc::now());
                            }
                            Some(ChannelEvent::Disconnected(reason)) => {
                                events.publish(Event::ChannelDisconnected {
                                    channel: channel.clone(),
                                    account: account.clone(),
                                    reason,
                                });
                            }
                            None => break, // stream died — reconnect
                        }
                    }
                }

                if *shutdown_rx.borrow() {
                    break;
                }
                attempt += 1;
                instance.reconnects.fetch_add(1, Ordering::Relaxed);
                warn!(
                    channel = %channel,
                    account = %account,
                    attempt,
                    "channel event stream ended, scheduling reconnect"
                );
                tokio::select! {
                    _ = tokio::time::sleep(backoff_duration(attempt, 60)) => {}
                    _ = shutdown_rx.changed() => break,
                }
            }

            instance.connector.stop().await;
            info!(channel = %channel, account = %account, "channel instance stopped");
        });
    }

    /// Stop and remove one instance (channel disable).
    pub async fn stop_instance(&self, channel: &str, account: &str) -> bool {
        let key = (channel.to_string(), account.to_string());
        if let Some(instance) = self.instances.write().remove(&key) {
            let _ = instance.shutdown.send(true);
            true
        } else {
            false
        }
    }

    pub async fn stop_all(&self) {
        let keys: Vec<_> = self.instances.read().keys().cloned().collect();
        for (channel, account) in keys {
            self.stop_instance(&channel, &account).await;
        }
    }

    fn find_instance(&self, channel: &str, account: Option<&str>) -> Option<Arc<Instance>> {
        let instances = self.instances.read();
        if let Some(account) = account {
            if let Some(i) = instances.get(&(channel.to_string(), account.to_string())) {
                return Some(Arc::clone(i));
            }
        }
        instances
            .iter()
            .find(|((ch, _), _)| ch == channel)
            .map(|(_, i)| Arc::clone(i))
    }

    /// Route a single outbound message onto the owning instance's queue.
    /// Returns as soon as the message is enqueued; the instance's own
    /// worker performs the (possibly slow) delivery.
    pub async fn deliver(&self, msg: OutboundMessage) -> Result<()> {
        let channel = msg
            .reply_handle
            .as_ref()
            .map(|h| h.channel.clone())
            .unwrap_or_else(|| msg.session_id.channel().to_string());
        let account = msg.reply_handle.as_ref().map(|h| h.account.clone());

        let Some(instance) = self.find_instance(&channel, account.as_deref()) else {
            self.events.publish(Event::OutboundFailed {
                channel: channel.clone(),
                code: "channel_unavailable".into(),
                fallback: "none".into(),
            });
            return Err(ClawLiteError::ChannelUnavailable {
                channel,
                reason: "no instance running".into(),
            });
        };

        instance.outbound_tx.send(msg).map_err(|_| {
            ClawLiteError::ChannelUnavailable {
                channel,
                reason: "outbound worker stopped".into(),
            }
        })
    }

    /// Execute one delivery through an instance's dispatcher, with the
    /// circuit-open fallback republish.
    async fn dispatch_to(
        &self,
        connector: &dyn ChannelConnector,
        dispatcher: &OutboundDispatcher,
        msg: OutboundMessage,
    ) -> Result<()> {
        let chat_id = msg
            .reply_handle
            .as_ref()
            .map(|h| h.chat_id.clone())
            .or_else(|| msg.session_id.chat().map(str::to_string))
            .unwrap_or_default();
        let thread_id = msg
            .reply_handle
            .as_ref()
            .and_then(|h| h.thread_id.clone())
            .or_else(|| msg.session_id.thread().map(str::to_string));

        let result = dispatcher
            .dispatch(
                connector,
                &msg.idempotency_key,
                &chat_id,
                thread_id.as_deref(),
                &msg.text,
            )
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) => {
                // Circuit open with a configured fallback: republish to the
                // fallback destination; the rejected destination stays in
                // the failure log above.
                if let Some(fallback) = dispatcher.fallback_channel() {
                    if self.find_instance(fallback, None).is_some() {
                        warn!(
                            channel = %connector.channel_type(),
                            fallback = %fallback,
                            rejected_chat = %chat_id,
                            "republishing outbound to fallback channel"
                        );
                        let mut fallback_msg = msg.clone();
                        fallback_msg.reply_handle = Some(ReplyHandle {
                            channel: fallback.to_string(),
                            account: String::new(),
                            chat_id,
                            thread_id,
                        });
                        fallback_msg.idempotency_key =
                            format!("{}:fallback", msg.idempotency_key);
                        let _ = self.bus.publish_outbound(fallback_msg).await;
                    }
                }
                Err(e)
            }
        }
    }

    /// One delivery worker per instance: drains that instance's queue
    /// sequentially (FIFO per destination) while staying independent of
    /// every other instance — a slow or retrying backend never delays
    /// deliveries elsewhere. The worker ends when the instance is removed
    /// and its queue sender drops.
    fn spawn_outbound_worker(
        &self,
        connector: Arc<dyn ChannelConnector>,
        dispatcher: Arc<OutboundDispatcher>,
        mut rx: mpsc::UnboundedReceiver<OutboundMessage>,
    ) {
        let manager = self.clone();
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if let Err(e) = manager.dispatch_to(&*connector, &dispatcher, msg).await {
                    warn!(error = %e, "outbound delivery failed");
                }
            }
        });
    }

    /// Spawn the outbound pump consuming the bus's outbound queue. The
    /// pump only routes: each message is handed to its destination
    /// instance's queue without awaiting the send.
    pub fn run_outbound(&self, mut receiver: OutboundReceiver) {
        let manager = self.clone();
        tokio::spawn(async move {
            while let Some(msg) = receiver.recv().await {
                if let Err(e) = manager.deliver(msg).await {
                    warn!(error = %e, "outbound routing failed");
                }
            }
        });
    }

    /// Status of every live instance.
    pub fn status(&self) -> Vec<WorkerStatus> {
        self.instances
            .read()
            .iter()
            .map(|((channel, account), instance)| {
                let metrics = instance.dispatcher.metrics();
                WorkerStatus {
                    channel: channel.clone(),
                    account: account.clone(),
                    connected: instance.connector.is_connected(),
                    last_connected_at: *instance.last_connected_at.lock(),
                    reconnects: instance.reconnects.load(Ordering::Relaxed),
                    outbound_health: evaluate_outbound_health(&metrics),
                    outbound: metrics,
                }
            })
            .collect()
    }

    pub fn instance_count(&self) -> usize {
        self.instances.read().len()
    }
}
