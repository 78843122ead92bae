use async_trait::async_trait;
use tokio::sync::mpsc;

use clawlite_core::Result;

/// An event received from a messaging backend, before allowlisting and
/// session binding.
#[derive(Debug, Clone)]
pub struct IncomingEvent {
    /// Backend-specific message id.
    pub id: String,
    pub sender_id: String,
    pub sender_name: Option<String>,
    pub chat_id: String,
    /// Topic/thread id for threaded chats.
    pub thread_id: Option<String>,
    pub text: Option<String>,
}

/// Events emitted by a channel connector.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    Message(IncomingEvent),
    Connected,
    Disconnected(Option<String>),
}

/// One live connection/polling loop to a messaging backend under a specific
/// account. Reconnect and backoff live inside the connector; the manager
/// only restarts it when its event stream dies.
#[async_trait]
pub trait ChannelConnector: Send + Sync {
    /// Channel type name, e.g. "telegram".
    fn channel_type(&self) -> &str;

    /// Account identifier within the channel.
    fn account(&self) -> &str;

    /// Start the connector. Returns a receiver for incoming events; the
    /// stream ending signals the connection is gone.
    async fn start(&self) -> Result<mpsc::Receiver<ChannelEvent>>;

    /// Execute one provider-specific send.
    async fn send(&self, chat_id: &str, thread_id: Option<&str>, text: &str) -> Result<()>;

    /// Stop the connector gracefully.
    async fn stop(&self);

    fn is_connected(&self) -> bool;
}
