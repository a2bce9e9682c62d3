//! Event Server
//!
//! Long-lived TCP listener receiving pushed events from the injected agent.
//! The protocol is fire-and-forget: each inbound connection carries one
//! JSON event record framed by the peer closing the connection, nothing is
//! written back, and the handler's return value is ignored. Connections
//! are serviced concurrently with no ordering guarantee between them, so
//! handlers synchronize any shared state internally.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

use crate::message::RawEvent;

/// Receiver for decoded events
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn on_event(&self, event: RawEvent);
}

/// Default handler until a callback is registered; events are not buffered
struct LogOnlyHandler;

#[async_trait]
impl EventHandler for LogOnlyHandler {
    async fn on_event(&self, event: RawEvent) {
        info!(
            "unhandled event: msg_id={}, type={}",
            event.message_id, event.content_type
        );
    }
}

type HandlerSlot = Arc<RwLock<Arc<dyn EventHandler>>>;

/// TCP listener accepting event pushes from the injected agent
pub struct EventServer {
    host: String,
    port: u16,
    handler: HandlerSlot,
}

impl EventServer {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            handler: Arc::new(RwLock::new(Arc::new(LogOnlyHandler))),
        }
    }

    /// Replace the registered handler; callable before or after serving starts
    pub fn register_callback(&self, handler: Arc<dyn EventHandler>) {
        *self.handler.write() = handler;
    }

    /// Bind the listener without accepting yet
    ///
    /// Separate from [`serve`](Self::serve) so the owner can learn the
    /// bound port (port 0 picks a free one) and advertise it to the agent
    /// before events start flowing.
    pub async fn bind(&self) -> Result<TcpListener> {
        let addr = format!("{}:{}", self.host, self.port);
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("failed to bind event listener on {}", addr))?;
        info!("event listener bound: addr={}", listener.local_addr()?);
        Ok(listener)
    }

    /// Accept connections forever, one worker task per connection
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let slot = Arc::clone(&self.handler);
                    tokio::spawn(async move {
                        Self::handle_connection(stream, peer, slot).await;
                    });
                }
                Err(e) => warn!("failed to accept event connection: {}", e),
            }
        }
    }

    /// Bind and serve
    pub async fn run(&self) -> Result<()> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    async fn handle_connection(mut stream: TcpStream, peer: SocketAddr, slot: HandlerSlot) {
        let mut payload = Vec::new();
        if let Err(e) = stream.read_to_end(&mut payload).await {
            error!("failed to read event payload: peer={}, error={}", peer, e);
            return;
        }

        let event: RawEvent = match serde_json::from_slice(&payload) {
            Ok(event) => event,
            Err(e) => {
                error!(
                    "dropping undecodable event payload: peer={}, bytes={}, error={}",
                    peer,
                    payload.len(),
                    e
                );
                return;
            }
        };

        debug!(
            "received event: peer={}, msg_id={}, type={}",
            peer, event.message_id, event.content_type
        );

        let handler = Arc::clone(&*slot.read());
        handler.on_event(event).await;
    }
}
