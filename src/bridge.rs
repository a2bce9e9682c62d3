//! Bridge orchestration
//!
//! Owns the control client, dispatcher, and event server, and runs the
//! startup sequence: login check, identity resolution, listener bind,
//! hook registration, then serve until shutdown.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{info, warn};

use crate::config::Config;
use crate::control::ControlClient;
use crate::dispatch::{Dispatcher, WorkSink};
use crate::event_server::{EventHandler, EventServer};
use crate::message::RawEvent;

/// Feeds decoded events into the dispatcher, recovering from per-event
/// failures so the server keeps serving
struct DispatchHandler {
    dispatcher: Arc<Dispatcher>,
}

#[async_trait]
impl EventHandler for DispatchHandler {
    async fn on_event(&self, event: RawEvent) {
        let msg_id = event.message_id;
        if let Err(e) = self.dispatcher.dispatch(event).await {
            warn!("failed to dispatch event: msg_id={}, error={}", msg_id, e);
        }
    }
}

/// The assembled bridge
pub struct Bridge {
    config: Config,
    client: Arc<ControlClient>,
    dispatcher: Arc<Dispatcher>,
    server: Arc<EventServer>,
}

impl Bridge {
    pub fn new(config: Config, sink: Arc<dyn WorkSink>) -> Self {
        let client = Arc::new(ControlClient::new(
            config.control_url.clone(),
            Duration::from_secs(config.timeout_secs),
            config.max_retries,
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&client),
            config.whitelist.iter().cloned(),
            sink,
        ));
        let server = Arc::new(EventServer::new(config.event_host.clone(), config.event_port));
        server.register_callback(Arc::new(DispatchHandler {
            dispatcher: Arc::clone(&dispatcher),
        }));

        Self {
            config,
            client,
            dispatcher,
            server,
        }
    }

    /// The shared control client
    pub fn client(&self) -> Arc<ControlClient> {
        Arc::clone(&self.client)
    }

    /// The dispatcher, for sending replies
    pub fn dispatcher(&self) -> Arc<Dispatcher> {
        Arc::clone(&self.dispatcher)
    }

    /// Run the bridge to completion
    ///
    /// Login and hook registration failures are fatal. On ctrl-c the hook
    /// is removed best-effort before exiting.
    pub async fn run(&self) -> Result<()> {
        self.client
            .check_login()
            .await
            .context("control endpoint login check failed")?;

        let identity = self
            .client
            .self_identity()
            .await
            .context("failed to resolve bot identity")?;
        info!(
            "logged in: user_id={}, name={}",
            identity.user_id, identity.name
        );

        // Bind before registering the hook so the advertised port is live,
        // then serve on a worker task while registration completes.
        let listener = self.server.bind().await?;
        let bound_port = listener.local_addr()?.port();
        let mut serve_task = {
            let server = Arc::clone(&self.server);
            tokio::spawn(async move { server.serve(listener).await })
        };

        let advertise = self
            .config
            .advertise_host
            .clone()
            .unwrap_or_else(|| self.config.event_host.clone());
        let callback_url = format!("http://{}:{}", advertise, bound_port);
        self.client
            .enable_event_hook(
                false,
                &advertise,
                bound_port,
                &callback_url,
                Duration::from_secs(self.config.timeout_secs),
                self.config.hook_retries,
            )
            .await
            .context("failed to register event hook")?;
        info!("event hook registered: destination=tcp://{}:{}", advertise, bound_port);

        tokio::select! {
            result = &mut serve_task => {
                result.context("event server task failed")??;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown signal received, removing event hook");
                if let Err(e) = self.client.disable_event_hook().await {
                    warn!("failed to remove event hook on shutdown: {}", e);
                }
                serve_task.abort();
            }
        }

        Ok(())
    }
}
