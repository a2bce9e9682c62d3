//! hookbridge
//!
//! Bridges a locally running chat client, controlled through an injected
//! agent, to a message-processing pipeline.
//!
//! # Features
//!
//! - **Control Client**: resilient HTTP command client with retry-on-timeout
//!   and hook-state reconciliation
//! - **Identity Cache**: lazily resolved bot identity, contact roster, and
//!   backing-store handles
//! - **Event Server**: concurrent TCP listener receiving pushed events, one
//!   per connection, framed by connection close
//! - **Message Classifier**: raw payloads to typed messages with resolved
//!   nicknames, mention and pat detection
//! - **Dispatch Router**: dedup, whitelist and self-filter policy, single vs.
//!   group routing, replies back through the control channel
//!
//! # Architecture
//!
//! ```text
//! Injected agent ──HTTP──► ControlClient ──► IdentityCache
//!       │                        ▲
//!       └──TCP push──► EventServer ──► Dispatcher ──► Classifier
//!                                         │
//!                                         └──► WorkSink (conversation engine)
//! ```

pub mod bridge;
pub mod config;
pub mod control;
pub mod dispatch;
pub mod event_server;
pub mod message;

pub use bridge::Bridge;
pub use config::Config;
pub use control::{
    Command, Contact, ControlClient, ControlError, ControlResponse, GroupRoster, HookState,
    IdentityCache, SelfIdentity, StoreHandle, StoreTable,
};
pub use dispatch::{Dispatcher, LoggingSink, Reply, WorkItem, WorkSink};
pub use event_server::{EventHandler, EventServer};
pub use message::{ClassifiedMessage, ClassifyError, ContentKind, RawEvent};
