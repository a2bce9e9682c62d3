//! Control-endpoint client and identity cache
//!
//! Everything that talks to the injected agent's request/response API.

pub mod client;
pub mod identity;

pub use client::{Command, ControlClient, ControlError, ControlResponse, HookState};
pub use identity::{Contact, GroupRoster, IdentityCache, SelfIdentity, StoreHandle, StoreTable};
