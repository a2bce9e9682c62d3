//! Control Client
//!
//! Issues control commands against the injected agent's HTTP endpoint.
//! Timed-out requests are retried up to a fixed budget with no backoff
//! delay; every other transport failure aborts immediately. Command-level
//! failure semantics differ per method: sends and store queries fall back
//! to a sentinel return, everything else surfaces a typed error.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

use super::identity::{Contact, GroupRoster, IdentityCache, SelfIdentity, StoreHandle};

/// Mention target meaning "notify everyone" in a group
const MENTION_ALL: &str = "notify@all";

/// Control command codes understood by the injected agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    CheckLogin,
    SelfIdentity,
    SendText,
    SendAtMention,
    SendImage,
    SendFile,
    EnableHook,
    DisableHook,
    GroupMembers,
    MemberNickname,
    StoreHandles,
    QueryByStatement,
    ContactRoster,
    NicknameLookup,
}

impl Command {
    /// Wire-level command code
    pub fn code(self) -> u32 {
        match self {
            Command::CheckLogin => 0,
            Command::SelfIdentity => 1,
            Command::SendText => 2,
            Command::SendAtMention => 3,
            Command::SendImage => 5,
            Command::SendFile => 6,
            Command::EnableHook => 9,
            Command::DisableHook => 10,
            Command::GroupMembers => 25,
            Command::MemberNickname => 26,
            Command::StoreHandles => 32,
            Command::QueryByStatement => 34,
            Command::ContactRoster => 46,
            Command::NicknameLookup => 55,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Command::CheckLogin => "check-login",
            Command::SelfIdentity => "self-identity",
            Command::SendText => "send-text",
            Command::SendAtMention => "send-at-mention",
            Command::SendImage => "send-image",
            Command::SendFile => "send-file",
            Command::EnableHook => "enable-hook",
            Command::DisableHook => "disable-hook",
            Command::GroupMembers => "group-members",
            Command::MemberNickname => "member-nickname",
            Command::StoreHandles => "store-handles",
            Command::QueryByStatement => "query-by-statement",
            Command::ContactRoster => "contact-roster",
            Command::NicknameLookup => "nickname-lookup",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (type {})", self.name(), self.code())
    }
}

/// Whether the agent currently forwards events, and to whom
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookState {
    Unhooked,
    Hooked,
    HookedByOther,
}

/// Error types for control operations
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("control request timed out after {attempts} attempts: {command}")]
    Timeout { command: Command, attempts: u32 },

    #[error("control transport failure: {command}")]
    Transport {
        command: Command,
        #[source]
        source: reqwest::Error,
    },

    #[error("control request failed: {command}, payload: {payload}, response: {response}")]
    Request {
        command: Command,
        payload: String,
        response: String,
    },

    #[error("event hook retry budget exhausted after {budget} unhook/re-hook cycles")]
    HookExhausted { budget: u32 },

    #[error("table {table:?} does not appear in statement {sql:?}")]
    Validation { table: String, sql: String },

    #[error("no store handle serves table {table:?}")]
    UnknownTable { table: String },
}

/// Parsed control response
///
/// `code != 0` is the common success discriminator; store-handles reports
/// success through `result == "OK"` instead, and nickname commands carry
/// the resolved name in a top-level field captured by `extra`. The status
/// interpretation is always the caller's job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlResponse {
    #[serde(default)]
    pub code: i64,

    #[serde(default)]
    pub result: Option<String>,

    #[serde(default)]
    pub data: Value,

    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

impl ControlResponse {
    /// Common success discriminator
    pub fn ok(&self) -> bool {
        self.code != 0
    }

    /// Top-level string field outside the fixed schema
    pub fn text_field(&self, name: &str) -> Option<&str> {
        self.extra.get(name).and_then(Value::as_str)
    }
}

fn request_failure(
    command: Command,
    payload: Option<&Value>,
    response: &ControlResponse,
) -> ControlError {
    ControlError::Request {
        command,
        payload: payload.map(Value::to_string).unwrap_or_default(),
        response: serde_json::to_string(response).unwrap_or_default(),
    }
}

/// Client for the injected agent's control endpoint
pub struct ControlClient {
    http: reqwest::Client,
    base_url: String,
    timeout: Duration,
    max_retries: u32,
    cache: IdentityCache,
}

impl ControlClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration, max_retries: u32) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            timeout,
            max_retries,
            cache: IdentityCache::default(),
        }
    }

    fn endpoint(&self, command: Command) -> String {
        format!(
            "{}/api/?type={}",
            self.base_url.trim_end_matches('/'),
            command.code()
        )
    }

    fn json_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers
    }

    /// Send one control request, retrying timeouts sequentially
    ///
    /// `k <= max_retries` timeouts followed by a response makes `k + 1`
    /// attempts and returns that first response, parsed, regardless of its
    /// status discriminator. All-timeout makes `max_retries + 1` attempts
    /// and fails with the attempt count. Any other transport failure aborts
    /// immediately.
    pub async fn invoke(
        &self,
        command: Command,
        headers: HeaderMap,
        payload: Option<Value>,
        max_retries: u32,
        timeout: Duration,
    ) -> Result<ControlResponse, ControlError> {
        let url = self.endpoint(command);
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            let mut request = self.http.post(&url).headers(headers.clone()).timeout(timeout);
            if let Some(body) = &payload {
                request = request.json(body);
            }
            match request.send().await {
                Ok(response) => {
                    let parsed = response
                        .json::<ControlResponse>()
                        .await
                        .map_err(|source| ControlError::Transport { command, source })?;
                    return Ok(parsed);
                }
                Err(source) if source.is_timeout() => {
                    if attempts > max_retries {
                        return Err(ControlError::Timeout { command, attempts });
                    }
                    warn!(
                        "control request timed out, retrying: command={}, attempt={}",
                        command, attempts
                    );
                }
                Err(source) => return Err(ControlError::Transport { command, source }),
            }
        }
    }

    async fn call(
        &self,
        command: Command,
        headers: HeaderMap,
        payload: Option<Value>,
    ) -> Result<ControlResponse, ControlError> {
        self.invoke(command, headers, payload, self.max_retries, self.timeout)
            .await
    }

    /// Check whether the chat client is logged in
    pub async fn check_login(&self) -> Result<(), ControlError> {
        debug!("checking login status");
        let response = self
            .call(Command::CheckLogin, Self::json_headers(), None)
            .await?;
        if response.ok() {
            Ok(())
        } else {
            Err(request_failure(Command::CheckLogin, None, &response))
        }
    }

    pub(crate) async fn fetch_identity(&self) -> Result<SelfIdentity, ControlError> {
        debug!("fetching bot identity");
        let response = self
            .call(Command::SelfIdentity, HeaderMap::new(), None)
            .await?;
        if response.ok() {
            serde_json::from_value(response.data.clone())
                .map_err(|_| request_failure(Command::SelfIdentity, None, &response))
        } else {
            Err(request_failure(Command::SelfIdentity, None, &response))
        }
    }

    pub(crate) async fn fetch_contacts(&self) -> Result<Vec<Contact>, ControlError> {
        debug!("fetching contact roster");
        let response = self
            .call(Command::ContactRoster, HeaderMap::new(), None)
            .await?;
        if response.ok() {
            serde_json::from_value(response.data.clone())
                .map_err(|_| request_failure(Command::ContactRoster, None, &response))
        } else {
            Err(request_failure(Command::ContactRoster, None, &response))
        }
    }

    pub(crate) async fn fetch_store_handles(&self) -> Result<Vec<StoreHandle>, ControlError> {
        debug!("fetching store handles");
        let response = self
            .call(Command::StoreHandles, HeaderMap::new(), None)
            .await?;
        if response.result.as_deref() == Some("OK") {
            serde_json::from_value(response.data.clone())
                .map_err(|_| request_failure(Command::StoreHandles, None, &response))
        } else {
            Err(request_failure(Command::StoreHandles, None, &response))
        }
    }

    /// Bot identity, resolved once per process lifetime
    pub async fn self_identity(&self) -> Result<&SelfIdentity, ControlError> {
        self.cache.identity(self).await
    }

    /// Contact roster, resolved once per process lifetime
    pub async fn contacts(&self) -> Result<&[Contact], ControlError> {
        self.cache.contacts(self).await
    }

    /// Backing-store handle table, resolved once per process lifetime
    pub async fn store_handles(&self) -> Result<&[StoreHandle], ControlError> {
        self.cache.store_handles(self).await
    }

    /// Send text to a user or group
    ///
    /// Returns `None` when the agent reports the send failed; transport
    /// failures still propagate.
    pub async fn send_text(
        &self,
        msg: &str,
        recipient: &str,
    ) -> Result<Option<ControlResponse>, ControlError> {
        debug!("sending text: recipient={}", recipient);
        let payload = json!({ "wxid": recipient, "msg": msg });
        let response = self
            .call(Command::SendText, Self::json_headers(), Some(payload.clone()))
            .await?;
        if response.ok() {
            Ok(Some(response))
        } else {
            warn!(
                "send text failed: payload={}, response={}",
                payload,
                serde_json::to_string(&response).unwrap_or_default()
            );
            Ok(None)
        }
    }

    /// Send text to a group, at-mentioning the given members
    ///
    /// An empty target list mentions everyone.
    pub async fn send_mention(
        &self,
        msg: &str,
        group_id: &str,
        targets: &[&str],
    ) -> Result<Option<ControlResponse>, ControlError> {
        let wxids = if targets.is_empty() {
            MENTION_ALL.to_string()
        } else {
            targets.join(",")
        };
        debug!("sending mention: group={}, targets={}", group_id, wxids);
        let payload = json!({ "wxids": wxids, "msg": msg, "chatRoomId": group_id });
        let response = self
            .call(
                Command::SendAtMention,
                Self::json_headers(),
                Some(payload.clone()),
            )
            .await?;
        if response.ok() {
            Ok(Some(response))
        } else {
            warn!(
                "send mention failed: payload={}, response={}",
                payload,
                serde_json::to_string(&response).unwrap_or_default()
            );
            Ok(None)
        }
    }

    /// Send an image from a local path
    pub async fn send_image(
        &self,
        path: &Path,
        recipient: &str,
    ) -> Result<Option<ControlResponse>, ControlError> {
        debug!("sending image: path={}, recipient={}", path.display(), recipient);
        let payload = json!({ "wxid": recipient, "imagePath": path.display().to_string() });
        let response = self
            .call(Command::SendImage, Self::json_headers(), Some(payload.clone()))
            .await?;
        if response.ok() {
            Ok(Some(response))
        } else {
            warn!(
                "send image failed: payload={}, response={}",
                payload,
                serde_json::to_string(&response).unwrap_or_default()
            );
            Ok(None)
        }
    }

    /// Send a file from a local path
    pub async fn send_file(
        &self,
        path: &Path,
        recipient: &str,
    ) -> Result<Option<ControlResponse>, ControlError> {
        debug!("sending file: path={}, recipient={}", path.display(), recipient);
        let payload = json!({ "wxid": recipient, "filePath": path.display().to_string() });
        let response = self
            .call(Command::SendFile, Self::json_headers(), Some(payload.clone()))
            .await?;
        if response.ok() {
            Ok(Some(response))
        } else {
            warn!(
                "send file failed: payload={}, response={}",
                payload,
                serde_json::to_string(&response).unwrap_or_default()
            );
            Ok(None)
        }
    }

    /// Point the agent's event hook at the given destination
    ///
    /// Code 1 means hooked. Code 2 means another destination already holds
    /// the hook: the hook is released and the same request re-sent, spending
    /// one cycle of `max_retries`. A budget of `N` permits at most `N`
    /// unhook/re-hook cycles before [`ControlError::HookExhausted`]. Any
    /// other code fails immediately.
    pub async fn enable_event_hook(
        &self,
        use_http: bool,
        host: &str,
        port: u16,
        callback_url: &str,
        timeout: Duration,
        max_retries: u32,
    ) -> Result<HookState, ControlError> {
        let destination = if use_http {
            callback_url.to_string()
        } else {
            format!("tcp://{}:{}", host, port)
        };
        debug!("registering event hook: destination={}", destination);
        let payload = json!({
            "port": port.to_string(),
            "ip": host,
            "enableHttp": if use_http { "1" } else { "0" },
            "url": callback_url,
            "timeout": timeout.as_secs().to_string(),
        });

        let mut response = self
            .call(Command::EnableHook, Self::json_headers(), Some(payload.clone()))
            .await?;
        let mut budget = max_retries;
        loop {
            match Self::hook_state(&response) {
                Some(HookState::Hooked) => return Ok(HookState::Hooked),
                Some(HookState::HookedByOther) => {
                    if budget == 0 {
                        return Err(ControlError::HookExhausted { budget: max_retries });
                    }
                    debug!("event hook already held, reclaiming: cycles_left={}", budget);
                    self.disable_event_hook().await?;
                    response = self
                        .call(Command::EnableHook, Self::json_headers(), Some(payload.clone()))
                        .await?;
                    budget -= 1;
                }
                _ => return Err(request_failure(Command::EnableHook, Some(&payload), &response)),
            }
        }
    }

    fn hook_state(response: &ControlResponse) -> Option<HookState> {
        match response.code {
            1 => Some(HookState::Hooked),
            2 => Some(HookState::HookedByOther),
            _ => None,
        }
    }

    /// Stop the agent from forwarding events
    ///
    /// Code 2 means no hook was installed; treated as an idempotent no-op.
    pub async fn disable_event_hook(&self) -> Result<HookState, ControlError> {
        debug!("removing event hook");
        let response = self
            .call(Command::DisableHook, HeaderMap::new(), None)
            .await?;
        match response.code {
            1 => Ok(HookState::Unhooked),
            2 => {
                debug!("event hook was not installed");
                Ok(HookState::Unhooked)
            }
            _ => Err(request_failure(Command::DisableHook, None, &response)),
        }
    }

    /// Run an ad-hoc statement against the backing store serving `table`
    ///
    /// The table name must appear verbatim in the statement; this guards
    /// against routing a statement to the wrong store handle, it is not a
    /// SQL sanitizer. A failed query returns no rows, not an error.
    pub async fn query_by_statement(
        &self,
        table: &str,
        sql: &str,
    ) -> Result<Vec<Value>, ControlError> {
        if !sql.contains(table) {
            return Err(ControlError::Validation {
                table: table.to_string(),
                sql: sql.to_string(),
            });
        }
        let handle = self.cache.store_handle_for(self, table).await?;
        debug!("querying store: table={}, handle={}", table, handle);
        let payload = json!({ "dbHandle": handle, "sql": sql });
        let response = self
            .call(
                Command::QueryByStatement,
                Self::json_headers(),
                Some(payload.clone()),
            )
            .await?;
        if response.ok() {
            Ok(response.data.as_array().cloned().unwrap_or_default())
        } else {
            warn!(
                "store query failed: sql={}, response={}",
                sql,
                serde_json::to_string(&response).unwrap_or_default()
            );
            Ok(Vec::new())
        }
    }

    /// Resolve a display name, per-group when a group id is given
    pub async fn resolve_nickname(
        &self,
        user_id: &str,
        group: Option<&str>,
    ) -> Result<String, ControlError> {
        match group {
            Some(group_id) => self.member_nickname(group_id, user_id).await,
            None => self.lookup_nickname(user_id).await,
        }
    }

    async fn member_nickname(
        &self,
        group_id: &str,
        user_id: &str,
    ) -> Result<String, ControlError> {
        debug!("resolving member nickname: group={}, member={}", group_id, user_id);
        let payload = json!({ "chatRoomId": group_id, "memberId": user_id });
        let response = self
            .call(
                Command::MemberNickname,
                Self::json_headers(),
                Some(payload.clone()),
            )
            .await?;
        if response.ok() {
            if let Some(nickname) = response.text_field("nickname") {
                return Ok(nickname.to_string());
            }
        }
        Err(request_failure(Command::MemberNickname, Some(&payload), &response))
    }

    async fn lookup_nickname(&self, user_id: &str) -> Result<String, ControlError> {
        debug!("resolving nickname: id={}", user_id);
        let payload = json!({ "id": user_id });
        let response = self
            .call(
                Command::NicknameLookup,
                Self::json_headers(),
                Some(payload.clone()),
            )
            .await?;
        if response.ok() {
            if let Some(name) = response.text_field("name") {
                return Ok(name.to_string());
            }
        }
        Err(request_failure(Command::NicknameLookup, Some(&payload), &response))
    }

    /// Fetch a group's member set and admin
    pub async fn group_members(&self, group_id: &str) -> Result<GroupRoster, ControlError> {
        debug!("fetching group members: group={}", group_id);
        let payload = json!({ "chatRoomId": group_id });
        let response = self
            .call(
                Command::GroupMembers,
                Self::json_headers(),
                Some(payload.clone()),
            )
            .await?;
        if response.ok() {
            GroupRoster::from_wire(&response.data)
                .ok_or_else(|| request_failure(Command::GroupMembers, Some(&payload), &response))
        } else {
            Err(request_failure(Command::GroupMembers, Some(&payload), &response))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_codes() {
        assert_eq!(Command::CheckLogin.code(), 0);
        assert_eq!(Command::SelfIdentity.code(), 1);
        assert_eq!(Command::SendText.code(), 2);
        assert_eq!(Command::SendAtMention.code(), 3);
        assert_eq!(Command::SendImage.code(), 5);
        assert_eq!(Command::SendFile.code(), 6);
        assert_eq!(Command::EnableHook.code(), 9);
        assert_eq!(Command::DisableHook.code(), 10);
        assert_eq!(Command::GroupMembers.code(), 25);
        assert_eq!(Command::MemberNickname.code(), 26);
        assert_eq!(Command::StoreHandles.code(), 32);
        assert_eq!(Command::QueryByStatement.code(), 34);
        assert_eq!(Command::ContactRoster.code(), 46);
        assert_eq!(Command::NicknameLookup.code(), 55);
    }

    #[test]
    fn test_response_discriminator() {
        let response: ControlResponse =
            serde_json::from_str(r#"{"code":345686720,"result":"OK"}"#).unwrap();
        assert!(response.ok());

        let response: ControlResponse =
            serde_json::from_str(r#"{"code":0,"result":"Fail"}"#).unwrap();
        assert!(!response.ok());

        // Missing fields default rather than fail
        let response: ControlResponse = serde_json::from_str("{}").unwrap();
        assert!(!response.ok());
        assert!(response.result.is_none());
    }

    #[test]
    fn test_response_extra_fields() {
        let response: ControlResponse =
            serde_json::from_str(r#"{"code":1,"nickname":"Alice"}"#).unwrap();
        assert_eq!(response.text_field("nickname"), Some("Alice"));
        assert_eq!(response.text_field("name"), None);
    }

    #[test]
    fn test_hook_state_mapping() {
        let hooked: ControlResponse = serde_json::from_str(r#"{"code":1}"#).unwrap();
        let held: ControlResponse = serde_json::from_str(r#"{"code":2}"#).unwrap();
        let failed: ControlResponse = serde_json::from_str(r#"{"code":3}"#).unwrap();
        assert_eq!(ControlClient::hook_state(&hooked), Some(HookState::Hooked));
        assert_eq!(ControlClient::hook_state(&held), Some(HookState::HookedByOther));
        assert_eq!(ControlClient::hook_state(&failed), None);
    }
}
