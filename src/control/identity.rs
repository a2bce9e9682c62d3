//! Identity Cache
//!
//! Lazily resolved bot identity, contact roster, and backing-store handles.
//! Each slot is computed at most once per process lifetime with no TTL or
//! invalidation; a deployment that needs fresh roster data restarts the
//! process. Concurrent first accesses to the same slot are serialized by
//! the cell, so each loader runs once even under racing callers. A failed
//! load leaves the slot empty and a later access retries.

use std::collections::HashSet;

use serde::Deserialize;
use serde_json::Value;
use tokio::sync::OnceCell;

use super::client::{ControlClient, ControlError};

/// Delimiter joining member ids in the group-members wire string
const MEMBER_DELIMITER: char = '^';

/// The logged-in bot account
#[derive(Debug, Clone, Deserialize)]
pub struct SelfIdentity {
    /// Stable user id of the bot
    #[serde(rename = "wxid")]
    pub user_id: String,

    /// Login account name
    #[serde(default)]
    pub account: String,

    /// Display name
    #[serde(default)]
    pub name: String,
}

/// One contact-roster entry (friend, group, or subscription account)
#[derive(Debug, Clone, Deserialize)]
pub struct Contact {
    #[serde(rename = "wxid")]
    pub user_id: String,

    #[serde(rename = "userName", default)]
    pub display_name: String,

    #[serde(rename = "customAccount", default)]
    pub custom_account: String,

    #[serde(rename = "type", default)]
    pub kind: i64,

    #[serde(rename = "verifyFlag", default)]
    pub verify_flag: i64,

    #[serde(rename = "delFlag", default)]
    pub del_flag: i64,
}

/// A backing-store handle and the tables it serves
#[derive(Debug, Clone, Deserialize)]
pub struct StoreHandle {
    pub handle: i64,

    #[serde(rename = "databaseName", default)]
    pub db_name: String,

    #[serde(default)]
    pub tables: Vec<StoreTable>,
}

/// A named table behind a store handle
#[derive(Debug, Clone, Deserialize)]
pub struct StoreTable {
    #[serde(default)]
    pub name: String,
}

/// A group's membership as reported by the agent
#[derive(Debug, Clone)]
pub struct GroupRoster {
    pub group_id: String,

    /// Admin id, kept verbatim from the wire
    pub admin: String,

    pub members: HashSet<String>,
}

impl GroupRoster {
    /// Parse the group-members response payload
    ///
    /// Members arrive as one caret-delimited string.
    pub fn from_wire(data: &Value) -> Option<Self> {
        let group_id = data.get("chatRoomId")?.as_str()?.to_string();
        let admin = data
            .get("admin")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let members = data
            .get("members")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .split(MEMBER_DELIMITER)
            .filter(|member| !member.is_empty())
            .map(str::to_string)
            .collect();
        Some(Self {
            group_id,
            admin,
            members,
        })
    }
}

pub(crate) fn find_handle(handles: &[StoreHandle], table: &str) -> Option<i64> {
    handles
        .iter()
        .find(|store| store.tables.iter().any(|t| t.name == table))
        .map(|store| store.handle)
}

/// Once-per-process cache over the control client's fetch commands
#[derive(Default)]
pub struct IdentityCache {
    identity: OnceCell<SelfIdentity>,
    contacts: OnceCell<Vec<Contact>>,
    store_handles: OnceCell<Vec<StoreHandle>>,
}

impl IdentityCache {
    pub async fn identity(&self, client: &ControlClient) -> Result<&SelfIdentity, ControlError> {
        self.identity
            .get_or_try_init(|| client.fetch_identity())
            .await
    }

    pub async fn contacts(&self, client: &ControlClient) -> Result<&[Contact], ControlError> {
        Ok(self
            .contacts
            .get_or_try_init(|| client.fetch_contacts())
            .await?
            .as_slice())
    }

    pub async fn store_handles(
        &self,
        client: &ControlClient,
    ) -> Result<&[StoreHandle], ControlError> {
        Ok(self
            .store_handles
            .get_or_try_init(|| client.fetch_store_handles())
            .await?
            .as_slice())
    }

    /// The handle serving `table`; a miss is a hard error for the query
    pub async fn store_handle_for(
        &self,
        client: &ControlClient,
        table: &str,
    ) -> Result<i64, ControlError> {
        let handles = self.store_handles(client).await?;
        find_handle(handles, table).ok_or_else(|| ControlError::UnknownTable {
            table: table.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_group_roster_from_wire() {
        let data = json!({
            "admin": "wxid_admin",
            "chatRoomId": "485359@chatroom",
            "members": "w1^w2^w3"
        });
        let roster = GroupRoster::from_wire(&data).unwrap();
        assert_eq!(roster.group_id, "485359@chatroom");
        assert_eq!(roster.admin, "wxid_admin");
        assert_eq!(roster.members.len(), 3);
        for member in ["w1", "w2", "w3"] {
            assert!(roster.members.contains(member));
        }
    }

    #[test]
    fn test_group_roster_empty_members() {
        let data = json!({ "chatRoomId": "1@chatroom", "members": "" });
        let roster = GroupRoster::from_wire(&data).unwrap();
        assert!(roster.members.is_empty());
        assert_eq!(roster.admin, "");
    }

    #[test]
    fn test_group_roster_missing_group_id() {
        assert!(GroupRoster::from_wire(&json!({ "members": "w1" })).is_none());
    }

    #[test]
    fn test_find_handle() {
        let handles: Vec<StoreHandle> = serde_json::from_value(json!([
            { "handle": 7, "databaseName": "main.db", "tables": [{ "name": "orders" }] },
            { "handle": 9, "databaseName": "aux.db", "tables": [{ "name": "contacts" }] }
        ]))
        .unwrap();
        assert_eq!(find_handle(&handles, "orders"), Some(7));
        assert_eq!(find_handle(&handles, "contacts"), Some(9));
        assert_eq!(find_handle(&handles, "missing"), None);
    }
}
