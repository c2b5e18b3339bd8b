//! Request and response shapes of the facade endpoints.
//!
//! Non-transport errors ride in the body with `status = "Error"`; a 200
//! with an error body is a protocol-level failure, anything else is a
//! transport failure.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use weave_common::{ReadStrategy, RecordConfig, Timestamp};
use weave_txn::{CommitEntry, DataItem, Predicate};

pub const STATUS_OK: &str = "OK";
pub const STATUS_ERROR: &str = "Error";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadRequest {
    pub ds_name: String,
    pub key: String,
    pub start_time: Timestamp,
    pub config: RecordConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadResponse {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<DataItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_strategy: Option<ReadStrategy>,
    /// Owning transaction id when the read was served under an assumption.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub err_msg: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrepareRequest {
    pub ds_name: String,
    /// Backend type tag of the items; informational.
    #[serde(default)]
    pub item_type: String,
    pub item_list: Vec<DataItem>,
    pub start_time: Timestamp,
    pub config: RecordConfig,
    /// Read-time assumptions to re-check, keyed by owning transaction id.
    #[serde(default)]
    pub validation_map: HashMap<String, Predicate>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrepareResponse {
    pub status: String,
    /// Post-prepare version per key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ver_map: Option<HashMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub t_commit: Option<Timestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub err_msg: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitRequest {
    pub ds_name: String,
    pub list: Vec<CommitEntry>,
    pub t_commit: Timestamp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AbortRequest {
    pub ds_name: String,
    pub key_list: Vec<String>,
    /// Id of the transaction whose PREPARED records are rolled back.
    pub group_key_list: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlainResponse {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub err_msg: Option<String>,
}
