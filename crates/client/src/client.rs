//! The facade client proper.

use std::collections::HashMap;

use weave_common::{ReadStrategy, RecordConfig, Result, Timestamp, TxnError};
use weave_txn::{CommitEntry, DataItem, Predicate};

use crate::messages::{
    AbortRequest, CommitRequest, PlainResponse, PrepareRequest, PrepareResponse, ReadRequest,
    ReadResponse, STATUS_OK,
};

/// Client for one facade server.
///
/// Cheap to clone; the underlying connection pool is shared.
#[derive(Clone)]
pub struct FacadeClient {
    base_url: String,
    http: reqwest::Client,
}

impl FacadeClient {
    /// `addr` is the server authority, e.g. `127.0.0.1:8000`.
    pub fn new(addr: &str) -> Self {
        Self {
            base_url: format!("http://{}", addr),
            http: reqwest::Client::new(),
        }
    }

    pub async fn ping(&self) -> Result<()> {
        let body = self
            .http
            .get(format!("{}/ping", self.base_url))
            .send()
            .await
            .map_err(transport)?
            .text()
            .await
            .map_err(transport)?;
        if body == "pong" {
            Ok(())
        } else {
            Err(TxnError::Backend(format!("unexpected ping reply: {}", body)))
        }
    }

    /// Read `key` on the server, resolving foreign PREPARED heads there.
    pub async fn read(
        &self,
        ds_name: &str,
        key: &str,
        start_time: Timestamp,
        config: &RecordConfig,
    ) -> Result<(DataItem, ReadStrategy, Option<String>)> {
        let req = ReadRequest {
            ds_name: ds_name.to_string(),
            key: key.to_string(),
            start_time,
            config: config.clone(),
        };
        let resp: ReadResponse = self.post("/read", &req).await?;
        if resp.status != STATUS_OK {
            return Err(remote_error(resp.err_msg));
        }
        let item = resp
            .data
            .ok_or_else(|| TxnError::Backend("read response missing data".into()))?;
        let strategy = resp.data_strategy.unwrap_or(ReadStrategy::Normal);
        Ok((item, strategy, resp.group_key))
    }

    /// Prepare `items` on the server; returns the per-key version map and
    /// the commit timestamp the server allocated.
    pub async fn prepare(
        &self,
        ds_name: &str,
        items: Vec<DataItem>,
        start_time: Timestamp,
        config: &RecordConfig,
        validation_map: HashMap<String, Predicate>,
    ) -> Result<(HashMap<String, String>, Timestamp)> {
        let req = PrepareRequest {
            ds_name: ds_name.to_string(),
            item_type: String::new(),
            item_list: items,
            start_time,
            config: config.clone(),
            validation_map,
        };
        let resp: PrepareResponse = self.post("/prepare", &req).await?;
        if resp.status != STATUS_OK {
            return Err(remote_error(resp.err_msg));
        }
        let ver_map = resp.ver_map.unwrap_or_default();
        let t_commit = resp
            .t_commit
            .ok_or_else(|| TxnError::Backend("prepare response missing tCommit".into()))?;
        Ok((ver_map, t_commit))
    }

    pub async fn commit(
        &self,
        ds_name: &str,
        list: Vec<CommitEntry>,
        t_commit: Timestamp,
    ) -> Result<()> {
        let req = CommitRequest {
            ds_name: ds_name.to_string(),
            list,
            t_commit,
        };
        let resp: PlainResponse = self.post("/commit", &req).await?;
        if resp.status != STATUS_OK {
            return Err(remote_error(resp.err_msg));
        }
        Ok(())
    }

    pub async fn abort(&self, ds_name: &str, key_list: Vec<String>, txn_id: &str) -> Result<()> {
        let req = AbortRequest {
            ds_name: ds_name.to_string(),
            key_list,
            group_key_list: txn_id.to_string(),
        };
        let resp: PlainResponse = self.post("/abort", &req).await?;
        if resp.status != STATUS_OK {
            return Err(remote_error(resp.err_msg));
        }
        Ok(())
    }

    async fn post<Req, Resp>(&self, path: &str, req: &Req) -> Result<Resp>
    where
        Req: serde::Serialize,
        Resp: serde::de::DeserializeOwned,
    {
        self.http
            .post(format!("{}{}", self.base_url, path))
            .json(req)
            .send()
            .await
            .map_err(transport)?
            .error_for_status()
            .map_err(transport)?
            .json()
            .await
            .map_err(transport)
    }
}

fn transport(e: reqwest::Error) -> TxnError {
    TxnError::Backend(format!("facade transport: {}", e))
}

fn remote_error(err_msg: Option<String>) -> TxnError {
    match err_msg {
        Some(msg) => TxnError::from_remote(&msg),
        None => TxnError::Backend("facade error without message".into()),
    }
}
