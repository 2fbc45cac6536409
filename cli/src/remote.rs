use anyhow::Context;
use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use tracing::debug;

use tally_core::error::{Error, Result};
use tally_core::models::{RecordKind, RecurringRecord, SyncFailure};
use tally_core::remote::{FetchedRecord, RemoteDocument, RemoteRecordService};

use crate::server::IDEMPOTENCY_KEY;

/// Client for the document API served by `tally serve`.
pub struct HttpRecordService {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

#[derive(Deserialize)]
struct CreatedResponse {
    id: String,
}

#[derive(Deserialize)]
struct ErrorBody {
    error: String,
}

impl HttpRecordService {
    pub fn new(base_url: &str, api_key: Option<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(format!("tally/{}", env!("CARGO_PKG_VERSION")))
            .connect_timeout(std::time::Duration::from_secs(5))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }

    fn collection_url(&self, kind: RecordKind) -> String {
        format!(
            "{}/api/collections/{}/documents",
            self.base_url,
            kind.collection()
        )
    }

    fn document_url(&self, kind: RecordKind, id: &str) -> String {
        format!("{}/{id}", self.collection_url(kind))
    }

    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        let builder = self.client.request(method, url);
        match self.api_key {
            Some(ref key) => builder.bearer_auth(key),
            None => builder,
        }
    }

    /// Send and map the outcome onto the remote error taxonomy. `allow` lists
    /// non-2xx statuses the caller treats as success.
    async fn send(&self, op: &str, builder: RequestBuilder, allow: &[StatusCode]) -> Result<Response> {
        let response = builder
            .send()
            .await
            .map_err(|e| Error::remote_unavailable(format!("{op}: {e}")))?;
        let status = response.status();
        debug!(op, status = status.as_u16(), "remote response");
        if status.is_success() || allow.contains(&status) {
            return Ok(response);
        }

        let message = match response.text().await {
            Ok(text) => serde_json::from_str::<ErrorBody>(&text)
                .map(|b| b.error)
                .unwrap_or(text),
            Err(e) => e.to_string(),
        };
        Err(classify(op, status, &message))
    }

    async fn json<T: serde::de::DeserializeOwned>(op: &str, response: Response) -> Result<T> {
        let status = response.status().as_u16();
        response
            .json()
            .await
            .map_err(|e| Error::remote_rejected(status, format!("{op}: invalid response body: {e}")))
    }

    async fn put(&self, record: &RecurringRecord, remote_id: &str) -> Result<()> {
        let url = self.document_url(record.kind, remote_id);
        self.send(
            "overwrite",
            self.request(Method::PUT, &url)
                .json(&RemoteDocument::from_record(record)),
            &[],
        )
        .await?;
        Ok(())
    }
}

fn classify(op: &str, status: StatusCode, message: &str) -> Error {
    if status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
    {
        Error::remote_unavailable(format!("{op}: HTTP {status}: {message}"))
    } else {
        Error::remote_rejected(status.as_u16(), format!("{op}: {message}"))
    }
}

/// Decode one listed document, keeping its id on failure so sync can report it.
fn decode_document(kind: RecordKind, value: serde_json::Value) -> FetchedRecord {
    let remote_id = value
        .get("id")
        .and_then(serde_json::Value::as_str)
        .unwrap_or_default()
        .to_string();
    let document: RemoteDocument = serde_json::from_value(value).map_err(|e| SyncFailure {
        remote_id: remote_id.clone(),
        error: format!("undecodable document: {e}"),
    })?;
    document.into_record(kind).map_err(|e| SyncFailure {
        remote_id,
        error: e.to_string(),
    })
}

#[async_trait]
impl RemoteRecordService for HttpRecordService {
    async fn save(&self, record: &RecurringRecord) -> Result<String> {
        if let Some(remote_id) = record.remote_id() {
            self.put(record, remote_id).await?;
            return Ok(remote_id.to_string());
        }

        let url = self.collection_url(record.kind);
        let mut builder = self
            .request(Method::POST, &url)
            .json(&RemoteDocument::from_record(record));
        if !record.uuid.is_empty() {
            builder = builder.header(IDEMPOTENCY_KEY, &record.uuid);
        }
        let response = self.send("create", builder, &[]).await?;
        let created: CreatedResponse = Self::json("create", response).await?;
        Ok(created.id)
    }

    async fn update(&self, record: &RecurringRecord) -> Result<()> {
        let remote_id = record
            .remote_id()
            .ok_or_else(|| Error::invalid_argument("cannot update a document without a remote id"))?;
        self.put(record, remote_id).await
    }

    async fn set_status(&self, kind: RecordKind, remote_id: &str, status: bool) -> Result<()> {
        let url = self.document_url(kind, remote_id);
        self.send(
            "set_status",
            self.request(Method::PATCH, &url)
                .json(&serde_json::json!({ "status": status })),
            &[],
        )
        .await?;
        Ok(())
    }

    async fn delete(&self, kind: RecordKind, remote_id: &str) -> Result<()> {
        let url = self.document_url(kind, remote_id);
        self.send(
            "delete",
            self.request(Method::DELETE, &url),
            &[StatusCode::NOT_FOUND],
        )
        .await?;
        Ok(())
    }

    async fn fetch_all(&self, kind: RecordKind) -> Result<Vec<FetchedRecord>> {
        let url = self.collection_url(kind);
        let response = self
            .send("fetch_all", self.request(Method::GET, &url), &[])
            .await?;
        let documents: Vec<serde_json::Value> = Self::json("fetch_all", response).await?;
        Ok(documents
            .into_iter()
            .map(|value| decode_document(kind, value))
            .collect())
    }
}
