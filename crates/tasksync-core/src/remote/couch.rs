//! CouchDB HTTP client

use std::collections::BTreeMap;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode, Url};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use super::{seq_to_string, ChangesBatch, RemoteChange, RemoteDoc, RemoteInfo, RemoteStore, RevsMap};
use crate::config::RemoteConfig;
use crate::document::Document;
use crate::error::{SyncError, SyncResult};

/// Remote database reached over HTTP
pub struct CouchRemote {
    client: Client,
    base_url: Url,
    url: String,
    credentials: Option<(String, String)>,
}

impl std::fmt::Debug for CouchRemote {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CouchRemote")
            .field("url", &self.url)
            .field("auth", &self.credentials.is_some())
            .finish()
    }
}

impl CouchRemote {
    /// Build a client for the database at `config.url`
    pub fn new(config: &RemoteConfig) -> SyncResult<Self> {
        let url = config
            .url
            .as_deref()
            .ok_or_else(|| SyncError::Protocol("remote.url is not configured".to_string()))?;

        let mut base_url = Url::parse(url)
            .map_err(|e| SyncError::Protocol(format!("Invalid remote URL '{}': {}", url, e)))?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        // Credentials embedded in the URL win over configured ones
        let credentials = if !base_url.username().is_empty() {
            let user = base_url.username().to_string();
            let pass = base_url.password().unwrap_or_default().to_string();
            let _ = base_url.set_username("");
            let _ = base_url.set_password(None);
            Some((user, pass))
        } else {
            config
                .username
                .clone()
                .map(|user| (user, config.password.clone().unwrap_or_default()))
        };

        let client = Client::builder()
            .timeout(config.timeout())
            .connect_timeout(config.connect_timeout())
            .user_agent(format!("tasksync/{}", env!("CARGO_PKG_VERSION")))
            .build()?;

        let display_url = base_url.as_str().trim_end_matches('/').to_string();
        Ok(Self {
            client,
            base_url,
            url: display_url,
            credentials,
        })
    }

    fn endpoint(&self, path: &str) -> SyncResult<Url> {
        self.base_url
            .join(path)
            .map_err(|e| SyncError::Protocol(format!("Invalid URL for '{}': {}", path, e)))
    }

    fn authed(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.credentials {
            Some((user, pass)) => request.basic_auth(user, Some(pass)),
            None => request,
        }
    }

    async fn send(&self, request: RequestBuilder) -> SyncResult<Response> {
        let response = self.authed(request).send().await.map_err(|e| {
            if e.is_connect() {
                SyncError::Connectivity {
                    url: self.url.clone(),
                    details: e.to_string(),
                }
            } else if e.is_timeout() {
                SyncError::Connectivity {
                    url: self.url.clone(),
                    details: "request timed out".to_string(),
                }
            } else {
                SyncError::Http(e)
            }
        })?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(SyncError::Auth {
                url: self.url.clone(),
                status: status.as_u16(),
            });
        }
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(SyncError::Protocol(format!(
                "{} returned {}: {}",
                self.url, status, body
            )));
        }
        Ok(response)
    }

    async fn json<T: serde::de::DeserializeOwned>(&self, request: RequestBuilder) -> SyncResult<T> {
        let response = self.send(request).await?;
        response
            .json()
            .await
            .map_err(|e| SyncError::Protocol(format!("Failed to parse response: {}", e)))
    }
}

#[derive(Deserialize)]
struct ChangesResponse {
    results: Vec<ChangeRow>,
    #[serde(default)]
    last_seq: Value,
}

#[derive(Deserialize)]
struct ChangeRow {
    seq: Value,
    id: String,
    changes: Vec<ChangeRev>,
    #[serde(default)]
    deleted: bool,
}

#[derive(Deserialize)]
struct ChangeRev {
    rev: String,
}

#[derive(Deserialize)]
struct BulkGetResponse {
    results: Vec<BulkGetResult>,
}

#[derive(Deserialize)]
struct BulkGetResult {
    docs: Vec<BulkGetDoc>,
}

#[derive(Deserialize)]
struct BulkGetDoc {
    ok: Option<Document>,
    error: Option<Value>,
}

#[derive(Deserialize)]
struct RevsDiffEntry {
    #[serde(default)]
    missing: Vec<String>,
}

#[async_trait]
impl RemoteStore for CouchRemote {
    fn url(&self) -> &str {
        &self.url
    }

    async fn info(&self) -> SyncResult<RemoteInfo> {
        debug!("GET {}", self.url);
        self.json(self.client.get(self.base_url.clone())).await
    }

    async fn changes(&self, since: &str, limit: usize) -> SyncResult<ChangesBatch> {
        let mut url = self.endpoint("_changes")?;
        url.query_pairs_mut()
            .append_pair("since", since)
            .append_pair("limit", &limit.to_string())
            .append_pair("style", "main_only");
        debug!(since, limit, "Fetching remote changes");

        let response: ChangesResponse = self.json(self.client.get(url)).await?;
        let last_seq = match &response.last_seq {
            Value::Null => since.to_string(),
            seq => seq_to_string(seq),
        };
        let results = response
            .results
            .into_iter()
            .filter_map(|row| {
                let rev = row.changes.into_iter().next()?.rev;
                Some(RemoteChange {
                    seq: seq_to_string(&row.seq),
                    id: row.id,
                    rev,
                    deleted: row.deleted,
                })
            })
            .collect();

        Ok(ChangesBatch { results, last_seq })
    }

    async fn bulk_get(&self, revs: &[(String, String)]) -> SyncResult<Vec<RemoteDoc>> {
        if revs.is_empty() {
            return Ok(Vec::new());
        }
        let mut url = self.endpoint("_bulk_get")?;
        url.query_pairs_mut().append_pair("revs", "true");
        let body = json!({
            "docs": revs
                .iter()
                .map(|(id, rev)| json!({ "id": id, "rev": rev }))
                .collect::<Vec<_>>()
        });

        let response: BulkGetResponse = self.json(self.client.post(url).json(&body)).await?;
        let mut docs = Vec::new();
        for result in response.results {
            for entry in result.docs {
                match (entry.ok, entry.error) {
                    (Some(doc), _) => {
                        let id = doc.id.clone();
                        let remote = RemoteDoc::from_wire(doc).ok_or_else(|| {
                            SyncError::Protocol(format!("Document '{}' has no revision", id))
                        })?;
                        docs.push(remote);
                    }
                    (None, Some(error)) => {
                        debug!(%error, "Remote could not return revision");
                    }
                    (None, None) => {}
                }
            }
        }
        Ok(docs)
    }

    async fn revs_diff(&self, revs: &RevsMap) -> SyncResult<RevsMap> {
        if revs.is_empty() {
            return Ok(RevsMap::new());
        }
        let url = self.endpoint("_revs_diff")?;
        let response: BTreeMap<String, RevsDiffEntry> =
            self.json(self.client.post(url).json(revs)).await?;
        Ok(response
            .into_iter()
            .filter(|(_, entry)| !entry.missing.is_empty())
            .map(|(id, entry)| (id, entry.missing))
            .collect())
    }

    async fn bulk_docs(&self, docs: &[RemoteDoc]) -> SyncResult<()> {
        if docs.is_empty() {
            return Ok(());
        }
        let url = self.endpoint("_bulk_docs")?;
        let docs = docs
            .iter()
            .map(RemoteDoc::to_wire)
            .collect::<SyncResult<Vec<_>>>()?;
        let body = json!({ "docs": docs, "new_edits": false });

        let results: Vec<Value> = self.json(self.client.post(url).json(&body)).await?;
        if let Some(failed) = results.iter().find(|r| r.get("error").is_some()) {
            return Err(SyncError::Protocol(format!("bulk_docs rejected a revision: {}", failed)));
        }
        Ok(())
    }
}
