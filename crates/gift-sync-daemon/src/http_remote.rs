//! RemoteStore over a REST document API.
//!
//! Documents live at `{base}/users/{user}/{collection}/{id}`:
//! - create: `PUT` with `If-None-Match: *` (fails with 409/412 if present)
//! - update: `PUT`
//! - delete: `DELETE`
//! - list: `GET {base}/users/{user}/{collection}` returning `{"documents": [...]}`

use anyhow::{Context, bail};
use async_trait::async_trait;
use gift_sync_core::remote::Result;
use gift_sync_core::{
    Entity, EntityType, RemoteError, RemoteStore, decode_document, encode_document,
};
use reqwest::header::IF_NONE_MATCH;
use reqwest::{Client, RequestBuilder, Response, StatusCode, Url};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Deserialize)]
struct DocumentList {
    #[serde(default)]
    documents: Vec<Value>,
}

pub struct HttpRemoteStore {
    client: Client,
    base_url: Url,
    api_token: Option<String>,
}

impl HttpRemoteStore {
    pub fn new(
        base_url: &str,
        api_token: Option<String>,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let base_url =
            Url::parse(base_url).with_context(|| format!("Invalid base URL: {}", base_url))?;
        if base_url.cannot_be_a_base() {
            bail!("Base URL cannot carry a path: {}", base_url);
        }
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            base_url,
            api_token,
        })
    }

    fn collection_url(&self, user_id: &str, entity_type: EntityType) -> Result<Url> {
        self.url(&["users", user_id, entity_type.collection()])
    }

    fn document_url(&self, user_id: &str, entity_type: EntityType, id: &str) -> Result<Url> {
        self.url(&["users", user_id, entity_type.collection(), id])
    }

    fn url(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| RemoteError::Network(format!("Invalid base URL: {}", self.base_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response> {
        let request = match &self.api_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        };
        let response = request.send().await.map_err(transport_error)?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(status_error(status, body))
    }

    async fn put(&self, user_id: &str, entity: &Entity, create: bool) -> Result<()> {
        let url = self.document_url(user_id, entity.entity_type(), entity.id())?;
        let document = encode_document(entity).map_err(|e| RemoteError::Rejected(e.to_string()))?;

        let mut request = self.client.put(url).json(&document);
        if create {
            request = request.header(IF_NONE_MATCH, "*");
        }
        self.send(request).await?;
        Ok(())
    }
}

#[async_trait]
impl RemoteStore for HttpRemoteStore {
    async fn create(&self, user_id: &str, entity: &Entity) -> Result<()> {
        self.put(user_id, entity, true).await
    }

    async fn update(&self, user_id: &str, entity: &Entity) -> Result<()> {
        self.put(user_id, entity, false).await
    }

    async fn delete(&self, user_id: &str, entity_type: EntityType, id: &str) -> Result<()> {
        let url = self.document_url(user_id, entity_type, id)?;
        self.send(self.client.delete(url)).await?;
        Ok(())
    }

    async fn get_all(&self, user_id: &str, entity_type: EntityType) -> Result<Vec<Entity>> {
        let url = self.collection_url(user_id, entity_type)?;
        let response = self.send(self.client.get(url)).await?;
        let list: DocumentList = response.json().await.map_err(transport_error)?;

        let mut entities = Vec::with_capacity(list.documents.len());
        for document in list.documents {
            match decode_document(entity_type, document) {
                Ok(entity) => entities.push(entity),
                // One bad document must not block the rest of the collection
                Err(e) => warn!("Skipping undecodable {} document: {}", entity_type, e),
            }
        }
        debug!("Fetched {} {} document(s)", entities.len(), entity_type);
        Ok(entities)
    }
}

fn transport_error(e: reqwest::Error) -> RemoteError {
    if e.is_timeout() {
        RemoteError::Timeout
    } else {
        RemoteError::Network(e.to_string())
    }
}

/// Map a non-success HTTP status to a remote error.
pub fn status_error(status: StatusCode, body: String) -> RemoteError {
    let detail = if body.is_empty() {
        status.to_string()
    } else {
        format!("{}: {}", status, body)
    };
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => RemoteError::PermissionDenied(detail),
        StatusCode::NOT_FOUND => RemoteError::NotFound(detail),
        StatusCode::CONFLICT | StatusCode::PRECONDITION_FAILED => {
            RemoteError::AlreadyExists(detail)
        }
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => {
            RemoteError::Unavailable(detail)
        }
        s if s.is_server_error() => RemoteError::Unavailable(detail),
        _ => RemoteError::Rejected(detail),
    }
}
