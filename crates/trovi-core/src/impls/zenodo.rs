//! ZenodoClient - Zenodo deposition API over HTTP.
//!
//! Endpoints (relative to `{base_url}/api/`):
//! - `records/{id}`
//! - `deposit/depositions`
//! - `deposit/depositions/{id}`
//! - `deposit/depositions/{id}/files[/{file_id}]`
//! - `deposit/depositions/{id}/actions/{newversion,publish}`
//!
//! File contents go to the deposition bucket (`PUT {bucket}/{filename}`) so the
//! body can be streamed.

use async_trait::async_trait;
use futures::TryStreamExt;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde_json::Value;

use crate::domain::RemoteError;
use crate::ports::{ByteStream, Deposition, DepositionClient, DepositionFile, DepositionMetadata};

async fn check(response: Response) -> Result<Response, RemoteError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let url = response.url().to_string();
    let body = response.text().await.unwrap_or_default();
    tracing::error!(status = status.as_u16(), url = %url, body = %body, "zenodo request failed");
    Err(RemoteError::Status {
        status: status.as_u16(),
        url,
        body,
    })
}

/// Zenodo ids are numbers in JSON but strings everywhere else.
fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::Number(n) => Some(n.to_string()),
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        _ => None,
    }
}

/// Last path segment of a link such as `https://zenodo.org/api/records/123`.
fn link_tail(body: &Value, link: &str) -> Result<String, RemoteError> {
    body.pointer(&format!("/links/{link}"))
        .and_then(Value::as_str)
        .and_then(|url| url.trim_end_matches('/').rsplit('/').next())
        .filter(|tail| !tail.is_empty())
        .map(str::to_string)
        .ok_or_else(|| RemoteError::Malformed(format!("response has no links.{link}")))
}

fn parse_files(body: &Value) -> Result<Vec<DepositionFile>, RemoteError> {
    match body.get("files") {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(files) => serde_json::from_value(files.clone())
            .map_err(|e| RemoteError::Malformed(format!("files: {e}"))),
    }
}

fn parse_deposition(body: &Value) -> Result<Deposition, RemoteError> {
    let id = body
        .get("id")
        .and_then(id_string)
        .ok_or_else(|| RemoteError::Malformed("deposition without id".to_string()))?;
    let bucket_url = body
        .pointer("/links/bucket")
        .and_then(Value::as_str)
        .ok_or_else(|| RemoteError::Malformed(format!("deposition {id} has no bucket link")))?
        .to_string();
    Ok(Deposition {
        id,
        bucket_url,
        files: parse_files(body)?,
    })
}

pub struct ZenodoClient {
    http: reqwest::Client,
    base_url: String,
    access_token: Option<String>,
}

impl ZenodoClient {
    pub fn new(base_url: impl Into<String>, access_token: Option<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            access_token,
        }
    }

    fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.access_token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    fn api(&self, method: Method, path: &str) -> RequestBuilder {
        self.authorized(
            self.http
                .request(method, format!("{}/api/{path}", self.base_url))
                .header(ACCEPT, "application/json"),
        )
    }

    async fn send_json(&self, builder: RequestBuilder) -> Result<Value, RemoteError> {
        let response = check(builder.send().await?).await?;
        if response.status() == StatusCode::NO_CONTENT {
            return Ok(Value::Null);
        }
        Ok(response.json().await?)
    }

    fn public_file_url(&self, record: &str, filename: &str) -> String {
        format!("{}/records/{record}/files/{filename}?download=1", self.base_url)
    }
}

#[async_trait]
impl DepositionClient for ZenodoClient {
    fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn create_deposition(&self, metadata: &DepositionMetadata) -> Result<Deposition, RemoteError> {
        let body = self
            .send_json(self.api(Method::POST, "deposit/depositions").json(&metadata.to_payload()))
            .await?;
        parse_deposition(&body)
    }

    async fn latest_record(&self, record: &str) -> Result<String, RemoteError> {
        let body = self
            .send_json(self.api(Method::GET, &format!("records/{record}")))
            .await?;
        link_tail(&body, "latest")
    }

    async fn new_version(&self, record: &str) -> Result<Deposition, RemoteError> {
        let body = self
            .send_json(self.api(Method::POST, &format!("deposit/depositions/{record}/actions/newversion")))
            .await?;
        let draft = link_tail(&body, "latest_draft")?;
        let body = self
            .send_json(self.api(Method::GET, &format!("deposit/depositions/{draft}")))
            .await?;
        parse_deposition(&body)
    }

    async fn update_metadata(
        &self,
        deposition_id: &str,
        metadata: &DepositionMetadata,
    ) -> Result<Deposition, RemoteError> {
        let body = self
            .send_json(
                self.api(Method::PUT, &format!("deposit/depositions/{deposition_id}"))
                    .json(&metadata.to_payload()),
            )
            .await?;
        tracing::debug!(deposition_id, "updated deposition metadata");
        parse_deposition(&body)
    }

    async fn delete_file(&self, deposition_id: &str, file_id: &str) -> Result<(), RemoteError> {
        self.send_json(self.api(
            Method::DELETE,
            &format!("deposit/depositions/{deposition_id}/files/{file_id}"),
        ))
        .await?;
        Ok(())
    }

    async fn upload(&self, deposition: &Deposition, filename: &str, body: ByteStream) -> Result<(), RemoteError> {
        let url = format!("{}/{filename}", deposition.bucket_url.trim_end_matches('/'));
        let request = self.authorized(
            self.http
                .put(url)
                .header(CONTENT_TYPE, "application/octet-stream")
                .body(reqwest::Body::wrap_stream(body)),
        );
        check(request.send().await?).await?;
        tracing::debug!(deposition_id = %deposition.id, filename, "uploaded deposition file");
        Ok(())
    }

    async fn publish(&self, deposition_id: &str) -> Result<String, RemoteError> {
        let body = self
            .send_json(self.api(
                Method::POST,
                &format!("deposit/depositions/{deposition_id}/actions/publish"),
            ))
            .await?;
        body.get("doi")
            .and_then(Value::as_str)
            .filter(|doi| !doi.is_empty())
            .map(str::to_string)
            .ok_or_else(|| RemoteError::Malformed(format!("published deposition {deposition_id} has no doi")))
    }

    async fn record_files(&self, record: &str) -> Result<Vec<DepositionFile>, RemoteError> {
        let body = self
            .send_json(self.api(Method::GET, &format!("deposit/depositions/{record}/files")))
            .await?;
        match body {
            Value::Array(_) => serde_json::from_value(body)
                .map_err(|e| RemoteError::Malformed(format!("files: {e}"))),
            other => parse_files(&other),
        }
    }

    async fn file_exists(&self, record: &str, filename: &str) -> Result<bool, RemoteError> {
        let response = self
            .http
            .head(self.public_file_url(record, filename))
            .send()
            .await?;
        Ok(response.status().is_success())
    }

    async fn download(&self, record: &str, filename: &str) -> Result<ByteStream, RemoteError> {
        let response = self
            .authorized(self.http.get(self.public_file_url(record, filename)))
            .send()
            .await?;
        let response = check(response).await?;
        Ok(Box::pin(response.bytes_stream().map_err(std::io::Error::other)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_deposition_with_numeric_id() {
        let body = json!({
            "id": 1234,
            "links": {"bucket": "https://zenodo.org/api/files/abc"},
            "files": [{"id": "f1", "filename": "archive.tar.gz", "filesize": 42}],
        });
        let deposition = parse_deposition(&body).unwrap();
        assert_eq!(deposition.id, "1234");
        assert_eq!(deposition.bucket_url, "https://zenodo.org/api/files/abc");
        assert_eq!(deposition.files[0].filesize, 42);
    }

    #[test]
    fn link_tail_takes_last_segment() {
        let body = json!({"links": {"latest": "https://zenodo.org/api/records/777"}});
        assert_eq!(link_tail(&body, "latest").unwrap(), "777");
        assert!(matches!(link_tail(&body, "latest_draft"), Err(RemoteError::Malformed(_))));
    }

    #[test]
    fn deposition_without_bucket_is_malformed() {
        let body = json!({"id": "5", "links": {}});
        assert!(matches!(parse_deposition(&body), Err(RemoteError::Malformed(_))));
    }
}
