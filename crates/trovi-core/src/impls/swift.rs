//! SwiftClient - Keystone v3 認証つきの OpenStack Swift クライアント
//!
//! # フロー
//! 1. 最初のリクエストで Keystone に password 認証（`POST {auth_url}/auth/tokens`）
//! 2. `X-Subject-Token` と service catalog の object-store public endpoint をキャッシュ
//! 3. 以降のリクエストは `{endpoint}{path}` に `X-Auth-Token` を付けて送る
//!
//! token は `expires_at` の `TOKEN_REFRESH_MARGIN_SECS` 秒前までキャッシュし、それ以降は
//! 再認証する。Swift が 401 を返したときも一度だけ再認証して送り直す。
//! Keystone への接続失敗は `auth_retry_attempts` 回まで再試行する。

use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, TimeDelta, Utc};
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE, RANGE};
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::RwLock;

use crate::domain::RemoteError;
use crate::ports::{Clock, ObjectMeta, ObjectStoreClient};

const OBJECT_MANIFEST: &str = "X-Object-Manifest";
const AUTH_TOKEN: &str = "X-Auth-Token";
const SUBJECT_TOKEN: &str = "X-Subject-Token";

/// A token this close to expiry is replaced before use.
const TOKEN_REFRESH_MARGIN_SECS: i64 = 300;

#[derive(Debug, Clone)]
pub struct SwiftCredentials {
    pub auth_url: String,
    pub username: String,
    pub user_domain_name: String,
    pub password: String,
    pub project_name: String,
    pub project_domain_name: String,
    pub region_name: Option<String>,
}

#[derive(Debug, Clone)]
struct Session {
    token: String,
    endpoint: String,
    expires_at: Option<DateTime<Utc>>,
}

impl Session {
    fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        self.expires_at
            .is_none_or(|expires_at| now + TimeDelta::seconds(TOKEN_REFRESH_MARGIN_SECS) < expires_at)
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    token: TokenBody,
}

#[derive(Deserialize)]
struct TokenBody {
    #[serde(default)]
    expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    catalog: Vec<CatalogEntry>,
}

#[derive(Deserialize)]
struct CatalogEntry {
    #[serde(rename = "type")]
    service_type: String,
    endpoints: Vec<CatalogEndpoint>,
}

#[derive(Deserialize)]
struct CatalogEndpoint {
    interface: String,
    #[serde(default)]
    region: Option<String>,
    #[serde(default)]
    region_id: Option<String>,
    url: String,
}

/// Picks the public object-store endpoint, optionally restricted to a region.
fn object_store_endpoint(catalog: &[CatalogEntry], region: Option<&str>) -> Option<String> {
    catalog
        .iter()
        .filter(|entry| entry.service_type == "object-store")
        .flat_map(|entry| entry.endpoints.iter())
        .filter(|ep| ep.interface == "public")
        .find(|ep| {
            region.is_none_or(|r| ep.region.as_deref() == Some(r) || ep.region_id.as_deref() == Some(r))
        })
        .map(|ep| ep.url.trim_end_matches('/').to_string())
}

async fn check(response: Response) -> Result<Response, RemoteError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let url = response.url().to_string();
    let body = response.text().await.unwrap_or_default();
    Err(RemoteError::Status {
        status: status.as_u16(),
        url,
        body,
    })
}

pub struct SwiftClient {
    http: reqwest::Client,
    credentials: SwiftCredentials,
    auth_retry_attempts: u32,
    clock: Arc<dyn Clock>,
    session: RwLock<Option<Session>>,
}

impl SwiftClient {
    pub fn new(credentials: SwiftCredentials, auth_retry_attempts: u32, clock: Arc<dyn Clock>) -> Self {
        Self {
            http: reqwest::Client::new(),
            credentials,
            auth_retry_attempts,
            clock,
            session: RwLock::new(None),
        }
    }

    /// Cached session, re-authenticating when it is missing or about to expire.
    async fn session(&self) -> Result<Session, RemoteError> {
        if let Some(session) = self.session.read().await.as_ref() {
            if session.is_fresh(self.clock.now()) {
                return Ok(session.clone());
            }
        }

        let mut cached = self.session.write().await;
        if let Some(session) = cached.as_ref() {
            if session.is_fresh(self.clock.now()) {
                return Ok(session.clone());
            }
        }
        let session = self.authenticate().await?;
        *cached = Some(session.clone());
        Ok(session)
    }

    /// Replaces `rejected` unless another request already did.
    async fn reauthenticate(&self, rejected: &Session) -> Result<Session, RemoteError> {
        let mut cached = self.session.write().await;
        if let Some(session) = cached.as_ref() {
            if session.token != rejected.token {
                return Ok(session.clone());
            }
        }
        let session = self.authenticate().await?;
        *cached = Some(session.clone());
        Ok(session)
    }

    async fn authenticate(&self) -> Result<Session, RemoteError> {
        let c = &self.credentials;
        let url = format!("{}/auth/tokens", c.auth_url.trim_end_matches('/'));
        let body = json!({
            "auth": {
                "identity": {
                    "methods": ["password"],
                    "password": {
                        "user": {
                            "name": c.username,
                            "domain": {"name": c.user_domain_name},
                            "password": c.password,
                        }
                    }
                },
                "scope": {
                    "project": {
                        "name": c.project_name,
                        "domain": {"name": c.project_domain_name},
                    }
                }
            }
        });

        let mut attempt = 0;
        let response = loop {
            match self.http.post(&url).json(&body).send().await {
                Ok(response) => break response,
                Err(err) if err.is_connect() && attempt < self.auth_retry_attempts => {
                    attempt += 1;
                    tracing::warn!(attempt, error = %err, "keystone connect failed, retrying");
                    tokio::time::sleep(Duration::from_millis(500 * u64::from(attempt))).await;
                }
                Err(err) => return Err(err.into()),
            }
        };
        let response = check(response)
            .await
            .map_err(|e| RemoteError::Auth(e.to_string()))?;

        let token = response
            .headers()
            .get(SUBJECT_TOKEN)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| RemoteError::Auth(format!("{SUBJECT_TOKEN} missing from keystone response")))?
            .to_string();
        let parsed: TokenResponse = response.json().await?;
        let endpoint = object_store_endpoint(&parsed.token.catalog, c.region_name.as_deref())
            .ok_or_else(|| RemoteError::Auth("no public object-store endpoint in catalog".to_string()))?;

        tracing::info!(endpoint = %endpoint, expires_at = ?parsed.token.expires_at, "authenticated with keystone");
        Ok(Session {
            token,
            endpoint,
            expires_at: parsed.token.expires_at,
        })
    }

    /// Sends a request built by `build` for `path`. A 401 drops the token
    /// and the request is sent once more with a new one.
    async fn send<F>(&self, method: reqwest::Method, path: &str, build: F) -> Result<Response, RemoteError>
    where
        F: Fn(RequestBuilder) -> RequestBuilder,
    {
        let request = |session: &Session| {
            build(
                self.http
                    .request(method.clone(), format!("{}{path}", session.endpoint))
                    .header(AUTH_TOKEN, &session.token),
            )
        };

        let session = self.session().await?;
        let response = request(&session).send().await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        tracing::info!(path, "object store rejected token, re-authenticating");
        let session = self.reauthenticate(&session).await?;
        Ok(request(&session).send().await?)
    }
}

#[async_trait]
impl ObjectStoreClient for SwiftClient {
    async fn endpoint(&self) -> Result<String, RemoteError> {
        Ok(self.session().await?.endpoint.clone())
    }

    async fn head(&self, path: &str) -> Result<Option<ObjectMeta>, RemoteError> {
        let response = self.send(reqwest::Method::HEAD, path, |r| r).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = check(response).await?;
        let headers = response.headers();
        let content_length = headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let manifest = headers
            .get(OBJECT_MANIFEST)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        Ok(Some(ObjectMeta {
            content_length,
            manifest,
        }))
    }

    async fn put(&self, path: &str, body: Bytes) -> Result<(), RemoteError> {
        let response = self
            .send(reqwest::Method::PUT, path, |r| {
                r.header(CONTENT_TYPE, "application/octet-stream")
                    .body(body.clone())
            })
            .await?;
        check(response).await?;
        Ok(())
    }

    async fn put_manifest(
        &self,
        path: &str,
        segment_prefix: &str,
        content_type: &str,
    ) -> Result<(), RemoteError> {
        let response = self
            .send(reqwest::Method::PUT, path, |r| {
                r.header(OBJECT_MANIFEST, segment_prefix)
                    .header(CONTENT_TYPE, content_type)
                    .body(Bytes::new())
            })
            .await?;
        check(response).await?;
        Ok(())
    }

    async fn get_range(&self, path: &str, range: Range<u64>) -> Result<Bytes, RemoteError> {
        if range.is_empty() {
            return Ok(Bytes::new());
        }
        let response = self
            .send(reqwest::Method::GET, path, |r| {
                r.header(RANGE, format!("bytes={}-{}", range.start, range.end - 1))
            })
            .await?;
        Ok(check(response).await?.bytes().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rstest::rstest;

    fn catalog() -> Vec<CatalogEntry> {
        let raw = json!({
            "token": {
                "catalog": [
                    {"type": "identity", "endpoints": [
                        {"interface": "public", "region": "RegionOne", "url": "https://keystone/v3"}
                    ]},
                    {"type": "object-store", "endpoints": [
                        {"interface": "internal", "region": "RegionOne", "url": "http://internal/v1/AUTH_p"},
                        {"interface": "public", "region": "RegionOne", "url": "https://one/v1/AUTH_p"},
                        {"interface": "public", "region_id": "RegionTwo", "url": "https://two/v1/AUTH_p/"}
                    ]}
                ]
            }
        });
        serde_json::from_value::<TokenResponse>(raw).unwrap().token.catalog
    }

    #[test]
    fn picks_public_object_store_endpoint() {
        let catalog = catalog();
        assert_eq!(
            object_store_endpoint(&catalog, None).as_deref(),
            Some("https://one/v1/AUTH_p")
        );
        assert_eq!(
            object_store_endpoint(&catalog, Some("RegionTwo")).as_deref(),
            Some("https://two/v1/AUTH_p")
        );
        assert!(object_store_endpoint(&catalog, Some("Nowhere")).is_none());
    }

    #[test]
    fn token_expiry_is_parsed() {
        let raw = json!({"token": {"expires_at": "2024-01-01T12:00:00.000000Z", "catalog": []}});
        let parsed: TokenResponse = serde_json::from_value(raw).unwrap();
        assert_eq!(
            parsed.token.expires_at,
            Some(Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap())
        );
    }

    #[rstest]
    #[case::well_before_expiry(60, true)]
    #[case::inside_refresh_margin(4, false)]
    #[case::at_margin(5, false)]
    #[case::expired(-1, false)]
    fn session_freshness(#[case] minutes_left: i64, #[case] fresh: bool) {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let session = Session {
            token: "t".to_string(),
            endpoint: "https://one/v1/AUTH_p".to_string(),
            expires_at: Some(now + TimeDelta::minutes(minutes_left)),
        };
        assert_eq!(session.is_fresh(now), fresh);
    }

    #[test]
    fn session_without_expiry_stays_fresh() {
        let session = Session {
            token: "t".to_string(),
            endpoint: "https://one/v1/AUTH_p".to_string(),
            expires_at: None,
        };
        assert!(session.is_fresh(Utc::now()));
    }
}
