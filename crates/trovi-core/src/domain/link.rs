//! Download links: one way a client may fetch stored content.
//!
//! The serialized shape is the wire contract for content retrieval:
//! `{"protocol": "http", "url", "exp", "headers", "method"}` or
//! `{"protocol": "git", "remote", "ref", "exp", "env"}` where `exp` is a unix
//! timestamp in seconds.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "protocol", rename_all = "lowercase")]
pub enum DownloadLink {
    Http(HttpLink),
    Git(GitLink),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpLink {
    pub url: String,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub exp: DateTime<Utc>,
    /// Headers that must accompany requests to `url`.
    pub headers: BTreeMap<String, String>,
    pub method: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitLink {
    pub remote: String,
    #[serde(rename = "ref")]
    pub reference: String,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub exp: DateTime<Utc>,
    /// Environment to source before running git against `remote`.
    pub env: BTreeMap<String, String>,
}

impl DownloadLink {
    /// Plain `GET` with no extra headers.
    pub fn http_get(url: impl Into<String>, exp: DateTime<Utc>) -> Self {
        Self::Http(HttpLink {
            url: url.into(),
            exp,
            headers: BTreeMap::new(),
            method: "GET".to_string(),
        })
    }

    pub fn git(remote: impl Into<String>, reference: impl Into<String>, exp: DateTime<Utc>) -> Self {
        Self::Git(GitLink {
            remote: remote.into(),
            reference: reference.into(),
            exp,
            env: BTreeMap::new(),
        })
    }

    pub fn protocol(&self) -> &'static str {
        match self {
            Self::Http(_) => "http",
            Self::Git(_) => "git",
        }
    }

    pub fn exp(&self) -> DateTime<Utc> {
        match self {
            Self::Http(link) => link.exp,
            Self::Git(link) => link.exp,
        }
    }
}
