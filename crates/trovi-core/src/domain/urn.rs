//! Content URNs: `urn:trovi:contents:<backend-name>:<content-id>`.
//!
//! The content id is everything after the fourth colon, so ids that contain
//! colons themselves (git remotes such as `https://host/repo@ref`) survive a
//! round trip.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::errors::UrnError;

pub const CONTENTS_URN_PREFIX: &str = "urn:trovi:contents:";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContentUrn {
    backend: String,
    content_id: String,
}

impl ContentUrn {
    pub fn new(backend: impl Into<String>, content_id: impl Into<String>) -> Self {
        Self {
            backend: backend.into(),
            content_id: content_id.into(),
        }
    }

    pub fn backend(&self) -> &str {
        &self.backend
    }

    pub fn content_id(&self) -> &str {
        &self.content_id
    }
}

impl fmt::Display for ContentUrn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}:{}", CONTENTS_URN_PREFIX, self.backend, self.content_id)
    }
}

impl FromStr for ContentUrn {
    type Err = UrnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s
            .strip_prefix(CONTENTS_URN_PREFIX)
            .ok_or_else(|| UrnError::Prefix(s.to_string()))?;
        let (backend, content_id) = rest
            .split_once(':')
            .ok_or_else(|| UrnError::Malformed(s.to_string()))?;
        if backend.is_empty() || content_id.is_empty() {
            return Err(UrnError::Malformed(s.to_string()));
        }
        Ok(Self::new(backend, content_id))
    }
}

impl Serialize for ContentUrn {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ContentUrn {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}
