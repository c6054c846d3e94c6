//! Contents description - URN から download 方法の一覧を組み立てる

use serde::Serialize;

use crate::backends::BackendRegistry;
use crate::domain::{ContentUrn, DownloadLink, RequestError};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContentsRef {
    pub urn: ContentUrn,
}

/// `{ "contents": { "urn": … }, "access_methods": [ … ] }`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContentsView {
    pub contents: ContentsRef,
    pub access_methods: Vec<DownloadLink>,
}

pub async fn describe_contents(
    backends: &BackendRegistry,
    urn: &ContentUrn,
) -> Result<ContentsView, RequestError> {
    let backend = backends.resolve_urn(urn)?;
    let access_methods = backend.get_links().await?;
    tracing::debug!(urn = %urn, links = access_methods.len(), "described contents");
    Ok(ContentsView {
        contents: ContentsRef { urn: urn.clone() },
        access_methods,
    })
}
