//! Tag & manifest lister (spec §4.B): loops the client's one-page calls to
//! exhaustion. An empty repository yields an empty list; a 404 on the very
//! first page means the repository doesn't exist and is skipped by the
//! caller rather than treated as a hard failure.

use crate::client::RegistryClient;
use crate::error::Result;
use crate::models::{Manifest, Tag};

pub async fn list_all_tags(client: &RegistryClient, repository: &str) -> Result<Vec<Tag>> {
    let mut all = Vec::new();
    let mut page_token: Option<String> = None;
    loop {
        let (page, next) = client.list_tags(repository, page_token.as_deref()).await?;
        all.extend(page);
        match next {
            Some(token) => page_token = Some(token),
            None => break,
        }
    }
    Ok(all)
}

pub async fn list_all_manifests(client: &RegistryClient, repository: &str) -> Result<Vec<Manifest>> {
    let mut all = Vec::new();
    let mut page_token: Option<String> = None;
    loop {
        let (page, next) = client
            .list_manifests(repository, page_token.as_deref())
            .await?;
        all.extend(page);
        match next {
            Some(token) => page_token = Some(token),
            None => break,
        }
    }
    Ok(all)
}

pub async fn list_all_repositories(client: &RegistryClient) -> Result<Vec<String>> {
    let mut all = Vec::new();
    let mut page_token: Option<String> = None;
    loop {
        let (page, next) = client.list_repositories(page_token.as_deref()).await?;
        all.extend(page);
        match next {
            Some(token) => page_token = Some(token),
            None => break,
        }
    }
    Ok(all)
}
