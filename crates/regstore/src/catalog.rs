//! Repository and tag listings.

use std::path::PathBuf;

use log::warn;
use serde::Serialize;

use crate::{
    blob::read_dir_names,
    error::Result,
    layout::{Layout, RepositoryName, BLOBS_DIR},
    manifest::ManifestStore,
};

/// Tags of one repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TagList {
    /// Repository name.
    pub name: String,
    /// Whether the repository was ever created.
    #[serde(skip)]
    pub exists: bool,
    /// Tags in lexical order.
    pub tags: Vec<String>,
}

/// Read-only listings over a storage root.
#[derive(Debug, Clone)]
pub struct Catalog {
    layout: Layout,
    manifests: ManifestStore,
}

impl Catalog {
    /// A catalog over `layout`, reading tags through `manifests`.
    pub fn new(layout: Layout, manifests: ManifestStore) -> Self {
        Self { layout, manifests }
    }

    /// Every materialized repository in lexical order.
    ///
    /// Repositories nest (`library` and `library/alpine` may both exist), so
    /// the walk descends into every directory that is not internal to a
    /// namespace.
    pub async fn repositories(&self) -> Result<Vec<RepositoryName>> {
        let base = self.layout.repositories_dir();
        let mut found = Vec::new();
        let mut pending: Vec<(PathBuf, String)> = vec![(base, String::new())];

        while let Some((dir, prefix)) = pending.pop() {
            let names = read_dir_names(&dir).await?;
            if !prefix.is_empty() && names.iter().any(|n| n == BLOBS_DIR) {
                match RepositoryName::parse(&prefix) {
                    Ok(name) => found.push(name),
                    Err(_) => warn!("ignoring invalid repository directory {}", dir.display()),
                }
            }
            for name in names {
                if name.starts_with('_') || name.starts_with('.') {
                    continue;
                }
                let path = dir.join(&name);
                if !tokio::fs::metadata(&path).await.is_ok_and(|m| m.is_dir()) {
                    continue;
                }
                let child = if prefix.is_empty() {
                    name
                } else {
                    format!("{prefix}/{name}")
                };
                pending.push((path, child));
            }
        }

        found.sort();
        Ok(found)
    }

    /// One page of [`Self::repositories`]: at most `n` names sorting strictly
    /// after `last`.
    pub async fn repositories_page(
        &self,
        n: usize,
        last: Option<&str>,
    ) -> Result<Vec<RepositoryName>> {
        Ok(self
            .repositories()
            .await?
            .into_iter()
            .filter(|name| last.is_none_or(|last| name.as_str() > last))
            .take(n)
            .collect())
    }

    /// The tags of a repository. An unknown repository has no tags and
    /// `exists` set to false.
    pub async fn tags(&self, repo: &RepositoryName) -> Result<TagList> {
        let exists = self.layout.existing(repo).await?.is_some();
        let tags = if exists {
            self.manifests.tags(repo).await?
        } else {
            Vec::new()
        };
        Ok(TagList {
            name: repo.to_string(),
            exists,
            tags,
        })
    }
}
