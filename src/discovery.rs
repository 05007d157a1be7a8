//! Repository discovery abstraction layer
//!
//! This module provides a provider-agnostic interface for enumerating the
//! repositories owned by a set of owner scopes. The GitHub implementation
//! lives in [`crate::github`]; the pipeline only depends on the [`Discovery`]
//! trait.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::fmt;

/// A single remote repository, identified by its web URL
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RepositoryRef {
    pub url: String,
}

impl RepositoryRef {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    /// Path segments following the host, e.g. `["octocat", "hello-world"]`.
    /// For `file://` URLs the first segment is part of the local path.
    fn path_segments(&self) -> Vec<&str> {
        let without_scheme = self
            .url
            .split_once("://")
            .map(|(_, rest)| rest)
            .unwrap_or(&self.url);

        without_scheme
            .split('/')
            .skip(1)
            .filter(|segment| !segment.is_empty())
            .collect()
    }

    /// URL scheme, `https` when the URL has none
    pub fn scheme(&self) -> &str {
        self.url
            .split_once("://")
            .map(|(scheme, _)| scheme)
            .unwrap_or("https")
    }

    /// Host segment of the URL
    pub fn host(&self) -> &str {
        let without_scheme = self
            .url
            .split_once("://")
            .map(|(_, rest)| rest)
            .unwrap_or(&self.url);
        without_scheme.split('/').next().unwrap_or_default()
    }

    /// The trailing `owner/name` pair of the URL path
    fn owner_and_name(&self) -> Result<(&str, &str)> {
        let segments = self.path_segments();
        match segments.as_slice() {
            [.., owner, name] => {
                let (owner, name): (&str, &str) = (*owner, *name);
                Ok((owner, name.strip_suffix(".git").unwrap_or(name)))
            }
            _ => anyhow::bail!("Repository URL has no owner/name path: {}", self.url),
        }
    }

    /// Owner (user or organization) segment
    pub fn owner(&self) -> Result<&str> {
        self.owner_and_name().map(|(owner, _)| owner)
    }

    /// Repository name with any trailing `.git` removed
    pub fn name(&self) -> Result<&str> {
        self.owner_and_name().map(|(_, name)| name)
    }

    /// Display name (owner/name format)
    pub fn full_name(&self) -> String {
        match (self.owner(), self.name()) {
            (Ok(owner), Ok(name)) => format!("{}/{}", owner, name),
            _ => self.url.clone(),
        }
    }
}

impl fmt::Display for RepositoryRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.url)
    }
}

/// An account whose repositories are enumerated
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OwnerScope {
    User(String),
    Organization(String),
}

impl OwnerScope {
    pub fn login(&self) -> &str {
        match self {
            OwnerScope::User(login) | OwnerScope::Organization(login) => login,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            OwnerScope::User(_) => "user",
            OwnerScope::Organization(_) => "organization",
        }
    }
}

impl fmt::Display for OwnerScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind(), self.login())
    }
}

/// Trait for repository discovery from various providers
#[async_trait]
pub trait Discovery: Send + Sync {
    /// Repositories owned by `scope`, in provider order
    async fn discover(&self, scope: &OwnerScope) -> Result<Vec<RepositoryRef>>;

    /// Provider name for display/logging
    fn provider_name(&self) -> &'static str;
}

/// Enumerate every scope and concatenate the results.
///
/// The first failing scope aborts the enumeration; no partial list is
/// returned. Repositories reachable through several scopes are kept twice.
pub async fn discover_all(
    source: &dyn Discovery,
    scopes: &[OwnerScope],
) -> Result<Vec<RepositoryRef>> {
    let mut all_repos = Vec::new();

    for scope in scopes {
        let repos = source.discover(scope).await.with_context(|| {
            format!(
                "Failed to enumerate repositories for {} via {}",
                scope,
                source.provider_name()
            )
        })?;

        tracing::info!(
            "Discovered {} repositories for {} from {}",
            repos.len(),
            scope,
            source.provider_name()
        );
        all_repos.extend(repos);
    }

    Ok(all_repos)
}
