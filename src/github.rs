use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use octocrab::Octocrab;
use serde::Deserialize;
use serde_json::json;
use std::env;
use std::process::Command;
use tracing::{debug, info, warn};

use crate::config::{Config, GitHubConfig};
use crate::discovery::{Discovery, OwnerScope, RepositoryRef};
use crate::git::GitCredentials;

const USER_REPOSITORIES_QUERY: &str = r#"
query($login: String!, $first: Int!, $after: String) {
  owner: user(login: $login) {
    repositories(first: $first, after: $after, ownerAffiliations: OWNER) {
      nodes { url }
      pageInfo { hasNextPage endCursor }
    }
  }
}"#;

const ORGANIZATION_REPOSITORIES_QUERY: &str = r#"
query($login: String!, $first: Int!, $after: String) {
  owner: organization(login: $login) {
    repositories(first: $first, after: $after, ownerAffiliations: OWNER) {
      nodes { url }
      pageInfo { hasNextPage endCursor }
    }
  }
}"#;

/// GitHub client wrapper with authentication management
#[derive(Clone)]
pub struct GitHubClient {
    client: Octocrab,
    username: String,
    token: String,
    page_size: u32,
    max_pages: Option<u32>,
}

/// GitHub authentication strategies
#[derive(Debug, Clone)]
pub enum AuthStrategy {
    /// Use GitHub CLI authentication
    GitHubCLI,
    /// Use environment variable token
    EnvironmentToken,
}

#[derive(Debug, Deserialize)]
struct GraphQlResponse<T> {
    data: Option<T>,
    #[serde(default)]
    errors: Vec<GraphQlError>,
}

#[derive(Debug, Deserialize)]
struct GraphQlError {
    message: String,
}

#[derive(Debug, Deserialize)]
struct OwnerData {
    owner: Option<OwnerNode>,
}

#[derive(Debug, Deserialize)]
struct OwnerNode {
    repositories: RepositoryConnection,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RepositoryConnection {
    #[serde(default)]
    nodes: Vec<Option<RepositoryNode>>,
    page_info: PageInfo,
}

#[derive(Debug, Deserialize)]
struct RepositoryNode {
    url: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PageInfo {
    has_next_page: bool,
    end_cursor: Option<String>,
}

impl GraphQlResponse<OwnerData> {
    fn into_connection(self, scope: &OwnerScope) -> Result<RepositoryConnection> {
        if !self.errors.is_empty() {
            let messages: Vec<&str> = self.errors.iter().map(|e| e.message.as_str()).collect();
            bail!("GitHub GraphQL error for {}: {}", scope, messages.join("; "));
        }

        self.data
            .and_then(|data| data.owner)
            .map(|owner| owner.repositories)
            .ok_or_else(|| anyhow!("GitHub has no {} named {:?}", scope.kind(), scope.login()))
    }
}

impl GitHubClient {
    /// Create a new GitHub client with automatic authentication
    pub async fn new(config: &Config) -> Result<Self> {
        let (auth_strategy, token) = Self::detect_authentication(config)?;

        info!("Using authentication strategy: {:?}", auth_strategy);

        let mut builder = Octocrab::builder();
        if let Some(api_url) = &config.github.api_url {
            builder = builder
                .base_uri(api_url.as_str())
                .with_context(|| format!("Invalid GitHub API URL: {}", api_url))?;
        }
        let client = builder
            .personal_token(token.clone())
            .build()
            .context("Failed to create GitHub client")?;

        // Get authenticated user information
        let user = client
            .current()
            .user()
            .await
            .context("Failed to get current user information. Check your authentication.")?;

        let username = config
            .github
            .username
            .clone()
            .unwrap_or_else(|| user.login.clone());

        info!("Authenticated as GitHub user: {}", username);

        Ok(Self::with_client(client, username, token, &config.github))
    }

    /// Wrap an already configured octocrab instance
    pub fn with_client(
        client: Octocrab,
        username: impl Into<String>,
        token: impl Into<String>,
        github: &GitHubConfig,
    ) -> Self {
        Self {
            client,
            username: username.into(),
            token: token.into(),
            page_size: github.page_size.clamp(1, 100),
            max_pages: github.max_pages,
        }
    }

    /// Detect and obtain GitHub authentication
    fn detect_authentication(config: &Config) -> Result<(AuthStrategy, String)> {
        match config.github.auth_method.as_str() {
            "auto" => {
                // Try GitHub CLI first, then environment token
                if let Ok(token) = Self::try_github_cli() {
                    Ok((AuthStrategy::GitHubCLI, token))
                } else if let Ok(token) = Self::try_environment_token() {
                    Ok((AuthStrategy::EnvironmentToken, token))
                } else {
                    Err(anyhow!(
                        "No GitHub authentication found. Please either:\n\
                         1. Install and authenticate GitHub CLI: gh auth login\n\
                         2. Set GITHUB_TOKEN environment variable (or in .env)"
                    ))
                }
            }
            "gh_cli" => {
                let token = Self::try_github_cli()
                    .context("GitHub CLI authentication failed. Run: gh auth login")?;
                Ok((AuthStrategy::GitHubCLI, token))
            }
            "token" => {
                let token = Self::try_environment_token()
                    .context("GITHUB_TOKEN environment variable not found or invalid")?;
                Ok((AuthStrategy::EnvironmentToken, token))
            }
            other => Err(anyhow!("Unknown auth method: {}", other)),
        }
    }

    /// Try to get token from GitHub CLI
    fn try_github_cli() -> Result<String> {
        debug!("Attempting GitHub CLI authentication");

        if !Self::is_command_available("gh") {
            return Err(anyhow!("GitHub CLI (gh) is not installed"));
        }

        let token_output = Command::new("gh")
            .args(["auth", "token"])
            .output()
            .context("Failed to get GitHub CLI token")?;

        if !token_output.status.success() {
            return Err(anyhow!(
                "Failed to retrieve token from GitHub CLI: {}",
                String::from_utf8_lossy(&token_output.stderr)
            ));
        }

        let token = String::from_utf8(token_output.stdout)
            .context("GitHub CLI token is not valid UTF-8")?
            .trim()
            .to_string();

        if token.is_empty() {
            return Err(anyhow!("GitHub CLI returned empty token"));
        }

        debug!("Successfully obtained token from GitHub CLI");
        Ok(token)
    }

    /// Try to get token from environment variable
    fn try_environment_token() -> Result<String> {
        debug!("Attempting environment variable authentication");

        let token = env::var("GITHUB_TOKEN").context("GITHUB_TOKEN environment variable not set")?;

        if token.is_empty() {
            return Err(anyhow!("GITHUB_TOKEN is empty"));
        }

        if !["ghp_", "gho_", "ghs_", "github_pat_"]
            .iter()
            .any(|prefix| token.starts_with(prefix))
        {
            warn!("GITHUB_TOKEN doesn't look like a GitHub token (expected ghp_, gho_, ghs_ or github_pat_ prefix)");
        }

        debug!("Successfully found GITHUB_TOKEN environment variable");
        Ok(token)
    }

    /// Check if a command is available in PATH
    fn is_command_available(command: &str) -> bool {
        Command::new("which")
            .arg(command)
            .output()
            .map(|output| output.status.success())
            .unwrap_or(false)
    }

    /// Get the authenticated username
    pub fn username(&self) -> &str {
        &self.username
    }

    /// Credentials git uses to fetch private repositories
    pub fn git_credentials(&self) -> GitCredentials {
        GitCredentials::new(self.username.clone(), self.token.clone())
    }

    /// List the repositories owned by a user or organization, following
    /// GraphQL cursors until the last page or the configured page cap
    pub async fn list_repositories(&self, scope: &OwnerScope) -> Result<Vec<RepositoryRef>> {
        debug!("Fetching repositories for {}", scope);

        let query = match scope {
            OwnerScope::User(_) => USER_REPOSITORIES_QUERY,
            OwnerScope::Organization(_) => ORGANIZATION_REPOSITORIES_QUERY,
        };

        let mut repositories = Vec::new();
        let mut cursor: Option<String> = None;
        let mut page = 0u32;

        loop {
            page += 1;

            let payload = json!({
                "query": query,
                "variables": {
                    "login": scope.login(),
                    "first": self.page_size,
                    "after": cursor,
                },
            });

            let response: GraphQlResponse<OwnerData> = self
                .client
                .graphql(&payload)
                .await
                .with_context(|| format!("Failed to query repositories for {} page {}", scope, page))?;

            let connection = response.into_connection(scope)?;
            repositories.extend(
                connection
                    .nodes
                    .into_iter()
                    .flatten()
                    .map(|node| RepositoryRef::new(node.url)),
            );

            if !connection.page_info.has_next_page {
                break;
            }

            if let Some(max_pages) = self.max_pages {
                if page >= max_pages {
                    warn!(
                        "Stopping after {} page(s) for {}; more repositories exist (github.max_pages)",
                        page, scope
                    );
                    break;
                }
            }

            match connection.page_info.end_cursor {
                Some(next) => cursor = Some(next),
                None => {
                    warn!("GitHub reported another page for {} without a cursor", scope);
                    break;
                }
            }
        }

        info!("Found {} repositories for {}", repositories.len(), scope);
        Ok(repositories)
    }
}

#[async_trait]
impl Discovery for GitHubClient {
    async fn discover(&self, scope: &OwnerScope) -> Result<Vec<RepositoryRef>> {
        self.list_repositories(scope).await
    }

    fn provider_name(&self) -> &'static str {
        "GitHub"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn page(urls: &[&str], end_cursor: Option<&str>) -> serde_json::Value {
        json!({
            "data": {
                "owner": {
                    "repositories": {
                        "nodes": urls.iter().map(|url| json!({ "url": url })).collect::<Vec<_>>(),
                        "pageInfo": {
                            "hasNextPage": end_cursor.is_some(),
                            "endCursor": end_cursor,
                        }
                    }
                }
            }
        })
    }

    fn client_for(server: &MockServer, github: &GitHubConfig) -> GitHubClient {
        let octocrab = Octocrab::builder()
            .base_uri(server.uri())
            .unwrap()
            .personal_token("ghp_test".to_string())
            .build()
            .unwrap();
        GitHubClient::with_client(octocrab, "octocat", "ghp_test", github)
    }

    #[tokio::test]
    async fn test_lists_user_repositories_in_order() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/graphql"))
            .and(body_partial_json(json!({ "variables": { "login": "octocat" } })))
            .respond_with(ResponseTemplate::new(200).set_body_json(page(
                &[
                    "https://github.com/octocat/zeta",
                    "https://github.com/octocat/alpha",
                    "https://github.com/octocat/mid",
                ],
                None,
            )))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server, &GitHubConfig::default());
        let repos = client
            .list_repositories(&OwnerScope::User("octocat".into()))
            .await
            .unwrap();

        let urls: Vec<&str> = repos.iter().map(|r| r.url.as_str()).collect();
        assert_eq!(
            urls,
            vec![
                "https://github.com/octocat/zeta",
                "https://github.com/octocat/alpha",
                "https://github.com/octocat/mid",
            ]
        );
    }

    #[tokio::test]
    async fn test_follows_cursor_across_pages() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/graphql"))
            .and(body_partial_json(json!({ "variables": { "after": null } })))
            .respond_with(ResponseTemplate::new(200).set_body_json(page(
                &["https://github.com/acme/one", "https://github.com/acme/two"],
                Some("cursor-1"),
            )))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/graphql"))
            .and(body_partial_json(json!({ "variables": { "after": "cursor-1" } })))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(page(&["https://github.com/acme/three"], None)),
            )
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server, &GitHubConfig::default());
        let repos = client
            .list_repositories(&OwnerScope::Organization("acme".into()))
            .await
            .unwrap();

        assert_eq!(repos.len(), 3);
        assert_eq!(repos[2].url, "https://github.com/acme/three");
    }

    #[tokio::test]
    async fn test_max_pages_caps_enumeration() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/graphql"))
            .respond_with(ResponseTemplate::new(200).set_body_json(page(
                &["https://github.com/acme/one"],
                Some("cursor-1"),
            )))
            .expect(1)
            .mount(&server)
            .await;

        let github = GitHubConfig {
            max_pages: Some(1),
            ..GitHubConfig::default()
        };
        let client = client_for(&server, &github);
        let repos = client
            .list_repositories(&OwnerScope::Organization("acme".into()))
            .await
            .unwrap();

        assert_eq!(repos.len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_login_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/graphql"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": { "owner": null },
                "errors": [{
                    "type": "NOT_FOUND",
                    "message": "Could not resolve to an Organization with the login of 'ghost'."
                }]
            })))
            .mount(&server)
            .await;

        let client = client_for(&server, &GitHubConfig::default());
        let err = client
            .list_repositories(&OwnerScope::Organization("ghost".into()))
            .await
            .unwrap_err();

        assert!(err.to_string().contains("Could not resolve"));
    }

    #[test]
    fn test_null_owner_without_errors() {
        let response: GraphQlResponse<OwnerData> =
            serde_json::from_value(json!({ "data": { "owner": null } })).unwrap();
        let err = response
            .into_connection(&OwnerScope::User("ghost".into()))
            .unwrap_err();
        assert!(err.to_string().contains("no user named"));
    }

    #[tokio::test]
    async fn test_page_size_is_clamped() {
        let github = GitHubConfig {
            page_size: 500,
            ..GitHubConfig::default()
        };
        let client = GitHubClient::with_client(
            Octocrab::default(),
            "octocat",
            "ghp_test",
            &github,
        );
        assert_eq!(client.page_size, 100);
    }
}
