use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use tracing::debug;

use crate::config::Config;
use crate::model::{Quote, RemoteQuote};

/// Every quote posted by this client is attributed to this mock user.
const POST_USER_ID: i64 = 1;

/// The remote side of a sync cycle.
#[async_trait]
pub trait RemoteService: Send + Sync {
    /// Fetch the remote record set.
    async fn fetch_quotes(&self) -> Result<Vec<RemoteQuote>>;

    /// Deliver one local quote. Success means the remote side echoed back a
    /// created representation.
    async fn post_quote(&self, quote: &Quote) -> Result<RemoteQuote>;
}

/// HTTP client for a JSONPlaceholder-style posts endpoint.
#[derive(Clone)]
pub struct HttpRemote {
    http: Client,
    base_url: Url,
    posts_path: String,
    fetch_limit: usize,
}

impl fmt::Debug for HttpRemote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpRemote")
            .field("base_url", &self.base_url)
            .field("posts_path", &self.posts_path)
            .finish_non_exhaustive()
    }
}

/// A post as returned by the mock API.
#[derive(Debug, Clone, Deserialize)]
pub struct RemotePost {
    #[serde(default)]
    pub id: Value,
    #[serde(rename = "userId", default)]
    pub user_id: Option<i64>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub body: Option<String>,
}

#[derive(Debug, Serialize)]
struct CreatePost<'a> {
    title: &'a str,
    body: &'a str,
    #[serde(rename = "userId")]
    user_id: i64,
    category: &'a str,
}

impl RemotePost {
    /// Map an arbitrary post into a remote quote. Posts without usable text
    /// are dropped.
    pub fn into_remote_quote(self) -> Option<RemoteQuote> {
        let text = [self.body.as_deref(), self.title.as_deref()]
            .into_iter()
            .flatten()
            .map(str::trim)
            .find(|t| !t.is_empty())?
            .to_string();
        let id = match self.id {
            Value::Null => return None,
            Value::String(s) => s,
            other => other.to_string(),
        };
        let category = match self.user_id {
            Some(uid) => format!("User {}", uid),
            None => "Server".to_string(),
        };
        Some(RemoteQuote { id, text, category })
    }
}

impl HttpRemote {
    pub fn from_config(cfg: &Config) -> Result<Self> {
        let base_url = Url::parse(&cfg.remote.base_url).context("invalid remote.base_url")?;
        Self::with_base_url(
            base_url,
            &cfg.remote.posts_path,
            cfg.remote.fetch_limit,
            cfg.remote.timeout(),
        )
    }

    pub fn with_base_url(
        base_url: Url,
        posts_path: &str,
        fetch_limit: usize,
        timeout: std::time::Duration,
    ) -> Result<Self> {
        let http = Client::builder()
            .user_agent(concat!("quote-sync/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            http,
            base_url,
            posts_path: posts_path.trim_start_matches('/').to_string(),
            fetch_limit,
        })
    }

    fn posts_url(&self) -> Result<Url> {
        self.base_url
            .join(&self.posts_path)
            .context("invalid remote posts URL")
    }

    pub fn build_fetch_request(&self) -> Result<reqwest::Request> {
        self.http
            .get(self.posts_url()?)
            .header("Accept", "application/json")
            .build()
            .context("failed to build fetch request")
    }

    pub fn build_post_request(&self, quote: &Quote) -> Result<reqwest::Request> {
        let body = CreatePost {
            title: &quote.text,
            body: &quote.text,
            user_id: POST_USER_ID,
            category: &quote.category,
        };
        self.http
            .post(self.posts_url()?)
            .header("Content-Type", "application/json; charset=UTF-8")
            .json(&body)
            .build()
            .context("failed to build post request")
    }

    async fn execute(&self, request: reqwest::Request) -> Result<String> {
        debug!(method = %request.method(), url = %request.url(), "sending remote request");
        let res = self
            .http
            .execute(request)
            .await
            .context("failed to reach remote")?;

        if res.status() == StatusCode::TOO_MANY_REQUESTS {
            let body = res.text().await.unwrap_or_default();
            return Err(anyhow!("received 429 from remote: {}", body));
        }
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(anyhow!("remote error {}: {}", status, body));
        }
        res.text().await.context("failed to read remote response")
    }
}

#[async_trait]
impl RemoteService for HttpRemote {
    async fn fetch_quotes(&self) -> Result<Vec<RemoteQuote>> {
        let request = self.build_fetch_request()?;
        let body = self.execute(request).await?;
        let posts: Vec<RemotePost> =
            serde_json::from_str(&body).context("invalid remote posts JSON")?;
        Ok(map_posts(posts, self.fetch_limit))
    }

    async fn post_quote(&self, quote: &Quote) -> Result<RemoteQuote> {
        let request = self.build_post_request(quote)?;
        let body = self.execute(request).await?;
        let created: RemotePost =
            serde_json::from_str(&body).context("invalid remote create response")?;
        let id = match created.id {
            Value::String(s) => s,
            Value::Null => return Err(anyhow!("remote create response has no id")),
            other => other.to_string(),
        };
        Ok(RemoteQuote {
            id,
            text: quote.text.clone(),
            category: quote.category.clone(),
        })
    }
}

/// Map posts in order, keeping at most `limit` usable records.
pub fn map_posts(posts: Vec<RemotePost>, limit: usize) -> Vec<RemoteQuote> {
    posts
        .into_iter()
        .filter_map(RemotePost::into_remote_quote)
        .take(limit)
        .collect()
}
