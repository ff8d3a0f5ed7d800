//! HTTP client for the Moltbook social API.

use crate::social::{FeedItem, PublishedPost, SocialPlatform};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Moltbook API client.
#[derive(Debug, Clone)]
pub struct SocialClient {
    api_url: String,
    api_key: String,
    http: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct CreatePostRequest<'a> {
    submolt: &'a str,
    title: &'a str,
    content: &'a str,
}

impl SocialClient {
    pub fn new(api_url: &str, api_key: &str) -> Self {
        Self {
            api_url: api_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            http: reqwest::Client::new(),
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/api/v1/{}", self.api_url, path)
    }

    fn post_url(&self, id: &str) -> String {
        format!("{}/post/{}", self.api_url, id)
    }

    async fn get_posts(&self, what: &str, path: &str, query: &[(&str, String)]) -> Result<Vec<FeedItem>> {
        let resp = self
            .http
            .get(self.endpoint(path))
            .bearer_auth(&self.api_key)
            .query(query)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .with_context(|| format!("Failed to {what}"))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            bail!("{} failed ({}): {}", what, status, body);
        }

        let body: Value = resp
            .json()
            .await
            .with_context(|| format!("Failed to parse {what} response"))?;
        let items = parse_posts(&body, |id| self.post_url(id));
        debug!("{} returned {} posts", what, items.len());
        Ok(items)
    }
}

#[async_trait]
impl SocialPlatform for SocialClient {
    async fn browse(&self, limit: usize) -> Result<Vec<FeedItem>> {
        self.get_posts(
            "Browse feed",
            "posts",
            &[("sort", "new".to_string()), ("limit", limit.to_string())],
        )
        .await
    }

    async fn search(&self, query: &str, limit: usize) -> Result<Vec<FeedItem>> {
        self.get_posts(
            "Search",
            "search",
            &[("q", query.to_string()), ("limit", limit.to_string())],
        )
        .await
    }

    async fn create_post(&self, submolt: &str, title: &str, content: &str) -> Result<PublishedPost> {
        let resp = self
            .http
            .post(self.endpoint("posts"))
            .bearer_auth(&self.api_key)
            .json(&CreatePostRequest {
                submolt,
                title,
                content,
            })
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .context("Failed to create post")?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            bail!("Create post failed ({}): {}", status, body);
        }

        let body: Value = resp.json().await.unwrap_or(Value::Null);
        let id = body
            .get("post")
            .and_then(|p| p.get("id"))
            .and_then(id_string);
        let url = id.as_deref().map(|id| self.post_url(id));
        info!("Post published to m/{}: {}", submolt, url.as_deref().unwrap_or(title));
        Ok(PublishedPost { id, url })
    }
}

/// Pull posts out of `{"posts": [...]}` or `{"results": [...]}` or a bare
/// array. Entries without an id are dropped.
fn parse_posts(body: &Value, url_for: impl Fn(&str) -> String) -> Vec<FeedItem> {
    let posts = body
        .get("posts")
        .or_else(|| body.get("results"))
        .unwrap_or(body)
        .as_array()
        .cloned()
        .unwrap_or_default();

    posts
        .iter()
        .filter_map(|post| {
            let id = post.get("id").and_then(id_string)?;
            let title = post
                .get("title")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let author = post
                .get("author")
                .and_then(|a| a.get("name").or(Some(a)))
                .and_then(Value::as_str)
                .map(str::to_string);
            let url = Some(url_for(&id));
            Some(FeedItem {
                id,
                title,
                author,
                url,
            })
        })
        .collect()
}

fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
