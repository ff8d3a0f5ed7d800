//! The external social platform the autonomous agent acts on.

pub mod client;

pub use client::SocialClient;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// A post surfaced by browsing or searching the platform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedItem {
    pub id: String,
    pub title: String,
    pub author: Option<String>,
    pub url: Option<String>,
}

/// Result of publishing a post.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishedPost {
    pub id: Option<String>,
    pub url: Option<String>,
}

/// Capability the autonomous agent needs from the platform.
#[async_trait]
pub trait SocialPlatform: Send + Sync {
    async fn browse(&self, limit: usize) -> Result<Vec<FeedItem>>;

    async fn search(&self, query: &str, limit: usize) -> Result<Vec<FeedItem>>;

    async fn create_post(&self, submolt: &str, title: &str, content: &str)
        -> Result<PublishedPost>;
}
