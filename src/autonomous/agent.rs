//! The autonomous action state machine.
//!
//! Actions are serialized by a run lock, so two concurrent `/autonomous/run`
//! calls cannot both pass the rate limiter's last slot or pick the same idea.

use crate::agent::AgentInvoker;
use crate::autonomous::ActionReport;
use crate::config::{AutonomousSection, RetentionSection};
use crate::error::{GatewayError, GatewayResult};
use crate::ratelimit::{Acquire, RateLimiter};
use crate::social::{FeedItem, SocialPlatform};
use crate::state::StateStore;
use crate::types::{ActionClass, AutonomousProgress, Discovery, IdeaPriority, PostIdea};
use chrono::{DateTime, Utc};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

const MAX_TITLE_LEN: usize = 300;

/// Static settings for the agent, taken from `[autonomous]`.
#[derive(Debug, Clone)]
pub struct AutonomousSettings {
    pub submolt: String,
    pub search_topics: Vec<String>,
    pub browse_limit: usize,
    pub max_ideas: usize,
}

impl AutonomousSettings {
    pub fn from_config(section: &AutonomousSection, retention: &RetentionSection) -> Self {
        Self {
            submolt: section.submolt.clone(),
            search_topics: section.search_topics.clone(),
            browse_limit: section.browse_limit as usize,
            max_ideas: retention.ideas,
        }
    }
}

pub struct AutonomousAgent {
    social: Arc<dyn SocialPlatform>,
    invoker: Option<Arc<dyn AgentInvoker>>,
    state: Arc<StateStore>,
    limiter: RateLimiter,
    settings: AutonomousSettings,
    run_lock: Mutex<()>,
}

impl AutonomousAgent {
    /// Build the agent and restore rate-limiter windows from saved progress.
    pub async fn new(
        social: Arc<dyn SocialPlatform>,
        invoker: Option<Arc<dyn AgentInvoker>>,
        state: Arc<StateStore>,
        limiter: RateLimiter,
        settings: AutonomousSettings,
    ) -> Self {
        let progress = state.progress().await;
        limiter.restore(&progress.rate_limiter_window_state);
        Self {
            social,
            invoker,
            state,
            limiter,
            settings,
            run_lock: Mutex::new(()),
        }
    }

    // -----------------------------------------------------------------------
    // Entry points
    // -----------------------------------------------------------------------

    /// Pick and perform the next action.
    ///
    /// A queued idea is posted first when posting is allowed. Otherwise
    /// browse and search alternate, falling back to the other class when
    /// the preferred one is rate limited. With every class denied the run
    /// is deferred until the earliest window reopens.
    pub async fn run(&self) -> GatewayResult<ActionReport> {
        let _guard = self.run_lock.lock().await;
        let now = Utc::now();
        let progress = self.state.progress().await;

        let mut earliest_retry: Option<u64> = None;
        let mut note_denied = |acquire: Acquire| {
            let secs = acquire.retry_after_secs();
            earliest_retry = Some(earliest_retry.map_or(secs, |e| e.min(secs)));
        };

        if !progress.post_idea_queue.is_empty() {
            match self.limiter.check_at(ActionClass::Post, now) {
                Acquire::Granted => return self.post_locked(now).await,
                denied => note_denied(denied),
            }
        }

        for class in discovery_order(progress.last_discovery_action) {
            if class == ActionClass::Search && self.settings.search_topics.is_empty() {
                continue;
            }
            match self.limiter.check_at(class, now) {
                Acquire::Granted => {
                    return match class {
                        ActionClass::Browse => self.browse_locked(now).await,
                        _ => self.search_locked(None, &progress, now).await,
                    };
                }
                denied => note_denied(denied),
            }
        }

        match earliest_retry {
            Some(secs) => {
                info!("Autonomous run deferred, every action class is rate limited");
                Ok(ActionReport::deferred(None, secs, "all action classes are rate limited"))
            }
            None => Ok(ActionReport {
                action: "none".into(),
                deferred: false,
                result: None,
                reason: Some("nothing to do".into()),
                retry_after_secs: None,
            }),
        }
    }

    pub async fn browse(&self) -> GatewayResult<ActionReport> {
        let _guard = self.run_lock.lock().await;
        self.browse_locked(Utc::now()).await
    }

    /// Search for `query`, or the next configured topic when absent.
    pub async fn search(&self, query: Option<String>) -> GatewayResult<ActionReport> {
        let _guard = self.run_lock.lock().await;
        let progress = self.state.progress().await;
        self.search_locked(query, &progress, Utc::now()).await
    }

    /// Publish the highest-priority queued idea.
    pub async fn post(&self) -> GatewayResult<ActionReport> {
        let _guard = self.run_lock.lock().await;
        self.post_locked(Utc::now()).await
    }

    pub async fn enqueue_idea(
        &self,
        title: &str,
        body: Option<String>,
        priority: IdeaPriority,
    ) -> GatewayResult<PostIdea> {
        let title = title.trim();
        if title.is_empty() {
            return Err(GatewayError::InvalidInput("idea title must not be empty".into()));
        }
        if title.chars().count() > MAX_TITLE_LEN {
            return Err(GatewayError::InvalidInput(format!(
                "idea title longer than {MAX_TITLE_LEN} characters"
            )));
        }

        let idea = PostIdea {
            id: ulid::Ulid::new().to_string(),
            title: title.to_string(),
            body: body.filter(|b| !b.trim().is_empty()),
            priority,
            queued_at: Utc::now(),
        };
        let max_ideas = self.settings.max_ideas;
        self.state
            .update_progress(|p| {
                if p.post_idea_queue.len() >= max_ideas {
                    return Err(GatewayError::InvalidInput(format!(
                        "idea queue is full ({max_ideas} ideas)"
                    )));
                }
                insert_idea(&mut p.post_idea_queue, idea.clone());
                Ok(())
            })
            .await?;
        info!("Idea queued ({:?}): {}", idea.priority, idea.title);
        Ok(idea)
    }

    pub async fn ideas(&self) -> Vec<PostIdea> {
        self.state.progress().await.post_idea_queue
    }

    pub async fn discoveries(&self) -> Vec<Discovery> {
        self.state.progress().await.discoveries
    }

    /// Empty the discoveries log. The idea queue and rate-limiter windows
    /// are left alone. Returns how many entries were dropped.
    pub async fn clear_discoveries(&self) -> GatewayResult<usize> {
        self.state
            .update_progress(|p| {
                let cleared = p.discoveries.len();
                p.discoveries.clear();
                Ok(cleared)
            })
            .await
    }

    // -----------------------------------------------------------------------
    // Actions (run lock held)
    // -----------------------------------------------------------------------

    async fn browse_locked(&self, now: DateTime<Utc>) -> GatewayResult<ActionReport> {
        if let denied @ Acquire::Denied { .. } = self.limiter.try_acquire_at(ActionClass::Browse, now) {
            return Ok(ActionReport::deferred(
                Some(ActionClass::Browse),
                denied.retry_after_secs(),
                "browse rate limit reached",
            ));
        }

        let items = match self.social.browse(self.settings.browse_limit).await {
            Ok(items) => items,
            Err(err) => return Err(self.upstream_failure(ActionClass::Browse, err).await),
        };

        let discoveries = to_discoveries(ActionClass::Browse, items, now);
        let windows = self.limiter.snapshot();
        let recorded = discoveries.clone();
        self.state
            .update_progress(|p| {
                p.discoveries.extend(recorded);
                p.last_discovery_action = Some(ActionClass::Browse);
                mark_action(p, ActionClass::Browse, now, windows);
                Ok(())
            })
            .await?;

        info!("Browsed feed: {} item(s)", discoveries.len());
        Ok(ActionReport::completed(
            ActionClass::Browse,
            json!({ "discoveries": discoveries }),
        ))
    }

    async fn search_locked(
        &self,
        query: Option<String>,
        progress: &AutonomousProgress,
        now: DateTime<Utc>,
    ) -> GatewayResult<ActionReport> {
        let explicit = query.map(|q| q.trim().to_string()).filter(|q| !q.is_empty());
        let topics = &self.settings.search_topics;
        let (query, from_topics) = match explicit {
            Some(query) => (query, false),
            None if topics.is_empty() => {
                return Err(GatewayError::InvalidInput(
                    "no search query given and no search topics configured".into(),
                ));
            }
            None => (topics[progress.next_topic_index % topics.len()].clone(), true),
        };

        if let denied @ Acquire::Denied { .. } = self.limiter.try_acquire_at(ActionClass::Search, now) {
            return Ok(ActionReport::deferred(
                Some(ActionClass::Search),
                denied.retry_after_secs(),
                "search rate limit reached",
            ));
        }

        let items = match self.social.search(&query, self.settings.browse_limit).await {
            Ok(items) => items,
            Err(err) => return Err(self.upstream_failure(ActionClass::Search, err).await),
        };

        let discoveries = to_discoveries(ActionClass::Search, items, now);
        let windows = self.limiter.snapshot();
        let recorded = discoveries.clone();
        let topic_count = topics.len();
        self.state
            .update_progress(|p| {
                p.discoveries.extend(recorded);
                p.last_discovery_action = Some(ActionClass::Search);
                if from_topics {
                    p.next_topic_index = (p.next_topic_index + 1) % topic_count;
                }
                mark_action(p, ActionClass::Search, now, windows);
                Ok(())
            })
            .await?;

        info!("Searched '{}': {} item(s)", query, discoveries.len());
        Ok(ActionReport::completed(
            ActionClass::Search,
            json!({ "query": query, "discoveries": discoveries }),
        ))
    }

    async fn post_locked(&self, now: DateTime<Utc>) -> GatewayResult<ActionReport> {
        let Some(idea) = self.state.progress().await.post_idea_queue.first().cloned() else {
            return Ok(ActionReport::skipped(ActionClass::Post, "idea queue is empty"));
        };

        if let denied @ Acquire::Denied { .. } = self.limiter.try_acquire_at(ActionClass::Post, now) {
            return Ok(ActionReport::deferred(
                Some(ActionClass::Post),
                denied.retry_after_secs(),
                "post rate limit reached",
            ));
        }

        let content = match self.compose(&idea).await {
            Ok(content) => content,
            Err(err) => return Err(self.upstream_failure(ActionClass::Post, err).await),
        };

        let published = match self
            .social
            .create_post(&self.settings.submolt, &idea.title, &content)
            .await
        {
            Ok(published) => published,
            Err(err) => return Err(self.upstream_failure(ActionClass::Post, err).await),
        };

        let windows = self.limiter.snapshot();
        let idea_id = idea.id.clone();
        self.state
            .update_progress(|p| {
                p.post_idea_queue.retain(|queued| queued.id != idea_id);
                p.posts_published += 1;
                mark_action(p, ActionClass::Post, now, windows);
                Ok(())
            })
            .await?;

        Ok(ActionReport::completed(
            ActionClass::Post,
            json!({ "idea": idea, "post": published }),
        ))
    }

    /// Post body: the agent's draft when an invoker is configured, the
    /// idea's own text otherwise.
    async fn compose(&self, idea: &PostIdea) -> anyhow::Result<String> {
        let fallback = idea.body.clone().unwrap_or_else(|| idea.title.clone());
        let Some(invoker) = &self.invoker else {
            return Ok(fallback);
        };
        let prompt = format!(
            "Write a short post for m/{} titled \"{}\".\n\nNotes:\n{}",
            self.settings.submolt,
            idea.title,
            idea.body.as_deref().unwrap_or("(none)")
        );
        let draft = invoker.invoke(&prompt).await?;
        Ok(if draft.trim().is_empty() { fallback } else { draft })
    }

    /// Record an upstream failure in the error counters and turn it into
    /// the error surfaced to the caller.
    /// Count the failure and keep the slot it consumed: the limiter window
    /// is persisted even though the action did not complete.
    async fn upstream_failure(&self, action: ActionClass, err: anyhow::Error) -> GatewayError {
        let message = format!("{action} failed: {err:#}");
        warn!("Autonomous {}", message);
        let windows = self.limiter.snapshot();
        if let Err(save_err) = self
            .state
            .update_progress(|p| {
                p.rate_limiter_window_state = windows;
                Ok(())
            })
            .await
        {
            warn!("Rate-limit window not saved after {} failure: {}", action, save_err);
        }
        self.state.record_error(&message).await;
        GatewayError::Upstream(message)
    }
}

/// Browse/search preference: the opposite of the last discovery action.
fn discovery_order(last: Option<ActionClass>) -> [ActionClass; 2] {
    match last {
        Some(ActionClass::Browse) => [ActionClass::Search, ActionClass::Browse],
        _ => [ActionClass::Browse, ActionClass::Search],
    }
}

/// Insert keeping the queue ordered by priority (high first), then age.
fn insert_idea(queue: &mut Vec<PostIdea>, idea: PostIdea) {
    let position = queue
        .iter()
        .position(|queued| queued.priority < idea.priority)
        .unwrap_or(queue.len());
    queue.insert(position, idea);
}

fn mark_action(
    progress: &mut AutonomousProgress,
    action: ActionClass,
    now: DateTime<Utc>,
    windows: crate::types::RateLimiterSnapshot,
) {
    progress.last_action = Some(action);
    progress.last_action_at = Some(now);
    progress.rate_limiter_window_state = windows;
}

fn to_discoveries(action: ActionClass, items: Vec<FeedItem>, now: DateTime<Utc>) -> Vec<Discovery> {
    items
        .into_iter()
        .map(|item| Discovery {
            id: ulid::Ulid::new().to_string(),
            action,
            source_id: item.id,
            title: item.title,
            author: item.author,
            url: item.url,
            discovered_at: now,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RateLimit;
    use crate::social::PublishedPost;
    use anyhow::bail;
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex as StdMutex;
    use tempfile::TempDir;

    #[derive(Default)]
    struct FakeSocial {
        fail: AtomicBool,
        searches: StdMutex<Vec<String>>,
        posts: StdMutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl SocialPlatform for FakeSocial {
        async fn browse(&self, limit: usize) -> anyhow::Result<Vec<FeedItem>> {
            if self.fail.load(Ordering::SeqCst) {
                bail!("feed unavailable");
            }
            Ok((0..limit.min(2))
                .map(|i| FeedItem {
                    id: format!("b{i}"),
                    title: format!("Browse {i}"),
                    author: Some("crab".into()),
                    url: None,
                })
                .collect())
        }

        async fn search(&self, query: &str, _limit: usize) -> anyhow::Result<Vec<FeedItem>> {
            if self.fail.load(Ordering::SeqCst) {
                bail!("search unavailable");
            }
            self.searches.lock().unwrap().push(query.to_string());
            Ok(vec![FeedItem {
                id: format!("s-{query}"),
                title: format!("About {query}"),
                author: None,
                url: None,
            }])
        }

        async fn create_post(
            &self,
            _submolt: &str,
            title: &str,
            content: &str,
        ) -> anyhow::Result<PublishedPost> {
            if self.fail.load(Ordering::SeqCst) {
                bail!("posting disabled");
            }
            self.posts
                .lock()
                .unwrap()
                .push((title.to_string(), content.to_string()));
            Ok(PublishedPost {
                id: Some("p1".into()),
                url: None,
            })
        }
    }

    struct Drafting;

    #[async_trait]
    impl AgentInvoker for Drafting {
        async fn invoke(&self, _prompt: &str) -> anyhow::Result<String> {
            Ok("drafted by agent".into())
        }
    }

    fn limits(browse: u32, search: u32, post: u32) -> RateLimiter {
        let mut map = BTreeMap::new();
        for (class, max_actions) in [
            (ActionClass::Browse, browse),
            (ActionClass::Search, search),
            (ActionClass::Post, post),
        ] {
            map.insert(
                class,
                RateLimit {
                    max_actions,
                    window_secs: 3600,
                },
            );
        }
        RateLimiter::new(map)
    }

    fn settings(topics: &[&str]) -> AutonomousSettings {
        AutonomousSettings {
            submolt: "general".into(),
            search_topics: topics.iter().map(|t| t.to_string()).collect(),
            browse_limit: 5,
            max_ideas: 3,
        }
    }

    struct Harness {
        _temp: TempDir,
        state: Arc<StateStore>,
        social: Arc<FakeSocial>,
        agent: AutonomousAgent,
    }

    async fn harness(limiter: RateLimiter, topics: &[&str], invoker: Option<Arc<dyn AgentInvoker>>) -> Harness {
        let temp = TempDir::new().unwrap();
        let state = Arc::new(StateStore::open(temp.path(), RetentionSection::default()).unwrap());
        let social = Arc::new(FakeSocial::default());
        let agent = AutonomousAgent::new(
            social.clone(),
            invoker,
            state.clone(),
            limiter,
            settings(topics),
        )
        .await;
        Harness {
            _temp: temp,
            state,
            social,
            agent,
        }
    }

    #[tokio::test]
    async fn run_alternates_browse_and_search() {
        let h = harness(limits(5, 5, 5), &["rust", "agents"], None).await;

        let actions: Vec<String> = [
            h.agent.run().await.unwrap(),
            h.agent.run().await.unwrap(),
            h.agent.run().await.unwrap(),
            h.agent.run().await.unwrap(),
        ]
        .into_iter()
        .map(|r| r.action)
        .collect();

        assert_eq!(actions, vec!["browse", "search", "browse", "search"]);
        assert_eq!(*h.social.searches.lock().unwrap(), vec!["rust", "agents"]);
        assert_eq!(h.agent.discoveries().await.len(), 2 + 1 + 2 + 1);
    }

    #[tokio::test]
    async fn run_falls_back_when_preferred_class_is_denied() {
        let h = harness(limits(1, 5, 5), &["rust"], None).await;
        assert_eq!(h.agent.run().await.unwrap().action, "browse");
        assert_eq!(h.agent.run().await.unwrap().action, "search");
        // Browse is preferred again but exhausted, so search runs.
        assert_eq!(h.agent.run().await.unwrap().action, "search");
    }

    #[tokio::test]
    async fn run_defers_when_everything_is_denied() {
        let h = harness(limits(1, 1, 1), &["rust"], None).await;
        h.agent.run().await.unwrap();
        h.agent.run().await.unwrap();

        let report = h.agent.run().await.unwrap();
        assert!(report.deferred);
        assert_eq!(report.action, "none");
        let retry = report.retry_after_secs.unwrap();
        assert!(retry > 3590 && retry <= 3600, "retry {retry}");
    }

    #[tokio::test]
    async fn queued_idea_is_posted_first_by_priority() {
        let h = harness(limits(5, 5, 5), &[], None).await;
        h.agent
            .enqueue_idea("low one", None, IdeaPriority::Low)
            .await
            .unwrap();
        h.agent
            .enqueue_idea("urgent", Some("details".into()), IdeaPriority::High)
            .await
            .unwrap();

        let report = h.agent.run().await.unwrap();
        assert_eq!(report.action, "post");
        assert_eq!(
            *h.social.posts.lock().unwrap(),
            vec![("urgent".to_string(), "details".to_string())]
        );

        let queue = h.agent.ideas().await;
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].title, "low one");
        assert_eq!(h.state.progress().await.posts_published, 1);
    }

    #[tokio::test]
    async fn post_content_comes_from_the_agent_when_configured() {
        let h = harness(limits(5, 5, 5), &[], Some(Arc::new(Drafting))).await;
        h.agent
            .enqueue_idea("topic", None, IdeaPriority::Normal)
            .await
            .unwrap();
        h.agent.post().await.unwrap();
        assert_eq!(h.social.posts.lock().unwrap()[0].1, "drafted by agent");
    }

    #[tokio::test]
    async fn failed_post_keeps_idea_and_counts_error() {
        let h = harness(limits(5, 5, 5), &[], None).await;
        h.agent
            .enqueue_idea("keep me", None, IdeaPriority::Normal)
            .await
            .unwrap();
        h.social.fail.store(true, Ordering::SeqCst);

        let err = h.agent.post().await.unwrap_err();
        assert!(matches!(err, GatewayError::Upstream(_)));
        assert_eq!(h.agent.ideas().await.len(), 1);

        let state = h.state.snapshot().await;
        assert_eq!(state.total_errors, 1);
        assert!(state.last_error.unwrap().contains("posting disabled"));
    }

    #[tokio::test]
    async fn idea_queue_is_bounded_and_validated() {
        let h = harness(limits(5, 5, 5), &[], None).await;
        assert!(matches!(
            h.agent.enqueue_idea("   ", None, IdeaPriority::Normal).await,
            Err(GatewayError::InvalidInput(_))
        ));
        for i in 0..3 {
            h.agent
                .enqueue_idea(&format!("idea {i}"), None, IdeaPriority::Normal)
                .await
                .unwrap();
        }
        assert!(matches!(
            h.agent.enqueue_idea("one too many", None, IdeaPriority::High).await,
            Err(GatewayError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn clearing_discoveries_leaves_queue_and_windows() {
        let h = harness(limits(1, 5, 5), &[], None).await;
        h.agent.browse().await.unwrap();
        h.agent
            .enqueue_idea("still here", None, IdeaPriority::Normal)
            .await
            .unwrap();

        assert_eq!(h.agent.clear_discoveries().await.unwrap(), 2);
        assert!(h.agent.discoveries().await.is_empty());
        assert_eq!(h.agent.ideas().await.len(), 1);
        assert!(h.agent.browse().await.unwrap().deferred);
    }

    #[tokio::test]
    async fn explicit_search_query_does_not_advance_topics() {
        let h = harness(limits(5, 5, 5), &["rust"], None).await;
        h.agent.search(Some("crabs".into())).await.unwrap();
        assert_eq!(h.state.progress().await.next_topic_index, 0);
        h.agent.search(None).await.unwrap();
        assert_eq!(*h.social.searches.lock().unwrap(), vec!["crabs", "rust"]);
    }

    #[tokio::test]
    async fn search_without_query_or_topics_is_invalid() {
        let h = harness(limits(5, 5, 5), &[], None).await;
        assert!(matches!(
            h.agent.search(None).await,
            Err(GatewayError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn windows_survive_restart() {
        let temp = TempDir::new().unwrap();
        {
            let state = Arc::new(StateStore::open(temp.path(), RetentionSection::default()).unwrap());
            let agent = AutonomousAgent::new(
                Arc::new(FakeSocial::default()),
                None,
                state,
                limits(1, 1, 1),
                settings(&[]),
            )
            .await;
            agent.browse().await.unwrap();
        }
        let state = Arc::new(StateStore::open(temp.path(), RetentionSection::default()).unwrap());
        let agent = AutonomousAgent::new(
            Arc::new(FakeSocial::default()),
            None,
            state,
            limits(1, 1, 1),
            settings(&[]),
        )
        .await;
        assert!(agent.browse().await.unwrap().deferred);
    }

    #[tokio::test]
    async fn failed_action_still_spends_its_slot_across_restart() {
        let temp = TempDir::new().unwrap();
        {
            let state = Arc::new(StateStore::open(temp.path(), RetentionSection::default()).unwrap());
            let social = Arc::new(FakeSocial::default());
            social.fail.store(true, Ordering::SeqCst);
            let agent = AutonomousAgent::new(social, None, state, limits(1, 1, 1), settings(&[])).await;
            assert!(matches!(agent.browse().await, Err(GatewayError::Upstream(_))));
        }
        let state = Arc::new(StateStore::open(temp.path(), RetentionSection::default()).unwrap());
        assert!(!state.progress().await.rate_limiter_window_state.is_empty());
        let agent = AutonomousAgent::new(
            Arc::new(FakeSocial::default()),
            None,
            state,
            limits(1, 1, 1),
            settings(&[]),
        )
        .await;
        assert!(agent.browse().await.unwrap().deferred);
    }
}
