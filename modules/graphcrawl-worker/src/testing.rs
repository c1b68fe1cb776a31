// Test mocks for the crawl consumer.
//
// Four mocks matching the four trait boundaries:
// - MockGraph (GraphStore): stateful in-memory graph with the same merge rules
// - MemoryQueue (WorkQueue): leases, receipts, expiry on demand
// - MemoryBlobs (BlobStore): key→bytes map
// - ScriptedSource (CrawlSource): per-resource scripts of pages and errors
//
// Plus fixture helpers for raw platform records and consumer settings.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use graphcrawl_common::{
    locations, CrawlStatus, CrawlTask, EdgeChange, FollowEdge, QueueKind, RetweetEdge,
    RetweetEdgeState, StatusDimension, Tweet, User,
};
use twitter_client::{
    Page, RawTweet, RawUser, TwitterError, V2Tweet, V2TweetMetrics, V2User, V2UserMetrics,
};

use crate::blob::{self, BlobStore};
use crate::consumer::ConsumerSettings;
use crate::fanout::FanoutPolicy;
use crate::paginator::{PageFetcher, Paginator};
use crate::queue::{self, Message, QueueError, WorkQueue};
use crate::traits::{CrawlSource, GraphStore};

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

pub const LAGOS: &str = "lagos";

/// A v2 user record.
pub fn raw_user(id: &str, location: &str, followers: i64) -> RawUser {
    RawUser::V2(V2User {
        id: id.to_string(),
        username: format!("user_{id}"),
        name: None,
        description: Some(format!("bio of {id}")),
        location: Some(location.to_string()),
        verified: Some(false),
        created_at: None,
        public_metrics: Some(V2UserMetrics {
            followers_count: followers,
            following_count: 10,
            tweet_count: 100,
        }),
    })
}

/// A v2 tweet record with its author joined in.
pub fn raw_tweet(id: &str, author: &RawUser, text: &str, retweets: i64) -> RawTweet {
    let RawUser::V2(author) = author.clone() else {
        panic!("raw_tweet expects a v2 author");
    };
    RawTweet::V2 {
        tweet: V2Tweet {
            id: id.to_string(),
            text: text.to_string(),
            author_id: Some(author.id.clone()),
            created_at: None,
            public_metrics: Some(V2TweetMetrics {
                retweet_count: retweets,
                like_count: 0,
            }),
        },
        author: Some(author),
    }
}

/// A canonical user as the graph would hold it after discovery in Lagos.
pub fn graph_user(id: &str, followers: i64) -> User {
    let now = Utc::now();
    User {
        id: id.to_string(),
        handle: format!("user_{id}"),
        bio: String::new(),
        profile_location: "Lagos, Nigeria".to_string(),
        followers_count: followers,
        following_count: 0,
        tweet_count: 0,
        verified: false,
        created_at: None,
        location_tag: LAGOS.to_string(),
        category: None,
        location_match: locations::profile(LAGOS).matches("Lagos, Nigeria"),
        retweeter_status: CrawlStatus::Pending,
        retweeter_last_processed: now,
        follower_status: CrawlStatus::Pending,
        follower_last_processed: now,
        extracted_at: now,
        last_updated: now,
    }
}

/// Settings with a millisecond cool-down so rate-limit paths run instantly.
pub fn test_settings(queue: QueueKind) -> ConsumerSettings {
    ConsumerSettings {
        queue,
        visibility_timeout: Duration::from_secs(300),
        receive_wait: Duration::from_millis(1),
        paginator: Paginator::new(Duration::from_millis(1)),
        fanout: FanoutPolicy::new(1000),
    }
}

// ---------------------------------------------------------------------------
// MockGraph
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct GraphState {
    pub users: HashMap<String, User>,
    pub tweets: HashMap<String, Tweet>,
    /// (follower, followed)
    pub follows: BTreeSet<(String, String)>,
    /// (source, target, location) → edge
    pub retweets: HashMap<(String, String, String), RetweetEdgeState>,
    /// (author, tweet)
    pub posted: BTreeSet<(String, String)>,
}

/// In-memory graph applying the same create-vs-match rules as the Cypher
/// writer: repeat observations refresh profile attributes only, statuses
/// move forward only, retweet edges accumulate distinct tweet ids.
#[derive(Default)]
pub struct MockGraph {
    state: Mutex<GraphState>,
    failing_users: Mutex<HashSet<String>>,
    fail_reads: AtomicBool,
}

impl MockGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user(self, user: User) -> Self {
        self.state()
            .users
            .insert(user.id.clone(), user);
        self
    }

    pub fn with_tweet(self, tweet: Tweet) -> Self {
        self.state()
            .tweets
            .insert(tweet.id.clone(), tweet);
        self
    }

    /// Make every upsert of this user id fail.
    pub fn fail_upserts_of(&self, user_id: &str) {
        self.failing_users
            .lock()
            .unwrap()
            .insert(user_id.to_string());
    }

    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> GraphState {
        self.state().clone()
    }

    pub fn user(&self, id: &str) -> Option<User> {
        self.state().users.get(id).cloned()
    }

    pub fn tweet(&self, id: &str) -> Option<Tweet> {
        self.state().tweets.get(id).cloned()
    }

    pub fn edge(&self, source: &str, target: &str, location: &str) -> Option<RetweetEdgeState> {
        self.state()
            .retweets
            .get(&(source.to_string(), target.to_string(), location.to_string()))
            .cloned()
    }

    pub fn follows(&self, source: &str, target: &str) -> bool {
        self.state()
            .follows
            .contains(&(source.to_string(), target.to_string()))
    }

    fn state(&self) -> std::sync::MutexGuard<'_, GraphState> {
        self.state.lock().unwrap()
    }

    fn check_reads(&self) -> Result<()> {
        if self.fail_reads.load(Ordering::SeqCst) {
            bail!("MockGraph: reads disabled");
        }
        Ok(())
    }
}

#[async_trait]
impl GraphStore for MockGraph {
    async fn upsert_user(&self, user: &User) -> Result<bool> {
        if self.failing_users.lock().unwrap().contains(&user.id) {
            bail!("MockGraph: injected failure for user {}", user.id);
        }
        let mut state = self.state();
        match state.users.get_mut(&user.id) {
            Some(existing) => {
                existing.handle = user.handle.clone();
                existing.bio = user.bio.clone();
                existing.profile_location = user.profile_location.clone();
                existing.followers_count = user.followers_count;
                existing.following_count = user.following_count;
                existing.tweet_count = user.tweet_count;
                existing.verified = user.verified;
                existing.last_updated = user.last_updated;
                Ok(false)
            }
            None => {
                state.users.insert(user.id.clone(), user.clone());
                Ok(true)
            }
        }
    }

    async fn upsert_tweet(&self, tweet: &Tweet) -> Result<bool> {
        let mut state = self.state();
        let created = match state.tweets.get_mut(&tweet.id) {
            Some(existing) => {
                existing.retweet_count = tweet.retweet_count;
                existing.favorite_count = tweet.favorite_count;
                false
            }
            None => {
                state.tweets.insert(tweet.id.clone(), tweet.clone());
                true
            }
        };
        if state.users.contains_key(&tweet.user_id) {
            state
                .posted
                .insert((tweet.user_id.clone(), tweet.id.clone()));
        }
        Ok(created)
    }

    async fn upsert_retweet_edge(&self, edge: &RetweetEdge) -> Result<EdgeChange> {
        let mut state = self.state();
        if !state.users.contains_key(&edge.source) || !state.users.contains_key(&edge.target) {
            bail!("MockGraph: missing vertex {} or {}", edge.source, edge.target);
        }
        let key = (
            edge.source.clone(),
            edge.target.clone(),
            edge.location_tag.clone(),
        );
        let entry = state.retweets.entry(key).or_insert(RetweetEdgeState {
            weight: 0,
            tweet_ids: Vec::new(),
        });
        if entry.tweet_ids.contains(&edge.tweet_id) {
            return Ok(EdgeChange::Unchanged);
        }
        let fresh = entry.tweet_ids.is_empty();
        entry.tweet_ids.push(edge.tweet_id.clone());
        entry.weight = entry.tweet_ids.len() as i64;
        Ok(if fresh {
            EdgeChange::Created
        } else {
            EdgeChange::Incremented
        })
    }

    async fn upsert_follow_edge(&self, edge: &FollowEdge) -> Result<bool> {
        let mut state = self.state();
        if !state.users.contains_key(&edge.source) || !state.users.contains_key(&edge.target) {
            bail!("MockGraph: missing vertex {} or {}", edge.source, edge.target);
        }
        Ok(state
            .follows
            .insert((edge.source.clone(), edge.target.clone())))
    }

    async fn advance_status(
        &self,
        user_id: &str,
        dimension: StatusDimension,
        next: CrawlStatus,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        Ok(self
            .state()
            .users
            .get_mut(user_id)
            .is_some_and(|u| u.advance(dimension, next, now)))
    }

    async fn advance_tweet_status(
        &self,
        tweet_id: &str,
        next: CrawlStatus,
        _now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut state = self.state();
        let Some(tweet) = state.tweets.get_mut(tweet_id) else {
            return Ok(false);
        };
        if !tweet.retweeter_status.can_advance_to(next) {
            return Ok(false);
        }
        tweet.retweeter_status = next;
        Ok(true)
    }

    async fn user_exists(&self, id: &str) -> Result<bool> {
        self.check_reads()?;
        Ok(self.state().users.contains_key(id))
    }

    async fn edge_has_tweet(
        &self,
        source: &str,
        target: &str,
        location: &str,
        tweet_id: &str,
    ) -> Result<bool> {
        self.check_reads()?;
        Ok(self
            .edge(source, target, location)
            .is_some_and(|e| e.tweet_ids.iter().any(|t| t == tweet_id)))
    }

    async fn get_user(&self, id: &str) -> Result<Option<User>> {
        self.check_reads()?;
        Ok(self.user(id))
    }

    async fn get_tweet(&self, id: &str) -> Result<Option<Tweet>> {
        self.check_reads()?;
        Ok(self.tweet(id))
    }
}

// ---------------------------------------------------------------------------
// MemoryQueue
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct StoredMessage {
    id: i64,
    queue: QueueKind,
    body: String,
    receipt: Option<Uuid>,
    hidden_until: Option<Instant>,
    receive_count: i32,
}

/// Visibility-timeout queue in memory. Leases never expire on their own;
/// `expire_all` simulates every visibility timeout elapsing at once.
pub struct MemoryQueue {
    visibility_timeout: Duration,
    next_id: AtomicI64,
    messages: Mutex<Vec<StoredMessage>>,
    extensions: Mutex<Vec<(i64, Duration)>>,
    fail_sends: AtomicBool,
    fail_receives: AtomicBool,
    receives: AtomicI64,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self {
            visibility_timeout: Duration::from_secs(3600),
            next_id: AtomicI64::new(1),
            messages: Mutex::new(Vec::new()),
            extensions: Mutex::new(Vec::new()),
            fail_sends: AtomicBool::new(false),
            fail_receives: AtomicBool::new(false),
            receives: AtomicI64::new(0),
        }
    }

    /// Enqueue a raw body, bypassing serialization.
    pub fn push_raw(&self, queue: QueueKind, body: &str) -> i64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.messages.lock().unwrap().push(StoredMessage {
            id,
            queue,
            body: body.to_string(),
            receipt: None,
            hidden_until: None,
            receive_count: 0,
        });
        id
    }

    pub fn push(&self, queue: QueueKind, task: &CrawlTask) -> i64 {
        let body = serde_json::to_string(task).unwrap();
        self.push_raw(queue, &body)
    }

    /// Make every leased message visible again.
    pub fn expire_all(&self) {
        for m in self.messages.lock().unwrap().iter_mut() {
            m.hidden_until = None;
        }
    }

    /// Tasks still in `queue` (leased or not).
    pub fn tasks(&self, queue: QueueKind) -> Vec<CrawlTask> {
        self.messages
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m.queue == queue)
            .filter_map(|m| serde_json::from_str(&m.body).ok())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.messages.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every visibility extension requested, as (message id, duration).
    pub fn extensions(&self) -> Vec<(i64, Duration)> {
        self.extensions.lock().unwrap().clone()
    }

    pub fn fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    /// Make every `receive` fail immediately, without waiting.
    pub fn fail_receives(&self, fail: bool) {
        self.fail_receives.store(fail, Ordering::SeqCst);
    }

    /// Number of `receive` calls so far, failed ones included.
    pub fn receive_calls(&self) -> i64 {
        self.receives.load(Ordering::SeqCst)
    }

    fn lease(&self, queue: QueueKind) -> Option<Message> {
        let now = Instant::now();
        let mut messages = self.messages.lock().unwrap();
        let m = messages
            .iter_mut()
            .find(|m| m.queue == queue && m.hidden_until.map_or(true, |t| t <= now))?;
        let receipt = Uuid::new_v4();
        m.receipt = Some(receipt);
        m.hidden_until = Some(now + self.visibility_timeout);
        m.receive_count += 1;
        Some(Message {
            id: m.id,
            queue: m.queue,
            body: m.body.clone(),
            receipt,
            receive_count: m.receive_count,
        })
    }
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WorkQueue for MemoryQueue {
    async fn receive(
        &self,
        queue: QueueKind,
        max_wait: Duration,
    ) -> queue::Result<Option<Message>> {
        self.receives.fetch_add(1, Ordering::SeqCst);
        if self.fail_receives.load(Ordering::SeqCst) {
            return Err(QueueError::Database(sqlx::Error::PoolTimedOut));
        }
        if let Some(message) = self.lease(queue) {
            return Ok(Some(message));
        }
        // Long poll: nothing is sent while we wait, so the answer won't change.
        tokio::time::sleep(max_wait).await;
        Ok(None)
    }

    async fn extend_visibility(&self, message: &Message, by: Duration) -> queue::Result<()> {
        let mut messages = self.messages.lock().unwrap();
        let m = messages
            .iter_mut()
            .find(|m| m.id == message.id && m.receipt == Some(message.receipt))
            .ok_or(QueueError::LeaseLost(message.id))?;
        m.hidden_until = Some(Instant::now() + by);
        self.extensions.lock().unwrap().push((message.id, by));
        Ok(())
    }

    async fn delete(&self, message: &Message) -> queue::Result<()> {
        let mut messages = self.messages.lock().unwrap();
        let before = messages.len();
        messages.retain(|m| !(m.id == message.id && m.receipt == Some(message.receipt)));
        if messages.len() == before {
            return Err(QueueError::LeaseLost(message.id));
        }
        Ok(())
    }

    async fn send(&self, queue: QueueKind, task: &CrawlTask) -> queue::Result<()> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(QueueError::Database(sqlx::Error::PoolTimedOut));
        }
        self.push(queue, task);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MemoryBlobs
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryBlobs {
    objects: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryBlobs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.objects
            .lock()
            .unwrap()
            .get(key)
            .map(|b| String::from_utf8_lossy(b).into_owned())
    }

    pub fn keys(&self) -> BTreeSet<String> {
        self.objects.lock().unwrap().keys().cloned().collect()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobs {
    async fn put(&self, key: &str, bytes: &[u8]) -> blob::Result<()> {
        self.objects
            .lock()
            .unwrap()
            .insert(key.to_string(), bytes.to_vec());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// ScriptedSource
// ---------------------------------------------------------------------------

/// One platform response. A `Page` carries a next cursor whenever further
/// steps follow it in the script.
#[derive(Debug, Clone)]
pub enum Step<R> {
    Page(Vec<R>),
    RateLimited,
    NotFound,
    Failure,
    Unauthorized,
}

/// Builder pattern: `.on_followers()`, `.on_retweeters()`, `.on_timeline()`,
/// `.on_search()`, `.on_lookup()`. Unscripted resources answer `NotFound`.
#[derive(Default)]
pub struct ScriptedSource {
    followers: HashMap<String, Vec<Step<RawUser>>>,
    retweeters: HashMap<String, Vec<Step<RawUser>>>,
    timelines: HashMap<String, Vec<Step<RawTweet>>>,
    searches: HashMap<String, Vec<Step<RawTweet>>>,
    lookups: HashMap<String, RawUser>,
    requests: Mutex<Vec<(String, Option<String>)>>,
}

impl ScriptedSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_followers(mut self, user_id: &str, steps: Vec<Step<RawUser>>) -> Self {
        self.followers.insert(user_id.to_string(), steps);
        self
    }

    pub fn on_retweeters(mut self, tweet_id: &str, steps: Vec<Step<RawUser>>) -> Self {
        self.retweeters.insert(tweet_id.to_string(), steps);
        self
    }

    pub fn on_timeline(mut self, user_id: &str, steps: Vec<Step<RawTweet>>) -> Self {
        self.timelines.insert(user_id.to_string(), steps);
        self
    }

    pub fn on_search(mut self, query: &str, steps: Vec<Step<RawTweet>>) -> Self {
        self.searches.insert(query.to_string(), steps);
        self
    }

    pub fn on_lookup(mut self, user: RawUser) -> Self {
        self.lookups.insert(user.id().to_string(), user);
        self
    }

    /// Every fetch made so far, as (resource, cursor).
    pub fn requests(&self) -> Vec<(String, Option<String>)> {
        self.requests.lock().unwrap().clone()
    }

    fn fetcher<'a, R: Clone + Send + Sync>(
        &'a self,
        resource: String,
        steps: Option<&'a Vec<Step<R>>>,
    ) -> Box<dyn PageFetcher<R> + 'a> {
        Box::new(ScriptFetcher {
            resource,
            steps: steps.map(Vec::as_slice).unwrap_or_default(),
            position: Mutex::new(0),
            requests: &self.requests,
        })
    }
}

struct ScriptFetcher<'a, R> {
    resource: String,
    steps: &'a [Step<R>],
    position: Mutex<usize>,
    requests: &'a Mutex<Vec<(String, Option<String>)>>,
}

#[async_trait]
impl<R: Clone + Send + Sync> PageFetcher<R> for ScriptFetcher<'_, R> {
    fn resource(&self) -> String {
        self.resource.clone()
    }

    async fn fetch_page(&self, cursor: Option<&str>) -> twitter_client::Result<Page<R>> {
        self.requests
            .lock()
            .unwrap()
            .push((self.resource.clone(), cursor.map(String::from)));
        if self.steps.is_empty() {
            return Err(TwitterError::NotFound(self.resource.clone()));
        }

        let index = {
            let mut position = self.position.lock().unwrap();
            let index = *position;
            *position += 1;
            index
        };
        match self.steps.get(index) {
            None => Ok(Page::last(Vec::new())),
            Some(Step::Page(records)) => Ok(Page {
                records: records.clone(),
                next_cursor: (index + 1 < self.steps.len()).then(|| format!("c{}", index + 1)),
            }),
            Some(Step::RateLimited) => Err(TwitterError::RateLimited { reset_after: None }),
            Some(Step::NotFound) => Err(TwitterError::NotFound(self.resource.clone())),
            Some(Step::Failure) => Err(TwitterError::Api {
                status: 503,
                message: "scripted failure".to_string(),
            }),
            Some(Step::Unauthorized) => Err(TwitterError::Unauthorized {
                status: 401,
                message: "scripted".to_string(),
            }),
        }
    }
}

#[async_trait]
impl CrawlSource for ScriptedSource {
    fn followers<'a>(&'a self, user_id: &'a str) -> Box<dyn PageFetcher<RawUser> + 'a> {
        self.fetcher(format!("followers:{user_id}"), self.followers.get(user_id))
    }

    fn retweeters<'a>(&'a self, tweet_id: &'a str) -> Box<dyn PageFetcher<RawUser> + 'a> {
        self.fetcher(format!("retweeters:{tweet_id}"), self.retweeters.get(tweet_id))
    }

    fn user_tweets<'a>(&'a self, user_id: &'a str) -> Box<dyn PageFetcher<RawTweet> + 'a> {
        self.fetcher(format!("user_tweets:{user_id}"), self.timelines.get(user_id))
    }

    fn search<'a>(&'a self, query: &'a str) -> Box<dyn PageFetcher<RawTweet> + 'a> {
        self.fetcher(format!("search:{query}"), self.searches.get(query))
    }

    async fn lookup_users(&self, ids: &[String]) -> Result<Vec<RawUser>> {
        Ok(ids
            .iter()
            .filter_map(|id| self.lookups.get(id).cloned())
            .collect())
    }
}
