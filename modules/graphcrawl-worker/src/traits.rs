// Trait abstractions for Consumer dependencies.
//
// GraphStore: the upsert engine's writes and read predicates.
// CrawlSource: builds a resource-bound PageFetcher for each queue kind.
//
// Together with WorkQueue and BlobStore these let the Consumer run against
// the in-memory mocks in `testing.rs`: no network, no database, no Docker.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use twitter_client::{RawTweet, RawUser};

use graphcrawl_common::{
    CrawlStatus, EdgeChange, FollowEdge, RetweetEdge, StatusDimension, Tweet, User,
};
use graphcrawl_graph::GraphWriter;

use crate::paginator::PageFetcher;

// ---------------------------------------------------------------------------
// GraphStore
// ---------------------------------------------------------------------------

#[async_trait]
pub trait GraphStore: Send + Sync {
    /// Returns true if the user vertex was created.
    async fn upsert_user(&self, user: &User) -> Result<bool>;

    /// Returns true if the tweet vertex was created.
    async fn upsert_tweet(&self, tweet: &Tweet) -> Result<bool>;

    async fn upsert_retweet_edge(&self, edge: &RetweetEdge) -> Result<EdgeChange>;

    /// Returns true if the edge was created.
    async fn upsert_follow_edge(&self, edge: &FollowEdge) -> Result<bool>;

    /// Forward-only status move. Returns true if the field changed.
    async fn advance_status(
        &self,
        user_id: &str,
        dimension: StatusDimension,
        next: CrawlStatus,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    async fn advance_tweet_status(
        &self,
        tweet_id: &str,
        next: CrawlStatus,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    async fn user_exists(&self, id: &str) -> Result<bool>;

    async fn edge_has_tweet(
        &self,
        source: &str,
        target: &str,
        location: &str,
        tweet_id: &str,
    ) -> Result<bool>;

    async fn get_user(&self, id: &str) -> Result<Option<User>>;

    async fn get_tweet(&self, id: &str) -> Result<Option<Tweet>>;
}

#[async_trait]
impl GraphStore for GraphWriter {
    async fn upsert_user(&self, user: &User) -> Result<bool> {
        Ok(GraphWriter::upsert_user(self, user).await?)
    }

    async fn upsert_tweet(&self, tweet: &Tweet) -> Result<bool> {
        Ok(GraphWriter::upsert_tweet(self, tweet).await?)
    }

    async fn upsert_retweet_edge(&self, edge: &RetweetEdge) -> Result<EdgeChange> {
        Ok(GraphWriter::upsert_retweet_edge(self, edge).await?)
    }

    async fn upsert_follow_edge(&self, edge: &FollowEdge) -> Result<bool> {
        Ok(GraphWriter::upsert_follow_edge(self, edge).await?)
    }

    async fn advance_status(
        &self,
        user_id: &str,
        dimension: StatusDimension,
        next: CrawlStatus,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        Ok(GraphWriter::advance_status(self, user_id, dimension, next, now).await?)
    }

    async fn advance_tweet_status(
        &self,
        tweet_id: &str,
        next: CrawlStatus,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        Ok(GraphWriter::advance_tweet_status(self, tweet_id, next, now).await?)
    }

    async fn user_exists(&self, id: &str) -> Result<bool> {
        Ok(GraphWriter::user_exists(self, id).await?)
    }

    async fn edge_has_tweet(
        &self,
        source: &str,
        target: &str,
        location: &str,
        tweet_id: &str,
    ) -> Result<bool> {
        Ok(GraphWriter::edge_has_tweet(self, source, target, location, tweet_id).await?)
    }

    async fn get_user(&self, id: &str) -> Result<Option<User>> {
        Ok(GraphWriter::get_user(self, id).await?)
    }

    async fn get_tweet(&self, id: &str) -> Result<Option<Tweet>> {
        Ok(GraphWriter::get_tweet(self, id).await?)
    }
}

// ---------------------------------------------------------------------------
// CrawlSource
// ---------------------------------------------------------------------------

/// Platform resources the Consumer paginates, one fetcher per task.
#[async_trait]
pub trait CrawlSource: Send + Sync {
    fn followers<'a>(&'a self, user_id: &'a str) -> Box<dyn PageFetcher<RawUser> + 'a>;

    fn retweeters<'a>(&'a self, tweet_id: &'a str) -> Box<dyn PageFetcher<RawUser> + 'a>;

    fn user_tweets<'a>(&'a self, user_id: &'a str) -> Box<dyn PageFetcher<RawTweet> + 'a>;

    fn search<'a>(&'a self, query: &'a str) -> Box<dyn PageFetcher<RawTweet> + 'a>;

    /// Full profiles for a batch of ids (seeding).
    async fn lookup_users(&self, ids: &[String]) -> Result<Vec<RawUser>>;
}
