use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Text prefix that marks a tweet as a repost rather than original content.
pub const REPOST_MARKER: &str = "RT @";

// --- Crawl status ---

/// Progress of one crawl dimension for one entity. Only moves forward:
/// `Pending < Queued < Completed | Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrawlStatus {
    #[default]
    Pending,
    Queued,
    Completed,
    Failed,
}

impl CrawlStatus {
    pub const ALL: [CrawlStatus; 4] = [
        CrawlStatus::Pending,
        CrawlStatus::Queued,
        CrawlStatus::Completed,
        CrawlStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CrawlStatus::Pending => "pending",
            CrawlStatus::Queued => "queued",
            CrawlStatus::Completed => "completed",
            CrawlStatus::Failed => "failed",
        }
    }

    /// Completed and Failed share the top rank: neither can follow the other.
    pub fn rank(&self) -> u8 {
        match self {
            CrawlStatus::Pending => 0,
            CrawlStatus::Queued => 1,
            CrawlStatus::Completed | CrawlStatus::Failed => 2,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.rank() == 2
    }

    pub fn can_advance_to(&self, next: CrawlStatus) -> bool {
        next.rank() > self.rank()
    }

    /// Statuses from which `next` may be reached. Used to guard field-scoped writes.
    pub fn predecessors(next: CrawlStatus) -> Vec<CrawlStatus> {
        Self::ALL
            .into_iter()
            .filter(|s| s.can_advance_to(next))
            .collect()
    }
}

impl fmt::Display for CrawlStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CrawlStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(CrawlStatus::Pending),
            "queued" => Ok(CrawlStatus::Queued),
            "completed" => Ok(CrawlStatus::Completed),
            "failed" => Ok(CrawlStatus::Failed),
            other => Err(format!("unknown crawl status: {other}")),
        }
    }
}

/// The two independent crawl state machines carried by every user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusDimension {
    /// Crawl of who retweets this user (driven by the user's timeline).
    Retweeter,
    /// Crawl of who follows this user.
    Follower,
}

impl StatusDimension {
    pub const ALL: [StatusDimension; 2] = [StatusDimension::Retweeter, StatusDimension::Follower];

    pub fn status_field(&self) -> &'static str {
        match self {
            StatusDimension::Retweeter => "retweeter_status",
            StatusDimension::Follower => "follower_status",
        }
    }

    pub fn processed_field(&self) -> &'static str {
        match self {
            StatusDimension::Retweeter => "retweeter_last_processed",
            StatusDimension::Follower => "follower_last_processed",
        }
    }

    /// Queue whose tasks drive this dimension for a user.
    pub fn queue(&self) -> QueueKind {
        match self {
            StatusDimension::Retweeter => QueueKind::Tweets,
            StatusDimension::Follower => QueueKind::Followers,
        }
    }
}

// --- Queues and tasks ---

/// Task type, implied by the queue a message arrives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueKind {
    /// Target is a user id: fetch the user's tweets.
    Tweets,
    /// Target is a user id: fetch the user's followers.
    Followers,
    /// Target is a tweet id, parent is its author: fetch its retweeters.
    Retweeters,
    /// Target is a search query.
    Search,
}

impl QueueKind {
    pub const ALL: [QueueKind; 4] = [
        QueueKind::Tweets,
        QueueKind::Followers,
        QueueKind::Retweeters,
        QueueKind::Search,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueKind::Tweets => "tweets",
            QueueKind::Followers => "followers",
            QueueKind::Retweeters => "retweeters",
            QueueKind::Search => "search",
        }
    }

    /// The user status dimension this queue owns, if its target is a user.
    pub fn dimension(&self) -> Option<StatusDimension> {
        match self {
            QueueKind::Tweets => Some(StatusDimension::Retweeter),
            QueueKind::Followers => Some(StatusDimension::Follower),
            QueueKind::Retweeters | QueueKind::Search => None,
        }
    }
}

impl fmt::Display for QueueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        QueueKind::ALL
            .into_iter()
            .find(|q| q.as_str() == s)
            .ok_or_else(|| format!("unknown queue: {s}"))
    }
}

/// Body of a queue message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrawlTask {
    pub target_id: String,
    pub location_tag: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
}

impl CrawlTask {
    pub fn new(target_id: impl Into<String>, location_tag: impl Into<String>) -> Self {
        Self {
            target_id: target_id.into(),
            location_tag: location_tag.into(),
            parent_id: None,
        }
    }

    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }
}

// --- Vertices ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub handle: String,
    pub bio: String,
    pub profile_location: String,
    pub followers_count: i64,
    pub following_count: i64,
    pub tweet_count: i64,
    pub verified: bool,
    pub created_at: Option<DateTime<Utc>>,
    /// Research location this user was discovered under.
    pub location_tag: String,
    /// Set later by the content classifier.
    pub category: Option<String>,
    /// Whether `profile_location` matches `location_tag` or one of its aliases.
    pub location_match: bool,
    pub retweeter_status: CrawlStatus,
    pub retweeter_last_processed: DateTime<Utc>,
    pub follower_status: CrawlStatus,
    pub follower_last_processed: DateTime<Utc>,
    pub extracted_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

impl User {
    pub fn status(&self, dimension: StatusDimension) -> CrawlStatus {
        match dimension {
            StatusDimension::Retweeter => self.retweeter_status,
            StatusDimension::Follower => self.follower_status,
        }
    }

    /// Apply a forward status move in memory. Returns false for backward moves.
    pub fn advance(
        &mut self,
        dimension: StatusDimension,
        next: CrawlStatus,
        now: DateTime<Utc>,
    ) -> bool {
        if !self.status(dimension).can_advance_to(next) {
            return false;
        }
        match dimension {
            StatusDimension::Retweeter => {
                self.retweeter_status = next;
                self.retweeter_last_processed = now;
            }
            StatusDimension::Follower => {
                self.follower_status = next;
                self.follower_last_processed = now;
            }
        }
        true
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tweet {
    pub id: String,
    pub text: String,
    pub created_at: Option<DateTime<Utc>>,
    pub retweet_count: i64,
    pub favorite_count: i64,
    pub user_id: String,
    pub location_tag: String,
    /// Progress of the retweeter crawl for this tweet.
    pub retweeter_status: CrawlStatus,
    pub extracted_at: DateTime<Utc>,
}

impl Tweet {
    pub fn is_repost(&self) -> bool {
        self.text.starts_with(REPOST_MARKER)
    }
}

// --- Edges ---

/// A single observation of `source` retweeting `target` via `tweet_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetweetEdge {
    pub source: String,
    pub target: String,
    pub location_tag: String,
    pub tweet_id: String,
}

/// `source` follows `target`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FollowEdge {
    pub source: String,
    pub target: String,
}

/// Stored state of a RETWEETED edge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetweetEdgeState {
    pub weight: i64,
    pub tweet_ids: Vec<String>,
}

/// Outcome of a retweet edge upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeChange {
    Created,
    Incremented,
    /// The tweet id was already recorded on the edge.
    Unchanged,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_only_moves_forward() {
        use CrawlStatus::*;
        assert!(Pending.can_advance_to(Queued));
        assert!(Pending.can_advance_to(Completed));
        assert!(Queued.can_advance_to(Failed));
        assert!(!Queued.can_advance_to(Pending));
        assert!(!Completed.can_advance_to(Failed));
        assert!(!Failed.can_advance_to(Completed));
        assert!(!Queued.can_advance_to(Queued));
    }

    #[test]
    fn predecessors_of_queued_is_pending_only() {
        assert_eq!(
            CrawlStatus::predecessors(CrawlStatus::Queued),
            vec![CrawlStatus::Pending]
        );
        assert_eq!(
            CrawlStatus::predecessors(CrawlStatus::Failed),
            vec![CrawlStatus::Pending, CrawlStatus::Queued]
        );
    }

    #[test]
    fn task_body_round_trips_without_parent() {
        let task = CrawlTask::new("42", "lagos");
        let body = serde_json::to_string(&task).unwrap();
        assert_eq!(body, r#"{"target_id":"42","location_tag":"lagos"}"#);
        let back: CrawlTask = serde_json::from_str(&body).unwrap();
        assert_eq!(back, task);
    }

    #[test]
    fn queue_names_parse() {
        for q in QueueKind::ALL {
            assert_eq!(q.as_str().parse::<QueueKind>().unwrap(), q);
        }
        assert!("likes".parse::<QueueKind>().is_err());
    }

    #[test]
    fn repost_marker_detected() {
        let mut tweet = Tweet {
            id: "1".into(),
            text: "RT @someone: hello".into(),
            created_at: None,
            retweet_count: 0,
            favorite_count: 0,
            user_id: "u".into(),
            location_tag: "lagos".into(),
            retweeter_status: CrawlStatus::Pending,
            extracted_at: Utc::now(),
        };
        assert!(tweet.is_repost());
        tweet.text = "original RT @x".into();
        assert!(!tweet.is_repost());
    }
}
