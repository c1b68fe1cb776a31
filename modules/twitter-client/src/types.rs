use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::Deserialize;

/// Which platform API generation a client talks to. The two return
/// differently shaped records for the same resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ApiFlavor {
    #[default]
    V2,
    V1,
}

impl ApiFlavor {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApiFlavor::V2 => "v2",
            ApiFlavor::V1 => "v1",
        }
    }
}

impl FromStr for ApiFlavor {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "v2" | "2" => Ok(ApiFlavor::V2),
            "v1" | "v1.1" | "1.1" => Ok(ApiFlavor::V1),
            other => Err(format!("unknown API flavor: {other}")),
        }
    }
}

/// One page of results plus the cursor for the next one. `next_cursor` is
/// `None` once the platform reports exhaustion.
#[derive(Debug, Clone)]
pub struct Page<T> {
    pub records: Vec<T>,
    pub next_cursor: Option<String>,
}

impl<T> Page<T> {
    pub fn last(records: Vec<T>) -> Self {
        Self {
            records,
            next_cursor: None,
        }
    }
}

/// A user record as returned by either API flavor.
#[derive(Debug, Clone)]
pub enum RawUser {
    V2(V2User),
    V1(V1User),
}

impl RawUser {
    pub fn id(&self) -> &str {
        match self {
            RawUser::V2(u) => &u.id,
            RawUser::V1(u) => &u.id_str,
        }
    }
}

/// A tweet record as returned by either API flavor. v2 carries the author
/// separately in `includes`, so it is joined in here when available.
#[derive(Debug, Clone)]
pub enum RawTweet {
    V2 {
        tweet: V2Tweet,
        author: Option<V2User>,
    },
    V1(V1Tweet),
}

impl RawTweet {
    pub fn id(&self) -> &str {
        match self {
            RawTweet::V2 { tweet, .. } => &tweet.id,
            RawTweet::V1(t) => &t.id_str,
        }
    }

    pub fn author(&self) -> Option<RawUser> {
        match self {
            RawTweet::V2 { author, .. } => author.clone().map(RawUser::V2),
            RawTweet::V1(t) => t.user.clone().map(RawUser::V1),
        }
    }
}

// --- v2 ---

#[derive(Debug, Clone, Deserialize)]
pub struct V2User {
    pub id: String,
    pub username: String,
    pub name: Option<String>,
    pub description: Option<String>,
    pub location: Option<String>,
    pub verified: Option<bool>,
    pub created_at: Option<DateTime<Utc>>,
    pub public_metrics: Option<V2UserMetrics>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct V2UserMetrics {
    #[serde(default)]
    pub followers_count: i64,
    #[serde(default)]
    pub following_count: i64,
    #[serde(default)]
    pub tweet_count: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct V2Tweet {
    pub id: String,
    pub text: String,
    pub author_id: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub public_metrics: Option<V2TweetMetrics>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct V2TweetMetrics {
    #[serde(default)]
    pub retweet_count: i64,
    #[serde(default)]
    pub like_count: i64,
}

/// Envelope for every v2 list endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct V2Response<T> {
    #[serde(default = "Vec::new")]
    pub data: Vec<T>,
    pub includes: Option<V2Includes>,
    pub meta: Option<V2Meta>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct V2Includes {
    #[serde(default)]
    pub users: Vec<V2User>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct V2Meta {
    pub next_token: Option<String>,
    pub result_count: Option<i64>,
}

// --- v1.1 ---

#[derive(Debug, Clone, Deserialize)]
pub struct V1User {
    pub id_str: String,
    pub screen_name: String,
    pub description: Option<String>,
    pub location: Option<String>,
    #[serde(default)]
    pub followers_count: i64,
    #[serde(default)]
    pub friends_count: i64,
    #[serde(default)]
    pub statuses_count: i64,
    #[serde(default)]
    pub verified: bool,
    /// Legacy format, e.g. `Wed Oct 10 20:19:24 +0000 2018`.
    pub created_at: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct V1Tweet {
    pub id_str: String,
    pub full_text: Option<String>,
    pub text: Option<String>,
    pub created_at: Option<String>,
    #[serde(default)]
    pub retweet_count: i64,
    #[serde(default)]
    pub favorite_count: i64,
    pub user: Option<V1User>,
}

impl V1Tweet {
    /// Returns whichever text field is populated, preferring `full_text`.
    pub fn content(&self) -> &str {
        self.full_text
            .as_deref()
            .or(self.text.as_deref())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct V1UserList {
    #[serde(default)]
    pub users: Vec<V1User>,
    pub next_cursor_str: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct V1SearchResponse {
    #[serde(default)]
    pub statuses: Vec<V1Tweet>,
}
