use std::collections::HashSet;

use chrono::{DateTime, Utc};
use graphcrawl_common::{CrawlStatus, LocationProfile, Tweet, User};
use tracing::warn;
use twitter_client::{RawTweet, RawUser, V1Tweet, V1User, V2Tweet, V2User};

/// Legacy timestamp format used by v1.1, e.g. `Wed Oct 10 20:19:24 +0000 2018`.
const V1_DATE_FORMAT: &str = "%a %b %d %H:%M:%S %z %Y";

/// Crawl context stamped onto every normalized record.
#[derive(Debug, Clone, Copy)]
pub struct NormalizeContext<'a> {
    pub location: &'a LocationProfile,
    /// Seed users start with both dimensions `Completed`; everyone else `Pending`.
    pub root: bool,
    /// Author to fall back on for tweets that don't carry one (a timeline's
    /// owner).
    pub owner_id: Option<&'a str>,
    pub now: DateTime<Utc>,
}

impl<'a> NormalizeContext<'a> {
    pub fn new(location: &'a LocationProfile, now: DateTime<Utc>) -> Self {
        Self {
            location,
            root: false,
            owner_id: None,
            now,
        }
    }

    pub fn root(mut self) -> Self {
        self.root = true;
        self
    }

    pub fn owned_by(mut self, owner_id: &'a str) -> Self {
        self.owner_id = Some(owner_id);
        self
    }

    fn initial_status(&self) -> CrawlStatus {
        if self.root {
            CrawlStatus::Completed
        } else {
            CrawlStatus::Pending
        }
    }
}

/// Map raw platform users onto the canonical model. Duplicates (by id) keep
/// the first occurrence; records with no id are dropped.
pub fn normalize_users(raw: &[RawUser], ctx: &NormalizeContext<'_>) -> Vec<User> {
    let mut seen = HashSet::new();
    raw.iter()
        .filter_map(|r| {
            let user = match r {
                RawUser::V2(u) => from_v2_user(u, ctx),
                RawUser::V1(u) => from_v1_user(u, ctx),
            };
            if user.id.is_empty() {
                warn!(handle = user.handle.as_str(), "Dropping user record without id");
                return None;
            }
            seen.insert(user.id.clone()).then_some(user)
        })
        .collect()
}

/// Map raw platform tweets onto the canonical model. Tweets whose author
/// cannot be determined are dropped.
pub fn normalize_tweets(raw: &[RawTweet], ctx: &NormalizeContext<'_>) -> Vec<Tweet> {
    let mut seen = HashSet::new();
    raw.iter()
        .filter_map(|r| {
            let tweet = match r {
                RawTweet::V2 { tweet, author } => from_v2_tweet(tweet, author.as_ref(), ctx),
                RawTweet::V1(t) => from_v1_tweet(t, ctx),
            };
            if tweet.id.is_empty() {
                warn!("Dropping tweet record without id");
                return None;
            }
            if tweet.user_id.is_empty() {
                warn!(tweet_id = tweet.id.as_str(), "Dropping tweet without author");
                return None;
            }
            seen.insert(tweet.id.clone()).then_some(tweet)
        })
        .collect()
}

fn base_user(
    id: &str,
    handle: &str,
    bio: Option<&str>,
    profile_location: Option<&str>,
    ctx: &NormalizeContext<'_>,
) -> User {
    let profile_location = profile_location.unwrap_or_default().trim().to_string();
    let status = ctx.initial_status();
    User {
        id: id.trim().to_string(),
        handle: handle.to_string(),
        bio: bio.unwrap_or_default().to_string(),
        location_match: ctx.location.matches(&profile_location),
        profile_location,
        followers_count: 0,
        following_count: 0,
        tweet_count: 0,
        verified: false,
        created_at: None,
        location_tag: ctx.location.tag.clone(),
        category: None,
        retweeter_status: status,
        retweeter_last_processed: ctx.now,
        follower_status: status,
        follower_last_processed: ctx.now,
        extracted_at: ctx.now,
        last_updated: ctx.now,
    }
}

fn from_v2_user(u: &V2User, ctx: &NormalizeContext<'_>) -> User {
    let metrics = u.public_metrics.clone().unwrap_or_default();
    User {
        followers_count: metrics.followers_count,
        following_count: metrics.following_count,
        tweet_count: metrics.tweet_count,
        verified: u.verified.unwrap_or(false),
        created_at: u.created_at,
        ..base_user(
            &u.id,
            &u.username,
            u.description.as_deref(),
            u.location.as_deref(),
            ctx,
        )
    }
}

fn from_v1_user(u: &V1User, ctx: &NormalizeContext<'_>) -> User {
    User {
        followers_count: u.followers_count,
        following_count: u.friends_count,
        tweet_count: u.statuses_count,
        verified: u.verified,
        created_at: u.created_at.as_deref().and_then(parse_v1_date),
        ..base_user(
            &u.id_str,
            &u.screen_name,
            u.description.as_deref(),
            u.location.as_deref(),
            ctx,
        )
    }
}

fn from_v2_tweet(t: &V2Tweet, author: Option<&V2User>, ctx: &NormalizeContext<'_>) -> Tweet {
    let metrics = t.public_metrics.clone().unwrap_or_default();
    let user_id = t
        .author_id
        .as_deref()
        .or(author.map(|a| a.id.as_str()))
        .or(ctx.owner_id)
        .unwrap_or_default();
    Tweet {
        id: t.id.trim().to_string(),
        text: t.text.clone(),
        created_at: t.created_at,
        retweet_count: metrics.retweet_count,
        favorite_count: metrics.like_count,
        user_id: user_id.to_string(),
        location_tag: ctx.location.tag.clone(),
        retweeter_status: CrawlStatus::Pending,
        extracted_at: ctx.now,
    }
}

fn from_v1_tweet(t: &V1Tweet, ctx: &NormalizeContext<'_>) -> Tweet {
    let user_id = t
        .user
        .as_ref()
        .map(|u| u.id_str.as_str())
        .or(ctx.owner_id)
        .unwrap_or_default();
    Tweet {
        id: t.id_str.trim().to_string(),
        text: t.content().to_string(),
        created_at: t.created_at.as_deref().and_then(parse_v1_date),
        retweet_count: t.retweet_count,
        favorite_count: t.favorite_count,
        user_id: user_id.to_string(),
        location_tag: ctx.location.tag.clone(),
        retweeter_status: CrawlStatus::Pending,
        extracted_at: ctx.now,
    }
}

fn parse_v1_date(s: &str) -> Option<DateTime<Utc>> {
    match DateTime::parse_from_str(s, V1_DATE_FORMAT) {
        Ok(dt) => Some(dt.with_timezone(&Utc)),
        Err(e) => {
            warn!(value = s, error = %e, "Unparseable v1 timestamp");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use graphcrawl_common::locations;
    use twitter_client::{V2TweetMetrics, V2UserMetrics};

    use super::*;

    fn v2_user(id: &str, location: &str, followers: i64) -> RawUser {
        RawUser::V2(V2User {
            id: id.into(),
            username: format!("user{id}"),
            name: None,
            description: Some("bio".into()),
            location: Some(location.into()),
            verified: Some(true),
            created_at: None,
            public_metrics: Some(V2UserMetrics {
                followers_count: followers,
                following_count: 10,
                tweet_count: 20,
            }),
        })
    }

    fn v1_user(id: &str, location: &str) -> V1User {
        V1User {
            id_str: id.into(),
            screen_name: format!("legacy{id}"),
            description: None,
            location: Some(location.into()),
            followers_count: 3000,
            friends_count: 40,
            statuses_count: 50,
            verified: false,
            created_at: Some("Wed Oct 10 20:19:24 +0000 2018".into()),
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn v2_users_are_stamped_with_context() {
        let lagos = locations::profile("lagos");
        let ctx = NormalizeContext::new(&lagos, now());
        let users = normalize_users(&[v2_user("1", "Lekki, Lagos", 4000)], &ctx);

        let u = &users[0];
        assert_eq!(u.handle, "user1");
        assert_eq!(u.followers_count, 4000);
        assert!(u.verified);
        assert!(u.location_match);
        assert_eq!(u.location_tag, "lagos");
        assert_eq!(u.follower_status, CrawlStatus::Pending);
        assert_eq!(u.retweeter_status, CrawlStatus::Pending);
        assert_eq!(u.extracted_at, now());
        assert_eq!(u.last_updated, now());
    }

    #[test]
    fn v1_users_map_legacy_fields() {
        let lagos = locations::profile("lagos");
        let ctx = NormalizeContext::new(&lagos, now());
        let users = normalize_users(&[RawUser::V1(v1_user("9", "Abuja"))], &ctx);

        let u = &users[0];
        assert_eq!(u.handle, "legacy9");
        assert_eq!(u.following_count, 40);
        assert_eq!(u.tweet_count, 50);
        assert!(!u.location_match);
        assert_eq!(
            u.created_at,
            Some(Utc.with_ymd_and_hms(2018, 10, 10, 20, 19, 24).unwrap())
        );
    }

    #[test]
    fn root_users_start_completed() {
        let lagos = locations::profile("lagos");
        let ctx = NormalizeContext::new(&lagos, now()).root();
        let users = normalize_users(&[v2_user("1", "Lagos", 10)], &ctx);
        assert_eq!(users[0].follower_status, CrawlStatus::Completed);
        assert_eq!(users[0].retweeter_status, CrawlStatus::Completed);
    }

    #[test]
    fn duplicates_keep_first_and_missing_ids_are_dropped() {
        let lagos = locations::profile("lagos");
        let ctx = NormalizeContext::new(&lagos, now());
        let users = normalize_users(
            &[
                v2_user("1", "Lagos", 100),
                v2_user("", "Lagos", 100),
                v2_user("1", "Accra", 999),
            ],
            &ctx,
        );
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].followers_count, 100);
    }

    #[test]
    fn tweets_take_author_from_record_or_owner() {
        let lagos = locations::profile("lagos");
        let ctx = NormalizeContext::new(&lagos, now()).owned_by("owner");
        let raw = vec![
            RawTweet::V2 {
                tweet: V2Tweet {
                    id: "t1".into(),
                    text: "hello".into(),
                    author_id: None,
                    created_at: None,
                    public_metrics: Some(V2TweetMetrics {
                        retweet_count: 3,
                        like_count: 7,
                    }),
                },
                author: None,
            },
            RawTweet::V1(V1Tweet {
                id_str: "t2".into(),
                full_text: Some("RT @someone: hi".into()),
                text: None,
                created_at: None,
                retweet_count: 0,
                favorite_count: 0,
                user: Some(v1_user("42", "Lagos")),
            }),
        ];
        let tweets = normalize_tweets(&raw, &ctx);

        assert_eq!(tweets[0].user_id, "owner");
        assert_eq!(tweets[0].retweet_count, 3);
        assert_eq!(tweets[0].favorite_count, 7);
        assert!(!tweets[0].is_repost());
        assert_eq!(tweets[1].user_id, "42");
        assert!(tweets[1].is_repost());
        assert!(tweets.iter().all(|t| t.retweeter_status == CrawlStatus::Pending));
    }

    #[test]
    fn tweets_without_author_are_dropped() {
        let lagos = locations::profile("lagos");
        let ctx = NormalizeContext::new(&lagos, now());
        let raw = vec![RawTweet::V2 {
            tweet: V2Tweet {
                id: "t1".into(),
                text: "orphan".into(),
                author_id: None,
                created_at: None,
                public_metrics: None,
            },
            author: None,
        }];
        assert!(normalize_tweets(&raw, &ctx).is_empty());
    }

    #[test]
    fn bad_v1_date_becomes_none() {
        assert_eq!(parse_v1_date("yesterday"), None);
    }
}
