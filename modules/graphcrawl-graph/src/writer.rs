use chrono::{DateTime, Utc};
use neo4rs::{query, Query, Row};
use tracing::debug;

use graphcrawl_common::{
    CrawlStatus, EdgeChange, FollowEdge, RetweetEdge, RetweetEdgeState, StatusDimension, Tweet,
    User,
};

use crate::error::{GraphError, Result};
use crate::retry::{with_conflict_retry, RetryPolicy};
use crate::GraphClient;

/// Write-side wrapper for the crawl graph. Every write is idempotent and
/// safe to repeat after a redelivered task.
#[derive(Clone)]
pub struct GraphWriter {
    client: GraphClient,
    retry: RetryPolicy,
}

impl GraphWriter {
    pub fn new(client: GraphClient) -> Self {
        Self::with_retry(client, RetryPolicy::default())
    }

    pub fn with_retry(client: GraphClient, retry: RetryPolicy) -> Self {
        Self { client, retry }
    }

    pub fn client(&self) -> &GraphClient {
        &self.client
    }

    // --- Vertices ---

    /// Create the user if absent. On a repeat observation only profile
    /// attributes are refreshed; status fields and the research partition are
    /// written on creation only. Returns true if the vertex was created.
    pub async fn upsert_user(&self, user: &User) -> Result<bool> {
        let q = query(
            "OPTIONAL MATCH (existing:User {id: $id})
             WITH existing IS NULL AS created
             MERGE (u:User {id: $id})
             ON CREATE SET
                u.handle = $handle,
                u.bio = $bio,
                u.profile_location = $profile_location,
                u.followers_count = $followers_count,
                u.following_count = $following_count,
                u.tweet_count = $tweet_count,
                u.verified = $verified,
                u.created_at = CASE WHEN $created_at = '' THEN null ELSE datetime($created_at) END,
                u.location_tag = $location_tag,
                u.location_match = $location_match,
                u.category = CASE WHEN $category = '' THEN null ELSE $category END,
                u.retweeter_status = $retweeter_status,
                u.retweeter_last_processed = datetime($retweeter_last_processed),
                u.follower_status = $follower_status,
                u.follower_last_processed = datetime($follower_last_processed),
                u.extracted_at = datetime($extracted_at),
                u.last_updated = datetime($last_updated)
             ON MATCH SET
                u.handle = $handle,
                u.bio = $bio,
                u.profile_location = $profile_location,
                u.followers_count = $followers_count,
                u.following_count = $following_count,
                u.tweet_count = $tweet_count,
                u.verified = $verified,
                u.last_updated = datetime($last_updated)
             RETURN created",
        )
        .param("id", user.id.as_str())
        .param("handle", user.handle.as_str())
        .param("bio", user.bio.as_str())
        .param("profile_location", user.profile_location.as_str())
        .param("followers_count", user.followers_count)
        .param("following_count", user.following_count)
        .param("tweet_count", user.tweet_count)
        .param("verified", user.verified)
        .param(
            "created_at",
            user.created_at
                .map(|dt| format_datetime(&dt))
                .unwrap_or_default(),
        )
        .param("location_tag", user.location_tag.as_str())
        .param("location_match", user.location_match)
        .param("category", user.category.clone().unwrap_or_default())
        .param("retweeter_status", user.retweeter_status.as_str())
        .param(
            "retweeter_last_processed",
            format_datetime(&user.retweeter_last_processed),
        )
        .param("follower_status", user.follower_status.as_str())
        .param(
            "follower_last_processed",
            format_datetime(&user.follower_last_processed),
        )
        .param("extracted_at", format_datetime(&user.extracted_at))
        .param("last_updated", format_datetime(&user.last_updated));

        let created = self.single_bool(q, "created", "upsert_user").await?;
        debug!(user_id = user.id.as_str(), created, "User upserted");
        Ok(created)
    }

    /// Create the tweet if absent and link it to its author when the author
    /// vertex exists. Returns true if the vertex was created.
    pub async fn upsert_tweet(&self, tweet: &Tweet) -> Result<bool> {
        let q = query(
            "OPTIONAL MATCH (existing:Tweet {id: $id})
             WITH existing IS NULL AS created
             MERGE (t:Tweet {id: $id})
             ON CREATE SET
                t.text = $text,
                t.created_at = CASE WHEN $created_at = '' THEN null ELSE datetime($created_at) END,
                t.retweet_count = $retweet_count,
                t.favorite_count = $favorite_count,
                t.user_id = $user_id,
                t.location_tag = $location_tag,
                t.retweeter_status = $retweeter_status,
                t.retweeter_last_processed = datetime($extracted_at),
                t.extracted_at = datetime($extracted_at)
             ON MATCH SET
                t.retweet_count = $retweet_count,
                t.favorite_count = $favorite_count
             WITH t, created
             OPTIONAL MATCH (u:User {id: $user_id})
             FOREACH (_ IN CASE WHEN u IS NULL THEN [] ELSE [1] END |
                MERGE (u)-[:POSTED]->(t))
             RETURN created",
        )
        .param("id", tweet.id.as_str())
        .param("text", tweet.text.as_str())
        .param(
            "created_at",
            tweet
                .created_at
                .map(|dt| format_datetime(&dt))
                .unwrap_or_default(),
        )
        .param("retweet_count", tweet.retweet_count)
        .param("favorite_count", tweet.favorite_count)
        .param("user_id", tweet.user_id.as_str())
        .param("location_tag", tweet.location_tag.as_str())
        .param("retweeter_status", tweet.retweeter_status.as_str())
        .param("extracted_at", format_datetime(&tweet.extracted_at));

        self.single_bool(q, "created", "upsert_tweet").await
    }

    // --- Edges ---

    /// Record one retweet observation on the (source, target, location) edge.
    ///
    /// A new edge starts with weight 1 and `[tweet_id]`. An existing edge is
    /// only changed if `tweet_id` is not yet in its list, so `weight` always
    /// equals `size(tweet_ids)`. The no-op `SET` takes the relationship's
    /// write lock before `tweet_ids` is read, which makes the membership check
    /// and the append atomic against concurrent writers.
    pub async fn upsert_retweet_edge(&self, edge: &RetweetEdge) -> Result<EdgeChange> {
        let q = query(
            "MATCH (s:User {id: $source}), (t:User {id: $target})
             MERGE (s)-[r:RETWEETED {location: $location}]->(t)
             ON CREATE SET r.tweet_ids = [], r.weight = 0
             SET r.weight = coalesce(r.weight, 0)
             WITH r, coalesce(r.tweet_ids, []) AS ids
             WITH r, ids, $tweet_id IN ids AS seen
             WITH r, seen, size(ids) = 0 AS fresh,
                  CASE WHEN seen THEN ids ELSE ids + $tweet_id END AS next_ids
             SET r.tweet_ids = next_ids, r.weight = size(next_ids)
             RETURN seen, fresh",
        )
        .param("source", edge.source.as_str())
        .param("target", edge.target.as_str())
        .param("location", edge.location_tag.as_str())
        .param("tweet_id", edge.tweet_id.as_str());

        let rows = self.execute_with_retry(q, "upsert_retweet_edge").await?;
        let row = rows.first().ok_or_else(|| {
            GraphError::MissingVertex(format!("{} or {}", edge.source, edge.target))
        })?;
        let seen: bool = row.get("seen")?;
        let fresh: bool = row.get("fresh")?;

        Ok(match (seen, fresh) {
            (true, _) => EdgeChange::Unchanged,
            (false, true) => EdgeChange::Created,
            (false, false) => EdgeChange::Incremented,
        })
    }

    /// Create the follow edge if absent. Returns true if it was created.
    pub async fn upsert_follow_edge(&self, edge: &FollowEdge) -> Result<bool> {
        let q = query(
            "MATCH (s:User {id: $source}), (t:User {id: $target})
             OPTIONAL MATCH (s)-[existing:FOLLOWS]->(t)
             WITH s, t, existing IS NULL AS created
             MERGE (s)-[:FOLLOWS]->(t)
             RETURN created",
        )
        .param("source", edge.source.as_str())
        .param("target", edge.target.as_str());

        let rows = self.execute_with_retry(q, "upsert_follow_edge").await?;
        let row = rows.first().ok_or_else(|| {
            GraphError::MissingVertex(format!("{} or {}", edge.source, edge.target))
        })?;
        Ok(row.get("created")?)
    }

    // --- Field-scoped status writes ---

    /// Move one status dimension of a user forward. Backward or repeated
    /// moves match no rows and are no-ops. Returns true if the field changed.
    pub async fn advance_status(
        &self,
        user_id: &str,
        dimension: StatusDimension,
        next: CrawlStatus,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let status_field = dimension.status_field();
        let processed_field = dimension.processed_field();
        let q = query(&format!(
            "MATCH (u:User {{id: $id}})
             WHERE coalesce(u.{status_field}, 'pending') IN $allowed
             SET u.{status_field} = $next,
                 u.{processed_field} = datetime($now)
             RETURN count(u) AS updated"
        ))
        .param("id", user_id)
        .param("allowed", predecessor_strs(next))
        .param("next", next.as_str())
        .param("now", format_datetime(&now));

        self.updated(q, "advance_status").await
    }

    /// Move a tweet's retweeter crawl status forward.
    pub async fn advance_tweet_status(
        &self,
        tweet_id: &str,
        next: CrawlStatus,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let q = query(
            "MATCH (t:Tweet {id: $id})
             WHERE coalesce(t.retweeter_status, 'pending') IN $allowed
             SET t.retweeter_status = $next,
                 t.retweeter_last_processed = datetime($now)
             RETURN count(t) AS updated",
        )
        .param("id", tweet_id)
        .param("allowed", predecessor_strs(next))
        .param("next", next.as_str())
        .param("now", format_datetime(&now));

        self.updated(q, "advance_tweet_status").await
    }

    // --- Read predicates ---

    pub async fn user_exists(&self, id: &str) -> Result<bool> {
        let q = query("MATCH (u:User {id: $id}) RETURN count(u) > 0 AS found").param("id", id);
        self.single_bool(q, "found", "user_exists").await
    }

    pub async fn edge_has_tweet(
        &self,
        source: &str,
        target: &str,
        location: &str,
        tweet_id: &str,
    ) -> Result<bool> {
        Ok(self
            .retweet_edge(source, target, location)
            .await?
            .is_some_and(|state| state.tweet_ids.iter().any(|t| t == tweet_id)))
    }

    pub async fn retweet_edge(
        &self,
        source: &str,
        target: &str,
        location: &str,
    ) -> Result<Option<RetweetEdgeState>> {
        let q = query(
            "MATCH (:User {id: $source})-[r:RETWEETED {location: $location}]->(:User {id: $target})
             RETURN r.weight AS weight, r.tweet_ids AS tweet_ids",
        )
        .param("source", source)
        .param("target", target)
        .param("location", location);

        let rows = self.client.execute(q).await?;
        match rows.first() {
            Some(row) => Ok(Some(RetweetEdgeState {
                weight: row.get("weight")?,
                tweet_ids: row.get("tweet_ids")?,
            })),
            None => Ok(None),
        }
    }

    pub async fn get_user(&self, id: &str) -> Result<Option<User>> {
        let q = query(
            "MATCH (u:User {id: $id})
             RETURN u.id AS id,
                    coalesce(u.handle, '') AS handle,
                    coalesce(u.bio, '') AS bio,
                    coalesce(u.profile_location, '') AS profile_location,
                    coalesce(u.followers_count, 0) AS followers_count,
                    coalesce(u.following_count, 0) AS following_count,
                    coalesce(u.tweet_count, 0) AS tweet_count,
                    coalesce(u.verified, false) AS verified,
                    coalesce(toString(u.created_at), '') AS created_at,
                    coalesce(u.location_tag, '') AS location_tag,
                    coalesce(u.category, '') AS category,
                    coalesce(u.location_match, false) AS location_match,
                    coalesce(u.retweeter_status, 'pending') AS retweeter_status,
                    toString(u.retweeter_last_processed) AS retweeter_last_processed,
                    coalesce(u.follower_status, 'pending') AS follower_status,
                    toString(u.follower_last_processed) AS follower_last_processed,
                    toString(u.extracted_at) AS extracted_at,
                    toString(u.last_updated) AS last_updated",
        )
        .param("id", id);

        let rows = self.client.execute(q).await?;
        rows.first().map(row_to_user).transpose()
    }

    pub async fn get_tweet(&self, id: &str) -> Result<Option<Tweet>> {
        let q = query(
            "MATCH (t:Tweet {id: $id})
             RETURN t.id AS id,
                    coalesce(t.text, '') AS text,
                    coalesce(toString(t.created_at), '') AS created_at,
                    coalesce(t.retweet_count, 0) AS retweet_count,
                    coalesce(t.favorite_count, 0) AS favorite_count,
                    coalesce(t.user_id, '') AS user_id,
                    coalesce(t.location_tag, '') AS location_tag,
                    coalesce(t.retweeter_status, 'pending') AS retweeter_status,
                    toString(t.extracted_at) AS extracted_at",
        )
        .param("id", id);

        let rows = self.client.execute(q).await?;
        rows.first().map(row_to_tweet).transpose()
    }

    // --- Helpers ---

    async fn execute_with_retry(&self, q: Query, what: &str) -> Result<Vec<Row>> {
        with_conflict_retry(&self.retry, what, || self.client.execute(q.clone())).await
    }

    async fn single_bool(&self, q: Query, column: &str, what: &str) -> Result<bool> {
        let rows = self.execute_with_retry(q, what).await?;
        match rows.first() {
            Some(row) => Ok(row.get(column)?),
            None => Ok(false),
        }
    }

    async fn updated(&self, q: Query, what: &str) -> Result<bool> {
        let rows = self.execute_with_retry(q, what).await?;
        match rows.first() {
            Some(row) => Ok(row.get::<i64>("updated")? > 0),
            None => Ok(false),
        }
    }
}

fn predecessor_strs(next: CrawlStatus) -> Vec<String> {
    CrawlStatus::predecessors(next)
        .into_iter()
        .map(|s| s.as_str().to_string())
        .collect()
}

fn row_to_user(row: &Row) -> Result<User> {
    let category: String = row.get("category")?;
    Ok(User {
        id: row.get("id")?,
        handle: row.get("handle")?,
        bio: row.get("bio")?,
        profile_location: row.get("profile_location")?,
        followers_count: row.get("followers_count")?,
        following_count: row.get("following_count")?,
        tweet_count: row.get("tweet_count")?,
        verified: row.get("verified")?,
        created_at: parse_datetime_opt(&row.get::<String>("created_at")?),
        location_tag: row.get("location_tag")?,
        category: (!category.is_empty()).then_some(category),
        location_match: row.get("location_match")?,
        retweeter_status: parse_status(&row.get::<String>("retweeter_status")?)?,
        retweeter_last_processed: required_datetime(row, "retweeter_last_processed")?,
        follower_status: parse_status(&row.get::<String>("follower_status")?)?,
        follower_last_processed: required_datetime(row, "follower_last_processed")?,
        extracted_at: required_datetime(row, "extracted_at")?,
        last_updated: required_datetime(row, "last_updated")?,
    })
}

fn row_to_tweet(row: &Row) -> Result<Tweet> {
    Ok(Tweet {
        id: row.get("id")?,
        text: row.get("text")?,
        created_at: parse_datetime_opt(&row.get::<String>("created_at")?),
        retweet_count: row.get("retweet_count")?,
        favorite_count: row.get("favorite_count")?,
        user_id: row.get("user_id")?,
        location_tag: row.get("location_tag")?,
        retweeter_status: parse_status(&row.get::<String>("retweeter_status")?)?,
        extracted_at: required_datetime(row, "extracted_at")?,
    })
}

fn parse_status(s: &str) -> Result<CrawlStatus> {
    s.parse().map_err(GraphError::Decode)
}

fn required_datetime(row: &Row, column: &str) -> Result<DateTime<Utc>> {
    let raw: String = row.get(column)?;
    parse_datetime_opt(&raw)
        .ok_or_else(|| GraphError::Decode(format!("invalid datetime in {column}: {raw}")))
}

/// Format a DateTime<Utc> as a local datetime string without timezone offset.
/// Neo4j's datetime() reads this as UTC.
fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.format("%Y-%m-%dT%H:%M:%S%.6f").to_string()
}

/// Parse a datetime as returned by `toString(datetime)` (RFC 3339 with `Z`)
/// or in the offset-free format written by `format_datetime`.
/// Returns None for empty strings or parse failures.
fn parse_datetime_opt(s: &str) -> Option<DateTime<Utc>> {
    if s.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|ndt| ndt.and_utc())
        .ok()
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn datetime_round_trips_through_neo4j_formats() {
        let dt = Utc.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap();
        assert_eq!(parse_datetime_opt(&format_datetime(&dt)), Some(dt));
        assert_eq!(parse_datetime_opt("2024-03-09T14:05:07Z"), Some(dt));
        assert_eq!(parse_datetime_opt(""), None);
        assert_eq!(parse_datetime_opt("yesterday"), None);
    }

    #[test]
    fn predecessors_are_rendered_for_cypher() {
        assert_eq!(predecessor_strs(CrawlStatus::Completed), vec!["pending", "queued"]);
        assert!(predecessor_strs(CrawlStatus::Pending).is_empty());
    }
}
