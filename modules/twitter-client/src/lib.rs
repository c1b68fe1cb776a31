pub mod error;
pub mod types;

pub use error::{ErrorClass, Result, TwitterError};
pub use types::{
    ApiFlavor, Page, RawTweet, RawUser, V1Tweet, V1User, V2Tweet, V2TweetMetrics, V2User,
    V2UserMetrics,
};

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use serde::de::DeserializeOwned;
use types::{V1SearchResponse, V1UserList, V2Response};

const BASE_URL: &str = "https://api.twitter.com";

const V2_USER_FIELDS: &str = "description,location,public_metrics,verified,created_at";
const V2_TWEET_FIELDS: &str = "created_at,public_metrics,author_id";

/// v2 list endpoints reject `max_results` outside this range.
const V2_MAX_RESULTS: (u32, u32) = (10, 100);

pub struct TwitterClient {
    client: reqwest::Client,
    token: String,
    flavor: ApiFlavor,
    base_url: String,
}

impl TwitterClient {
    pub fn new(token: String, flavor: ApiFlavor) -> Self {
        Self::with_base_url(token, flavor, BASE_URL.to_string())
    }

    pub fn with_base_url(token: String, flavor: ApiFlavor, base_url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            token,
            flavor,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn flavor(&self) -> ApiFlavor {
        self.flavor
    }

    /// One page of the accounts following `user_id`.
    pub async fn followers_page(
        &self,
        user_id: &str,
        cursor: Option<&str>,
        page_size: u32,
    ) -> Result<Page<RawUser>> {
        match self.flavor {
            ApiFlavor::V2 => {
                let url = format!("{}/2/users/{}/followers", self.base_url, user_id);
                self.v2_users(&url, cursor, page_size).await
            }
            ApiFlavor::V1 => {
                let url = format!("{}/1.1/followers/list.json", self.base_url);
                let mut params = vec![
                    ("user_id", user_id.to_string()),
                    ("count", page_size.min(200).to_string()),
                    ("skip_status", "true".to_string()),
                ];
                if let Some(c) = cursor {
                    params.push(("cursor", c.to_string()));
                }
                let list: V1UserList = self.get(&url, &params).await?;
                let next_cursor = list.next_cursor_str.filter(|c| c != "0" && !c.is_empty());
                Ok(Page {
                    records: list.users.into_iter().map(RawUser::V1).collect(),
                    next_cursor,
                })
            }
        }
    }

    /// One page of the accounts that retweeted `tweet_id`.
    pub async fn retweeters_page(
        &self,
        tweet_id: &str,
        cursor: Option<&str>,
        page_size: u32,
    ) -> Result<Page<RawUser>> {
        match self.flavor {
            ApiFlavor::V2 => {
                let url = format!("{}/2/tweets/{}/retweeted_by", self.base_url, tweet_id);
                self.v2_users(&url, cursor, page_size).await
            }
            ApiFlavor::V1 => {
                // statuses/retweets is not cursored: a single page of at most 100.
                let url = format!("{}/1.1/statuses/retweets/{}.json", self.base_url, tweet_id);
                let params = vec![("count", page_size.min(100).to_string())];
                let tweets: Vec<V1Tweet> = self.get(&url, &params).await?;
                Ok(Page::last(
                    tweets
                        .into_iter()
                        .filter_map(|t| t.user.map(RawUser::V1))
                        .collect(),
                ))
            }
        }
    }

    /// One page of the timeline of `user_id`.
    pub async fn user_tweets_page(
        &self,
        user_id: &str,
        cursor: Option<&str>,
        page_size: u32,
    ) -> Result<Page<RawTweet>> {
        match self.flavor {
            ApiFlavor::V2 => {
                let url = format!("{}/2/users/{}/tweets", self.base_url, user_id);
                let mut params = vec![
                    ("max_results", clamp_v2(page_size).to_string()),
                    ("tweet.fields", V2_TWEET_FIELDS.to_string()),
                ];
                if let Some(c) = cursor {
                    params.push(("pagination_token", c.to_string()));
                }
                self.v2_tweets(&url, &params).await
            }
            ApiFlavor::V1 => {
                let url = format!("{}/1.1/statuses/user_timeline.json", self.base_url);
                let mut params = vec![
                    ("user_id", user_id.to_string()),
                    ("count", page_size.min(200).to_string()),
                    ("tweet_mode", "extended".to_string()),
                ];
                if let Some(c) = cursor {
                    params.push(("max_id", c.to_string()));
                }
                let tweets: Vec<V1Tweet> = self.get(&url, &params).await?;
                Ok(v1_max_id_page(tweets))
            }
        }
    }

    /// One page of recent tweets matching `query`, authors joined in.
    pub async fn search_page(
        &self,
        query: &str,
        cursor: Option<&str>,
        page_size: u32,
    ) -> Result<Page<RawTweet>> {
        match self.flavor {
            ApiFlavor::V2 => {
                let url = format!("{}/2/tweets/search/recent", self.base_url);
                let mut params = vec![
                    ("query", query.to_string()),
                    ("max_results", clamp_v2(page_size).to_string()),
                    ("tweet.fields", V2_TWEET_FIELDS.to_string()),
                    ("expansions", "author_id".to_string()),
                    ("user.fields", V2_USER_FIELDS.to_string()),
                ];
                if let Some(c) = cursor {
                    params.push(("next_token", c.to_string()));
                }
                self.v2_tweets(&url, &params).await
            }
            ApiFlavor::V1 => {
                let url = format!("{}/1.1/search/tweets.json", self.base_url);
                let mut params = vec![
                    ("q", query.to_string()),
                    ("count", page_size.min(100).to_string()),
                    ("tweet_mode", "extended".to_string()),
                ];
                if let Some(c) = cursor {
                    params.push(("max_id", c.to_string()));
                }
                let resp: V1SearchResponse = self.get(&url, &params).await?;
                Ok(v1_max_id_page(resp.statuses))
            }
        }
    }

    /// Look up full profiles for a batch of ids (seeding).
    pub async fn users_by_ids(&self, ids: &[String]) -> Result<Vec<RawUser>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let joined = ids.join(",");
        match self.flavor {
            ApiFlavor::V2 => {
                let url = format!("{}/2/users", self.base_url);
                let params = vec![("ids", joined), ("user.fields", V2_USER_FIELDS.to_string())];
                let resp: V2Response<V2User> = self.get(&url, &params).await?;
                Ok(resp.data.into_iter().map(RawUser::V2).collect())
            }
            ApiFlavor::V1 => {
                let url = format!("{}/1.1/users/lookup.json", self.base_url);
                let params = vec![("user_id", joined)];
                let users: Vec<V1User> = self.get(&url, &params).await?;
                Ok(users.into_iter().map(RawUser::V1).collect())
            }
        }
    }

    async fn v2_users(
        &self,
        url: &str,
        cursor: Option<&str>,
        page_size: u32,
    ) -> Result<Page<RawUser>> {
        let mut params = vec![
            ("max_results", clamp_v2(page_size).to_string()),
            ("user.fields", V2_USER_FIELDS.to_string()),
        ];
        if let Some(c) = cursor {
            params.push(("pagination_token", c.to_string()));
        }
        let resp: V2Response<V2User> = self.get(url, &params).await?;
        Ok(Page {
            records: resp.data.into_iter().map(RawUser::V2).collect(),
            next_cursor: resp.meta.and_then(|m| m.next_token),
        })
    }

    async fn v2_tweets(&self, url: &str, params: &[(&str, String)]) -> Result<Page<RawTweet>> {
        let resp: V2Response<V2Tweet> = self.get(url, params).await?;
        let authors: HashMap<String, V2User> = resp
            .includes
            .map(|i| i.users)
            .unwrap_or_default()
            .into_iter()
            .map(|u| (u.id.clone(), u))
            .collect();

        let records = resp
            .data
            .into_iter()
            .map(|tweet| {
                let author = tweet
                    .author_id
                    .as_ref()
                    .and_then(|id| authors.get(id))
                    .cloned();
                RawTweet::V2 { tweet, author }
            })
            .collect();

        Ok(Page {
            records,
            next_cursor: resp.meta.and_then(|m| m.next_token),
        })
    }

    async fn get<T: DeserializeOwned>(&self, url: &str, params: &[(&str, String)]) -> Result<T> {
        let resp = self
            .client
            .get(url)
            .bearer_auth(&self.token)
            .query(params)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let reset_after = rate_limit_reset(resp.headers());
            let body = resp.text().await.unwrap_or_default();
            tracing::debug!(url, status = status.as_u16(), "Request failed");
            return Err(match status.as_u16() {
                429 => TwitterError::RateLimited { reset_after },
                404 => TwitterError::NotFound(body),
                400 => TwitterError::BadRequest(body),
                code @ (401 | 403) => TwitterError::Unauthorized {
                    status: code,
                    message: body,
                },
                code => TwitterError::Api {
                    status: code,
                    message: body,
                },
            });
        }

        let body = resp.text().await?;
        Ok(serde_json::from_str(&body)?)
    }
}

fn clamp_v2(page_size: u32) -> u32 {
    page_size.clamp(V2_MAX_RESULTS.0, V2_MAX_RESULTS.1)
}

/// v1.1 timelines page backwards by `max_id`: the next cursor is the oldest
/// id seen minus one. An empty page means exhaustion.
fn v1_max_id_page(tweets: Vec<V1Tweet>) -> Page<RawTweet> {
    let next_cursor = tweets
        .iter()
        .filter_map(|t| t.id_str.parse::<u64>().ok())
        .min()
        .and_then(|oldest| oldest.checked_sub(1))
        .map(|id| id.to_string());
    Page {
        records: tweets.into_iter().map(RawTweet::V1).collect(),
        next_cursor,
    }
}

/// `x-rate-limit-reset` is an epoch second at which the window reopens.
fn rate_limit_reset(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    let reset: i64 = headers
        .get("x-rate-limit-reset")?
        .to_str()
        .ok()?
        .parse()
        .ok()?;
    let secs = reset - Utc::now().timestamp();
    (secs > 0).then(|| Duration::from_secs(secs as u64))
}
