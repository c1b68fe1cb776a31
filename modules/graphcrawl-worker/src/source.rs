use anyhow::Result;
use async_trait::async_trait;
use twitter_client::{Page, RawTweet, RawUser, TwitterClient};

use crate::paginator::PageFetcher;
use crate::traits::CrawlSource;

/// Platform lookups (by id) accept at most this many ids per call.
const LOOKUP_BATCH: usize = 100;

/// [`CrawlSource`] backed by the live platform API.
pub struct TwitterSource {
    client: TwitterClient,
    page_size: u32,
}

impl TwitterSource {
    pub fn new(client: TwitterClient, page_size: u32) -> Self {
        Self { client, page_size }
    }
}

#[derive(Clone, Copy)]
enum UserResource {
    Followers,
    Retweeters,
}

#[derive(Clone, Copy)]
enum TweetResource {
    Timeline,
    Search,
}

/// A user-list resource of one target, bound for the duration of a task.
struct UserFetcher<'a> {
    client: &'a TwitterClient,
    resource: UserResource,
    target: &'a str,
    page_size: u32,
}

#[async_trait]
impl PageFetcher<RawUser> for UserFetcher<'_> {
    fn resource(&self) -> String {
        match self.resource {
            UserResource::Followers => format!("followers:{}", self.target),
            UserResource::Retweeters => format!("retweeters:{}", self.target),
        }
    }

    async fn fetch_page(&self, cursor: Option<&str>) -> twitter_client::Result<Page<RawUser>> {
        match self.resource {
            UserResource::Followers => {
                self.client
                    .followers_page(self.target, cursor, self.page_size)
                    .await
            }
            UserResource::Retweeters => {
                self.client
                    .retweeters_page(self.target, cursor, self.page_size)
                    .await
            }
        }
    }
}

/// A tweet-list resource of one target.
struct TweetFetcher<'a> {
    client: &'a TwitterClient,
    resource: TweetResource,
    target: &'a str,
    page_size: u32,
}

#[async_trait]
impl PageFetcher<RawTweet> for TweetFetcher<'_> {
    fn resource(&self) -> String {
        match self.resource {
            TweetResource::Timeline => format!("user_tweets:{}", self.target),
            TweetResource::Search => format!("search:{}", self.target),
        }
    }

    async fn fetch_page(&self, cursor: Option<&str>) -> twitter_client::Result<Page<RawTweet>> {
        match self.resource {
            TweetResource::Timeline => {
                self.client
                    .user_tweets_page(self.target, cursor, self.page_size)
                    .await
            }
            TweetResource::Search => {
                self.client
                    .search_page(self.target, cursor, self.page_size)
                    .await
            }
        }
    }
}

impl TwitterSource {
    fn users<'a>(
        &'a self,
        resource: UserResource,
        target: &'a str,
    ) -> Box<dyn PageFetcher<RawUser> + 'a> {
        Box::new(UserFetcher {
            client: &self.client,
            resource,
            target,
            page_size: self.page_size,
        })
    }

    fn tweets<'a>(
        &'a self,
        resource: TweetResource,
        target: &'a str,
    ) -> Box<dyn PageFetcher<RawTweet> + 'a> {
        Box::new(TweetFetcher {
            client: &self.client,
            resource,
            target,
            page_size: self.page_size,
        })
    }
}

#[async_trait]
impl CrawlSource for TwitterSource {
    fn followers<'a>(&'a self, user_id: &'a str) -> Box<dyn PageFetcher<RawUser> + 'a> {
        self.users(UserResource::Followers, user_id)
    }

    fn retweeters<'a>(&'a self, tweet_id: &'a str) -> Box<dyn PageFetcher<RawUser> + 'a> {
        self.users(UserResource::Retweeters, tweet_id)
    }

    fn user_tweets<'a>(&'a self, user_id: &'a str) -> Box<dyn PageFetcher<RawTweet> + 'a> {
        self.tweets(TweetResource::Timeline, user_id)
    }

    fn search<'a>(&'a self, query: &'a str) -> Box<dyn PageFetcher<RawTweet> + 'a> {
        self.tweets(TweetResource::Search, query)
    }

    async fn lookup_users(&self, ids: &[String]) -> Result<Vec<RawUser>> {
        let mut users = Vec::with_capacity(ids.len());
        for batch in ids.chunks(LOOKUP_BATCH) {
            users.extend(self.client.users_by_ids(batch).await?);
        }
        Ok(users)
    }
}
