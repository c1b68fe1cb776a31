// Rate-limited pagination over one cursor-based platform resource.
//
// A fetch either yields a page, asks us to cool down (rate limit), ends the
// resource (not found / bad request / generic failure, partial results kept),
// or is unexpected and propagates.

use std::collections::HashSet;
use std::time::Duration;

use async_stream::stream;
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use tracing::{info, warn};
use twitter_client::{ErrorClass, Page, RawTweet, RawUser, TwitterError};

/// Fetches one page of a resource bound at construction (a user's followers,
/// a tweet's retweeters, a timeline, a search query).
#[async_trait]
pub trait PageFetcher<R>: Send + Sync {
    /// Human-readable resource name for logs.
    fn resource(&self) -> String;

    async fn fetch_page(&self, cursor: Option<&str>) -> twitter_client::Result<Page<R>>;
}

/// Notified before every rate-limit cool-down, so the caller can keep its
/// queue message hidden while the paginator sleeps.
#[async_trait]
pub trait RateLimitObserver: Send + Sync {
    async fn on_rate_limit(&self, cooldown: Duration);
}

/// Observer for callers that hold no lease.
pub struct NoopObserver;

#[async_trait]
impl RateLimitObserver for NoopObserver {
    async fn on_rate_limit(&self, _cooldown: Duration) {}
}

/// Records identify themselves for dedup within one pagination call.
pub trait Keyed {
    fn key(&self) -> &str;
}

impl Keyed for RawUser {
    fn key(&self) -> &str {
        self.id()
    }
}

impl Keyed for RawTweet {
    fn key(&self) -> &str {
        self.id()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The platform returned no further cursor.
    Exhausted,
    TargetReached,
    BatchCeiling,
    /// Not found or bad request. Terminal for this resource only.
    NotFound,
    /// Generic platform failure; whatever was fetched is kept.
    Degraded,
}

impl StopReason {
    pub fn is_partial(&self) -> bool {
        matches!(self, StopReason::NotFound | StopReason::Degraded)
    }
}

#[derive(Debug)]
pub enum PageEvent<R> {
    /// Records of one page not seen earlier in this pagination.
    Page(Vec<R>),
    RateLimited(Duration),
    Stopped(StopReason),
}

#[derive(Debug, thiserror::Error)]
pub enum PaginationError {
    #[error("unexpected platform error on {resource}: {source}")]
    Unexpected {
        resource: String,
        #[source]
        source: TwitterError,
    },
}

/// Everything one pagination call produced.
#[derive(Debug)]
pub struct Harvest<R> {
    /// Union of all page records, first occurrence wins.
    pub records: Vec<R>,
    pub pages: u32,
    pub rate_limit_pauses: u32,
    pub stop: StopReason,
}

#[derive(Debug, Clone)]
pub struct Paginator {
    /// Sleep after a rate-limit signal; the platform's window length.
    pub cooldown: Duration,
    /// Stop after this many successful pages.
    pub max_batches: Option<u32>,
    /// Stop once this many distinct records have been fetched.
    pub target_count: Option<usize>,
}

impl Paginator {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            max_batches: None,
            target_count: None,
        }
    }

    pub fn max_batches(mut self, max_batches: Option<u32>) -> Self {
        self.max_batches = max_batches;
        self
    }

    pub fn target_count(mut self, target_count: Option<usize>) -> Self {
        self.target_count = target_count;
        self
    }

    /// Lazy, finite sequence of pages for one resource. Every call starts
    /// from the first page. Records already yielded are dropped from later
    /// pages, first occurrence wins. The last item is always `Stopped` or an
    /// error.
    pub fn stream<'a, R: Keyed + Send + 'a>(
        &'a self,
        fetcher: &'a dyn PageFetcher<R>,
        observer: &'a dyn RateLimitObserver,
    ) -> impl Stream<Item = Result<PageEvent<R>, PaginationError>> + Send + 'a {
        stream! {
            let mut cursor: Option<String> = None;
            let mut batches: u32 = 0;
            let mut seen: HashSet<String> = HashSet::new();

            loop {
                if self.max_batches.is_some_and(|max| batches >= max) {
                    yield Ok(PageEvent::Stopped(StopReason::BatchCeiling));
                    break;
                }

                match fetcher.fetch_page(cursor.as_deref()).await {
                    Ok(page) => {
                        batches += 1;
                        let next = page.next_cursor;
                        let fresh: Vec<R> = page
                            .records
                            .into_iter()
                            .filter(|r| seen.insert(r.key().to_string()))
                            .collect();
                        // Nothing new behind the same cursor: the platform is looping.
                        let stalled = fresh.is_empty() && next == cursor;
                        yield Ok(PageEvent::Page(fresh));

                        if self.target_count.is_some_and(|target| seen.len() >= target) {
                            yield Ok(PageEvent::Stopped(StopReason::TargetReached));
                            break;
                        }
                        match next {
                            Some(c) if !stalled => cursor = Some(c),
                            _ => {
                                yield Ok(PageEvent::Stopped(StopReason::Exhausted));
                                break;
                            }
                        }
                    }
                    Err(e) => match e.class() {
                        ErrorClass::RateLimited => {
                            let cooldown = match &e {
                                TwitterError::RateLimited { reset_after: Some(reset) } => {
                                    (*reset).max(self.cooldown)
                                }
                                _ => self.cooldown,
                            };
                            info!(
                                resource = fetcher.resource().as_str(),
                                cooldown_secs = cooldown.as_secs(),
                                "Rate limited, cooling down"
                            );
                            observer.on_rate_limit(cooldown).await;
                            yield Ok(PageEvent::RateLimited(cooldown));
                            tokio::time::sleep(cooldown).await;
                        }
                        ErrorClass::Terminal => {
                            warn!(resource = fetcher.resource().as_str(), error = %e, "Resource unavailable, keeping partial results");
                            yield Ok(PageEvent::Stopped(StopReason::NotFound));
                            break;
                        }
                        ErrorClass::Degraded => {
                            warn!(resource = fetcher.resource().as_str(), error = %e, "Platform failure, keeping partial results");
                            yield Ok(PageEvent::Stopped(StopReason::Degraded));
                            break;
                        }
                        ErrorClass::Unexpected => {
                            yield Err(PaginationError::Unexpected {
                                resource: fetcher.resource(),
                                source: e,
                            });
                            break;
                        }
                    },
                }
            }
        }
    }

    /// Drain [`Paginator::stream`] into a [`Harvest`], truncated to the
    /// target count.
    pub async fn collect<R: Keyed + Send + 'static>(
        &self,
        fetcher: &dyn PageFetcher<R>,
        observer: &dyn RateLimitObserver,
    ) -> Result<Harvest<R>, PaginationError> {
        let events = self.stream(fetcher, observer);
        futures::pin_mut!(events);

        let mut records = Vec::new();
        let mut pages = 0;
        let mut rate_limit_pauses = 0;
        let mut stop = StopReason::Exhausted;

        while let Some(event) = events.next().await {
            match event? {
                PageEvent::Page(batch) => {
                    pages += 1;
                    records.extend(batch);
                }
                PageEvent::RateLimited(_) => rate_limit_pauses += 1,
                PageEvent::Stopped(reason) => stop = reason,
            }
        }

        if let Some(target) = self.target_count {
            records.truncate(target);
        }

        Ok(Harvest {
            records,
            pages,
            rate_limit_pauses,
            stop,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Rec(String);

    impl Keyed for Rec {
        fn key(&self) -> &str {
            &self.0
        }
    }

    enum Step {
        Page(Vec<&'static str>, bool),
        RateLimited,
        NotFound,
        Failure,
        Unauthorized,
    }

    /// Plays the steps in order; cursor of page n is "c{n}".
    struct Script {
        steps: Vec<Step>,
        position: Mutex<usize>,
        cursors: Mutex<Vec<Option<String>>>,
    }

    impl Script {
        fn new(steps: Vec<Step>) -> Self {
            Self {
                steps,
                position: Mutex::new(0),
                cursors: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl PageFetcher<Rec> for Script {
        fn resource(&self) -> String {
            "script".into()
        }

        async fn fetch_page(&self, cursor: Option<&str>) -> twitter_client::Result<Page<Rec>> {
            self.cursors.lock().unwrap().push(cursor.map(String::from));
            let mut pos = self.position.lock().unwrap();
            let step = self.steps.get(*pos).expect("script exhausted");
            *pos += 1;
            match step {
                Step::Page(ids, more) => Ok(Page {
                    records: ids.iter().map(|id| Rec(id.to_string())).collect(),
                    next_cursor: more.then(|| format!("c{pos}")),
                }),
                Step::RateLimited => Err(TwitterError::RateLimited { reset_after: None }),
                Step::NotFound => Err(TwitterError::NotFound("gone".into())),
                Step::Failure => Err(TwitterError::Api {
                    status: 503,
                    message: "over capacity".into(),
                }),
                Step::Unauthorized => Err(TwitterError::Unauthorized {
                    status: 401,
                    message: "bad token".into(),
                }),
            }
        }
    }

    struct CountingObserver(AtomicU32);

    #[async_trait]
    impl RateLimitObserver for CountingObserver {
        async fn on_rate_limit(&self, _cooldown: Duration) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn paginator() -> Paginator {
        Paginator::new(Duration::from_millis(5))
    }

    fn keys(h: &Harvest<Rec>) -> Vec<&str> {
        h.records.iter().map(|r| r.0.as_str()).collect()
    }

    #[tokio::test]
    async fn pages_until_exhausted_without_duplicates() {
        let script = Script::new(vec![
            Step::Page(vec!["a", "b"], true),
            Step::Page(vec!["b", "c"], true),
            Step::Page(vec!["a", "d"], false),
        ]);
        let h = paginator().collect(&script, &NoopObserver).await.unwrap();
        assert_eq!(keys(&h), vec!["a", "b", "c", "d"]);
        assert_eq!(h.pages, 3);
        assert_eq!(h.stop, StopReason::Exhausted);
    }

    #[tokio::test]
    async fn rate_limit_notifies_then_resumes_same_cursor() {
        let script = Script::new(vec![
            Step::Page(vec!["a"], true),
            Step::RateLimited,
            Step::Page(vec!["b"], false),
        ]);
        let observer = CountingObserver(AtomicU32::new(0));
        let h = paginator().collect(&script, &observer).await.unwrap();

        assert_eq!(keys(&h), vec!["a", "b"]);
        assert_eq!(h.rate_limit_pauses, 1);
        assert_eq!(observer.0.load(Ordering::SeqCst), 1);
        let cursors = script.cursors.lock().unwrap().clone();
        assert_eq!(
            cursors,
            vec![None, Some("c1".to_string()), Some("c1".to_string())]
        );
    }

    #[tokio::test]
    async fn not_found_keeps_partial_results() {
        let script = Script::new(vec![Step::Page(vec!["a", "b"], true), Step::NotFound]);
        let h = paginator().collect(&script, &NoopObserver).await.unwrap();
        assert_eq!(keys(&h), vec!["a", "b"]);
        assert_eq!(h.stop, StopReason::NotFound);
        assert!(h.stop.is_partial());
    }

    #[tokio::test]
    async fn generic_failure_keeps_partial_results() {
        let script = Script::new(vec![Step::Page(vec!["a"], true), Step::Failure]);
        let h = paginator().collect(&script, &NoopObserver).await.unwrap();
        assert_eq!(keys(&h), vec!["a"]);
        assert_eq!(h.stop, StopReason::Degraded);
    }

    #[tokio::test]
    async fn unexpected_errors_propagate() {
        let script = Script::new(vec![Step::Page(vec!["a"], true), Step::Unauthorized]);
        let err = paginator().collect(&script, &NoopObserver).await.unwrap_err();
        assert!(matches!(err, PaginationError::Unexpected { .. }));
    }

    #[tokio::test]
    async fn batch_ceiling_stops_early() {
        let script = Script::new(vec![
            Step::Page(vec!["a"], true),
            Step::Page(vec!["b"], true),
            Step::Page(vec!["c"], true),
        ]);
        let h = paginator()
            .max_batches(Some(2))
            .collect(&script, &NoopObserver)
            .await
            .unwrap();
        assert_eq!(keys(&h), vec!["a", "b"]);
        assert_eq!(h.stop, StopReason::BatchCeiling);
    }

    #[tokio::test]
    async fn target_count_truncates() {
        let script = Script::new(vec![
            Step::Page(vec!["a", "b"], true),
            Step::Page(vec!["c", "d"], true),
        ]);
        let h = paginator()
            .target_count(Some(3))
            .collect(&script, &NoopObserver)
            .await
            .unwrap();
        assert_eq!(keys(&h), vec!["a", "b", "c"]);
        assert_eq!(h.stop, StopReason::TargetReached);
    }

    #[tokio::test]
    async fn target_counts_distinct_records() {
        let script = Script::new(vec![
            Step::Page(vec!["a", "b"], true),
            Step::Page(vec!["a", "b"], true),
            Step::Page(vec!["c", "d"], true),
            Step::Page(vec!["e"], false),
        ]);
        let h = paginator()
            .target_count(Some(4))
            .collect(&script, &NoopObserver)
            .await
            .unwrap();
        assert_eq!(keys(&h), vec!["a", "b", "c", "d"]);
        assert_eq!(h.pages, 3);
        assert_eq!(h.stop, StopReason::TargetReached);
    }

    #[tokio::test]
    async fn stream_drops_records_seen_on_earlier_pages() {
        let script = Script::new(vec![
            Step::Page(vec!["a", "b"], true),
            Step::Page(vec!["b", "c"], false),
        ]);
        let p = paginator();
        let events = p.stream(&script, &NoopObserver);
        futures::pin_mut!(events);
        let mut pages = Vec::new();
        while let Some(event) = events.next().await {
            if let PageEvent::Page(records) = event.unwrap() {
                pages.push(records.into_iter().map(|r| r.0).collect::<Vec<_>>());
            }
        }
        assert_eq!(pages, vec![vec!["a", "b"], vec!["c"]]);
    }

    #[tokio::test]
    async fn stream_is_lazy() {
        let script = Script::new(vec![
            Step::Page(vec!["a"], true),
            Step::Page(vec!["b"], false),
        ]);
        let p = paginator();
        {
            let events = p.stream(&script, &NoopObserver);
            futures::pin_mut!(events);
            let first = events.next().await.unwrap().unwrap();
            assert!(matches!(first, PageEvent::Page(ref r) if r.len() == 1));
        }
        assert_eq!(*script.position.lock().unwrap(), 1);
    }
}
