// One consumer implementation for every queue kind.
//
// Per message: received → [rate_limited]* → upserted → fanned_out → acked.
// Work is idempotent, so a message redelivered after a crash or an expired
// lease is simply processed again.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use graphcrawl_common::{
    locations, CrawlStatus, CrawlTask, FollowEdge, QueueKind, RetweetEdge, Tweet, User,
};

use crate::blob::{tweet_blob_key, BlobStore};
use crate::fanout::{FanoutController, FanoutPolicy};
use crate::normalizer::{normalize_tweets, normalize_users, NormalizeContext};
use crate::paginator::{Harvest, PaginationError, Paginator, RateLimitObserver};
use crate::queue::{Message, QueueError, WorkQueue};
use crate::traits::{CrawlSource, GraphStore};

#[derive(Debug, Clone)]
pub struct ConsumerSettings {
    pub queue: QueueKind,
    pub visibility_timeout: Duration,
    pub receive_wait: Duration,
    pub paginator: Paginator,
    pub fanout: FanoutPolicy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed,
    /// Completed with whatever the platform returned before it gave up.
    Partial,
    /// The owning status was moved to `failed`.
    Failed,
    /// The body could not be decoded; the message was dropped.
    Discarded,
}

impl TaskOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskOutcome::Completed => "completed",
            TaskOutcome::Partial => "partial",
            TaskOutcome::Failed => "failed",
            TaskOutcome::Discarded => "discarded",
        }
    }
}

impl fmt::Display for TaskOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskReport {
    pub message_id: i64,
    pub queue: QueueKind,
    pub target: String,
    pub outcome: TaskOutcome,
    pub fetched: usize,
    pub upserted: usize,
    pub fanned_out: usize,
    pub failed_records: usize,
    pub rate_limit_pauses: u32,
}

impl TaskReport {
    fn log(&self) {
        info!(
            task_id = self.message_id,
            queue = %self.queue,
            target = self.target.as_str(),
            outcome = %self.outcome,
            fetched = self.fetched,
            upserted = self.upserted,
            fanned_out = self.fanned_out,
            failed_records = self.failed_records,
            rate_limit_pauses = self.rate_limit_pauses,
            "Task finished"
        );
    }
}

/// First pause after a failed `run_once`; doubles per consecutive failure.
const ERROR_BACKOFF_BASE: Duration = Duration::from_millis(500);
const ERROR_BACKOFF_MAX: Duration = Duration::from_secs(30);

/// Pause before the next receive after `failures` consecutive errors.
fn error_backoff(failures: u32) -> Duration {
    let exp = failures.saturating_sub(1).min(16);
    ERROR_BACKOFF_BASE
        .saturating_mul(2u32.saturating_pow(exp))
        .min(ERROR_BACKOFF_MAX)
}

/// Totals over a consumer's lifetime.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RunStats {
    pub tasks: u32,
    pub completed: u32,
    pub partial: u32,
    pub failed: u32,
    pub discarded: u32,
    /// Receives or tasks that errored; any message involved is left
    /// unacknowledged for redelivery.
    pub retried: u32,
    pub fetched: usize,
    pub upserted: usize,
    pub fanned_out: usize,
}

impl RunStats {
    pub fn record(&mut self, report: &TaskReport) {
        self.tasks += 1;
        match report.outcome {
            TaskOutcome::Completed => self.completed += 1,
            TaskOutcome::Partial => self.partial += 1,
            TaskOutcome::Failed => self.failed += 1,
            TaskOutcome::Discarded => self.discarded += 1,
        }
        self.fetched += report.fetched;
        self.upserted += report.upserted;
        self.fanned_out += report.fanned_out;
    }
}

impl fmt::Display for RunStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "\n=== Consumer Complete ===")?;
        writeln!(f, "Tasks processed:  {}", self.tasks)?;
        writeln!(f, "  completed:      {}", self.completed)?;
        writeln!(f, "  partial:        {}", self.partial)?;
        writeln!(f, "  failed:         {}", self.failed)?;
        writeln!(f, "  discarded:      {}", self.discarded)?;
        writeln!(f, "  retried:        {}", self.retried)?;
        writeln!(f, "Records fetched:  {}", self.fetched)?;
        writeln!(f, "Records upserted: {}", self.upserted)?;
        write!(f, "Tasks fanned out: {}", self.fanned_out)
    }
}

/// How a task went wrong.
enum TaskError {
    /// Leave the message unacknowledged; it reappears after its visibility
    /// timeout.
    Retry(anyhow::Error),
    /// Record the failure on the owning status and acknowledge. `progress`
    /// is whatever the task got through before failing.
    Fail {
        error: anyhow::Error,
        progress: Progress,
    },
}

impl TaskError {
    fn fail(error: anyhow::Error) -> Self {
        TaskError::Fail {
            error,
            progress: Progress::default(),
        }
    }
}

impl From<PaginationError> for TaskError {
    fn from(e: PaginationError) -> Self {
        TaskError::fail(e.into())
    }
}

impl From<QueueError> for TaskError {
    fn from(e: QueueError) -> Self {
        TaskError::Retry(e.into())
    }
}

#[derive(Debug, Default)]
struct Progress {
    fetched: usize,
    upserted: usize,
    fanned_out: usize,
    failed_records: usize,
    rate_limit_pauses: u32,
    partial: bool,
}

impl Progress {
    fn harvested<R>(harvest: &Harvest<R>) -> Self {
        Self {
            fetched: harvest.records.len(),
            rate_limit_pauses: harvest.rate_limit_pauses,
            partial: harvest.stop.is_partial(),
            ..Default::default()
        }
    }

    /// Every fetched record failed to store: the store rather than the data
    /// is at fault.
    fn nothing_stored(&self) -> bool {
        self.failed_records > 0 && self.upserted == 0
    }
}

/// Keeps the message hidden while the paginator sleeps through a rate-limit
/// window.
struct VisibilityExtender<'a, Q: ?Sized> {
    queue: &'a Q,
    message: &'a Message,
    visibility_timeout: Duration,
}

#[async_trait]
impl<Q: WorkQueue + ?Sized> RateLimitObserver for VisibilityExtender<'_, Q> {
    async fn on_rate_limit(&self, cooldown: Duration) {
        let by = cooldown + self.visibility_timeout;
        if let Err(e) = self.queue.extend_visibility(self.message, by).await {
            warn!(task_id = self.message.id, error = %e, "Failed to extend message visibility");
        }
    }
}

pub struct Consumer<Q, G, B, S> {
    queue: Arc<Q>,
    graph: Arc<G>,
    blobs: Arc<B>,
    source: Arc<S>,
    settings: ConsumerSettings,
}

impl<Q, G, B, S> Consumer<Q, G, B, S>
where
    Q: WorkQueue,
    G: GraphStore,
    B: BlobStore,
    S: CrawlSource,
{
    pub fn new(
        queue: Arc<Q>,
        graph: Arc<G>,
        blobs: Arc<B>,
        source: Arc<S>,
        settings: ConsumerSettings,
    ) -> Self {
        Self {
            queue,
            graph,
            blobs,
            source,
            settings,
        }
    }

    pub fn settings(&self) -> &ConsumerSettings {
        &self.settings
    }

    /// Process messages until `shutdown` resolves. An interrupted task keeps
    /// its lease and is redelivered once it expires. After an error the loop
    /// backs off exponentially before receiving again.
    pub async fn run<F>(&self, shutdown: F) -> RunStats
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut stats = RunStats::default();
        let mut failures: u32 = 0;
        info!(queue = %self.settings.queue, "Consumer started");

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                result = self.run_once() => match result {
                    Ok(Some(report)) => {
                        failures = 0;
                        stats.record(&report);
                    }
                    Ok(None) => failures = 0,
                    Err(e) => {
                        failures += 1;
                        stats.retried += 1;
                        error!(
                            queue = %self.settings.queue,
                            consecutive_failures = failures,
                            error = format!("{e:#}").as_str(),
                            "Task left for redelivery"
                        );
                    }
                },
            }

            if failures > 0 {
                let pause = error_backoff(failures);
                debug!(queue = %self.settings.queue, pause_ms = pause.as_millis() as u64, "Backing off after error");
                tokio::select! {
                    _ = &mut shutdown => break,
                    _ = tokio::time::sleep(pause) => {}
                }
            }
        }

        info!(queue = %self.settings.queue, "Shutdown requested, consumer stopped");
        stats
    }

    /// Receive and fully process at most one message. `Ok(None)` means the
    /// queue stayed empty for the receive wait. An `Err` leaves the message
    /// unacknowledged.
    pub async fn run_once(&self) -> anyhow::Result<Option<TaskReport>> {
        let kind = self.settings.queue;
        let Some(message) = self
            .queue
            .receive(kind, self.settings.receive_wait)
            .await
            .context("receive")?
        else {
            return Ok(None);
        };

        let task = match message.task() {
            Ok(task) => task,
            Err(e) => {
                error!(task_id = message.id, queue = %kind, error = %e, "Dropping undecodable message");
                self.acknowledge(&message).await?;
                let report = TaskReport {
                    message_id: message.id,
                    queue: kind,
                    target: String::new(),
                    outcome: TaskOutcome::Discarded,
                    fetched: 0,
                    upserted: 0,
                    fanned_out: 0,
                    failed_records: 0,
                    rate_limit_pauses: 0,
                };
                report.log();
                return Ok(Some(report));
            }
        };

        let observer = VisibilityExtender {
            queue: self.queue.as_ref(),
            message: &message,
            visibility_timeout: self.settings.visibility_timeout,
        };
        let now = Utc::now();

        let result = match kind {
            QueueKind::Followers => self.crawl_followers(&task, &observer, now).await,
            QueueKind::Tweets => self.crawl_tweets(&task, &observer, now).await,
            QueueKind::Retweeters => self.crawl_retweeters(&task, &observer, now).await,
            QueueKind::Search => self.crawl_search(&task, &observer, now).await,
        };

        let (outcome, progress) = match result {
            Ok(progress) => {
                self.finish(kind, &task, CrawlStatus::Completed).await?;
                let outcome = if progress.partial {
                    warn!(task_id = message.id, queue = %kind, target = task.target_id.as_str(), "Task completed with partial results");
                    TaskOutcome::Partial
                } else {
                    TaskOutcome::Completed
                };
                (outcome, progress)
            }
            Err(TaskError::Fail { error: e, progress }) => {
                error!(
                    task_id = message.id,
                    queue = %kind,
                    target = task.target_id.as_str(),
                    error = format!("{e:#}").as_str(),
                    "Task failed"
                );
                if let Err(e) = self.finish(kind, &task, CrawlStatus::Failed).await {
                    warn!(task_id = message.id, error = %e, "Failed to record task failure");
                }
                (TaskOutcome::Failed, progress)
            }
            Err(TaskError::Retry(e)) => {
                return Err(e.context(format!("{kind} task {}", task.target_id)));
            }
        };

        self.acknowledge(&message).await?;

        let report = TaskReport {
            message_id: message.id,
            queue: kind,
            target: task.target_id,
            outcome,
            fetched: progress.fetched,
            upserted: progress.upserted,
            fanned_out: progress.fanned_out,
            failed_records: progress.failed_records,
            rate_limit_pauses: progress.rate_limit_pauses,
        };
        report.log();
        Ok(Some(report))
    }

    /// Delete the message. A lost lease means another consumer owns the
    /// redelivered copy and will repeat the (idempotent) work.
    async fn acknowledge(&self, message: &Message) -> anyhow::Result<()> {
        match self.queue.delete(message).await {
            Ok(()) => Ok(()),
            Err(QueueError::LeaseLost(id)) => {
                warn!(task_id = id, "Lease lost before delete, message was redelivered");
                Ok(())
            }
            Err(e) => Err(anyhow::Error::new(e).context("delete message")),
        }
    }

    /// Move the status owned by this task's queue.
    async fn finish(
        &self,
        kind: QueueKind,
        task: &CrawlTask,
        next: CrawlStatus,
    ) -> anyhow::Result<()> {
        let now = Utc::now();
        match kind {
            QueueKind::Tweets | QueueKind::Followers => {
                if let Some(dimension) = kind.dimension() {
                    self.graph
                        .advance_status(&task.target_id, dimension, next, now)
                        .await?;
                }
            }
            QueueKind::Retweeters => {
                self.graph
                    .advance_tweet_status(&task.target_id, next, now)
                    .await?;
            }
            QueueKind::Search => {}
        }
        Ok(())
    }

    // --- Per-queue handlers ---

    async fn crawl_followers(
        &self,
        task: &CrawlTask,
        observer: &dyn RateLimitObserver,
        now: DateTime<Utc>,
    ) -> Result<Progress, TaskError> {
        let fetcher = self.source.followers(&task.target_id);
        let harvest = self.settings.paginator.collect(&*fetcher, observer).await?;
        let mut progress = Progress::harvested(&harvest);

        let location = locations::profile(&task.location_tag);
        let users = normalize_users(&harvest.records, &NormalizeContext::new(&location, now));

        let mut stored = Vec::with_capacity(users.len());
        for user in &users {
            if !self.store_user(user, &mut progress).await {
                continue;
            }
            let edge = FollowEdge {
                source: user.id.clone(),
                target: task.target_id.clone(),
            };
            if let Err(e) = self.graph.upsert_follow_edge(&edge).await {
                warn!(source = edge.source.as_str(), target = edge.target.as_str(), error = %e, "Follow edge upsert failed");
                progress.failed_records += 1;
                continue;
            }
            stored.push(user.id.clone());
        }
        if progress.nothing_stored() {
            return Err(TaskError::Fail {
                error: anyhow!("no follower could be stored"),
                progress,
            });
        }

        self.fan_out(&stored, &task.location_tag, now, &mut progress)
            .await?;
        Ok(progress)
    }

    async fn crawl_tweets(
        &self,
        task: &CrawlTask,
        observer: &dyn RateLimitObserver,
        now: DateTime<Utc>,
    ) -> Result<Progress, TaskError> {
        let fetcher = self.source.user_tweets(&task.target_id);
        let harvest = self.settings.paginator.collect(&*fetcher, observer).await?;
        let mut progress = Progress::harvested(&harvest);

        let location = locations::profile(&task.location_tag);
        let ctx = NormalizeContext::new(&location, now).owned_by(&task.target_id);
        let tweets = normalize_tweets(&harvest.records, &ctx);

        for tweet in &tweets {
            if !self.store_tweet(tweet, &mut progress).await {
                continue;
            }
            if tweet.is_repost() || tweet.retweet_count == 0 {
                continue;
            }
            if self.enqueue_retweeters(tweet, now).await? {
                progress.fanned_out += 1;
            }
        }
        if progress.nothing_stored() {
            return Err(TaskError::Fail {
                error: anyhow!("no tweet could be stored"),
                progress,
            });
        }
        Ok(progress)
    }

    async fn crawl_retweeters(
        &self,
        task: &CrawlTask,
        observer: &dyn RateLimitObserver,
        now: DateTime<Utc>,
    ) -> Result<Progress, TaskError> {
        let author = match &task.parent_id {
            Some(author) => author.clone(),
            None => match self.graph.get_tweet(&task.target_id).await {
                Ok(Some(tweet)) => tweet.user_id,
                Ok(None) => {
                    return Err(TaskError::fail(anyhow!(
                        "retweeters task without author for unknown tweet"
                    )))
                }
                Err(e) => return Err(TaskError::fail(e.context("look up tweet author"))),
            },
        };

        // Every edge needs the author vertex; don't spend API quota without it.
        match self.graph.user_exists(&author).await {
            Ok(true) => {}
            Ok(false) => {
                return Err(TaskError::fail(anyhow!(
                    "tweet author {author} is not in the graph"
                )))
            }
            Err(e) => return Err(TaskError::Retry(e.context("check tweet author"))),
        }

        let fetcher = self.source.retweeters(&task.target_id);
        let harvest = self.settings.paginator.collect(&*fetcher, observer).await?;
        let mut progress = Progress::harvested(&harvest);

        let location = locations::profile(&task.location_tag);
        let users = normalize_users(&harvest.records, &NormalizeContext::new(&location, now));

        let mut stored = Vec::with_capacity(users.len());
        for user in &users {
            if user.id == author {
                continue;
            }
            if !self.store_user(user, &mut progress).await {
                continue;
            }
            let edge = RetweetEdge {
                source: user.id.clone(),
                target: author.clone(),
                location_tag: task.location_tag.clone(),
                tweet_id: task.target_id.clone(),
            };
            if self.edge_recorded(&edge).await {
                stored.push(user.id.clone());
                continue;
            }
            if let Err(e) = self.graph.upsert_retweet_edge(&edge).await {
                warn!(source = edge.source.as_str(), target = edge.target.as_str(), tweet_id = edge.tweet_id.as_str(), error = %e, "Retweet edge upsert failed");
                progress.failed_records += 1;
                continue;
            }
            stored.push(user.id.clone());
        }
        if progress.nothing_stored() {
            return Err(TaskError::Fail {
                error: anyhow!("no retweeter could be stored"),
                progress,
            });
        }

        self.fan_out(&stored, &task.location_tag, now, &mut progress)
            .await?;
        Ok(progress)
    }

    async fn crawl_search(
        &self,
        task: &CrawlTask,
        observer: &dyn RateLimitObserver,
        now: DateTime<Utc>,
    ) -> Result<Progress, TaskError> {
        let fetcher = self.source.search(&task.target_id);
        let harvest = self.settings.paginator.collect(&*fetcher, observer).await?;
        let mut progress = Progress::harvested(&harvest);

        let location = locations::profile(&task.location_tag);
        let ctx = NormalizeContext::new(&location, now);
        let authors: Vec<_> = harvest.records.iter().filter_map(|t| t.author()).collect();
        let users = normalize_users(&authors, &ctx);
        let tweets = normalize_tweets(&harvest.records, &ctx);

        let mut stored = Vec::with_capacity(users.len());
        for user in &users {
            if self.store_user(user, &mut progress).await {
                stored.push(user.id.clone());
            }
        }
        for tweet in tweets.iter().filter(|t| !t.is_repost()) {
            self.store_tweet(tweet, &mut progress).await;
        }
        if progress.nothing_stored() {
            return Err(TaskError::Fail {
                error: anyhow!("no search result could be stored"),
                progress,
            });
        }

        self.fan_out(&stored, &task.location_tag, now, &mut progress)
            .await?;
        Ok(progress)
    }

    // --- Shared steps ---

    /// True when a redelivered observation is already on the edge. A failed
    /// read falls through to the (idempotent) write.
    async fn edge_recorded(&self, edge: &RetweetEdge) -> bool {
        match self
            .graph
            .edge_has_tweet(&edge.source, &edge.target, &edge.location_tag, &edge.tweet_id)
            .await
        {
            Ok(found) => found,
            Err(e) => {
                debug!(source = edge.source.as_str(), tweet_id = edge.tweet_id.as_str(), error = %e, "Edge read failed, writing anyway");
                false
            }
        }
    }

    async fn store_user(&self, user: &User, progress: &mut Progress) -> bool {
        match self.graph.upsert_user(user).await {
            Ok(_) => {
                progress.upserted += 1;
                true
            }
            Err(e) => {
                warn!(user_id = user.id.as_str(), error = %e, "User upsert failed");
                progress.failed_records += 1;
                false
            }
        }
    }

    /// Upsert the tweet and, for originals, write its text blob.
    async fn store_tweet(&self, tweet: &Tweet, progress: &mut Progress) -> bool {
        if let Err(e) = self.graph.upsert_tweet(tweet).await {
            warn!(tweet_id = tweet.id.as_str(), error = %e, "Tweet upsert failed");
            progress.failed_records += 1;
            return false;
        }
        progress.upserted += 1;

        if !tweet.is_repost() {
            let key = tweet_blob_key(&tweet.location_tag, &tweet.user_id, &tweet.id);
            if let Err(e) = self.blobs.put(&key, tweet.text.as_bytes()).await {
                warn!(key = key.as_str(), error = %e, "Tweet blob write failed");
                progress.failed_records += 1;
            }
        }
        true
    }

    /// Queue a retweeter crawl for a tweet that hasn't had one. Returns true
    /// if a task was sent.
    async fn enqueue_retweeters(
        &self,
        tweet: &Tweet,
        now: DateTime<Utc>,
    ) -> Result<bool, TaskError> {
        let status = match self.graph.get_tweet(&tweet.id).await {
            Ok(stored) => stored.map_or(CrawlStatus::Pending, |t| t.retweeter_status),
            Err(e) => {
                warn!(tweet_id = tweet.id.as_str(), error = %e, "Tweet status read failed");
                return Ok(false);
            }
        };
        if status != CrawlStatus::Pending {
            return Ok(false);
        }

        let follow_up = CrawlTask::new(&tweet.id, &tweet.location_tag).with_parent(&tweet.user_id);
        self.queue.send(QueueKind::Retweeters, &follow_up).await?;
        if let Err(e) = self
            .graph
            .advance_tweet_status(&tweet.id, CrawlStatus::Queued, now)
            .await
        {
            warn!(tweet_id = tweet.id.as_str(), error = %e, "Retweeters task enqueued but status not advanced");
        }
        Ok(true)
    }

    async fn fan_out(
        &self,
        user_ids: &[String],
        location_tag: &str,
        now: DateTime<Utc>,
        progress: &mut Progress,
    ) -> Result<(), TaskError> {
        let controller = FanoutController::new(
            self.graph.as_ref(),
            self.queue.as_ref(),
            &self.settings.fanout,
        );
        let outcome = controller
            .fan_out(user_ids, location_tag, now)
            .await
            .map_err(TaskError::Retry)?;
        progress.fanned_out += outcome.emitted;
        progress.failed_records += outcome.failed;
        Ok(())
    }
}
