// Decides which newly discovered users get their own crawl tasks.
//
// Decisions are made against the graph's committed state, not the record we
// just fetched, so a user already queued by another consumer is skipped.
// Tasks are enqueued before the status moves to `queued`: a crash between the
// two re-enqueues on redelivery instead of losing the task.

use std::collections::HashSet;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use graphcrawl_common::{CrawlStatus, CrawlTask, StatusDimension, User};

use crate::queue::WorkQueue;
use crate::traits::GraphStore;

#[derive(Debug, Clone)]
pub struct FanoutPolicy {
    /// Users need strictly more followers than this to be expanded.
    pub influence_threshold: i64,
    /// Cap on tasks emitted per call.
    pub limit: Option<usize>,
}

impl FanoutPolicy {
    pub fn new(influence_threshold: i64) -> Self {
        Self {
            influence_threshold,
            limit: None,
        }
    }

    pub fn with_limit(mut self, limit: Option<usize>) -> Self {
        self.limit = limit;
        self
    }

    /// Dimensions of `user` that should be crawled next.
    pub fn eligible_dimensions(&self, user: &User, location_tag: &str) -> Vec<StatusDimension> {
        if !user.location_match
            || user.location_tag != location_tag
            || user.followers_count <= self.influence_threshold
        {
            return Vec::new();
        }
        StatusDimension::ALL
            .into_iter()
            .filter(|d| user.status(*d) == CrawlStatus::Pending)
            .collect()
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FanoutOutcome {
    pub emitted: usize,
    /// Users skipped because their graph read or status write failed.
    pub failed: usize,
}

pub struct FanoutController<'a, G: ?Sized, Q: ?Sized> {
    graph: &'a G,
    queue: &'a Q,
    policy: &'a FanoutPolicy,
}

impl<'a, G, Q> FanoutController<'a, G, Q>
where
    G: GraphStore + ?Sized,
    Q: WorkQueue + ?Sized,
{
    pub fn new(graph: &'a G, queue: &'a Q, policy: &'a FanoutPolicy) -> Self {
        Self {
            graph,
            queue,
            policy,
        }
    }

    /// Emit follow-up tasks for the eligible users among `user_ids`.
    ///
    /// Graph failures are isolated per user. A queue failure is returned so
    /// the calling task stays unacknowledged and is retried.
    pub async fn fan_out(
        &self,
        user_ids: &[String],
        location_tag: &str,
        now: DateTime<Utc>,
    ) -> Result<FanoutOutcome> {
        let mut outcome = FanoutOutcome::default();
        let mut seen = HashSet::new();

        for id in user_ids {
            if !seen.insert(id.as_str()) {
                continue;
            }
            if self.policy.limit.is_some_and(|limit| outcome.emitted >= limit) {
                debug!(location_tag, limit = ?self.policy.limit, "Fan-out limit reached");
                break;
            }

            let user = match self.graph.get_user(id).await {
                Ok(Some(user)) => user,
                Ok(None) => continue,
                Err(e) => {
                    warn!(user_id = id.as_str(), error = %e, "Fan-out read failed, skipping user");
                    outcome.failed += 1;
                    continue;
                }
            };

            for dimension in self.policy.eligible_dimensions(&user, location_tag) {
                if self.policy.limit.is_some_and(|limit| outcome.emitted >= limit) {
                    break;
                }
                let queue = dimension.queue();
                self.queue
                    .send(queue, &CrawlTask::new(&user.id, location_tag))
                    .await
                    .with_context(|| format!("enqueue {queue} task for {}", user.id))?;
                outcome.emitted += 1;

                if let Err(e) = self
                    .graph
                    .advance_status(&user.id, dimension, CrawlStatus::Queued, now)
                    .await
                {
                    warn!(user_id = user.id.as_str(), %queue, error = %e, "Task enqueued but status not advanced");
                    outcome.failed += 1;
                }
            }
        }

        Ok(outcome)
    }
}
