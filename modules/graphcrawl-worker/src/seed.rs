use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{info, warn};

use graphcrawl_common::{locations, CrawlStatus, CrawlTask, QueueKind, StatusDimension};

use crate::normalizer::{normalize_users, NormalizeContext};
use crate::queue::WorkQueue;
use crate::traits::{CrawlSource, GraphStore};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SeedReport {
    pub requested: usize,
    pub found: usize,
    pub enqueued: usize,
}

/// Start a crawl of `location_tag` from hand-picked root users: look them up,
/// store them as already-expanded roots, queue both crawl dimensions.
pub async fn seed_roots(
    source: &dyn CrawlSource,
    graph: &dyn GraphStore,
    queue: &dyn WorkQueue,
    location_tag: &str,
    user_ids: &[String],
) -> Result<SeedReport> {
    let location = locations::profile(location_tag);
    let now = Utc::now();
    let raw = source
        .lookup_users(user_ids)
        .await
        .context("look up root users")?;
    let roots = normalize_users(&raw, &NormalizeContext::new(&location, now).root());

    let mut report = SeedReport {
        requested: user_ids.len(),
        found: roots.len(),
        enqueued: 0,
    };
    if roots.len() < user_ids.len() {
        warn!(
            requested = user_ids.len(),
            found = roots.len(),
            "Some root users were not found"
        );
    }

    for root in &roots {
        graph
            .upsert_user(root)
            .await
            .with_context(|| format!("upsert root user {}", root.id))?;
        for dimension in StatusDimension::ALL {
            // Upsert keeps the statuses of a root already in the graph.
            graph
                .advance_status(&root.id, dimension, CrawlStatus::Completed, now)
                .await
                .with_context(|| format!("mark root user {} expanded", root.id))?;
        }
        for dimension in StatusDimension::ALL {
            queue
                .send(dimension.queue(), &CrawlTask::new(&root.id, location_tag))
                .await
                .with_context(|| format!("enqueue {} task for {}", dimension.queue(), root.id))?;
            report.enqueued += 1;
        }
        info!(user_id = root.id.as_str(), handle = root.handle.as_str(), location_tag, "Seeded root user");
    }

    Ok(report)
}

/// Queue a keyword search scoped to `location_tag`.
pub async fn enqueue_search(queue: &dyn WorkQueue, location_tag: &str, query: &str) -> Result<()> {
    queue
        .send(QueueKind::Search, &CrawlTask::new(query, location_tag))
        .await
        .context("enqueue search task")?;
    info!(location_tag, query, "Search task enqueued");
    Ok(())
}
