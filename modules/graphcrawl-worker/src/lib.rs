pub mod blob;
pub mod consumer;
pub mod fanout;
pub mod normalizer;
pub mod paginator;
pub mod queue;
pub mod seed;
pub mod source;
#[cfg(any(test, feature = "test-support"))]
pub mod testing;
pub mod traits;

pub use consumer::{Consumer, ConsumerSettings, RunStats, TaskOutcome, TaskReport};
pub use fanout::{FanoutController, FanoutPolicy};
pub use paginator::{Harvest, PageFetcher, Paginator, StopReason};
pub use queue::{Message, PgQueue, QueueError, WorkQueue};
pub use traits::{CrawlSource, GraphStore};
