pub mod client;
pub mod error;
pub mod migrate;
pub mod retry;
pub mod writer;
#[cfg(feature = "test-utils")]
pub mod testutil;

pub use client::GraphClient;
pub use error::GraphError;
pub use neo4rs::query;
pub use retry::RetryPolicy;
pub use writer::GraphWriter;
