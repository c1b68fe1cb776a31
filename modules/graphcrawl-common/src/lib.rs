pub mod config;
pub mod error;
pub mod locations;
pub mod types;

pub use config::Config;
pub use error::CrawlError;
pub use locations::LocationProfile;
pub use types::*;
