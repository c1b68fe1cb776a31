use thiserror::Error;

#[derive(Error, Debug)]
pub enum CrawlError {
    #[error("Configuration error: {0}")]
    Config(String),
}
