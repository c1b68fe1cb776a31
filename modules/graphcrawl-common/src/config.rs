use std::env;
use std::str::FromStr;
use std::time::Duration;

use tracing::info;

use crate::CrawlError;

/// Worker configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    // Neo4j
    pub neo4j_uri: String,
    pub neo4j_user: String,
    pub neo4j_password: String,

    // Queue (Postgres)
    pub database_url: String,

    // Platform API
    pub twitter_bearer_token: String,
    pub twitter_api_base: Option<String>,

    // Object storage for tweet text
    pub blob_root: String,

    // Crawl tuning
    pub influence_threshold: i64,
    pub fanout_limit: Option<usize>,
    pub rate_limit_cooldown: Duration,
    pub visibility_timeout: Duration,
    pub receive_wait: Duration,
    pub conflict_retries: u32,
    pub keepalive_interval: Duration,
}

impl Config {
    /// Load the configuration of a queue worker.
    /// Panics with a clear message if required vars are missing.
    pub fn worker_from_env() -> Self {
        Self {
            neo4j_uri: required_env("NEO4J_URI"),
            neo4j_user: required_env("NEO4J_USER"),
            neo4j_password: required_env("NEO4J_PASSWORD"),
            database_url: required_env("DATABASE_URL"),
            twitter_bearer_token: env::var("TWITTER_BEARER_TOKEN").unwrap_or_default(),
            twitter_api_base: env::var("TWITTER_API_BASE").ok(),
            blob_root: env::var("BLOB_ROOT").unwrap_or_else(|_| "./blobs".to_string()),
            influence_threshold: parsed_env("INFLUENCE_THRESHOLD", 1000),
            fanout_limit: env::var("FANOUT_LIMIT").ok().map(|v| {
                v.parse()
                    .unwrap_or_else(|_| panic!("FANOUT_LIMIT must be a number"))
            }),
            // The platform's rate-limit window is fifteen minutes.
            rate_limit_cooldown: Duration::from_secs(parsed_env("RATE_LIMIT_COOLDOWN_SECS", 900)),
            visibility_timeout: Duration::from_secs(parsed_env("VISIBILITY_TIMEOUT_SECS", 300)),
            receive_wait: Duration::from_secs(parsed_env("RECEIVE_WAIT_SECS", 20)),
            conflict_retries: parsed_env("CONFLICT_RETRIES", 3),
            keepalive_interval: Duration::from_secs(parsed_env("KEEPALIVE_SECS", 60)),
        }
    }

    /// Bearer token for the selected account. `TWITTER_BEARER_TOKEN_<ACCOUNT>`
    /// takes precedence; without a selector the default token is used.
    pub fn twitter_token(&self, account: Option<&str>) -> Result<String, CrawlError> {
        if let Some(account) = account {
            let key = format!("TWITTER_BEARER_TOKEN_{}", account.to_ascii_uppercase());
            return env::var(&key)
                .map_err(|_| CrawlError::Config(format!("{key} environment variable is required")));
        }
        if self.twitter_bearer_token.is_empty() {
            return Err(CrawlError::Config(
                "TWITTER_BEARER_TOKEN environment variable is required".to_string(),
            ));
        }
        Ok(self.twitter_bearer_token.clone())
    }

    /// Log the effective configuration with secrets masked.
    pub fn log_redacted(&self) {
        info!(
            neo4j_uri = self.neo4j_uri.as_str(),
            neo4j_user = self.neo4j_user.as_str(),
            neo4j_password = redact(&self.neo4j_password),
            database_url = redact_url(&self.database_url).as_str(),
            twitter_bearer_token = redact(&self.twitter_bearer_token),
            blob_root = self.blob_root.as_str(),
            influence_threshold = self.influence_threshold,
            fanout_limit = ?self.fanout_limit,
            rate_limit_cooldown_secs = self.rate_limit_cooldown.as_secs(),
            visibility_timeout_secs = self.visibility_timeout.as_secs(),
            receive_wait_secs = self.receive_wait.as_secs(),
            conflict_retries = self.conflict_retries,
            "Loaded config"
        );
    }
}

fn required_env(key: &str) -> String {
    env::var(key).unwrap_or_else(|_| panic!("{key} environment variable is required"))
}

fn parsed_env<T: FromStr>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(v) => v
            .parse()
            .unwrap_or_else(|_| panic!("{key} must be a number")),
        Err(_) => default,
    }
}

fn redact(secret: &str) -> &'static str {
    if secret.is_empty() {
        "<unset>"
    } else {
        "<redacted>"
    }
}

/// Mask the password component of a connection URL.
fn redact_url(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            let userinfo = &url[scheme_end + 3..at];
            let user = userinfo.split(':').next().unwrap_or_default();
            format!("{}{}:***{}", &url[..scheme_end + 3], user, &url[at..])
        }
        _ => url.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_password_is_masked() {
        assert_eq!(
            redact_url("postgres://crawler:hunter2@db:5432/crawl"),
            "postgres://crawler:***@db:5432/crawl"
        );
        assert_eq!(redact_url("postgres://db/crawl"), "postgres://db/crawl");
    }

    fn config(token: &str) -> Config {
        Config {
            neo4j_uri: "bolt://localhost:7687".into(),
            neo4j_user: "neo4j".into(),
            neo4j_password: "secret".into(),
            database_url: "postgres://localhost/crawl".into(),
            twitter_bearer_token: token.into(),
            twitter_api_base: None,
            blob_root: "./blobs".into(),
            influence_threshold: 1000,
            fanout_limit: None,
            rate_limit_cooldown: Duration::from_secs(900),
            visibility_timeout: Duration::from_secs(300),
            receive_wait: Duration::from_secs(20),
            conflict_retries: 3,
            keepalive_interval: Duration::from_secs(60),
        }
    }

    #[test]
    fn missing_default_token_is_a_config_error() {
        let err = config("").twitter_token(None).unwrap_err();
        assert!(matches!(err, CrawlError::Config(ref m) if m.contains("TWITTER_BEARER_TOKEN")));
        assert_eq!(config("abc").twitter_token(None).unwrap(), "abc");
    }

    #[test]
    fn empty_secret_reports_unset() {
        assert_eq!(redact(""), "<unset>");
        assert_eq!(redact("x"), "<redacted>");
    }
}
