use neo4rs::query;
use tracing::info;

use crate::error::Result;
use crate::GraphClient;

/// Run idempotent schema migrations: constraints, indexes.
pub async fn migrate(client: &GraphClient) -> Result<()> {
    info!("Running graph schema migrations...");

    let constraints = [
        "CREATE CONSTRAINT user_id IF NOT EXISTS FOR (u:User) REQUIRE u.id IS UNIQUE",
        "CREATE CONSTRAINT tweet_id IF NOT EXISTS FOR (t:Tweet) REQUIRE t.id IS UNIQUE",
    ];
    for c in &constraints {
        client.run(query(c)).await?;
    }
    info!("Uniqueness constraints created");

    let indexes = [
        "CREATE INDEX user_location_tag IF NOT EXISTS FOR (u:User) ON (u.location_tag)",
        "CREATE INDEX user_follower_status IF NOT EXISTS FOR (u:User) ON (u.follower_status)",
        "CREATE INDEX user_retweeter_status IF NOT EXISTS FOR (u:User) ON (u.retweeter_status)",
        "CREATE INDEX retweeted_location IF NOT EXISTS FOR ()-[r:RETWEETED]-() ON (r.location)",
    ];
    for idx in &indexes {
        client.run(query(idx)).await?;
    }
    info!("Property indexes created");

    Ok(())
}
