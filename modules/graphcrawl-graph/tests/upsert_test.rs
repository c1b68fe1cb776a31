#![cfg(feature = "test-utils")]

// Graph upsert integration tests against a real Neo4j.
//
// Requirements: Docker (for Neo4j via testcontainers)
//
// Run with: cargo test -p graphcrawl-graph --features test-utils --test upsert_test

use std::time::Duration;

use chrono::Utc;
use graphcrawl_common::{
    CrawlStatus, EdgeChange, FollowEdge, RetweetEdge, StatusDimension, Tweet, User,
};
use graphcrawl_graph::{migrate::migrate, query, GraphClient, GraphWriter};

async fn setup() -> (impl std::any::Any, GraphClient) {
    let (container, client) = graphcrawl_graph::testutil::neo4j_container().await;
    migrate(&client).await.expect("migration failed");
    (container, client)
}

fn user(id: &str) -> User {
    let now = Utc::now();
    User {
        id: id.into(),
        handle: format!("handle_{id}"),
        bio: "community organiser".into(),
        profile_location: "Ikeja, Lagos".into(),
        followers_count: 5000,
        following_count: 120,
        tweet_count: 900,
        verified: false,
        created_at: Some(now),
        location_tag: "lagos".into(),
        category: None,
        location_match: true,
        retweeter_status: CrawlStatus::Pending,
        retweeter_last_processed: now,
        follower_status: CrawlStatus::Pending,
        follower_last_processed: now,
        extracted_at: now,
        last_updated: now,
    }
}

fn retweet(source: &str, target: &str, tweet_id: &str) -> RetweetEdge {
    RetweetEdge {
        source: source.into(),
        target: target.into(),
        location_tag: "lagos".into(),
        tweet_id: tweet_id.into(),
    }
}

async fn count(client: &GraphClient, cypher: &str) -> i64 {
    let rows = client.execute(query(cypher)).await.expect("count query");
    rows[0].get::<i64>("n").expect("n column")
}

#[tokio::test]
async fn upsert_user_is_idempotent() {
    let (_container, client) = setup().await;
    let writer = GraphWriter::new(client.clone());
    let u = user("a");

    assert!(writer.upsert_user(&u).await.unwrap());
    let first = writer.get_user("a").await.unwrap().unwrap();
    assert!(!writer.upsert_user(&u).await.unwrap());
    let second = writer.get_user("a").await.unwrap().unwrap();

    assert_eq!(first, second);
    assert_eq!(count(&client, "MATCH (u:User) RETURN count(u) AS n").await, 1);
}

#[tokio::test]
async fn repeat_observation_does_not_reset_status() {
    let (_container, client) = setup().await;
    let writer = GraphWriter::new(client);
    writer.upsert_user(&user("a")).await.unwrap();
    writer
        .advance_status("a", StatusDimension::Follower, CrawlStatus::Queued, Utc::now())
        .await
        .unwrap();

    // Discovered again as someone else's follower, with a fresh pending record.
    let mut again = user("a");
    again.followers_count = 6000;
    writer.upsert_user(&again).await.unwrap();

    let stored = writer.get_user("a").await.unwrap().unwrap();
    assert_eq!(stored.follower_status, CrawlStatus::Queued);
    assert_eq!(stored.retweeter_status, CrawlStatus::Pending);
    assert_eq!(stored.followers_count, 6000);
}

#[tokio::test]
async fn status_never_moves_backward() {
    let (_container, client) = setup().await;
    let writer = GraphWriter::new(client);
    writer.upsert_user(&user("a")).await.unwrap();
    let now = Utc::now();

    let dim = StatusDimension::Retweeter;
    assert!(writer.advance_status("a", dim, CrawlStatus::Queued, now).await.unwrap());
    assert!(writer.advance_status("a", dim, CrawlStatus::Completed, now).await.unwrap());
    assert!(!writer.advance_status("a", dim, CrawlStatus::Queued, now).await.unwrap());
    assert!(!writer.advance_status("a", dim, CrawlStatus::Failed, now).await.unwrap());

    let stored = writer.get_user("a").await.unwrap().unwrap();
    assert_eq!(stored.retweeter_status, CrawlStatus::Completed);
}

#[tokio::test]
async fn retweet_edge_counts_distinct_tweets() {
    let (_container, client) = setup().await;
    let writer = GraphWriter::new(client);
    writer.upsert_user(&user("a")).await.unwrap();
    writer.upsert_user(&user("b")).await.unwrap();

    let changes = [
        writer.upsert_retweet_edge(&retweet("a", "b", "T1")).await.unwrap(),
        writer.upsert_retweet_edge(&retweet("a", "b", "T1")).await.unwrap(),
        writer.upsert_retweet_edge(&retweet("a", "b", "T2")).await.unwrap(),
    ];
    assert_eq!(
        changes,
        [EdgeChange::Created, EdgeChange::Unchanged, EdgeChange::Incremented]
    );

    let state = writer.retweet_edge("a", "b", "lagos").await.unwrap().unwrap();
    assert_eq!(state.weight, 2);
    assert_eq!(state.tweet_ids, vec!["T1".to_string(), "T2".to_string()]);
    assert!(writer.edge_has_tweet("a", "b", "lagos", "T2").await.unwrap());
    assert!(!writer.edge_has_tweet("a", "b", "nairobi", "T2").await.unwrap());
}

#[tokio::test]
async fn concurrent_retweet_writers_do_not_double_count() {
    let (_container, client) = setup().await;
    let writer = GraphWriter::new(client);
    writer.upsert_user(&user("a")).await.unwrap();
    writer.upsert_user(&user("b")).await.unwrap();

    let mut handles = Vec::new();
    for i in 0..8 {
        let w = writer.clone();
        handles.push(tokio::spawn(async move {
            let id = format!("T{}", i % 3);
            w.upsert_retweet_edge(&retweet("a", "b", &id)).await
        }));
    }
    for h in handles {
        h.await.unwrap().unwrap();
    }

    let state = writer.retweet_edge("a", "b", "lagos").await.unwrap().unwrap();
    assert_eq!(state.weight, 3);
    assert_eq!(state.tweet_ids.len(), 3);
}

#[tokio::test]
async fn follow_edge_created_once() {
    let (_container, client) = setup().await;
    let writer = GraphWriter::new(client.clone());
    writer.upsert_user(&user("a")).await.unwrap();
    writer.upsert_user(&user("b")).await.unwrap();
    let edge = FollowEdge {
        source: "a".into(),
        target: "b".into(),
    };

    assert!(writer.upsert_follow_edge(&edge).await.unwrap());
    assert!(!writer.upsert_follow_edge(&edge).await.unwrap());
    assert_eq!(
        count(&client, "MATCH ()-[r:FOLLOWS]->() RETURN count(r) AS n").await,
        1
    );
}

#[tokio::test]
async fn edge_to_unknown_user_is_rejected() {
    let (_container, client) = setup().await;
    let writer = GraphWriter::new(client);
    writer.upsert_user(&user("a")).await.unwrap();

    assert!(writer
        .upsert_retweet_edge(&retweet("a", "ghost", "T1"))
        .await
        .is_err());
}

#[tokio::test]
async fn tweet_links_to_author() {
    let (_container, client) = setup().await;
    let writer = GraphWriter::new(client.clone());
    writer.upsert_user(&user("a")).await.unwrap();
    let tweet = Tweet {
        id: "T1".into(),
        text: "Flooding on Third Mainland bridge".into(),
        created_at: None,
        retweet_count: 4,
        favorite_count: 10,
        user_id: "a".into(),
        location_tag: "lagos".into(),
        retweeter_status: CrawlStatus::Pending,
        extracted_at: Utc::now(),
    };

    assert!(writer.upsert_tweet(&tweet).await.unwrap());
    assert!(!writer.upsert_tweet(&tweet).await.unwrap());
    assert_eq!(
        count(&client, "MATCH (:User {id: 'a'})-[r:POSTED]->(:Tweet) RETURN count(r) AS n").await,
        1
    );

    assert!(writer
        .advance_tweet_status("T1", CrawlStatus::Completed, Utc::now())
        .await
        .unwrap());
    let stored = writer.get_tweet("T1").await.unwrap().unwrap();
    assert_eq!(stored.retweeter_status, CrawlStatus::Completed);
}

#[tokio::test]
async fn keepalive_survives_reconnect_and_shutdown() {
    let (_container, client) = setup().await;
    client.spawn_keepalive(Duration::from_millis(50));
    tokio::time::sleep(Duration::from_millis(200)).await;

    client.reconnect().await.unwrap();
    client.ping().await.unwrap();
    client.shutdown();
    client.ping().await.unwrap();
}
