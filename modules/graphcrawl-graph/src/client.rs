use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use arc_swap::ArcSwap;
use neo4rs::{ConfigBuilder, Graph, Query, Row};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::error::{GraphError, Result};

#[derive(Debug, Clone)]
struct ConnectSettings {
    uri: String,
    user: String,
    password: String,
}

struct Inner {
    graph: ArcSwap<Graph>,
    settings: ConnectSettings,
    keepalive: Mutex<Option<JoinHandle<()>>>,
}

/// Connection to Neo4j owned by the worker process.
///
/// The underlying `neo4rs::Graph` can be swapped out: a failed connection is
/// re-established by the keep-alive task or by the first query that hits it,
/// and callers keep using the same `GraphClient`.
#[derive(Clone)]
pub struct GraphClient {
    inner: Arc<Inner>,
}

impl GraphClient {
    /// Connect to Neo4j with the given credentials and verify the connection.
    pub async fn connect(uri: &str, user: &str, password: &str) -> Result<Self> {
        let settings = ConnectSettings {
            uri: uri.to_string(),
            user: user.to_string(),
            password: password.to_string(),
        };
        let graph = open(&settings).await?;
        Ok(Self {
            inner: Arc::new(Inner {
                graph: ArcSwap::from_pointee(graph),
                settings,
                keepalive: Mutex::new(None),
            }),
        })
    }

    /// Current underlying graph handle.
    pub fn inner(&self) -> Arc<Graph> {
        self.inner.graph.load_full()
    }

    /// Run a statement that returns no rows.
    pub async fn run(&self, q: Query) -> Result<()> {
        match self.inner().run(q.clone()).await.map_err(GraphError::from) {
            Err(e) if e.is_connection() => {
                warn!(error = %e, "Graph connection lost, reconnecting");
                self.reconnect().await?;
                Ok(self.inner().run(q).await?)
            }
            other => other,
        }
    }

    /// Run a statement and collect its rows.
    pub async fn execute(&self, q: Query) -> Result<Vec<Row>> {
        match collect_rows(&self.inner(), q.clone()).await {
            Err(e) if e.is_connection() => {
                warn!(error = %e, "Graph connection lost, reconnecting");
                self.reconnect().await?;
                collect_rows(&self.inner(), q).await
            }
            other => other,
        }
    }

    /// Replace the underlying graph with a freshly connected one.
    pub async fn reconnect(&self) -> Result<()> {
        let graph = open(&self.inner.settings).await?;
        self.inner.graph.store(Arc::new(graph));
        info!(uri = self.inner.settings.uri.as_str(), "Graph connection re-established");
        Ok(())
    }

    /// Start a periodic ping that reconnects on failure. Calling this again
    /// replaces the previous keep-alive task. The task ends on `shutdown()` or
    /// once every clone of this client has been dropped.
    pub fn spawn_keepalive(&self, interval: Duration) {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let client = GraphClient { inner };
                if let Err(e) = client.ping().await {
                    warn!(error = %e, "Graph keep-alive ping failed, reconnecting");
                    if let Err(e) = client.reconnect().await {
                        warn!(error = %e, "Graph reconnect failed, will retry on next tick");
                    }
                }
            }
        });

        let mut slot = match self.inner.keepalive.lock() {
            Ok(slot) => slot,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(previous) = slot.replace(handle) {
            previous.abort();
        }
    }

    pub async fn ping(&self) -> Result<()> {
        Ok(self.inner().run(Query::new("RETURN 1".to_string())).await?)
    }

    /// Stop the keep-alive task. Queries still work afterwards.
    pub fn shutdown(&self) {
        let mut slot = match self.inner.keepalive.lock() {
            Ok(slot) => slot,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(handle) = slot.take() {
            handle.abort();
            info!("Graph keep-alive stopped");
        }
    }
}

async fn open(settings: &ConnectSettings) -> Result<Graph> {
    let config = ConfigBuilder::default()
        .uri(&settings.uri)
        .user(&settings.user)
        .password(&settings.password)
        .fetch_size(500)
        .max_connections(10)
        .build()
        .map_err(|e| GraphError::Connection(e.to_string()))?;
    let graph = Graph::connect(config)
        .await
        .map_err(|e| GraphError::Connection(e.to_string()))?;

    // The pool is lazy; force a real handshake so bad credentials fail here.
    graph
        .run(Query::new("RETURN 1".to_string()))
        .await
        .map_err(|e| GraphError::Connection(e.to_string()))?;

    Ok(graph)
}

async fn collect_rows(graph: &Graph, q: Query) -> Result<Vec<Row>> {
    let mut stream = graph.execute(q).await?;
    let mut rows = Vec::new();
    while let Some(row) = stream.next().await? {
        rows.push(row);
    }
    Ok(rows)
}
