use neo4rs::query;
use tracing::info;

use crate::GraphClient;

/// Idempotently create the constraints and indexes the store relies on.
/// Safe to run on every connect.
pub async fn ensure_schema(client: &GraphClient) -> Result<(), neo4rs::Error> {
    let g = &client.graph;

    info!(database = client.database(), "Running schema bootstrap...");

    let constraints = [
        "CREATE CONSTRAINT episode_id IF NOT EXISTS FOR (n:Episode) REQUIRE n.id IS UNIQUE",
        "CREATE CONSTRAINT unit_id IF NOT EXISTS FOR (n:MeaningfulUnit) REQUIRE n.id IS UNIQUE",
        "CREATE CONSTRAINT entity_id IF NOT EXISTS FOR (n:Entity) REQUIRE n.id IS UNIQUE",
        "CREATE CONSTRAINT quote_id IF NOT EXISTS FOR (n:Quote) REQUIRE n.id IS UNIQUE",
        "CREATE CONSTRAINT insight_id IF NOT EXISTS FOR (n:Insight) REQUIRE n.id IS UNIQUE",
        "CREATE CONSTRAINT cluster_id IF NOT EXISTS FOR (n:Cluster) REQUIRE n.id IS UNIQUE",
    ];

    for c in &constraints {
        g.run(query(c)).await?;
    }

    let indexes = [
        "CREATE INDEX unit_start_sec IF NOT EXISTS FOR (n:MeaningfulUnit) ON (n.start_sec)",
        "CREATE INDEX unit_episode_id IF NOT EXISTS FOR (n:MeaningfulUnit) ON (n.episode_id)",
        "CREATE INDEX entity_canonical_name IF NOT EXISTS FOR (n:Entity) ON (n.canonical_name)",
    ];

    for i in &indexes {
        g.run(query(i)).await?;
    }

    info!(database = client.database(), "Schema bootstrap complete");
    Ok(())
}
