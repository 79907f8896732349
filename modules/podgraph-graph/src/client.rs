use neo4rs::{ConfigBuilder, Graph};

/// Thin wrapper around neo4rs::Graph providing connection setup, pinned to
/// one logical database.
#[derive(Clone)]
pub struct GraphClient {
    pub(crate) graph: Graph,
    database: String,
}

impl GraphClient {
    /// Connect over Bolt with the given credentials, scoped to `database`.
    pub async fn connect(
        uri: &str,
        user: &str,
        password: &str,
        database: &str,
    ) -> Result<Self, neo4rs::Error> {
        let config = ConfigBuilder::default()
            .uri(uri)
            .user(user)
            .password(password)
            .db(database)
            .fetch_size(500)
            .max_connections(10)
            .build()?;
        let graph = Graph::connect(config).await?;
        Ok(Self {
            graph,
            database: database.to_string(),
        })
    }

    /// Get a reference to the underlying neo4rs Graph.
    pub fn inner(&self) -> &Graph {
        &self.graph
    }

    pub fn database(&self) -> &str {
        &self.database
    }
}
