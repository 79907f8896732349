//! Graph persistence for the podcast knowledge pipeline.
//!
//! Idempotent MERGE-based upserts over a Bolt connection, one logical
//! database per podcast. Re-running a stage on the same inputs yields the
//! same graph: ids are content hashes and every write is a MERGE.

pub mod client;
pub mod cluster;
pub mod reader;
pub mod router;
pub mod schema;
pub mod store;

pub use client::GraphClient;
pub use cluster::{cosine_similarity, ClusterAssigner, DEFAULT_ASSIGN_THRESHOLD};
pub use reader::{DiversityReport, GraphReader, GraphStats, KnowledgeGap, MissingLink};
pub use router::{resolve_podcast_id, ConnectionDefaults, GraphRouter, UNKNOWN_PODCAST};
pub use schema::ensure_schema;
pub use store::{GraphStore, UnitKnowledge};
