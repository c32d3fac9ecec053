//! # RoostDB - Hierarchical In-Memory Document Database
//!
//! RoostDB is an in-memory NoSQL document database with a REST/SSE
//! interface. Resources form a tree: the root contains named databases, a
//! database contains documents keyed by name, and each document may contain
//! named sub-collections of further documents, recursively. Document content
//! is JSON, validated against a process-wide schema at write time.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                       HTTP Layer (api)                          │
//! │     routing · validation matrix · auth · SSE subscriptions      │
//! └───────────────┬─────────────────────────────────┬───────────────┘
//!                 │                                 │
//!                 ▼                                 ▼
//! ┌───────────────────────────────┐  ┌─────────────────────────────┐
//! │      Resource Tree (store)    │  │ Subscription Fabric         │
//! │  path resolution · verbs ·    │  │ path → channels · SSE       │
//! │  metadata · JSON patch        │  │ frames · non-blocking sends │
//! └───────────────┬───────────────┘  └─────────────────────────────┘
//!                 │
//!                 ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │              Concurrent Ordered Map (skiplist)                  │
//! │   upsert-with-check · validated range scans · deep-copy reads   │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Core Invariants
//!
//! 1. Within any ordered map, each name maps to at most one live node.
//! 2. `createdAt <= lastModifiedAt`; `created*` never change after creation.
//! 3. A subtree whose owning map entry is deleted is unreachable.
//! 4. A range scan reflects an instant of the map with no interleaved
//!    writes in its range.
//! 5. Content must satisfy the schema validator before a write is
//!    observable.
//!
//! ## Module Organization
//!
//! - [`error`]: the crate-wide error taxonomy
//! - [`json`]: canonical JSON values and the visitor
//! - [`patch`]: JSON-pointer patch operations
//! - [`skiplist`]: the concurrent ordered map
//! - [`store`]: the hierarchical resource engine
//! - [`subscription`]: resource-path fan-out and SSE framing
//! - [`schema`]: the process-wide schema validator
//! - [`auth`]: bearer tokens
//! - [`api`]: HTTP dispatch and validation

/// Error types for RoostDB operations.
pub mod error;

/// Canonical JSON values with visitor-based access.
pub mod json;

/// JSON-pointer patch operations over document content.
pub mod patch;

/// The concurrent ordered map storing every tier of the tree.
pub mod skiplist;

/// The hierarchical resource engine.
pub mod store;

/// Resource-path subscriptions and SSE frame dispatch.
pub mod subscription;

/// Process-wide JSON schema validation.
pub mod schema;

/// Bearer-token authentication.
pub mod auth;

/// HTTP dispatch, request validation, and subscription streaming.
pub mod api;

pub use api::{router, ServerContext, SharedContext};
pub use error::{Error, Result};
pub use json::JsonValue;
pub use skiplist::SkipList;
pub use store::Store;
pub use subscription::SubscriptionFabric;
