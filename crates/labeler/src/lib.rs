//! GitHub issue auto-labeling service.
//!
//! Given an issue, the service asks a chat model to pick labels from
//! the repository's own label set, using the repository's recently
//! labeled issues as in-context examples. A background indexer embeds
//! issues into a vector index served by brute-force similarity search.
//! The HTTP surface exposes inference, search, webhook intake, and a
//! health probe.

pub mod ai;
pub mod cache;
pub mod config;
pub mod context;
pub mod errors;
pub mod github;
pub mod indexer;
pub mod infer;
pub mod repoconfig;
pub mod sanitize;
pub mod search;
pub mod server;
pub mod store;
pub mod tokens;
pub mod webhook;
