//! # Depi
//!
//! A multi-tool dependency registry and change-propagation service.
//! Resources (files, model nodes, documents) live in versioned resource
//! groups owned by external tools; users link resources across tools, and
//! when a tool adapter reports a new group version, Depi computes which
//! links became dirty, propagates inferred dirtiness through the link
//! graph, and notifies subscribed sessions.
//!
//! ## Modules
//!
//! - `config` - JSON configuration: tools, database backend, server, users
//! - `model` - resources, groups, references, links, changes, patterns
//! - `storage` - the branch/tag catalog contract and its two backends
//!   (JSON snapshots, relational over SQLite)
//! - `auth` - capability-based authorization evaluator
//! - `audit` - daily audit-log writer
//! - `session` - authenticated sessions and the expiration sweeper
//! - `events` - update records and watch-channel plumbing
//! - `blackboard` - per-user staging area promoted atomically on save
//! - `rpc` - the RPC surface: messages, service, HTTP wiring

pub mod audit;
pub mod auth;
pub mod blackboard;
pub mod config;
pub mod error;
pub mod events;
pub mod model;
pub mod rpc;
pub mod session;
pub mod storage;
