//! Core data model: resources, resource groups, references, links, change
//! sets, and query patterns.
//!
//! Storage keeps links as reference triples (`ResourceRef`); the read path
//! materializes them into [`LinkView`] / [`ResourceView`] with full group
//! information.

mod change;
mod link;
mod pattern;
mod resource;
mod view;

pub use change::{ChangeType, ResourceChange, ResourceGroupChange};
pub use link::{url_prefix_matches, InferredDirtiness, Link, LinkRef};
pub use pattern::{ResourceLinkPattern, ResourceRefPattern};
pub use resource::{Resource, ResourceGroup, ResourceRef};
pub use view::{InferredDirtinessView, LinkView, ResourceView};
