//! The declared infrastructure graph.
//!
//! - `resource`: typed declarations and references
//! - `dependency`: the dependency graph and its orderings
//! - `builder`: two-phase construction from resolved inputs
//! - `render`: ARM request bodies

mod builder;
mod dependency;
mod render;
mod resource;

pub use builder::{
    GraphBuilder, InputResolver, ResolvedInputs, schedule_is_placeable, shutdown_schedule_name,
    shutdown_start,
};
pub use dependency::ResourceGraph;
pub use render::{ResolveId, address_of, render, spec_hash};
pub use resource::{
    AdminCredential, DiskAttachment, DiskSource, ResourceDeclaration, ResourceKind, ResourceRef,
    ResourceSpec,
};
