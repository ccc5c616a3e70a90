// ============================================================================
// Linting
// ============================================================================

#![deny(unsafe_code)]                 // Unsafe code is forbidden
#![warn(missing_docs)]                // Public items should be documented
#![warn(dead_code)]                   // Unused code is flagged
#![deny(non_camel_case_types)]        // Types must follow CamelCase convention
#![deny(unused_must_use)]             // Must handle Result and Option explicitly
#![deny(nonstandard_style)]           // Non-standard code style is forbidden
#![forbid(unsafe_op_in_unsafe_fn)]    // Unsafe ops in unsafe fns are forbidden

// Clippy lints (warnings only)
#![warn(clippy::all)]                 // All standard Clippy lints
#![warn(clippy::pedantic)]            // Very strict Clippy lints
#![warn(clippy::nursery)]             // Experimental lints
#![warn(clippy::unwrap_used)]         // unwrap() warning
#![warn(clippy::expect_used)]         // expect() warning
#![warn(clippy::panic)]               // panic!() warning
#![warn(clippy::todo)]                // TODO warning
#![warn(clippy::unimplemented)]       // unimplemented!() warning
#![warn(clippy::unwrap_in_result)]    // unwrap() in Result warning
#![warn(clippy::redundant_clone)]     // Useless clones warning

// Safety and robustness lints
#![deny(overflowing_literals)]        // Overflowing literals are forbidden
#![deny(arithmetic_overflow)]         // Arithmetic overflow is forbidden

// ============================================================================
// Crate Documentation
// ============================================================================

//! # DCS Server Deploy
//!
//! Declarative, idempotent provisioning of an Azure virtual machine that
//! hosts a DCS multiplayer server and its SRS voice relay.
//!
//! ## Overview
//!
//! The stack is described in `dcs.deploy.yaml`. From it the tool:
//!
//! - resolves the disk snapshots and the admin secret the stack needs
//! - builds a typed graph of declared Azure resources
//! - diffs that graph against recorded state and what exists in Azure
//! - applies an ordered plan, retrying partial failures
//! - exports the server's public IP address
//!
//! ## Architecture
//!
//! 1. **Desired State**: the resource graph built from `dcs.deploy.yaml`
//! 2. **Observed State**: read from Azure Resource Manager
//! 3. **Reconciler**: compares both and executes the necessary actions
//!
//! ## Modules
//!
//! - [`config`]: Configuration parsing and validation
//! - [`secrets`]: Secret lookup and redaction
//! - [`graph`]: Resource declarations, dependencies and ARM rendering
//! - [`cloud`]: Cloud provider trait, ARM client and in-memory cloud
//! - [`planner`]: Diff computation and execution planning
//! - [`reconciler`]: State reconciliation engine
//! - [`state`]: State storage backends (local, S3)
//! - [`cli`]: Command-line interface
//!
//! ## Example
//!
//! ```yaml
//! project:
//!   name: dcs-server
//!   environment: prod
//!   resource_group: DcsMultiplayerServer
//!   location: northcentralus
//!
//! disks:
//!   - name: osManagedDisk
//!     role: os
//!     snapshot: dcsOsHdd
//!     size_gb: 256
//! ```

// ============================================================================
// Modules
// ============================================================================

pub mod cli;
pub mod cloud;
pub mod config;
pub mod error;
pub mod graph;
pub mod planner;
pub mod reconciler;
pub mod secrets;
pub mod state;

// ============================================================================
// Re-exports
// ============================================================================

pub use cli::{Cli, Commands, OutputFormatter};
pub use cloud::{AzureClient, CloudProvider, InMemoryCloud};
pub use config::{ConfigHasher, ConfigParser, ConfigValidator, DeployConfig};
pub use error::{DeployError, Result};
pub use graph::{GraphBuilder, InputResolver, ResourceGraph};
pub use planner::{DeploymentPlan, DiffEngine, PlanExecutor};
pub use reconciler::{DriftReport, ReconciliationResult, Reconciler};
pub use state::{DeploymentState, LocalStateStore, S3StateStore, StateStore};
