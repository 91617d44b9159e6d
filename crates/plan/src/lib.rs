//! # arbor-plan
//!
//! The execution-plan IR consumed by the runtime.
//!
//! A plan is produced by an external compiler, deserialized from JSON and
//! then only ever read. The runtime walks it pre-order, addressing nodes by
//! [`NodePath`] (`root`, `root/0`, `root/0/2`, ...).
//!
//! | Node kind | Backend | Executed by |
//! |-----------|---------|-------------|
//! | `Relational` | `Relational` | SQL over a pooled connection |
//! | `Service` | `Service` | HTTP call |
//! | `InMemory` | `InMemory` | transforms over literal or published rows |
//! | `Sequence` | `Sequence` | the orchestrator itself |
//! | `Other` | any tag | whichever executor registered that tag |

pub mod auth;
pub mod connection;
pub mod node;
pub mod path;
pub mod plan;
pub mod template;

pub use auth::{AuthenticationKind, AuthenticationSpec, SecretRef};
pub use connection::{ConnectionKey, ConnectionSpec};
pub use node::{BackendKind, ExecutionNode, InMemorySource, NodeKind, ResultShape, TransformOp};
pub use path::NodePath;
pub use plan::ExecutionPlan;
pub use template::{Template, TemplateFunction};
