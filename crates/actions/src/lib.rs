//! `actions` crate — the `ActionRunner` trait and the built-in runners.
//!
//! Every step action kind (script, deploy, remote command, upload) is
//! executed through [`ActionRunner`]. The engine crate never spawns a
//! process itself; it looks the runner up in an [`ActionRegistry`].

pub mod action;
pub mod error;
pub mod mock;
pub mod process;
pub mod registry;
pub mod runners;
pub mod traits;

pub use action::{ActionKind, StepAction};
pub use error::ActionError;
pub use registry::ActionRegistry;
pub use traits::{ActionContext, ActionOutput, ActionRunner};
