//! The closed set of step actions.
//!
//! Actions are part of the declarative workflow schema: a step carries an
//! `action` tag plus the fields of the chosen variant, e.g.
//!
//! ```yaml
//! - name: build
//!   action: execute_script
//!   script: scripts/build.sh
//!   args: [--release]
//! ```
//!
//! An unknown `action` tag is a deserialisation error, so bad definitions
//! are rejected when they are loaded rather than when they run.

use std::fmt;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// StepAction
// ---------------------------------------------------------------------------

/// What a step does.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum StepAction {
    /// Run a local script or executable.
    ExecuteScript {
        #[serde(alias = "script")]
        path: String,
        #[serde(default, alias = "parameters")]
        args: Vec<String>,
    },
    /// Deploy to a named environment.
    Deploy { environment: String },
    /// Run a command on a remote host.
    RemoteCommand { host: String, command: String },
    /// Copy files from `src` to `dst` (either side may be `host:path`).
    UploadFiles { src: String, dst: String },
}

impl StepAction {
    pub fn kind(&self) -> ActionKind {
        match self {
            Self::ExecuteScript { .. } => ActionKind::ExecuteScript,
            Self::Deploy { .. } => ActionKind::Deploy,
            Self::RemoteCommand { .. } => ActionKind::RemoteCommand,
            Self::UploadFiles { .. } => ActionKind::UploadFiles,
        }
    }
}

// ---------------------------------------------------------------------------
// ActionKind
// ---------------------------------------------------------------------------

/// Discriminant of [`StepAction`], used as the registry key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    ExecuteScript,
    Deploy,
    RemoteCommand,
    UploadFiles,
}

impl ActionKind {
    pub const ALL: [ActionKind; 4] = [
        ActionKind::ExecuteScript,
        ActionKind::Deploy,
        ActionKind::RemoteCommand,
        ActionKind::UploadFiles,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ExecuteScript => "execute_script",
            Self::Deploy => "deploy",
            Self::RemoteCommand => "remote_command",
            Self::UploadFiles => "upload_files",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
