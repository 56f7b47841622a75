//! Maps each [`ActionKind`] to the runner that executes it.

use std::collections::HashMap;
use std::sync::Arc;

use crate::runners::{DeployRunner, RemoteCommandRunner, ScriptRunner, UploadRunner};
use crate::{ActionKind, ActionRunner, StepAction};

#[derive(Clone, Default)]
pub struct ActionRegistry {
    runners: HashMap<ActionKind, Arc<dyn ActionRunner>>,
}

impl ActionRegistry {
    /// An empty registry; every lookup fails until runners are registered.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry wired to the process-backed runners.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(ActionKind::ExecuteScript, Arc::new(ScriptRunner));
        registry.register(ActionKind::Deploy, Arc::new(DeployRunner::default()));
        registry.register(ActionKind::RemoteCommand, Arc::new(RemoteCommandRunner::default()));
        registry.register(ActionKind::UploadFiles, Arc::new(UploadRunner::default()));
        registry
    }

    /// Registry that routes every action kind to the same runner.
    pub fn uniform(runner: Arc<dyn ActionRunner>) -> Self {
        let mut registry = Self::new();
        for kind in ActionKind::ALL {
            registry.register(kind, runner.clone());
        }
        registry
    }

    /// Register (or replace) the runner for `kind`.
    pub fn register(&mut self, kind: ActionKind, runner: Arc<dyn ActionRunner>) -> &mut Self {
        self.runners.insert(kind, runner);
        self
    }

    pub fn runner_for(&self, action: &StepAction) -> Option<Arc<dyn ActionRunner>> {
        self.runners.get(&action.kind()).cloned()
    }

    pub fn kinds(&self) -> impl Iterator<Item = ActionKind> + '_ {
        self.runners.keys().copied()
    }
}

impl std::fmt::Debug for ActionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionRegistry")
            .field("kinds", &self.runners.keys().collect::<Vec<_>>())
            .finish()
    }
}
