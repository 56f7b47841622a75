//! Engine wiring shared by the sub-commands.

use std::path::Path;
use std::sync::Arc;

use actions::ActionRegistry;
use anyhow::Context;
use engine::store::RecordStore;
use engine::{
    CoordinatorConfig, DefinitionSet, DefinitionStore, ExecutionCoordinator, Scheduler,
    SchedulerConfig, SqlStore,
};
use tracing::{info, warn};

pub struct Runtime {
    pub coordinator: ExecutionCoordinator,
    pub scheduler: Scheduler,
    pub definitions: DefinitionSet,
}

/// Read every definition file in `dir`. A missing directory is an empty set.
pub fn load_definitions(dir: &Path) -> anyhow::Result<DefinitionSet> {
    if !dir.is_dir() {
        warn!(dir = %dir.display(), "workflows directory not found, starting with no definitions");
        return Ok(DefinitionSet::default());
    }
    let set = DefinitionSet::load_dir(dir)
        .with_context(|| format!("loading definitions from {}", dir.display()))?;
    info!(
        workflows = set.workflows.len(),
        tasks = set.scheduled_tasks.len(),
        "definitions loaded"
    );
    Ok(set)
}

/// Connect to the database, apply migrations and build the coordinator and
/// scheduler with the definitions from `workflows_dir` installed.
pub async fn open(
    database_url: &str,
    workflows_dir: &Path,
    scheduler_config: SchedulerConfig,
) -> anyhow::Result<Runtime> {
    let definitions = load_definitions(workflows_dir)?;

    let pool = db::pool::create_pool(database_url, 5)
        .await
        .with_context(|| format!("connecting to {database_url}"))?;
    db::pool::run_migrations(&pool)
        .await
        .context("applying database migrations")?;
    let store: Arc<dyn RecordStore> = Arc::new(SqlStore::new(pool));

    let store_defs = Arc::new(DefinitionStore::new());
    store_defs
        .install(&definitions)
        .context("installing workflow definitions")?;

    let coordinator = ExecutionCoordinator::builder(
        store_defs,
        Arc::new(ActionRegistry::with_defaults()),
        store,
    )
    .config(CoordinatorConfig::default())
    .build();
    let scheduler = Scheduler::new(coordinator.clone(), scheduler_config);

    Ok(Runtime {
        coordinator,
        scheduler,
        definitions,
    })
}
