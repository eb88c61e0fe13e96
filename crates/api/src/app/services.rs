use std::sync::Arc;

use anyhow::Context;

use dispatchgate_guards::ToolCatalogue;
use dispatchgate_infra::{
    AuditLog, Clock, ConcurrencyGuard, DispatchConfig, DispatchCoordinator, GuardStore,
    HttpWorkflowEngine, InMemoryGuardStore, KillSwitch, PostgresGuardStore, RateLimiter,
    SystemClock, WorkflowEngine,
};

/// Everything the handlers need, shared behind one `Arc`.
#[derive(Clone)]
pub struct AppServices {
    pub coordinator: DispatchCoordinator,
    pub kill_switch: KillSwitch,
    pub concurrency: ConcurrencyGuard,
    pub audit: AuditLog,
}

impl AppServices {
    /// Wire the guard services over one store and one engine.
    pub fn new<S: GuardStore + 'static>(
        config: &DispatchConfig,
        store: Arc<S>,
        catalogue: ToolCatalogue,
        engine: Arc<dyn WorkflowEngine>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let catalogue = Arc::new(catalogue);
        let audit = AuditLog::new(store.clone(), clock.clone(), config.audit_stale_after);
        let kill_switch =
            KillSwitch::new(store.clone(), catalogue.clone(), audit.clone(), clock.clone());
        let concurrency = ConcurrencyGuard::new(
            store.clone(),
            config.concurrency.clone(),
            audit.clone(),
            clock.clone(),
        );
        let rate_limiter = RateLimiter::new(store, config.rate_limit, clock);

        let coordinator = DispatchCoordinator::new(
            catalogue,
            rate_limiter,
            kill_switch.clone(),
            concurrency.clone(),
            audit.clone(),
            engine,
            config.execution_mode,
            config.invoke_timeout,
        );

        Self {
            coordinator,
            kill_switch,
            concurrency,
            audit,
        }
    }
}

/// Postgres when `DATABASE_URL` is set, in-memory otherwise.
pub async fn build_services(config: &DispatchConfig) -> anyhow::Result<AppServices> {
    let catalogue = match &config.tools_file {
        Some(path) => {
            let raw = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("failed to read tool catalogue {}", path.display()))?;
            ToolCatalogue::from_json(&raw)
                .with_context(|| format!("invalid tool catalogue {}", path.display()))?
        }
        None => ToolCatalogue::builtin(),
    };
    tracing::info!(tools = catalogue.len(), mode = %config.execution_mode, "tool catalogue loaded");

    let engine: Arc<dyn WorkflowEngine> = Arc::new(
        HttpWorkflowEngine::new(
            config.webhook_base_url(),
            Some(config.webhook_secret.clone().into_bytes()),
            config.invoke_timeout,
        )
        .context("failed to build workflow engine client")?,
    );
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let services = match &config.database_url {
        Some(url) => {
            let store = PostgresGuardStore::connect(url)
                .await
                .context("failed to connect to Postgres")?;
            store.migrate().await.context("failed to apply migrations")?;
            tracing::info!("using Postgres guard store");
            AppServices::new(config, Arc::new(store), catalogue, engine, clock)
        }
        None => {
            tracing::warn!("DATABASE_URL not set; guard state is in-memory and per-process");
            AppServices::new(
                config,
                Arc::new(InMemoryGuardStore::new()),
                catalogue,
                engine,
                clock,
            )
        }
    };
    Ok(services)
}
