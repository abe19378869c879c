use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use strata_integrations::ids::{DBUS_NAME_AGENT, DBUS_OBJECT_PATH_CONTROL, DBUS_OBJECT_PATH_VFS};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use zbus::connection::Builder as ConnectionBuilder;

use crate::dbus_api::{ControlDbusService, VfsDbusService};
use crate::error::CoreError;
use crate::filter::FilterEngine;
use crate::registry::{BackendRegistry, ClientFactory, DefaultClientFactory};
use crate::storage::{ChaChaCipher, CredentialCipher, MasterKeyStorage};
use crate::store::MetadataStore;
use crate::sync::backoff::Backoff;
use crate::sync::{SupervisorConfig, SyncEngine, SyncSupervisor};
use crate::vfs::VfsService;

const DEFAULT_DEBOUNCE_MS: u64 = 750;
const DEFAULT_SUPERVISOR_TICK_SECS: u64 = 5;
const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 10;
const DEFAULT_JOB_RETRIES: u32 = 3;
const DEFAULT_EVAL_TIMEOUT_SECS: u64 = 30;
const FALLBACK_CLIENT_ID: &str = "localhost";

#[derive(Clone)]
pub struct DaemonConfig {
    /// `None` selects the SQLite file in the user data directory.
    pub database_url: Option<String>,
    pub client_id: String,
    /// `None` reads (or creates) the master key in the session keyring.
    pub master_key: Option<String>,
    pub debounce: Duration,
    pub supervisor_tick: Duration,
    pub shutdown_timeout: Duration,
    pub job_retries: u32,
    pub eval_timeout: Duration,
}

impl fmt::Debug for DaemonConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DaemonConfig")
            .field("database_url", &self.database_url)
            .field("client_id", &self.client_id)
            .field("master_key", &self.master_key.as_ref().map(|_| "<redacted>"))
            .field("debounce", &self.debounce)
            .field("supervisor_tick", &self.supervisor_tick)
            .field("shutdown_timeout", &self.shutdown_timeout)
            .field("job_retries", &self.job_retries)
            .field("eval_timeout", &self.eval_timeout)
            .finish()
    }
}

impl DaemonConfig {
    pub fn from_env() -> Result<Self, CoreError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds the configuration from `STRATA_*` variables supplied by `lookup`.
    /// Blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, CoreError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |name: &str| {
            lookup(name)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let client_id = match read("STRATA_CLIENT_ID") {
            Some(id) => id,
            None => default_client_id(),
        };
        Ok(Self {
            database_url: read("STRATA_DATABASE_URL"),
            client_id,
            master_key: read("STRATA_MASTER_KEY"),
            debounce: Duration::from_millis(positive(
                "STRATA_DEBOUNCE_MS",
                read("STRATA_DEBOUNCE_MS"),
                DEFAULT_DEBOUNCE_MS,
            )?),
            supervisor_tick: Duration::from_secs(positive(
                "STRATA_SUPERVISOR_TICK_SECS",
                read("STRATA_SUPERVISOR_TICK_SECS"),
                DEFAULT_SUPERVISOR_TICK_SECS,
            )?),
            shutdown_timeout: Duration::from_secs(positive(
                "STRATA_SHUTDOWN_TIMEOUT_SECS",
                read("STRATA_SHUTDOWN_TIMEOUT_SECS"),
                DEFAULT_SHUTDOWN_TIMEOUT_SECS,
            )?),
            job_retries: match read("STRATA_JOB_RETRIES") {
                Some(value) => value.parse::<u32>().map_err(|_| {
                    CoreError::Validation(format!(
                        "STRATA_JOB_RETRIES must be a non-negative integer, got '{value}'"
                    ))
                })?,
                None => DEFAULT_JOB_RETRIES,
            },
            eval_timeout: Duration::from_secs(positive(
                "STRATA_EVAL_TIMEOUT_SECS",
                read("STRATA_EVAL_TIMEOUT_SECS"),
                DEFAULT_EVAL_TIMEOUT_SECS,
            )?),
        })
    }

    fn supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            tick: self.supervisor_tick,
            debounce: self.debounce,
            shutdown_timeout: self.shutdown_timeout,
            run_backoff: Backoff::for_runs(),
        }
    }
}

fn positive(name: &str, value: Option<String>, default: u64) -> Result<u64, CoreError> {
    let Some(value) = value else {
        return Ok(default);
    };
    match value.parse::<u64>() {
        Ok(parsed) if parsed > 0 => Ok(parsed),
        _ => Err(CoreError::Validation(format!(
            "{name} must be a positive integer, got '{value}'"
        ))),
    }
}

fn default_client_id() -> String {
    match hostname::get() {
        Ok(name) if !name.is_empty() => name.to_string_lossy().into_owned(),
        Ok(_) => FALLBACK_CLIENT_ID.to_string(),
        Err(err) => {
            warn!(error = %err, fallback = FALLBACK_CLIENT_ID, "hostname is unavailable");
            FALLBACK_CLIENT_ID.to_string()
        }
    }
}

/// Every long-lived component of the agent, wired together once and shared
/// by the control surface and the supervisor.
pub struct AgentServices {
    pub store: Arc<MetadataStore>,
    pub registry: Arc<BackendRegistry>,
    pub filters: Arc<FilterEngine>,
    pub vfs: Arc<VfsService>,
    pub supervisor: Arc<SyncSupervisor>,
}

impl AgentServices {
    pub fn assemble(
        store: Arc<MetadataStore>,
        cipher: Arc<dyn CredentialCipher>,
        factory: Arc<dyn ClientFactory>,
        config: &DaemonConfig,
    ) -> Self {
        let registry = Arc::new(BackendRegistry::new(store.clone(), cipher, factory));
        let filters = Arc::new(FilterEngine::with_cache(store.clone()));
        let engine = Arc::new(
            SyncEngine::new(
                store.clone(),
                registry.clone(),
                filters.clone(),
                config.client_id.clone(),
            )
            .with_retries(config.job_retries, Backoff::for_jobs()),
        );
        let supervisor = Arc::new(SyncSupervisor::new(
            engine,
            store.clone(),
            config.supervisor_config(),
        ));
        let vfs = Arc::new(VfsService::new(
            store.clone(),
            registry.clone(),
            filters.clone(),
            config.client_id.clone(),
        ));
        Self {
            store,
            registry,
            filters,
            vfs,
            supervisor,
        }
    }
}

pub struct DaemonRuntime {
    config: DaemonConfig,
    services: Arc<AgentServices>,
}

impl DaemonRuntime {
    pub async fn bootstrap(config: DaemonConfig) -> anyhow::Result<Self> {
        let store = match &config.database_url {
            Some(url) => {
                let store = MetadataStore::connect(url)
                    .await
                    .context("failed to connect to the metadata store")?;
                let applied = store
                    .migrate()
                    .await
                    .context("failed to migrate the metadata store")?;
                if !applied.is_empty() {
                    info!(versions = ?applied, "applied metadata migrations");
                }
                store
            }
            None => MetadataStore::open_default()
                .await
                .context("failed to open the default metadata store")?,
        };
        store
            .health()
            .await
            .context("metadata store is not responding")?;

        let secret = MasterKeyStorage::new(config.master_key.clone())
            .and_then(|storage| storage.load_or_create())
            .context("failed to load the credential master key")?;
        let services = AgentServices::assemble(
            Arc::new(store),
            Arc::new(ChaChaCipher::from_secret(&secret)),
            Arc::new(DefaultClientFactory::new()),
            &config,
        );
        Ok(Self {
            config,
            services: Arc::new(services),
        })
    }

    pub fn services(&self) -> &Arc<AgentServices> {
        &self.services
    }

    pub async fn run(self) -> anyhow::Result<()> {
        info!(
            client = %self.config.client_id,
            store = ?self.services.store.kind(),
            "agent started"
        );

        let _dbus_connection = ConnectionBuilder::session()?
            .name(DBUS_NAME_AGENT)?
            .serve_at(
                DBUS_OBJECT_PATH_CONTROL,
                ControlDbusService::new(self.services.clone(), self.config.eval_timeout),
            )?
            .serve_at(
                DBUS_OBJECT_PATH_VFS,
                VfsDbusService::new(self.services.clone(), self.config.eval_timeout),
            )?
            .build()
            .await
            .context("failed to start D-Bus object server")?;

        let shutdown = CancellationToken::new();
        let mut supervisor = tokio::spawn(
            self.services
                .supervisor
                .clone()
                .run(shutdown.child_token()),
        );

        tokio::select! {
            res = tokio::signal::ctrl_c() => {
                res.context("failed waiting for shutdown signal")?;
                info!("shutdown requested");
            }
            res = &mut supervisor => {
                self.services.store.close().await;
                return match res {
                    Ok(Ok(())) => Err(anyhow::anyhow!("sync supervisor stopped unexpectedly")),
                    Ok(Err(err)) => Err(err).context("sync supervisor failed"),
                    Err(err) => Err(err).context("sync supervisor panicked"),
                };
            }
        }

        shutdown.cancel();
        // the supervisor bounds its own wait; the margin covers its bookkeeping
        let grace = self.config.shutdown_timeout + Duration::from_secs(1);
        match tokio::time::timeout(grace, &mut supervisor).await {
            Ok(Ok(Ok(()))) => info!("sync supervisor stopped"),
            Ok(Ok(Err(err))) => error!(error = %err, "sync supervisor failed during shutdown"),
            Ok(Err(err)) => error!(error = %err, "sync supervisor task failed"),
            Err(_) => {
                warn!(timeout = ?grace, "sync supervisor did not stop in time");
                supervisor.abort();
            }
        }
        self.services.store.close().await;
        Ok(())
    }
}

#[cfg(test)]
#[path = "daemon_tests.rs"]
mod tests;
