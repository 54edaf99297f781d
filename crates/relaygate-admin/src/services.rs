//! Wiring of every engine and their shared lifecycle.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use relaygate_core::config::Config;
use tracing::info;

use crate::access::{AccessSync, DetachedRelay, PidFileProcess, RelayProcess};
use crate::error::{AdminError, Result};
use crate::events::EventStore;
use crate::expiry::ExpiryEngine;
use crate::payments::{LndClient, LndConfig, PaymentBackend, PaymentReconciler};
use crate::retention::RetentionEngine;
use crate::storage::AdminDatabase;
use crate::supervisor::{PeriodicJob, PeriodicTask, Schedule};
use crate::sync::{RelayConnector, SyncEngine, WebSocketConnector};

/// External collaborators handed to [`Services::new`].
pub struct ServiceDeps {
    pub db: AdminDatabase,
    pub events: EventStore,
    pub connector: Arc<dyn RelayConnector>,
    pub relay: Arc<dyn RelayProcess>,
    /// `None` disables payment reconciliation.
    pub payments: Option<Arc<dyn PaymentBackend>>,
}

impl ServiceDeps {
    /// Open the databases and build the production adapters.
    pub async fn open(config: &Config) -> Result<Self> {
        let admin_path = resolve_db_path(config.storage.admin_db_path.as_ref(), "admin.db")?;
        let events_path = resolve_db_path(config.storage.events_db_path.as_ref(), "events.db")?;

        info!(path = %admin_path.display(), "Opening admin database");
        let db = AdminDatabase::open(&admin_path).await?;
        info!(path = %events_path.display(), "Opening event database");
        let events = EventStore::open(&events_path).await?;

        let connector = Arc::new(WebSocketConnector::new(Duration::from_secs(
            config.sync.connect_timeout_secs,
        )));

        let relay: Arc<dyn RelayProcess> = match &config.relay.pid_file {
            Some(pid_file) => Arc::new(PidFileProcess::new(
                pid_file.clone(),
                config.relay.restart_command.clone(),
            )),
            None => Arc::new(DetachedRelay),
        };

        let payments = if config.payments.enabled {
            let lnd = LndClient::new(&LndConfig::from_settings(&config.payments)?)?;
            Some(Arc::new(lnd) as Arc<dyn PaymentBackend>)
        } else {
            None
        };

        Ok(Self {
            db,
            events,
            connector,
            relay,
            payments,
        })
    }
}

fn resolve_db_path(configured: Option<&PathBuf>, file_name: &str) -> Result<PathBuf> {
    if let Some(path) = configured {
        return Ok(path.clone());
    }
    dirs::home_dir()
        .map(|home| home.join(".relaygate").join(file_name))
        .ok_or_else(|| AdminError::Validation("Cannot determine home directory".into()))
}

/// Every background engine of the control plane.
pub struct Services {
    access: Arc<AccessSync>,
    sync: SyncEngine,
    retention: Arc<RetentionEngine>,
    expiry: Arc<ExpiryEngine>,
    payments: Option<PaymentReconciler>,
    retention_task: PeriodicTask,
    expiry_task: PeriodicTask,
}

impl Services {
    pub fn new(deps: ServiceDeps, config: &Config) -> Result<Self> {
        let ServiceDeps {
            db,
            events,
            connector,
            relay,
            payments,
        } = deps;

        let access = Arc::new(AccessSync::new(
            db.clone(),
            relay,
            config.relay.policy_file.clone(),
        ));
        let sync = SyncEngine::new(db.clone(), events.clone(), connector, config.sync.clone());
        let retention = Arc::new(RetentionEngine::new(
            db.clone(),
            events,
            config.operator_pubkey.as_deref(),
        )?);
        let expiry = Arc::new(ExpiryEngine::new(db.clone(), Arc::clone(&access)));
        let payments = payments.map(|backend| {
            PaymentReconciler::new(
                db,
                backend,
                Arc::clone(&access),
                config.payments.clone(),
            )
        });

        let retention_task = PeriodicTask::new(
            "retention",
            Schedule::daily(config.schedule.retention_at),
            Arc::clone(&retention) as Arc<dyn PeriodicJob>,
        );
        let expiry_task = PeriodicTask::new(
            "grant-expiry",
            Schedule::daily(config.schedule.expiry_at),
            Arc::clone(&expiry) as Arc<dyn PeriodicJob>,
        );

        Ok(Self {
            access,
            sync,
            retention,
            expiry,
            payments,
            retention_task,
            expiry_task,
        })
    }

    pub const fn sync(&self) -> &SyncEngine {
        &self.sync
    }

    pub fn retention(&self) -> &RetentionEngine {
        &self.retention
    }

    pub fn expiry(&self) -> &ExpiryEngine {
        &self.expiry
    }

    pub const fn payments(&self) -> Option<&PaymentReconciler> {
        self.payments.as_ref()
    }

    pub fn access(&self) -> &AccessSync {
        &self.access
    }

    /// Recover state left by a previous process and start every task.
    pub async fn start(&self) -> Result<()> {
        self.sync.recover_interrupted().await?;
        self.access.sync_best_effort().await;

        self.retention_task.start().await;
        self.expiry_task.start().await;
        if let Some(payments) = &self.payments {
            payments.start().await;
        }

        info!(payments = self.payments.is_some(), "Services started");
        Ok(())
    }

    /// Cancel any running sync job and stop every task.
    pub async fn stop(&self) {
        self.sync.shutdown().await;
        if let Some(payments) = &self.payments {
            payments.stop().await;
        }
        self.retention_task.stop().await;
        self.expiry_task.stop().await;
        info!("Services stopped");
    }

    pub async fn is_running(&self) -> bool {
        let payments = match &self.payments {
            Some(p) => p.is_running().await,
            None => false,
        };
        payments || self.retention_task.is_running().await || self.expiry_task.is_running().await
    }
}
