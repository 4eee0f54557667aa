pub mod bootstrap;
pub mod capacity;
pub mod config;
pub mod deployer;
pub mod jobs;
pub mod queue;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

use std::sync::Arc;
use std::time::Duration;

use nr_db::Store;
use nr_db::models::Server;
use nr_infra::{CloudProvider, DnsProvider, RemoteConnector, RemoteExecutor};

use crate::bootstrap::EdgeProxyBootstrapper;
use crate::capacity::CapacityPlanner;
use crate::config::EngineConfig;
use crate::deployer::{ReadinessCheck, WorkloadDeployer};
use crate::queue::JobQueue;

pub use jobs::{Job, JobContext, JobOutcome, ManageAction};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Store(#[from] nr_db::Error),

    #[error(transparent)]
    Infra(#[from] nr_infra::Error),

    /// Wrong status, missing capacity, duplicate hostname and the like.
    #[error("precondition failed: {0}")]
    Precondition(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    /// A bounded wait ran out, e.g. a server that never finished provisioning.
    #[error("timed out: {0}")]
    Timeout(String),

    /// The job did not finish within its per-attempt budget.
    #[error("attempt exceeded {}s", .0.as_secs())]
    AttemptTimeout(Duration),

    #[error("deploy failed: {0}")]
    Deploy(String),

    #[error("bootstrap failed: {0}")]
    Bootstrap(String),

    #[error("container operation failed: {0}")]
    Container(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Permanent errors fail the job immediately instead of being retried.
    pub fn is_permanent(&self) -> bool {
        match self {
            Self::Precondition(_) | Self::Config(_) | Self::Timeout(_) => true,
            Self::Store(e) => !matches!(e, nr_db::Error::Database(_)),
            Self::Infra(e) => e.is_config(),
            Self::AttemptTimeout(_) | Self::Deploy(_) | Self::Bootstrap(_) | Self::Container(_) => {
                false
            }
        }
    }
}

/// Everything a job needs to talk to the outside world.
#[derive(Clone)]
pub struct Services {
    pub store: Arc<dyn Store>,
    pub cloud: Arc<dyn CloudProvider>,
    pub dns: Arc<dyn DnsProvider>,
    pub remote: Arc<dyn RemoteConnector>,
    pub readiness: Arc<dyn ReadinessCheck>,
    pub config: Arc<EngineConfig>,
    pub queue: JobQueue,
}

impl Services {
    pub fn planner(&self) -> CapacityPlanner<'_> {
        CapacityPlanner::new(self)
    }

    /// Command channel to a server's public address.
    pub fn executor_for(&self, server: &Server) -> Result<Arc<dyn RemoteExecutor>> {
        let ip = server.public_ip.as_deref().ok_or_else(|| {
            Error::Precondition(format!("server {} has no public address", server.name))
        })?;
        Ok(self.remote.connect(ip))
    }

    pub fn deployer_for(&self, server: &Server) -> Result<WorkloadDeployer> {
        Ok(WorkloadDeployer::new(
            self.executor_for(server)?,
            self.readiness.clone(),
            self.config.clone(),
        ))
    }

    pub fn bootstrapper_for(&self, server: &Server) -> Result<EdgeProxyBootstrapper> {
        Ok(EdgeProxyBootstrapper::new(
            self.executor_for(server)?,
            self.config.clone(),
            self.remote.public_key().map(str::to_string),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_permanent_errors() {
        assert!(Error::Precondition("taken".into()).is_permanent());
        assert!(Error::Timeout("boot".into()).is_permanent());
        assert!(Error::Infra(nr_infra::Error::MissingEnv("X".into())).is_permanent());
        assert!(!Error::Deploy("exit 1".into()).is_permanent());
        assert!(!Error::AttemptTimeout(Duration::from_secs(600)).is_permanent());
        assert!(
            !Error::Infra(nr_infra::Error::Remote {
                host: "h".into(),
                message: "refused".into()
            })
            .is_permanent()
        );
        assert!(
            Error::Store(nr_db::Error::NotFound {
                entity: "instance",
                id: uuid::Uuid::nil()
            })
            .is_permanent()
        );
    }
}
