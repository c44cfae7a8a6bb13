//! Replica push
//!
//! Every committed original is copied to the configured remote hosts. The
//! push is best effort: failures are logged and never reach the caller that
//! saved the record.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use att_core::ReplicationConfig;
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::spec::Replica;
use crate::tool::{ProcessError, ToolCommand};

static SAFE_PATH: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9._/-]+$").expect("valid path pattern"));
static SAFE_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9._-]*$").expect("valid name pattern"));

#[derive(Debug, Error)]
pub enum ReplicaError {
    #[error("Refusing to replicate unsafe path: {0}")]
    UnsafePath(String),
    #[error("Refusing to replicate to unsafe destination: {0}")]
    UnsafeDestination(String),
    #[error(transparent)]
    Process(#[from] ProcessError),
}

/// How files reach a replica
#[async_trait]
pub trait ReplicaTransport: Send + Sync {
    async fn make_dir(&self, replica: &Replica, dir: &Path) -> Result<(), ReplicaError>;

    /// Copy `path` to the same path on the replica
    async fn copy(&self, replica: &Replica, path: &Path) -> Result<(), ReplicaError>;
}

fn checked_path(path: &Path) -> Result<String, ReplicaError> {
    let display = path.to_string_lossy().into_owned();
    if SAFE_PATH.is_match(&display) && !display.starts_with('-') {
        Ok(display)
    } else {
        Err(ReplicaError::UnsafePath(display))
    }
}

fn checked_destination(replica: &Replica) -> Result<String, ReplicaError> {
    if SAFE_NAME.is_match(&replica.host) && SAFE_NAME.is_match(&replica.user) {
        Ok(replica.destination())
    } else {
        Err(ReplicaError::UnsafeDestination(replica.destination()))
    }
}

/// `ssh user@host mkdir -p <dir>` followed by `scp <path> user@host:<path>`
#[derive(Debug, Clone)]
pub struct SshTransport {
    ssh: PathBuf,
    scp: PathBuf,
    timeout: Duration,
}

impl SshTransport {
    pub fn new(ssh: impl Into<PathBuf>, scp: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            ssh: ssh.into(),
            scp: scp.into(),
            timeout,
        }
    }

    pub fn from_config(config: &ReplicationConfig) -> Self {
        Self::new(config.ssh.clone(), config.scp.clone(), config.timeout())
    }
}

#[async_trait]
impl ReplicaTransport for SshTransport {
    async fn make_dir(&self, replica: &Replica, dir: &Path) -> Result<(), ReplicaError> {
        let destination = checked_destination(replica)?;
        let dir = checked_path(dir)?;
        ToolCommand::new(&self.ssh, self.timeout)
            .capture_stderr(true)
            .arg(destination)
            .arg("mkdir")
            .arg("-p")
            .arg(dir)
            .run()
            .await?;
        Ok(())
    }

    async fn copy(&self, replica: &Replica, path: &Path) -> Result<(), ReplicaError> {
        let destination = checked_destination(replica)?;
        let remote = checked_path(path)?;
        ToolCommand::new(&self.scp, self.timeout)
            .capture_stderr(true)
            .path(path)
            .arg(format!("{}:{}", destination, remote))
            .run()
            .await?;
        Ok(())
    }
}

/// The replicas of one specification together with their transport
#[derive(Clone)]
pub struct ReplicaSet {
    replicas: Vec<Replica>,
    transport: Arc<dyn ReplicaTransport>,
}

impl ReplicaSet {
    pub fn new(replicas: Vec<Replica>, transport: Arc<dyn ReplicaTransport>) -> Self {
        Self {
            replicas,
            transport,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.replicas.is_empty()
    }

    /// Push `path` to every replica, one after another
    #[instrument(skip(self), fields(path = %path.display()))]
    pub async fn push(&self, path: &Path) -> Vec<(Replica, Result<(), ReplicaError>)> {
        let mut outcomes = Vec::with_capacity(self.replicas.len());
        for replica in &self.replicas {
            let result = self.push_one(replica, path).await;
            match &result {
                Ok(()) => info!(replica = %replica, "Replicated"),
                Err(e) => warn!(replica = %replica, error = %e, "Replica push failed"),
            }
            outcomes.push((replica.clone(), result));
        }
        outcomes
    }

    async fn push_one(&self, replica: &Replica, path: &Path) -> Result<(), ReplicaError> {
        if let Some(dir) = path.parent() {
            self.transport.make_dir(replica, dir).await?;
        }
        self.transport.copy(replica, path).await
    }

    /// Run [`push`](Self::push) in the background; `None` when there is
    /// nothing to push to
    pub fn spawn_push(
        &self,
        path: PathBuf,
    ) -> Option<JoinHandle<Vec<(Replica, Result<(), ReplicaError>)>>> {
        if self.is_empty() {
            return None;
        }
        debug!(path = %path.display(), replicas = self.replicas.len(), "Scheduling replica push");
        let set = self.clone();
        Some(tokio::spawn(async move { set.push(&path).await }))
    }
}
