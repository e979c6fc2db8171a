//! Container updater.
//!
//! Recreates a container on a new image under the same name, config, host
//! config and networks:
//!
//! ```text
//! pull ─▶ inspect ─▶ stop ─▶ rename to backup ─▶ create ─▶ start ─▶ remove backup
//!                                                  │          │
//!                                                  ▼          ▼
//!                                        rename back    remove new, rename back,
//!                                        (left stopped)  restart old
//! ```
//!
//! A create failure leaves the original container stopped under its name; a
//! start failure puts the original back and restarts it. Secondary failures
//! during rollback or cleanup never abort the sequence; they are logged and
//! counted in `dockwatch_rollback_failures_total`.
//!
//! Cancellation is observed while waiting for the per-container lock, during
//! the pull, and between the mutating stages. A runtime call that has already
//! been issued always completes. Cancelled after the stop, the updater undoes
//! what it did (new container removed, name restored) and restarts the
//! original if it was running.

use std::sync::Arc;

use chrono::Utc;
use dockwatch_core::metrics as m;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::docker::{ContainerDetails, ContainerMutator, ImagePuller};
use crate::error::{UpdateError, UpdateStage, WatcherError};
use crate::keyed::KeyedLocks;

/// Grace period given to the old container before SIGKILL.
pub const STOP_TIMEOUT_SECS: i64 = 100;

fn stage_error(stage: UpdateStage) -> impl FnOnce(WatcherError) -> WatcherError {
    move |e| UpdateError::new(stage, e).into()
}

fn best_effort_failed(step: &'static str, container: &str, e: &WatcherError) {
    metrics::counter!(m::ROLLBACK_FAILURES_TOTAL, m::LABEL_STAGE => step).increment(1);
    error!(container, step, error = %e, "best-effort step failed");
}

/// Serializes updates per container id.
pub struct Updater<D> {
    docker: Arc<D>,
    locks: KeyedLocks,
}

impl<D: ImagePuller + ContainerMutator> Updater<D> {
    pub fn new(docker: Arc<D>) -> Self {
        Self {
            docker,
            locks: KeyedLocks::new(),
        }
    }

    /// Replaces `container_id`'s image with `image_ref`.
    ///
    /// Concurrent calls for the same container run one after the other.
    /// No stage is retried.
    ///
    /// # Errors
    ///
    /// [`WatcherError::Update`] tagged with the failing stage; its message
    /// starts with `pull:`, `inspect:`, `stop:`, `create:` or `start new:`.
    /// [`WatcherError::Cancelled`] when `cancel` fired first.
    pub async fn update_container(
        &self,
        cancel: &CancellationToken,
        container_id: &str,
        image_ref: &str,
    ) -> Result<(), WatcherError> {
        let lock = self.locks.handle(container_id);
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(WatcherError::Cancelled),
            _held = lock.lock() => self.run(cancel, container_id, image_ref).await,
        };

        match &result {
            Ok(()) => {
                metrics::counter!(m::UPDATES_TOTAL, m::LABEL_RESULT => "success").increment(1);
                info!(container_id, image = image_ref, "container updated");
            }
            Err(e) => {
                metrics::counter!(m::UPDATES_TOTAL, m::LABEL_RESULT => "failure").increment(1);
                error!(container_id, image = image_ref, error = %e, "container update failed");
            }
        }
        result
    }

    async fn run(&self, cancel: &CancellationToken, container_id: &str, image_ref: &str) -> Result<(), WatcherError> {
        info!(container_id, image = image_ref, "pulling image");
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(WatcherError::Cancelled),
            pulled = self.docker.pull_image(image_ref) => pulled.map_err(stage_error(UpdateStage::Pull))?,
        }
        if cancel.is_cancelled() {
            return Err(WatcherError::Cancelled);
        }

        let old = self
            .docker
            .inspect_container(container_id)
            .await
            .map_err(stage_error(UpdateStage::Inspect))?;
        if cancel.is_cancelled() {
            return Err(WatcherError::Cancelled);
        }

        if old.running {
            self.docker
                .stop_container(container_id, STOP_TIMEOUT_SECS)
                .await
                .map_err(stage_error(UpdateStage::Stop))?;
        } else {
            info!(container_id, "container already stopped, new one will not be started");
        }

        let backup_name = format!("{}-old-{}", old.name, Utc::now().timestamp());
        let renamed = match self.docker.rename_container(container_id, &backup_name).await {
            Ok(()) => true,
            Err(e) => {
                warn!(container_id, backup = %backup_name, error = %e, "rename to backup failed, continuing");
                false
            }
        };
        if cancel.is_cancelled() {
            self.restore(&old, None, renamed).await;
            return Err(WatcherError::Cancelled);
        }

        let spec = old.spec.with_image(image_ref);
        let new_id = match self.docker.create_container(&old.name, &spec).await {
            Ok(id) => id,
            Err(e) => {
                self.rollback_create(&old, renamed).await;
                return Err(stage_error(UpdateStage::Create)(e));
            }
        };
        if cancel.is_cancelled() {
            self.restore(&old, Some(&new_id), renamed).await;
            return Err(WatcherError::Cancelled);
        }

        if old.running {
            if let Err(e) = self.docker.start_container(&new_id).await {
                warn!(container_id = %old.id, new_id = %new_id, "start failed, restoring previous container");
                self.restore(&old, Some(&new_id), renamed).await;
                return Err(stage_error(UpdateStage::StartNew)(e));
            }
        }

        if let Err(e) = self.docker.remove_container(container_id, true, false).await {
            best_effort_failed("remove_backup", container_id, &e);
        }
        info!(old_id = container_id, new_id = %new_id, name = %old.name, "container recreated");
        Ok(())
    }

    /// Old container stays stopped; only its name is restored.
    async fn rollback_create(&self, old: &ContainerDetails, renamed: bool) {
        warn!(container_id = %old.id, name = %old.name, "create failed, restoring name");
        if renamed {
            if let Err(e) = self.docker.rename_container(&old.id, &old.name).await {
                best_effort_failed("rename_back", &old.id, &e);
            }
        }
    }

    /// Removes the new container if any, restores the old name and restarts
    /// the old container if it was running before the update.
    async fn restore(&self, old: &ContainerDetails, new_id: Option<&str>, renamed: bool) {
        info!(container_id = %old.id, name = %old.name, "restoring previous container");
        if let Some(new_id) = new_id {
            if let Err(e) = self.docker.remove_container(new_id, true, true).await {
                best_effort_failed("remove_new", new_id, &e);
            }
        }
        if renamed {
            if let Err(e) = self.docker.rename_container(&old.id, &old.name).await {
                best_effort_failed("rename_back", &old.id, &e);
            }
        }
        if old.running {
            if let Err(e) = self.docker.start_container(&old.id).await {
                best_effort_failed("restart_old", &old.id, &e);
            }
        }
    }
}
