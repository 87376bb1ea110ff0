//! Image acquisition lifecycle
//!
//! [`ImageAcquisition`] owns one image plugin instance and drives it through
//! `create` / `resume` / `stop`. Acquisition work runs on tokio's blocking
//! pool; the caller learns about the result through the completion callback
//! or the [`AcquisitionHandle`] returned when the work starts.
//!
//! ```text
//! Idle ──create──▶ Fetching ──┐
//!   │                         ├──▶ Completed | Failed | Cancelled
//!   └──resume──▶ Resuming ────┘
//! ```
//!
//! Guarantees:
//! - At most one worker per instance; a second `create` while one is in
//!   flight is rejected with [`LifecycleError::AlreadyRunning`].
//! - Exactly one completion callback per started acquisition, even when the
//!   plugin fails or panics.
//! - `stop` returns only after the worker has exited. Once cancellation is
//!   requested, progress is no longer forwarded and a finished worker is
//!   reported as `Cancelled`, never as a success.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::{oneshot, watch, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::plugin::{ImagePlugin, ModuleRef};
use crate::settings::PersistenceError;
use tb_core::{CapabilityDescriptor, GameEngine, ImageMapInformation, ImageType};

/// Progress notifications: image kind and percentage (0..=100)
pub type ProgressCallback = Arc<dyn Fn(ImageType, f32) + Send + Sync>;

/// Terminal notification, invoked exactly once per started acquisition
pub type CompletedCallback = Box<dyn FnOnce(&AcquisitionOutcome) + Send>;

/// Cooperative cancellation flag, one per acquisition.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// What a plugin sees while it works
pub struct AcquisitionContext {
    id: Uuid,
    token: CancelToken,
    progress: Option<ProgressCallback>,
    finished: AtomicBool,
}

impl AcquisitionContext {
    pub fn new(token: CancelToken, progress: Option<ProgressCallback>) -> Self {
        Self {
            id: Uuid::new_v4(),
            token,
            progress,
            finished: AtomicBool::new(false),
        }
    }

    /// A context with a fresh token and no progress listener
    pub fn detached() -> Self {
        Self::new(CancelToken::new(), None)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.token
    }

    /// True once the host asked the acquisition to stop
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Forward progress to the host. Ignored after cancellation or completion.
    pub fn report_progress(&self, kind: ImageType, percentage: f32) {
        if self.is_cancelled() || self.finished.load(Ordering::SeqCst) {
            return;
        }
        if let Some(progress) = &self.progress {
            let percentage = if percentage.is_nan() {
                0.0
            } else {
                percentage.clamp(0.0, 100.0)
            };
            progress(kind, percentage);
        }
    }

    fn mark_finished(&self) {
        self.finished.store(true, Ordering::SeqCst);
    }
}

/// Why a plugin could not produce its image
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct AcquisitionFailure {
    message: String,
}

impl AcquisitionFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<std::io::Error> for AcquisitionFailure {
    fn from(err: std::io::Error) -> Self {
        Self::new(format!("IO error: {}", err))
    }
}

impl From<PersistenceError> for AcquisitionFailure {
    fn from(err: PersistenceError) -> Self {
        Self::new(err.to_string())
    }
}

/// Lifecycle state of one [`ImageAcquisition`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AcquisitionState {
    Idle,
    Fetching,
    Resuming,
    Completed,
    Failed,
    Cancelled,
}

impl AcquisitionState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            AcquisitionState::Completed | AcquisitionState::Failed | AcquisitionState::Cancelled
        )
    }

    pub fn is_active(self) -> bool {
        matches!(self, AcquisitionState::Fetching | AcquisitionState::Resuming)
    }
}

impl fmt::Display for AcquisitionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AcquisitionState::Idle => write!(f, "Idle"),
            AcquisitionState::Fetching => write!(f, "Fetching"),
            AcquisitionState::Resuming => write!(f, "Resuming"),
            AcquisitionState::Completed => write!(f, "Completed"),
            AcquisitionState::Failed => write!(f, "Failed"),
            AcquisitionState::Cancelled => write!(f, "Cancelled"),
        }
    }
}

/// Terminal result of one acquisition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcquisitionOutcome {
    pub id: Uuid,
    /// `Completed`, `Failed` or `Cancelled`
    pub state: AcquisitionState,
    /// Diagnostic for failures and cancellations
    pub message: Option<String>,
    pub duration_ms: u64,
    pub finished_at: DateTime<Utc>,
}

impl AcquisitionOutcome {
    fn new(id: Uuid, state: AcquisitionState, message: Option<String>, duration_ms: u64) -> Self {
        Self {
            id,
            state,
            message,
            duration_ms,
            finished_at: Utc::now(),
        }
    }

    /// The boolean the completion contract is defined by
    pub fn success(&self) -> bool {
        self.state == AcquisitionState::Completed
    }

    pub fn is_cancelled(&self) -> bool {
        self.state == AcquisitionState::Cancelled
    }
}

/// Errors from driving an [`ImageAcquisition`]
#[derive(Error, Debug)]
pub enum LifecycleError {
    #[error("An acquisition is already in progress ({0})")]
    AlreadyRunning(AcquisitionState),

    #[error("Acquisitions must be started from within a tokio runtime")]
    NoRuntime,

    #[error("Settings persistence failed: {0}")]
    Persistence(#[from] PersistenceError),
}

/// Caller's view of a started acquisition
#[derive(Debug)]
pub struct AcquisitionHandle {
    id: Uuid,
    token: CancelToken,
    outcome: oneshot::Receiver<AcquisitionOutcome>,
}

impl AcquisitionHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.token
    }

    /// Ask the worker to stop without waiting for it.
    pub fn request_cancel(&self) {
        self.token.cancel();
    }

    /// Wait for the terminal outcome.
    pub async fn outcome(self) -> AcquisitionOutcome {
        let id = self.id;
        self.outcome.await.unwrap_or_else(|_| {
            AcquisitionOutcome::new(
                id,
                AcquisitionState::Failed,
                Some("acquisition worker exited without reporting".to_string()),
                0,
            )
        })
    }
}

struct Worker {
    id: Uuid,
    token: CancelToken,
    join: JoinHandle<AcquisitionOutcome>,
}

// Field order matters: the plugin must drop before its module.
struct PluginCell {
    plugin: Mutex<Box<dyn ImagePlugin>>,
    _module: Option<ModuleRef>,
}

/// Host-side driver for one image plugin instance
pub struct ImageAcquisition {
    cell: Arc<PluginCell>,
    descriptor: CapabilityDescriptor,
    supports_interruptions: bool,
    state: Arc<watch::Sender<AcquisitionState>>,
    worker: Option<Worker>,
}

impl ImageAcquisition {
    pub fn new(plugin: Box<dyn ImagePlugin>) -> Self {
        Self::build(plugin, None)
    }

    /// Wrap a plugin created from a dynamically loaded module.
    pub fn with_module(plugin: Box<dyn ImagePlugin>, module: ModuleRef) -> Self {
        Self::build(plugin, Some(module))
    }

    fn build(plugin: Box<dyn ImagePlugin>, module: Option<ModuleRef>) -> Self {
        let descriptor = plugin.descriptor();
        let supports_interruptions = plugin.supports_interruptions();
        let (state, _) = watch::channel(AcquisitionState::Idle);
        Self {
            cell: Arc::new(PluginCell {
                plugin: Mutex::new(plugin),
                _module: module,
            }),
            descriptor,
            supports_interruptions,
            state: Arc::new(state),
            worker: None,
        }
    }

    pub fn descriptor(&self) -> &CapabilityDescriptor {
        &self.descriptor
    }

    pub fn supports_interruptions(&self) -> bool {
        self.supports_interruptions
    }

    pub fn state(&self) -> AcquisitionState {
        *self.state.borrow()
    }

    /// Watch lifecycle state changes
    pub fn subscribe(&self) -> watch::Receiver<AcquisitionState> {
        self.state.subscribe()
    }

    /// True while an acquisition is in flight.
    ///
    /// The terminal state is published before the completion callback runs,
    /// so the instance is usable as soon as the caller hears about the
    /// outcome. A worker that died without publishing does not count.
    pub fn is_running(&self) -> bool {
        self.state().is_active()
            && self
                .worker
                .as_ref()
                .map(|w| !w.join.is_finished())
                .unwrap_or(false)
    }

    fn ensure_idle(&self) -> Result<(), LifecycleError> {
        if self.is_running() {
            Err(LifecycleError::AlreadyRunning(self.state()))
        } else {
            Ok(())
        }
    }

    /// Exclusive access to the plugin for settings hooks (validate/accept).
    pub async fn plugin(&self) -> Result<MutexGuard<'_, Box<dyn ImagePlugin>>, LifecycleError> {
        self.ensure_idle()?;
        Ok(self.cell.plugin.lock().await)
    }

    /// Start producing the image described by `map`.
    #[instrument(skip_all, fields(plugin = %self.descriptor.description))]
    pub fn create(
        &mut self,
        xpacks: impl Into<PathBuf>,
        map: &ImageMapInformation,
        on_progress: Option<ProgressCallback>,
        on_completed: CompletedCallback,
    ) -> Result<AcquisitionHandle, LifecycleError> {
        self.spawn(
            AcquisitionState::Fetching,
            xpacks.into(),
            Some(map.clone()),
            on_progress,
            on_completed,
        )
    }

    /// Continue an acquisition restored by [`ImageAcquisition::load`].
    ///
    /// Returns `Ok(None)`, and invokes no callback, when the plugin does not
    /// support interruptions or has nothing left to do.
    #[instrument(skip_all, fields(plugin = %self.descriptor.description))]
    pub fn resume(
        &mut self,
        xpacks: impl Into<PathBuf>,
        on_progress: Option<ProgressCallback>,
        on_completed: CompletedCallback,
    ) -> Result<Option<AcquisitionHandle>, LifecycleError> {
        self.ensure_idle()?;
        if !self.supports_interruptions {
            debug!("Plugin does not support interruptions; nothing to resume");
            return Ok(None);
        }

        let pending = match self.cell.plugin.try_lock() {
            Ok(plugin) => plugin.has_pending_work(),
            Err(_) => return Err(LifecycleError::AlreadyRunning(self.state())),
        };
        if !pending {
            debug!("No unfinished acquisition to resume");
            return Ok(None);
        }

        self.spawn(
            AcquisitionState::Resuming,
            xpacks.into(),
            None,
            on_progress,
            on_completed,
        )
        .map(Some)
    }

    fn spawn(
        &mut self,
        running_state: AcquisitionState,
        xpacks: PathBuf,
        map: Option<ImageMapInformation>,
        on_progress: Option<ProgressCallback>,
        on_completed: CompletedCallback,
    ) -> Result<AcquisitionHandle, LifecycleError> {
        self.ensure_idle()?;
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| LifecycleError::NoRuntime)?;

        let token = CancelToken::new();
        let ctx = AcquisitionContext::new(token.clone(), on_progress);
        let id = ctx.id();
        let (outcome_tx, outcome_rx) = oneshot::channel();
        let cell = Arc::clone(&self.cell);
        let state = Arc::clone(&self.state);
        let description = self.descriptor.description.clone();

        state.send_replace(running_state);
        info!(acquisition = %id, state = %running_state, xpacks = %xpacks.display(), "Starting acquisition");

        let join = runtime.spawn_blocking(move || {
            let started = Instant::now();
            let result = {
                let mut plugin = cell.plugin.blocking_lock();
                panic::catch_unwind(AssertUnwindSafe(|| match &map {
                    Some(map) => plugin.create(&xpacks, map, &ctx),
                    None => plugin.resume(&xpacks, &ctx),
                }))
            };
            ctx.mark_finished();

            let cancelled = ctx.is_cancelled();
            let (final_state, message) = match result {
                Ok(Ok(())) if cancelled => (AcquisitionState::Cancelled, None),
                Ok(Ok(())) => (AcquisitionState::Completed, None),
                Ok(Err(failure)) if cancelled => {
                    (AcquisitionState::Cancelled, Some(failure.message().to_string()))
                }
                Ok(Err(failure)) => (AcquisitionState::Failed, Some(failure.message().to_string())),
                Err(payload) => (
                    AcquisitionState::Failed,
                    Some(format!("plugin panicked: {}", panic_message(payload.as_ref()))),
                ),
            };

            let outcome = AcquisitionOutcome::new(
                id,
                final_state,
                message,
                started.elapsed().as_millis() as u64,
            );
            match outcome.state {
                AcquisitionState::Failed => warn!(
                    acquisition = %id,
                    plugin = %description,
                    error = outcome.message.as_deref().unwrap_or(""),
                    "Acquisition failed"
                ),
                _ => info!(
                    acquisition = %id,
                    plugin = %description,
                    state = %outcome.state,
                    duration_ms = outcome.duration_ms,
                    "Acquisition finished"
                ),
            }

            state.send_replace(outcome.state);
            on_completed(&outcome);
            let _ = outcome_tx.send(outcome.clone());
            outcome
        });

        self.worker = Some(Worker {
            id,
            token: token.clone(),
            join,
        });

        Ok(AcquisitionHandle {
            id,
            token,
            outcome: outcome_rx,
        })
    }

    /// Cancel the in-flight acquisition and wait for its worker to exit.
    ///
    /// Does nothing when idle.
    #[instrument(skip_all, fields(plugin = %self.descriptor.description))]
    pub async fn stop(&mut self) -> Option<AcquisitionOutcome> {
        let worker = self.worker.take()?;
        worker.token.cancel();
        debug!(acquisition = %worker.id, "Cancellation requested, waiting for worker");
        self.join(worker).await
    }

    /// Wait for the in-flight acquisition without cancelling it.
    pub async fn wait(&mut self) -> Option<AcquisitionOutcome> {
        let worker = self.worker.take()?;
        self.join(worker).await
    }

    async fn join(&self, worker: Worker) -> Option<AcquisitionOutcome> {
        match worker.join.await {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                warn!(acquisition = %worker.id, error = %e, "Acquisition worker aborted");
                self.state.send_replace(AcquisitionState::Failed);
                None
            }
        }
    }

    /// Delegate coverage to the plugin, then make sure it covers the request.
    pub async fn set_coverage(
        &self,
        map: &mut ImageMapInformation,
        desired_width: f64,
        desired_height: f64,
    ) -> Result<(), LifecycleError> {
        let plugin = self.plugin().await?;
        plugin.set_coverage(map, desired_width, desired_height);
        drop(plugin);

        if !(map.coverage_x >= desired_width && map.coverage_z >= desired_height) {
            warn!(
                plugin = %self.descriptor.description,
                coverage_x = map.coverage_x,
                coverage_z = map.coverage_z,
                desired_width,
                desired_height,
                "Plugin under-covered the requested area; widening"
            );
            if !(map.coverage_x >= desired_width) {
                map.coverage_x = desired_width;
            }
            if !(map.coverage_z >= desired_height) {
                map.coverage_z = desired_height;
            }
        }
        Ok(())
    }

    pub async fn size_updated(&self, width: i32, height: i32) -> Result<(), LifecycleError> {
        self.plugin().await?.size_updated(width, height);
        Ok(())
    }

    pub async fn target_updated(&self, target: GameEngine) -> Result<(), LifecycleError> {
        self.plugin().await?.target_updated(target);
        Ok(())
    }

    /// Persist plugin state. Errors mean the file must not be trusted.
    #[instrument(skip(self), fields(plugin = %self.descriptor.description))]
    pub async fn save(&self, path: &Path, exiting: bool) -> Result<(), LifecycleError> {
        self.plugin().await?.save(path, exiting)?;
        Ok(())
    }

    /// Restore plugin state; a bad file leaves the plugin on its defaults.
    #[instrument(skip(self), fields(plugin = %self.descriptor.description))]
    pub async fn load(&self, path: &Path) -> Result<(), LifecycleError> {
        let mut plugin = self.plugin().await?;
        if let Err(e) = plugin.load(path) {
            warn!(path = %path.display(), error = %e, "Failed to load plugin settings; using defaults");
        }
        if !self.state().is_active() {
            self.state.send_replace(AcquisitionState::Idle);
        }
        Ok(())
    }
}

impl Drop for ImageAcquisition {
    fn drop(&mut self) {
        if let Some(worker) = &self.worker {
            if !worker.join.is_finished() {
                warn!(acquisition = %worker.id, "Dropping image acquisition with a running worker; cancelling");
                worker.token.cancel();
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
