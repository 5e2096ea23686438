//! The sandbox: identity, private directory and grain lifecycle

use crate::config::{ReclaimPolicy, SandboxConfig};
use crate::error::{Result, SandboxError};
use crate::sandbox::attributes::{Attribute, Attributes};
use crate::sandbox::grain::Grain;
use crate::sandbox::reclaim::{reclaim_dir_with, DirRemover, FsRemover, ReclaimOutcome};
use futures::FutureExt;
use rand::Rng;
use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

const RANDOM_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

static LAST_TICKS: AtomicU64 = AtomicU64::new(0);

/// Nanoseconds since the epoch, strictly increasing within this process
pub fn unique_ticks() -> u64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);

    let mut last = LAST_TICKS.load(Ordering::Relaxed);
    loop {
        let candidate = now.max(last + 1);
        match LAST_TICKS.compare_exchange_weak(last, candidate, Ordering::SeqCst, Ordering::Relaxed) {
            Ok(_) => return candidate,
            Err(actual) => last = actual,
        }
    }
}

/// Random `xxxxxxxx.xxx` path component
fn random_file_name() -> String {
    let mut rng = rand::thread_rng();
    let mut chunk = |len: usize| -> String {
        (0..len)
            .map(|_| RANDOM_CHARSET[rng.gen_range(0..RANDOM_CHARSET.len())] as char)
            .collect()
    };
    let stem = chunk(8);
    let ext = chunk(3);
    format!("{}.{}", stem, ext)
}

/// Sandbox identity, derived from the creation time
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SandboxId(u64);

impl SandboxId {
    /// Fresh identifier
    pub fn generate() -> Self {
        SandboxId(unique_ticks())
    }

    /// Raw tick value
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SandboxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle position of a sandbox
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SandboxState {
    /// Constructed; nothing on disk
    Created = 0,
    /// Directory exists and grains were set up
    Active = 1,
    /// Grains disposed and directory reclaimed
    Disposed = 2,
}

impl SandboxState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => SandboxState::Active,
            2 => SandboxState::Disposed,
            _ => SandboxState::Created,
        }
    }
}

/// A grain whose disposal failed
#[derive(Debug)]
pub struct GrainFailure {
    /// Attribute name of the grain
    pub name: String,
    /// What went wrong
    pub error: SandboxError,
}

/// Summary of a [`Sandbox::dispose`] call
#[derive(Debug)]
pub struct DisposeReport {
    /// Grains whose disposal failed, in disposal order
    pub failures: Vec<GrainFailure>,
    /// Fate of the sandbox directory
    pub reclaim: ReclaimOutcome,
}

impl DisposeReport {
    /// No grain failed and the directory is gone
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty() && self.reclaim.is_gone()
    }
}

/// An isolated, disposable working directory with attached grains.
///
/// ```no_run
/// # async fn demo() -> grain_sandbox::Result<()> {
/// use grain_sandbox::Sandbox;
///
/// let sandbox = Sandbox::new().with_description("orders api");
/// sandbox.activate().await?;
/// // ... use sandbox.location() ...
/// let report = sandbox.dispose().await;
/// assert!(report.reclaim.is_gone());
/// # Ok(())
/// # }
/// ```
pub struct Sandbox {
    id: SandboxId,
    description: String,
    location: PathBuf,
    attributes: Attributes,
    reclaim: ReclaimPolicy,
    remover: Arc<dyn DirRemover>,
    state: AtomicU8,
    retired: Mutex<Vec<(String, Arc<dyn Grain>)>>,
}

impl Sandbox {
    /// Create a sandbox under the system temp directory
    pub fn new() -> Self {
        Self::with_config(&SandboxConfig::default())
    }

    /// Create a sandbox from explicit settings. Does not touch the filesystem.
    pub fn with_config(config: &SandboxConfig) -> Self {
        let id = SandboxId::generate();
        let location = config
            .temp_root()
            .join(format!("{}{}", config.prefix, random_file_name()));

        debug!("Created sandbox {} at {}", id, location.display());

        Self {
            id,
            description: format!("Sandbox <{}>", id),
            location,
            attributes: Attributes::new(),
            reclaim: config.reclaim,
            remover: Arc::new(FsRemover),
            state: AtomicU8::new(SandboxState::Created as u8),
            retired: Mutex::new(Vec::new()),
        }
    }

    /// Replace the description
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Replace the description in place
    pub fn set_description(&mut self, description: impl Into<String>) -> &mut Self {
        self.description = description.into();
        self
    }

    /// Use a custom directory remover for reclamation
    pub fn with_remover(mut self, remover: impl DirRemover + 'static) -> Self {
        self.remover = Arc::new(remover);
        self
    }

    /// Identity
    pub fn id(&self) -> SandboxId {
        self.id
    }

    /// Human-readable label
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Private directory; only exists between activation and disposal
    pub fn location(&self) -> &Path {
        &self.location
    }

    /// The attribute registry
    pub fn attributes(&self) -> &Attributes {
        &self.attributes
    }

    /// Current lifecycle state
    pub fn state(&self) -> SandboxState {
        SandboxState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Attach an attribute under `name`, replacing any previous one in place.
    ///
    /// The caller picks the tag: [`Attribute::grain`] values are set up and
    /// disposed, [`Attribute::value`] values never are. A grain displaced
    /// after activation is disposed by the next [`Sandbox::dispose`].
    pub fn attach(&self, name: impl Into<String>, attribute: Attribute) -> &Self {
        let name = name.into();
        if let Some(previous) = self.attributes.insert(name.clone(), attribute) {
            self.retire(name, previous);
        }
        self
    }

    /// Attach a grain; shorthand for `attach(name, Attribute::grain(grain))`
    pub fn attach_grain<G: Grain>(&self, name: impl Into<String>, grain: G) -> &Self {
        self.attach(name, Attribute::grain(grain))
    }

    /// Builder form of [`Sandbox::attach`]
    pub fn with(self, name: impl Into<String>, attribute: Attribute) -> Self {
        self.attach(name, attribute);
        self
    }

    /// Builder form of [`Sandbox::attach_grain`]
    pub fn with_grain<G: Grain>(self, name: impl Into<String>, grain: G) -> Self {
        self.attach_grain(name, grain);
        self
    }

    /// Remove an attribute and hand it back.
    ///
    /// A detached grain is no longer owned by the sandbox: if it was already
    /// set up, the caller must dispose it.
    pub fn detach(&self, name: &str) -> Option<Attribute> {
        self.attributes.remove(name)
    }

    fn retire(&self, name: String, previous: Attribute) {
        let Some(grain) = previous.as_grain() else {
            return;
        };
        if self.state() != SandboxState::Active {
            return;
        }

        debug!("Grain '{}' replaced after activation, disposing on teardown", name);
        self.retired
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((name, grain));
    }

    /// Typed access to any attribute
    pub fn attribute<T: Any + Send + Sync>(&self, name: &str) -> Option<Arc<T>> {
        self.attributes.get_as::<T>(name)
    }

    /// Typed access to an attached grain
    pub fn grain<G: Grain>(&self, name: &str) -> Option<Arc<G>> {
        self.attributes
            .get(name)
            .filter(Attribute::is_grain)
            .and_then(|attribute| attribute.downcast::<G>())
    }

    /// Every attached grain, in attachment order, computed on each call
    pub fn grains(&self) -> Vec<Arc<dyn Grain>> {
        self.attributes
            .grains()
            .into_iter()
            .map(|(_, grain)| grain)
            .collect()
    }

    /// Create the directory and set up every attached grain in order.
    ///
    /// A failing grain is reported as [`SandboxError::Grain`]; grains set up
    /// before it stay set up.
    pub async fn activate(&self) -> Result<&Self> {
        info!(
            "Activating sandbox {} ({}) at {}",
            self.id,
            self.description,
            self.location.display()
        );

        tokio::fs::create_dir_all(&self.location).await?;
        self.state.store(SandboxState::Active as u8, Ordering::SeqCst);

        for (name, grain) in self.attributes.grains() {
            debug!("Setting up grain '{}'", name);
            grain
                .setup(self)
                .await
                .map_err(|e| SandboxError::grain(name, e))?;
        }

        Ok(self)
    }

    /// Dispose every grain in attachment order, then reclaim the directory.
    ///
    /// Never fails: grain errors and panics are collected in the report and
    /// do not stop the remaining grains or the reclamation.
    pub async fn dispose(&self) -> DisposeReport {
        info!("Disposing sandbox {}", self.id);

        let retired: Vec<_> = self
            .retired
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();

        let mut failures = Vec::new();
        for (name, grain) in self.attributes.grains().into_iter().chain(retired) {
            debug!("Disposing grain '{}'", name);

            let error = match AssertUnwindSafe(grain.dispose()).catch_unwind().await {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => e,
                Err(panic) => SandboxError::Other(format!(
                    "dispose panicked: {}",
                    panic_message(panic.as_ref())
                )),
            };

            warn!("Grain '{}' failed to dispose: {}", name, error);
            failures.push(GrainFailure { name, error });
        }

        let reclaim = self.reclaim_in_background().await;
        self.state.store(SandboxState::Disposed as u8, Ordering::SeqCst);

        DisposeReport { failures, reclaim }
    }

    /// Run reclamation on the blocking pool so retries and pauses never stall
    /// the runtime's worker
    async fn reclaim_in_background(&self) -> ReclaimOutcome {
        let location = self.location.clone();
        let policy = self.reclaim;
        let remover = Arc::clone(&self.remover);

        tokio::task::spawn_blocking(move || reclaim_dir_with(&location, &policy, remover.as_ref()))
            .await
            .unwrap_or_else(|e| {
                warn!("Reclaiming {} did not finish: {}", self.location.display(), e);
                ReclaimOutcome::Abandoned {
                    attempts: 0,
                    kind: std::io::ErrorKind::Other,
                }
            })
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

impl Default for Sandbox {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Sandbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sandbox")
            .field("id", &self.id)
            .field("description", &self.description)
            .field("location", &self.location)
            .field("attributes", &self.attributes)
            .field("state", &self.state())
            .finish()
    }
}

impl Drop for Sandbox {
    fn drop(&mut self) {
        if self.state() == SandboxState::Active {
            warn!(
                "Sandbox {} dropped without dispose; grains were not disposed",
                self.id
            );
            reclaim_dir_with(&self.location, &self.reclaim, self.remover.as_ref());
        }
    }
}
