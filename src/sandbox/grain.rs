//! The grain capability

use crate::error::Result;
use crate::sandbox::instance::Sandbox;
use async_trait::async_trait;
use std::any::Any;

/// A pluggable unit of setup and teardown attached to a [`Sandbox`].
///
/// Grains are shared through the sandbox's attribute registry as `Arc`s, so
/// any state produced by `setup` lives behind interior mutability.
///
/// `dispose` must be a no-op when `setup` never ran and must tolerate being
/// called more than once.
#[async_trait]
pub trait Grain: Any + Send + Sync {
    /// Provision whatever this grain represents inside `sandbox`
    async fn setup(&self, sandbox: &Sandbox) -> Result<()>;

    /// Release what `setup` provisioned
    async fn dispose(&self) -> Result<()>;
}
