//! Grain Sandbox
//!
//! Disposable on-disk sandboxes for integration tests. A [`Sandbox`] owns a
//! private temporary directory and an ordered set of named attributes; the
//! attributes that are [`Grain`]s are set up on activation and torn down on
//! disposal, in the order they were attached.
//!
//! ```no_run
//! use grain_sandbox::grains::{UseDatabase, UseWebServer, WebServerGrain, WEB_SERVER};
//! use grain_sandbox::Sandbox;
//!
//! # async fn demo() -> grain_sandbox::Result<()> {
//! let sandbox = Sandbox::new()
//!     .with_description("storefront")
//!     .use_web_server("./site")
//!     .use_database();
//!
//! sandbox.activate().await?;
//! let web = sandbox.grain::<WebServerGrain>(WEB_SERVER).unwrap();
//! println!("serving at {:?}", web.endpoints());
//!
//! sandbox.dispose().await;
//! # Ok(())
//! # }
//! ```

#![deny(rust_2018_idioms)]
#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod grains;
pub mod sandbox;
pub mod utils;

pub use config::{DatabaseConfig, FixtureConfig, ReclaimPolicy, SandboxConfig, WebServerConfig};
pub use error::{Result, SandboxError};
pub use sandbox::{DisposeReport, Grain, ReclaimOutcome, Sandbox, SandboxId, SandboxState};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
