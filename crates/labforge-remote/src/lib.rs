//! Remote execution substrate for Labforge.
//!
//! This crate implements the layer everything above it is built on: the
//! persistent SSH [`session`] with idle-timeout output capture, the command
//! result [`classify`] taxonomy, the package-manager lock [`pkg`]
//! coordinator, and the compute-unit lifecycle [`provider`] driving the
//! virtualization host's CLI. A scripted [`mock`] runner and provider back
//! the test suites of every downstream crate.

pub mod classify;
pub mod mock;
pub mod pkg;
pub mod provider;
pub mod session;

pub use classify::{classify, sanitize, CommandReport, ErrorKind};
pub use mock::{CallLog, MockConnector, MockProvider, MockRunner};
pub use pkg::{LockHolder, PkgCoordinator};
pub use provider::{HostProvider, UnitProvider, UnitState};
pub use session::{
    elevate, shell_quote, CommandRunner, Connector, ExecOutcome, SshConnector, SshSession,
};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("remote I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("ssh transport error: {0}")]
    Ssh(#[from] ssh2::Error),
    #[error("no usable private key under {0}")]
    NoPrivateKey(String),
    #[error("connection to {0} failed")]
    ConnectFailed(String),
    #[error("package operation failed ({kind}): {message}")]
    PackageFailed { kind: String, message: String },
    #[error("package locks still held after termination: {0}")]
    LocksHeld(String),
    #[error("unit {0} lifecycle operation failed: {1}")]
    Lifecycle(u32, String),
}
