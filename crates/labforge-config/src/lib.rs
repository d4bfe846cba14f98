//! Lab topology configuration for Labforge.
//!
//! This crate defines the configuration layer: TOML parsing into an immutable
//! [`LabConfig`] (compute units, template units, cluster and storage
//! membership, service probe table, users, backup layout) plus the tunable
//! sections the execution layer consumes (session, wait, and package
//! settings). Everything downstream receives the parsed value by reference;
//! nothing here mutates after [`LabConfig::validate`] has passed.

pub mod lab;

pub use lab::{
    parse_config_file, parse_config_str, BackupItem, BackupSection, ClusterSection, ConfigError,
    HostSection, LabConfig, PackageSection, ResourceSpec, ServiceProbe, SessionSection,
    SourceFix, StorageSection, TemplateConfig, UnitConfig, UserSection, WaitSection,
};
