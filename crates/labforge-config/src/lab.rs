use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    ParseToml(#[from] Box<toml::de::Error>),
    #[error("duplicate unit id {0}")]
    DuplicateUnitId(u32),
    #[error("duplicate unit name '{0}'")]
    DuplicateUnitName(String),
    #[error("cache unit '{0}' not found among [[units]]")]
    CacheUnitNotFound(String),
    #[error("cluster references unknown unit id {0}")]
    UnknownClusterUnit(u32),
    #[error("storage references unknown unit id {0}")]
    UnknownStorageUnit(u32),
    #[error("service probe '{name}' references unknown unit '{unit}'")]
    UnknownProbeUnit { name: String, unit: String },
    #[error("backup references unknown unit id {0}")]
    UnknownBackupUnit(u32),
    #[error("unit '{0}' has zero-valued resources")]
    InvalidResources(String),
}

/// Virtualization host connection and placement settings.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct HostSection {
    /// Host address, `user@host` or bare hostname.
    pub address: String,
    #[serde(default = "default_storage_pool")]
    pub storage_pool: String,
    #[serde(default = "default_bridge")]
    pub bridge: String,
    pub gateway: String,
    #[serde(default = "default_template_dir")]
    pub template_dir: String,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ResourceSpec {
    #[serde(default = "default_memory_mb")]
    pub memory_mb: u32,
    #[serde(default = "default_swap_mb")]
    pub swap_mb: u32,
    #[serde(default = "default_cores")]
    pub cores: u32,
    #[serde(default = "default_disk_gb")]
    pub disk_gb: u32,
}

impl Default for ResourceSpec {
    fn default() -> Self {
        Self {
            memory_mb: default_memory_mb(),
            swap_mb: default_swap_mb(),
            cores: default_cores(),
            disk_gb: default_disk_gb(),
        }
    }
}

/// One compute unit the pipeline creates and configures.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct UnitConfig {
    pub id: u32,
    pub name: String,
    pub hostname: String,
    pub address: String,
    #[serde(default)]
    pub template: Option<String>,
    #[serde(default)]
    pub resources: ResourceSpec,
    #[serde(default)]
    pub privileged: bool,
    #[serde(default = "default_true")]
    pub nested: bool,
    #[serde(default = "default_true")]
    pub autostart: bool,
    #[serde(default)]
    pub actions: Vec<String>,
    /// Free-form per-unit parameters consumed by individual actions.
    #[serde(default)]
    pub params: toml::Table,
}

/// A template unit: provisioned and configured like a regular unit, then
/// destroyed once its actions (typically ending in an archive step) have
/// run.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct TemplateConfig {
    pub id: u32,
    pub name: String,
    pub hostname: String,
    pub address: String,
    #[serde(default)]
    pub template: Option<String>,
    #[serde(default)]
    pub resources: ResourceSpec,
    #[serde(default)]
    pub privileged: bool,
    #[serde(default = "default_true")]
    pub nested: bool,
    #[serde(default)]
    pub actions: Vec<String>,
}

impl TemplateConfig {
    /// View a template as a plain unit for provisioning purposes.
    pub fn as_unit(&self) -> UnitConfig {
        UnitConfig {
            id: self.id,
            name: self.name.clone(),
            hostname: self.hostname.clone(),
            address: self.address.clone(),
            template: self.template.clone(),
            resources: self.resources,
            privileged: self.privileged,
            nested: self.nested,
            autostart: false,
            actions: self.actions.clone(),
            params: toml::Table::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ClusterSection {
    pub control: Vec<u32>,
    #[serde(default)]
    pub workers: Vec<u32>,
    /// Script run elevated on the control node to bring the cluster up.
    #[serde(default)]
    pub bootstrap_script: Option<String>,
    /// Script run elevated on each worker to join it to the cluster.
    #[serde(default)]
    pub join_script: Option<String>,
    /// Command that exits zero once the cluster answers.
    #[serde(default)]
    pub ready_command: Option<String>,
    /// Post-step action names run against the control node after bootstrap.
    #[serde(default)]
    pub post_steps: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct StorageSection {
    pub volume_name: String,
    pub brick_path: String,
    pub mount_point: String,
    #[serde(default = "default_replica_count")]
    pub replica_count: u32,
    pub members: Vec<u32>,
    #[serde(default)]
    pub bootstrap_script: Option<String>,
    #[serde(default)]
    pub ready_command: Option<String>,
}

/// One `(name, unit, port)` reachability probe for post-run verification.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ServiceProbe {
    pub name: String,
    pub unit: String,
    pub port: u16,
    #[serde(default)]
    pub udp: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct UserSection {
    pub name: String,
    #[serde(default = "default_sudo_group")]
    pub sudo_group: String,
    #[serde(default)]
    pub password: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct BackupItem {
    pub name: String,
    pub unit_id: u32,
    pub path: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct BackupSection {
    pub unit_id: u32,
    pub backup_dir: String,
    #[serde(default = "default_backup_prefix")]
    pub name_prefix: String,
    #[serde(default)]
    pub items: Vec<BackupItem>,
}

/// Remote session tunables.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct SessionSection {
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Idle timeout: seconds with zero new output before a command is
    /// declared dead.
    #[serde(default = "default_exec_timeout")]
    pub exec_timeout_secs: u64,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_read_buffer")]
    pub read_buffer: usize,
    #[serde(default = "default_username")]
    pub username: String,
    /// Echo captured output live to the terminal.
    #[serde(default)]
    pub verbose: bool,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout(),
            exec_timeout_secs: default_exec_timeout(),
            poll_interval_ms: default_poll_interval(),
            read_buffer: default_read_buffer(),
            username: default_username(),
            verbose: false,
        }
    }
}

/// Bounded-wait tunables. Every polling loop in the system derives its
/// iteration cap and sleep interval from here; nothing waits unbounded.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct WaitSection {
    #[serde(default = "default_unit_ready_attempts")]
    pub unit_ready_attempts: u32,
    #[serde(default = "default_unit_ready_interval")]
    pub unit_ready_interval_secs: u64,
    #[serde(default = "default_lock_wait")]
    pub lock_wait_secs: u64,
    #[serde(default = "default_lock_poll")]
    pub lock_poll_secs: u64,
    #[serde(default = "default_pkg_attempts")]
    pub pkg_attempts: u32,
    #[serde(default = "default_pkg_retry_delay")]
    pub pkg_retry_delay_secs: u64,
    #[serde(default = "default_service_ready_attempts")]
    pub service_ready_attempts: u32,
    #[serde(default = "default_service_ready_interval")]
    pub service_ready_interval_secs: u64,
}

impl Default for WaitSection {
    fn default() -> Self {
        Self {
            unit_ready_attempts: default_unit_ready_attempts(),
            unit_ready_interval_secs: default_unit_ready_interval(),
            lock_wait_secs: default_lock_wait(),
            lock_poll_secs: default_lock_poll(),
            pkg_attempts: default_pkg_attempts(),
            pkg_retry_delay_secs: default_pkg_retry_delay(),
            service_ready_attempts: default_service_ready_attempts(),
            service_ready_interval_secs: default_service_ready_interval(),
        }
    }
}

/// A one-shot correction applied to the package source list.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct SourceFix {
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct PackageSection {
    #[serde(default = "default_lock_files")]
    pub lock_files: Vec<String>,
    #[serde(default = "default_cleanup_processes")]
    pub cleanup_processes: Vec<String>,
    #[serde(default = "default_cleanup_patterns")]
    pub cleanup_patterns: Vec<String>,
    /// Distribution codenames known to be renamed or retired.
    #[serde(default)]
    pub codename_fixes: Vec<SourceFix>,
    /// Archive hosts known to be dead or relocated.
    #[serde(default)]
    pub host_fixes: Vec<SourceFix>,
    #[serde(default = "default_base_tools")]
    pub base_tools: Vec<String>,
    #[serde(default = "default_proxy_port")]
    pub proxy_port: u16,
}

impl Default for PackageSection {
    fn default() -> Self {
        Self {
            lock_files: default_lock_files(),
            cleanup_processes: default_cleanup_processes(),
            cleanup_patterns: default_cleanup_patterns(),
            codename_fixes: Vec::new(),
            host_fixes: Vec::new(),
            base_tools: default_base_tools(),
            proxy_port: default_proxy_port(),
        }
    }
}

/// The whole lab topology. Parsed once, validated once, then immutable.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct LabConfig {
    pub host: HostSection,
    /// Name of the shared package-cache unit; always provisioned first.
    pub cache_unit: String,
    #[serde(default)]
    pub units: Vec<UnitConfig>,
    #[serde(default)]
    pub templates: Vec<TemplateConfig>,
    #[serde(default)]
    pub cluster: Option<ClusterSection>,
    #[serde(default)]
    pub storage: Option<StorageSection>,
    #[serde(default)]
    pub services: Vec<ServiceProbe>,
    #[serde(default)]
    pub users: Vec<UserSection>,
    #[serde(default)]
    pub backup: Option<BackupSection>,
    #[serde(default)]
    pub session: SessionSection,
    #[serde(default)]
    pub waits: WaitSection,
    #[serde(default)]
    pub packages: PackageSection,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
}

impl LabConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut ids = BTreeSet::new();
        let mut names = BTreeSet::new();
        // Templates share the id/name space with units.
        let entries = self
            .units
            .iter()
            .map(|u| (u.id, &u.name, u.resources))
            .chain(self.templates.iter().map(|t| (t.id, &t.name, t.resources)));
        for (id, name, resources) in entries {
            if !ids.insert(id) {
                return Err(ConfigError::DuplicateUnitId(id));
            }
            if !names.insert(name.clone()) {
                return Err(ConfigError::DuplicateUnitName(name.clone()));
            }
            if resources.memory_mb == 0 || resources.cores == 0 || resources.disk_gb == 0 {
                return Err(ConfigError::InvalidResources(name.clone()));
            }
        }

        if self.unit_by_name(&self.cache_unit).is_none() {
            return Err(ConfigError::CacheUnitNotFound(self.cache_unit.clone()));
        }

        if let Some(cluster) = &self.cluster {
            for id in cluster.control.iter().chain(cluster.workers.iter()) {
                if self.unit_by_id(*id).is_none() {
                    return Err(ConfigError::UnknownClusterUnit(*id));
                }
            }
        }
        if let Some(storage) = &self.storage {
            for id in &storage.members {
                if self.unit_by_id(*id).is_none() {
                    return Err(ConfigError::UnknownStorageUnit(*id));
                }
            }
        }
        for probe in &self.services {
            if self.unit_by_name(&probe.unit).is_none() {
                return Err(ConfigError::UnknownProbeUnit {
                    name: probe.name.clone(),
                    unit: probe.unit.clone(),
                });
            }
        }
        if let Some(backup) = &self.backup {
            if self.unit_by_id(backup.unit_id).is_none() {
                return Err(ConfigError::UnknownBackupUnit(backup.unit_id));
            }
            for item in &backup.items {
                if self.unit_by_id(item.unit_id).is_none() {
                    return Err(ConfigError::UnknownBackupUnit(item.unit_id));
                }
            }
        }
        Ok(())
    }

    pub fn unit_by_id(&self, id: u32) -> Option<&UnitConfig> {
        self.units.iter().find(|u| u.id == id)
    }

    pub fn unit_by_name(&self, name: &str) -> Option<&UnitConfig> {
        self.units.iter().find(|u| u.name == name)
    }

    /// Ids of every cluster member, control nodes first.
    pub fn cluster_member_ids(&self) -> Vec<u32> {
        let Some(cluster) = &self.cluster else {
            return Vec::new();
        };
        let mut ids = cluster.control.clone();
        for id in &cluster.workers {
            if !ids.contains(id) {
                ids.push(*id);
            }
        }
        ids
    }

    /// Units that are neither the cache unit nor cluster members, in
    /// configuration order.
    pub fn regular_units(&self) -> Vec<&UnitConfig> {
        let cluster_ids = self.cluster_member_ids();
        self.units
            .iter()
            .filter(|u| u.name != self.cache_unit && !cluster_ids.contains(&u.id))
            .collect()
    }

    pub fn control_unit(&self) -> Option<&UnitConfig> {
        let cluster = self.cluster.as_ref()?;
        cluster.control.first().and_then(|id| self.unit_by_id(*id))
    }

    /// First configured user, falling back to root. The provisioning flow
    /// connects to fresh units as this user.
    pub fn default_user(&self) -> &str {
        self.users.first().map_or("root", |u| u.name.as_str())
    }
}

pub fn parse_config_str(input: &str) -> Result<LabConfig, ConfigError> {
    let cfg: LabConfig = toml::from_str(input).map_err(Box::new)?;
    cfg.validate()?;
    Ok(cfg)
}

pub fn parse_config_file(path: impl AsRef<Path>) -> Result<LabConfig, ConfigError> {
    let content = fs::read_to_string(path)?;
    parse_config_str(&content)
}

fn default_true() -> bool {
    true
}
fn default_storage_pool() -> String {
    "local-lvm".to_owned()
}
fn default_bridge() -> String {
    "vmbr0".to_owned()
}
fn default_template_dir() -> String {
    "/var/lib/vz/template/cache".to_owned()
}
fn default_memory_mb() -> u32 {
    2048
}
fn default_swap_mb() -> u32 {
    2048
}
fn default_cores() -> u32 {
    4
}
fn default_disk_gb() -> u32 {
    20
}
fn default_replica_count() -> u32 {
    3
}
fn default_sudo_group() -> String {
    "sudo".to_owned()
}
fn default_backup_prefix() -> String {
    "lab-backup".to_owned()
}
fn default_connect_timeout() -> u64 {
    10
}
fn default_exec_timeout() -> u64 {
    300
}
fn default_poll_interval() -> u64 {
    100
}
fn default_read_buffer() -> usize {
    4096
}
fn default_username() -> String {
    "root".to_owned()
}
fn default_unit_ready_attempts() -> u32 {
    200
}
fn default_unit_ready_interval() -> u64 {
    3
}
fn default_lock_wait() -> u64 {
    600
}
fn default_lock_poll() -> u64 {
    5
}
fn default_pkg_attempts() -> u32 {
    6
}
fn default_pkg_retry_delay() -> u64 {
    10
}
fn default_service_ready_attempts() -> u32 {
    30
}
fn default_service_ready_interval() -> u64 {
    2
}
fn default_lock_files() -> Vec<String> {
    vec![
        "/var/lib/dpkg/lock-frontend".to_owned(),
        "/var/lib/dpkg/lock".to_owned(),
        "/var/lib/apt/lists/lock".to_owned(),
    ]
}
fn default_cleanup_processes() -> Vec<String> {
    ["apt", "apt-get", "apt-cache", "dpkg", "unattended-upgrade"]
        .map(str::to_owned)
        .to_vec()
}
fn default_cleanup_patterns() -> Vec<String> {
    ["unattended-upgrade", "apt.systemd.daily"]
        .map(str::to_owned)
        .to_vec()
}
fn default_base_tools() -> Vec<String> {
    ["curl", "wget", "gnupg", "ca-certificates", "net-tools"]
        .map(str::to_owned)
        .to_vec()
}
fn default_proxy_port() -> u16 {
    3142
}
fn default_log_dir() -> String {
    "logs".to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_config() -> String {
        r#"
            cache_unit = "cache"

            [host]
            address = "root@virt.lab"
            gateway = "10.0.0.1"

            [[units]]
            id = 200
            name = "cache"
            hostname = "cache"
            address = "10.0.0.200"
            actions = ["system upgrade"]
        "#
        .to_owned()
    }

    #[test]
    fn parse_minimal() {
        let cfg = parse_config_str(&minimal_config()).unwrap();
        assert_eq!(cfg.cache_unit, "cache");
        assert_eq!(cfg.units.len(), 1);
        assert_eq!(cfg.units[0].resources.memory_mb, 2048);
        assert!(cfg.units[0].nested);
        assert!(!cfg.units[0].privileged);
    }

    #[test]
    fn missing_cache_unit_rejected() {
        let toml = minimal_config().replace("cache_unit = \"cache\"", "cache_unit = \"nope\"");
        let err = parse_config_str(&toml).unwrap_err();
        assert!(matches!(err, ConfigError::CacheUnitNotFound(_)));
    }

    #[test]
    fn duplicate_ids_rejected() {
        let toml = format!(
            "{}\n[[units]]\nid = 200\nname = \"dup\"\nhostname = \"dup\"\naddress = \"10.0.0.201\"\n",
            minimal_config()
        );
        let err = parse_config_str(&toml).unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateUnitId(200)));
    }

    #[test]
    fn template_shares_id_space_with_units() {
        let toml = format!(
            "{}\n[[templates]]\nid = 200\nname = \"tpl\"\nhostname = \"tpl\"\naddress = \"10.0.0.210\"\n",
            minimal_config()
        );
        let err = parse_config_str(&toml).unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateUnitId(200)));
    }

    #[test]
    fn cluster_membership_resolved() {
        let toml = format!(
            "{}\n\
             [[units]]\nid = 301\nname = \"ctl\"\nhostname = \"ctl\"\naddress = \"10.0.0.31\"\n\
             [[units]]\nid = 302\nname = \"wrk\"\nhostname = \"wrk\"\naddress = \"10.0.0.32\"\n\
             [cluster]\ncontrol = [301]\nworkers = [302]\n",
            minimal_config()
        );
        let cfg = parse_config_str(&toml).unwrap();
        assert_eq!(cfg.cluster_member_ids(), vec![301, 302]);
        assert_eq!(cfg.control_unit().unwrap().name, "ctl");
        // Cluster members are excluded from the regular list, as is the cache unit.
        assert!(cfg.regular_units().is_empty());
    }

    #[test]
    fn unknown_cluster_member_rejected() {
        let toml = format!("{}\n[cluster]\ncontrol = [999]\n", minimal_config());
        let err = parse_config_str(&toml).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownClusterUnit(999)));
    }

    #[test]
    fn probe_must_name_known_unit() {
        let toml = format!(
            "{}\n[[services]]\nname = \"db\"\nunit = \"ghost\"\nport = 5432\n",
            minimal_config()
        );
        let err = parse_config_str(&toml).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownProbeUnit { .. }));
    }

    #[test]
    fn unknown_field_rejected() {
        let toml = format!("{}\nbogus = 1\n", minimal_config());
        assert!(parse_config_str(&toml).is_err());
    }

    #[test]
    fn default_user_falls_back_to_root() {
        let cfg = parse_config_str(&minimal_config()).unwrap();
        assert_eq!(cfg.default_user(), "root");

        let toml = format!("{}\n[[users]]\nname = \"ops\"\n", minimal_config());
        let cfg = parse_config_str(&toml).unwrap();
        assert_eq!(cfg.default_user(), "ops");
        assert_eq!(cfg.users[0].sudo_group, "sudo");
    }

    #[test]
    fn parse_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lab.toml");
        fs::write(&path, minimal_config()).unwrap();
        let cfg = parse_config_file(&path).unwrap();
        assert_eq!(cfg.host.address, "root@virt.lab");
        assert_eq!(cfg.host.bridge, "vmbr0");
    }
}
