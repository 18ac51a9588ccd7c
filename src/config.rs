//! Declarative hardware/target catalog.
//!
//! A single YAML document describes the toolchain containers, the attached
//! probes, the MCU targets, shared command fallbacks, and port bases. The
//! model is validated once at load and immutable afterwards; dispatch-time
//! lookups (`resolve_command`, `resolve_transport`, `container_for`) are
//! pure functions over it.

use crate::ports::PortBases;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;
use tracing::warn;

/// Default staging directory, bind-mounted into every toolchain container
/// at the same path.
pub const DEFAULT_STAGING_DIR: &str = "/tmp/flash_staging";
/// Default directory for per-probe advisory lock files.
pub const DEFAULT_LOCK_DIR: &str = "/var/lock";

/// Operation mode of a dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Flash,
    Debug,
    Print,
}

impl Mode {
    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Flash => "flash",
            Mode::Debug => "debug",
            Mode::Print => "print",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "flash" => Ok(Mode::Flash),
            "debug" => Ok(Mode::Debug),
            "print" => Ok(Mode::Print),
            other => Err(format!(
                "invalid mode '{other}', must be 'flash', 'debug' or 'print'"
            )),
        }
    }
}

/// Configuration load/validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    #[error("duplicate probe id {0}")]
    DuplicateProbeId(u32),

    #[error("probe {probe_id}: malformed USB {field} '{value}' (expected 1-4 hex digits)")]
    BadUsbId {
        probe_id: u32,
        field: &'static str,
        value: String,
    },

    #[error("target '{target}' references undefined container '{container}'")]
    UnknownContainer { target: String, container: String },

    #[error("target '{target}' has no container selection for interface '{interface}'")]
    MissingContainer { target: String, interface: String },

    #[error(
        "target '{target}' lists interface '{interface}' for mode '{mode}' \
         but no command is defined (neither target-local nor interface_defaults)"
    )]
    MissingCommand {
        target: String,
        interface: String,
        mode: Mode,
    },

    #[error(
        "target '{target}', interface '{interface}': default transport \
         '{transport}' is not in the allowed list"
    )]
    DefaultTransportNotAllowed {
        target: String,
        interface: String,
        transport: String,
    },
}

/// Transport resolution failures, surfaced to clients as `InvalidTransport`.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error(
        "transport '{requested}' was requested for target={target}, \
         interface={interface}, but no transport policy is configured"
    )]
    NoPolicy {
        target: String,
        interface: String,
        requested: String,
    },

    #[error(
        "transport '{requested}' is not allowed for target={target}, \
         interface={interface}. Allowed: {allowed:?}"
    )]
    NotAllowed {
        target: String,
        interface: String,
        requested: String,
        allowed: Vec<String>,
    },

    #[error(
        "transport '{transport}' is invalid for target={target}: WCH-Link \
         probe {probe_id} is in RISC-V mode (USB PID 8010), so transport is \
         fixed to 'sdi'. To use SWD/JTAG, switch the probe to ARM mode \
         (USB PID 8012)"
    )]
    WchRiscvRequiresSdi {
        target: String,
        probe_id: u32,
        transport: String,
    },

    #[error(
        "transport 'sdi' is invalid for target={target}: WCH-Link probe \
         {probe_id} is in ARM mode (USB PID 8012), choose 'swd' or 'jtag'"
    )]
    WchArmRejectsSdi { target: String, probe_id: u32 },
}

/// Server-level settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_staging_dir")]
    pub staging_dir: PathBuf,
    #[serde(default = "default_lock_dir")]
    pub lock_dir: PathBuf,
    #[serde(default = "default_compose_file")]
    pub compose_file: PathBuf,
    #[serde(default = "default_max_upload_mb")]
    pub max_upload_mb: u64,
    #[serde(default = "default_allowed_extensions")]
    pub allowed_extensions: Vec<String>,
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_staging_dir() -> PathBuf {
    PathBuf::from(DEFAULT_STAGING_DIR)
}

fn default_lock_dir() -> PathBuf {
    PathBuf::from(DEFAULT_LOCK_DIR)
}

fn default_compose_file() -> PathBuf {
    PathBuf::from("docker-compose.probes.yml")
}

fn default_max_upload_mb() -> u64 {
    64
}

fn default_allowed_extensions() -> Vec<String> {
    ["hex", "bin", "elf", "uf2"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            staging_dir: default_staging_dir(),
            lock_dir: default_lock_dir(),
            compose_file: default_compose_file(),
            max_upload_mb: default_max_upload_mb(),
            allowed_extensions: default_allowed_extensions(),
        }
    }
}

/// A toolchain container image. One image serves many probes; one live
/// container (`<name>-p<probe_id>`) serves exactly one probe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerConfig {
    /// Base container name; the per-probe instance is `<name>-p<id>`.
    pub name: String,
    pub image_name: String,
    #[serde(default)]
    pub build_context: String,
}

/// A physical debug adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeConfig {
    /// Unique id, used for lock and port keying only.
    pub id: u32,
    pub name: String,
    /// Hardware protocol class (`jlink`, `cmsis-dap`, `wch-link`, ...).
    pub interface: String,
    /// USB vendor id, hex (with or without `0x`).
    pub vendor_id: String,
    /// USB product id, hex (with or without `0x`).
    pub product_id: String,
    #[serde(default)]
    pub serial: String,
    /// Device-node override for UART-style probes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_path: Option<String>,
}

/// Hardware mode of a WCH-Link probe, inferred from its USB product id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WchLinkMode {
    RiscV,
    Arm,
}

impl ProbeConfig {
    /// Infer WCH-Link firmware mode from the USB product id.
    ///
    /// `8010` is RISC-V mode (SDI only), `8012` is ARM mode (SWD/JTAG).
    pub fn wch_link_mode(&self) -> Option<WchLinkMode> {
        if self.interface != "wch-link" {
            return None;
        }
        match normalize_usb_id(&self.product_id).as_str() {
            "8010" => Some(WchLinkMode::RiscV),
            "8012" => Some(WchLinkMode::Arm),
            _ => None,
        }
    }
}

/// Per-mode command templates for one interface.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModeCommands {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub print: Option<String>,
}

impl ModeCommands {
    pub fn get(&self, mode: Mode) -> Option<&str> {
        match mode {
            Mode::Debug => self.debug.as_deref(),
            Mode::Flash => self.flash.as_deref(),
            Mode::Print => self.print.as_deref(),
        }
    }
}

/// Compatible interfaces, either one flat list for all modes or per-mode
/// lists.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CompatibleProbes {
    Flat(Vec<String>),
    PerMode(ModeInterfaces),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModeInterfaces {
    #[serde(default)]
    pub debug: Vec<String>,
    #[serde(default)]
    pub flash: Vec<String>,
    #[serde(default)]
    pub print: Vec<String>,
}

impl CompatibleProbes {
    /// Interfaces compatible with the given mode.
    pub fn for_mode(&self, mode: Mode) -> &[String] {
        match self {
            CompatibleProbes::Flat(list) => list,
            CompatibleProbes::PerMode(m) => match mode {
                Mode::Debug => &m.debug,
                Mode::Flash => &m.flash,
                Mode::Print => &m.print,
            },
        }
    }

    /// Union of interfaces over all modes, deduplicated, order preserved.
    pub fn all_interfaces(&self) -> Vec<&str> {
        let mut out: Vec<&str> = Vec::new();
        for mode in [Mode::Debug, Mode::Flash, Mode::Print] {
            for iface in self.for_mode(mode) {
                if !out.contains(&iface.as_str()) {
                    out.push(iface.as_str());
                }
            }
            if matches!(self, CompatibleProbes::Flat(_)) {
                break;
            }
        }
        out
    }
}

/// Transport policy as written in config: either a bare transport name or a
/// full `{default, allowed}` map.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum TransportSpec {
    Single(String),
    Policy {
        #[serde(default)]
        default: Option<String>,
        #[serde(default)]
        allowed: Vec<String>,
    },
}

/// Normalized transport policy.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TransportPolicy {
    pub default: Option<String>,
    pub allowed: Vec<String>,
}

impl TransportSpec {
    /// Normalize: lowercase/trim everything, fold the default into `allowed`.
    fn normalize(&self) -> TransportPolicy {
        match self {
            TransportSpec::Single(s) => {
                let t = s.trim().to_lowercase();
                if t.is_empty() {
                    TransportPolicy::default()
                } else {
                    TransportPolicy {
                        default: Some(t.clone()),
                        allowed: vec![t],
                    }
                }
            }
            TransportSpec::Policy { default, allowed } => {
                let default = default
                    .as_deref()
                    .map(|s| s.trim().to_lowercase())
                    .filter(|s| !s.is_empty());
                let mut allowed: Vec<String> = allowed
                    .iter()
                    .map(|s| s.trim().to_lowercase())
                    .filter(|s| !s.is_empty())
                    .collect();
                // A lone default is shorthand for an allowed list of one;
                // a written list that omits the default is a config error
                // caught at load.
                if allowed.is_empty() {
                    if let Some(d) = &default {
                        allowed.push(d.clone());
                    }
                }
                TransportPolicy { default, allowed }
            }
        }
    }
}

/// Container selection for a target: one container for every interface or a
/// per-interface map.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ContainerSelect {
    Single(String),
    PerInterface(BTreeMap<String, String>),
}

impl ContainerSelect {
    pub fn for_interface(&self, interface: &str) -> Option<&str> {
        match self {
            ContainerSelect::Single(key) => Some(key),
            ContainerSelect::PerInterface(map) => map.get(interface).map(String::as_str),
        }
    }

    fn referenced_keys(&self) -> Vec<&str> {
        match self {
            ContainerSelect::Single(key) => vec![key],
            ContainerSelect::PerInterface(map) => map.values().map(String::as_str).collect(),
        }
    }
}

/// A named MCU target family.
#[derive(Debug, Clone, Deserialize)]
pub struct TargetConfig {
    #[serde(default)]
    pub description: String,
    pub container: ContainerSelect,
    pub compatible_probes: CompatibleProbes,
    #[serde(default)]
    pub transports: BTreeMap<String, TransportSpec>,
    /// Target-local command templates, keyed by interface.
    #[serde(default)]
    pub commands: BTreeMap<String, ModeCommands>,
    /// Baud rate substituted for `{uart_baud}` in print templates.
    #[serde(default)]
    pub uart_baud: Option<u32>,
}

/// The loaded, validated catalog.
#[derive(Debug, Deserialize)]
pub struct HubConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub ports: PortBases,
    #[serde(default)]
    pub containers: BTreeMap<String, ContainerConfig>,
    #[serde(default)]
    pub probes: Vec<ProbeConfig>,
    #[serde(default)]
    pub targets: BTreeMap<String, TargetConfig>,
    /// Shared command fallbacks: interface -> mode -> template.
    #[serde(default)]
    pub interface_defaults: BTreeMap<String, ModeCommands>,
}

impl HubConfig {
    /// Load and validate a catalog from a YAML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: HubConfig =
            serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the catalog. Called once at load; the model never changes
    /// afterwards.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen_ids = std::collections::BTreeSet::new();
        for probe in &self.probes {
            if !seen_ids.insert(probe.id) {
                return Err(ConfigError::DuplicateProbeId(probe.id));
            }
            for (field, value) in [
                ("vendor_id", &probe.vendor_id),
                ("product_id", &probe.product_id),
            ] {
                let normalized = normalize_usb_id(value);
                if normalized.is_empty()
                    || normalized.len() > 4
                    || !normalized.chars().all(|c| c.is_ascii_hexdigit())
                {
                    return Err(ConfigError::BadUsbId {
                        probe_id: probe.id,
                        field,
                        value: value.clone(),
                    });
                }
            }
        }

        let mut live_interfaces = std::collections::BTreeSet::new();
        for (name, target) in &self.targets {
            for key in target.container.referenced_keys() {
                if !self.containers.contains_key(key) {
                    return Err(ConfigError::UnknownContainer {
                        target: name.clone(),
                        container: key.to_string(),
                    });
                }
            }

            for iface in target.compatible_probes.all_interfaces() {
                if target.container.for_interface(iface).is_none() {
                    return Err(ConfigError::MissingContainer {
                        target: name.clone(),
                        interface: iface.to_string(),
                    });
                }
            }

            for mode in [Mode::Debug, Mode::Flash, Mode::Print] {
                for iface in target.compatible_probes.for_mode(mode) {
                    live_interfaces.insert(iface.clone());
                    if self.resolve_command(name, iface, mode).is_none() {
                        return Err(ConfigError::MissingCommand {
                            target: name.clone(),
                            interface: iface.clone(),
                            mode,
                        });
                    }
                }
            }

            for (iface, spec) in &target.transports {
                if let TransportSpec::Policy {
                    default: Some(default),
                    allowed,
                } = spec
                {
                    let default = default.trim().to_lowercase();
                    let allowed: Vec<String> = allowed
                        .iter()
                        .map(|s| s.trim().to_lowercase())
                        .filter(|s| !s.is_empty())
                        .collect();
                    if !allowed.is_empty() && !allowed.contains(&default) {
                        return Err(ConfigError::DefaultTransportNotAllowed {
                            target: name.clone(),
                            interface: iface.clone(),
                            transport: default,
                        });
                    }
                }
            }
        }

        // An interface no target can use is dead config, worth flagging but
        // not fatal: a partially-cabled lab is normal.
        for probe in &self.probes {
            if !live_interfaces.contains(&probe.interface) {
                warn!(
                    probe_id = probe.id,
                    interface = %probe.interface,
                    "probe interface appears in no target's compatibility list (dead config)"
                );
            }
        }

        Ok(())
    }

    pub fn get_probe(&self, probe_id: u32) -> Option<&ProbeConfig> {
        self.probes.iter().find(|p| p.id == probe_id)
    }

    pub fn get_target(&self, name: &str) -> Option<&TargetConfig> {
        self.targets.get(name)
    }

    pub fn get_container(&self, key: &str) -> Option<&ContainerConfig> {
        self.containers.get(key)
    }

    /// Effective command template for `(target, interface, mode)`:
    /// target-local override first, then `interface_defaults`.
    pub fn resolve_command(&self, target: &str, interface: &str, mode: Mode) -> Option<&str> {
        let t = self.targets.get(target)?;
        if let Some(cmd) = t.commands.get(interface).and_then(|c| c.get(mode)) {
            return Some(cmd);
        }
        self.interface_defaults
            .get(interface)
            .and_then(|c| c.get(mode))
    }

    /// Normalized transport policy for `(target, interface)`.
    pub fn transport_policy(&self, target: &str, interface: &str) -> TransportPolicy {
        self.targets
            .get(target)
            .and_then(|t| t.transports.get(interface))
            .map(TransportSpec::normalize)
            .unwrap_or_default()
    }

    /// Resolve the effective transport from the request and the target
    /// policy, then check it against WCH-Link hardware-mode restrictions.
    ///
    /// Print bridges carry no debug transport, so `print` always resolves
    /// to `None`.
    pub fn resolve_transport(
        &self,
        target: &str,
        probe: &ProbeConfig,
        requested: Option<&str>,
        mode: Mode,
    ) -> Result<Option<String>, TransportError> {
        if mode == Mode::Print {
            return Ok(None);
        }

        let interface = probe.interface.as_str();
        let requested = requested
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty());
        let policy = self.transport_policy(target, interface);

        let resolved = if let Some(req) = requested.clone() {
            if policy.allowed.is_empty() {
                return Err(TransportError::NoPolicy {
                    target: target.to_string(),
                    interface: interface.to_string(),
                    requested: req,
                });
            }
            if !policy.allowed.contains(&req) {
                return Err(TransportError::NotAllowed {
                    target: target.to_string(),
                    interface: interface.to_string(),
                    requested: req,
                    allowed: policy.allowed.clone(),
                });
            }
            Some(req)
        } else {
            policy.default.clone().or_else(|| policy.allowed.first().cloned())
        };

        // WCH-Link probes fix the transport by firmware mode; a policy that
        // disagrees with the hardware is an operator error either way.
        match probe.wch_link_mode() {
            Some(WchLinkMode::RiscV) => {
                if let Some(t) = requested.as_deref().or(resolved.as_deref()) {
                    if t != "sdi" {
                        return Err(TransportError::WchRiscvRequiresSdi {
                            target: target.to_string(),
                            probe_id: probe.id,
                            transport: t.to_string(),
                        });
                    }
                }
            }
            Some(WchLinkMode::Arm) => {
                if requested.as_deref() == Some("sdi") {
                    return Err(TransportError::WchArmRejectsSdi {
                        target: target.to_string(),
                        probe_id: probe.id,
                    });
                }
            }
            None => {}
        }

        Ok(resolved)
    }
}

/// Normalize a USB id string such as `0x8010` or `8010` to lowercase hex
/// without prefix.
pub fn normalize_usb_id(value: &str) -> String {
    let v = value.trim().to_lowercase();
    v.strip_prefix("0x").unwrap_or(&v).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_yaml() -> &'static str {
        r#"
server:
  port: 8080
ports:
  gdb_base: 3330
containers:
  debug-box-arm:
    name: debug-box-arm
    image_name: debug-box-arm
    build_context: containers/arm
  debug-box-wch:
    name: debug-box-wch
    image_name: debug-box-wch
    build_context: containers/wch
probes:
  - id: 1
    name: "J-Link Plus"
    interface: jlink
    vendor_id: "1366"
    product_id: "0105"
    serial: "000683412345"
  - id: 2
    name: "WCH-LinkE"
    interface: wch-link
    vendor_id: "1a86"
    product_id: "0x8010"
    serial: "WCH123"
targets:
  nrf52840:
    description: "Nordic nRF52840"
    container: debug-box-arm
    compatible_probes:
      debug: [jlink]
      flash: [jlink]
    transports:
      jlink: { default: swd, allowed: [swd, jtag] }
    commands:
      jlink:
        debug: "JLinkGDBServer -select usb={serial} -port {gdb_port}"
        flash: "JLinkExe -usb {serial} -CommandFile {firmware_path}"
  ch32v203:
    description: "WCH CH32V203"
    container:
      wch-link: debug-box-wch
    compatible_probes: [wch-link]
    transports:
      wch-link: sdi
    commands:
      wch-link:
        debug: "openocd -c 'adapter serial {serial}' -c 'gdb_port {gdb_port}' -c 'transport select {transport}'"
        flash: "wlink -s {serial} flash {firmware_path}"
        print: "socat TCP-LISTEN:{print_port},reuseaddr,fork {device_path},b{uart_baud},raw"
"#
    }

    fn parse(yaml: &str) -> HubConfig {
        serde_yaml::from_str(yaml).expect("yaml parses")
    }

    #[test]
    fn sample_config_validates() {
        let config = parse(sample_yaml());
        config.validate().expect("valid");
    }

    #[test]
    fn duplicate_probe_id_rejected() {
        let mut config = parse(sample_yaml());
        let mut dup = config.probes[0].clone();
        dup.name = "clone".to_string();
        config.probes.push(dup);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::DuplicateProbeId(1))
        ));
    }

    #[test]
    fn malformed_usb_id_rejected() {
        let mut config = parse(sample_yaml());
        config.probes[0].vendor_id = "13g6".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::BadUsbId { probe_id: 1, .. })
        ));
    }

    #[test]
    fn unknown_container_rejected() {
        let mut config = parse(sample_yaml());
        config.targets.get_mut("nrf52840").unwrap().container =
            ContainerSelect::Single("nope".to_string());
        assert!(matches!(
            config.validate(),
            Err(ConfigError::UnknownContainer { .. })
        ));
    }

    #[test]
    fn per_interface_container_must_cover_compat_list() {
        let mut config = parse(sample_yaml());
        let target = config.targets.get_mut("ch32v203").unwrap();
        target.compatible_probes = CompatibleProbes::Flat(vec![
            "wch-link".to_string(),
            "usb-uart".to_string(),
        ]);
        // container map only names wch-link, so usb-uart has nowhere to run
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingContainer { .. })
        ));
    }

    #[test]
    fn compatible_interface_without_command_rejected() {
        let mut config = parse(sample_yaml());
        config
            .targets
            .get_mut("nrf52840")
            .unwrap()
            .compatible_probes = CompatibleProbes::PerMode(ModeInterfaces {
            debug: vec!["jlink".to_string()],
            flash: vec!["jlink".to_string()],
            print: vec!["usb-uart".to_string()],
        });
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingCommand { mode: Mode::Print, .. })
        ));
    }

    #[test]
    fn interface_defaults_satisfy_compatibility() {
        let mut config = parse(sample_yaml());
        config
            .targets
            .get_mut("nrf52840")
            .unwrap()
            .compatible_probes = CompatibleProbes::PerMode(ModeInterfaces {
            debug: vec!["jlink".to_string()],
            flash: vec!["jlink".to_string()],
            print: vec!["usb-uart".to_string()],
        });
        config.interface_defaults.insert(
            "usb-uart".to_string(),
            ModeCommands {
                print: Some("socat TCP-LISTEN:{print_port} {device_path}".to_string()),
                ..Default::default()
            },
        );
        config.validate().expect("fallback covers print");
    }

    #[test]
    fn default_transport_must_be_allowed() {
        let mut config = parse(sample_yaml());
        config.targets.get_mut("nrf52840").unwrap().transports.insert(
            "jlink".to_string(),
            TransportSpec::Policy {
                default: Some("sdi".to_string()),
                allowed: vec!["swd".to_string(), "jtag".to_string()],
            },
        );
        assert!(matches!(
            config.validate(),
            Err(ConfigError::DefaultTransportNotAllowed { .. })
        ));
    }

    #[test]
    fn lone_default_folds_into_allowed() {
        let spec = TransportSpec::Policy {
            default: Some("SWD".to_string()),
            allowed: vec![],
        };
        let policy = spec.normalize();
        assert_eq!(policy.default.as_deref(), Some("swd"));
        assert_eq!(policy.allowed, vec!["swd".to_string()]);
    }

    #[test]
    fn command_resolution_prefers_target_local() {
        let mut config = parse(sample_yaml());
        config.interface_defaults.insert(
            "jlink".to_string(),
            ModeCommands {
                debug: Some("fallback".to_string()),
                ..Default::default()
            },
        );
        let cmd = config
            .resolve_command("nrf52840", "jlink", Mode::Debug)
            .unwrap();
        assert!(cmd.starts_with("JLinkGDBServer"));
    }

    #[test]
    fn command_resolution_falls_back_to_defaults() {
        let mut config = parse(sample_yaml());
        config
            .targets
            .get_mut("nrf52840")
            .unwrap()
            .commands
            .get_mut("jlink")
            .unwrap()
            .debug = None;
        config.interface_defaults.insert(
            "jlink".to_string(),
            ModeCommands {
                debug: Some("fallback".to_string()),
                ..Default::default()
            },
        );
        assert_eq!(
            config.resolve_command("nrf52840", "jlink", Mode::Debug),
            Some("fallback")
        );
    }

    #[test]
    fn transport_shorthand_expands() {
        let config = parse(sample_yaml());
        let policy = config.transport_policy("ch32v203", "wch-link");
        assert_eq!(policy.default.as_deref(), Some("sdi"));
        assert_eq!(policy.allowed, vec!["sdi".to_string()]);
    }

    #[test]
    fn requested_transport_must_be_allowed() {
        let config = parse(sample_yaml());
        let probe = config.get_probe(1).unwrap();
        let err = config
            .resolve_transport("nrf52840", probe, Some("sdi"), Mode::Debug)
            .unwrap_err();
        assert!(matches!(err, TransportError::NotAllowed { .. }));
    }

    #[test]
    fn omitted_transport_uses_default() {
        let config = parse(sample_yaml());
        let probe = config.get_probe(1).unwrap();
        let resolved = config
            .resolve_transport("nrf52840", probe, None, Mode::Debug)
            .unwrap();
        assert_eq!(resolved.as_deref(), Some("swd"));
    }

    #[test]
    fn print_mode_resolves_no_transport() {
        let config = parse(sample_yaml());
        let probe = config.get_probe(2).unwrap();
        let resolved = config
            .resolve_transport("ch32v203", probe, Some("swd"), Mode::Print)
            .unwrap();
        assert_eq!(resolved, None);
    }

    #[test]
    fn wch_riscv_mode_fixes_transport_to_sdi() {
        let config = parse(sample_yaml());
        let probe = config.get_probe(2).unwrap();
        assert_eq!(probe.wch_link_mode(), Some(WchLinkMode::RiscV));

        let err = config
            .resolve_transport("ch32v203", probe, Some("swd"), Mode::Debug)
            .unwrap_err();
        assert!(matches!(err, TransportError::WchRiscvRequiresSdi { .. }));

        let resolved = config
            .resolve_transport("ch32v203", probe, None, Mode::Debug)
            .unwrap();
        assert_eq!(resolved.as_deref(), Some("sdi"));
    }

    #[test]
    fn wch_arm_mode_rejects_sdi() {
        let mut config = parse(sample_yaml());
        config.probes[1].product_id = "8012".to_string();
        config.targets.get_mut("ch32v203").unwrap().transports.insert(
            "wch-link".to_string(),
            TransportSpec::Policy {
                default: Some("swd".to_string()),
                allowed: vec!["swd".to_string(), "jtag".to_string(), "sdi".to_string()],
            },
        );
        let probe = config.get_probe(2).unwrap();
        let err = config
            .resolve_transport("ch32v203", probe, Some("sdi"), Mode::Debug)
            .unwrap_err();
        assert!(matches!(err, TransportError::WchArmRejectsSdi { .. }));
    }

    #[test]
    fn usb_id_normalization() {
        assert_eq!(normalize_usb_id("0x8010"), "8010");
        assert_eq!(normalize_usb_id("1366"), "1366");
        assert_eq!(normalize_usb_id(" 0X0105 "), "0105");
    }
}
