use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// 编译进二进制的默认配置
pub const DEFAULT_CONFIG_TOML: &str = include_str!("../../configs.toml");

/// Used whenever a configured scan duration is missing or not positive.
pub const DEFAULT_SCAN_DURATION_SECS: u32 = 4;

/// 顶层应用配置
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub ap: ApConfig,
    pub paths: PathsConfig,
    pub supervisor: SupervisorConfig,
    pub scan_prefetch: bool,
    /// Seed for [`RuntimeConfig`] when nothing is persisted yet.
    pub defaults: RuntimeConfig,
}

/// 用于解析 TOML 的临时结构
#[derive(Deserialize)]
struct AppConfigFile {
    ap: ApConfigToml,
    paths: PathsConfig,
    supervisor: SupervisorToml,
    #[serde(default)]
    scan: ScanToml,
    #[serde(default)]
    defaults: RuntimeConfigFile,
}

// ============= AP 配置 =============

/// 回退热点配置
#[derive(Debug, Clone)]
pub struct ApConfig {
    pub ssid: String,
    pub psk: String,
    pub bind_addr: SocketAddr,
    pub gateway_cidr: String,

    // === 网络接口配置 ===
    pub interface_name: String,
    pub station_interface: String,

    // === DHCP 配置 ===
    pub dhcp_range: String,

    pub hostapd_conf_path: String,
}

#[derive(Deserialize)]
struct ApConfigToml {
    ap_ssid: String,
    #[serde(default)]
    ap_psk: String,
    ap_gateway_cidr: String,
    ap_bind_addr: String,

    interface_name: String,
    station_interface: String,
    dhcp_range: String,
    hostapd_conf_path: String,
}

impl TryFrom<ApConfigToml> for ApConfig {
    type Error = Error;

    fn try_from(t: ApConfigToml) -> Result<Self> {
        let bind_addr = SocketAddr::from_str(&t.ap_bind_addr)
            .map_err(|e| {
                Error::Config(format!("invalid ap_bind_addr '{}': {}", t.ap_bind_addr, e))
            })?;
        Ok(ApConfig {
            ssid: t.ap_ssid,
            psk: t.ap_psk,
            bind_addr,
            gateway_cidr: t.ap_gateway_cidr,
            interface_name: t.interface_name,
            station_interface: t.station_interface,
            dhcp_range: t.dhcp_range,
            hostapd_conf_path: t.hostapd_conf_path,
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PathsConfig {
    pub runtime_config: PathBuf,
    pub ui_dir: PathBuf,
}

// ============= 连接监督配置 =============

#[derive(Debug, Clone, Copy)]
pub struct SupervisorConfig {
    pub reconnect_interval: Duration,
    pub initial_connect_timeout: Duration,
    pub tick_interval: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            reconnect_interval: Duration::from_secs(30),
            initial_connect_timeout: Duration::from_secs(10),
            tick_interval: Duration::from_millis(500),
        }
    }
}

#[derive(Deserialize)]
struct SupervisorToml {
    reconnect_interval_secs: u64,
    initial_connect_timeout_secs: u64,
    tick_interval_ms: u64,
}

impl From<SupervisorToml> for SupervisorConfig {
    fn from(t: SupervisorToml) -> Self {
        SupervisorConfig {
            reconnect_interval: Duration::from_secs(t.reconnect_interval_secs),
            initial_connect_timeout: Duration::from_secs(t.initial_connect_timeout_secs),
            tick_interval: Duration::from_millis(t.tick_interval_ms.max(1)),
        }
    }
}

#[derive(Default, Deserialize)]
struct ScanToml {
    #[serde(default)]
    prefetch: bool,
}

// ============= 运行时配置 =============

/// Station credentials of the device itself.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StationCredentials {
    pub ssid: String,
    pub password: String,
}

impl StationCredentials {
    pub fn is_configured(&self) -> bool {
        !self.ssid.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouterAccount {
    pub address: String,
    pub user: String,
    pub password: String,
    /// Non-empty selects bearer authentication instead of basic.
    pub token: String,
    pub wlan_interface: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BandPresets {
    pub band_2ghz: String,
    pub band_5ghz: String,
}

/// Process-wide settings, edited from the settings page and persisted on
/// every mutation. `scan_duration_secs` is always positive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    pub wifi: StationCredentials,
    pub router: RouterAccount,
    pub bands: BandPresets,
    pub scan_duration_secs: u32,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            wifi: StationCredentials::default(),
            router: RouterAccount::default(),
            bands: BandPresets::default(),
            scan_duration_secs: DEFAULT_SCAN_DURATION_SECS,
        }
    }
}

impl RuntimeConfig {
    pub fn endpoint(&self) -> RouterEndpoint {
        let auth = if self.router.token.is_empty() {
            RouterAuth::Basic {
                user: self.router.user.clone(),
                password: self.router.password.clone(),
            }
        } else {
            RouterAuth::Bearer(self.router.token.clone())
        };
        RouterEndpoint {
            address: self.router.address.clone(),
            auth,
        }
    }
}

/// Where and how to reach the router's REST API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouterEndpoint {
    pub address: String,
    pub auth: RouterAuth,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouterAuth {
    Basic { user: String, password: String },
    Bearer(String),
}

/// On-disk shape of [`RuntimeConfig`]. Every field is optional so that a
/// partial or older file falls back to defaults field by field.
#[derive(Debug, Default, Serialize, Deserialize)]
struct RuntimeConfigFile {
    #[serde(default)]
    wifi: WifiSection,
    #[serde(default)]
    router: RouterSection,
    #[serde(default)]
    bands: BandsSection,
    #[serde(default)]
    scan: ScanSection,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct WifiSection {
    #[serde(skip_serializing_if = "Option::is_none")]
    ssid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    password: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RouterSection {
    #[serde(skip_serializing_if = "Option::is_none")]
    address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    password: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    wlan_interface: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct BandsSection {
    #[serde(skip_serializing_if = "Option::is_none")]
    band_2ghz: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    band_5ghz: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ScanSection {
    #[serde(skip_serializing_if = "Option::is_none")]
    duration_seconds: Option<i64>,
}

impl RuntimeConfigFile {
    fn overlay(self, base: &RuntimeConfig) -> RuntimeConfig {
        let duration = match self.scan.duration_seconds {
            Some(secs) if secs > 0 => u32::try_from(secs).unwrap_or(u32::MAX),
            Some(secs) => {
                tracing::warn!(secs, "Non-positive scan duration, using default");
                base.scan_duration_secs
            }
            None => base.scan_duration_secs,
        };
        RuntimeConfig {
            wifi: StationCredentials {
                ssid: self.wifi.ssid.unwrap_or_else(|| base.wifi.ssid.clone()),
                password: self.wifi.password.unwrap_or_else(|| base.wifi.password.clone()),
            },
            router: RouterAccount {
                address: self.router.address.unwrap_or_else(|| base.router.address.clone()),
                user: self.router.user.unwrap_or_else(|| base.router.user.clone()),
                password: self.router.password.unwrap_or_else(|| base.router.password.clone()),
                token: self.router.token.unwrap_or_else(|| base.router.token.clone()),
                wlan_interface: self
                    .router
                    .wlan_interface
                    .unwrap_or_else(|| base.router.wlan_interface.clone()),
            },
            bands: BandPresets {
                band_2ghz: self.bands.band_2ghz.unwrap_or_else(|| base.bands.band_2ghz.clone()),
                band_5ghz: self.bands.band_5ghz.unwrap_or_else(|| base.bands.band_5ghz.clone()),
            },
            scan_duration_secs: duration,
        }
    }
}

impl From<&RuntimeConfig> for RuntimeConfigFile {
    fn from(c: &RuntimeConfig) -> Self {
        RuntimeConfigFile {
            wifi: WifiSection {
                ssid: Some(c.wifi.ssid.clone()),
                password: Some(c.wifi.password.clone()),
            },
            router: RouterSection {
                address: Some(c.router.address.clone()),
                user: Some(c.router.user.clone()),
                password: Some(c.router.password.clone()),
                token: Some(c.router.token.clone()),
                wlan_interface: Some(c.router.wlan_interface.clone()),
            },
            bands: BandsSection {
                band_2ghz: Some(c.bands.band_2ghz.clone()),
                band_5ghz: Some(c.bands.band_5ghz.clone()),
            },
            scan: ScanSection {
                duration_seconds: Some(i64::from(c.scan_duration_secs)),
            },
        }
    }
}

// ============= 配置加载函数 =============

/// 从 TOML 字符串加载应用配置
pub fn load_config_from_toml_str(s: &str) -> Result<AppConfig> {
    let parsed: AppConfigFile = toml::from_str(s)?;

    Ok(AppConfig {
        ap: ApConfig::try_from(parsed.ap)?,
        paths: parsed.paths,
        supervisor: SupervisorConfig::from(parsed.supervisor),
        scan_prefetch: parsed.scan.prefetch,
        defaults: parsed.defaults.overlay(&RuntimeConfig::default()),
    })
}

/// 编译进二进制的默认配置
pub fn builtin_config() -> Result<AppConfig> {
    load_config_from_toml_str(DEFAULT_CONFIG_TOML)
}

// ============= 设置更新 =============

/// Partial update posted by the settings page. Absent keys are untouched.
#[derive(Debug, Default, Deserialize)]
pub struct SettingsUpdate {
    #[serde(default)]
    pub wifi: Option<WifiUpdate>,
    #[serde(default, alias = "router")]
    pub mikrotik: Option<RouterUpdate>,
    #[serde(default)]
    pub bands: Option<BandsUpdate>,
    #[serde(default)]
    pub scan: Option<ScanUpdate>,
}

#[derive(Debug, Default, Deserialize)]
pub struct WifiUpdate {
    pub ssid: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RouterUpdate {
    #[serde(alias = "address")]
    pub ip: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub token: Option<String>,
    pub wlan_interface: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct BandsUpdate {
    pub band_2ghz: Option<String>,
    pub band_5ghz: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ScanUpdate {
    pub duration_seconds: Option<i64>,
}

/// Which sections a settings update actually changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SettingsChange {
    pub wifi_changed: bool,
    pub router_changed: bool,
    pub bands_changed: bool,
    pub scan_changed: bool,
}

impl SettingsChange {
    pub fn any(&self) -> bool {
        self.wifi_changed || self.router_changed || self.bands_changed || self.scan_changed
    }
}

/// Assigns `value` to `slot`, returning whether the stored value changed.
fn assign(slot: &mut String, value: String) -> bool {
    if *slot == value {
        return false;
    }
    *slot = value;
    true
}

fn assign_trimmed(slot: &mut String, value: Option<String>) -> bool {
    match value {
        Some(v) => assign(slot, v.trim().to_string()),
        None => false,
    }
}

fn assign_raw(slot: &mut String, value: Option<String>) -> bool {
    match value {
        Some(v) => assign(slot, v),
        None => false,
    }
}

// ============= 持久化 =============

/// Owns the current [`RuntimeConfig`] and its file on disk.
#[derive(Debug)]
pub struct ConfigStore {
    path: PathBuf,
    current: RuntimeConfig,
}

impl ConfigStore {
    /// Loads the runtime configuration from `path`.
    ///
    /// A missing file is created from `defaults`. A file that cannot be read
    /// or parsed leaves `defaults` in effect (in memory only) so the device
    /// still boots.
    pub fn load(path: impl Into<PathBuf>, defaults: RuntimeConfig) -> Self {
        let path = path.into();

        if !path.exists() {
            tracing::info!("Runtime config {} missing, writing defaults", path.display());
            let store = Self { path, current: defaults };
            if let Err(e) = store.save() {
                tracing::warn!("Failed to write default runtime config: {}", e);
            }
            return store;
        }

        let current = match read_runtime_file(&path) {
            Ok(file) => file.overlay(&defaults),
            Err(e) => {
                tracing::warn!("Failed to load {}: {}. Using defaults", path.display(), e);
                defaults
            }
        };

        Self { path, current }
    }

    pub fn current(&self) -> &RuntimeConfig {
        &self.current
    }

    /// Applies a partial update and persists it.
    ///
    /// Validation happens before anything is touched, and the in-memory copy
    /// is only replaced once the file was written.
    pub fn apply(&mut self, update: SettingsUpdate) -> Result<SettingsChange> {
        let duration = match update.scan.as_ref().and_then(|s| s.duration_seconds) {
            Some(secs) if secs <= 0 => {
                return Err(Error::InvalidInput("invalid_scan_duration".into()));
            }
            Some(secs) => Some(u32::try_from(secs).unwrap_or(u32::MAX)),
            None => None,
        };

        let mut next = self.current.clone();
        let mut change = SettingsChange::default();

        if let Some(wifi) = update.wifi {
            change.wifi_changed |= assign_trimmed(&mut next.wifi.ssid, wifi.ssid);
            change.wifi_changed |= assign_raw(&mut next.wifi.password, wifi.password);
        }

        if let Some(router) = update.mikrotik {
            change.router_changed |= assign_trimmed(&mut next.router.address, router.ip);
            change.router_changed |= assign_trimmed(&mut next.router.user, router.user);
            change.router_changed |= assign_raw(&mut next.router.password, router.password);
            change.router_changed |= assign_trimmed(&mut next.router.token, router.token);
            change.router_changed |=
                assign_trimmed(&mut next.router.wlan_interface, router.wlan_interface);
        }

        if let Some(bands) = update.bands {
            change.bands_changed |= assign_trimmed(&mut next.bands.band_2ghz, bands.band_2ghz);
            change.bands_changed |= assign_trimmed(&mut next.bands.band_5ghz, bands.band_5ghz);
        }

        if let Some(secs) = duration {
            if next.scan_duration_secs != secs {
                next.scan_duration_secs = secs;
                change.scan_changed = true;
            }
        }

        if change.any() {
            write_runtime_file(&self.path, &next)?;
            self.current = next;
        }

        Ok(change)
    }

    pub fn save(&self) -> Result<()> {
        write_runtime_file(&self.path, &self.current)
    }
}

fn read_runtime_file(path: &Path) -> Result<RuntimeConfigFile> {
    let text = std::fs::read_to_string(path)?;
    Ok(toml::from_str(&text)?)
}

fn write_runtime_file(path: &Path, config: &RuntimeConfig) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let text = toml::to_string_pretty(&RuntimeConfigFile::from(config))?;

    // 先写临时文件再重命名，避免掉电时留下半个文件
    let tmp = path.with_extension("toml.tmp");
    std::fs::write(&tmp, text.as_bytes())?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}
