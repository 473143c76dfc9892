use anyhow::{bail, Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::api::{API_BASE, REQUEST_TIMEOUT};
use crate::auth::{AuthToken, DeviceIdentity};
use crate::data::DayReport;
use crate::error::PillowError;

const CONFIG_FILE: &str = "config.toml";
const TOKEN_FILE: &str = "token.json";
const REPORT_FILE: &str = "report.json";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub device: DeviceConfig,
    pub polling: PollingConfig,
    pub base_url: Option<String>,
}

/// Identity fields entered when the pillow was set up.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub mac: Option<String>,
    pub uid: Option<String>,
    pub cname: Option<String>,
    pub cname_type: Option<String>,
    pub sort: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    pub interval_secs: u64,
    pub request_timeout_secs: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval_secs: 3600,
            request_timeout_secs: REQUEST_TIMEOUT.as_secs(),
        }
    }
}

impl PollingConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(60))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }
}

impl Config {
    /// Load `config.toml` (from `path` or the data directory), then apply
    /// `PILLOW_*` environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::data_dir()?.join(CONFIG_FILE),
        };

        let mut config = if path.exists() {
            let text = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            toml::from_str::<Config>(&text).with_context(|| format!("Failed to parse {}", path.display()))?
        } else {
            Config::default()
        };

        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let device = &mut self.device;
        for (key, slot) in [
            ("PILLOW_MAC", &mut device.mac),
            ("PILLOW_UID", &mut device.uid),
            ("PILLOW_CNAME", &mut device.cname),
            ("PILLOW_CNAME_TYPE", &mut device.cname_type),
            ("PILLOW_SORT", &mut device.sort),
        ] {
            if let Some(value) = lookup(key) {
                *slot = Some(value);
            }
        }
        if let Some(url) = lookup("PILLOW_BASE_URL") {
            self.base_url = Some(url);
        }
    }

    pub fn identity(&self) -> Result<DeviceIdentity, PillowError> {
        let d = &self.device;
        DeviceIdentity::new(
            d.cname.as_deref().unwrap_or_default(),
            d.cname_type.as_deref().unwrap_or_default(),
            d.uid.as_deref().unwrap_or_default(),
            d.mac.as_deref().unwrap_or_default(),
            d.sort.as_deref().unwrap_or_default(),
        )
    }

    pub fn base_url(&self) -> &str {
        self.base_url.as_deref().unwrap_or(API_BASE)
    }

    pub fn data_dir() -> Result<PathBuf> {
        let dir = dirs::data_dir()
            .context("Failed to get data directory")?
            .join("pillowterm");

        fs::create_dir_all(&dir)?;
        Ok(dir)
    }
}

/// A stored value and the device it was fetched for.
#[derive(Debug, Serialize, Deserialize)]
struct DeviceRecord<T> {
    did: String,
    uid: String,
    value: T,
}

/// Token and last good report, kept as JSON files in one directory. Each
/// file records its device; a file written for another device is not loaded.
#[derive(Debug, Clone)]
pub struct Store {
    dir: PathBuf,
}

impl Store {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn open_default() -> Result<Self> {
        Ok(Self::new(Config::data_dir()?))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn save_token(&self, identity: &DeviceIdentity, token: &AuthToken) -> Result<()> {
        self.write_record(TOKEN_FILE, identity, token)
    }

    pub fn load_token(&self, identity: &DeviceIdentity) -> Result<AuthToken> {
        self.read_record(TOKEN_FILE, identity)
    }

    pub fn save_report(&self, identity: &DeviceIdentity, report: &DayReport) -> Result<()> {
        self.write_record(REPORT_FILE, identity, report)
    }

    pub fn load_report(&self, identity: &DeviceIdentity) -> Result<DayReport> {
        self.read_record(REPORT_FILE, identity)
    }

    fn write_record<T: Serialize>(&self, name: &str, identity: &DeviceIdentity, value: &T) -> Result<()> {
        let record = DeviceRecord {
            did: identity.did().to_string(),
            uid: identity.uid().to_string(),
            value,
        };
        self.write_json(name, &record)
    }

    fn read_record<T: DeserializeOwned>(&self, name: &str, identity: &DeviceIdentity) -> Result<T> {
        let record: DeviceRecord<T> = self.read_json(name)?;
        if record.did != identity.did() || record.uid != identity.uid() {
            bail!(
                "{} belongs to device {} (uid {}), not {}",
                name,
                record.did,
                record.uid,
                identity.did()
            );
        }
        Ok(record.value)
    }

    fn write_json<T: Serialize>(&self, name: &str, value: &T) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        let path = self.dir.join(name);
        let json = serde_json::to_string_pretty(value)?;
        fs::write(&path, json).with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }

    fn read_json<T: DeserializeOwned>(&self, name: &str) -> Result<T> {
        let path = self.dir.join(name);
        let json = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let value = serde_json::from_str(&json)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        Ok(value)
    }
}
