//! # settings
//!
//! Operator state that must survive a restart: lease bans, per-lease
//! limits, approval lists and IP bans, in a single `admin_settings.json`.
//! Every admin mutation persists before the HTTP response goes out. The
//! write is a temp file followed by a rename, so a crash never leaves a
//! half-written file behind.

use std::{
    collections::HashMap,
    fs,
    net::IpAddr,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{
    gate::{ApprovalMode, GateSnapshot},
    lease::LeaseId,
};

/// The persisted operator settings. Missing file and missing fields are
/// both equivalent to the defaults.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AdminSettings {
    /// lease ids rejected everywhere
    pub banned_leases: Vec<LeaseId>,
    /// per-lease bytes/sec caps
    pub bps_limits: HashMap<LeaseId, u64>,
    /// per-lease concurrent connection caps
    pub conn_limits: HashMap<LeaseId, u32>,
    /// auto or manual
    pub approval_mode: ApprovalMode,
    /// leases allowed to serve in manual mode
    pub approved_leases: Vec<LeaseId>,
    /// leases refused in any mode
    pub denied_leases: Vec<LeaseId>,
    /// source addresses refused at the front doors
    pub banned_ips: Vec<IpAddr>,
}

impl AdminSettings {
    /// Read settings from `path`; a missing file is the empty default.
    pub fn load(path: &Path) -> Result<Self> {
        match fs::read(path) {
            Ok(raw) => {
                let settings = serde_json::from_slice(&raw)
                    .with_context(|| format!("parsing {}", path.display()))?;
                info!(path = %path.display(), "loaded admin settings");
                Ok(settings)
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no settings file, starting empty");
                Ok(AdminSettings::default())
            }
            Err(err) => Err(err).with_context(|| format!("reading {}", path.display())),
        }
    }

    /// the gate's portion of the settings
    pub fn gate_snapshot(&self) -> GateSnapshot {
        GateSnapshot {
            bps_limits: self.bps_limits.clone(),
            conn_limits: self.conn_limits.clone(),
            approval_mode: self.approval_mode,
            approved_leases: self.approved_leases.clone(),
            denied_leases: self.denied_leases.clone(),
            banned_ips: self.banned_ips.clone(),
        }
    }

    /// rebuild the full settings from live component state
    pub fn from_parts(banned_leases: Vec<LeaseId>, gate: GateSnapshot) -> Self {
        AdminSettings {
            banned_leases,
            bps_limits: gate.bps_limits,
            conn_limits: gate.conn_limits,
            approval_mode: gate.approval_mode,
            approved_leases: gate.approved_leases,
            denied_leases: gate.denied_leases,
            banned_ips: gate.banned_ips,
        }
    }
}

/// Serializes writers so concurrent admin mutations can't interleave the
/// temp file.
pub struct SettingsStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl std::fmt::Debug for SettingsStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SettingsStore")
            .field("path", &self.path)
            .finish()
    }
}

impl SettingsStore {
    /// store backed by `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        SettingsStore {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// load current contents (missing file is the default)
    pub fn load(&self) -> Result<AdminSettings> {
        AdminSettings::load(&self.path)
    }

    /// Atomically persist `settings`: write a sibling temp file, then
    /// rename over the target.
    pub fn persist(&self, settings: &AdminSettings) -> Result<()> {
        let _guard = self.write_lock.lock();
        let tmp = self.path.with_extension("json.tmp");
        let raw = serde_json::to_vec_pretty(settings).context("serializing settings")?;
        fs::write(&tmp, raw).with_context(|| format!("writing {}", tmp.display()))?;
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("renaming over {}", self.path.display()))?;
        debug!(path = %self.path.display(), "settings persisted");
        Ok(())
    }
}
