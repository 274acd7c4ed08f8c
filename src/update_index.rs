//! Remote firmware index
//!
//! The vendor publishes a JSON index mapping device names to the latest
//! released firmware per target, plus an entry for this host tool. The
//! transport that fetches the index is external; this module only models
//! and loads it. An unreachable or malformed index degrades the tool —
//! version comparison goes dark and update affordances that depend on it
//! are disabled — but never crashes it.

use std::{collections::HashMap, fs, path::Path};

use log::warn;
use serde::Deserialize;

use crate::{
    error::Error,
    version::{VersionPair, VersionSnapshot},
};

/// The newest published release of one firmware
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct FirmwareEntry {
    pub version: String,
    pub url: String,
}

/// Index entries for one device model
#[derive(Clone, Debug, Default, Deserialize)]
pub struct DeviceFirmware {
    pub application: Option<FirmwareEntry>,
    pub coprocessor: Option<FirmwareEntry>,
    /// Latest release of this host tool itself.
    pub tool: Option<FirmwareEntry>,
}

/// The full downloaded index, keyed by device name
#[derive(Clone, Debug, Default, Deserialize)]
pub struct FirmwareIndex {
    #[serde(flatten)]
    devices: HashMap<String, DeviceFirmware>,
}

impl FirmwareIndex {
    /// Load the index from a local JSON file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let path = path.as_ref();
        let data = fs::read(path)
            .map_err(|err| Error::Network(format!("{}: {err}", path.display())))?;

        Self::from_slice(&data)
    }

    /// Parse the index from raw JSON bytes.
    pub fn from_slice(data: &[u8]) -> Result<Self, Error> {
        serde_json::from_slice(data).map_err(|err| Error::Network(err.to_string()))
    }

    /// Look up the entries for `device`, warning when the index does not
    /// know the device at all.
    pub fn device(&self, device: &str) -> Option<&DeviceFirmware> {
        let entry = self.devices.get(device);
        if entry.is_none() {
            warn!("Firmware index has no entry for device '{device}'");
        }
        entry
    }
}

impl VersionSnapshot {
    /// Capture an immutable snapshot of installed vs available versions
    /// for one session.
    ///
    /// `index` may be absent when the download failed; the available
    /// sides then stay unset and version-gated decisions degrade to
    /// their safe defaults.
    pub fn resolve(
        index: Option<&FirmwareIndex>,
        device: &str,
        installed_application: Option<String>,
        installed_coprocessor: Option<String>,
        tool_version: &str,
    ) -> Self {
        let entries = index.and_then(|index| index.device(device));

        let available = |entry: fn(&DeviceFirmware) -> &Option<FirmwareEntry>| {
            entries
                .and_then(|device| entry(device).as_ref())
                .map(|firmware| firmware.version.clone())
        };

        VersionSnapshot {
            application: VersionPair::new(
                installed_application,
                available(|device| &device.application),
            ),
            coprocessor: VersionPair::new(
                installed_coprocessor,
                available(|device| &device.coprocessor),
            ),
            tool: VersionPair::new(
                Some(tool_version.to_string()),
                available(|device| &device.tool),
            ),
        }
    }
}
