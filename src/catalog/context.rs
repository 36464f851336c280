//! App context and randomization units supplied by the host application

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Name of the randomization unit that is always available: the engine-owned
/// device identifier, generated on first initialization and persisted.
pub const DEVICE_ID_UNIT: &str = "device_id";

/// Immutable snapshot of app and device identity, captured once at client
/// construction and used only as targeting-evaluation input.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AppContext {
    /// Application identifier, e.g. a bundle or package id.
    pub app_id: String,
    /// Application version string.
    pub app_version: Option<String>,
    /// Application build identifier.
    pub app_build: Option<String>,
    /// CPU architecture.
    pub architecture: Option<String>,
    /// Device manufacturer.
    pub device_manufacturer: Option<String>,
    /// Device model.
    pub device_model: Option<String>,
    /// BCP-47 locale tag.
    pub locale: Option<String>,
    /// Operating system name.
    pub os: Option<String>,
    /// Operating system version.
    pub os_version: Option<String>,
    /// Free-form tag for debug builds.
    pub debug_tag: Option<String>,
    /// Additional host-supplied targeting attributes, merged last.
    #[serde(default)]
    pub custom_targeting_attributes: HashMap<String, String>,
}

impl AppContext {
    /// Flatten the context into the attribute map consumed by targeting
    /// evaluation. Absent optional fields are omitted rather than empty, so
    /// expressions referencing them fail evaluation instead of silently
    /// comparing against "".
    #[must_use]
    pub fn as_attributes(&self) -> HashMap<String, String> {
        let mut attrs = HashMap::new();
        attrs.insert("app_id".to_string(), self.app_id.clone());

        let optional = [
            ("app_version", &self.app_version),
            ("app_build", &self.app_build),
            ("architecture", &self.architecture),
            ("device_manufacturer", &self.device_manufacturer),
            ("device_model", &self.device_model),
            ("locale", &self.locale),
            ("os", &self.os),
            ("os_version", &self.os_version),
            ("debug_tag", &self.debug_tag),
        ];
        for (key, value) in optional {
            if let Some(value) = value {
                attrs.insert(key.to_string(), value.clone());
            }
        }

        for (key, value) in &self.custom_targeting_attributes {
            attrs.insert(key.clone(), value.clone());
        }
        attrs
    }
}

/// Stable per-device randomization identifiers, keyed by unit name.
///
/// The engine-owned `device_id` unit is always resolvable; host-supplied
/// units (e.g. a client id) are optional. An experiment requiring an absent
/// unit is ineligible for this device, never a fatal error.
#[derive(Debug, Clone, Default)]
pub struct RandomizationUnits {
    units: HashMap<String, String>,
}

impl RandomizationUnits {
    /// Create an empty set; only `device_id` will resolve.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a named unit value.
    #[must_use]
    pub fn with_unit(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.units.insert(name.into(), value.into());
        self
    }

    /// Resolve a unit name to its value, falling back to the engine-owned
    /// device id for [`DEVICE_ID_UNIT`].
    #[must_use]
    pub fn resolve<'a>(&'a self, device_id: &'a str, unit: &str) -> Option<&'a str> {
        if unit == DEVICE_ID_UNIT {
            Some(device_id)
        } else {
            self.units.get(unit).map(String::as_str)
        }
    }
}
