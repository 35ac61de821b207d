//! Capability registry: configuration keys, their value types and the
//! human-facing metadata front-ends use to present them.
//!
//! Key codes are append-only. A released code is never reused or renumbered,
//! new keys go at the end of their range.

use std::fmt;

use crate::error::{LabError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u32)]
pub enum ConfigKey {
    // Device classes
    LogicAnalyzer = 10000,
    Oscilloscope = 10001,
    Multimeter = 10002,
    DemoDevice = 10003,

    // Scan options
    Conn = 20000,
    SerialComm = 20001,

    // Device configuration
    Samplerate = 30000,
    CaptureRatio = 30001,
    PatternMode = 30002,
    Rle = 30003,
    TriggerType = 30004,

    // Special
    ScanOptions = 40000,
    DeviceOptions = 40001,
    SessionFile = 40002,
    CaptureFile = 40003,
    CaptureUnitsize = 40004,
    NumLogicProbes = 40005,
    NumAnalogProbes = 40006,

    // Acquisition modes
    LimitMsec = 50000,
    LimitSamples = 50001,
    Continuous = 50002,
}

impl ConfigKey {
    pub const ALL: &'static [Self] = &[
        Self::LogicAnalyzer,
        Self::Oscilloscope,
        Self::Multimeter,
        Self::DemoDevice,
        Self::Conn,
        Self::SerialComm,
        Self::Samplerate,
        Self::CaptureRatio,
        Self::PatternMode,
        Self::Rle,
        Self::TriggerType,
        Self::ScanOptions,
        Self::DeviceOptions,
        Self::SessionFile,
        Self::CaptureFile,
        Self::CaptureUnitsize,
        Self::NumLogicProbes,
        Self::NumAnalogProbes,
        Self::LimitMsec,
        Self::LimitSamples,
        Self::Continuous,
    ];

    pub fn code(self) -> u32 {
        self as u32
    }

    pub fn from_code(code: u32) -> Option<Self> {
        Self::ALL.iter().copied().find(|key| key.code() == code)
    }
}

impl fmt::Display for ConfigKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match lookup(*self) {
            Some(info) => f.write_str(info.shortname),
            None => write!(f, "{self:?}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    UInt64,
    Bool,
    String,
}

/// Typed configuration value. Replaces untyped pointers keyed by an
/// out-of-band type tag.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigValue {
    UInt64(u64),
    Bool(bool),
    String(String),
    UInt64List(Vec<u64>),
    StringList(Vec<String>),
    Keys(Vec<ConfigKey>),
}

impl ConfigValue {
    pub fn as_u64(&self) -> Result<u64> {
        match self {
            Self::UInt64(v) => Ok(*v),
            other => Err(LabError::argument(format!("expected uint64, got {other:?}"))),
        }
    }

    pub fn as_bool(&self) -> Result<bool> {
        match self {
            Self::Bool(v) => Ok(*v),
            other => Err(LabError::argument(format!("expected boolean, got {other:?}"))),
        }
    }

    pub fn as_str(&self) -> Result<&str> {
        match self {
            Self::String(v) => Ok(v),
            other => Err(LabError::argument(format!("expected string, got {other:?}"))),
        }
    }

    /// Whether this value has the shape `datatype` describes.
    pub fn is_of(&self, datatype: DataType) -> bool {
        matches!(
            (self, datatype),
            (Self::UInt64(_), DataType::UInt64)
                | (Self::Bool(_), DataType::Bool)
                | (Self::String(_), DataType::String)
        )
    }
}

impl From<u64> for ConfigValue {
    fn from(v: u64) -> Self {
        Self::UInt64(v)
    }
}

impl From<bool> for ConfigValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<&str> for ConfigValue {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<String> for ConfigValue {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

/// One key/value pair, used for scan options and `Meta` packets.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigOption {
    pub key: ConfigKey,
    pub value: ConfigValue,
}

impl ConfigOption {
    pub fn new(key: ConfigKey, value: impl Into<ConfigValue>) -> Self {
        Self {
            key,
            value: value.into(),
        }
    }

    /// First option in `options` carrying `key`.
    pub fn find(options: &[Self], key: ConfigKey) -> Option<&ConfigValue> {
        options
            .iter()
            .find(|option| option.key == key)
            .map(|option| &option.value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapabilityInfo {
    pub key: ConfigKey,
    pub datatype: DataType,
    pub description: &'static str,
    pub shortname: &'static str,
}

static CAPABILITIES: &[CapabilityInfo] = &[
    CapabilityInfo {
        key: ConfigKey::Conn,
        datatype: DataType::String,
        description: "Connection",
        shortname: "conn",
    },
    CapabilityInfo {
        key: ConfigKey::SerialComm,
        datatype: DataType::String,
        description: "Serial communication",
        shortname: "serialcomm",
    },
    CapabilityInfo {
        key: ConfigKey::Samplerate,
        datatype: DataType::UInt64,
        description: "Sample rate",
        shortname: "samplerate",
    },
    CapabilityInfo {
        key: ConfigKey::CaptureRatio,
        datatype: DataType::UInt64,
        description: "Pre-trigger capture ratio",
        shortname: "captureratio",
    },
    CapabilityInfo {
        key: ConfigKey::PatternMode,
        datatype: DataType::String,
        description: "Pattern generator mode",
        shortname: "pattern",
    },
    CapabilityInfo {
        key: ConfigKey::Rle,
        datatype: DataType::Bool,
        description: "Run Length Encoding",
        shortname: "rle",
    },
    CapabilityInfo {
        key: ConfigKey::TriggerType,
        datatype: DataType::String,
        description: "Trigger types",
        shortname: "triggertype",
    },
    CapabilityInfo {
        key: ConfigKey::SessionFile,
        datatype: DataType::String,
        description: "Session file",
        shortname: "sessionfile",
    },
    CapabilityInfo {
        key: ConfigKey::CaptureFile,
        datatype: DataType::String,
        description: "Capture file",
        shortname: "capturefile",
    },
    CapabilityInfo {
        key: ConfigKey::CaptureUnitsize,
        datatype: DataType::UInt64,
        description: "Capture unit size",
        shortname: "capture_unitsize",
    },
    CapabilityInfo {
        key: ConfigKey::NumLogicProbes,
        datatype: DataType::UInt64,
        description: "Number of logic probes",
        shortname: "logic_probes",
    },
    CapabilityInfo {
        key: ConfigKey::NumAnalogProbes,
        datatype: DataType::UInt64,
        description: "Number of analog probes",
        shortname: "analog_probes",
    },
    CapabilityInfo {
        key: ConfigKey::LimitMsec,
        datatype: DataType::UInt64,
        description: "Time limit",
        shortname: "time",
    },
    CapabilityInfo {
        key: ConfigKey::LimitSamples,
        datatype: DataType::UInt64,
        description: "Sample limit",
        shortname: "limit_samples",
    },
    CapabilityInfo {
        key: ConfigKey::Continuous,
        datatype: DataType::Bool,
        description: "Continuous sampling",
        shortname: "continuous",
    },
];

/// Metadata for `key`, or `None` for keys that carry no value (device
/// classes, list queries).
pub fn lookup(key: ConfigKey) -> Option<&'static CapabilityInfo> {
    CAPABILITIES.iter().find(|info| info.key == key)
}

pub fn lookup_by_name(shortname: &str) -> Option<&'static CapabilityInfo> {
    CAPABILITIES.iter().find(|info| info.shortname == shortname)
}

pub fn all() -> &'static [CapabilityInfo] {
    CAPABILITIES
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_key_codes_are_unique() {
        let codes: HashSet<u32> = ConfigKey::ALL.iter().map(|k| k.code()).collect();
        assert_eq!(codes.len(), ConfigKey::ALL.len());
    }

    #[test]
    fn test_released_codes_are_stable() {
        assert_eq!(ConfigKey::Samplerate.code(), 30000);
        assert_eq!(ConfigKey::LimitSamples.code(), 50001);
        assert_eq!(ConfigKey::Conn.code(), 20000);
        assert_eq!(ConfigKey::from_code(40002), Some(ConfigKey::SessionFile));
        assert_eq!(ConfigKey::from_code(12345), None);
    }

    #[test]
    fn test_registry_entries_unique() {
        let keys: HashSet<ConfigKey> = all().iter().map(|info| info.key).collect();
        let names: HashSet<&str> = all().iter().map(|info| info.shortname).collect();
        assert_eq!(keys.len(), all().len());
        assert_eq!(names.len(), all().len());
    }

    #[test]
    fn test_lookup() {
        let info = lookup(ConfigKey::Samplerate).unwrap();
        assert_eq!(info.datatype, DataType::UInt64);
        assert_eq!(info.description, "Sample rate");
        assert_eq!(lookup_by_name("rle").unwrap().key, ConfigKey::Rle);
        assert!(lookup(ConfigKey::LogicAnalyzer).is_none());
        assert_eq!(ConfigKey::LimitSamples.to_string(), "limit_samples");
    }

    #[test]
    fn test_value_accessors() {
        assert_eq!(ConfigValue::from(5u64).as_u64().unwrap(), 5);
        assert!(ConfigValue::from(true).as_u64().is_err());
        assert_eq!(ConfigValue::from("sigrok").as_str().unwrap(), "sigrok");
        assert!(ConfigValue::from(7u64).is_of(DataType::UInt64));
        assert!(!ConfigValue::from(7u64).is_of(DataType::Bool));
    }
}
