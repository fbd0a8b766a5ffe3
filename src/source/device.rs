//! Device specifications and discovered-device properties.

use std::hash::{
    Hash,
    Hasher,
};

use crate::{
    source::config::SourceConfig,
    strmap::StrMap,
};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DeviceAccess {
    #[default]
    Local,
    Remote,
}

/// Identifies a device: which analyzer interface talks to it, plus the
/// driver parameters needed to open it. Two specs are equal iff they
/// share the interface tag and the same parameter multiset.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeviceSpec {
    pub access: DeviceAccess,
    /// analyzer interface tag, e.g. `soapysdr` or `remote`
    pub interface: String,
    pub params: StrMap,
}

impl DeviceSpec {
    pub fn new(access: DeviceAccess, interface: impl Into<String>) -> Self {
        Self {
            access,
            interface: interface.into(),
            params: StrMap::new(),
        }
    }

    /// 64-bit identity derived from the interface tag and the sorted
    /// parameter list. Stable across processes.
    pub fn uuid(&self) -> u64 {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        self.interface.hash(&mut hasher);
        for (key, value) in self.params.iter() {
            key.hash(&mut hasher);
            value.hash(&mut hasher);
        }
        hasher.finish()
    }
}

/// A device harvested by discovery or enumeration.
#[derive(Clone, Debug, PartialEq)]
pub struct DeviceProperties {
    pub label: String,
    pub spec: DeviceSpec,
    pub uuid: u64,

    pub antennas: Vec<String>,
    pub gain_names: Vec<String>,
    pub samp_rates: Vec<f64>,

    /// the announced profile, for remote devices
    pub config: Option<SourceConfig>,
}

impl DeviceProperties {
    pub fn from_spec(label: impl Into<String>, spec: DeviceSpec) -> Self {
        let uuid = spec.uuid();
        Self {
            label: label.into(),
            spec,
            uuid,
            antennas: Vec::new(),
            gain_names: Vec::new(),
            samp_rates: Vec::new(),
            config: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uuid_depends_on_interface_and_params() {
        let mut a = DeviceSpec::new(DeviceAccess::Local, "soapysdr");
        a.params.set("driver", "rtlsdr");
        a.params.set("serial", "0001");

        let mut b = a.clone();
        assert_eq!(a.uuid(), b.uuid());

        b.params.set("serial", "0002");
        assert_ne!(a.uuid(), b.uuid());

        let c = DeviceSpec::new(DeviceAccess::Local, "other");
        assert_ne!(a.uuid(), c.uuid());
    }

    #[test]
    fn uuid_ignores_param_insertion_order() {
        let mut a = DeviceSpec::new(DeviceAccess::Remote, "remote");
        a.params.set("host", "10.0.0.1");
        a.params.set("port", "28001");

        let mut b = DeviceSpec::new(DeviceAccess::Remote, "remote");
        b.params.set("port", "28001");
        b.params.set("host", "10.0.0.1");

        assert_eq!(a.uuid(), b.uuid());
    }
}
