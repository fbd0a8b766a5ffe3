//! Source configuration.
//!
//! A [`SourceConfig`] fully describes where samples come from and how the
//! front end should be tuned at open time. Its CBOR form is the payload
//! of discovery announces.

use std::{
    path::PathBuf,
    time::{
        Duration,
        SystemTime,
    },
};

use crate::{
    buffer::GrowBuf,
    cbor,
    strmap::StrMap,
};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SourceType {
    File,
    SoapySdr,
    Stdin,
    #[default]
    ToneGen,
    Remote,
}

impl SourceType {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "file" => Some(Self::File),
            "soapysdr" => Some(Self::SoapySdr),
            "stdin" => Some(Self::Stdin),
            "tonegen" => Some(Self::ToneGen),
            "remote" => Some(Self::Remote),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::File => "file",
            Self::SoapySdr => "soapysdr",
            Self::Stdin => "stdin",
            Self::ToneGen => "tonegen",
            Self::Remote => "remote",
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SampleFormat {
    #[default]
    Auto,
    RawF32,
    RawU8,
    RawS16,
    RawS8,
    Wav,
    SigMf,
}

impl SampleFormat {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "auto" => Some(Self::Auto),
            "raw" | "raw_f32" => Some(Self::RawF32),
            "raw_u8" => Some(Self::RawU8),
            "raw_s16" => Some(Self::RawS16),
            "raw_s8" => Some(Self::RawS8),
            "wav" => Some(Self::Wav),
            "sigmf" => Some(Self::SigMf),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::RawF32 => "raw_f32",
            Self::RawU8 => "raw_u8",
            Self::RawS16 => "raw_s16",
            Self::RawS8 => "raw_s8",
            Self::Wav => "wav",
            Self::SigMf => "sigmf",
        }
    }
}

/// One per-element gain setting requested at open time.
#[derive(Clone, Debug, PartialEq)]
pub struct GainEntry {
    pub name: String,
    pub value: f32,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SourceConfig {
    pub ty: SourceType,
    pub format: SampleFormat,
    pub label: Option<String>,
    pub path: Option<PathBuf>,

    pub freq: f64,
    pub lnb_freq: f64,
    pub bandwidth: f64,
    pub samp_rate: f64,
    pub average: u32,
    pub ppm: f64,
    pub channel: u32,

    pub start_time: SystemTime,

    pub iq_balance: bool,
    pub dc_remove: bool,
    pub loop_capture: bool,

    pub antenna: Option<String>,
    pub gains: Vec<GainEntry>,

    /// driver-specific keys (host, port, driver, serial, …)
    pub device_spec: StrMap,
    /// free-form source parameters (e.g. tonegen `signal` / `noise`)
    pub params: StrMap,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            ty: SourceType::default(),
            format: SampleFormat::default(),
            label: None,
            path: None,
            freq: 0.0,
            lnb_freq: 0.0,
            bandwidth: 0.0,
            samp_rate: 1e6,
            average: 1,
            ppm: 0.0,
            channel: 0,
            start_time: SystemTime::UNIX_EPOCH,
            iq_balance: false,
            dc_remove: false,
            loop_capture: false,
            antenna: None,
            gains: Vec::new(),
            device_spec: StrMap::new(),
            params: StrMap::new(),
        }
    }
}

impl SourceConfig {
    pub fn new(ty: SourceType) -> Self {
        Self {
            ty,
            ..Default::default()
        }
    }

    pub fn gain(&self, name: &str) -> Option<f32> {
        self.gains
            .iter()
            .find(|gain| gain.name == name)
            .map(|gain| gain.value)
    }

    pub fn set_gain(&mut self, name: &str, value: f32) {
        match self.gains.iter_mut().find(|gain| gain.name == name) {
            Some(gain) => gain.value = value,
            None => {
                self.gains.push(GainEntry {
                    name: name.to_owned(),
                    value,
                })
            }
        }
    }

    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key)
    }

    pub fn serialize(&self, buf: &mut GrowBuf) -> Result<(), cbor::Error> {
        cbor::pack_str(buf, self.ty.name())?;
        cbor::pack_str(buf, self.format.name())?;
        match &self.label {
            Some(label) => cbor::pack_str(buf, label)?,
            None => cbor::pack_null(buf)?,
        }
        match &self.path {
            Some(path) => cbor::pack_str(buf, &path.display().to_string())?,
            None => cbor::pack_null(buf)?,
        }

        cbor::pack_double(buf, self.freq)?;
        cbor::pack_double(buf, self.lnb_freq)?;
        cbor::pack_double(buf, self.bandwidth)?;
        cbor::pack_double(buf, self.samp_rate)?;
        cbor::pack_uint(buf, self.average as u64)?;
        cbor::pack_double(buf, self.ppm)?;
        cbor::pack_uint(buf, self.channel as u64)?;

        let start = self
            .start_time
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default();
        cbor::pack_uint(buf, start.as_secs())?;
        cbor::pack_uint(buf, start.subsec_micros() as u64)?;

        cbor::pack_bool(buf, self.iq_balance)?;
        cbor::pack_bool(buf, self.dc_remove)?;
        cbor::pack_bool(buf, self.loop_capture)?;

        match &self.antenna {
            Some(antenna) => cbor::pack_str(buf, antenna)?,
            None => cbor::pack_null(buf)?,
        }

        cbor::pack_map_start(buf, Some(self.gains.len() as u64))?;
        for gain in &self.gains {
            cbor::pack_str(buf, &gain.name)?;
            cbor::pack_float(buf, gain.value)?;
        }

        self.device_spec.serialize(buf)?;
        self.params.serialize(buf)?;
        Ok(())
    }

    pub fn deserialize(cursor: &mut &[u8]) -> Result<Self, cbor::Error> {
        let mut work = *cursor;

        let ty_name = cbor::unpack_str(&mut work)?;
        let format_name = cbor::unpack_str(&mut work)?;
        let ty = SourceType::from_name(&ty_name).ok_or(cbor::Error::MalformedInfo { info: 0 })?;
        let format =
            SampleFormat::from_name(&format_name).ok_or(cbor::Error::MalformedInfo { info: 0 })?;

        let label = if cbor::unpack_null(&mut work).is_ok() {
            None
        }
        else {
            Some(cbor::unpack_str(&mut work)?)
        };
        let path = if cbor::unpack_null(&mut work).is_ok() {
            None
        }
        else {
            Some(PathBuf::from(cbor::unpack_str(&mut work)?))
        };

        let freq = cbor::unpack_double(&mut work)?;
        let lnb_freq = cbor::unpack_double(&mut work)?;
        let bandwidth = cbor::unpack_double(&mut work)?;
        let samp_rate = cbor::unpack_double(&mut work)?;
        let average = cbor::unpack_uint(&mut work)? as u32;
        let ppm = cbor::unpack_double(&mut work)?;
        let channel = cbor::unpack_uint(&mut work)? as u32;

        let start_secs = cbor::unpack_uint(&mut work)?;
        let start_usec = cbor::unpack_uint(&mut work)?;
        let start_time =
            SystemTime::UNIX_EPOCH + Duration::new(start_secs, start_usec as u32 * 1000);

        let iq_balance = cbor::unpack_bool(&mut work)?;
        let dc_remove = cbor::unpack_bool(&mut work)?;
        let loop_capture = cbor::unpack_bool(&mut work)?;

        let antenna = if cbor::unpack_null(&mut work).is_ok() {
            None
        }
        else {
            Some(cbor::unpack_str(&mut work)?)
        };

        let gain_count = cbor::unpack_map_start(&mut work)?.unwrap_or(0);
        let mut gains = Vec::with_capacity(gain_count as usize);
        for _ in 0..gain_count {
            gains.push(GainEntry {
                name: cbor::unpack_str(&mut work)?,
                value: cbor::unpack_float(&mut work)?,
            });
        }

        let device_spec = StrMap::deserialize(&mut work)?;
        let params = StrMap::deserialize(&mut work)?;

        *cursor = work;
        Ok(Self {
            ty,
            format,
            label,
            path,
            freq,
            lnb_freq,
            bandwidth,
            samp_rate,
            average,
            ppm,
            channel,
            start_time,
            iq_balance,
            dc_remove,
            loop_capture,
            antenna,
            gains,
            device_spec,
            params,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cbor_round_trip() {
        let mut config = SourceConfig::new(SourceType::SoapySdr);
        config.label = Some("airspy @ rooftop".into());
        config.freq = 145.8e6;
        config.lnb_freq = 0.0;
        config.samp_rate = 2.5e6;
        config.antenna = Some("RX".into());
        config.set_gain("LNA", 18.0);
        config.set_gain("MIX", 10.0);
        config.device_spec.set("driver", "airspy");
        config.device_spec.set("host", "10.0.0.2");
        config.params.set("buffers", "8");

        let mut buf = GrowBuf::new();
        config.serialize(&mut buf).unwrap();
        let data = buf.finalize();
        let mut cursor = &data[..];
        let back = SourceConfig::deserialize(&mut cursor).unwrap();

        assert!(cursor.is_empty());
        assert_eq!(back, config);
    }

    #[test]
    fn set_gain_overwrites_existing_entry() {
        let mut config = SourceConfig::default();
        config.set_gain("IF", 10.0);
        config.set_gain("IF", 20.0);
        assert_eq!(config.gains.len(), 1);
        assert_eq!(config.gain("IF"), Some(20.0));
    }
}
