//! Advisory source state snapshot and the access-control mask.

use std::time::{
    Duration,
    SystemTime,
};

use crate::{
    buffer::GrowBuf,
    cbor,
};

bitflags::bitflags! {
    /// Permission bits gating every mutating analyzer operation. A setter
    /// whose bit is cleared is silently dropped.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct Permissions: u64 {
        const HALT           = 1 << 0;
        const SET_FREQ       = 1 << 1;
        const SET_GAIN       = 1 << 2;
        const SET_ANTENNA    = 1 << 3;
        const SET_BW         = 1 << 4;
        const SET_PPM        = 1 << 5;
        const SET_DC_REMOVE  = 1 << 6;
        const SET_IQ_REVERSE = 1 << 7;
        const SET_AGC        = 1 << 8;
        const OPEN_AUDIO     = 1 << 9;
        const OPEN_RAW       = 1 << 10;
        const OPEN_INSPECTOR = 1 << 11;
        const SET_FFT_SIZE   = 1 << 12;
        const SET_FFT_FPS    = 1 << 13;
        const SET_FFT_WINDOW = 1 << 14;
        const SEEK           = 1 << 15;
        const THROTTLE       = 1 << 16;
        const SET_BB_FILTER  = 1 << 17;
    }
}

impl Permissions {
    /// Everything a seekable capture supports: no hardware controls.
    pub fn all_file() -> Self {
        Self::all()
            - (Self::SET_GAIN
                | Self::SET_ANTENNA
                | Self::SET_BW
                | Self::SET_PPM
                | Self::SET_AGC
                | Self::SET_FREQ)
    }

    /// Everything a live SDR supports: no seeking, no throttling.
    pub fn all_sdr() -> Self {
        Self::all() - (Self::SEEK | Self::THROTTLE)
    }

    /// The human-readable permission names used by the user database.
    pub const NAMES: &'static [(&'static str, Permissions)] = &[
        ("analyzer.halt", Permissions::HALT),
        ("source.frequency", Permissions::SET_FREQ),
        ("source.gain", Permissions::SET_GAIN),
        ("source.antenna", Permissions::SET_ANTENNA),
        ("source.bandwidth", Permissions::SET_BW),
        ("source.ppm", Permissions::SET_PPM),
        ("source.dc-remove", Permissions::SET_DC_REMOVE),
        ("source.iq-reverse", Permissions::SET_IQ_REVERSE),
        ("source.agc", Permissions::SET_AGC),
        ("inspector.open.audio", Permissions::OPEN_AUDIO),
        ("inspector.open.raw", Permissions::OPEN_RAW),
        ("inspector.open.inspector", Permissions::OPEN_INSPECTOR),
        ("fft.size", Permissions::SET_FFT_SIZE),
        ("fft.rate", Permissions::SET_FFT_FPS),
        ("fft.window", Permissions::SET_FFT_WINDOW),
        ("source.seek", Permissions::SEEK),
        ("source.throttle", Permissions::THROTTLE),
        ("inspector.bb-filter", Permissions::SET_BB_FILTER),
    ];
}

/// One configurable gain element.
#[derive(Clone, Debug, PartialEq)]
pub struct GainDesc {
    pub name: String,
    pub min: f32,
    pub max: f32,
    pub step: f32,
    pub value: f32,
}

impl GainDesc {
    pub fn flat(name: impl Into<String>, min: f32, max: f32, value: f32) -> Self {
        Self {
            name: name.into(),
            min,
            max,
            step: 1.0,
            value,
        }
    }
}

/// Observer position, when the source knows it.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Qth {
    pub lat: f64,
    pub lon: f64,
    pub elevation: f64,
}

/// Snapshot the source emits after initialization and after every
/// observable control change. Timestamps are monotonically non-decreasing
/// per source.
#[derive(Clone, Debug, PartialEq)]
pub struct SourceInfo {
    pub permissions: Permissions,

    pub source_samp_rate: f64,
    pub effective_samp_rate: f64,
    pub measured_samp_rate: f64,

    pub frequency: f64,
    pub freq_min: f64,
    pub freq_max: f64,
    pub lnb: f64,
    pub bandwidth: f64,
    pub ppm: f64,

    pub antennas: Vec<String>,
    pub antenna: Option<String>,
    pub gains: Vec<GainDesc>,

    pub dc_remove: bool,
    pub iq_reverse: bool,
    pub agc: bool,

    pub qth: Option<Qth>,

    /// whether the source runs against the wall clock
    pub realtime: bool,
    pub seekable: bool,
    pub source_time: SystemTime,
    pub source_start: SystemTime,
    pub source_end: Option<SystemTime>,
}

impl Default for SourceInfo {
    fn default() -> Self {
        Self {
            permissions: Permissions::empty(),
            source_samp_rate: 0.0,
            effective_samp_rate: 0.0,
            measured_samp_rate: 0.0,
            frequency: 0.0,
            freq_min: -3e11,
            freq_max: 3e11,
            lnb: 0.0,
            bandwidth: 0.0,
            ppm: 0.0,
            antennas: Vec::new(),
            antenna: None,
            gains: Vec::new(),
            dc_remove: false,
            iq_reverse: false,
            agc: false,
            qth: None,
            realtime: false,
            seekable: false,
            source_time: SystemTime::UNIX_EPOCH,
            source_start: SystemTime::UNIX_EPOCH,
            source_end: None,
        }
    }
}

fn pack_time(buf: &mut GrowBuf, time: SystemTime) -> Result<(), cbor::Error> {
    let elapsed = time
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default();
    cbor::pack_uint(buf, elapsed.as_secs())?;
    cbor::pack_uint(buf, elapsed.subsec_micros() as u64)?;
    Ok(())
}

fn unpack_time(cursor: &mut &[u8]) -> Result<SystemTime, cbor::Error> {
    let secs = cbor::unpack_uint(cursor)?;
    let usec = cbor::unpack_uint(cursor)?;
    Ok(SystemTime::UNIX_EPOCH + Duration::new(secs, usec as u32 * 1000))
}

impl SourceInfo {
    pub fn gain(&self, name: &str) -> Option<&GainDesc> {
        self.gains.iter().find(|gain| gain.name == name)
    }

    pub fn set_gain_value(&mut self, name: &str, value: f32) {
        if let Some(gain) = self.gains.iter_mut().find(|gain| gain.name == name) {
            gain.value = value;
        }
    }

    /// Advance `source_time`, never letting it go backwards.
    pub fn touch(&mut self, time: SystemTime) {
        if time > self.source_time {
            self.source_time = time;
        }
    }

    pub fn serialize(&self, buf: &mut GrowBuf) -> Result<(), cbor::Error> {
        cbor::pack_uint(buf, self.permissions.bits())?;
        cbor::pack_double(buf, self.source_samp_rate)?;
        cbor::pack_double(buf, self.effective_samp_rate)?;
        cbor::pack_double(buf, self.measured_samp_rate)?;
        cbor::pack_double(buf, self.frequency)?;
        cbor::pack_double(buf, self.freq_min)?;
        cbor::pack_double(buf, self.freq_max)?;
        cbor::pack_double(buf, self.lnb)?;
        cbor::pack_double(buf, self.bandwidth)?;
        cbor::pack_double(buf, self.ppm)?;

        cbor::pack_array_start(buf, Some(self.antennas.len() as u64))?;
        for antenna in &self.antennas {
            cbor::pack_str(buf, antenna)?;
        }
        match &self.antenna {
            Some(antenna) => cbor::pack_str(buf, antenna)?,
            None => cbor::pack_null(buf)?,
        }

        cbor::pack_array_start(buf, Some(self.gains.len() as u64))?;
        for gain in &self.gains {
            cbor::pack_str(buf, &gain.name)?;
            cbor::pack_float(buf, gain.min)?;
            cbor::pack_float(buf, gain.max)?;
            cbor::pack_float(buf, gain.step)?;
            cbor::pack_float(buf, gain.value)?;
        }

        cbor::pack_bool(buf, self.dc_remove)?;
        cbor::pack_bool(buf, self.iq_reverse)?;
        cbor::pack_bool(buf, self.agc)?;

        match &self.qth {
            Some(qth) => {
                cbor::pack_bool(buf, true)?;
                cbor::pack_double(buf, qth.lat)?;
                cbor::pack_double(buf, qth.lon)?;
                cbor::pack_double(buf, qth.elevation)?;
            }
            None => cbor::pack_bool(buf, false)?,
        }

        cbor::pack_bool(buf, self.realtime)?;
        cbor::pack_bool(buf, self.seekable)?;
        pack_time(buf, self.source_time)?;
        pack_time(buf, self.source_start)?;
        match self.source_end {
            Some(end) => {
                cbor::pack_bool(buf, true)?;
                pack_time(buf, end)?;
            }
            None => cbor::pack_bool(buf, false)?,
        }

        Ok(())
    }

    pub fn deserialize(cursor: &mut &[u8]) -> Result<Self, cbor::Error> {
        let mut work = *cursor;

        let permissions = Permissions::from_bits_truncate(cbor::unpack_uint(&mut work)?);
        let source_samp_rate = cbor::unpack_double(&mut work)?;
        let effective_samp_rate = cbor::unpack_double(&mut work)?;
        let measured_samp_rate = cbor::unpack_double(&mut work)?;
        let frequency = cbor::unpack_double(&mut work)?;
        let freq_min = cbor::unpack_double(&mut work)?;
        let freq_max = cbor::unpack_double(&mut work)?;
        let lnb = cbor::unpack_double(&mut work)?;
        let bandwidth = cbor::unpack_double(&mut work)?;
        let ppm = cbor::unpack_double(&mut work)?;

        let antenna_count = cbor::unpack_array_start(&mut work)?.unwrap_or(0);
        let mut antennas = Vec::with_capacity(antenna_count as usize);
        for _ in 0..antenna_count {
            antennas.push(cbor::unpack_str(&mut work)?);
        }
        let antenna = if cbor::unpack_null(&mut work).is_ok() {
            None
        }
        else {
            Some(cbor::unpack_str(&mut work)?)
        };

        let gain_count = cbor::unpack_array_start(&mut work)?.unwrap_or(0);
        let mut gains = Vec::with_capacity(gain_count as usize);
        for _ in 0..gain_count {
            gains.push(GainDesc {
                name: cbor::unpack_str(&mut work)?,
                min: cbor::unpack_float(&mut work)?,
                max: cbor::unpack_float(&mut work)?,
                step: cbor::unpack_float(&mut work)?,
                value: cbor::unpack_float(&mut work)?,
            });
        }

        let dc_remove = cbor::unpack_bool(&mut work)?;
        let iq_reverse = cbor::unpack_bool(&mut work)?;
        let agc = cbor::unpack_bool(&mut work)?;

        let qth = if cbor::unpack_bool(&mut work)? {
            Some(Qth {
                lat: cbor::unpack_double(&mut work)?,
                lon: cbor::unpack_double(&mut work)?,
                elevation: cbor::unpack_double(&mut work)?,
            })
        }
        else {
            None
        };

        let realtime = cbor::unpack_bool(&mut work)?;
        let seekable = cbor::unpack_bool(&mut work)?;
        let source_time = unpack_time(&mut work)?;
        let source_start = unpack_time(&mut work)?;
        let source_end = if cbor::unpack_bool(&mut work)? {
            Some(unpack_time(&mut work)?)
        }
        else {
            None
        };

        *cursor = work;
        Ok(Self {
            permissions,
            source_samp_rate,
            effective_samp_rate,
            measured_samp_rate,
            frequency,
            freq_min,
            freq_max,
            lnb,
            bandwidth,
            ppm,
            antennas,
            antenna,
            gains,
            dc_remove,
            iq_reverse,
            agc,
            qth,
            realtime,
            seekable,
            source_time,
            source_start,
            source_end,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_permissions_exclude_hardware_controls() {
        let permissions = Permissions::all_file();
        assert!(permissions.contains(Permissions::SEEK));
        assert!(!permissions.contains(Permissions::SET_FREQ));
        assert!(!permissions.contains(Permissions::SET_GAIN));
    }

    #[test]
    fn sdr_permissions_exclude_seek() {
        let permissions = Permissions::all_sdr();
        assert!(permissions.contains(Permissions::SET_FREQ));
        assert!(!permissions.contains(Permissions::SEEK));
        assert!(!permissions.contains(Permissions::THROTTLE));
    }

    #[test]
    fn touch_never_goes_backwards() {
        let mut info = SourceInfo::default();
        let later = SystemTime::UNIX_EPOCH + Duration::from_secs(100);
        let earlier = SystemTime::UNIX_EPOCH + Duration::from_secs(50);
        info.touch(later);
        info.touch(earlier);
        assert_eq!(info.source_time, later);
    }

    #[test]
    fn serialize_round_trip() {
        let mut info = SourceInfo {
            permissions: Permissions::all_sdr(),
            source_samp_rate: 2.4e6,
            effective_samp_rate: 2.4e6,
            measured_samp_rate: 2.399e6,
            frequency: 433.92e6,
            bandwidth: 2e6,
            antennas: vec!["RX".into(), "TX/RX".into()],
            antenna: Some("RX".into()),
            realtime: true,
            ..Default::default()
        };
        info.gains.push(GainDesc::flat("LNA", 0.0, 40.0, 24.0));

        let mut buf = GrowBuf::new();
        info.serialize(&mut buf).unwrap();
        let data = buf.finalize();
        let mut cursor = &data[..];
        let back = SourceInfo::deserialize(&mut cursor).unwrap();

        assert!(cursor.is_empty());
        assert_eq!(back, info);
    }
}
