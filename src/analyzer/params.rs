//! Analyzer-wide parameters.

use std::time::Duration;

use crate::{
    buffer::GrowBuf,
    cbor,
    psd::{
        PsdParams,
        WindowFunction,
    },
};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AnalyzerMode {
    /// Inspect one channel of the source band.
    Channel,
    /// Sweep the whole source band.
    #[default]
    WideSpectrum,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AnalyzerParams {
    pub mode: AnalyzerMode,
    pub detector: PsdParams,
    /// minimum delay between PSD messages
    pub psd_update_interval: Duration,
    /// minimum delay between channel-list updates
    pub channel_update_interval: Duration,
}

impl Default for AnalyzerParams {
    fn default() -> Self {
        Self {
            mode: AnalyzerMode::WideSpectrum,
            detector: PsdParams::default(),
            psd_update_interval: Duration::from_millis(40),
            channel_update_interval: Duration::from_millis(500),
        }
    }
}

impl AnalyzerParams {
    pub fn serialize(&self, buf: &mut GrowBuf) -> Result<(), cbor::Error> {
        cbor::pack_uint(
            buf,
            match self.mode {
                AnalyzerMode::Channel => 0,
                AnalyzerMode::WideSpectrum => 1,
            },
        )?;
        cbor::pack_str(buf, self.detector.window.name())?;
        cbor::pack_uint(buf, self.detector.window_size as u64)?;
        cbor::pack_float(buf, self.detector.refresh_rate)?;
        cbor::pack_uint(buf, self.psd_update_interval.as_micros() as u64)?;
        cbor::pack_uint(buf, self.channel_update_interval.as_micros() as u64)?;
        Ok(())
    }

    pub fn deserialize(cursor: &mut &[u8]) -> Result<Self, cbor::Error> {
        let mut work = *cursor;

        let mode = match cbor::unpack_uint(&mut work)? {
            0 => AnalyzerMode::Channel,
            _ => AnalyzerMode::WideSpectrum,
        };
        let window_name = cbor::unpack_str(&mut work)?;
        let window_size = cbor::unpack_uint(&mut work)? as usize;
        let refresh_rate = cbor::unpack_float(&mut work)?;
        let psd_update_interval = Duration::from_micros(cbor::unpack_uint(&mut work)?);
        let channel_update_interval = Duration::from_micros(cbor::unpack_uint(&mut work)?);

        *cursor = work;
        Ok(Self {
            mode,
            detector: PsdParams {
                window: WindowFunction::from_name(&window_name).unwrap_or_default(),
                window_size,
                refresh_rate,
            },
            psd_update_interval,
            channel_update_interval,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serialize_round_trip() {
        let params = AnalyzerParams {
            mode: AnalyzerMode::Channel,
            detector: PsdParams {
                window: WindowFunction::FlatTop,
                window_size: 2048,
                refresh_rate: 30.0,
            },
            psd_update_interval: Duration::from_millis(33),
            channel_update_interval: Duration::from_secs(1),
        };

        let mut buf = GrowBuf::new();
        params.serialize(&mut buf).unwrap();
        let data = buf.finalize();
        let mut cursor = &data[..];
        assert_eq!(AnalyzerParams::deserialize(&mut cursor).unwrap(), params);
        assert!(cursor.is_empty());
    }
}
