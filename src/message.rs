//! Analyzer messages.
//!
//! Everything an analyzer tells its client, and everything a client asks
//! of an analyzer, travels as a [`Message`]. Each variant owns its
//! payload; handing a message to a queue or a peer transfers ownership,
//! and disposal is `Drop`.
//!
//! The CBOR serializers here are the tag-specific payload codecs used by
//! the remote `MESSAGE` call and the multicast fan-out.

use std::time::{
    Duration,
    SystemTime,
};

use num_complex::Complex;

use crate::{
    analyzer::params::AnalyzerParams,
    buffer::GrowBuf,
    cbor,
    config::Config,
    inspector::{
        ChannelSpec,
        InspectorClass,
    },
    source::info::SourceInfo,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum MessageKind {
    SourceInfo = 0,
    SourceInit = 1,
    Channel = 2,
    Eos = 3,
    ReadError = 4,
    Internal = 5,
    SamplesLost = 6,
    Inspector = 7,
    Psd = 8,
    Samples = 9,
    Throttle = 10,
    Params = 11,
    GetParams = 12,
    Seek = 13,
    Halt = 14,
    Generic = 15,
}

impl MessageKind {
    pub fn from_u32(value: u32) -> Option<Self> {
        Some(match value {
            0 => Self::SourceInfo,
            1 => Self::SourceInit,
            2 => Self::Channel,
            3 => Self::Eos,
            4 => Self::ReadError,
            5 => Self::Internal,
            6 => Self::SamplesLost,
            7 => Self::Inspector,
            8 => Self::Psd,
            9 => Self::Samples,
            10 => Self::Throttle,
            11 => Self::Params,
            12 => Self::GetParams,
            13 => Self::Seek,
            14 => Self::Halt,
            15 => Self::Generic,
            _ => return None,
        })
    }
}

/// One PSD frame over the wideband channel (`inspector_id == 0`) or an
/// inspector's baseband.
#[derive(Clone, derive_more::Debug, PartialEq)]
pub struct PsdMessage {
    pub inspector_id: u32,
    /// center frequency in Hz
    pub fc: i64,
    pub samp_rate: u32,
    pub measured_samp_rate: f32,
    /// capture timestamp
    pub timestamp: SystemTime,
    /// wall-clock timestamp
    pub rt_time: SystemTime,
    /// true exactly once after a finite capture restarted
    pub looped: bool,
    #[debug(skip)]
    pub psd: Vec<f32>,
}

#[derive(Clone, derive_more::Debug, PartialEq)]
pub struct SampleBatch {
    pub handle: u32,
    #[debug(skip)]
    pub samples: Vec<Complex<f32>>,
}

/// Detected wideband channel, advisory.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ChannelInfo {
    pub fc: f64,
    pub bandwidth: f64,
    pub snr: f32,
}

/// Status payload shared by EOS / READ_ERROR / INTERNAL.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StatusMessage {
    pub code: i32,
    pub message: Option<String>,
}

impl StatusMessage {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: Some(message.into()),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct InspectorMessage {
    /// echoed back so clients can correlate replies with requests
    pub request_id: u32,
    pub handle: u32,
    pub kind: InspectorMessageKind,
}

#[derive(Clone, Debug, PartialEq)]
pub enum InspectorMessageKind {
    /// client → analyzer: open an inspector over a sub-band
    Open {
        class: InspectorClass,
        channel: ChannelSpec,
        parent: Option<u32>,
    },
    /// analyzer → client: the handle and achieved parameters
    Opened {
        fc: f64,
        bandwidth: f64,
        equiv_fs: f64,
        decimation: u32,
        config: Config,
    },
    Close,
    Closed,
    SetConfig(Config),
    ConfigSet(Config),
    WrongHandle,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    SourceInfo(SourceInfo),
    SourceInit,
    Channel(Vec<ChannelInfo>),
    Eos(StatusMessage),
    ReadError(StatusMessage),
    Internal(StatusMessage),
    SamplesLost(u64),
    Inspector(InspectorMessage),
    Psd(PsdMessage),
    Samples(SampleBatch),
    Throttle { samp_rate: f64 },
    Params(AnalyzerParams),
    GetParams,
    /// seek a time-indexed capture, relative to its start
    Seek(Duration),
    Halt,
    Generic(String),
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::SourceInfo(_) => MessageKind::SourceInfo,
            Self::SourceInit => MessageKind::SourceInit,
            Self::Channel(_) => MessageKind::Channel,
            Self::Eos(_) => MessageKind::Eos,
            Self::ReadError(_) => MessageKind::ReadError,
            Self::Internal(_) => MessageKind::Internal,
            Self::SamplesLost(_) => MessageKind::SamplesLost,
            Self::Inspector(_) => MessageKind::Inspector,
            Self::Psd(_) => MessageKind::Psd,
            Self::Samples(_) => MessageKind::Samples,
            Self::Throttle { .. } => MessageKind::Throttle,
            Self::Params(_) => MessageKind::Params,
            Self::GetParams => MessageKind::GetParams,
            Self::Seek(_) => MessageKind::Seek,
            Self::Halt => MessageKind::Halt,
            Self::Generic(_) => MessageKind::Generic,
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

fn pack_status(buf: &mut GrowBuf, status: &StatusMessage) -> Result<(), cbor::Error> {
    cbor::pack_int(buf, status.code as i64)?;
    match &status.message {
        Some(message) => cbor::pack_str(buf, message)?,
        None => cbor::pack_null(buf)?,
    }
    Ok(())
}

fn unpack_status(cursor: &mut &[u8]) -> Result<StatusMessage, cbor::Error> {
    let code = cbor::unpack_int(cursor)? as i32;
    let message = if cbor::unpack_null(cursor).is_ok() {
        None
    }
    else {
        Some(cbor::unpack_str(cursor)?)
    };
    Ok(StatusMessage { code, message })
}

fn pack_config_opt(buf: &mut GrowBuf, config: &Config) -> Result<(), cbor::Error> {
    config.serialize(buf)
}

impl Message {
    /// Serialize the payload with the tag-specific serializer. The tag
    /// itself is carried by the enclosing call or superframe.
    pub fn serialize(&self, buf: &mut GrowBuf) -> Result<(), cbor::Error> {
        match self {
            Self::SourceInfo(info) => info.serialize(buf)?,
            Self::SourceInit => {}
            Self::Channel(channels) => {
                cbor::pack_array_start(buf, Some(channels.len() as u64))?;
                for channel in channels {
                    cbor::pack_double(buf, channel.fc)?;
                    cbor::pack_double(buf, channel.bandwidth)?;
                    cbor::pack_float(buf, channel.snr)?;
                }
            }
            Self::Eos(status) | Self::ReadError(status) | Self::Internal(status) => {
                pack_status(buf, status)?
            }
            Self::SamplesLost(count) => cbor::pack_uint(buf, *count)?,
            Self::Inspector(inspector) => inspector.serialize(buf)?,
            Self::Psd(psd) => {
                cbor::pack_uint(buf, psd.inspector_id as u64)?;
                cbor::pack_int(buf, psd.fc)?;
                cbor::pack_uint(buf, psd.samp_rate as u64)?;
                cbor::pack_float(buf, psd.measured_samp_rate)?;
                pack_time(buf, psd.timestamp)?;
                pack_time(buf, psd.rt_time)?;
                cbor::pack_bool(buf, psd.looped)?;
                cbor::pack_array_start(buf, Some(psd.psd.len() as u64))?;
                for bin in &psd.psd {
                    cbor::pack_float(buf, *bin)?;
                }
            }
            Self::Samples(batch) => {
                cbor::pack_uint(buf, batch.handle as u64)?;
                cbor::pack_array_start(buf, Some(batch.samples.len() as u64 * 2))?;
                for sample in &batch.samples {
                    cbor::pack_float(buf, sample.re)?;
                    cbor::pack_float(buf, sample.im)?;
                }
            }
            Self::Throttle { samp_rate } => cbor::pack_double(buf, *samp_rate)?,
            Self::Params(params) => params.serialize(buf)?,
            Self::GetParams => {}
            Self::Seek(position) => {
                cbor::pack_uint(buf, position.as_secs())?;
                cbor::pack_uint(buf, position.subsec_micros() as u64)?;
            }
            Self::Halt => {}
            Self::Generic(text) => cbor::pack_str(buf, text)?,
        }
        Ok(())
    }

    pub fn deserialize(kind: MessageKind, cursor: &mut &[u8]) -> Result<Self, cbor::Error> {
        let mut work = *cursor;

        let message = match kind {
            MessageKind::SourceInfo => Self::SourceInfo(SourceInfo::deserialize(&mut work)?),
            MessageKind::SourceInit => Self::SourceInit,
            MessageKind::Channel => {
                let count = cbor::unpack_array_start(&mut work)?.unwrap_or(0);
                let mut channels = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    channels.push(ChannelInfo {
                        fc: cbor::unpack_double(&mut work)?,
                        bandwidth: cbor::unpack_double(&mut work)?,
                        snr: cbor::unpack_float(&mut work)?,
                    });
                }
                Self::Channel(channels)
            }
            MessageKind::Eos => Self::Eos(unpack_status(&mut work)?),
            MessageKind::ReadError => Self::ReadError(unpack_status(&mut work)?),
            MessageKind::Internal => Self::Internal(unpack_status(&mut work)?),
            MessageKind::SamplesLost => Self::SamplesLost(cbor::unpack_uint(&mut work)?),
            MessageKind::Inspector => Self::Inspector(InspectorMessage::deserialize(&mut work)?),
            MessageKind::Psd => {
                let inspector_id = cbor::unpack_uint(&mut work)? as u32;
                let fc = cbor::unpack_int(&mut work)?;
                let samp_rate = cbor::unpack_uint(&mut work)? as u32;
                let measured_samp_rate = cbor::unpack_float(&mut work)?;
                let timestamp = unpack_time(&mut work)?;
                let rt_time = unpack_time(&mut work)?;
                let looped = cbor::unpack_bool(&mut work)?;
                let count = cbor::unpack_array_start(&mut work)?.unwrap_or(0);
                let mut psd = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    psd.push(cbor::unpack_float(&mut work)?);
                }
                Self::Psd(PsdMessage {
                    inspector_id,
                    fc,
                    samp_rate,
                    measured_samp_rate,
                    timestamp,
                    rt_time,
                    looped,
                    psd,
                })
            }
            MessageKind::Samples => {
                let handle = cbor::unpack_uint(&mut work)? as u32;
                let count = cbor::unpack_array_start(&mut work)?.unwrap_or(0) / 2;
                let mut samples = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    let re = cbor::unpack_float(&mut work)?;
                    let im = cbor::unpack_float(&mut work)?;
                    samples.push(Complex::new(re, im));
                }
                Self::Samples(SampleBatch { handle, samples })
            }
            MessageKind::Throttle => {
                Self::Throttle {
                    samp_rate: cbor::unpack_double(&mut work)?,
                }
            }
            MessageKind::Params => Self::Params(AnalyzerParams::deserialize(&mut work)?),
            MessageKind::GetParams => Self::GetParams,
            MessageKind::Seek => {
                let secs = cbor::unpack_uint(&mut work)?;
                let usec = cbor::unpack_uint(&mut work)?;
                Self::Seek(Duration::new(secs, usec as u32 * 1000))
            }
            MessageKind::Halt => Self::Halt,
            MessageKind::Generic => Self::Generic(cbor::unpack_str(&mut work)?),
        };

        *cursor = work;
        Ok(message)
    }
}

impl InspectorMessage {
    fn kind_tag(&self) -> u64 {
        match &self.kind {
            InspectorMessageKind::Open { .. } => 0,
            InspectorMessageKind::Opened { .. } => 1,
            InspectorMessageKind::Close => 2,
            InspectorMessageKind::Closed => 3,
            InspectorMessageKind::SetConfig(_) => 4,
            InspectorMessageKind::ConfigSet(_) => 5,
            InspectorMessageKind::WrongHandle => 6,
        }
    }

    pub fn serialize(&self, buf: &mut GrowBuf) -> Result<(), cbor::Error> {
        cbor::pack_uint(buf, self.kind_tag())?;
        cbor::pack_uint(buf, self.request_id as u64)?;
        cbor::pack_uint(buf, self.handle as u64)?;

        match &self.kind {
            InspectorMessageKind::Open {
                class,
                channel,
                parent,
            } => {
                cbor::pack_str(buf, class.name())?;
                cbor::pack_double(buf, channel.fc)?;
                cbor::pack_double(buf, channel.lo)?;
                cbor::pack_double(buf, channel.hi)?;
                match parent {
                    Some(parent) => cbor::pack_uint(buf, *parent as u64)?,
                    None => cbor::pack_null(buf)?,
                }
            }
            InspectorMessageKind::Opened {
                fc,
                bandwidth,
                equiv_fs,
                decimation,
                config,
            } => {
                cbor::pack_double(buf, *fc)?;
                cbor::pack_double(buf, *bandwidth)?;
                cbor::pack_double(buf, *equiv_fs)?;
                cbor::pack_uint(buf, *decimation as u64)?;
                pack_config_opt(buf, config)?;
            }
            InspectorMessageKind::Close
            | InspectorMessageKind::Closed
            | InspectorMessageKind::WrongHandle => {}
            InspectorMessageKind::SetConfig(config) | InspectorMessageKind::ConfigSet(config) => {
                pack_config_opt(buf, config)?
            }
        }

        Ok(())
    }

    pub fn deserialize(cursor: &mut &[u8]) -> Result<Self, cbor::Error> {
        let mut work = *cursor;

        let tag = cbor::unpack_uint(&mut work)?;
        let request_id = cbor::unpack_uint(&mut work)? as u32;
        let handle = cbor::unpack_uint(&mut work)? as u32;

        let kind = match tag {
            0 => {
                let class_name = cbor::unpack_str(&mut work)?;
                let class = InspectorClass::from_name(&class_name)
                    .ok_or(cbor::Error::MalformedInfo { info: 0 })?;
                let fc = cbor::unpack_double(&mut work)?;
                let lo = cbor::unpack_double(&mut work)?;
                let hi = cbor::unpack_double(&mut work)?;
                let parent = if cbor::unpack_null(&mut work).is_ok() {
                    None
                }
                else {
                    Some(cbor::unpack_uint(&mut work)? as u32)
                };
                InspectorMessageKind::Open {
                    class,
                    channel: ChannelSpec { fc, lo, hi },
                    parent,
                }
            }
            1 => {
                InspectorMessageKind::Opened {
                    fc: cbor::unpack_double(&mut work)?,
                    bandwidth: cbor::unpack_double(&mut work)?,
                    equiv_fs: cbor::unpack_double(&mut work)?,
                    decimation: cbor::unpack_uint(&mut work)? as u32,
                    config: Config::deserialize(&mut work)?,
                }
            }
            2 => InspectorMessageKind::Close,
            3 => InspectorMessageKind::Closed,
            4 => InspectorMessageKind::SetConfig(Config::deserialize(&mut work)?),
            5 => InspectorMessageKind::ConfigSet(Config::deserialize(&mut work)?),
            6 => InspectorMessageKind::WrongHandle,
            _ => return Err(cbor::Error::MalformedInfo { info: tag as u8 }),
        };

        *cursor = work;
        Ok(Self {
            request_id,
            handle,
            kind,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(message: Message) {
        let kind = message.kind();
        let mut buf = GrowBuf::new();
        message.serialize(&mut buf).unwrap();
        let data = buf.finalize();
        let mut cursor = &data[..];
        let back = Message::deserialize(kind, &mut cursor).unwrap();
        assert!(cursor.is_empty());
        assert_eq!(back, message);
    }

    #[test]
    fn psd_round_trip() {
        round_trip(Message::Psd(PsdMessage {
            inspector_id: 0,
            fc: 100_000_000,
            samp_rate: 1_000_000,
            measured_samp_rate: 999_873.5,
            timestamp: SystemTime::UNIX_EPOCH + Duration::from_micros(5_000_123),
            rt_time: SystemTime::UNIX_EPOCH + Duration::from_micros(7_200_456),
            looped: true,
            psd: (0..64).map(|i| i as f32 * 0.25).collect(),
        }));
    }

    #[test]
    fn inspector_open_round_trip() {
        round_trip(Message::Inspector(InspectorMessage {
            request_id: 0xc1009,
            handle: 0,
            kind: InspectorMessageKind::Open {
                class: InspectorClass::Audio,
                channel: ChannelSpec {
                    fc: 0.0,
                    lo: -5000.0,
                    hi: 5000.0,
                },
                parent: None,
            },
        }));
    }

    #[test]
    fn status_and_trivial_round_trips() {
        round_trip(Message::Eos(StatusMessage::new(0, "end of stream")));
        round_trip(Message::ReadError(StatusMessage {
            code: -5,
            message: None,
        }));
        round_trip(Message::SamplesLost(4096));
        round_trip(Message::SourceInit);
        round_trip(Message::Halt);
        round_trip(Message::Seek(Duration::from_micros(1_500_000)));
        round_trip(Message::Throttle { samp_rate: 250e3 });
        round_trip(Message::Generic("hello".into()));
    }

    #[test]
    fn samples_round_trip() {
        round_trip(Message::Samples(SampleBatch {
            handle: 7,
            samples: vec![Complex::new(0.5, -0.25), Complex::new(-1.0, 0.125)],
        }));
    }

    #[test]
    fn kind_tags_are_stable() {
        assert_eq!(MessageKind::SourceInfo as u32, 0);
        assert_eq!(MessageKind::Psd as u32, 8);
        assert_eq!(MessageKind::Generic as u32, 15);
        for value in 0..16 {
            assert_eq!(MessageKind::from_u32(value).map(|kind| kind as u32), Some(value));
        }
        assert_eq!(MessageKind::from_u32(16), None);
    }
}
