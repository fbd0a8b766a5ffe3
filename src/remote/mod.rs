//! Wire framing for remote analyzers.
//!
//! Everything on the wire, TCP sessions and UDP multicast alike, is a
//! stream of *fragments*: a 16-byte magic-tagged header plus at most
//! MTU − 16 payload bytes. One or more fragments reassemble into a
//! *superframe*, identified by `sf_id`; a receiver drops a partial
//! reassembly the moment the id changes.

pub mod call;
pub mod client;

use bytes::{
    Buf,
    BufMut,
    Bytes,
    BytesMut,
};
use tokio::io::{
    AsyncRead,
    AsyncReadExt,
    AsyncWrite,
    AsyncWriteExt,
};

use crate::message::PsdMessage;

/// Magic value opening every fragment.
pub const MAGIC: &[u8; 4] = b"SSF0";

/// Fragment header length in bytes: magic, type, id, size, sf_size,
/// sf_offset.
pub const HEADER_LENGTH: usize = 16;

/// Default fragment budget: Ethernet payload minus IP/UDP headers.
pub const DEFAULT_MTU: usize = 1472;

/// Remote protocol version, checked during HELLO.
pub const PROTOCOL_VERSION_MAJOR: u8 = 0;
pub const PROTOCOL_VERSION_MINOR: u8 = 3;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("bad fragment magic {0:02x?}")]
    BadMagic([u8; 4]),
    #[error("unknown superframe type {0}")]
    UnknownSuperframeType(u8),
    #[error("fragment of {size} bytes exceeds the {mtu}-byte MTU")]
    FragmentTooLarge { size: usize, mtu: usize },
    #[error("fragment outside its superframe: offset {offset} + {size} > {sf_size}")]
    ReassemblyOverflow {
        offset: usize,
        size: usize,
        sf_size: usize,
    },
    #[error("cbor: {0}")]
    Cbor(#[from] crate::cbor::Error),
    #[error("unknown remote call type {0}")]
    UnknownCallType(u64),
    #[error("unknown method {0:?}")]
    UnknownMethod(String),
    #[error("malformed call arguments for {0:?}")]
    BadArguments(&'static str),
    #[error("truncated PSD superframe")]
    TruncatedPsd,
    #[error("peer speaks protocol {major}.{minor}")]
    VersionMismatch { major: u8, minor: u8 },
    #[error("connection closed")]
    ConnectionClosed,
    #[error("authentication rejected by server")]
    AuthRejected,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum SuperframeType {
    Announce = 0,
    Psd = 1,
    Encap = 2,
}

impl SuperframeType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Announce),
            1 => Some(Self::Psd),
            2 => Some(Self::Encap),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FragmentHeader {
    pub sf_type: SuperframeType,
    pub sf_id: u8,
    /// payload bytes in this fragment
    pub size: u16,
    /// total superframe length in bytes
    pub sf_size: u32,
    /// payload offset of this fragment within the superframe
    pub sf_offset: u32,
}

impl FragmentHeader {
    pub fn encode<B: BufMut>(&self, mut buffer: B) {
        buffer.put_slice(MAGIC);
        buffer.put_u8(self.sf_type as u8);
        buffer.put_u8(self.sf_id);
        buffer.put_u16(self.size);
        buffer.put_u32(self.sf_size);
        buffer.put_u32(self.sf_offset);
    }

    pub fn decode<B: Buf>(mut buffer: B) -> Result<Self, Error> {
        let mut magic = [0u8; 4];
        buffer.copy_to_slice(&mut magic);
        if &magic != MAGIC {
            return Err(Error::BadMagic(magic));
        }

        let raw_type = buffer.get_u8();
        let sf_type =
            SuperframeType::from_u8(raw_type).ok_or(Error::UnknownSuperframeType(raw_type))?;
        let sf_id = buffer.get_u8();
        let size = buffer.get_u16();
        let sf_size = buffer.get_u32();
        let sf_offset = buffer.get_u32();

        Ok(Self {
            sf_type,
            sf_id,
            size,
            sf_size,
            sf_offset,
        })
    }
}

/// Read exactly one fragment from a stream socket: the 16-byte header,
/// then exactly `size` payload bytes.
pub async fn read_fragment<R: AsyncRead + Unpin>(
    mut reader: R,
) -> Result<(FragmentHeader, Bytes), Error> {
    let mut header_raw = [0u8; HEADER_LENGTH];
    reader.read_exact(&mut header_raw).await?;
    let header = FragmentHeader::decode(&header_raw[..])?;

    let mut payload = vec![0u8; header.size as usize];
    reader.read_exact(&mut payload).await?;

    Ok((header, payload.into()))
}

pub async fn write_fragment<W: AsyncWrite + Unpin>(
    mut writer: W,
    fragment: &Bytes,
) -> Result<(), Error> {
    writer.write_all(fragment).await?;
    Ok(())
}

/// Split a superframe payload into ready-to-send fragments of at most
/// `mtu` bytes each. Offsets tile `[0, len)` in increasing order.
pub fn split_superframe(
    sf_type: SuperframeType,
    sf_id: u8,
    payload: &[u8],
    mtu: usize,
) -> Vec<Bytes> {
    let usable = mtu.saturating_sub(HEADER_LENGTH).max(1);
    let sf_size = payload.len() as u32;

    if payload.is_empty() {
        // announce-style superframes carry no payload but still frame
        let mut fragment = BytesMut::with_capacity(HEADER_LENGTH);
        FragmentHeader {
            sf_type,
            sf_id,
            size: 0,
            sf_size: 0,
            sf_offset: 0,
        }
        .encode(&mut fragment);
        return vec![fragment.freeze()];
    }

    payload
        .chunks(usable)
        .enumerate()
        .map(|(index, chunk)| {
            let mut fragment = BytesMut::with_capacity(HEADER_LENGTH + chunk.len());
            FragmentHeader {
                sf_type,
                sf_id,
                size: chunk.len() as u16,
                sf_size,
                sf_offset: (index * usable) as u32,
            }
            .encode(&mut fragment);
            fragment.put_slice(chunk);
            fragment.freeze()
        })
        .collect()
}

/// A complete superframe.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Superframe {
    pub sf_type: SuperframeType,
    pub sf_id: u8,
    pub payload: Vec<u8>,
}

/// Reassembles fragments into superframes. A change of `sf_id` discards
/// any partial reassembly in flight.
#[derive(Debug, Default)]
pub struct Reassembler {
    current: Option<Partial>,
}

#[derive(Debug)]
struct Partial {
    sf_type: SuperframeType,
    sf_id: u8,
    payload: Vec<u8>,
    received: usize,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(
        &mut self,
        header: FragmentHeader,
        payload: &[u8],
    ) -> Result<Option<Superframe>, Error> {
        if header.sf_type == SuperframeType::Announce {
            return Ok(Some(Superframe {
                sf_type: header.sf_type,
                sf_id: header.sf_id,
                payload: payload.to_vec(),
            }));
        }

        let stale = self
            .current
            .as_ref()
            .is_some_and(|partial| partial.sf_id != header.sf_id);
        if stale {
            tracing::debug!("superframe id advanced; dropping partial reassembly");
            self.current = None;
        }

        let partial = self.current.get_or_insert_with(|| {
            Partial {
                sf_type: header.sf_type,
                sf_id: header.sf_id,
                payload: vec![0; header.sf_size as usize],
                received: 0,
            }
        });

        let offset = header.sf_offset as usize;
        let size = payload.len();
        let sf_size = header.sf_size as usize;
        if partial.payload.len() != sf_size || offset + size > sf_size {
            let error = Error::ReassemblyOverflow {
                offset,
                size,
                sf_size,
            };
            self.current = None;
            return Err(error);
        }

        partial.payload[offset..offset + size].copy_from_slice(payload);
        partial.received += size;

        if partial.received >= sf_size {
            let partial = self.current.take().expect("partial was just filled");
            return Ok(Some(Superframe {
                sf_type: partial.sf_type,
                sf_id: partial.sf_id,
                payload: partial.payload,
            }));
        }

        Ok(None)
    }
}

/// PSD superframe payload header: fc, capture and wall-clock
/// timestamps, nominal and measured rates, looped flag. Everything
/// big-endian; the bin vector that follows is native little-endian f32.
pub const PSD_HEADER_LENGTH: usize = 8 + 12 + 12 + 4 + 4 + 1;

pub fn encode_psd_superframe(message: &PsdMessage) -> Vec<u8> {
    use std::time::SystemTime;

    let mut out = BytesMut::with_capacity(PSD_HEADER_LENGTH + message.psd.len() * 4);

    let unix = |time: SystemTime| {
        time.duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
    };

    out.put_i64(message.fc);
    let timestamp = unix(message.timestamp);
    out.put_u64(timestamp.as_secs());
    out.put_u32(timestamp.subsec_micros());
    let rt_time = unix(message.rt_time);
    out.put_u64(rt_time.as_secs());
    out.put_u32(rt_time.subsec_micros());
    out.put_u32(message.samp_rate);
    out.put_f32(message.measured_samp_rate);
    out.put_u8(message.looped as u8);

    // the bin vector is shipped in the native sample representation
    out.put_slice(bytemuck::cast_slice(&message.psd));

    out.to_vec()
}

pub fn decode_psd_superframe(payload: &[u8]) -> Result<PsdMessage, Error> {
    use std::time::{
        Duration,
        SystemTime,
    };

    if payload.len() < PSD_HEADER_LENGTH || (payload.len() - PSD_HEADER_LENGTH) % 4 != 0 {
        return Err(Error::TruncatedPsd);
    }

    let mut cursor = payload;
    let fc = cursor.get_i64();
    let ts_secs = cursor.get_u64();
    let ts_usec = cursor.get_u32();
    let rt_secs = cursor.get_u64();
    let rt_usec = cursor.get_u32();
    let samp_rate = cursor.get_u32();
    let measured_samp_rate = cursor.get_f32();
    let looped = cursor.get_u8() != 0;

    let mut psd = Vec::with_capacity(cursor.len() / 4);
    for chunk in cursor.chunks_exact(4) {
        psd.push(f32::from_le_bytes(chunk.try_into().unwrap()));
    }

    Ok(PsdMessage {
        inspector_id: 0,
        fc,
        samp_rate,
        measured_samp_rate,
        timestamp: SystemTime::UNIX_EPOCH + Duration::new(ts_secs, ts_usec * 1000),
        rt_time: SystemTime::UNIX_EPOCH + Duration::new(rt_secs, rt_usec * 1000),
        looped,
        psd,
    })
}

#[cfg(test)]
mod tests {
    use std::time::{
        Duration,
        SystemTime,
    };

    use super::*;

    fn sample_psd(bins: usize) -> PsdMessage {
        PsdMessage {
            inspector_id: 0,
            fc: 433_920_000,
            samp_rate: 2_400_000,
            measured_samp_rate: 2_399_000.5,
            timestamp: SystemTime::UNIX_EPOCH + Duration::from_micros(1_700_000_123_456),
            rt_time: SystemTime::UNIX_EPOCH + Duration::from_micros(1_700_000_789_012),
            looped: false,
            psd: (0..bins).map(|i| (i as f32).sin()).collect(),
        }
    }

    #[test]
    fn header_round_trip() {
        let header = FragmentHeader {
            sf_type: SuperframeType::Psd,
            sf_id: 42,
            size: 1000,
            sf_size: 32768,
            sf_offset: 2912,
        };
        let mut raw = BytesMut::new();
        header.encode(&mut raw);
        assert_eq!(raw.len(), HEADER_LENGTH);
        assert_eq!(FragmentHeader::decode(&raw[..]).unwrap(), header);
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut raw = BytesMut::new();
        FragmentHeader {
            sf_type: SuperframeType::Encap,
            sf_id: 0,
            size: 0,
            sf_size: 0,
            sf_offset: 0,
        }
        .encode(&mut raw);
        raw[0] = b'X';
        assert!(matches!(
            FragmentHeader::decode(&raw[..]),
            Err(Error::BadMagic(_))
        ));
    }

    #[test]
    fn split_tiles_offsets_exactly() {
        let payload: Vec<u8> = (0..10_000u32).map(|value| value as u8).collect();
        let mtu = 1472;
        let fragments = split_superframe(SuperframeType::Encap, 9, &payload, mtu);

        let usable = mtu - HEADER_LENGTH;
        assert_eq!(fragments.len(), payload.len().div_ceil(usable));

        let mut announced = 0usize;
        let mut expected_offset = 0usize;
        for fragment in &fragments {
            assert!(fragment.len() <= mtu);
            let header = FragmentHeader::decode(&fragment[..HEADER_LENGTH]).unwrap();
            assert_eq!(header.sf_id, 9);
            assert_eq!(header.sf_size as usize, payload.len());
            assert_eq!(header.sf_offset as usize, expected_offset);
            expected_offset += header.size as usize;
            announced += header.size as usize;
        }
        assert_eq!(announced, payload.len());
    }

    #[test]
    fn exact_mtu_boundary_fragment_counts() {
        let mtu = 1472;
        let usable = mtu - HEADER_LENGTH;

        let fragments = split_superframe(SuperframeType::Encap, 0, &vec![0; usable], mtu);
        assert_eq!(fragments.len(), 1);

        let fragments = split_superframe(SuperframeType::Encap, 0, &vec![0; usable + 1], mtu);
        assert_eq!(fragments.len(), 2);
    }

    #[test]
    fn reassembly_restores_payload() {
        let payload: Vec<u8> = (0..5000u32).map(|value| (value * 7) as u8).collect();
        let fragments = split_superframe(SuperframeType::Encap, 3, &payload, 600);

        let mut reassembler = Reassembler::new();
        let mut complete = None;
        for fragment in &fragments {
            let header = FragmentHeader::decode(&fragment[..HEADER_LENGTH]).unwrap();
            if let Some(superframe) = reassembler
                .push(header, &fragment[HEADER_LENGTH..])
                .unwrap()
            {
                complete = Some(superframe);
            }
        }

        let superframe = complete.expect("superframe completes");
        assert_eq!(superframe.payload, payload);
        assert_eq!(superframe.sf_id, 3);
    }

    #[test]
    fn id_change_discards_partial() {
        let payload = vec![1u8; 3000];
        let first = split_superframe(SuperframeType::Encap, 1, &payload, 600);
        let second = split_superframe(SuperframeType::Encap, 2, &payload, 600);

        let mut reassembler = Reassembler::new();
        let header = FragmentHeader::decode(&first[0][..HEADER_LENGTH]).unwrap();
        assert!(reassembler
            .push(header, &first[0][HEADER_LENGTH..])
            .unwrap()
            .is_none());

        // a new id arrives before the first superframe completed
        let mut complete = 0;
        for fragment in &second {
            let header = FragmentHeader::decode(&fragment[..HEADER_LENGTH]).unwrap();
            if reassembler
                .push(header, &fragment[HEADER_LENGTH..])
                .unwrap()
                .is_some()
            {
                complete += 1;
            }
        }
        assert_eq!(complete, 1);
    }

    #[test]
    fn psd_superframe_round_trip() {
        let message = sample_psd(8192);
        let encoded = encode_psd_superframe(&message);
        assert_eq!(encoded.len(), PSD_HEADER_LENGTH + 8192 * 4);

        let back = decode_psd_superframe(&encoded).unwrap();
        assert_eq!(back.fc, message.fc);
        assert_eq!(back.samp_rate, message.samp_rate);
        assert_eq!(back.looped, message.looped);
        assert_eq!(back.psd, message.psd);
    }

    #[test]
    fn psd_8192_bins_fragment_count_matches_formula() {
        let message = sample_psd(8192);
        let encoded = encode_psd_superframe(&message);
        let mtu = 1472;
        let fragments = split_superframe(SuperframeType::Psd, 0, &encoded, mtu);
        let expected = (8192 * 4 + PSD_HEADER_LENGTH).div_ceil(mtu - HEADER_LENGTH);
        assert_eq!(fragments.len(), expected);
    }

    #[tokio::test]
    async fn fragment_stream_round_trip() {
        let (mut client, mut server) = tokio::io::duplex(1 << 16);

        let payload = Bytes::from(vec![0xabu8; 500]);
        let fragments = split_superframe(SuperframeType::Encap, 7, &payload, 1472);
        for fragment in &fragments {
            write_fragment(&mut client, fragment).await.unwrap();
        }

        let (header, got) = read_fragment(&mut server).await.unwrap();
        assert_eq!(header.sf_id, 7);
        assert_eq!(got, payload);
    }
}
