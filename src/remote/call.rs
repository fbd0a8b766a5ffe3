//! Remote call objects.
//!
//! An `ENCAP` superframe carries one CBOR array `[type, fields…]`. The
//! five call types implement the session protocol: the server opens with
//! `AUTH`, the client answers `HELLO`, after which `CALL`s flow client →
//! server and `MESSAGE`s mirror the local analyzer's output back.

use hmac::{
    Hmac,
    Mac,
};
use sha2::Sha256;

use crate::{
    analyzer::Analyzer,
    buffer::GrowBuf,
    cbor,
    inspector::{
        ChannelSpec,
        InspectorClass,
    },
    message::{
        Message,
        MessageKind,
    },
    psd::{
        PsdParams,
        WindowFunction,
    },
    remote::Error,
};

const CALL_AUTH: u64 = 0;
const CALL_HELLO: u64 = 1;
const CALL_CALL: u64 = 2;
const CALL_MESSAGE: u64 = 3;
const CALL_SHUTDOWN: u64 = 4;

pub const NONCE_LENGTH: usize = 32;

/// Authentication modes offered by AUTH. Only one exists today.
pub const AUTH_MODE_USER_PASSWORD: u8 = 0;

#[derive(Clone, Debug, PartialEq)]
pub enum CallArg {
    Uint(u64),
    Int(i64),
    Double(f64),
    Bool(bool),
    Str(String),
}

impl CallArg {
    fn serialize(&self, buf: &mut GrowBuf) -> Result<(), cbor::Error> {
        match self {
            Self::Uint(value) => {
                cbor::pack_uint(buf, 0)?;
                cbor::pack_uint(buf, *value)
            }
            Self::Int(value) => {
                cbor::pack_uint(buf, 1)?;
                cbor::pack_int(buf, *value)
            }
            Self::Double(value) => {
                cbor::pack_uint(buf, 2)?;
                cbor::pack_double(buf, *value)
            }
            Self::Bool(value) => {
                cbor::pack_uint(buf, 3)?;
                cbor::pack_bool(buf, *value)
            }
            Self::Str(value) => {
                cbor::pack_uint(buf, 4)?;
                cbor::pack_str(buf, value)
            }
        }
    }

    fn deserialize(cursor: &mut &[u8]) -> Result<Self, cbor::Error> {
        let mut work = *cursor;
        let tag = cbor::unpack_uint(&mut work)?;
        let arg = match tag {
            0 => Self::Uint(cbor::unpack_uint(&mut work)?),
            1 => Self::Int(cbor::unpack_int(&mut work)?),
            2 => Self::Double(cbor::unpack_double(&mut work)?),
            3 => Self::Bool(cbor::unpack_bool(&mut work)?),
            4 => Self::Str(cbor::unpack_str(&mut work)?),
            _ => return Err(cbor::Error::MalformedInfo { info: tag as u8 }),
        };
        *cursor = work;
        Ok(arg)
    }

    fn as_uint(&self) -> Option<u64> {
        match self {
            Self::Uint(value) => Some(*value),
            Self::Int(value) if *value >= 0 => Some(*value as u64),
            _ => None,
        }
    }

    fn as_double(&self) -> Option<f64> {
        match self {
            Self::Double(value) => Some(*value),
            Self::Uint(value) => Some(*value as f64),
            Self::Int(value) => Some(*value as f64),
            _ => None,
        }
    }

    fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(value) => Some(*value),
            _ => None,
        }
    }

    fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(value) => Some(value),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum RemoteCall {
    Auth {
        nonce: [u8; NONCE_LENGTH],
        server_name: String,
        mode: u8,
    },
    Hello {
        version_major: u8,
        version_minor: u8,
        user: String,
        auth_token: Vec<u8>,
    },
    Call {
        method: String,
        args: Vec<CallArg>,
    },
    Message {
        kind: MessageKind,
        /// zlib-compressed payload when set
        compressed: bool,
        payload: Vec<u8>,
    },
    Shutdown,
}

impl RemoteCall {
    pub fn encode(&self) -> Result<Vec<u8>, Error> {
        let mut buf = GrowBuf::new();

        match self {
            Self::Auth {
                nonce,
                server_name,
                mode,
            } => {
                cbor::pack_array_start(&mut buf, Some(4))?;
                cbor::pack_uint(&mut buf, CALL_AUTH)?;
                cbor::pack_bytes(&mut buf, nonce)?;
                cbor::pack_str(&mut buf, server_name)?;
                cbor::pack_uint(&mut buf, *mode as u64)?;
            }
            Self::Hello {
                version_major,
                version_minor,
                user,
                auth_token,
            } => {
                cbor::pack_array_start(&mut buf, Some(5))?;
                cbor::pack_uint(&mut buf, CALL_HELLO)?;
                cbor::pack_uint(&mut buf, *version_major as u64)?;
                cbor::pack_uint(&mut buf, *version_minor as u64)?;
                cbor::pack_str(&mut buf, user)?;
                cbor::pack_bytes(&mut buf, auth_token)?;
            }
            Self::Call { method, args } => {
                cbor::pack_array_start(&mut buf, Some(3))?;
                cbor::pack_uint(&mut buf, CALL_CALL)?;
                cbor::pack_str(&mut buf, method)?;
                cbor::pack_array_start(&mut buf, Some(args.len() as u64))?;
                for arg in args {
                    arg.serialize(&mut buf)?;
                }
            }
            Self::Message {
                kind,
                compressed,
                payload,
            } => {
                cbor::pack_array_start(&mut buf, Some(4))?;
                cbor::pack_uint(&mut buf, CALL_MESSAGE)?;
                cbor::pack_uint(&mut buf, *kind as u64)?;
                cbor::pack_bool(&mut buf, *compressed)?;
                cbor::pack_bytes(&mut buf, payload)?;
            }
            Self::Shutdown => {
                cbor::pack_array_start(&mut buf, Some(1))?;
                cbor::pack_uint(&mut buf, CALL_SHUTDOWN)?;
            }
        }

        Ok(buf.finalize())
    }

    pub fn decode(payload: &[u8]) -> Result<Self, Error> {
        let mut cursor = payload;
        cbor::unpack_array_start(&mut cursor)?;
        let call_type = cbor::unpack_uint(&mut cursor)?;

        match call_type {
            CALL_AUTH => {
                let raw_nonce = cbor::unpack_bytes(&mut cursor)?;
                let nonce: [u8; NONCE_LENGTH] = raw_nonce
                    .try_into()
                    .map_err(|_| Error::BadArguments("auth"))?;
                Ok(Self::Auth {
                    nonce,
                    server_name: cbor::unpack_str(&mut cursor)?,
                    mode: cbor::unpack_uint(&mut cursor)? as u8,
                })
            }
            CALL_HELLO => {
                Ok(Self::Hello {
                    version_major: cbor::unpack_uint(&mut cursor)? as u8,
                    version_minor: cbor::unpack_uint(&mut cursor)? as u8,
                    user: cbor::unpack_str(&mut cursor)?,
                    auth_token: cbor::unpack_bytes(&mut cursor)?,
                })
            }
            CALL_CALL => {
                let method = cbor::unpack_str(&mut cursor)?;
                let count = cbor::unpack_array_start(&mut cursor)?.unwrap_or(0);
                let mut args = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    args.push(CallArg::deserialize(&mut cursor)?);
                }
                Ok(Self::Call { method, args })
            }
            CALL_MESSAGE => {
                let raw_kind = cbor::unpack_uint(&mut cursor)? as u32;
                let kind = MessageKind::from_u32(raw_kind)
                    .ok_or(Error::BadArguments("message kind"))?;
                Ok(Self::Message {
                    kind,
                    compressed: cbor::unpack_bool(&mut cursor)?,
                    payload: cbor::unpack_bytes(&mut cursor)?,
                })
            }
            CALL_SHUTDOWN => Ok(Self::Shutdown),
            other => Err(Error::UnknownCallType(other)),
        }
    }
}

/// HMAC-SHA256 of the server nonce keyed with the password.
pub fn auth_token(password: &str, nonce: &[u8; NONCE_LENGTH]) -> Vec<u8> {
    let mut mac = Hmac::<Sha256>::new_from_slice(password.as_bytes())
        .expect("hmac accepts any key length");
    mac.update(nonce);
    mac.finalize().into_bytes().to_vec()
}

/// Constant-time token comparison.
pub fn token_matches(expected: &[u8], received: &[u8]) -> bool {
    if expected.len() != received.len() {
        return false;
    }
    expected
        .iter()
        .zip(received)
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}

/// Dispatch a decoded CALL against a local analyzer. Unknown methods are
/// a protocol error; bad argument shapes are too.
pub fn apply_call(method: &str, args: &[CallArg], analyzer: &Analyzer) -> Result<(), Error> {
    let bad = |name: &'static str| Error::BadArguments(name);

    match method {
        "source.set_freq" => {
            let freq = args
                .first()
                .and_then(CallArg::as_double)
                .ok_or(bad("source.set_freq"))?;
            analyzer.set_frequency(freq);
        }
        "source.set_gain" => {
            let name = args
                .first()
                .and_then(CallArg::as_str)
                .ok_or(bad("source.set_gain"))?;
            let value = args
                .get(1)
                .and_then(CallArg::as_double)
                .ok_or(bad("source.set_gain"))?;
            analyzer.set_gain(name, value as f32);
        }
        "source.set_antenna" => {
            let antenna = args
                .first()
                .and_then(CallArg::as_str)
                .ok_or(bad("source.set_antenna"))?;
            analyzer.set_antenna(antenna);
        }
        "source.set_bw" => {
            let bandwidth = args
                .first()
                .and_then(CallArg::as_double)
                .ok_or(bad("source.set_bw"))?;
            analyzer.set_bandwidth(bandwidth);
        }
        "source.set_ppm" => {
            let ppm = args
                .first()
                .and_then(CallArg::as_double)
                .ok_or(bad("source.set_ppm"))?;
            analyzer.set_ppm(ppm);
        }
        "source.set_dc_remove" => {
            let enable = args
                .first()
                .and_then(CallArg::as_bool)
                .ok_or(bad("source.set_dc_remove"))?;
            analyzer.set_dc_remove(enable);
        }
        "source.set_agc" => {
            let enable = args
                .first()
                .and_then(CallArg::as_bool)
                .ok_or(bad("source.set_agc"))?;
            analyzer.set_agc(enable);
        }
        "source.seek" => {
            let seconds = args
                .first()
                .and_then(CallArg::as_double)
                .ok_or(bad("source.seek"))?;
            analyzer.seek(std::time::Duration::from_secs_f64(seconds.max(0.0)));
        }
        "psd.set_params" => {
            let window = args
                .first()
                .and_then(CallArg::as_str)
                .and_then(WindowFunction::from_name)
                .ok_or(bad("psd.set_params"))?;
            let window_size = args
                .get(1)
                .and_then(CallArg::as_uint)
                .ok_or(bad("psd.set_params"))? as usize;
            let refresh_rate = args
                .get(2)
                .and_then(CallArg::as_double)
                .ok_or(bad("psd.set_params"))? as f32;
            analyzer.set_psd_params(PsdParams {
                window,
                window_size,
                refresh_rate,
            });
        }
        "inspector.open" => {
            let class = args
                .first()
                .and_then(CallArg::as_str)
                .and_then(InspectorClass::from_name)
                .ok_or(bad("inspector.open"))?;
            let fc = args
                .get(1)
                .and_then(CallArg::as_double)
                .ok_or(bad("inspector.open"))?;
            let lo = args
                .get(2)
                .and_then(CallArg::as_double)
                .ok_or(bad("inspector.open"))?;
            let hi = args
                .get(3)
                .and_then(CallArg::as_double)
                .ok_or(bad("inspector.open"))?;
            let request_id = args
                .get(4)
                .and_then(CallArg::as_uint)
                .ok_or(bad("inspector.open"))? as u32;
            let parent = args.get(5).and_then(CallArg::as_uint).map(|p| p as u32);
            analyzer.open_inspector(class, ChannelSpec { fc, lo, hi }, parent, request_id);
        }
        "inspector.close" => {
            let handle = args
                .first()
                .and_then(CallArg::as_uint)
                .ok_or(bad("inspector.close"))? as u32;
            let request_id = args.get(1).and_then(CallArg::as_uint).unwrap_or(0) as u32;
            analyzer.close_inspector(handle, request_id);
        }
        "inspector.set_freq" => {
            let handle = args
                .first()
                .and_then(CallArg::as_uint)
                .ok_or(bad("inspector.set_freq"))? as u32;
            let freq = args
                .get(1)
                .and_then(CallArg::as_double)
                .ok_or(bad("inspector.set_freq"))?;
            analyzer.set_inspector_frequency(handle, freq);
        }
        "inspector.set_bw" => {
            let handle = args
                .first()
                .and_then(CallArg::as_uint)
                .ok_or(bad("inspector.set_bw"))? as u32;
            let bandwidth = args
                .get(1)
                .and_then(CallArg::as_double)
                .ok_or(bad("inspector.set_bw"))?;
            analyzer.set_inspector_bandwidth(handle, bandwidth);
        }
        "params.get" => {
            analyzer.post_message(Message::GetParams);
        }
        other => return Err(Error::UnknownMethod(other.to_owned())),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_objects_round_trip() {
        let calls = vec![
            RemoteCall::Auth {
                nonce: [7u8; NONCE_LENGTH],
                server_name: "bench".into(),
                mode: AUTH_MODE_USER_PASSWORD,
            },
            RemoteCall::Hello {
                version_major: 0,
                version_minor: 3,
                user: "alice".into(),
                auth_token: vec![1, 2, 3, 4],
            },
            RemoteCall::Call {
                method: "source.set_freq".into(),
                args: vec![CallArg::Double(433.92e6)],
            },
            RemoteCall::Message {
                kind: MessageKind::Eos,
                compressed: false,
                payload: vec![0x00, 0xf6],
            },
            RemoteCall::Shutdown,
        ];

        for call in calls {
            let encoded = call.encode().unwrap();
            assert_eq!(RemoteCall::decode(&encoded).unwrap(), call);
        }
    }

    #[test]
    fn auth_token_is_deterministic_and_keyed() {
        let nonce = [0x5au8; NONCE_LENGTH];
        let token = auth_token("hunter2", &nonce);
        assert_eq!(token.len(), 32);
        assert_eq!(token, auth_token("hunter2", &nonce));
        assert_ne!(token, auth_token("hunter3", &nonce));
        assert_ne!(token, auth_token("hunter2", &[0xa5u8; NONCE_LENGTH]));
    }

    #[test]
    fn token_compare_rejects_wrong_lengths_and_values() {
        assert!(token_matches(b"abcd", b"abcd"));
        assert!(!token_matches(b"abcd", b"abce"));
        assert!(!token_matches(b"abcd", b"abc"));
    }

    #[test]
    fn unknown_call_type_is_a_protocol_error() {
        let mut buf = GrowBuf::new();
        cbor::pack_array_start(&mut buf, Some(1)).unwrap();
        cbor::pack_uint(&mut buf, 99).unwrap();
        assert!(matches!(
            RemoteCall::decode(&buf.finalize()),
            Err(Error::UnknownCallType(99))
        ));
    }
}
