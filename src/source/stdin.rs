//! Standard-input source.
//!
//! A pump thread owns the blocking read on fd 0 and hands byte chunks to
//! the source over a bounded channel, so `cancel` can wake a consumer
//! within bounded time even while the pump is still blocked on the pipe.
//! The `format` parameter picks the byte-to-complex converter; the
//! integer converters divide by the peak-to-peak range (255 / 65535),
//! matching the historical scaling of captures produced for this
//! pipeline.

use std::{
    io::Read,
    sync::{
        atomic::{
            AtomicBool,
            Ordering,
        },
        mpsc,
    },
    thread,
    time::{
        Duration,
        SystemTime,
    },
};

use num_complex::Complex;
use parking_lot::Mutex;

use crate::source::{
    Error,
    Source,
    config::SourceConfig,
    convert::{
        Converter,
        RawFormat,
        Scaling,
    },
    info::{
        Permissions,
        SourceInfo,
    },
};

const PUMP_CHUNK: usize = 0x4000;
const POLL_INTERVAL: Duration = Duration::from_millis(100);

struct StdinState {
    chunks: mpsc::Receiver<Vec<u8>>,
    converter: Converter,
    carry: Vec<Complex<f32>>,
    eos: bool,
}

pub struct StdinSource {
    state: Mutex<StdinState>,
    info: Mutex<SourceInfo>,
    force_eos: AtomicBool,
}

impl StdinSource {
    pub fn open(config: &SourceConfig) -> Result<Self, Error> {
        let format_key = config.param("format").unwrap_or("cf32");
        let (format, complex) = RawFormat::from_key(format_key)
            .ok_or_else(|| Error::InvalidConfig(format!("unknown stdin format {format_key:?}")))?;

        let (sender, receiver) = mpsc::sync_channel::<Vec<u8>>(16);
        thread::Builder::new()
            .name("stdin-pump".into())
            .spawn(move || {
                let mut stdin = std::io::stdin().lock();
                let mut chunk = vec![0u8; PUMP_CHUNK];
                loop {
                    match stdin.read(&mut chunk) {
                        Ok(0) | Err(_) => break,
                        Ok(got) => {
                            if sender.send(chunk[..got].to_vec()).is_err() {
                                break;
                            }
                        }
                    }
                }
            })
            .map_err(Error::Io)?;

        let now = SystemTime::now();
        let info = SourceInfo {
            permissions: Permissions::all_file() - Permissions::SEEK,
            source_samp_rate: config.samp_rate,
            effective_samp_rate: config.samp_rate,
            measured_samp_rate: config.samp_rate,
            frequency: config.freq,
            freq_min: config.freq,
            freq_max: config.freq,
            lnb: config.lnb_freq,
            realtime: true,
            source_time: now,
            source_start: now,
            ..Default::default()
        };

        Ok(Self {
            state: Mutex::new(StdinState {
                chunks: receiver,
                converter: Converter::new(format, complex, Scaling::PeakToPeak),
                carry: Vec::new(),
                eos: false,
            }),
            info: Mutex::new(info),
            force_eos: AtomicBool::new(false),
        })
    }
}

impl Source for StdinSource {
    fn info(&self) -> SourceInfo {
        let mut info = self.info.lock();
        info.touch(SystemTime::now());
        info.clone()
    }

    fn start(&self) -> Result<(), Error> {
        self.force_eos.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn read(&self, buf: &mut [Complex<f32>]) -> Result<usize, Error> {
        let mut state = self.state.lock();

        loop {
            if self.force_eos.load(Ordering::SeqCst) || state.eos {
                return Ok(0);
            }

            if !state.carry.is_empty() {
                let take = state.carry.len().min(buf.len());
                buf[..take].copy_from_slice(&state.carry[..take]);
                state.carry.drain(..take);
                return Ok(take);
            }

            match state.chunks.recv_timeout(POLL_INTERVAL) {
                Ok(chunk) => {
                    let StdinState {
                        converter, carry, ..
                    } = &mut *state;
                    converter.feed(&chunk, carry);
                }
                Err(mpsc::RecvTimeoutError::Timeout) => {}
                Err(mpsc::RecvTimeoutError::Disconnected) => {
                    state.eos = true;
                }
            }
        }
    }

    fn cancel(&self) {
        self.force_eos.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_unknown_format_key() {
        let mut config = SourceConfig::new(crate::source::SourceType::Stdin);
        config.params.set("format", "pcm24");
        assert!(matches!(
            StdinSource::open(&config),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn format_keys_map_to_converters() {
        assert_eq!(RawFormat::from_key("cu8"), Some((RawFormat::U8, true)));
        assert_eq!(RawFormat::from_key("s16"), Some((RawFormat::S16, false)));
        assert_eq!(RawFormat::from_key("cf32"), Some((RawFormat::F32, true)));
        assert_eq!(RawFormat::from_key("nope"), None);
    }
}
