//! Sample sources.
//!
//! A source is anything that produces complex baseband at a known sample
//! rate: a capture file, an SDR front end, standard input or a synthetic
//! generator. Sources are shared objects: the fast worker blocks in
//! [`Source::read`] while the slow worker calls setters, so every
//! implementation keeps its own interior locking and never holds a lock
//! across a blocking wait.

pub mod config;
pub mod convert;
pub mod device;
pub mod file;
pub mod stdin;
pub mod tonegen;

#[cfg(feature = "soapysdr")]
pub mod soapy;

pub mod info;

use std::{
    sync::Arc,
    time::SystemTime,
};

use num_complex::Complex;

pub use self::{
    config::{
        SampleFormat,
        SourceConfig,
        SourceType,
    },
    info::{
        Permissions,
        SourceInfo,
    },
};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("operation not supported by this source")]
    Unsupported,
    #[error("invalid source configuration: {0}")]
    InvalidConfig(String),
    #[error("unrecognized capture format: {0}")]
    BadFormat(String),
    #[error("malformed metadata sidecar: {0}")]
    Metadata(#[from] serde_json::Error),
    #[error("source type {} requires the soapysdr feature", .0.name())]
    FeatureDisabled(SourceType),
    #[cfg(feature = "soapysdr")]
    #[error("SoapySDR: {0}")]
    Soapy(#[from] ::soapysdr::Error),
}

bitflags::bitflags! {
    /// Which fields [`guess_metadata`] filled in.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct GuessedMetadata: u32 {
        const FORMAT     = 1 << 0;
        const SAMP_RATE  = 1 << 1;
        const FREQUENCY  = 1 << 2;
        const START_TIME = 1 << 3;
    }
}

/// Polymorphic sample producer.
///
/// `start`, `read` and `cancel` are required; everything else defaults to
/// [`Error::Unsupported`], and the advertised [`Permissions`] in the
/// source info reflect what a variant actually implements.
pub trait Source: Send + Sync {
    /// Snapshot of the advisory source state. Refreshed after `open` and
    /// after every successful setter.
    fn info(&self) -> SourceInfo;

    fn start(&self) -> Result<(), Error>;

    /// Read up to `buf.len()` samples. Returns 0 on end of stream.
    fn read(&self, buf: &mut [Complex<f32>]) -> Result<usize, Error>;

    /// Wake a blocked `read` within bounded time. Safe from any thread;
    /// the unblocked read reports end of stream.
    fn cancel(&self);

    fn seek(&self, _sample_index: u64) -> Result<(), Error> {
        Err(Error::Unsupported)
    }

    /// Total capture length in samples, for seekable sources.
    fn max_size(&self) -> Option<u64> {
        None
    }

    /// Capture time of the sample about to be read.
    fn get_time(&self) -> SystemTime {
        SystemTime::now()
    }

    /// Consume the looped flag: true exactly once after a finite capture
    /// wrapped around.
    fn take_looped(&self) -> bool {
        false
    }

    fn set_frequency(&self, _hz: f64) -> Result<(), Error> {
        Err(Error::Unsupported)
    }

    fn set_gain(&self, _name: &str, _db: f32) -> Result<(), Error> {
        Err(Error::Unsupported)
    }

    fn set_antenna(&self, _name: &str) -> Result<(), Error> {
        Err(Error::Unsupported)
    }

    fn set_bandwidth(&self, _hz: f64) -> Result<(), Error> {
        Err(Error::Unsupported)
    }

    fn set_ppm(&self, _ppm: f64) -> Result<(), Error> {
        Err(Error::Unsupported)
    }

    fn set_dc_remove(&self, _enable: bool) -> Result<(), Error> {
        Err(Error::Unsupported)
    }

    fn set_agc(&self, _enable: bool) -> Result<(), Error> {
        Err(Error::Unsupported)
    }
}

pub type SharedSource = Arc<dyn Source>;

/// Open a source described by `config`.
pub fn open(config: &SourceConfig) -> Result<SharedSource, Error> {
    match config.ty {
        SourceType::File => Ok(Arc::new(file::FileSource::open(config)?)),
        SourceType::Stdin => Ok(Arc::new(stdin::StdinSource::open(config)?)),
        SourceType::ToneGen => Ok(Arc::new(tonegen::ToneGenSource::open(config)?)),
        #[cfg(feature = "soapysdr")]
        SourceType::SoapySdr => Ok(Arc::new(soapy::SoapySource::open(config)?)),
        #[cfg(not(feature = "soapysdr"))]
        SourceType::SoapySdr => Err(Error::FeatureDisabled(SourceType::SoapySdr)),
        SourceType::Remote => {
            Err(Error::InvalidConfig(
                "remote profiles are opened through the remote client, not as a local source"
                    .into(),
            ))
        }
    }
}

/// Estimated capture length in samples, without opening the source.
pub fn estimate_size(config: &SourceConfig) -> Result<Option<u64>, Error> {
    match config.ty {
        SourceType::File => file::estimate_size(config).map(Some),
        _ => Ok(None),
    }
}

/// Inspect capture metadata (SigMF sidecars, WAV headers) and fill in
/// whatever `config` left unspecified. Returns the set of guessed
/// fields.
pub fn guess_metadata(config: &mut SourceConfig) -> Result<GuessedMetadata, Error> {
    match config.ty {
        SourceType::File => file::guess_metadata(config),
        _ => Ok(GuessedMetadata::empty()),
    }
}

/// Tunable frequency range for a profile.
pub fn freq_limits(config: &SourceConfig) -> (f64, f64) {
    match config.ty {
        // captures replay whatever band they were taken over
        SourceType::File | SourceType::Stdin => (config.freq, config.freq),
        _ => (-3e11, 3e11),
    }
}
