//! Capture-file source.
//!
//! Reads raw interleaved captures, WAV recordings and SigMF datasets.
//! Supports seeking and, with `loop`, endless replay: on end of stream
//! the file rewinds to sample 0 and the next PSD message carries the
//! `looped` flag. `cancel` sets a force-EOS flag honored by the next
//! read.

use std::{
    fs::File,
    io::{
        Read,
        Seek,
        SeekFrom,
    },
    path::{
        Path,
        PathBuf,
    },
    sync::atomic::{
        AtomicBool,
        Ordering,
    },
    time::{
        Duration,
        SystemTime,
    },
};

use byteorder::{
    ByteOrder,
    LittleEndian,
};
use num_complex::Complex;
use parking_lot::Mutex;
use serde::Deserialize;

use crate::source::{
    Error,
    GuessedMetadata,
    Source,
    config::{
        SampleFormat,
        SourceConfig,
    },
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

const READ_CHUNK: usize = 0x8000;

#[derive(Clone, Copy, Debug)]
struct CaptureLayout {
    format: RawFormat,
    complex: bool,
    data_offset: u64,
    data_size: Option<u64>,
    /// sample rate from the container header, when it has one
    samp_rate: Option<f64>,
}

impl CaptureLayout {
    fn sample_size(&self) -> u64 {
        (self.format.component_size() * if self.complex { 2 } else { 1 }) as u64
    }
}

struct FileState {
    file: File,
    converter: Converter,
    carry: Vec<Complex<f32>>,
    chunk: Vec<u8>,

    /// samples consumed since start or since the last loop wrap
    total_samples: u64,
    looped: bool,
}

pub struct FileSource {
    layout: CaptureLayout,
    size_samples: Option<u64>,
    samp_rate: f64,
    start_time: SystemTime,
    loop_capture: bool,

    state: Mutex<FileState>,
    info: Mutex<SourceInfo>,
    force_eos: AtomicBool,
}

impl FileSource {
    pub fn open(config: &SourceConfig) -> Result<Self, Error> {
        let path = config
            .path
            .as_ref()
            .ok_or_else(|| Error::InvalidConfig("file source requires a path".into()))?;

        let format = resolve_format(config.format, path);
        let (data_path, layout) = probe_capture(path, format)?;

        let mut file = File::open(&data_path)?;
        file.seek(SeekFrom::Start(layout.data_offset))?;

        let samp_rate = layout.samp_rate.unwrap_or(config.samp_rate);
        let size_samples = layout.data_size.map(|size| size / layout.sample_size());

        let start_time = config.start_time;
        let mut info = SourceInfo {
            permissions: Permissions::all_file(),
            source_samp_rate: samp_rate,
            effective_samp_rate: samp_rate,
            measured_samp_rate: samp_rate,
            frequency: config.freq,
            freq_min: config.freq,
            freq_max: config.freq,
            lnb: config.lnb_freq,
            seekable: true,
            realtime: false,
            source_time: start_time,
            source_start: start_time,
            ..Default::default()
        };
        if let Some(size) = size_samples {
            info.source_end =
                Some(start_time + Duration::from_secs_f64(size as f64 / samp_rate));
        }

        Ok(Self {
            layout,
            size_samples,
            samp_rate,
            start_time,
            loop_capture: config.loop_capture,
            state: Mutex::new(FileState {
                file,
                converter: Converter::new(layout.format, layout.complex, Scaling::Symmetric),
                carry: Vec::new(),
                chunk: vec![0; READ_CHUNK],
                total_samples: 0,
                looped: false,
            }),
            info: Mutex::new(info),
            force_eos: AtomicBool::new(false),
        })
    }

    fn rewind(&self, state: &mut FileState) -> Result<(), Error> {
        state.file.seek(SeekFrom::Start(self.layout.data_offset))?;
        state.converter = Converter::new(self.layout.format, self.layout.complex, Scaling::Symmetric);
        state.carry.clear();
        state.total_samples = 0;
        Ok(())
    }
}

impl Source for FileSource {
    fn info(&self) -> SourceInfo {
        let time = self.get_time();
        let mut info = self.info.lock();
        info.touch(time);
        info.clone()
    }

    fn start(&self) -> Result<(), Error> {
        self.force_eos.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn read(&self, buf: &mut [Complex<f32>]) -> Result<usize, Error> {
        if buf.is_empty() || self.force_eos.load(Ordering::SeqCst) {
            return Ok(0);
        }

        let mut state = self.state.lock();

        loop {
            if !state.carry.is_empty() {
                let take = state.carry.len().min(buf.len());
                buf[..take].copy_from_slice(&state.carry[..take]);
                state.carry.drain(..take);
                state.total_samples += take as u64;
                return Ok(take);
            }

            let want = (buf.len() * self.layout.sample_size() as usize).min(READ_CHUNK);
            let FileState {
                file,
                chunk,
                converter,
                carry,
                ..
            } = &mut *state;
            let got = file.read(&mut chunk[..want])?;

            if got == 0 {
                if !self.loop_capture {
                    return Ok(0);
                }
                self.rewind(&mut state)?;
                state.looped = true;
                continue;
            }

            converter.feed(&chunk[..got], carry);
        }
    }

    fn cancel(&self) {
        self.force_eos.store(true, Ordering::SeqCst);
    }

    fn seek(&self, sample_index: u64) -> Result<(), Error> {
        let mut state = self.state.lock();
        let offset = self.layout.data_offset + sample_index * self.layout.sample_size();
        state.file.seek(SeekFrom::Start(offset))?;
        state.converter =
            Converter::new(self.layout.format, self.layout.complex, Scaling::Symmetric);
        state.carry.clear();
        state.total_samples = sample_index;
        Ok(())
    }

    fn max_size(&self) -> Option<u64> {
        self.size_samples
    }

    fn get_time(&self) -> SystemTime {
        let total_samples = self.state.lock().total_samples;
        self.start_time + Duration::from_secs_f64(total_samples as f64 / self.samp_rate)
    }

    fn take_looped(&self) -> bool {
        let mut state = self.state.lock();
        std::mem::take(&mut state.looped)
    }
}

fn resolve_format(format: SampleFormat, path: &Path) -> SampleFormat {
    if format != SampleFormat::Auto {
        return format;
    }

    match path.extension().and_then(|ext| ext.to_str()) {
        Some("wav") => SampleFormat::Wav,
        Some("sigmf-meta") | Some("sigmf-data") => SampleFormat::SigMf,
        _ => SampleFormat::RawF32,
    }
}

fn probe_capture(path: &Path, format: SampleFormat) -> Result<(PathBuf, CaptureLayout), Error> {
    let raw = |raw_format| {
        let layout = CaptureLayout {
            format: raw_format,
            complex: true,
            data_offset: 0,
            data_size: std::fs::metadata(path).ok().map(|meta| meta.len()),
            samp_rate: None,
        };
        Ok((path.to_path_buf(), layout))
    };

    match format {
        SampleFormat::RawF32 | SampleFormat::Auto => raw(RawFormat::F32),
        SampleFormat::RawU8 => raw(RawFormat::U8),
        SampleFormat::RawS8 => raw(RawFormat::S8),
        SampleFormat::RawS16 => raw(RawFormat::S16),
        SampleFormat::Wav => {
            let layout = probe_wav(path)?;
            Ok((path.to_path_buf(), layout))
        }
        SampleFormat::SigMf => {
            let meta = SigMfMeta::load(path)?;
            let data_path = meta.data_path(path);
            let mut layout = meta.layout()?;
            layout.data_size = std::fs::metadata(&data_path).ok().map(|m| m.len());
            Ok((data_path, layout))
        }
    }
}

fn probe_wav(path: &Path) -> Result<CaptureLayout, Error> {
    let mut file = File::open(path)?;
    let mut riff = [0u8; 12];
    file.read_exact(&mut riff)?;
    if &riff[..4] != b"RIFF" || &riff[8..] != b"WAVE" {
        return Err(Error::BadFormat("not a RIFF/WAVE file".into()));
    }

    let mut format = None;
    let mut offset = 12u64;

    loop {
        let mut chunk_header = [0u8; 8];
        if file.read_exact(&mut chunk_header).is_err() {
            return Err(Error::BadFormat("WAV file has no data chunk".into()));
        }
        let chunk_size = LittleEndian::read_u32(&chunk_header[4..]) as u64;
        offset += 8;

        match &chunk_header[..4] {
            b"fmt " => {
                let mut fmt = vec![0u8; chunk_size as usize];
                file.read_exact(&mut fmt)?;
                offset += chunk_size;

                let audio_format = LittleEndian::read_u16(&fmt[0..]);
                let channels = LittleEndian::read_u16(&fmt[2..]);
                let samp_rate = LittleEndian::read_u32(&fmt[4..]) as f64;
                let bits = LittleEndian::read_u16(&fmt[14..]);

                let raw_format = match (audio_format, bits) {
                    (1, 16) => RawFormat::S16,
                    (1, 8) => RawFormat::U8,
                    (3, 32) => RawFormat::F32,
                    _ => {
                        return Err(Error::BadFormat(format!(
                            "unsupported WAV encoding: format {audio_format}, {bits} bits"
                        )));
                    }
                };
                format = Some((raw_format, channels, samp_rate));
            }
            b"data" => {
                let Some((raw_format, channels, samp_rate)) = format else {
                    return Err(Error::BadFormat("WAV data chunk precedes fmt".into()));
                };
                if channels != 1 && channels != 2 {
                    return Err(Error::BadFormat(format!(
                        "WAV captures must be mono or I/Q stereo, not {channels} channels"
                    )));
                }
                return Ok(CaptureLayout {
                    format: raw_format,
                    complex: channels == 2,
                    data_offset: offset,
                    data_size: Some(chunk_size),
                    samp_rate: Some(samp_rate),
                });
            }
            _ => {
                file.seek(SeekFrom::Current(chunk_size as i64))?;
                offset += chunk_size;
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct SigMfMeta {
    global: SigMfGlobal,
    #[serde(default)]
    captures: Vec<SigMfCapture>,
}

#[derive(Debug, Deserialize)]
struct SigMfGlobal {
    #[serde(rename = "core:datatype")]
    datatype: String,
    #[serde(rename = "core:sample_rate")]
    sample_rate: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
struct SigMfCapture {
    #[serde(rename = "core:frequency")]
    frequency: Option<f64>,
    #[serde(rename = "core:datetime")]
    datetime: Option<String>,
}

impl SigMfMeta {
    fn sidecar_path(path: &Path) -> PathBuf {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("sigmf-data") => path.with_extension("sigmf-meta"),
            _ => path.to_path_buf(),
        }
    }

    fn load(path: &Path) -> Result<Self, Error> {
        let sidecar = Self::sidecar_path(path);
        let raw = std::fs::read(&sidecar)?;
        Ok(serde_json::from_slice(&raw)?)
    }

    fn data_path(&self, path: &Path) -> PathBuf {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("sigmf-meta") => path.with_extension("sigmf-data"),
            _ => path.to_path_buf(),
        }
    }

    fn layout(&self) -> Result<CaptureLayout, Error> {
        let (format, complex) = match self.global.datatype.as_str() {
            "cf32_le" => (RawFormat::F32, true),
            "rf32_le" => (RawFormat::F32, false),
            "ci16_le" => (RawFormat::S16, true),
            "ri16_le" => (RawFormat::S16, false),
            "ci8" => (RawFormat::S8, true),
            "ri8" => (RawFormat::S8, false),
            "cu8" => (RawFormat::U8, true),
            "ru8" => (RawFormat::U8, false),
            other => return Err(Error::BadFormat(format!("SigMF datatype {other}"))),
        };

        Ok(CaptureLayout {
            format,
            complex,
            data_offset: 0,
            data_size: None,
            samp_rate: self.global.sample_rate,
        })
    }
}

/// Parse a `core:datetime` value: RFC 3339, UTC per the SigMF spec.
fn parse_sigmf_datetime(value: &str) -> Option<SystemTime> {
    let datetime = chrono::DateTime::parse_from_rfc3339(value).ok()?;
    let secs = u64::try_from(datetime.timestamp()).ok()?;
    Some(
        SystemTime::UNIX_EPOCH
            + Duration::new(secs, datetime.timestamp_subsec_nanos()),
    )
}

pub(super) fn estimate_size(config: &SourceConfig) -> Result<u64, Error> {
    let path = config
        .path
        .as_ref()
        .ok_or_else(|| Error::InvalidConfig("file source requires a path".into()))?;
    let format = resolve_format(config.format, path);
    let (_, layout) = probe_capture(path, format)?;
    Ok(layout.data_size.unwrap_or(0) / layout.sample_size())
}

pub(super) fn guess_metadata(config: &mut SourceConfig) -> Result<GuessedMetadata, Error> {
    let Some(path) = config.path.clone() else {
        return Ok(GuessedMetadata::empty());
    };

    let mut guessed = GuessedMetadata::empty();
    let format = resolve_format(config.format, &path);

    match format {
        SampleFormat::SigMf => {
            let meta = SigMfMeta::load(&path)?;

            if config.format == SampleFormat::Auto {
                config.format = SampleFormat::SigMf;
                guessed |= GuessedMetadata::FORMAT;
            }
            if let Some(samp_rate) = meta.global.sample_rate {
                config.samp_rate = samp_rate;
                guessed |= GuessedMetadata::SAMP_RATE;
            }
            if let Some(capture) = meta.captures.first() {
                if let Some(frequency) = capture.frequency {
                    config.freq = frequency;
                    guessed |= GuessedMetadata::FREQUENCY;
                }
                if let Some(datetime) = capture.datetime.as_deref() {
                    if let Some(start) = parse_sigmf_datetime(datetime) {
                        config.start_time = start;
                        guessed |= GuessedMetadata::START_TIME;
                    }
                }
            }
        }
        SampleFormat::Wav => {
            let layout = probe_wav(&path)?;
            if config.format == SampleFormat::Auto {
                config.format = SampleFormat::Wav;
                guessed |= GuessedMetadata::FORMAT;
            }
            if let Some(samp_rate) = layout.samp_rate {
                config.samp_rate = samp_rate;
                guessed |= GuessedMetadata::SAMP_RATE;
            }
        }
        _ => {}
    }

    Ok(guessed)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn write_raw_capture(samples: &[Complex<f32>]) -> PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!(
            "sigscope-test-{}-{}.raw",
            std::process::id(),
            samples.len()
        ));
        let mut file = File::create(&path).unwrap();
        for sample in samples {
            file.write_all(&sample.re.to_le_bytes()).unwrap();
            file.write_all(&sample.im.to_le_bytes()).unwrap();
        }
        path
    }

    fn ramp(len: usize) -> Vec<Complex<f32>> {
        (0..len)
            .map(|i| Complex::new(i as f32, -(i as f32)))
            .collect()
    }

    #[test]
    fn raw_capture_reads_back_and_hits_eos() {
        let samples = ramp(64);
        let path = write_raw_capture(&samples);

        let mut config = SourceConfig::new(crate::source::SourceType::File);
        config.path = Some(path.clone());
        config.format = SampleFormat::RawF32;
        config.samp_rate = 1000.0;

        let source = FileSource::open(&config).unwrap();
        source.start().unwrap();
        assert_eq!(source.max_size(), Some(64));

        let mut buf = vec![Complex::default(); 48];
        assert_eq!(source.read(&mut buf).unwrap(), 48);
        assert_eq!(buf[5], samples[5]);
        assert_eq!(source.read(&mut buf).unwrap(), 16);
        assert_eq!(source.read(&mut buf).unwrap(), 0);

        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn loop_wraps_and_reports_looped_once() {
        let samples = ramp(16);
        let path = write_raw_capture(&samples);

        let mut config = SourceConfig::new(crate::source::SourceType::File);
        config.path = Some(path.clone());
        config.format = SampleFormat::RawF32;
        config.loop_capture = true;
        config.samp_rate = 1000.0;

        let source = FileSource::open(&config).unwrap();
        source.start().unwrap();

        let mut buf = vec![Complex::default(); 16];
        assert_eq!(source.read(&mut buf).unwrap(), 16);
        assert!(!source.take_looped());

        // wrap: the capture restarts and the flag is raised exactly once
        assert_eq!(source.read(&mut buf).unwrap(), 16);
        assert_eq!(buf[0], samples[0]);
        assert!(source.take_looped());
        assert!(!source.take_looped());

        // capture time jumped back with total_samples
        assert_eq!(
            source.get_time(),
            config.start_time + Duration::from_secs_f64(16.0 / 1000.0)
        );

        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn seek_repositions_sample_cursor() {
        let samples = ramp(32);
        let path = write_raw_capture(&samples);

        let mut config = SourceConfig::new(crate::source::SourceType::File);
        config.path = Some(path.clone());
        config.format = SampleFormat::RawF32;
        config.samp_rate = 1000.0;

        let source = FileSource::open(&config).unwrap();
        source.start().unwrap();
        source.seek(30).unwrap();

        let mut buf = vec![Complex::default(); 8];
        assert_eq!(source.read(&mut buf).unwrap(), 2);
        assert_eq!(buf[0], samples[30]);

        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn cancel_forces_eos() {
        let path = write_raw_capture(&ramp(1024));

        let mut config = SourceConfig::new(crate::source::SourceType::File);
        config.path = Some(path.clone());
        config.format = SampleFormat::RawF32;

        let source = FileSource::open(&config).unwrap();
        source.start().unwrap();
        source.cancel();

        let mut buf = vec![Complex::default(); 16];
        assert_eq!(source.read(&mut buf).unwrap(), 0);

        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn sigmf_sidecar_guesses_metadata_and_opens() {
        let mut meta_path = std::env::temp_dir();
        meta_path.push(format!("sigscope-test-{}.sigmf-meta", std::process::id()));
        let data_path = meta_path.with_extension("sigmf-data");

        std::fs::write(
            &meta_path,
            br#"{
                "global": {"core:datatype": "cu8", "core:sample_rate": 250000.0},
                "captures": [{"core:frequency": 433920000.0,
                              "core:datetime": "2021-06-01T00:00:00Z"}]
            }"#,
        )
        .unwrap();
        std::fs::write(&data_path, [0u8, 255, 128, 128]).unwrap();

        let mut config = SourceConfig::new(crate::source::SourceType::File);
        config.path = Some(meta_path.clone());
        config.format = SampleFormat::Auto;

        let guessed = guess_metadata(&mut config).unwrap();
        assert!(guessed.contains(GuessedMetadata::FORMAT));
        assert!(guessed.contains(GuessedMetadata::SAMP_RATE));
        assert!(guessed.contains(GuessedMetadata::FREQUENCY));
        assert!(guessed.contains(GuessedMetadata::START_TIME));
        assert_eq!(config.format, SampleFormat::SigMf);
        assert_eq!(config.samp_rate, 250000.0);
        assert_eq!(config.freq, 433920000.0);

        let source = FileSource::open(&config).unwrap();
        source.start().unwrap();
        assert_eq!(source.max_size(), Some(2));

        let mut buf = vec![Complex::default(); 4];
        assert_eq!(source.read(&mut buf).unwrap(), 2);
        // cu8 is unsigned with a mid-scale zero
        assert!((buf[0].re - (-1.0)).abs() < 0.01);
        assert!((buf[0].im - 0.992).abs() < 0.01);

        std::fs::remove_file(meta_path).unwrap();
        std::fs::remove_file(data_path).unwrap();
    }

    #[test]
    fn sigmf_datetime_parses() {
        let when = parse_sigmf_datetime("1970-01-02T00:00:00Z").unwrap();
        assert_eq!(when, SystemTime::UNIX_EPOCH + Duration::from_secs(86400));

        let when = parse_sigmf_datetime("2020-01-01T12:30:15.5Z").unwrap();
        assert_eq!(
            when.duration_since(SystemTime::UNIX_EPOCH).unwrap(),
            Duration::new(1577881815, 500_000_000)
        );

        assert!(parse_sigmf_datetime("not-a-date").is_none());
    }

    #[test]
    fn wav_probe_parses_canonical_header() {
        let mut path = std::env::temp_dir();
        path.push(format!("sigscope-test-{}.wav", std::process::id()));

        let mut data = Vec::new();
        data.extend_from_slice(b"RIFF");
        data.extend_from_slice(&36u32.to_le_bytes());
        data.extend_from_slice(b"WAVE");
        data.extend_from_slice(b"fmt ");
        data.extend_from_slice(&16u32.to_le_bytes());
        data.extend_from_slice(&1u16.to_le_bytes()); // PCM
        data.extend_from_slice(&2u16.to_le_bytes()); // stereo I/Q
        data.extend_from_slice(&48000u32.to_le_bytes());
        data.extend_from_slice(&(48000u32 * 4).to_le_bytes());
        data.extend_from_slice(&4u16.to_le_bytes());
        data.extend_from_slice(&16u16.to_le_bytes());
        data.extend_from_slice(b"data");
        data.extend_from_slice(&8u32.to_le_bytes());
        data.extend_from_slice(&[0u8; 8]);
        std::fs::write(&path, &data).unwrap();

        let layout = probe_wav(&path).unwrap();
        assert_eq!(layout.format, RawFormat::S16);
        assert!(layout.complex);
        assert_eq!(layout.samp_rate, Some(48000.0));
        assert_eq!(layout.data_offset, 44);
        assert_eq!(layout.data_size, Some(8));

        std::fs::remove_file(path).unwrap();
    }
}
