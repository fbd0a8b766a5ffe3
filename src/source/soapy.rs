//! SoapySDR source (behind the `soapysdr` feature).
//!
//! Opens a device described by the config's `device_spec`, applies
//! antenna, per-element gains, frequency (with LNB offset), sample rate,
//! bandwidth, frequency correction, DC-offset mode, prefixed stream-args
//! and device settings, then streams CF32. Reads retry transparently on
//! timeout and overflow, which are treated as signal-quality hiccups
//! rather than stream failures.

use std::{
    sync::atomic::{
        AtomicBool,
        AtomicU64,
        Ordering,
    },
    time::SystemTime,
};

use num_complex::Complex;
use parking_lot::Mutex;
use soapysdr::{
    Args,
    Device,
    Direction,
    ErrorCode,
    RxStream,
};

use crate::source::{
    Error,
    Source,
    config::SourceConfig,
    info::{
        GainDesc,
        Permissions,
        SourceInfo,
    },
};

const READ_TIMEOUT_US: i64 = 200_000;

/// device_spec keys forwarded verbatim to the stream setup
const STREAM_ARG_PREFIX: &str = "stream:";
/// device_spec keys applied as device settings after open
const SETTING_PREFIX: &str = "setting:";

pub struct SoapySource {
    device: Device,
    channel: usize,
    lnb_freq: f64,

    stream: Mutex<RxStream<Complex<f32>>>,
    info: Mutex<SourceInfo>,
    force_eos: AtomicBool,
    overflows: AtomicU64,
}

impl SoapySource {
    pub fn open(config: &SourceConfig) -> Result<Self, Error> {
        let mut args = Args::new();
        let mut stream_args = Args::new();
        for (key, value) in config.device_spec.iter() {
            if let Some(stripped) = key.strip_prefix(STREAM_ARG_PREFIX) {
                stream_args.set(stripped, value);
            }
            else if !key.starts_with(SETTING_PREFIX) {
                args.set(key, value);
            }
        }

        let device = Device::new(args)?;
        let channel = config.channel as usize;

        if let Some(antenna) = &config.antenna {
            device.set_antenna(Direction::Rx, channel, antenna.as_str())?;
        }

        // hardware AGC defaults to off; gains are set manually
        if device.has_gain_mode(Direction::Rx, channel)? {
            device.set_gain_mode(Direction::Rx, channel, false)?;
        }
        for gain in &config.gains {
            device.set_gain_element(Direction::Rx, channel, gain.name.as_str(), gain.value as f64)?;
        }

        device.set_frequency(
            Direction::Rx,
            channel,
            config.freq - config.lnb_freq,
            &Args::new(),
        )?;
        device.set_sample_rate(Direction::Rx, channel, config.samp_rate)?;
        if config.bandwidth > 0.0 {
            device.set_bandwidth(Direction::Rx, channel, config.bandwidth)?;
        }
        if config.ppm != 0.0 {
            let _ = device.set_component_frequency(
                Direction::Rx,
                channel,
                "CORR",
                config.ppm,
                &Args::new(),
            );
        }
        if device.has_dc_offset_mode(Direction::Rx, channel)? {
            device.set_dc_offset_mode(Direction::Rx, channel, config.dc_remove)?;
        }

        for (key, value) in config.device_spec.iter() {
            if let Some(setting) = key.strip_prefix(SETTING_PREFIX) {
                device.write_setting(setting, value)?;
            }
        }

        let mut stream = device.rx_stream::<Complex<f32>>(&[channel], &stream_args)?;
        stream.activate(None)?;

        let info = Self::snapshot_info(&device, channel, config)?;

        Ok(Self {
            device,
            channel,
            lnb_freq: config.lnb_freq,
            stream: Mutex::new(stream),
            info: Mutex::new(info),
            force_eos: AtomicBool::new(false),
            overflows: AtomicU64::new(0),
        })
    }

    fn snapshot_info(
        device: &Device,
        channel: usize,
        config: &SourceConfig,
    ) -> Result<SourceInfo, Error> {
        let samp_rate = device.sample_rate(Direction::Rx, channel)?;
        let frequency = device.frequency(Direction::Rx, channel)? + config.lnb_freq;

        let mut gains = Vec::new();
        for name in device.list_gains(Direction::Rx, channel)? {
            let range = device.gain_element_range(Direction::Rx, channel, name.as_str())?;
            let value = device.gain_element(Direction::Rx, channel, name.as_str())?;
            gains.push(GainDesc {
                name,
                min: range.minimum as f32,
                max: range.maximum as f32,
                step: if range.step > 0.0 { range.step as f32 } else { 1.0 },
                value: value as f32,
            });
        }

        let freq_ranges = device.frequency_range(Direction::Rx, channel)?;
        let freq_min = freq_ranges
            .iter()
            .map(|range| range.minimum)
            .fold(f64::INFINITY, f64::min);
        let freq_max = freq_ranges
            .iter()
            .map(|range| range.maximum)
            .fold(f64::NEG_INFINITY, f64::max);

        let now = SystemTime::now();
        Ok(SourceInfo {
            permissions: Permissions::all_sdr(),
            source_samp_rate: samp_rate,
            effective_samp_rate: samp_rate,
            measured_samp_rate: samp_rate,
            frequency,
            freq_min: freq_min + config.lnb_freq,
            freq_max: freq_max + config.lnb_freq,
            lnb: config.lnb_freq,
            bandwidth: device.bandwidth(Direction::Rx, channel).unwrap_or(0.0),
            ppm: config.ppm,
            antennas: device.antennas(Direction::Rx, channel)?,
            antenna: device.antenna(Direction::Rx, channel).ok(),
            gains,
            dc_remove: device.dc_offset_mode(Direction::Rx, channel).unwrap_or(false),
            agc: device.gain_mode(Direction::Rx, channel).unwrap_or(false),
            realtime: true,
            source_time: now,
            source_start: now,
            ..Default::default()
        })
    }

    fn refresh_info(&self) {
        let mut info = self.info.lock();
        if let Ok(frequency) = self.device.frequency(Direction::Rx, self.channel) {
            info.frequency = frequency + self.lnb_freq;
        }
        if let Ok(samp_rate) = self.device.sample_rate(Direction::Rx, self.channel) {
            info.effective_samp_rate = samp_rate;
        }
        if let Ok(bandwidth) = self.device.bandwidth(Direction::Rx, self.channel) {
            info.bandwidth = bandwidth;
        }
        if let Ok(agc) = self.device.gain_mode(Direction::Rx, self.channel) {
            info.agc = agc;
        }
        for index in 0..info.gains.len() {
            let name = info.gains[index].name.clone();
            if let Ok(value) = self.device.gain_element(Direction::Rx, self.channel, name.as_str())
            {
                info.gains[index].value = value as f32;
            }
        }
        info.touch(SystemTime::now());
    }
}

impl Source for SoapySource {
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
        let mut stream = self.stream.lock();

        loop {
            if self.force_eos.load(Ordering::SeqCst) {
                return Ok(0);
            }

            match stream.read(&mut [buf], READ_TIMEOUT_US) {
                Ok(got) => return Ok(got),
                Err(error) => {
                    match error.code {
                        ErrorCode::Timeout => {}
                        ErrorCode::Overflow | ErrorCode::Underflow => {
                            let count = self.overflows.fetch_add(1, Ordering::Relaxed) + 1;
                            tracing::debug!(count, "stream overflow");
                        }
                        _ => return Err(error.into()),
                    }
                }
            }
        }
    }

    fn cancel(&self) {
        self.force_eos.store(true, Ordering::SeqCst);
    }

    fn set_frequency(&self, hz: f64) -> Result<(), Error> {
        self.device.set_frequency(
            Direction::Rx,
            self.channel,
            hz - self.lnb_freq,
            &Args::new(),
        )?;
        self.refresh_info();
        Ok(())
    }

    fn set_gain(&self, name: &str, db: f32) -> Result<(), Error> {
        self.device
            .set_gain_element(Direction::Rx, self.channel, name, db as f64)?;
        self.refresh_info();
        Ok(())
    }

    fn set_antenna(&self, name: &str) -> Result<(), Error> {
        self.device.set_antenna(Direction::Rx, self.channel, name)?;
        self.refresh_info();
        let mut info = self.info.lock();
        info.antenna = Some(name.to_owned());
        Ok(())
    }

    fn set_bandwidth(&self, hz: f64) -> Result<(), Error> {
        self.device.set_bandwidth(Direction::Rx, self.channel, hz)?;
        self.refresh_info();
        Ok(())
    }

    fn set_ppm(&self, ppm: f64) -> Result<(), Error> {
        self.device.set_component_frequency(
            Direction::Rx,
            self.channel,
            "CORR",
            ppm,
            &Args::new(),
        )?;
        let mut info = self.info.lock();
        info.ppm = ppm;
        info.touch(SystemTime::now());
        Ok(())
    }

    fn set_dc_remove(&self, enable: bool) -> Result<(), Error> {
        self.device
            .set_dc_offset_mode(Direction::Rx, self.channel, enable)?;
        let mut info = self.info.lock();
        info.dc_remove = enable;
        info.touch(SystemTime::now());
        Ok(())
    }

    fn set_agc(&self, enable: bool) -> Result<(), Error> {
        self.device
            .set_gain_mode(Direction::Rx, self.channel, enable)?;
        self.refresh_info();
        Ok(())
    }
}

impl Drop for SoapySource {
    fn drop(&mut self) {
        let _ = self.stream.lock().deactivate(None);
    }
}
