//! Synthetic tone-generator source.
//!
//! Produces a throttled complex sinusoid at the configured frequency and
//! additive white Gaussian noise. Retuning away from the tone by more
//! than half the sample rate leaves only noise, which makes this the
//! standard loopback source for PSD and retune tests.

use std::{
    f32::consts::TAU,
    sync::atomic::{
        AtomicBool,
        Ordering,
    },
    thread,
    time::{
        Duration,
        Instant,
        SystemTime,
    },
};

use num_complex::Complex;
use parking_lot::Mutex;
use rand::Rng;

use crate::source::{
    Error,
    Source,
    config::SourceConfig,
    info::{
        Permissions,
        SourceInfo,
    },
};

/// Wall-clock pacing for synthetic sources: at most
/// `elapsed * samp_rate` samples may have been produced.
#[derive(Debug)]
pub struct Throttle {
    samp_rate: f64,
    epoch: Instant,
    consumed: u64,
}

impl Throttle {
    pub fn new(samp_rate: f64) -> Self {
        Self {
            samp_rate,
            epoch: Instant::now(),
            consumed: 0,
        }
    }

    /// How many of `max` samples may be produced right now.
    pub fn portion(&self, max: usize) -> usize {
        let budget = (self.epoch.elapsed().as_secs_f64() * self.samp_rate) as u64;
        (budget.saturating_sub(self.consumed) as usize).min(max)
    }

    pub fn advance(&mut self, samples: usize) {
        self.consumed += samples as u64;
    }
}

/// Numerically-controlled oscillator.
#[derive(Clone, Copy, Debug, Default)]
struct Nco {
    phase: f32,
    omega: f32,
}

impl Nco {
    fn set_freq(&mut self, normalized: f32) {
        self.omega = TAU * normalized;
    }

    fn step(&mut self) -> Complex<f32> {
        let out = Complex::from_polar(1.0, self.phase);
        self.phase = (self.phase + self.omega) % TAU;
        out
    }
}

struct ToneGenState {
    nco: Nco,
    throttle: Throttle,
    out_of_band: bool,
}

pub struct ToneGenSource {
    samp_rate: f64,
    init_freq: f64,
    signal_amplitude: f32,
    noise_amplitude: f32,

    state: Mutex<ToneGenState>,
    info: Mutex<SourceInfo>,
    force_eos: AtomicBool,
}

fn amplitude_from_db(db: f32) -> f32 {
    10.0f32.powf(db / 20.0)
}

/// Complex white Gaussian noise, unit power, via Box-Muller.
fn complex_awgn(rng: &mut impl Rng) -> Complex<f32> {
    let u: f32 = rng.gen_range(f32::EPSILON..1.0);
    let theta: f32 = rng.gen_range(0.0..TAU);
    let radius = (-u.ln()).sqrt();
    Complex::from_polar(radius, theta)
}

impl ToneGenSource {
    pub fn open(config: &SourceConfig) -> Result<Self, Error> {
        if !(config.samp_rate > 0.0) {
            return Err(Error::InvalidConfig("tonegen requires samp_rate > 0".into()));
        }

        let mut signal_amplitude = 5e-1;
        let mut noise_amplitude = 5e-3;
        if let Some(signal) = config.param("signal") {
            if let Ok(db) = signal.parse::<f32>() {
                signal_amplitude = amplitude_from_db(db);
            }
        }
        if let Some(noise) = config.param("noise") {
            if let Ok(db) = noise.parse::<f32>() {
                noise_amplitude = amplitude_from_db(db);
            }
        }
        noise_amplitude *= (config.samp_rate as f32).sqrt();

        let now = SystemTime::now();
        let info = SourceInfo {
            permissions: Permissions::all_sdr() - Permissions::SET_DC_REMOVE,
            source_samp_rate: config.samp_rate,
            effective_samp_rate: config.samp_rate,
            measured_samp_rate: config.samp_rate,
            frequency: config.freq,
            lnb: config.lnb_freq,
            realtime: true,
            source_time: now,
            source_start: now,
            ..Default::default()
        };

        Ok(Self {
            samp_rate: config.samp_rate,
            init_freq: config.freq,
            signal_amplitude,
            noise_amplitude,
            state: Mutex::new(ToneGenState {
                nco: Nco::default(),
                throttle: Throttle::new(config.samp_rate),
                out_of_band: false,
            }),
            info: Mutex::new(info),
            force_eos: AtomicBool::new(false),
        })
    }
}

impl Source for ToneGenSource {
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
        let mut rng = rand::thread_rng();

        loop {
            if self.force_eos.load(Ordering::SeqCst) {
                return Ok(0);
            }

            let mut state = self.state.lock();
            let portion = state.throttle.portion(buf.len());
            if portion == 0 {
                drop(state);
                thread::sleep(Duration::from_millis(1));
                continue;
            }

            if state.out_of_band {
                for sample in &mut buf[..portion] {
                    *sample = self.noise_amplitude * complex_awgn(&mut rng);
                }
            }
            else {
                for sample in &mut buf[..portion] {
                    let noise = self.noise_amplitude * complex_awgn(&mut rng);
                    *sample = self.signal_amplitude * state.nco.step() + noise;
                }
            }

            state.throttle.advance(portion);
            return Ok(portion);
        }
    }

    fn cancel(&self) {
        self.force_eos.store(true, Ordering::SeqCst);
    }

    fn set_frequency(&self, hz: f64) -> Result<(), Error> {
        let delta = hz - self.init_freq;

        let mut state = self.state.lock();
        state.out_of_band = delta.abs() > 0.5 * self.samp_rate;
        if !state.out_of_band {
            state.nco.set_freq((-delta / self.samp_rate) as f32);
        }
        drop(state);

        let mut info = self.info.lock();
        info.frequency = hz;
        info.touch(SystemTime::now());
        Ok(())
    }

    fn set_gain(&self, _name: &str, _db: f32) -> Result<(), Error> {
        Ok(())
    }

    fn set_antenna(&self, _name: &str) -> Result<(), Error> {
        Ok(())
    }

    fn set_bandwidth(&self, hz: f64) -> Result<(), Error> {
        let mut info = self.info.lock();
        info.bandwidth = hz;
        info.touch(SystemTime::now());
        Ok(())
    }

    fn set_ppm(&self, ppm: f64) -> Result<(), Error> {
        let mut info = self.info.lock();
        info.ppm = ppm;
        info.touch(SystemTime::now());
        Ok(())
    }

    fn set_agc(&self, _enable: bool) -> Result<(), Error> {
        Ok(())
    }
}
