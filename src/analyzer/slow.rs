//! Slow-path control operations.
//!
//! Human-triggered reconfiguration (retune, gain, antenna, bandwidth,
//! PPM, DC removal, AGC, PSD parameters) can take tens of milliseconds on
//! real hardware, far too long for the sample loop. Requests deposit
//! their payload into hot-config slots under one mutex and post a
//! callback to the slow worker; the callback takes the slot, drives the
//! source setter, refreshes the source-info snapshot and emits
//! `SOURCE_INFO`. A failed operation puts its payload back so the next
//! reconfiguration stays coherent.

use std::sync::Arc;

use crate::{
    analyzer::Shared,
    message::Message,
    psd::{
        FftConfig,
        PsdParams,
    },
    source::config::GainEntry,
    worker::Worker,
};

#[derive(Debug, Default)]
pub(super) struct HotConf {
    pub freq: Option<f64>,
    pub bandwidth: Option<f64>,
    pub ppm: Option<f64>,
    pub dc_remove: Option<bool>,
    pub agc: Option<bool>,
    pub antenna: Option<String>,
    /// append-only; consumed whole by the gain callback
    pub gains: Vec<GainEntry>,
    pub psd_params: Option<PsdParams>,
}

fn emit_source_info(shared: &Shared) {
    shared
        .mq_out
        .write(Message::SourceInfo(shared.source.info()));
}

pub(super) fn push_set_freq(shared: &Arc<Shared>, worker: &Worker, freq: f64) {
    shared.hotconf.lock().freq = Some(freq);

    let shared = shared.clone();
    worker.push_fn(move || {
        let Some(freq) = shared.hotconf.lock().freq.take() else {
            // an earlier callback already served a coalesced request
            return false;
        };

        match shared.source.set_frequency(freq) {
            Ok(()) => emit_source_info(&shared),
            Err(error) => {
                tracing::warn!(freq, %error, "set_frequency failed");
                let mut hotconf = shared.hotconf.lock();
                if hotconf.freq.is_none() {
                    hotconf.freq = Some(freq);
                }
            }
        }
        false
    });
}

pub(super) fn push_set_gain(shared: &Arc<Shared>, worker: &Worker, name: String, value: f32) {
    shared.hotconf.lock().gains.push(GainEntry { name, value });

    let shared = shared.clone();
    worker.push_fn(move || {
        let requests = std::mem::take(&mut shared.hotconf.lock().gains);
        if requests.is_empty() {
            return false;
        }

        let mut changed = false;
        for request in requests {
            match shared.source.set_gain(&request.name, request.value) {
                Ok(()) => changed = true,
                Err(error) => {
                    tracing::warn!(gain = %request.name, %error, "set_gain failed");
                }
            }
        }
        if changed {
            emit_source_info(&shared);
        }
        false
    });
}

pub(super) fn push_set_antenna(shared: &Arc<Shared>, worker: &Worker, antenna: String) {
    shared.hotconf.lock().antenna = Some(antenna);

    let shared = shared.clone();
    worker.push_fn(move || {
        let Some(antenna) = shared.hotconf.lock().antenna.take() else {
            return false;
        };

        match shared.source.set_antenna(&antenna) {
            Ok(()) => emit_source_info(&shared),
            Err(error) => {
                tracing::warn!(antenna, %error, "set_antenna failed");
            }
        }
        false
    });
}

pub(super) fn push_set_bandwidth(shared: &Arc<Shared>, worker: &Worker, bandwidth: f64) {
    shared.hotconf.lock().bandwidth = Some(bandwidth);

    let shared = shared.clone();
    worker.push_fn(move || {
        let Some(bandwidth) = shared.hotconf.lock().bandwidth.take() else {
            return false;
        };

        match shared.source.set_bandwidth(bandwidth) {
            Ok(()) => emit_source_info(&shared),
            Err(error) => {
                tracing::warn!(bandwidth, %error, "set_bandwidth failed");
                let mut hotconf = shared.hotconf.lock();
                if hotconf.bandwidth.is_none() {
                    hotconf.bandwidth = Some(bandwidth);
                }
            }
        }
        false
    });
}

pub(super) fn push_set_ppm(shared: &Arc<Shared>, worker: &Worker, ppm: f64) {
    shared.hotconf.lock().ppm = Some(ppm);

    let shared = shared.clone();
    worker.push_fn(move || {
        let Some(ppm) = shared.hotconf.lock().ppm.take() else {
            return false;
        };

        match shared.source.set_ppm(ppm) {
            Ok(()) => emit_source_info(&shared),
            Err(error) => {
                tracing::warn!(ppm, %error, "set_ppm failed");
            }
        }
        false
    });
}

pub(super) fn push_set_dc_remove(shared: &Arc<Shared>, worker: &Worker, enable: bool) {
    shared.hotconf.lock().dc_remove = Some(enable);

    let shared = shared.clone();
    worker.push_fn(move || {
        let Some(enable) = shared.hotconf.lock().dc_remove.take() else {
            return false;
        };

        match shared.source.set_dc_remove(enable) {
            Ok(()) => emit_source_info(&shared),
            Err(error) => {
                tracing::warn!(enable, %error, "set_dc_remove failed");
            }
        }
        false
    });
}

pub(super) fn push_set_agc(shared: &Arc<Shared>, worker: &Worker, enable: bool) {
    shared.hotconf.lock().agc = Some(enable);

    let shared = shared.clone();
    worker.push_fn(move || {
        let Some(enable) = shared.hotconf.lock().agc.take() else {
            return false;
        };

        match shared.source.set_agc(enable) {
            Ok(()) => emit_source_info(&shared),
            Err(error) => {
                tracing::warn!(enable, %error, "set_agc failed");
            }
        }
        false
    });
}

/// Build the FFT plan off the fast path and hand the finished config
/// over for installation at the next frame boundary.
pub(super) fn push_set_psd_params(shared: &Arc<Shared>, worker: &Worker, params: PsdParams) {
    shared.hotconf.lock().psd_params = Some(params);

    let shared = shared.clone();
    worker.push_fn(move || {
        let Some(params) = shared.hotconf.lock().psd_params.take() else {
            return false;
        };

        match FftConfig::build(params) {
            Ok(config) => {
                *shared.pending_fft.lock() = Some(config);
            }
            Err(error) => {
                tracing::warn!(%error, "rejecting PSD reconfiguration");
            }
        }
        false
    });
}
