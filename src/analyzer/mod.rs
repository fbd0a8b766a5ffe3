//! The local analyzer: one source, two workers, one message stream.
//!
//! `open` spawns the fast worker (which owns the source read loop, the
//! PSD engine and the inspector manager) and the slow worker (which
//! serves human-triggered control operations). Everything the analyzer
//! has to say arrives on the output message queue; everything a client
//! asks for goes through [`Analyzer::post_message`] or the setter
//! wrappers.

pub mod params;
mod slow;

use std::{
    sync::{
        Arc,
        atomic::{
            AtomicBool,
            Ordering,
        },
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

pub use self::params::{
    AnalyzerMode,
    AnalyzerParams,
};
use crate::{
    config::Config,
    inspector::{
        ChannelSpec,
        Handle,
        InspectorClass,
        InspectorManager,
        SlotTable,
    },
    message::{
        InspectorMessage,
        InspectorMessageKind,
        Message,
        PsdMessage,
        StatusMessage,
    },
    mq::MessageQueue,
    psd::{
        FftConfig,
        PsdEngine,
        PsdParams,
    },
    source::{
        self,
        Permissions,
        SharedSource,
        SourceConfig,
    },
    worker::Worker,
};

/// samples per fast-loop read
const READ_BLOCK: usize = 8192;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("source: {0}")]
    Source(#[from] source::Error),
    #[error("psd: {0}")]
    Psd(#[from] crate::psd::Error),
    #[error("analyzer is halting")]
    Halting,
}

pub(crate) struct Shared {
    pub(crate) source: SharedSource,
    pub(crate) mq_out: Arc<MessageQueue>,
    pub(crate) mq_in: MessageQueue,
    pub(crate) hotconf: Mutex<slow::HotConf>,
    pub(crate) pending_fft: Mutex<Option<FftConfig>>,
    pub(crate) slots: SlotTable,
    pub(crate) permissions: Permissions,
    pub(crate) params: Mutex<AnalyzerParams>,
    pub(crate) halting: AtomicBool,
}

pub struct Analyzer {
    shared: Arc<Shared>,
    slow: Worker,
    fast: Mutex<Option<thread::JoinHandle<()>>>,
}

impl Analyzer {
    /// Open an analyzer over `config`, emitting messages to `mq_out`.
    pub fn open(
        params: AnalyzerParams,
        config: &SourceConfig,
        mq_out: Arc<MessageQueue>,
    ) -> Result<Self, Error> {
        Self::open_with_permissions(params, config, mq_out, Permissions::all())
    }

    /// Like [`Analyzer::open`], with every operation additionally gated
    /// by `mask` (the authenticated user's permissions, in server mode).
    pub fn open_with_permissions(
        params: AnalyzerParams,
        config: &SourceConfig,
        mq_out: Arc<MessageQueue>,
        mask: Permissions,
    ) -> Result<Self, Error> {
        params.detector.validate()?;

        let source = source::open(config)?;
        source.start()?;

        let info = source.info();
        let permissions = info.permissions & mask;
        let manager = InspectorManager::new(info.effective_samp_rate);
        let slots = manager.slots();
        let engine = PsdEngine::new(params.detector)?;

        let shared = Arc::new(Shared {
            source,
            mq_out,
            mq_in: MessageQueue::new(),
            hotconf: Mutex::new(slow::HotConf::default()),
            pending_fft: Mutex::new(None),
            slots,
            permissions,
            params: Mutex::new(params),
            halting: AtomicBool::new(false),
        });

        shared.mq_out.write(Message::SourceInit);
        shared.mq_out.write(Message::SourceInfo(info));
        shared.mq_out.write(Message::Params(params));

        let slow = Worker::spawn("analyzer-slow");
        let fast = thread::Builder::new()
            .name("analyzer-fast".into())
            .spawn({
                let shared = shared.clone();
                move || fast_loop(shared, manager, engine)
            })
            .map_err(source::Error::Io)?;

        Ok(Self {
            shared,
            slow,
            fast: Mutex::new(Some(fast)),
        })
    }

    pub fn permissions(&self) -> Permissions {
        self.shared.permissions
    }

    fn permitted(&self, permission: Permissions) -> bool {
        if self.shared.permissions.contains(permission) {
            true
        }
        else {
            tracing::debug!(?permission, "dropping operation: permission denied");
            false
        }
    }

    /// Hand a control message to the analyzer.
    pub fn post_message(&self, message: Message) {
        self.shared.mq_in.write(message);
    }

    /// Read the next outbound message, waiting up to `timeout`.
    pub fn read_message(&self, timeout: Duration) -> Option<Message> {
        self.shared.mq_out.read_timeout(timeout)
    }

    /// Request termination. Idempotent and safe from any thread.
    pub fn halt(&self) {
        if self.shared.halting.swap(true, Ordering::SeqCst) {
            return;
        }

        self.shared.source.cancel();
        self.shared.mq_in.write(Message::Halt);

        if let Some(fast) = self.fast.lock().take() {
            let _ = fast.join();
        }
        self.slow.halt();
    }

    pub fn set_frequency(&self, freq: f64) {
        if self.permitted(Permissions::SET_FREQ) {
            slow::push_set_freq(&self.shared, &self.slow, freq);
        }
    }

    pub fn set_gain(&self, name: &str, value: f32) {
        if self.permitted(Permissions::SET_GAIN) {
            slow::push_set_gain(&self.shared, &self.slow, name.to_owned(), value);
        }
    }

    pub fn set_antenna(&self, antenna: &str) {
        if self.permitted(Permissions::SET_ANTENNA) {
            slow::push_set_antenna(&self.shared, &self.slow, antenna.to_owned());
        }
    }

    pub fn set_bandwidth(&self, bandwidth: f64) {
        if self.permitted(Permissions::SET_BW) {
            slow::push_set_bandwidth(&self.shared, &self.slow, bandwidth);
        }
    }

    pub fn set_ppm(&self, ppm: f64) {
        if self.permitted(Permissions::SET_PPM) {
            slow::push_set_ppm(&self.shared, &self.slow, ppm);
        }
    }

    pub fn set_dc_remove(&self, enable: bool) {
        if self.permitted(Permissions::SET_DC_REMOVE) {
            slow::push_set_dc_remove(&self.shared, &self.slow, enable);
        }
    }

    pub fn set_agc(&self, enable: bool) {
        if self.permitted(Permissions::SET_AGC) {
            slow::push_set_agc(&self.shared, &self.slow, enable);
        }
    }

    /// Reconfigure the PSD engine. Which fields may change is gated by
    /// the FFT permission bits; a request touching a forbidden field is
    /// dropped whole.
    pub fn set_psd_params(&self, requested: PsdParams) {
        let current = self.shared.params.lock().detector;

        let mut needed = Permissions::empty();
        if requested.window_size != current.window_size {
            needed |= Permissions::SET_FFT_SIZE;
        }
        if requested.refresh_rate != current.refresh_rate {
            needed |= Permissions::SET_FFT_FPS;
        }
        if requested.window != current.window {
            needed |= Permissions::SET_FFT_WINDOW;
        }

        if !self.shared.permissions.contains(needed) {
            tracing::debug!(?needed, "dropping PSD reconfiguration: permission denied");
            return;
        }

        slow::push_set_psd_params(&self.shared, &self.slow, requested);
    }

    pub fn seek(&self, position: Duration) {
        if self.permitted(Permissions::SEEK) {
            self.post_message(Message::Seek(position));
        }
    }

    pub fn open_inspector(
        &self,
        class: InspectorClass,
        channel: ChannelSpec,
        parent: Option<Handle>,
        request_id: u32,
    ) {
        if self.permitted(class.required_permission()) {
            self.post_message(Message::Inspector(InspectorMessage {
                request_id,
                handle: 0,
                kind: InspectorMessageKind::Open {
                    class,
                    channel,
                    parent,
                },
            }));
        }
    }

    pub fn close_inspector(&self, handle: Handle, request_id: u32) {
        self.post_message(Message::Inspector(InspectorMessage {
            request_id,
            handle,
            kind: InspectorMessageKind::Close,
        }));
    }

    pub fn set_inspector_config(&self, handle: Handle, config: Config, request_id: u32) {
        self.post_message(Message::Inspector(InspectorMessage {
            request_id,
            handle,
            kind: InspectorMessageKind::SetConfig(config),
        }));
    }

    /// Overridable fast-path retune: applied at the start of the next
    /// sample tick, coalescing with any not-yet-applied request.
    pub fn set_inspector_frequency(&self, handle: Handle, freq: f64) {
        if let Some(slot) = self.shared.slots.lock().get(&handle) {
            slot.request_freq(freq);
        }
    }

    pub fn set_inspector_bandwidth(&self, handle: Handle, bandwidth: f64) {
        if let Some(slot) = self.shared.slots.lock().get(&handle) {
            slot.request_bandwidth(bandwidth);
        }
    }
}

impl Drop for Analyzer {
    fn drop(&mut self) {
        self.halt();
    }
}

/// Windowed throughput estimate of the real sample rate.
struct MeasuredRate {
    window_start: Instant,
    window_samples: u64,
    current: f64,
}

impl MeasuredRate {
    fn new(nominal: f64) -> Self {
        Self {
            window_start: Instant::now(),
            window_samples: 0,
            current: nominal,
        }
    }

    fn update(&mut self, samples: usize) -> f64 {
        self.window_samples += samples as u64;
        let elapsed = self.window_start.elapsed();
        if elapsed >= Duration::from_secs(1) {
            self.current = self.window_samples as f64 / elapsed.as_secs_f64();
            self.window_start = Instant::now();
            self.window_samples = 0;
        }
        self.current
    }
}

fn fast_loop(shared: Arc<Shared>, mut manager: InspectorManager, mut engine: PsdEngine) {
    let _guard = tracing::debug_span!("fast worker").entered();

    let info = shared.source.info();
    let samp_rate = info.effective_samp_rate;
    let mut buf = vec![Complex::default(); READ_BLOCK];
    let mut measured = MeasuredRate::new(samp_rate);

    tracing::debug!(samp_rate, "fast worker started");

    loop {
        if shared.halting.load(Ordering::SeqCst) {
            break;
        }

        let got = match shared.source.read(&mut buf) {
            Ok(0) => {
                shared
                    .mq_out
                    .write(Message::Eos(StatusMessage::new(0, "end of stream")));
                break;
            }
            Ok(got) => got,
            Err(error) => {
                tracing::error!(%error, "source read failed");
                shared.mq_out.write(Message::ReadError(StatusMessage::new(
                    -1,
                    error.to_string(),
                )));
                break;
            }
        };

        let samples = &buf[..got];
        let measured_rate = measured.update(got);

        manager.begin_tick();

        if let Some(config) = shared.pending_fft.lock().take() {
            let params = *config.params();
            engine.install(config);
            let full = {
                let mut current = shared.params.lock();
                current.detector = params;
                *current
            };
            shared.mq_out.write(Message::Params(full));
        }

        if let Some(psd) = engine.feed(samples) {
            let info = shared.source.info();
            shared.mq_out.write(Message::Psd(PsdMessage {
                inspector_id: 0,
                fc: info.frequency as i64,
                samp_rate: info.effective_samp_rate as u32,
                measured_samp_rate: measured_rate as f32,
                timestamp: shared.source.get_time(),
                rt_time: SystemTime::now(),
                looped: shared.source.take_looped(),
                psd,
            }));
        }

        manager.process(samples, &mut |message| shared.mq_out.write(message));

        while let Some(message) = shared.mq_in.poll() {
            if !dispatch_control(&shared, &mut manager, samp_rate, message) {
                tracing::debug!("fast worker leaving on halt");
                manager.close_all();
                return;
            }
        }
    }

    // EOS or error path: drop the inspectors, leave the queue intact
    manager.close_all();
    tracing::debug!("fast worker finished");
}

/// Returns false when the analyzer should stop.
fn dispatch_control(
    shared: &Arc<Shared>,
    manager: &mut InspectorManager,
    samp_rate: f64,
    message: Message,
) -> bool {
    match message {
        Message::Halt => return false,

        Message::Inspector(request) => dispatch_inspector(shared, manager, request),

        Message::GetParams => {
            let params = *shared.params.lock();
            shared.mq_out.write(Message::Params(params));
        }

        Message::Seek(position) => {
            if !shared.permissions.contains(Permissions::SEEK) {
                return true;
            }
            let index = (position.as_secs_f64() * samp_rate) as u64;
            match shared.source.seek(index) {
                Ok(()) => {
                    shared
                        .mq_out
                        .write(Message::SourceInfo(shared.source.info()));
                }
                Err(error) => tracing::warn!(%error, "seek failed"),
            }
        }

        Message::Throttle { samp_rate } => {
            // only meaningful for throttleable sources; advisory otherwise
            tracing::debug!(samp_rate, "throttle request ignored by this source");
        }

        other => {
            tracing::debug!(kind = ?other.kind(), "unexpected control message");
        }
    }

    true
}

fn dispatch_inspector(
    shared: &Arc<Shared>,
    manager: &mut InspectorManager,
    request: InspectorMessage,
) {
    let request_id = request.request_id;

    match request.kind {
        InspectorMessageKind::Open {
            class,
            channel,
            parent,
        } => {
            if !shared.permissions.contains(class.required_permission()) {
                return;
            }
            match manager.open(class, channel, parent, request_id) {
                Ok((_, reply)) => shared.mq_out.write(reply),
                Err(error) => {
                    tracing::warn!(%error, "inspector open failed");
                    shared.mq_out.write(Message::Inspector(InspectorMessage {
                        request_id,
                        handle: request.handle,
                        kind: InspectorMessageKind::WrongHandle,
                    }));
                }
            }
        }

        InspectorMessageKind::Close => {
            match manager.close(request.handle, request_id) {
                Ok(replies) => {
                    for reply in replies {
                        shared.mq_out.write(reply);
                    }
                }
                Err(_) => {
                    shared.mq_out.write(Message::Inspector(InspectorMessage {
                        request_id,
                        handle: request.handle,
                        kind: InspectorMessageKind::WrongHandle,
                    }));
                }
            }
        }

        InspectorMessageKind::SetConfig(config) => {
            match manager.set_config(request.handle, config, request_id) {
                Ok(reply) => shared.mq_out.write(reply),
                Err(_) => {
                    shared.mq_out.write(Message::Inspector(InspectorMessage {
                        request_id,
                        handle: request.handle,
                        kind: InspectorMessageKind::WrongHandle,
                    }));
                }
            }
        }

        other => {
            tracing::debug!(?other, "ignoring non-request inspector message");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        message::MessageKind,
        source::SourceType,
    };

    fn tonegen_config() -> SourceConfig {
        let mut config = SourceConfig::new(SourceType::ToneGen);
        config.freq = 100e6;
        config.samp_rate = 1e6;
        config
    }

    fn open_analyzer() -> (Analyzer, Arc<MessageQueue>) {
        let mq = Arc::new(MessageQueue::new());
        let params = AnalyzerParams::default();
        let analyzer = Analyzer::open(params, &tonegen_config(), mq.clone()).unwrap();
        (analyzer, mq)
    }

    fn wait_for(
        mq: &MessageQueue,
        kind: MessageKind,
        timeout: Duration,
    ) -> Option<Message> {
        mq.wait_for(&[kind], timeout)
    }

    #[test]
    fn open_emits_init_info_and_params() {
        let (analyzer, mq) = open_analyzer();

        assert_eq!(
            mq.read_timeout(Duration::from_secs(1)).map(|m| m.kind()),
            Some(MessageKind::SourceInit)
        );
        let info = mq.read_timeout(Duration::from_secs(1)).unwrap();
        match info {
            Message::SourceInfo(info) => assert_eq!(info.frequency, 100e6),
            other => panic!("expected SourceInfo, got {other:?}"),
        }
        assert_eq!(
            mq.read_timeout(Duration::from_secs(1)).map(|m| m.kind()),
            Some(MessageKind::Params)
        );

        analyzer.halt();
    }

    #[test]
    fn psd_arrives_with_configured_length() {
        let (analyzer, mq) = open_analyzer();

        let psd = wait_for(&mq, MessageKind::Psd, Duration::from_secs(2))
            .expect("psd within deadline");
        match psd {
            Message::Psd(psd) => {
                assert_eq!(psd.psd.len(), 1024);
                assert_eq!(psd.inspector_id, 0);
                assert_eq!(psd.fc, 100_000_000);
            }
            other => panic!("expected psd, got {other:?}"),
        }

        analyzer.halt();
    }

    #[test]
    fn retune_round_trips_through_source_info() {
        let (analyzer, mq) = open_analyzer();

        // drain the startup SOURCE_INFO first
        let _ = wait_for(&mq, MessageKind::SourceInfo, Duration::from_secs(1));

        analyzer.set_frequency(200e6);
        let info = wait_for(&mq, MessageKind::SourceInfo, Duration::from_secs(2))
            .expect("source info after retune");
        match info {
            Message::SourceInfo(info) => assert_eq!(info.frequency, 200e6),
            other => panic!("expected SourceInfo, got {other:?}"),
        }

        analyzer.halt();
    }

    #[test]
    fn inspector_open_close_round_trip() {
        let (analyzer, mq) = open_analyzer();

        let channel = ChannelSpec {
            fc: 0.0,
            lo: -5000.0,
            hi: 5000.0,
        };
        analyzer.open_inspector(InspectorClass::Audio, channel, None, 0xc1009);

        let handle = loop {
            let reply = wait_for(&mq, MessageKind::Inspector, Duration::from_secs(2))
                .expect("inspector reply");
            let Message::Inspector(message) = reply else {
                unreachable!()
            };
            assert_eq!(message.request_id, 0xc1009);
            match message.kind {
                InspectorMessageKind::Opened { equiv_fs, .. } => {
                    assert!(equiv_fs <= 1e6);
                    break message.handle;
                }
                other => panic!("expected Opened, got {other:?}"),
            }
        };
        assert_ne!(handle, 0);

        analyzer.close_inspector(handle, 7);
        let reply = wait_for(&mq, MessageKind::Inspector, Duration::from_secs(2))
            .expect("close reply");
        let Message::Inspector(message) = reply else {
            unreachable!()
        };
        assert_eq!(message.handle, handle);
        assert!(matches!(message.kind, InspectorMessageKind::Closed));

        analyzer.halt();
    }

    #[test]
    fn halt_is_idempotent_and_stops_the_stream() {
        let (analyzer, _mq) = open_analyzer();
        analyzer.halt();
        analyzer.halt();
    }

    #[test]
    fn permission_mask_drops_forbidden_setters() {
        let mq = Arc::new(MessageQueue::new());
        let analyzer = Analyzer::open_with_permissions(
            AnalyzerParams::default(),
            &tonegen_config(),
            mq.clone(),
            Permissions::all() - Permissions::SET_FREQ,
        )
        .unwrap();

        // drain startup info
        let _ = wait_for(&mq, MessageKind::SourceInfo, Duration::from_secs(1));

        analyzer.set_frequency(150e6);
        // forbidden: no SOURCE_INFO regenerated
        assert!(wait_for(&mq, MessageKind::SourceInfo, Duration::from_millis(300)).is_none());

        analyzer.halt();
    }
}
