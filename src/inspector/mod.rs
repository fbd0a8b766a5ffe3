//! Per-client sub-band inspectors.
//!
//! The manager owns the handle table and the per-inspector channelizers.
//! Opening and closing happen inline on the fast path; parameter changes
//! arrive either through the slow worker (`set_config`) or through the
//! per-inspector overridable-request slot, which the fast path drains at
//! the start of every sample tick.

mod channelizer;

use std::{
    collections::{
        BTreeMap,
        BinaryHeap,
        HashMap,
    },
    cmp::Reverse,
    sync::Arc,
};

use num_complex::Complex;
use parking_lot::Mutex;

pub use self::channelizer::Channelizer;
use crate::{
    config::{
        Config,
        FieldType,
    },
    message::{
        InspectorMessage,
        InspectorMessageKind,
        Message,
        SampleBatch,
    },
    source::Permissions,
};

pub type Handle = u32;

/// Number of decimated samples batched into one SAMPLES message.
const SAMPLES_PER_BATCH: usize = 512;

#[derive(Clone, Copy, Debug, PartialEq, thiserror::Error)]
pub enum Error {
    #[error("no such inspector handle: {0}")]
    NoSuchHandle(Handle),
    #[error("invalid channel: lo {lo} must be below hi {hi}")]
    InvalidChannel { lo: f64, hi: f64 },
    #[error("channel does not fit the source band")]
    ChannelOutOfBand,
}

/// A sub-band of the source: center offset plus band edges relative to
/// that center.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ChannelSpec {
    pub fc: f64,
    pub lo: f64,
    pub hi: f64,
}

impl ChannelSpec {
    pub fn bandwidth(&self) -> f64 {
        self.hi - self.lo
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InspectorClass {
    Audio,
    Raw,
    Psk,
    Fsk,
    Ask,
}

impl InspectorClass {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "audio" => Some(Self::Audio),
            "raw" => Some(Self::Raw),
            "psk" => Some(Self::Psk),
            "fsk" => Some(Self::Fsk),
            "ask" => Some(Self::Ask),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::Raw => "raw",
            Self::Psk => "psk",
            Self::Fsk => "fsk",
            Self::Ask => "ask",
        }
    }

    /// The permission bit a client needs to open this class.
    pub fn required_permission(self) -> Permissions {
        match self {
            Self::Audio => Permissions::OPEN_AUDIO,
            Self::Raw => Permissions::OPEN_RAW,
            Self::Psk | Self::Fsk | Self::Ask => Permissions::OPEN_INSPECTOR,
        }
    }

    /// Default typed configuration for a fresh inspector.
    pub fn default_config(self) -> Config {
        match self {
            Self::Audio => {
                let mut config = Config::new("audio")
                    .with_field("demod", FieldType::Str, false)
                    .with_field("cutoff", FieldType::Float, false)
                    .with_field("samp-rate", FieldType::Int, false)
                    .with_field("squelch", FieldType::Bool, true)
                    .with_field("squelch-level", FieldType::Float, true)
                    .with_field("volume", FieldType::Float, true);
                let _ = config.set_str("demod", "FM");
                let _ = config.set_float("cutoff", 15000.0);
                let _ = config.set_int("samp-rate", 44100);
                let _ = config.set_bool("squelch", false);
                let _ = config.set_float("volume", 1.0);
                config
            }
            Self::Raw => Config::new("raw"),
            Self::Psk => {
                let mut config = Config::new("psk")
                    .with_field("bits-per-symbol", FieldType::Int, false)
                    .with_field("baud", FieldType::Float, false);
                let _ = config.set_int("bits-per-symbol", 2);
                let _ = config.set_float("baud", 9600.0);
                config
            }
            Self::Fsk => {
                let mut config = Config::new("fsk")
                    .with_field("bits-per-tone", FieldType::Int, false)
                    .with_field("baud", FieldType::Float, false);
                let _ = config.set_int("bits-per-tone", 1);
                let _ = config.set_float("baud", 1200.0);
                config
            }
            Self::Ask => {
                let mut config = Config::new("ask")
                    .with_field("bits", FieldType::Int, false)
                    .with_field("baud", FieldType::Float, false);
                let _ = config.set_int("bits", 1);
                let _ = config.set_float("baud", 300.0);
                config
            }
        }
    }
}

/// Deferred fast-path parameter update. The slow path fills the slot,
/// the fast path takes it at the next tick; stale requests coalesce so
/// only the latest content is applied.
#[derive(Clone, Copy, Debug, Default)]
pub struct OverridableRequest {
    pub seq: u32,
    pub freq: Option<f64>,
    pub bandwidth: Option<f64>,
}

#[derive(Debug, Default)]
pub struct RequestSlot {
    inner: Mutex<OverridableRequest>,
}

impl RequestSlot {
    pub fn request_freq(&self, freq: f64) {
        let mut slot = self.inner.lock();
        slot.freq = Some(freq);
        slot.seq = slot.seq.wrapping_add(1);
    }

    pub fn request_bandwidth(&self, bandwidth: f64) {
        let mut slot = self.inner.lock();
        slot.bandwidth = Some(bandwidth);
        slot.seq = slot.seq.wrapping_add(1);
    }

    /// Atomically take the pending request, if any.
    pub fn take(&self) -> Option<OverridableRequest> {
        let mut slot = self.inner.lock();
        if slot.freq.is_none() && slot.bandwidth.is_none() {
            return None;
        }
        let taken = *slot;
        slot.freq = None;
        slot.bandwidth = None;
        Some(taken)
    }
}

/// Handle → request-slot table shared with the analyzer front end, so
/// overridable setters never touch the manager itself.
pub type SlotTable = Arc<Mutex<HashMap<Handle, Arc<RequestSlot>>>>;

struct Inspector {
    handle: Handle,
    class: InspectorClass,
    channel: ChannelSpec,
    config: Config,

    decimation: u32,
    equiv_fs: f64,
    channelizer: Channelizer,
    slot: Arc<RequestSlot>,

    parent: Option<Handle>,
    /// decimated output accumulated this tick
    pending: Vec<Complex<f32>>,
    /// this tick's output, kept for child inspectors
    tick_out: Vec<Complex<f32>>,
}

impl Inspector {
    fn base_fs(&self, source_fs: f64, parents_fs: &HashMap<Handle, f64>) -> f64 {
        match self.parent {
            Some(parent) => parents_fs.get(&parent).copied().unwrap_or(source_fs),
            None => source_fs,
        }
    }
}

pub struct InspectorManager {
    source_fs: f64,
    inspectors: BTreeMap<Handle, Inspector>,
    /// processing order; parents always precede their children
    order: Vec<Handle>,

    free: BinaryHeap<Reverse<Handle>>,
    /// freed handles parked until one full tick has elapsed
    pending_free: Vec<Handle>,
    next_handle: Handle,

    slots: SlotTable,
}

/// Largest power-of-two decimation that still covers `bandwidth`.
fn decimation_for(fs: f64, bandwidth: f64) -> u32 {
    if !(bandwidth > 0.0) || bandwidth >= fs {
        return 1;
    }
    let mut decimation = 1u32;
    while decimation < 1 << 20 && fs / (decimation * 2) as f64 >= bandwidth {
        decimation *= 2;
    }
    decimation
}

impl InspectorManager {
    pub fn new(source_fs: f64) -> Self {
        Self {
            source_fs,
            inspectors: BTreeMap::new(),
            order: Vec::new(),
            free: BinaryHeap::new(),
            pending_free: Vec::new(),
            next_handle: 1,
            slots: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn slots(&self) -> SlotTable {
        self.slots.clone()
    }

    pub fn len(&self) -> usize {
        self.inspectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inspectors.is_empty()
    }

    pub fn list(&self) -> Vec<Handle> {
        self.inspectors.keys().copied().collect()
    }

    fn allocate_handle(&mut self) -> Handle {
        match self.free.pop() {
            Some(Reverse(handle)) => handle,
            None => {
                let handle = self.next_handle;
                self.next_handle += 1;
                handle
            }
        }
    }

    /// Open an inspector over `channel`. Replies with the achieved
    /// parameters through an `INSPECTOR { Opened }` message carrying the
    /// caller's `request_id`.
    pub fn open(
        &mut self,
        class: InspectorClass,
        channel: ChannelSpec,
        parent: Option<Handle>,
        request_id: u32,
    ) -> Result<(Handle, Message), Error> {
        if channel.lo >= channel.hi {
            return Err(Error::InvalidChannel {
                lo: channel.lo,
                hi: channel.hi,
            });
        }
        if let Some(parent) = parent {
            if !self.inspectors.contains_key(&parent) {
                return Err(Error::NoSuchHandle(parent));
            }
        }

        let base_fs = match parent {
            Some(parent) => self.inspectors[&parent].equiv_fs,
            None => self.source_fs,
        };
        if channel.bandwidth() > base_fs || channel.fc.abs() > base_fs / 2.0 {
            return Err(Error::ChannelOutOfBand);
        }

        let decimation = decimation_for(base_fs, channel.bandwidth());
        let equiv_fs = base_fs / decimation as f64;
        let config = class.default_config();
        let handle = self.allocate_handle();
        let slot = Arc::new(RequestSlot::default());

        self.slots.lock().insert(handle, slot.clone());
        self.inspectors.insert(
            handle,
            Inspector {
                handle,
                class,
                channel,
                config: config.clone(),
                decimation,
                equiv_fs,
                channelizer: Channelizer::new(base_fs, channel.fc, decimation),
                slot,
                parent,
                pending: Vec::new(),
                tick_out: Vec::new(),
            },
        );
        self.order.push(handle);

        let reply = Message::Inspector(InspectorMessage {
            request_id,
            handle,
            kind: InspectorMessageKind::Opened {
                fc: channel.fc,
                bandwidth: channel.bandwidth(),
                equiv_fs,
                decimation,
                config,
            },
        });

        Ok((handle, reply))
    }

    /// Close an inspector (and any inspectors opened inside its
    /// baseband). Emits one `INSPECTOR { Closed }` per closed handle.
    pub fn close(&mut self, handle: Handle, request_id: u32) -> Result<Vec<Message>, Error> {
        if !self.inspectors.contains_key(&handle) {
            return Err(Error::NoSuchHandle(handle));
        }

        let mut doomed = vec![handle];
        // children of closed inspectors go too, transitively
        loop {
            let more: Vec<Handle> = self
                .inspectors
                .values()
                .filter(|inspector| {
                    inspector
                        .parent
                        .is_some_and(|parent| doomed.contains(&parent))
                        && !doomed.contains(&inspector.handle)
                })
                .map(|inspector| inspector.handle)
                .collect();
            if more.is_empty() {
                break;
            }
            doomed.extend(more);
        }

        let mut replies = Vec::with_capacity(doomed.len());
        for handle in doomed {
            self.inspectors.remove(&handle);
            self.order.retain(|&other| other != handle);
            self.slots.lock().remove(&handle);
            self.pending_free.push(handle);
            replies.push(Message::Inspector(InspectorMessage {
                request_id,
                handle,
                kind: InspectorMessageKind::Closed,
            }));
        }

        Ok(replies)
    }

    pub fn close_all(&mut self) -> Vec<Message> {
        let handles = self.list();
        let mut replies = Vec::new();
        for handle in handles {
            if let Ok(mut batch) = self.close(handle, 0) {
                replies.append(&mut batch);
            }
        }
        replies
    }

    pub fn get_config(&self, handle: Handle) -> Result<Config, Error> {
        self.inspectors
            .get(&handle)
            .map(|inspector| inspector.config.clone())
            .ok_or(Error::NoSuchHandle(handle))
    }

    pub fn set_config(
        &mut self,
        handle: Handle,
        config: Config,
        request_id: u32,
    ) -> Result<Message, Error> {
        let inspector = self
            .inspectors
            .get_mut(&handle)
            .ok_or(Error::NoSuchHandle(handle))?;
        inspector.config = config.clone();
        Ok(Message::Inspector(InspectorMessage {
            request_id,
            handle,
            kind: InspectorMessageKind::ConfigSet(config),
        }))
    }

    pub fn class_of(&self, handle: Handle) -> Option<InspectorClass> {
        self.inspectors.get(&handle).map(|inspector| inspector.class)
    }

    /// Start a sample tick: freed handles become reusable (no in-flight
    /// batch can reference them anymore) and every pending overridable
    /// request is applied.
    pub fn begin_tick(&mut self) {
        for handle in self.pending_free.drain(..) {
            self.free.push(Reverse(handle));
        }

        let source_fs = self.source_fs;
        let parent_fs: HashMap<Handle, f64> = self
            .inspectors
            .values()
            .map(|inspector| (inspector.handle, inspector.equiv_fs))
            .collect();

        for inspector in self.inspectors.values_mut() {
            let Some(request) = inspector.slot.take() else {
                continue;
            };

            let base_fs = inspector.base_fs(source_fs, &parent_fs);
            if let Some(freq) = request.freq {
                inspector.channel.fc = freq;
                inspector.channelizer.retune(freq);
            }
            if let Some(bandwidth) = request.bandwidth {
                let half = bandwidth / 2.0;
                inspector.channel.lo = -half;
                inspector.channel.hi = half;
                inspector.decimation = decimation_for(base_fs, bandwidth);
                inspector.equiv_fs = base_fs / inspector.decimation as f64;
                inspector.channelizer.set_decimation(inspector.decimation);
            }
        }
    }

    /// Run one tick's samples through every inspector, emitting SAMPLES
    /// batches in capture order.
    pub fn process(&mut self, samples: &[Complex<f32>], emit: &mut impl FnMut(Message)) {
        let order = self.order.clone();

        for handle in order {
            let parent = match self.inspectors.get(&handle) {
                Some(inspector) => inspector.parent,
                None => continue,
            };

            // children consume their parent's output of this same tick
            let input: Vec<Complex<f32>> = match parent {
                None => samples.to_vec(),
                Some(parent_handle) => {
                    match self.inspectors.get(&parent_handle) {
                        Some(parent) => parent.tick_out.clone(),
                        None => continue,
                    }
                }
            };

            let Some(inspector) = self.inspectors.get_mut(&handle) else {
                continue;
            };

            inspector.tick_out.clear();
            let mut decimated = Vec::new();
            inspector.channelizer.feed(&input, &mut decimated);
            inspector.tick_out.extend_from_slice(&decimated);
            inspector.pending.extend_from_slice(&decimated);

            while inspector.pending.len() >= SAMPLES_PER_BATCH {
                let batch: Vec<Complex<f32>> =
                    inspector.pending.drain(..SAMPLES_PER_BATCH).collect();
                emit(Message::Samples(SampleBatch {
                    handle,
                    samples: batch,
                }));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel_10k() -> ChannelSpec {
        ChannelSpec {
            fc: 0.0,
            lo: -5000.0,
            hi: 5000.0,
        }
    }

    fn manager() -> InspectorManager {
        InspectorManager::new(1e6)
    }

    #[test]
    fn open_replies_with_request_id_and_equiv_fs() {
        let mut manager = manager();
        let (handle, reply) = manager
            .open(InspectorClass::Audio, channel_10k(), None, 0xc1009)
            .unwrap();

        assert_ne!(handle, 0);
        let Message::Inspector(message) = reply else {
            panic!("expected inspector message");
        };
        assert_eq!(message.request_id, 0xc1009);
        assert_eq!(message.handle, handle);
        match message.kind {
            InspectorMessageKind::Opened {
                equiv_fs,
                decimation,
                ..
            } => {
                assert!(equiv_fs <= 1e6);
                assert!(equiv_fs >= 10_000.0);
                assert!(decimation.is_power_of_two());
            }
            other => panic!("expected Opened, got {other:?}"),
        }
    }

    #[test]
    fn close_emits_closed_and_forgets_handle() {
        let mut manager = manager();
        let (handle, _) = manager
            .open(InspectorClass::Raw, channel_10k(), None, 1)
            .unwrap();

        let replies = manager.close(handle, 2).unwrap();
        assert_eq!(replies.len(), 1);
        assert!(matches!(
            &replies[0],
            Message::Inspector(InspectorMessage {
                kind: InspectorMessageKind::Closed,
                ..
            })
        ));
        assert!(manager.get_config(handle).is_err());
        assert!(matches!(
            manager.close(handle, 3),
            Err(Error::NoSuchHandle(_))
        ));
    }

    #[test]
    fn freed_handle_reused_only_after_tick() {
        let mut manager = manager();
        let handles: Vec<Handle> = (0..10)
            .map(|i| {
                manager
                    .open(InspectorClass::Raw, channel_10k(), None, i)
                    .unwrap()
                    .0
            })
            .collect();

        manager.close(handles[4], 0).unwrap();

        // no tick yet: the freed slot may not be reused
        let (fresh, _) = manager
            .open(InspectorClass::Raw, channel_10k(), None, 99)
            .unwrap();
        assert!(fresh > handles[9]);

        manager.close(fresh, 0).unwrap();
        manager.begin_tick();

        // after a full tick the lowest freed id comes back
        let (reused, _) = manager
            .open(InspectorClass::Raw, channel_10k(), None, 100)
            .unwrap();
        assert_eq!(reused, handles[4]);
    }

    #[test]
    fn handles_are_unique_among_live_inspectors() {
        let mut manager = manager();
        let mut live = Vec::new();
        for i in 0..20 {
            let (handle, _) = manager
                .open(InspectorClass::Raw, channel_10k(), None, i)
                .unwrap();
            assert!(!live.contains(&handle));
            live.push(handle);
        }
    }

    #[test]
    fn overridable_retune_applies_on_tick() {
        let mut manager = manager();
        let (handle, _) = manager
            .open(InspectorClass::Raw, channel_10k(), None, 0)
            .unwrap();

        let slots = manager.slots();
        slots.lock().get(&handle).unwrap().request_freq(25_000.0);
        // latest request wins
        slots.lock().get(&handle).unwrap().request_freq(50_000.0);

        manager.begin_tick();
        let inspector = manager.inspectors.get(&handle).unwrap();
        assert_eq!(inspector.channel.fc, 50_000.0);
        assert!(inspector.slot.take().is_none());
    }

    #[test]
    fn closing_parent_closes_children() {
        let mut manager = manager();
        let (parent, _) = manager
            .open(InspectorClass::Raw, channel_10k(), None, 0)
            .unwrap();
        let child_channel = ChannelSpec {
            fc: 0.0,
            lo: -1000.0,
            hi: 1000.0,
        };
        let (child, _) = manager
            .open(InspectorClass::Raw, child_channel, Some(parent), 1)
            .unwrap();

        let replies = manager.close(parent, 2).unwrap();
        assert_eq!(replies.len(), 2);
        assert!(manager.get_config(child).is_err());
    }

    #[test]
    fn process_emits_batches_in_capture_order() {
        let mut manager = manager();
        let channel = ChannelSpec {
            fc: 0.0,
            lo: -500_000.0,
            hi: 500_000.0,
        };
        let (handle, _) = manager.open(InspectorClass::Raw, channel, None, 0).unwrap();

        let mut emitted = Vec::new();
        let ramp: Vec<Complex<f32>> = (0..2048).map(|i| Complex::new(i as f32, 0.0)).collect();
        manager.begin_tick();
        manager.process(&ramp, &mut |message| emitted.push(message));

        assert!(!emitted.is_empty());
        let mut last = f32::MIN;
        for message in &emitted {
            let Message::Samples(batch) = message else {
                panic!("expected samples");
            };
            assert_eq!(batch.handle, handle);
            for sample in &batch.samples {
                assert!(sample.re > last);
                last = sample.re;
            }
        }
    }
}
