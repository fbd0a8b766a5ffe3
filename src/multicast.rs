//! UDP multicast superframe fan-out.
//!
//! One socket per declared interface, two pumps: the tx pump drains an
//! internal fragment queue onto the group, and the announce pump emits a
//! periodic ANNOUNCE beacon advertising the served profile, suppressed
//! while real traffic is flowing. Fragments are built in MTU-sized
//! buffers drawn from a small pool; pool exhaustion falls back to plain
//! heap allocation.

use std::{
    net::{
        Ipv4Addr,
        SocketAddrV4,
        UdpSocket,
    },
    sync::{
        Arc,
        atomic::{
            AtomicU8,
            Ordering,
        },
    },
    time::{
        Duration,
        Instant,
    },
};

use bytes::BufMut;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{
    message::{
        Message,
        PsdMessage,
    },
    remote::{
        self,
        FragmentHeader,
        HEADER_LENGTH,
        SuperframeType,
        call::RemoteCall,
        encode_psd_superframe,
    },
};

/// Discovery/fan-out group shared by servers and clients.
pub const MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(224, 4, 4, 4);
pub const MULTICAST_PORT: u16 = 5555;

/// Largest announce datagram payload.
pub const ANNOUNCE_MAX_SIZE: usize = 4096;

const FRAG_QUEUE_SIZE: usize = 256;
const POOL_SIZE: usize = 64;

#[derive(Clone, Debug)]
pub struct McConfig {
    /// IPs of the local interfaces to transmit on
    pub interfaces: Vec<Ipv4Addr>,
    pub group: Ipv4Addr,
    pub port: u16,
    pub mtu: usize,
    /// announce period
    pub announce_delay: Duration,
    /// suppress the announce if the tx pump transmitted this recently
    pub announce_start: Duration,
}

impl Default for McConfig {
    fn default() -> Self {
        Self {
            interfaces: vec![Ipv4Addr::UNSPECIFIED],
            group: MULTICAST_GROUP,
            port: MULTICAST_PORT,
            mtu: remote::DEFAULT_MTU,
            announce_delay: Duration::from_millis(1000),
            announce_start: Duration::from_millis(500),
        }
    }
}

/// Fixed-size frame pool. `acquire` falls back to the heap when empty.
struct FramePool {
    free: Mutex<Vec<Vec<u8>>>,
    frame_size: usize,
}

impl FramePool {
    fn new(frame_size: usize) -> Self {
        Self {
            free: Mutex::new(Vec::with_capacity(POOL_SIZE)),
            frame_size,
        }
    }

    fn acquire(&self) -> Vec<u8> {
        self.free
            .lock()
            .pop()
            .unwrap_or_else(|| Vec::with_capacity(self.frame_size))
    }

    fn release(&self, mut frame: Vec<u8>) {
        let mut free = self.free.lock();
        if free.len() < POOL_SIZE {
            frame.clear();
            free.push(frame);
        }
    }
}

pub struct McManager {
    config: McConfig,
    frag_sender: mpsc::Sender<Vec<u8>>,
    pool: Arc<FramePool>,
    sf_id: AtomicU8,
    cancel: CancellationToken,
}

impl McManager {
    /// Bind the per-interface sockets and start both pumps. `announce`
    /// is the CBOR profile object beaconed to the group.
    pub fn start(config: McConfig, announce: Vec<u8>) -> std::io::Result<Self> {
        assert!(
            announce.len() <= ANNOUNCE_MAX_SIZE,
            "announce payload exceeds {ANNOUNCE_MAX_SIZE} bytes"
        );

        let group = SocketAddrV4::new(config.group, config.port);
        let mut sockets = Vec::with_capacity(config.interfaces.len());
        for interface in &config.interfaces {
            let socket = UdpSocket::bind(SocketAddrV4::new(*interface, 0))?;
            socket.set_nonblocking(true)?;
            sockets.push(tokio::net::UdpSocket::from_std(socket)?);
        }
        let sockets = Arc::new(sockets);

        let pool = Arc::new(FramePool::new(config.mtu));
        let cancel = CancellationToken::new();
        let (frag_sender, frag_receiver) = mpsc::channel(FRAG_QUEUE_SIZE);
        let last_tx = Arc::new(Mutex::new(
            Instant::now()
                .checked_sub(config.announce_delay)
                .unwrap_or_else(Instant::now),
        ));

        tokio::spawn(tx_pump(
            sockets.clone(),
            group,
            frag_receiver,
            pool.clone(),
            last_tx.clone(),
            cancel.clone(),
        ));

        tokio::spawn(announce_pump(
            sockets,
            group,
            announce,
            config.clone(),
            last_tx,
            cancel.clone(),
        ));

        Ok(Self {
            config,
            frag_sender,
            pool,
            sf_id: AtomicU8::new(0),
            cancel,
        })
    }

    pub fn halt(&self) {
        self.cancel.cancel();
    }

    /// Split a superframe payload into pooled fragments and enqueue the
    /// burst. Fragments of one superframe are transmitted in offset
    /// order and never interleave with other superframes.
    fn enqueue_superframe(&self, sf_type: SuperframeType, payload: &[u8]) -> bool {
        let usable = self.config.mtu - HEADER_LENGTH;
        let sf_id = self.sf_id.fetch_add(1, Ordering::Relaxed);
        let sf_size = payload.len() as u32;

        let mut offset = 0usize;
        while offset < payload.len() {
            let size = usable.min(payload.len() - offset);

            let mut frame = self.pool.acquire();
            FragmentHeader {
                sf_type,
                sf_id,
                size: size as u16,
                sf_size,
                sf_offset: offset as u32,
            }
            .encode(&mut frame);
            frame.put_slice(&payload[offset..offset + size]);

            if self.frag_sender.try_send(frame).is_err() {
                tracing::warn!("fan-out queue full; dropping superframe tail");
                return false;
            }

            offset += size;
        }

        true
    }

    pub fn send_psd(&self, message: &PsdMessage) -> bool {
        self.enqueue_superframe(SuperframeType::Psd, &encode_psd_superframe(message))
    }

    pub fn send_call(&self, call: &RemoteCall) -> bool {
        match call.encode() {
            Ok(payload) => self.enqueue_superframe(SuperframeType::Encap, &payload),
            Err(error) => {
                tracing::error!(%error, "cannot encode call for fan-out");
                false
            }
        }
    }

    /// Encapsulate an analyzer message and enqueue it.
    pub fn send_message(&self, message: &Message) -> bool {
        let mut buf = crate::buffer::GrowBuf::new();
        if let Err(error) = message.serialize(&mut buf) {
            tracing::error!(%error, "cannot serialize message for fan-out");
            return false;
        }
        self.send_call(&RemoteCall::Message {
            kind: message.kind(),
            compressed: false,
            payload: buf.finalize(),
        })
    }
}

impl Drop for McManager {
    fn drop(&mut self) {
        self.halt();
    }
}

async fn tx_pump(
    sockets: Arc<Vec<tokio::net::UdpSocket>>,
    group: SocketAddrV4,
    mut frag_receiver: mpsc::Receiver<Vec<u8>>,
    pool: Arc<FramePool>,
    last_tx: Arc<Mutex<Instant>>,
    cancel: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = frag_receiver.recv() => {
                match frame {
                    Some(frame) => frame,
                    None => break,
                }
            }
        };

        for socket in sockets.iter() {
            if let Err(error) = socket.send_to(&frame, group).await {
                tracing::warn!(%error, "multicast send failed");
            }
        }

        *last_tx.lock() = Instant::now();
        pool.release(frame);
    }

    tracing::debug!("tx pump finished");
}

async fn announce_pump(
    sockets: Arc<Vec<tokio::net::UdpSocket>>,
    group: SocketAddrV4,
    announce: Vec<u8>,
    config: McConfig,
    last_tx: Arc<Mutex<Instant>>,
    cancel: CancellationToken,
) {
    let mut sf_id = 0u8;
    let mut ticker = tokio::time::interval(config.announce_delay);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        if last_tx.lock().elapsed() < config.announce_start {
            continue;
        }

        let mut frame = Vec::with_capacity(HEADER_LENGTH + announce.len());
        FragmentHeader {
            sf_type: SuperframeType::Announce,
            sf_id,
            size: announce.len() as u16,
            sf_size: announce.len() as u32,
            sf_offset: 0,
        }
        .encode(&mut frame);
        frame.extend_from_slice(&announce);
        sf_id = sf_id.wrapping_add(1);

        for socket in sockets.iter() {
            if let Err(error) = socket.send_to(&frame, group).await {
                tracing::warn!(%error, "announce send failed");
            }
        }
    }

    tracing::debug!("announce pump finished");
}
