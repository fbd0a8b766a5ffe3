//! Device discovery.
//!
//! A background listener joins the discovery multicast group and
//! harvests announced source profiles into a UUID-keyed device map; two
//! announces describing the same device coalesce. A separate SoapySDR
//! enumerator (behind the `soapysdr` feature) lists local hardware with
//! per-driver fixups.

use std::{
    collections::BTreeMap,
    net::{
        IpAddr,
        Ipv4Addr,
        SocketAddrV4,
        UdpSocket,
    },
    sync::Arc,
    time::Duration,
};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::{
    multicast::{
        ANNOUNCE_MAX_SIZE,
        MULTICAST_GROUP,
        MULTICAST_PORT,
    },
    source::{
        config::SourceConfig,
        device::{
            DeviceAccess,
            DeviceProperties,
            DeviceSpec,
        },
    },
};

/// Environment variable naming the interface IP to listen on. Discovery
/// stays off unless it is set and non-empty.
pub const DISCOVERY_IF_ENV: &str = "SIGSCOPE_DISCOVERY_IF";

/// How long [`Discovery::discovery`] lets announces accumulate before
/// snapshotting.
pub const SETTLE_DELAY: Duration = Duration::from_secs(2);

pub struct Discovery {
    devices: Arc<Mutex<BTreeMap<u64, DeviceProperties>>>,
    cancel: CancellationToken,
}

impl Discovery {
    /// Join the group on `interface` and start harvesting announces.
    pub fn start(interface: Ipv4Addr) -> std::io::Result<Self> {
        Self::start_on(interface, MULTICAST_GROUP, MULTICAST_PORT)
    }

    pub fn start_on(
        interface: Ipv4Addr,
        group: Ipv4Addr,
        port: u16,
    ) -> std::io::Result<Self> {
        let socket = UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port))?;
        if group.is_multicast() {
            socket.join_multicast_v4(&group, &interface)?;
        }
        socket.set_nonblocking(true)?;
        let socket = tokio::net::UdpSocket::from_std(socket)?;

        let devices = Arc::new(Mutex::new(BTreeMap::new()));
        let cancel = CancellationToken::new();

        tokio::spawn(listener(socket, devices.clone(), cancel.clone()));

        Ok(Self { devices, cancel })
    }

    /// Start discovery if `SIGSCOPE_DISCOVERY_IF` names an interface.
    pub fn from_env() -> Option<std::io::Result<Self>> {
        let value = std::env::var(DISCOVERY_IF_ENV).ok()?;
        if value.is_empty() {
            return None;
        }
        let interface: Ipv4Addr = match value.parse() {
            Ok(interface) => interface,
            Err(_) => {
                tracing::error!(%value, "ignoring malformed {DISCOVERY_IF_ENV}");
                return None;
            }
        };
        Some(Self::start(interface))
    }

    /// Snapshot the device list after a short settle delay.
    pub async fn discovery(&self) -> Vec<DeviceProperties> {
        tokio::time::sleep(SETTLE_DELAY).await;
        self.snapshot()
    }

    /// Snapshot the device list right now.
    pub fn snapshot(&self) -> Vec<DeviceProperties> {
        self.devices.lock().values().cloned().collect()
    }

    pub fn halt(&self) {
        self.cancel.cancel();
    }
}

impl Drop for Discovery {
    fn drop(&mut self) {
        self.halt();
    }
}

async fn listener(
    socket: tokio::net::UdpSocket,
    devices: Arc<Mutex<BTreeMap<u64, DeviceProperties>>>,
    cancel: CancellationToken,
) {
    let mut datagram = [0u8; ANNOUNCE_MAX_SIZE];

    loop {
        let (size, peer) = tokio::select! {
            _ = cancel.cancelled() => break,
            result = socket.recv_from(&mut datagram) => {
                match result {
                    Ok(received) => received,
                    Err(error) => {
                        tracing::warn!(%error, "discovery receive failed");
                        continue;
                    }
                }
            }
        };

        let mut cursor = &datagram[..size];
        let mut config = match SourceConfig::deserialize(&mut cursor) {
            Ok(config) => config,
            Err(error) => {
                tracing::debug!(%peer, %error, "dropping malformed announce");
                continue;
            }
        };

        // never trust the announced host: the packet's source address is
        // where the device actually lives
        let host = match peer.ip() {
            IpAddr::V4(host) => host.to_string(),
            IpAddr::V6(host) => host.to_string(),
        };
        config.device_spec.set("host", host);

        upsert(&devices, config);
    }

    tracing::debug!("discovery listener finished");
}

fn upsert(devices: &Mutex<BTreeMap<u64, DeviceProperties>>, config: SourceConfig) {
    let mut spec = DeviceSpec::new(DeviceAccess::Remote, config.ty.name());
    spec.params = config.device_spec.clone();

    let label = config
        .label
        .clone()
        .or_else(|| {
            config
                .device_spec
                .get("host")
                .map(|host| format!("{} @ {host}", config.ty.name()))
        })
        .unwrap_or_else(|| config.ty.name().to_owned());

    let mut properties = DeviceProperties::from_spec(label, spec);
    properties.config = Some(config);

    let mut devices = devices.lock();
    let uuid = properties.uuid;
    if devices.insert(uuid, properties).is_none() {
        tracing::debug!(uuid = format_args!("{uuid:016x}"), "discovered device");
    }
}

/// Enumerate local SoapySDR hardware, applying the usual per-driver
/// rate-list fixups.
#[cfg(feature = "soapysdr")]
pub fn enumerate_soapy_devices() -> Result<Vec<DeviceProperties>, crate::source::Error> {
    use soapysdr::Direction;

    let mut out = Vec::new();

    for args in soapysdr::enumerate("")? {
        let mut spec = DeviceSpec::new(DeviceAccess::Local, "soapysdr");
        for (key, value) in args.iter() {
            spec.params.set(key, value);
        }

        let label = args
            .get("label")
            .map(str::to_owned)
            .unwrap_or_else(|| "SoapySDR device".to_owned());
        let driver = args.get("driver").unwrap_or_default().to_owned();

        let mut properties = DeviceProperties::from_spec(label, spec);

        if let Ok(device) = soapysdr::Device::new(args) {
            if let Ok(antennas) = device.antennas(Direction::Rx, 0) {
                properties.antennas = antennas;
            }
            if let Ok(gains) = device.list_gains(Direction::Rx, 0) {
                properties.gain_names = gains;
            }
            if let Ok(ranges) = device.get_sample_rate_range(Direction::Rx, 0) {
                for range in ranges {
                    properties.samp_rates.push(range.minimum);
                    if range.maximum != range.minimum {
                        properties.samp_rates.push(range.maximum);
                    }
                }
            }
        }

        apply_driver_fixups(&driver, &mut properties.samp_rates);
        out.push(properties);
    }

    Ok(out)
}

/// Known driver quirks: airspy hides its 10 Msps mode, rtlsdr reports
/// rates it cannot actually sustain.
#[allow(dead_code)]
fn apply_driver_fixups(driver: &str, samp_rates: &mut Vec<f64>) {
    match driver {
        "airspy" => {
            if !samp_rates.iter().any(|&rate| rate == 10e6) {
                samp_rates.push(10e6);
            }
        }
        "rtlsdr" => {
            samp_rates.retain(|&rate| rate >= 1e6);
        }
        _ => {}
    }
}
