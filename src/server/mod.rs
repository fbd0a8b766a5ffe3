//! The analyzer device server.
//!
//! Accepts TCP clients, authenticates them against the user database,
//! then mirrors a permission-scoped local analyzer onto the connection:
//! outbound messages become PSD superframes or `ENCAP(MESSAGE)`
//! fragments (zlib-compressed above a threshold), inbound `CALL`s become
//! analyzer operations. An optional multicast manager fans the PSD
//! stream out to the discovery group.

pub mod user;

use std::{
    io::Write,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{
            AtomicU8,
            Ordering,
        },
    },
    time::Duration,
};

use rand::Rng;
use tokio::{
    io::AsyncWrite,
    net::{
        TcpListener,
        TcpStream,
    },
    sync::mpsc,
};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

pub use self::user::UserDb;
use crate::{
    analyzer::{
        Analyzer,
        AnalyzerParams,
    },
    buffer::GrowBuf,
    message::Message,
    mq::MessageQueue,
    multicast::{
        McConfig,
        McManager,
    },
    remote::{
        self,
        PROTOCOL_VERSION_MAJOR,
        PROTOCOL_VERSION_MINOR,
        Reassembler,
        SuperframeType,
        call::{
            AUTH_MODE_USER_PASSWORD,
            CallArg,
            NONCE_LENGTH,
            RemoteCall,
            apply_call,
            auth_token,
            token_matches,
        },
        read_fragment,
        split_superframe,
        write_fragment,
    },
    source::SourceConfig,
};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("remote: {0}")]
    Remote(#[from] remote::Error),
    #[error("analyzer: {0}")]
    Analyzer(#[from] crate::analyzer::Error),
    #[error("session idle timeout")]
    IdleTimeout,
    #[error("authentication failed for {0:?}")]
    AuthFailed(String),
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind: SocketAddr,
    pub server_name: String,
    /// profile every session's analyzer is opened over
    pub profile: SourceConfig,
    pub params: AnalyzerParams,
    /// serialized payloads above this size are zlib-compressed; PSD
    /// messages above it travel as PSD superframes instead
    pub compress_threshold: usize,
    pub mtu: usize,
    pub idle_timeout: Duration,
    /// fan the PSD stream and announces out to the discovery group
    pub multicast: Option<McConfig>,
}

impl ServerConfig {
    pub fn new(bind: SocketAddr, profile: SourceConfig) -> Self {
        Self {
            bind,
            server_name: "sigscope".to_owned(),
            profile,
            params: AnalyzerParams::default(),
            compress_threshold: 4096,
            mtu: remote::DEFAULT_MTU,
            idle_timeout: Duration::from_secs(120),
            multicast: None,
        }
    }
}

pub struct AnalyzerServer {
    config: Arc<ServerConfig>,
    users: Arc<UserDb>,
    tcp_listener: TcpListener,
    shutdown: CancellationToken,
    mc_manager: Option<Arc<McManager>>,
}

impl AnalyzerServer {
    pub async fn bind(config: ServerConfig, users: UserDb) -> Result<Self, Error> {
        let tcp_listener = TcpListener::bind(config.bind).await?;

        let mc_manager = match &config.multicast {
            Some(mc_config) => {
                let mut announce = GrowBuf::new();
                config
                    .profile
                    .serialize(&mut announce)
                    .map_err(remote::Error::Cbor)?;
                Some(Arc::new(McManager::start(
                    mc_config.clone(),
                    announce.finalize(),
                )?))
            }
            None => None,
        };

        Ok(Self {
            config: Arc::new(config),
            users: Arc::new(users),
            tcp_listener,
            shutdown: CancellationToken::new(),
            mc_manager,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, Error> {
        Ok(self.tcp_listener.local_addr()?)
    }

    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Serve incoming connections until shut down.
    pub async fn serve(self) -> Result<(), Error> {
        tracing::debug!(server = %self.config.server_name, "waiting for connections");

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                result = self.tcp_listener.accept() => {
                    let (connection, address) = result?;
                    let span = tracing::info_span!("session", %address);
                    let config = self.config.clone();
                    let users = self.users.clone();
                    let shutdown = self.shutdown.clone();
                    let mc_manager = self.mc_manager.clone();

                    tokio::spawn(
                        async move {
                            tracing::debug!("new connection");
                            if let Err(error) =
                                session(connection, config, users, mc_manager, shutdown).await
                            {
                                tracing::info!(%error, "session closed");
                            }
                        }
                        .instrument(span),
                    );
                }
            }
        }

        if let Some(mc_manager) = &self.mc_manager {
            mc_manager.halt();
        }

        Ok(())
    }
}

async fn send_call_fragments<W: AsyncWrite + Unpin>(
    writer: &mut W,
    sf_id: &AtomicU8,
    mtu: usize,
    call: &RemoteCall,
) -> Result<(), remote::Error> {
    let payload = call.encode()?;
    let id = sf_id.fetch_add(1, Ordering::Relaxed);
    for fragment in split_superframe(SuperframeType::Encap, id, &payload, mtu) {
        write_fragment(&mut *writer, &fragment).await?;
    }
    Ok(())
}

fn deflate(payload: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = libflate::zlib::Encoder::new(Vec::new())?;
    encoder.write_all(payload)?;
    Ok(encoder.finish().into_result()?)
}

async fn session(
    connection: TcpStream,
    config: Arc<ServerConfig>,
    users: Arc<UserDb>,
    mc_manager: Option<Arc<McManager>>,
    shutdown: CancellationToken,
) -> Result<(), Error> {
    let (mut tcp_read, mut tcp_write) = connection.into_split();
    let sf_id = Arc::new(AtomicU8::new(0));

    // 1. challenge
    let nonce: [u8; NONCE_LENGTH] = rand::thread_rng().r#gen();
    send_call_fragments(
        &mut tcp_write,
        &sf_id,
        config.mtu,
        &RemoteCall::Auth {
            nonce,
            server_name: config.server_name.clone(),
            mode: AUTH_MODE_USER_PASSWORD,
        },
    )
    .await?;

    // 2. HELLO, within the idle budget
    let hello = tokio::time::timeout(config.idle_timeout, async {
        let mut reassembler = Reassembler::new();
        loop {
            let (header, payload) = read_fragment(&mut tcp_read).await?;
            if let Some(superframe) = reassembler.push(header, &payload)? {
                return RemoteCall::decode(&superframe.payload);
            }
        }
    })
    .await
    .map_err(|_| Error::IdleTimeout)??;

    let RemoteCall::Hello {
        version_major,
        version_minor,
        user,
        auth_token: received_token,
    } = hello
    else {
        return Err(remote::Error::BadArguments("expected HELLO").into());
    };

    if version_major != PROTOCOL_VERSION_MAJOR || version_minor < PROTOCOL_VERSION_MINOR {
        return Err(remote::Error::VersionMismatch {
            major: version_major,
            minor: version_minor,
        }
        .into());
    }

    // 3. authenticate: unknown users and wrong tokens fail identically
    let record = users.lookup(&user);
    let expected = record
        .map(|record| auth_token(&record.password, &nonce))
        .unwrap_or_else(|| auth_token("", &nonce));
    if record.is_none() || !token_matches(&expected, &received_token) {
        return Err(Error::AuthFailed(user));
    }
    let permissions = record.expect("record checked above").permissions;

    tracing::info!(%user, ?permissions, "authenticated");

    // 4. analyzer scoped by the user's permission mask
    let mq = Arc::new(MessageQueue::new());
    let analyzer = {
        let config = config.clone();
        let mq = mq.clone();
        tokio::task::spawn_blocking(move || {
            Analyzer::open_with_permissions(config.params, &config.profile, mq, permissions)
        })
        .await
        .expect("analyzer open task panicked")?
    };
    let analyzer = Arc::new(analyzer);

    // 5. relay loops
    let session_cancel = shutdown.child_token();
    let (message_sender, message_receiver) = mpsc::channel::<Message>(64);

    // bridge the blocking message queue into the async writer
    let drain = std::thread::Builder::new()
        .name("session-drain".into())
        .spawn({
            let mq = mq.clone();
            let cancel = session_cancel.clone();
            move || {
                while !cancel.is_cancelled() {
                    let Some(message) = mq.read_timeout(Duration::from_millis(100)) else {
                        continue;
                    };
                    let last = matches!(message, Message::Eos(_) | Message::ReadError(_));
                    if message_sender.blocking_send(message).is_err() {
                        break;
                    }
                    if last {
                        break;
                    }
                }
            }
        })
        .map_err(Error::Io)?;

    let writer = tokio::spawn({
        let config = config.clone();
        let sf_id = sf_id.clone();
        let cancel = session_cancel.clone();
        async move {
            let result = relay_messages(
                &mut tcp_write,
                message_receiver,
                &config,
                &sf_id,
                mc_manager.as_deref(),
                &cancel,
            )
            .await;
            // polite shutdown, best effort; the reader leg stops with us
            let _ = send_call_fragments(
                &mut tcp_write,
                &sf_id,
                config.mtu,
                &RemoteCall::Shutdown,
            )
            .await;
            cancel.cancel();
            result
        }
    });

    let read_result = relay_calls(
        &mut tcp_read,
        &analyzer,
        config.idle_timeout,
        &session_cancel,
    )
    .await;

    session_cancel.cancel();
    analyzer.halt();
    let _ = writer.await;
    let _ = drain.join();

    read_result
}

/// Outbound leg: analyzer messages → fragments.
async fn relay_messages<W: AsyncWrite + Unpin>(
    tcp_write: &mut W,
    mut message_receiver: mpsc::Receiver<Message>,
    config: &ServerConfig,
    sf_id: &AtomicU8,
    mc_manager: Option<&McManager>,
    cancel: &CancellationToken,
) -> Result<(), remote::Error> {
    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => break,
            message = message_receiver.recv() => {
                match message {
                    Some(message) => message,
                    None => break,
                }
            }
        };

        if let Message::Psd(psd) = &message {
            if let Some(mc_manager) = mc_manager {
                mc_manager.send_psd(psd);
            }

            let encoded = remote::encode_psd_superframe(psd);
            if encoded.len() > config.compress_threshold {
                let id = sf_id.fetch_add(1, Ordering::Relaxed);
                for fragment in
                    split_superframe(SuperframeType::Psd, id, &encoded, config.mtu)
                {
                    write_fragment(&mut *tcp_write, &fragment).await?;
                }
                continue;
            }
        }

        let mut buf = GrowBuf::new();
        message.serialize(&mut buf)?;
        let payload = buf.finalize();

        let (payload, compressed) = if payload.len() > config.compress_threshold {
            match deflate(&payload) {
                Ok(deflated) if deflated.len() < payload.len() => (deflated, true),
                _ => (payload, false),
            }
        }
        else {
            (payload, false)
        };

        send_call_fragments(
            tcp_write,
            sf_id,
            config.mtu,
            &RemoteCall::Message {
                kind: message.kind(),
                compressed,
                payload,
            },
        )
        .await?;

        if matches!(message, Message::Eos(_) | Message::ReadError(_)) {
            break;
        }
    }

    Ok(())
}

/// Inbound leg: fragments → analyzer operations.
async fn relay_calls(
    tcp_read: &mut tokio::net::tcp::OwnedReadHalf,
    analyzer: &Analyzer,
    idle_timeout: Duration,
    cancel: &CancellationToken,
) -> Result<(), Error> {
    let mut reassembler = Reassembler::new();

    loop {
        let read = tokio::select! {
            _ = cancel.cancelled() => break,
            read = tokio::time::timeout(idle_timeout, read_fragment(&mut *tcp_read)) => read,
        };
        let (header, payload) = match read {
            Ok(Ok(fragment)) => fragment,
            Ok(Err(remote::Error::Io(error)))
                if error.kind() == std::io::ErrorKind::UnexpectedEof =>
            {
                tracing::debug!("peer closed the connection");
                break;
            }
            Ok(Err(error)) => return Err(error.into()),
            Err(_) => return Err(Error::IdleTimeout),
        };

        let Some(superframe) = reassembler.push(header, &payload)? else {
            continue;
        };
        if superframe.sf_type != SuperframeType::Encap {
            continue;
        }

        match RemoteCall::decode(&superframe.payload)? {
            RemoteCall::Call { method, args } => {
                dispatch_call(&method, &args, analyzer)?;
            }
            RemoteCall::Shutdown => {
                tracing::debug!("client sent SHUTDOWN");
                break;
            }
            other => {
                tracing::warn!(?other, "unexpected call from client");
                break;
            }
        }
    }

    Ok(())
}

fn dispatch_call(method: &str, args: &[CallArg], analyzer: &Analyzer) -> Result<(), Error> {
    if method == "analyzer.halt" {
        if analyzer
            .permissions()
            .contains(crate::source::Permissions::HALT)
        {
            analyzer.halt();
        }
        return Ok(());
    }

    apply_call(method, args, analyzer)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deflate_round_trips_through_inflate() {
        let payload: Vec<u8> = (0..10_000u32).map(|value| (value % 7) as u8).collect();
        let deflated = deflate(&payload).unwrap();
        assert!(deflated.len() < payload.len());

        let mut decoder = libflate::zlib::Decoder::new(&deflated[..]).unwrap();
        let mut inflated = Vec::new();
        std::io::Read::read_to_end(&mut decoder, &mut inflated).unwrap();
        assert_eq!(inflated, payload);
    }
}
