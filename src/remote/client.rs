//! Client side of the remote analyzer protocol.
//!
//! Connects to a device server, answers its AUTH challenge, then
//! presents the same message-queue read interface a local analyzer
//! offers: mirrored messages (including reassembled PSD superframes)
//! arrive on an internal queue, while control calls are forwarded as
//! `CALL` objects.

use std::{
    io::Read,
    sync::{
        Arc,
        atomic::{
            AtomicU8,
            Ordering,
        },
    },
    time::Duration,
};

use tokio::{
    io::AsyncWrite,
    net::{
        TcpStream,
        ToSocketAddrs,
        tcp::OwnedReadHalf,
    },
    sync::mpsc,
};
use tokio_util::sync::CancellationToken;

use crate::{
    message::Message,
    mq::MessageQueue,
    remote::{
        Error,
        PROTOCOL_VERSION_MAJOR,
        PROTOCOL_VERSION_MINOR,
        Reassembler,
        Superframe,
        SuperframeType,
        call::{
            CallArg,
            RemoteCall,
            auth_token,
        },
        decode_psd_superframe,
        read_fragment,
        split_superframe,
        write_fragment,
    },
};

const CALL_QUEUE_SIZE: usize = 32;

pub struct RemoteClient {
    mq: Arc<MessageQueue>,
    call_sender: mpsc::Sender<RemoteCall>,
    cancel: CancellationToken,
    server_name: String,
}

impl RemoteClient {
    /// Connect and authenticate against a device server.
    pub async fn connect<A: ToSocketAddrs>(
        address: A,
        user: &str,
        password: &str,
    ) -> Result<Self, Error> {
        let tcp = TcpStream::connect(address).await?;
        let (mut tcp_read, mut tcp_write) = tcp.into_split();
        let sf_id = Arc::new(AtomicU8::new(0));

        // the server speaks first
        let auth = read_superframe(&mut tcp_read).await?;
        let RemoteCall::Auth {
            nonce, server_name, ..
        } = RemoteCall::decode(&auth.payload)?
        else {
            return Err(Error::BadArguments("expected AUTH"));
        };

        let hello = RemoteCall::Hello {
            version_major: PROTOCOL_VERSION_MAJOR,
            version_minor: PROTOCOL_VERSION_MINOR,
            user: user.to_owned(),
            auth_token: auth_token(password, &nonce),
        };
        send_call(&mut tcp_write, &sf_id, &hello).await?;

        let mq = Arc::new(MessageQueue::new());
        let cancel = CancellationToken::new();
        let (call_sender, call_receiver) = mpsc::channel(CALL_QUEUE_SIZE);

        tokio::spawn({
            let mq = mq.clone();
            let cancel = cancel.clone();
            async move {
                if let Err(error) = relay_inbound(tcp_read, mq, cancel).await {
                    tracing::debug!(%error, "remote client reader finished");
                }
            }
        });

        tokio::spawn({
            let cancel = cancel.clone();
            async move {
                if let Err(error) =
                    relay_outbound(tcp_write, sf_id, call_receiver, cancel).await
                {
                    tracing::debug!(%error, "remote client writer finished");
                }
            }
        });

        Ok(Self {
            mq,
            call_sender,
            cancel,
            server_name,
        })
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    /// Mirror of [`crate::analyzer::Analyzer::read_message`].
    pub fn read_message(&self, timeout: Duration) -> Option<Message> {
        self.mq.read_timeout(timeout)
    }

    pub fn message_queue(&self) -> Arc<MessageQueue> {
        self.mq.clone()
    }

    pub async fn call(&self, method: &str, args: Vec<CallArg>) -> Result<(), Error> {
        self.call_sender
            .send(RemoteCall::Call {
                method: method.to_owned(),
                args,
            })
            .await
            .map_err(|_| Error::ConnectionClosed)
    }

    pub async fn set_frequency(&self, freq: f64) -> Result<(), Error> {
        self.call("source.set_freq", vec![CallArg::Double(freq)]).await
    }

    pub async fn set_gain(&self, name: &str, value: f32) -> Result<(), Error> {
        self.call(
            "source.set_gain",
            vec![CallArg::Str(name.to_owned()), CallArg::Double(value as f64)],
        )
        .await
    }

    pub async fn shutdown(self) -> Result<(), Error> {
        let _ = self.call_sender.send(RemoteCall::Shutdown).await;
        self.cancel.cancel();
        Ok(())
    }
}

impl Drop for RemoteClient {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn read_superframe(reader: &mut OwnedReadHalf) -> Result<Superframe, Error> {
    let mut reassembler = Reassembler::new();
    loop {
        let (header, payload) = read_fragment(&mut *reader).await?;
        if let Some(superframe) = reassembler.push(header, &payload)? {
            return Ok(superframe);
        }
    }
}

async fn send_call<W: AsyncWrite + Unpin>(
    writer: &mut W,
    sf_id: &AtomicU8,
    call: &RemoteCall,
) -> Result<(), Error> {
    let payload = call.encode()?;
    let id = sf_id.fetch_add(1, Ordering::Relaxed);
    for fragment in split_superframe(SuperframeType::Encap, id, &payload, super::DEFAULT_MTU) {
        write_fragment(&mut *writer, &fragment).await?;
    }
    Ok(())
}

fn inflate(payload: &[u8]) -> Result<Vec<u8>, Error> {
    let mut decoder = libflate::zlib::Decoder::new(payload)?;
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

async fn relay_inbound(
    mut tcp_read: OwnedReadHalf,
    mq: Arc<MessageQueue>,
    cancel: CancellationToken,
) -> Result<(), Error> {
    let mut reassembler = Reassembler::new();

    loop {
        let (header, payload) = tokio::select! {
            _ = cancel.cancelled() => break,
            result = read_fragment(&mut tcp_read) => result?,
        };

        let Some(superframe) = reassembler.push(header, &payload)? else {
            continue;
        };

        match superframe.sf_type {
            SuperframeType::Psd => {
                let message = decode_psd_superframe(&superframe.payload)?;
                mq.write(Message::Psd(message));
            }
            SuperframeType::Encap => {
                match RemoteCall::decode(&superframe.payload)? {
                    RemoteCall::Message {
                        kind,
                        compressed,
                        payload,
                    } => {
                        let raw = if compressed {
                            inflate(&payload)?
                        }
                        else {
                            payload
                        };
                        let mut cursor = &raw[..];
                        let message = Message::deserialize(kind, &mut cursor)?;
                        mq.write(message);
                    }
                    RemoteCall::Shutdown => {
                        tracing::debug!("server sent SHUTDOWN");
                        mq.write(Message::Halt);
                        break;
                    }
                    other => {
                        tracing::warn!(?other, "unexpected call from server");
                    }
                }
            }
            SuperframeType::Announce => {}
        }
    }

    Ok(())
}

async fn relay_outbound(
    mut tcp_write: tokio::net::tcp::OwnedWriteHalf,
    sf_id: Arc<AtomicU8>,
    mut call_receiver: mpsc::Receiver<RemoteCall>,
    cancel: CancellationToken,
) -> Result<(), Error> {
    loop {
        let call = tokio::select! {
            _ = cancel.cancelled() => break,
            call = call_receiver.recv() => {
                match call {
                    Some(call) => call,
                    None => break,
                }
            }
        };

        let done = matches!(call, RemoteCall::Shutdown);
        send_call(&mut tcp_write, &sf_id, &call).await?;
        if done {
            break;
        }
    }

    Ok(())
}
