//! End-to-end scenarios against a synthetic source: PSD loopback,
//! retune round trips, inspector lifecycle, and the remote session
//! handshake over a real TCP pair.

use std::{
    sync::Arc,
    time::Duration,
};

use sigscope::{
    Analyzer,
    AnalyzerParams,
    Message,
    MessageKind,
    MessageQueue,
    SourceConfig,
    SourceType,
    inspector::{
        ChannelSpec,
        InspectorClass,
    },
    message::InspectorMessageKind,
    psd::{
        PsdParams,
        WindowFunction,
    },
    remote::{
        PROTOCOL_VERSION_MAJOR,
        PROTOCOL_VERSION_MINOR,
        Reassembler,
        SuperframeType,
        call::{
            CallArg,
            NONCE_LENGTH,
            RemoteCall,
        },
        client::RemoteClient,
        read_fragment,
        split_superframe,
    },
    server::{
        AnalyzerServer,
        ServerConfig,
        UserDb,
    },
    source::Permissions,
};

fn tonegen_profile() -> SourceConfig {
    let mut config = SourceConfig::new(SourceType::ToneGen);
    config.freq = 100e6;
    config.samp_rate = 1e6;
    config
}

fn analyzer_params() -> AnalyzerParams {
    AnalyzerParams {
        detector: PsdParams {
            window: WindowFunction::Hann,
            window_size: 1024,
            refresh_rate: 25.0,
        },
        ..Default::default()
    }
}

#[test]
fn loopback_psd_peaks_in_the_tone_bin() {
    let mq = Arc::new(MessageQueue::new());
    let analyzer = Analyzer::open(analyzer_params(), &tonegen_profile(), mq.clone()).unwrap();

    // tune 1 kHz below the tone: it shows up at +1 kHz, i.e. bin 1
    analyzer.set_frequency(100e6 - 1e3);
    let _ = mq.wait_for(&[MessageKind::SourceInfo], Duration::from_secs(2));

    // skip the first PSD; it may straddle the retune
    let mut peak = None;
    for _ in 0..5 {
        let message = mq
            .wait_for(&[MessageKind::Psd], Duration::from_secs(2))
            .expect("psd message");
        let Message::Psd(psd) = message else {
            unreachable!()
        };
        assert_eq!(psd.psd.len(), 1024);

        let argmax = psd
            .psd
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(index, _)| index)
            .unwrap();
        peak = Some(argmax);
        if argmax == 1 {
            break;
        }
    }

    assert_eq!(peak, Some(1), "tone did not land in bin 1");
    analyzer.halt();
}

#[test]
fn retune_reflects_in_source_info_within_one_tick() {
    let mq = Arc::new(MessageQueue::new());
    let analyzer = Analyzer::open(analyzer_params(), &tonegen_profile(), mq.clone()).unwrap();

    // startup snapshot
    let _ = mq.wait_for(&[MessageKind::SourceInfo], Duration::from_secs(1));

    analyzer.set_frequency(200e6);
    let message = mq
        .wait_for(&[MessageKind::SourceInfo], Duration::from_secs(2))
        .expect("source info after set_freq");
    let Message::SourceInfo(info) = message else {
        unreachable!()
    };
    assert_eq!(info.frequency, 200e6);

    analyzer.halt();
}

#[test]
fn inspector_open_emits_reply_before_samples() {
    let mq = Arc::new(MessageQueue::new());
    let analyzer = Analyzer::open(analyzer_params(), &tonegen_profile(), mq.clone()).unwrap();

    analyzer.open_inspector(
        InspectorClass::Audio,
        ChannelSpec {
            fc: 0.0,
            lo: -5000.0,
            hi: 5000.0,
        },
        None,
        0xc1009,
    );

    // scan the stream in order: the Opened reply must precede any
    // SAMPLES message carrying its handle
    let mut handle = None;
    let deadline = std::time::Instant::now() + Duration::from_secs(3);
    while std::time::Instant::now() < deadline {
        let Some(message) = mq.read_timeout(Duration::from_millis(200)) else {
            continue;
        };
        match message {
            Message::Inspector(reply) => {
                assert_eq!(reply.request_id, 0xc1009);
                match reply.kind {
                    InspectorMessageKind::Opened { equiv_fs, .. } => {
                        assert!(equiv_fs <= 1e6);
                        handle = Some(reply.handle);
                        break;
                    }
                    other => panic!("expected Opened, got {other:?}"),
                }
            }
            Message::Samples(batch) => {
                panic!("samples for handle {} before Opened reply", batch.handle);
            }
            _ => {}
        }
    }
    let handle = handle.expect("inspector opened");
    assert_ne!(handle, 0);

    // and samples do flow for that handle
    let message = mq
        .wait_for(&[MessageKind::Samples], Duration::from_secs(3))
        .expect("decimated samples");
    let Message::Samples(batch) = message else {
        unreachable!()
    };
    assert_eq!(batch.handle, handle);

    analyzer.close_inspector(handle, 77);
    let deadline = std::time::Instant::now() + Duration::from_secs(3);
    let mut closed = false;
    while std::time::Instant::now() < deadline {
        let Some(message) = mq.wait_for(&[MessageKind::Inspector], Duration::from_millis(200))
        else {
            continue;
        };
        let Message::Inspector(reply) = message else {
            unreachable!()
        };
        if matches!(reply.kind, InspectorMessageKind::Closed) {
            assert_eq!(reply.handle, handle);
            closed = true;
            break;
        }
    }
    assert!(closed, "no Closed reply");

    analyzer.halt();
}

fn users_with_bob() -> UserDb {
    let mut users = UserDb::new();
    users.register("bob", "builder", Permissions::all());
    users
}

async fn start_server() -> (std::net::SocketAddr, tokio::task::JoinHandle<()>) {
    let mut config = ServerConfig::new("127.0.0.1:0".parse().unwrap(), tonegen_profile());
    config.params = analyzer_params();
    config.idle_timeout = Duration::from_secs(5);

    let server = AnalyzerServer::bind(config, users_with_bob()).await.unwrap();
    let address = server.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        let _ = server.serve().await;
    });
    (address, handle)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn wrong_hmac_closes_the_session_without_leaking_messages() {
    let (address, server) = start_server().await;

    let mut tcp = tokio::net::TcpStream::connect(address).await.unwrap();

    // read the AUTH challenge
    let mut reassembler = Reassembler::new();
    let auth = loop {
        let (header, payload) = read_fragment(&mut tcp).await.unwrap();
        if let Some(superframe) = reassembler.push(header, &payload).unwrap() {
            break superframe;
        }
    };
    let RemoteCall::Auth { .. } = RemoteCall::decode(&auth.payload).unwrap() else {
        panic!("expected AUTH first");
    };

    // answer with a well-formed HELLO carrying a bogus token
    let hello = RemoteCall::Hello {
        version_major: PROTOCOL_VERSION_MAJOR,
        version_minor: PROTOCOL_VERSION_MINOR,
        user: "bob".into(),
        auth_token: vec![0u8; NONCE_LENGTH],
    };
    let payload = hello.encode().unwrap();
    for fragment in split_superframe(SuperframeType::Encap, 0, &payload, 1472) {
        tokio::io::AsyncWriteExt::write_all(&mut tcp, &fragment)
            .await
            .unwrap();
    }

    // the server must close within 500 ms without sending MESSAGE or
    // SOURCE_INFO traffic
    let verdict = tokio::time::timeout(Duration::from_millis(500), async {
        loop {
            match read_fragment(&mut tcp).await {
                Ok((header, payload)) => {
                    if header.sf_type == SuperframeType::Encap {
                        let mut reassembler = Reassembler::new();
                        if let Some(superframe) =
                            reassembler.push(header, &payload).unwrap_or(None)
                        {
                            match RemoteCall::decode(&superframe.payload) {
                                Ok(RemoteCall::Message { .. }) => {
                                    panic!("server leaked a MESSAGE to an unauthenticated peer")
                                }
                                Ok(RemoteCall::Shutdown) | Err(_) => {}
                                Ok(_) => {}
                            }
                        }
                    }
                    else if header.sf_type == SuperframeType::Psd {
                        panic!("server leaked PSD to an unauthenticated peer");
                    }
                }
                Err(_) => break,
            }
        }
    })
    .await;

    assert!(verdict.is_ok(), "connection not closed within 500 ms");
    server.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn authenticated_client_streams_psd_and_retunes() {
    let (address, server) = start_server().await;

    let client = RemoteClient::connect(address, "bob", "builder")
        .await
        .unwrap();

    let mq = client.message_queue();
    let info = tokio::task::spawn_blocking({
        let mq = mq.clone();
        move || mq.wait_for(&[MessageKind::SourceInfo], Duration::from_secs(3))
    })
    .await
    .unwrap()
    .expect("mirrored source info");
    let Message::SourceInfo(info) = info else {
        unreachable!()
    };
    assert_eq!(info.frequency, 100e6);

    let psd = tokio::task::spawn_blocking({
        let mq = mq.clone();
        move || mq.wait_for(&[MessageKind::Psd], Duration::from_secs(3))
    })
    .await
    .unwrap()
    .expect("mirrored psd");
    let Message::Psd(psd) = psd else { unreachable!() };
    assert_eq!(psd.psd.len(), 1024);

    client
        .call("source.set_freq", vec![CallArg::Double(150e6)])
        .await
        .unwrap();
    let updated = tokio::task::spawn_blocking({
        let mq = mq.clone();
        move || {
            let deadline = std::time::Instant::now() + Duration::from_secs(3);
            while std::time::Instant::now() < deadline {
                if let Some(Message::SourceInfo(info)) =
                    mq.wait_for(&[MessageKind::SourceInfo], Duration::from_millis(200))
                {
                    if info.frequency == 150e6 {
                        return true;
                    }
                }
            }
            false
        }
    })
    .await
    .unwrap();
    assert!(updated, "remote retune never reflected in SOURCE_INFO");

    client.shutdown().await.unwrap();
    server.abort();
}
