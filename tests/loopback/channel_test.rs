use anyhow::{bail, Context as _, Result};
use bytes::{Bytes, BytesMut};
use hashi::{
    codes, ChannelConfig, ChannelEvent, ChannelOpenError, ChannelPhase, ChannelReceiver,
    DisconnectError, GlobalReply, SessionConfig, SessionEvent, DATA_STDERR,
};
use std::time::Duration;
use crate::harness::{self, server_config, test_data, ChannelPair};

/// Reads data events until EOF.
async fn read_to_eof(rx: &mut ChannelReceiver) -> Result<Bytes> {
    let mut data = BytesMut::new();
    loop {
        match rx.recv().await? {
            Some(ChannelEvent::Data(chunk)) => data.extend_from_slice(&chunk),
            Some(ChannelEvent::Eof) => return Ok(data.freeze()),
            Some(event) => bail!("unexpected channel event {:?}", event),
            None => bail!("channel closed before EOF"),
        }
    }
}

/// Reads exactly `len` bytes of data.
async fn read_exact(rx: &mut ChannelReceiver, len: usize) -> Result<Bytes> {
    let mut data = BytesMut::new();
    while data.len() < len {
        match rx.recv().await? {
            Some(ChannelEvent::Data(chunk)) => data.extend_from_slice(&chunk),
            Some(event) => bail!("unexpected channel event {:?}", event),
            None => bail!("channel closed after {} bytes", data.len()),
        }
    }
    Ok(data.freeze())
}

#[tokio::test]
async fn test_echo() -> Result<()> {
    let mut pair = harness::connected(SessionConfig::default(), server_config()).await?;
    let ChannelPair { client, mut client_rx, server, mut server_rx } =
        harness::open_channel(&mut pair, ChannelConfig::default()).await?;
    assert_eq!(client.phase(), ChannelPhase::Open);

    let server_task = tokio::spawn(async move {
        let data = read_to_eof(&mut server_rx).await?;
        server.send_data(data).await?;
        server.send_eof().await?;
        anyhow::Ok(())
    });

    let data = test_data(300_000, 1);
    client.send_data(data.clone()).await?;
    client.send_eof().await?;

    let echoed = read_to_eof(&mut client_rx).await?;
    assert_eq!(echoed, data);
    server_task.await??;

    client.close().await?;
    assert_eq!(client.phase(), ChannelPhase::Closed);
    harness::finish(pair).await
}

#[tokio::test]
async fn test_send_window_limits_data() -> Result<()> {
    let mut pair = harness::connected(SessionConfig::default(), server_config()).await?;
    let config = ChannelConfig::default().with(|c| c.recv_window_max = 32 * 1024);
    let mut chans = harness::open_channel(&mut pair, config).await?;

    let data = test_data(40_000, 7);
    let mut sending = chans.client.send_data(data.clone());

    // the server does not read, so only the initial window can be sent
    let res = tokio::time::timeout(Duration::from_millis(300), &mut sending).await;
    assert!(res.is_err(), "send completed although the window is too small");
    assert_eq!(chans.client.send_window(), 0);

    let received = read_exact(&mut chans.server_rx, data.len()).await?;
    sending.await?;
    assert_eq!(received, data);
    harness::finish(pair).await
}

#[tokio::test]
async fn test_channel_requests() -> Result<()> {
    let mut pair = harness::connected(SessionConfig::default(), server_config()).await?;
    let ChannelPair { client, server_rx: mut rx, .. } =
        harness::open_channel(&mut pair, ChannelConfig::default()).await?;

    let server_task = tokio::spawn(async move {
        let mut types = Vec::new();
        while let Some(event) = rx.recv().await? {
            match event {
                ChannelEvent::Request(req) => {
                    types.push(req.request_type.clone());
                    match (req.request_type.as_str(), req.reply) {
                        ("shell", Some(reply)) => reply.success(),
                        ("exec", Some(reply)) => reply.failure(),
                        (_, reply) => drop(reply),
                    }
                },
                ChannelEvent::Eof => break,
                event => bail!("unexpected channel event {:?}", event),
            }
        }
        Ok(types)
    });

    client.request("shell", Bytes::new()).await?;
    assert!(matches!(client.request("exec", Bytes::from_static(b"\0\0\0\x02ls")).await,
        Err(hashi::Error::ChannelReq)));
    assert!(matches!(client.request("subsystem", Bytes::new()).await,
        Err(hashi::Error::ChannelReq)));
    client.send_request("window-change", Bytes::from_static(&[0; 16]))?;
    client.send_eof().await?;

    let types = server_task.await??;
    assert_eq!(types, ["shell", "exec", "subsystem", "window-change"]);
    assert_eq!(client.phase(), ChannelPhase::LocalEof);
    harness::finish(pair).await
}

#[tokio::test]
async fn test_extended_data() -> Result<()> {
    let mut pair = harness::connected(SessionConfig::default(), server_config()).await?;
    let mut chans = harness::open_channel(&mut pair, ChannelConfig::default()).await?;

    chans.server.send_data(Bytes::from_static(b"out")).await?;
    chans.server.send_extended_data(DATA_STDERR, Bytes::from_static(b"err")).await?;
    chans.server.send_eof().await?;

    match chans.client_rx.recv().await? {
        Some(ChannelEvent::Data(data)) => assert_eq!(data, "out"),
        event => bail!("expected data, got {:?}", event),
    }
    match chans.client_rx.recv().await? {
        Some(ChannelEvent::ExtendedData(code, data)) => {
            assert_eq!(code, DATA_STDERR);
            assert_eq!(data, "err");
        },
        event => bail!("expected extended data, got {:?}", event),
    }
    assert!(matches!(chans.client_rx.recv().await?, Some(ChannelEvent::Eof)));
    assert_eq!(chans.client.phase(), ChannelPhase::RemoteEof);
    harness::finish(pair).await
}

#[tokio::test]
async fn test_close_from_both_sides() -> Result<()> {
    let mut pair = harness::connected(SessionConfig::default(), server_config()).await?;
    let mut chans = harness::open_channel(&mut pair, ChannelConfig::default()).await?;

    chans.client.close().await?;
    assert_eq!(chans.client.phase(), ChannelPhase::Closed);

    // the server sees EOF and then the end of the channel
    assert!(matches!(chans.server_rx.recv().await?, Some(ChannelEvent::Eof)));
    assert!(chans.server_rx.recv().await?.is_none());
    assert!(chans.client_rx.recv().await?.is_none());

    assert!(matches!(chans.client.send_data(Bytes::from_static(b"late")).await,
        Err(hashi::Error::ChannelClosed)));
    chans.server.close().await?;

    // channel ids are reused after close
    let chans = harness::open_channel(&mut pair, ChannelConfig::default()).await?;
    chans.client.close().await?;
    harness::finish(pair).await
}

#[tokio::test]
async fn test_channel_open_rejected() -> Result<()> {
    let mut pair = harness::connected(SessionConfig::default(), server_config()).await?;

    let open = pair.client.session.open_channel("direct-tcpip", Bytes::new());
    match harness::next_event(&mut pair.server.events).await? {
        SessionEvent::Channel(accept) => {
            assert_eq!(accept.channel_type, "direct-tcpip");
            accept.reject(ChannelOpenError::new(codes::open::UNKNOWN_CHANNEL_TYPE, "no forwarding"));
        },
        event => bail!("expected a channel, got {:?}", event),
    }
    match open.await {
        Err(hashi::Error::ChannelOpen(err)) => {
            assert_eq!(err.reason_code, codes::open::UNKNOWN_CHANNEL_TYPE);
            assert_eq!(err.description, "no forwarding");
        },
        res => bail!("expected the open to fail, got {:?}", res.map(|_| ())),
    }

    let open = pair.client.session.open_channel("x11", Bytes::new());
    match harness::next_event(&mut pair.server.events).await? {
        SessionEvent::Channel(accept) => drop(accept),
        event => bail!("expected a channel, got {:?}", event),
    }
    match open.await {
        Err(hashi::Error::ChannelOpen(err)) =>
            assert_eq!(err.reason_code, codes::open::ADMINISTRATIVELY_PROHIBITED),
        res => bail!("expected the open to fail, got {:?}", res.map(|_| ())),
    }
    harness::finish(pair).await
}

#[tokio::test]
async fn test_server_opens_channel() -> Result<()> {
    let mut pair = harness::connected(SessionConfig::default(), server_config()).await?;

    let open = pair.server.session.open_channel("forwarded-tcpip", Bytes::from_static(b"payload"));
    let (client, mut client_rx) = match harness::next_event(&mut pair.client.events).await? {
        SessionEvent::Channel(accept) => {
            assert_eq!(accept.open_payload, "payload");
            accept.accept(ChannelConfig::default(), Bytes::from_static(b"confirm")).await?
        },
        event => bail!("expected a channel, got {:?}", event),
    };
    let (server, _server_rx, confirm_payload) = open.await?;
    assert_eq!(confirm_payload, "confirm");

    server.send_data(Bytes::from_static(b"hello")).await?;
    assert_eq!(read_exact(&mut client_rx, 5).await?, "hello");
    client.close().await?;
    harness::finish(pair).await
}

#[tokio::test]
async fn test_global_requests() -> Result<()> {
    let mut pair = harness::connected(SessionConfig::default(), server_config()).await?;

    let request = pair.client.session.global_request("tcpip-forward", Bytes::from_static(b"\0\0\0\0"));
    match harness::next_event(&mut pair.server.events).await? {
        SessionEvent::GlobalRequest(req) => {
            assert_eq!(req.request_type, "tcpip-forward");
            req.reply.context("expected a reply sender")?.success(Bytes::from_static(b"\0\0\x1f\x90"));
        },
        event => bail!("expected a global request, got {:?}", event),
    }
    assert_eq!(request.await?, GlobalReply::Success(Bytes::from_static(b"\0\0\x1f\x90")));

    let request = pair.client.session.global_request("cancel-tcpip-forward", Bytes::new());
    match harness::next_event(&mut pair.server.events).await? {
        SessionEvent::GlobalRequest(req) => drop(req),
        event => bail!("expected a global request, got {:?}", event),
    }
    assert_eq!(request.await?, GlobalReply::Failure);

    pair.client.session.send_global_request("keepalive@openssh.com", Bytes::new())?;
    match harness::next_event(&mut pair.server.events).await? {
        SessionEvent::GlobalRequest(req) => assert!(req.reply.is_none()),
        event => bail!("expected a global request, got {:?}", event),
    }
    harness::finish(pair).await
}

#[tokio::test]
async fn test_disconnect_fails_channels() -> Result<()> {
    let mut pair = harness::connected(SessionConfig::default(), server_config()).await?;
    let mut chans = harness::open_channel(&mut pair, ChannelConfig::default()).await?;

    pair.server.session.disconnect(DisconnectError::by_app())?;
    match chans.client_rx.recv().await {
        Err(hashi::Error::PeerDisconnected(err)) => assert_eq!(err.reason_code, codes::disconnect::BY_APPLICATION),
        res => bail!("expected the channel to fail, got {:?}", res),
    }
    assert!(chans.client.send_data(Bytes::from_static(b"late")).await.is_err());

    pair.server.task.await??;
    assert!(matches!(pair.client.task.await?, Err(hashi::Error::PeerDisconnected(_))));
    Ok(())
}
