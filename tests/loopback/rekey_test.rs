use anyhow::{bail, Result};
use bytes::{Bytes, BytesMut};
use hashi::{compress, ChannelConfig, ChannelEvent, ChannelReceiver, SessionConfig};
use std::sync::atomic::Ordering;
use crate::harness::{self, server_config, test_data, ChannelPair, Pair};

/// Spawns a task that echoes all data on the channel until EOF.
fn spawn_echo(chans: ChannelPair) -> (hashi::Channel, ChannelReceiver, tokio::task::JoinHandle<Result<()>>) {
    let ChannelPair { client, client_rx, server, mut server_rx } = chans;
    let task = tokio::spawn(async move {
        loop {
            match server_rx.recv().await? {
                Some(ChannelEvent::Data(data)) => server.send_data(data).await?,
                Some(ChannelEvent::Eof) => break,
                Some(event) => bail!("unexpected channel event {:?}", event),
                None => bail!("channel closed before EOF"),
            }
        }
        server.send_eof().await?;
        Ok(())
    });
    (client, client_rx, task)
}

/// Sends `data` in chunks through an echo channel and checks that it comes back.
async fn transfer(pair: &mut Pair, data: Bytes, rekey_every: Option<usize>) -> Result<()> {
    let chans = harness::open_channel(pair, ChannelConfig::default()).await?;
    let (client, mut client_rx, echo_task) = spawn_echo(chans);

    let session = pair.client.session.clone();
    let sent = data.clone();
    let send_task = tokio::spawn(async move {
        for (i, chunk) in sent.chunks(10_000).enumerate() {
            client.send_data(sent.slice_ref(chunk)).await?;
            if let Some(n) = rekey_every {
                if i % n == n - 1 {
                    session.rekey().await?;
                }
            }
        }
        client.send_eof().await?;
        anyhow::Ok(client)
    });

    let mut received = BytesMut::new();
    loop {
        match client_rx.recv().await? {
            Some(ChannelEvent::Data(chunk)) => received.extend_from_slice(&chunk),
            Some(ChannelEvent::Eof) => break,
            Some(event) => bail!("unexpected channel event {:?}", event),
            None => bail!("channel closed before EOF"),
        }
    }
    assert_eq!(received.freeze(), data);

    let client = send_task.await??;
    echo_task.await??;
    client.close().await?;
    Ok(())
}

#[tokio::test]
async fn test_rekey_keeps_session_id() -> Result<()> {
    let pair = harness::connected(SessionConfig::default(), server_config()).await?;
    let session_id = pair.client.session.session_id();

    pair.client.session.rekey().await?;
    assert_eq!(pair.server_pubkeys.load(Ordering::SeqCst), 2);
    assert_eq!(pair.client.session.session_id(), session_id);

    pair.server.session.rekey().await?;
    assert_eq!(pair.server_pubkeys.load(Ordering::SeqCst), 3);
    assert_eq!(pair.server.session.session_id(), session_id);

    harness::finish(pair).await
}

#[tokio::test]
async fn test_concurrent_rekeys() -> Result<()> {
    let pair = harness::connected(SessionConfig::default(), server_config()).await?;

    // both sides start the exchange at the same time, which must result in a single exchange
    let (client_res, server_res) = tokio::join!(pair.client.session.rekey(), pair.server.session.rekey());
    client_res?;
    server_res?;
    let count = pair.server_pubkeys.load(Ordering::SeqCst);
    assert!((2..=3).contains(&count), "unexpected number of key exchanges: {}", count);

    harness::finish(pair).await
}

#[tokio::test]
async fn test_rekey_during_transfer() -> Result<()> {
    let mut pair = harness::connected(SessionConfig::default(), server_config()).await?;
    transfer(&mut pair, test_data(200_000, 3), Some(4)).await?;
    assert!(pair.server_pubkeys.load(Ordering::SeqCst) >= 5);
    harness::finish(pair).await
}

#[tokio::test]
async fn test_rekey_after_bytes() -> Result<()> {
    let client_config = SessionConfig::default().with(|c| c.rekey_after_bytes = 32 * 1024);
    let mut pair = harness::connected(client_config, server_config()).await?;
    transfer(&mut pair, test_data(200_000, 5), None).await?;
    assert!(pair.server_pubkeys.load(Ordering::SeqCst) >= 3);
    harness::finish(pair).await
}

#[tokio::test]
async fn test_compression() -> Result<()> {
    for algo in [&compress::ZLIB, &compress::ZLIB_OPENSSH] {
        log::info!("testing compression {:?}", algo.name);
        let client_config = SessionConfig::default().with(|c| c.compress_algos = vec![algo]);
        let server_config = server_config().with(|c| c.compress_algos = vec![algo]);
        let mut pair = harness::connected(client_config, server_config).await?;

        let data = Bytes::from(b"all work and no play makes jack a dull boy\n".repeat(2000));
        transfer(&mut pair, data, Some(3)).await?;
        harness::finish(pair).await?;
    }
    Ok(())
}
