use anyhow::{bail, Result};
use hashi::{codes, cipher, kex, mac, Phase, Session, SessionConfig, SessionEvent};
use std::time::Duration;
use crate::harness::{self, server_config};

#[tokio::test]
async fn test_handshake_agrees_on_session_id() -> Result<()> {
    let pair = harness::connected(SessionConfig::default(), server_config()).await?;

    let client_id = pair.client.session.session_id();
    let server_id = pair.server.session.session_id();
    assert!(client_id.is_some());
    assert_eq!(client_id, server_id);

    assert_eq!(pair.client.session.phase(), Phase::Connected);
    assert!(pair.client.session.is_authenticated()?);
    assert!(!pair.client.session.is_rekeying());
    assert_eq!(pair.server_pubkeys.load(std::sync::atomic::Ordering::SeqCst), 1);

    harness::finish(pair).await
}

#[tokio::test]
async fn test_rejected_host_key_leaves_no_session_id() -> Result<()> {
    harness::init_log();
    let (client_io, server_io) = tokio::io::duplex(64 * 1024);
    let (client, mut client_rx, client_fut) = Session::connect(client_io, SessionConfig::default())?;
    let (_server, _server_rx, server_fut) = Session::accept(server_io, server_config())?;
    let client_task = tokio::spawn(client_fut);
    let server_task = tokio::spawn(server_fut);

    match tokio::time::timeout(Duration::from_secs(10), client_rx.recv()).await? {
        Some(SessionEvent::ServerPubkey(pubkey, accept)) => {
            assert_eq!(pubkey, harness::host_key().pubkey());
            // the exchange is not finished until the key is accepted
            assert_eq!(client.phase(), Phase::KeyExchange);
            assert!(client.session_id().is_none());
            accept.reject(std::io::Error::new(std::io::ErrorKind::Other, "unknown host key"));
        },
        event => bail!("expected the server public key, got {:?}", event),
    }

    assert!(matches!(client_task.await?, Err(hashi::Error::PubkeyAccept(_))));
    match server_task.await? {
        Err(hashi::Error::PeerDisconnected(err)) =>
            assert_eq!(err.reason_code, codes::disconnect::KEY_EXCHANGE_FAILED),
        // the connection may close before the disconnect message arrives
        Err(hashi::Error::PeerClosed | hashi::Error::ReadIo(_) | hashi::Error::WriteIo(_)) => {},
        res => bail!("expected the client to disconnect, got {:?}", res),
    }
    Ok(())
}

#[tokio::test]
async fn test_every_kex_algo() -> Result<()> {
    for &algo in kex::ALL.iter() {
        log::info!("testing kex algorithm {:?}", algo.name);
        let client_config = SessionConfig::default().with(|c| c.kex_algos = vec![algo]);
        let server_config = server_config().with(|c| c.kex_algos = vec![algo]);
        let pair = harness::connected(client_config, server_config).await?;
        assert!(pair.client.session.session_id().is_some());
        harness::finish(pair).await?;
    }
    Ok(())
}

#[tokio::test]
async fn test_every_cipher_and_mac() -> Result<()> {
    for &cipher_algo in cipher::ALL.iter() {
        for &mac_algo in mac::ALL.iter() {
            if mac_algo.name == "none" && !cipher_algo.is_aead() {
                continue
            }
            log::info!("testing cipher {:?} with mac {:?}", cipher_algo.name, mac_algo.name);
            let configure = |c: &mut SessionConfig| {
                c.cipher_algos = vec![cipher_algo];
                c.mac_algos = vec![mac_algo];
            };
            let pair = harness::connected(SessionConfig::default().with(configure), server_config().with(configure)).await?;
            harness::finish(pair).await?;
        }
    }
    Ok(())
}

#[tokio::test]
async fn test_overlapping_cipher_lists() -> Result<()> {
    let client_config = SessionConfig::default()
        .with(|c| c.cipher_algos = vec![&cipher::AES128_CTR, &cipher::AES192_CTR]);
    let server_config = server_config()
        .with(|c| c.cipher_algos = vec![&cipher::AES192_CTR, &cipher::AES256_CTR]);
    let pair = harness::connected(client_config, server_config).await?;
    harness::finish(pair).await
}

#[tokio::test]
async fn test_cipher_mismatch_fails_both_sides() -> Result<()> {
    let client_config = SessionConfig::default().with(|c| c.cipher_algos = vec![&cipher::AES128_CTR]);
    let server_config = server_config().with(|c| c.cipher_algos = vec![&cipher::AES256_CTR]);
    let pair = harness::start(client_config, server_config, harness::default_policy())?;

    for task in [pair.client.task, pair.server.task] {
        match task.await? {
            Err(err @ hashi::Error::AlgoNegotiate(_)) =>
                assert_eq!(err.disconnect_reason(), Some(codes::disconnect::KEY_EXCHANGE_FAILED)),
            // one side may see the disconnect of the other before it finishes its own negotiation
            Err(hashi::Error::PeerDisconnected(err)) =>
                assert_eq!(err.reason_code, codes::disconnect::KEY_EXCHANGE_FAILED),
            res => bail!("expected negotiation to fail, got {:?}", res),
        }
    }
    Ok(())
}

#[tokio::test]
async fn test_server_without_host_keys_is_rejected() -> Result<()> {
    harness::init_log();
    let (io, _other) = tokio::io::duplex(1024);
    match hashi::Session::accept(io, SessionConfig::default()) {
        Err(hashi::Error::Config(_)) => Ok(()),
        Err(err) => bail!("expected a config error, got {}", err),
        Ok(_) => bail!("expected a config error"),
    }
}

#[tokio::test]
async fn test_operations_after_close_fail() -> Result<()> {
    let pair = harness::connected(SessionConfig::default(), server_config()).await?;
    let session = pair.client.session.clone();
    harness::finish(pair).await?;

    assert_eq!(session.phase(), Phase::Closed);
    assert!(session.open_channel("session", hashi::bytes::Bytes::new()).await.is_err());
    assert!(session.rekey().await.is_err());
    Ok(())
}
