use anyhow::{bail, Context as _, Result};
use bytes::Bytes;
use hashi::{
    AuthCredentials, AuthRequestMethod, AuthResponse, Channel, ChannelConfig, ChannelReceiver,
    DisconnectError, Privkey, Session, SessionConfig, SessionEvent, SessionReceiver,
};
use rand::SeedableRng as _;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub type AuthPolicy = Arc<dyn Fn(&str, &AuthRequestMethod) -> AuthResponse + Send + Sync>;

pub struct Peer {
    pub session: Session,
    pub events: mpsc::UnboundedReceiver<SessionEvent>,
    pub task: JoinHandle<hashi::Result<()>>,
}

pub struct Pair {
    pub client: Peer,
    pub server: Peer,
    /// Number of `ServerPubkey` events that the client has accepted.
    pub server_pubkeys: Arc<AtomicUsize>,
}

pub const USERNAME: &str = "alice";
pub const PASSWORD: &str = "correct horse";

pub fn init_log() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn host_key() -> Privkey {
    hashi::ed25519_dalek::SigningKey::from_bytes(&[0x42; 32]).into()
}

pub fn client_key() -> Privkey {
    hashi::ed25519_dalek::SigningKey::from_bytes(&[0x17; 32]).into()
}

pub fn other_key() -> Privkey {
    hashi::ed25519_dalek::SigningKey::from_bytes(&[0x99; 32]).into()
}

pub fn server_config() -> SessionConfig {
    SessionConfig::default().with(|c| c.host_keys = vec![host_key()])
}

/// Accepts the password [`PASSWORD`] and the public key of [`client_key()`].
pub fn default_policy() -> AuthPolicy {
    Arc::new(|username: &str, method: &AuthRequestMethod| {
        if username != USERNAME {
            return AuthResponse::Reject
        }
        match method {
            AuthRequestMethod::Password { password, .. } if password == PASSWORD => AuthResponse::Accept,
            AuthRequestMethod::Pubkey { pubkey, .. } if *pubkey == client_key().pubkey() => AuthResponse::Accept,
            _ => AuthResponse::Reject,
        }
    })
}

pub fn start(client_config: SessionConfig, server_config: SessionConfig, policy: AuthPolicy) -> Result<Pair> {
    init_log();
    let (client_io, server_io) = tokio::io::duplex(64 * 1024);

    let client_rng = Box::new(rand_chacha::ChaCha8Rng::seed_from_u64(1));
    let (client, client_rx, client_fut) = Session::connect_with_rng(client_io, client_config, client_rng)
        .context("could not create client session")?;
    let server_rng = Box::new(rand_chacha::ChaCha8Rng::seed_from_u64(2));
    let (server, server_rx, server_fut) = Session::accept_with_rng(server_io, server_config, server_rng)
        .context("could not create server session")?;

    let server_pubkeys = Arc::new(AtomicUsize::new(0));
    let client = Peer {
        session: client,
        events: forward_client_events(client_rx, server_pubkeys.clone()),
        task: tokio::spawn(client_fut),
    };
    let server = Peer {
        session: server,
        events: forward_server_events(server_rx, policy),
        task: tokio::spawn(server_fut),
    };
    Ok(Pair { client, server, server_pubkeys })
}

/// Starts a pair of sessions and authenticates the client with a password.
pub async fn connected(client_config: SessionConfig, server_config: SessionConfig) -> Result<Pair> {
    let pair = start(client_config, server_config, default_policy())?;
    let credentials = AuthCredentials::default().with(|c| c.password = Some(PASSWORD.into()));
    pair.client.session.authenticate(USERNAME, credentials).await
        .context("client could not authenticate")?;
    Ok(pair)
}

fn forward_client_events(
    mut session_rx: SessionReceiver,
    server_pubkeys: Arc<AtomicUsize>,
) -> mpsc::UnboundedReceiver<SessionEvent> {
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(event) = session_rx.recv().await {
            match event {
                SessionEvent::ServerPubkey(pubkey, accept) => {
                    assert_eq!(pubkey, host_key().pubkey());
                    server_pubkeys.fetch_add(1, Ordering::SeqCst);
                    accept.accept();
                },
                event => { let _ = event_tx.send(event); },
            }
        }
    });
    event_rx
}

fn forward_server_events(mut session_rx: SessionReceiver, policy: AuthPolicy) -> mpsc::UnboundedReceiver<SessionEvent> {
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(event) = session_rx.recv().await {
            match event {
                SessionEvent::AuthRequest(request) => {
                    let response = policy(&request.username, &request.method);
                    request.responder.respond(response);
                },
                event => { let _ = event_tx.send(event); },
            }
        }
    });
    event_rx
}

/// Waits for the next event, failing after a few seconds.
pub async fn next_event(events: &mut mpsc::UnboundedReceiver<SessionEvent>) -> Result<SessionEvent> {
    match tokio::time::timeout(Duration::from_secs(10), events.recv()).await {
        Ok(Some(event)) => Ok(event),
        Ok(None) => bail!("session closed while waiting for an event"),
        Err(_) => bail!("timed out while waiting for an event"),
    }
}

pub struct ChannelPair {
    pub client: Channel,
    pub client_rx: ChannelReceiver,
    pub server: Channel,
    pub server_rx: ChannelReceiver,
}

/// Opens a "session" channel from the client, which the server accepts with `server_config`.
pub async fn open_channel(pair: &mut Pair, server_config: ChannelConfig) -> Result<ChannelPair> {
    let open = pair.client.session.open_channel("session", Bytes::new());
    let accept = async {
        match next_event(&mut pair.server.events).await? {
            SessionEvent::Channel(accept) => {
                assert_eq!(accept.channel_type, "session");
                Ok(accept.accept(server_config, Bytes::new()).await?)
            },
            event => bail!("expected a channel, got {:?}", event),
        }
    };
    let (opened, accepted) = tokio::join!(open, accept);
    let (client, client_rx, _) = opened.context("client could not open channel")?;
    let (server, server_rx) = accepted.context("server could not accept channel")?;
    Ok(ChannelPair { client, client_rx, server, server_rx })
}

/// Disconnects the client and checks that both sessions end cleanly.
pub async fn finish(pair: Pair) -> Result<()> {
    pair.client.session.disconnect(DisconnectError::by_app())?;
    pair.client.task.await?.context("client session failed")?;
    match pair.server.task.await? {
        Err(hashi::Error::PeerDisconnected(error)) =>
            assert_eq!(error.reason_code, hashi::codes::disconnect::BY_APPLICATION),
        res => bail!("expected the server to see a disconnect, got {:?}", res),
    }
    Ok(())
}

/// Deterministic test data.
pub fn test_data(len: usize, seed: u8) -> Bytes {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect::<Vec<u8>>().into()
}
