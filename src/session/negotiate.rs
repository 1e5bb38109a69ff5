use bytes::Bytes;
use rand::RngCore as _;
use std::future::Future as _;
use std::pin::Pin;
use std::task::Context;
use tokio::sync::oneshot;
use tokio::time::Sleep;
use crate::error::{Error, Result, AlgoNegotiateError};
use crate::cipher::{CipherAlgo, CipherAlgoVariant, PacketEncrypt, PacketDecrypt};
use crate::codec::{PacketEncode, PacketDecode};
use crate::codes::msg;
use crate::compress::CompressAlgo;
use crate::kex::{Kex, KexAlgo, KexInput, KexOutput, KexParams, HostKey};
use crate::mac::{self, MacAlgo};
use crate::promise::Resolver;
use crate::pubkey::{Pubkey, PubkeyAlgo};
use super::Role;
use super::config::SessionConfig;
use super::event::{SessionEvent, AcceptPubkey, PubkeyAccepted};
use super::pump::Pump;
use super::recv::ResultRecvState;
use super::state::{self, SessionState};

pub(super) struct NegotiateState {
    state: State,
    run: KexRun,
    done_txs: Vec<Resolver<()>>,
    rekey_sleep: Option<Pin<Box<Sleep>>>,
}

/// State of a single key exchange, discarded when the exchange is done.
#[derive(Default)]
struct KexRun {
    our_kex_init: Option<OurKexInit>,
    their_kex_init: Option<TheirKexInit>,
    algos: Option<Algos>,
    kex: Option<Box<dyn Kex + Send>>,
    kex_output: Option<KexOutput>,
    ignore_next_kex_packet: bool,
    pubkey_event: Option<SessionEvent>,
    accept_rx: Option<oneshot::Receiver<Result<PubkeyAccepted>>>,
    pubkey_accepted: Option<PubkeyAccepted>,
    new_keys_sent: bool,
    new_keys_recvd: bool,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum State {
    Idle,
    KexInit,
    Kex,
    AcceptPubkey,
    NewKeys,
    Done,
}

struct OurKexInit {
    payload: Bytes,
    kex_algos: Vec<&'static KexAlgo>,
    server_pubkey_algos: Vec<&'static PubkeyAlgo>,
    cipher_algos: Vec<&'static CipherAlgo>,
    mac_algos: Vec<&'static MacAlgo>,
    compress_algos: Vec<&'static CompressAlgo>,
}

#[derive(Debug)]
struct TheirKexInit {
    payload: Bytes,
    kex_algos: Vec<String>,
    server_pubkey_algos: Vec<String>,
    cipher_algos_cts: Vec<String>,
    cipher_algos_stc: Vec<String>,
    mac_algos_cts: Vec<String>,
    mac_algos_stc: Vec<String>,
    compress_algos_cts: Vec<String>,
    compress_algos_stc: Vec<String>,
    first_kex_packet_follows: bool,
}

#[derive(Debug, Clone, Copy)]
struct Algos {
    kex: &'static KexAlgo,
    server_pubkey: &'static PubkeyAlgo,
    cipher_cts: &'static CipherAlgo,
    cipher_stc: &'static CipherAlgo,
    mac_cts: &'static MacAlgo,
    mac_stc: &'static MacAlgo,
    compress_cts: &'static CompressAlgo,
    compress_stc: &'static CompressAlgo,
}

pub(super) fn init_negotiate() -> NegotiateState {
    NegotiateState {
        state: State::KexInit,
        run: KexRun::default(),
        done_txs: Vec::new(),
        rekey_sleep: None,
    }
}

pub(super) fn pump_negotiate(st: &mut SessionState, cx: &mut Context) -> Result<Pump> {
    match st.negotiate_st.state {
        State::Idle => {
            if st.session_id.is_some() && should_rekey(st, cx) {
                st.negotiate_st.state = State::KexInit;
                return Ok(Pump::Progress)
            }
        },
        State::KexInit => {
            if st.negotiate_st.run.our_kex_init.is_none() {
                st.negotiate_st.run.our_kex_init = Some(send_kex_init(st)?);
                return Ok(Pump::Progress)
            }

            if st.negotiate_st.run.their_kex_init.is_some() {
                let algos = negotiate_algos(st)?;
                let params = KexParams {
                    role: st.role,
                    rng: &mut *st.rng,
                    gex_bits: st.config.gex_bits,
                };
                let kex = (algos.kex.make_kex)(params)?;
                let run = &mut st.negotiate_st.run;
                run.ignore_next_kex_packet = is_wrong_guess(run, &algos);
                run.algos = Some(algos);
                run.kex = Some(kex);
                st.negotiate_st.state = State::Kex;
                return Ok(Pump::Progress)
            }
        },
        State::Kex => {
            if let Some(payload) = run_kex(&mut st.negotiate_st.run)?.send_packet()? {
                st.codec.send_pipe.feed_packet(&payload)?;
                return Ok(Pump::Progress)
            }

            let algos = run_algos(&st.negotiate_st.run)?;
            let (our_kex_init, their_kex_init) = kex_init_payloads(&st.negotiate_st.run)?;
            let their_ident = st.their_ident.clone()
                .ok_or(Error::Protocol("key exchange started before identification"))?;
            let (client_ident, server_ident, client_kex_init, server_kex_init, host_key) = match st.role {
                Role::Client => (st.our_ident.clone(), their_ident, our_kex_init, their_kex_init, None),
                Role::Server => {
                    let host_key = select_host_key(&st.config, algos.server_pubkey)?;
                    (their_ident, st.our_ident.clone(), their_kex_init, our_kex_init, Some(host_key))
                },
            };
            let kex_input = KexInput {
                client_ident: &client_ident,
                server_ident: &server_ident,
                client_kex_init: &client_kex_init,
                server_kex_init: &server_kex_init,
                host_key,
            };

            let kex = run_kex(&mut st.negotiate_st.run)?;
            let kex_output = pump_ready!(kex.poll(kex_input))?;
            // the server's reply is produced by the final poll
            while let Some(payload) = kex.send_packet()? {
                st.codec.send_pipe.feed_packet(&payload)?;
            }
            log::debug!("finished kex {:?}", algos.kex.name);

            match st.role {
                Role::Client => {
                    let pubkey = verify_server_pubkey(algos.server_pubkey, &kex_output)?;
                    log::debug!("server pubkey {} ({})", pubkey, pubkey.fingerprint());
                    let (accept_tx, accept_rx) = oneshot::channel();
                    let accept = AcceptPubkey { accept_tx };
                    st.negotiate_st.run.pubkey_event = Some(SessionEvent::ServerPubkey(pubkey, accept));
                    st.negotiate_st.run.accept_rx = Some(accept_rx);
                    st.negotiate_st.state = State::AcceptPubkey;
                },
                Role::Server => {
                    set_session_id(st, &kex_output);
                    st.negotiate_st.state = State::NewKeys;
                },
            }
            st.negotiate_st.run.kex_output = Some(kex_output);
            return Ok(Pump::Progress)
        },
        State::AcceptPubkey => {
            if st.negotiate_st.run.pubkey_event.is_some() {
                let reserve_res = pump_ready!(st.event_tx.poll_reserve(cx));
                if let (Ok(()), Some(event)) = (reserve_res, st.negotiate_st.run.pubkey_event.take()) {
                    let _ = st.event_tx.send_item(event);
                }
                st.negotiate_st.run.pubkey_event = None;
            }

            let Some(accept_rx) = st.negotiate_st.run.accept_rx.as_mut() else {
                return Err(Error::Protocol("server public key is not being accepted"))
            };
            let accepted = pump_ready!(Pin::new(accept_rx).poll(cx))
                .map_err(|err| Error::PubkeyAccept(std::sync::Arc::new(err)))??;
            log::debug!("server pubkey was accepted");
            let kex_output = st.negotiate_st.run.kex_output.take()
                .ok_or(Error::Protocol("server public key accepted before the key exchange finished"))?;
            set_session_id(st, &kex_output);
            st.negotiate_st.run.kex_output = Some(kex_output);
            st.negotiate_st.run.pubkey_accepted = Some(accepted);
            st.negotiate_st.state = State::NewKeys;
            return Ok(Pump::Progress)
        },
        State::NewKeys => {
            if st.role == Role::Client && st.negotiate_st.run.pubkey_accepted.is_none() {
                return Err(Error::Protocol("server public key was not accepted"))
            }

            if !st.negotiate_st.run.new_keys_sent {
                send_new_keys(st)?;
                st.negotiate_st.run.new_keys_sent = true;
                return Ok(Pump::Progress)
            }

            if st.negotiate_st.run.new_keys_recvd {
                st.negotiate_st.state = State::Done;
                return Ok(Pump::Progress)
            }
        },
        State::Done => {
            log::debug!("key exchange done");
            st.negotiate_st.run = KexRun::default();
            st.negotiate_st.rekey_sleep = None;
            st.negotiate_st.state = State::Idle;
            for done_tx in st.negotiate_st.done_txs.drain(..) {
                done_tx.resolve(Ok(()));
            }
            return Ok(Pump::Progress)
        },
    }
    Ok(Pump::Pending)
}

fn should_rekey(st: &mut SessionState, cx: &mut Context) -> bool {
    let bytes_max = st.config.rekey_after_bytes();
    let sent = st.codec.send_pipe.bytes_since_kex();
    let recvd = st.codec.recv_pipe.bytes_since_kex();
    if sent > bytes_max || recvd > bytes_max {
        log::debug!("starting rekey after {} bytes sent and {} bytes received", sent, recvd);
        return true
    }

    let duration = st.config.rekey_after_duration;
    let sleep = st.negotiate_st.rekey_sleep
        .get_or_insert_with(|| Box::pin(tokio::time::sleep(duration)));
    if sleep.as_mut().poll(cx).is_ready() {
        log::debug!("starting rekey after {:?}", duration);
        return true
    }
    false
}

/// Starts a key exchange (if one is not in progress) and registers `done_tx` to be resolved when
/// it finishes.
pub(super) fn start_kex(st: &mut SessionState, done_tx: Resolver<()>) {
    st.negotiate_st.done_txs.push(done_tx);
    if st.negotiate_st.state == State::Idle {
        st.negotiate_st.state = State::KexInit;
    }
    state::wakeup(st);
}

pub(super) fn recv_negotiate_packet(
    st: &mut SessionState,
    msg_id: u8,
    payload: &mut PacketDecode,
) -> ResultRecvState {
    match msg_id {
        msg::NEWKEYS => recv_new_keys(st, payload),
        _ => Err(Error::PacketNotImplemented(msg_id)),
    }
}

pub(super) fn recv_kex_packet(
    st: &mut SessionState,
    msg_id: u8,
    payload: &mut PacketDecode,
) -> ResultRecvState {
    let run = &mut st.negotiate_st.run;
    if run.ignore_next_kex_packet {
        log::debug!("ignoring kex packet {} after a wrong guess", msg_id);
        run.ignore_next_kex_packet = false;
        return Ok(None)
    }

    match run.kex.as_mut() {
        Some(kex) if run.kex_output.is_none() => {
            kex.recv_packet(msg_id, payload)?;
            Ok(None)
        },
        _ => Err(Error::Protocol("received unexpected kex message")),
    }
}

fn send_kex_init(st: &mut SessionState) -> Result<OurKexInit> {
    let kex_algos = st.config.kex_algos.clone();
    let server_pubkey_algos = match st.role {
        Role::Client => st.config.server_pubkey_algos.clone(),
        Role::Server => st.config.server_pubkey_algos.iter().copied()
            .filter(|algo| st.config.host_keys.iter().any(|key| algo.is_compatible(&key.pubkey())))
            .collect(),
    };
    if server_pubkey_algos.is_empty() {
        return Err(Error::Config("no host key works with the configured public key algorithms"))
    }
    let cipher_algos = st.config.cipher_algos.clone();
    let mac_algos = st.config.mac_algos.clone();
    let compress_algos = st.config.compress_algos.clone();

    let mut cookie = [0; 16];
    st.rng.try_fill_bytes(&mut cookie).map_err(|_| Error::Random("could not generate random cookie"))?;

    fn names<A: NamedAlgo + ?Sized>(algos: &[&A]) -> Vec<&'static str> {
        algos.iter().map(|algo| algo.name()).collect()
    }

    // RFC 4253, section 7.1
    let mut payload = PacketEncode::new();
    payload.put_u8(msg::KEXINIT);
    payload.put_raw(&cookie);
    payload.put_name_list(&names(&kex_algos));
    payload.put_name_list(&names(&server_pubkey_algos));
    payload.put_name_list(&names(&cipher_algos));
    payload.put_name_list(&names(&cipher_algos));
    payload.put_name_list(&names(&mac_algos));
    payload.put_name_list(&names(&mac_algos));
    payload.put_name_list(&names(&compress_algos));
    payload.put_name_list(&names(&compress_algos));
    payload.put_name_list::<&str>(&[]);
    payload.put_name_list::<&str>(&[]);
    payload.put_bool(false);
    payload.put_u32(0);
    let payload = payload.finish();
    st.codec.send_pipe.feed_packet(&payload)?;

    log::debug!("sending SSH_MSG_KEXINIT");

    Ok(OurKexInit { payload, kex_algos, server_pubkey_algos, cipher_algos, mac_algos, compress_algos })
}

pub(super) fn recv_kex_init(st: &mut SessionState, raw: Bytes, payload: &mut PacketDecode) -> ResultRecvState {
    // RFC 4253, section 7.1
    payload.skip(16)?; // cookie
    let kex_init = TheirKexInit {
        payload: raw,
        kex_algos: payload.get_name_list()?,
        server_pubkey_algos: payload.get_name_list()?,
        cipher_algos_cts: payload.get_name_list()?,
        cipher_algos_stc: payload.get_name_list()?,
        mac_algos_cts: payload.get_name_list()?,
        mac_algos_stc: payload.get_name_list()?,
        compress_algos_cts: payload.get_name_list()?,
        compress_algos_stc: payload.get_name_list()?,
        first_kex_packet_follows: {
            payload.get_name_list()?; // languages_client_to_server
            payload.get_name_list()?; // languages_server_to_client
            payload.get_bool()?
        },
    };
    payload.get_u32()?; // reserved
    log::debug!("received SSH_MSG_KEXINIT: {:?}", kex_init);

    match st.negotiate_st.state {
        State::Idle | State::KexInit if st.negotiate_st.run.their_kex_init.is_none() => {
            if st.negotiate_st.state == State::Idle {
                log::debug!("peer started key re-exchange");
            }
            st.negotiate_st.run.their_kex_init = Some(kex_init);
            st.negotiate_st.state = State::KexInit;
            Ok(None)
        },
        _ => Err(Error::Protocol("received SSH_MSG_KEXINIT during key exchange")),
    }
}

fn negotiate_algos(st: &SessionState) -> Result<Algos> {
    let run = &st.negotiate_st.run;
    let (Some(our), Some(their)) = (run.our_kex_init.as_ref(), run.their_kex_init.as_ref()) else {
        return Err(Error::Protocol("negotiating algorithms without both SSH_MSG_KEXINIT"))
    };
    let role = st.role;

    let kex = negotiate_algo(role, &our.kex_algos, &their.kex_algos, "key exchange")?;
    let server_pubkey = negotiate_algo(role,
        &our.server_pubkey_algos, &their.server_pubkey_algos, "server public key")?;
    let cipher_cts = negotiate_algo(role,
        &our.cipher_algos, &their.cipher_algos_cts, "cipher client-to-server")?;
    let cipher_stc = negotiate_algo(role,
        &our.cipher_algos, &their.cipher_algos_stc, "cipher server-to-client")?;
    // AEAD ciphers authenticate the packets on their own (RFC 5647, section 5.1)
    let mac_cts = if cipher_cts.is_aead() { &mac::NONE } else {
        negotiate_algo(role, &our.mac_algos, &their.mac_algos_cts, "mac client-to-server")?
    };
    let mac_stc = if cipher_stc.is_aead() { &mac::NONE } else {
        negotiate_algo(role, &our.mac_algos, &their.mac_algos_stc, "mac server-to-client")?
    };
    let compress_cts = negotiate_algo(role,
        &our.compress_algos, &their.compress_algos_cts, "compression client-to-server")?;
    let compress_stc = negotiate_algo(role,
        &our.compress_algos, &their.compress_algos_stc, "compression server-to-client")?;

    Ok(Algos { kex, server_pubkey, cipher_cts, cipher_stc, mac_cts, mac_stc, compress_cts, compress_stc })
}

fn negotiate_algo<A: NamedAlgo + ?Sized>(
    role: Role,
    our_algos: &[&'static A],
    their_algos: &[String],
    name: &'static str,
) -> Result<&'static A> {
    let our_names = our_algos.iter().map(|algo| algo.name()).collect::<Vec<_>>();
    let their_names = their_algos.iter().map(|name| name.as_str()).collect::<Vec<_>>();
    let chosen = match role {
        Role::Client => choose_name(&our_names, &their_names),
        Role::Server => choose_name(&their_names, &our_names),
    };

    if let Some(chosen) = chosen {
        if let Some(algo) = our_algos.iter().find(|algo| algo.name() == chosen) {
            log::debug!("negotiated algo {:?} for {}", chosen, name);
            return Ok(algo)
        }
    }

    Err(Error::AlgoNegotiate(AlgoNegotiateError {
        algo_name: name.into(),
        our_algos: our_names.into_iter().map(String::from).collect(),
        their_algos: their_algos.into(),
    }))
}

/// Picks the first name in the client's list that also appears in the server's list (RFC 4253,
/// section 7.1).
fn choose_name<'a>(client_names: &[&'a str], server_names: &[&str]) -> Option<&'a str> {
    client_names.iter().copied().find(|name| server_names.contains(name))
}

/// Did the peer send a guessed kex packet that we must ignore (RFC 4253, section 7)?
fn is_wrong_guess(run: &KexRun, algos: &Algos) -> bool {
    let Some(their) = run.their_kex_init.as_ref() else { return false };
    if !their.first_kex_packet_follows {
        return false
    }
    let kex_ok = their.kex_algos.first().map(|name| name.as_str()) == Some(algos.kex.name);
    let pubkey_ok = their.server_pubkey_algos.first().map(|name| name.as_str()) == Some(algos.server_pubkey.name);
    !(kex_ok && pubkey_ok)
}

trait NamedAlgo { fn name(&self) -> &'static str; }
impl NamedAlgo for KexAlgo { fn name(&self) -> &'static str { self.name } }
impl NamedAlgo for CipherAlgo { fn name(&self) -> &'static str { self.name } }
impl NamedAlgo for MacAlgo { fn name(&self) -> &'static str { self.name } }
impl NamedAlgo for PubkeyAlgo { fn name(&self) -> &'static str { self.name } }
impl NamedAlgo for CompressAlgo { fn name(&self) -> &'static str { self.name } }

fn select_host_key<'a>(config: &'a SessionConfig, algo: &'static PubkeyAlgo) -> Result<HostKey<'a>> {
    config.host_keys.iter()
        .find(|privkey| algo.is_compatible(&privkey.pubkey()))
        .map(|privkey| HostKey { privkey, algo })
        .ok_or(Error::Kex("server has no host key for the negotiated algorithm"))
}

fn verify_server_pubkey(algo: &'static PubkeyAlgo, kex_output: &KexOutput) -> Result<Pubkey> {
    let pubkey = Pubkey::decode(kex_output.server_pubkey.clone())?;
    if !algo.is_compatible(&pubkey) {
        return Err(Error::Kex("server host key does not match the negotiated algorithm"))
    }
    pubkey.verify(algo, &kex_output.exchange_hash, kex_output.server_exchange_hash_sign.clone())?;
    Ok(pubkey)
}

fn run_kex(run: &mut KexRun) -> Result<&mut Box<dyn Kex + Send>> {
    run.kex.as_mut().ok_or(Error::Protocol("key exchange is not running"))
}

fn run_algos(run: &KexRun) -> Result<Algos> {
    run.algos.ok_or(Error::Protocol("algorithms are not negotiated"))
}

fn kex_init_payloads(run: &KexRun) -> Result<(Bytes, Bytes)> {
    match (run.our_kex_init.as_ref(), run.their_kex_init.as_ref()) {
        (Some(our), Some(their)) => Ok((our.payload.clone(), their.payload.clone())),
        _ => Err(Error::Protocol("missing SSH_MSG_KEXINIT")),
    }
}

fn recv_new_keys(st: &mut SessionState, _payload: &mut PacketDecode) -> ResultRecvState {
    match st.negotiate_st.state {
        State::Kex | State::AcceptPubkey | State::NewKeys => {
            if st.negotiate_st.run.new_keys_recvd {
                return Err(Error::Protocol("received SSH_MSG_NEWKEYS twice"))
            }
            if st.negotiate_st.run.kex_output.is_none() {
                return Err(Error::Protocol("received SSH_MSG_NEWKEYS before the key exchange finished"))
            }
        },
        _ => return Err(Error::Protocol("received unexpected SSH_MSG_NEWKEYS")),
    }

    let algos = run_algos(&st.negotiate_st.run)?;
    let (cipher_algo, mac_algo, compress_algo, tags) = match st.role {
        Role::Client => (algos.cipher_stc, algos.mac_stc, algos.compress_stc, SERVER_TO_CLIENT_TAGS),
        Role::Server => (algos.cipher_cts, algos.mac_cts, algos.compress_cts, CLIENT_TO_SERVER_TAGS),
    };

    let cipher_iv = derive_key(st, tags.iv, cipher_algo.iv_len)?;
    let cipher_key = derive_key(st, tags.key, cipher_algo.key_len)?;
    let (decrypt, tag_len) = match &cipher_algo.variant {
        CipherAlgoVariant::Standard(standard) => {
            let mac_key = derive_key(st, tags.mac, mac_algo.key_len)?;
            let decrypt = (standard.make_decrypt)(&cipher_key, &cipher_iv)?;
            let mac = (mac_algo.make_mac)(&mac_key)?;
            (PacketDecrypt::EncryptAndMac(decrypt, mac), mac_algo.tag_len)
        },
        CipherAlgoVariant::Aead(aead) =>
            (PacketDecrypt::Aead((aead.make_decrypt)(&cipher_key, &cipher_iv)?), aead.tag_len),
    };

    let authenticated = state::is_authenticated(st);
    st.codec.recv_pipe.set_decrypt(decrypt, cipher_algo.block_len, tag_len);
    st.codec.recv_pipe.set_decompress(compress_algo, authenticated);
    st.codec.recv_pipe.reset_kex_counter();

    log::debug!("received SSH_MSG_NEWKEYS and applied new keys");
    st.negotiate_st.run.new_keys_recvd = true;
    Ok(None)
}

fn send_new_keys(st: &mut SessionState) -> Result<()> {
    let algos = run_algos(&st.negotiate_st.run)?;
    let (cipher_algo, mac_algo, compress_algo, tags) = match st.role {
        Role::Client => (algos.cipher_cts, algos.mac_cts, algos.compress_cts, CLIENT_TO_SERVER_TAGS),
        Role::Server => (algos.cipher_stc, algos.mac_stc, algos.compress_stc, SERVER_TO_CLIENT_TAGS),
    };

    let cipher_iv = derive_key(st, tags.iv, cipher_algo.iv_len)?;
    let cipher_key = derive_key(st, tags.key, cipher_algo.key_len)?;
    let (encrypt, tag_len) = match &cipher_algo.variant {
        CipherAlgoVariant::Standard(standard) => {
            let mac_key = derive_key(st, tags.mac, mac_algo.key_len)?;
            let encrypt = (standard.make_encrypt)(&cipher_key, &cipher_iv)?;
            let mac = (mac_algo.make_mac)(&mac_key)?;
            (PacketEncrypt::EncryptAndMac(encrypt, mac), mac_algo.tag_len)
        },
        CipherAlgoVariant::Aead(aead) =>
            (PacketEncrypt::Aead((aead.make_encrypt)(&cipher_key, &cipher_iv)?), aead.tag_len),
    };

    let mut payload = PacketEncode::new();
    payload.put_u8(msg::NEWKEYS);
    st.codec.send_pipe.feed_packet(&payload.finish())?;

    let authenticated = state::is_authenticated(st);
    st.codec.send_pipe.set_encrypt(encrypt, cipher_algo.block_len, tag_len);
    st.codec.send_pipe.set_compress(compress_algo, authenticated);
    st.codec.send_pipe.reset_kex_counter();
    log::debug!("sent SSH_MSG_NEWKEYS and applied new keys");

    Ok(())
}

/// Letters that select the derived keys of one direction (RFC 4253, section 7.2).
#[derive(Debug, Clone, Copy)]
struct KeyTags {
    iv: u8,
    key: u8,
    mac: u8,
}

const CLIENT_TO_SERVER_TAGS: KeyTags = KeyTags { iv: b'A', key: b'C', mac: b'E' };
const SERVER_TO_CLIENT_TAGS: KeyTags = KeyTags { iv: b'B', key: b'D', mac: b'F' };

/// The session id is the exchange hash of the first key exchange (RFC 4253, section 7.2).
///
/// It is set only after the server host key was verified and accepted, so a rejected exchange
/// leaves no session id behind.
fn set_session_id(st: &mut SessionState, kex_output: &KexOutput) {
    if st.session_id.is_none() {
        st.session_id = Some(kex_output.exchange_hash.clone());
    }
}

fn derive_key(st: &SessionState, key_type: u8, key_len: usize) -> Result<Vec<u8>> {
    let run = &st.negotiate_st.run;
    let (Some(kex), Some(kex_output)) = (run.kex.as_deref(), run.kex_output.as_ref()) else {
        return Err(Error::Protocol("deriving keys before the key exchange finished"))
    };
    // the peer's SSH_MSG_NEWKEYS may arrive while we still wait for the host key to be accepted
    let session_id = st.session_id.as_deref().unwrap_or(&kex_output.exchange_hash[..]);
    Ok(expand_key(kex, kex_output, session_id, key_type, key_len))
}

fn expand_key(
    kex: &dyn Kex,
    kex_output: &KexOutput,
    session_id: &[u8],
    key_type: u8,
    key_len: usize,
) -> Vec<u8> {
    // RFC 4253, section 7.2
    let mut to_hash_prefix = PacketEncode::new();
    to_hash_prefix.put_mpint_uint_be(&kex_output.shared_secret_be);
    to_hash_prefix.put_raw(&kex_output.exchange_hash);

    let mut key = {
        let mut to_hash = to_hash_prefix.clone();
        to_hash.put_u8(key_type);
        to_hash.put_raw(session_id);
        kex.compute_hash(&to_hash.finish())
    };

    while key.len() < key_len {
        let mut to_hash = to_hash_prefix.clone();
        to_hash.put_raw(&key);
        key.extend_from_slice(&kex.compute_hash(&to_hash.finish()));
    }

    key.truncate(key_len);
    key
}

/// May we send packets other than key exchange messages?
pub(super) fn is_ready(st: &SessionState) -> bool {
    st.negotiate_st.state == State::Idle
}

/// Did the peer start a key exchange that did not yet finish in its direction?
pub(super) fn is_peer_in_kex(st: &SessionState) -> bool {
    st.negotiate_st.run.their_kex_init.is_some() && !st.negotiate_st.run.new_keys_recvd
}

pub(super) fn is_rekeying(st: &SessionState) -> bool {
    st.session_id.is_some() && st.negotiate_st.state != State::Idle
}

pub(super) fn abort(st: &mut SessionState, err: &Error) {
    for done_tx in st.negotiate_st.done_txs.drain(..) {
        done_tx.resolve(Err(err.clone()));
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng as _;
    use super::*;
    use crate::kex;

    #[test]
    fn test_choose_name() {
        assert_eq!(choose_name(&["a", "b"], &["b", "c"]), Some("b"));
        assert_eq!(choose_name(&["b", "a"], &["a", "b"]), Some("b"));
        assert_eq!(choose_name(&["a"], &["c"]), None);
        assert_eq!(choose_name(&[], &["c"]), None);
    }

    #[test]
    fn test_negotiate_algo_prefers_client() {
        let ours: &[&'static KexAlgo] = &[&kex::CURVE25519_SHA256, &kex::DIFFIE_HELLMAN_GROUP14_SHA256];
        let theirs = vec!["diffie-hellman-group14-sha256".to_string(), "curve25519-sha256".to_string()];

        let algo = negotiate_algo(Role::Client, ours, &theirs, "key exchange").unwrap();
        assert_eq!(algo.name, "curve25519-sha256");
        let algo = negotiate_algo(Role::Server, ours, &theirs, "key exchange").unwrap();
        assert_eq!(algo.name, "diffie-hellman-group14-sha256");

        let theirs = vec!["diffie-hellman-group1-sha1".to_string()];
        match negotiate_algo(Role::Client, ours, &theirs, "key exchange") {
            Err(Error::AlgoNegotiate(err)) => {
                assert_eq!(err.algo_name, "key exchange");
                assert_eq!(err.their_algos, theirs);
            },
            res => panic!("unexpected result {:?}", res.map(|a| a.name)),
        }
    }

    #[test]
    fn test_wrong_guess() {
        let their = |kex: &str, pubkey: &str, follows: bool| TheirKexInit {
            payload: Bytes::new(),
            kex_algos: vec![kex.into(), "curve25519-sha256".into()],
            server_pubkey_algos: vec![pubkey.into()],
            cipher_algos_cts: vec![],
            cipher_algos_stc: vec![],
            mac_algos_cts: vec![],
            mac_algos_stc: vec![],
            compress_algos_cts: vec![],
            compress_algos_stc: vec![],
            first_kex_packet_follows: follows,
        };
        let algos = Algos {
            kex: &kex::CURVE25519_SHA256,
            server_pubkey: &crate::pubkey::SSH_ED25519,
            cipher_cts: &crate::cipher::AES128_CTR,
            cipher_stc: &crate::cipher::AES128_CTR,
            mac_cts: &mac::HMAC_SHA2_256,
            mac_stc: &mac::HMAC_SHA2_256,
            compress_cts: &crate::compress::NONE,
            compress_stc: &crate::compress::NONE,
        };

        let mut run = KexRun::default();
        run.their_kex_init = Some(their("curve25519-sha256", "ssh-ed25519", true));
        assert!(!is_wrong_guess(&run, &algos));
        run.their_kex_init = Some(their("diffie-hellman-group14-sha256", "ssh-ed25519", true));
        assert!(is_wrong_guess(&run, &algos));
        run.their_kex_init = Some(their("curve25519-sha256", "rsa-sha2-256", true));
        assert!(is_wrong_guess(&run, &algos));
        run.their_kex_init = Some(their("diffie-hellman-group14-sha256", "rsa-sha2-256", false));
        assert!(!is_wrong_guess(&run, &algos));
    }

    #[test]
    fn test_expand_key_is_deterministic_per_tag() {
        let (client_out, server_out) = kex::tests::run_kex(&kex::CURVE25519_SHA256, Default::default());
        let make = || (kex::CURVE25519_SHA256.make_kex)(KexParams {
            role: Role::Client,
            rng: &mut rand_chacha::ChaCha8Rng::seed_from_u64(3),
            gex_bits: Default::default(),
        }).unwrap();
        let kex = make();
        let session_id = client_out.exchange_hash.clone();

        for tag in [b'A', b'B', b'C', b'D', b'E', b'F'] {
            let client_key = expand_key(&*kex, &client_out, &session_id, tag, 64);
            let server_key = expand_key(&*kex, &server_out, &session_id, tag, 64);
            assert_eq!(client_key, server_key);
            assert_eq!(client_key.len(), 64);
        }
        assert_ne!(
            expand_key(&*kex, &client_out, &session_id, b'A', 32),
            expand_key(&*kex, &client_out, &session_id, b'B', 32),
        );
        // a longer key extends the shorter one
        assert_eq!(
            expand_key(&*kex, &client_out, &session_id, b'C', 16),
            expand_key(&*kex, &client_out, &session_id, b'C', 48)[..16],
        );
    }
}
