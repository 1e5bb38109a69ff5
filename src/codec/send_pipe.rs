use bytes::{Buf as _, BufMut as _, BytesMut};
use rand::{Rng as _, RngCore as _, SeedableRng as _};
use rand_chacha::ChaCha8Rng;
use crate::{Error, Result};
use crate::cipher::{self, PacketEncrypt};
use crate::compress::{CompressAlgo, CompressState, Compress};
use crate::mac;
use crate::util::CryptoRngCore;

/// Sending direction of the binary packet protocol (RFC 4253, section 6).
pub(crate) struct SendPipe {
    buf: BytesMut,
    encrypt: PacketEncrypt,
    block_len: usize,
    tag_len: usize,
    packet_seq: u32,
    padding_rng: ChaCha8Rng,
    compress: CompressState<dyn Compress + Send>,
    bytes_since_kex: u64,
}

impl SendPipe {
    pub fn new(rng: &mut dyn CryptoRngCore) -> Result<SendPipe> {
        let padding_rng = ChaCha8Rng::from_rng(rng.as_rngcore())
            .map_err(|_| Error::Random("could not generate seed for padding generator"))?;
        Ok(SendPipe {
            buf: BytesMut::new(),
            encrypt: PacketEncrypt::EncryptAndMac(Box::new(cipher::Identity), Box::new(mac::Empty)),
            block_len: 8,
            tag_len: 0,
            packet_seq: 0,
            padding_rng,
            compress: CompressState::new(),
            bytes_since_kex: 0,
        })
    }

    pub fn feed_ident(&mut self, ident: &[u8]) {
        // RFC 4253, section 4.2
        self.buf.reserve(ident.len() + 2);
        self.buf.put_slice(ident);
        self.buf.put_slice(b"\r\n");
    }

    pub fn feed_packet(&mut self, payload: &[u8]) -> Result<u32> {
        log::trace!("feed packet {}, len {}, seq {}",
            payload.first().cloned().unwrap_or(0), payload.len(), self.packet_seq);

        let compressed;
        let payload = match self.compress.context() {
            Some(compress) => {
                compressed = compress.compress(payload)?;
                &compressed[..]
            },
            None => payload,
        };

        let extra_blocks = self.padding_rng.gen_range(0..=3);
        let padding_len = calculate_padding_len(
            payload.len(), self.block_len, self.encrypt.is_aead(), extra_blocks);

        // packet layout:
        // 4 bytes: `packet_len = 1 + payload_len + padding_len` (u32 big endian)
        // 1 byte: padding_len (u8)
        // `payload_len` bytes: payload
        // `padding_len` bytes: random padding
        // `tag_len` bytes: mac tag

        let packet_len = encode_packet_len(payload.len(), padding_len)?;
        let packet_begin = self.buf.len();
        let total_len = 5 + payload.len() + padding_len + self.tag_len;
        self.buf.reserve(total_len);
        self.buf.put_u32(packet_len);
        self.buf.put_u8(padding_len as u8);
        self.buf.put_slice(payload);
        self.buf.put_bytes(0, padding_len + self.tag_len);

        let packet = &mut self.buf[packet_begin..];
        self.padding_rng.fill_bytes(&mut packet[5 + payload.len()..][..padding_len]);

        let (plaintext, tag) = packet.split_at_mut(5 + payload.len() + padding_len);
        match self.encrypt {
            PacketEncrypt::EncryptAndMac(ref mut encrypt, ref mut mac) => {
                mac.sign(self.packet_seq, plaintext, tag);
                encrypt.encrypt(plaintext);
            },
            PacketEncrypt::Aead(ref mut aead) => {
                aead.encrypt_and_sign(self.packet_seq, plaintext, tag)?;
            },
        }

        let packet_seq = self.packet_seq;
        self.packet_seq = self.packet_seq.wrapping_add(1);
        self.bytes_since_kex += total_len as u64;
        Ok(packet_seq)
    }

    pub fn set_encrypt(&mut self, encrypt: PacketEncrypt, block_len: usize, tag_len: usize) {
        self.encrypt = encrypt;
        self.block_len = block_len;
        self.tag_len = tag_len;
    }

    pub fn set_compress(&mut self, algo: &'static CompressAlgo, authenticated: bool) {
        self.compress.set_algo(algo);
        self.enable_compress(authenticated);
    }

    pub fn enable_compress(&mut self, authenticated: bool) {
        self.compress.enable(authenticated, |algo: &'static CompressAlgo| (algo.make_compress)());
    }

    pub fn peek_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn consume_bytes(&mut self, len: usize) {
        self.buf.advance(len);
    }

    pub fn bytes_since_kex(&self) -> u64 {
        self.bytes_since_kex
    }

    pub fn reset_kex_counter(&mut self) {
        self.bytes_since_kex = 0;
    }
}

/// Computes the length of random padding (RFC 4253, section 6).
///
/// The padding is at least 4 bytes long and aligns the packet to `block_len` (the AEAD ciphers do
/// not encrypt the length field, so it is not counted). Up to `extra_blocks` more blocks are added
/// to hide the exact payload length, as long as the padding fits into a byte.
fn calculate_padding_len(payload_len: usize, block_len: usize, is_aead: bool, extra_blocks: usize) -> usize {
    let block_len = block_len.max(8);
    let header_len = if is_aead { 1 } else { 5 };
    let min_padded_len = header_len + payload_len + 4;
    let padded_len = (min_padded_len + block_len - 1) / block_len * block_len;
    let padding_len = padded_len - payload_len - header_len;

    let extra_blocks = extra_blocks.min((255 - padding_len) / block_len);
    padding_len + extra_blocks * block_len
}

fn encode_packet_len(payload_len: usize, padding_len: usize) -> Result<u32> {
    payload_len.checked_add(1 + padding_len)
        .and_then(|len| u32::try_from(len).ok())
        .ok_or(Error::Protocol("packet is too long to send"))
}
