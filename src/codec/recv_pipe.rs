use bytes::{Bytes, BytesMut};
use crate::{Error, Result};
use crate::cipher::{self, PacketDecrypt};
use crate::compress::{self, CompressAlgo, CompressState, Decompress};
use crate::mac::{self, MacVerified};

/// Maximal length of an identification line, including the terminating CR LF (RFC 4253, section
/// 4.2).
const IDENT_LEN_MAX: usize = 255;

/// Maximal length of other lines that the server may send before its identification.
const PREAMBLE_LINE_LEN_MAX: usize = 8192;

/// Receiving direction of the binary packet protocol (RFC 4253, section 6).
pub(crate) struct RecvPipe {
    buf: BytesMut,
    state: State,
    decrypt: PacketDecrypt,
    block_len: usize,
    tag_len: usize,
    packet_seq: u32,
    packet_len_max: usize,
    decompress: CompressState<dyn Decompress + Send>,
    bytes_since_kex: u64,
}

#[derive(Debug, Copy, Clone)]
enum State {
    Ready,
    ScanningLine { pos: usize },
    DecryptedLen { packet_len: usize },
}

#[derive(Debug)]
pub struct RecvPacket {
    pub payload: Bytes,
    pub packet_seq: u32,
}

impl RecvPipe {
    pub fn new(packet_len_max: usize) -> RecvPipe {
        RecvPipe {
            buf: BytesMut::new(),
            state: State::Ready,
            decrypt: PacketDecrypt::EncryptAndMac(Box::new(cipher::Identity), Box::new(mac::Empty)),
            block_len: 8,
            tag_len: 0,
            packet_seq: 0,
            packet_len_max,
            decompress: CompressState::new(),
            bytes_since_kex: 0,
        }
    }

    pub fn feed_buf(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    /// Reads the identification line of the peer.
    ///
    /// With `allow_preamble`, other lines before the identification are skipped (a server may
    /// send them, but a client must not).
    pub fn consume_ident(&mut self, allow_preamble: bool) -> Result<Option<Bytes>> {
        loop {
            let line = match self.consume_line()? {
                Some(line) => line,
                None => return Ok(None),
            };

            if line.starts_with(b"SSH-") {
                if line.len() + 2 > IDENT_LEN_MAX {
                    return Err(Error::Version("received identification string is too long"))
                }
                return Ok(Some(line));
            } else if !allow_preamble {
                return Err(Error::Version("received a line that is not an identification string"))
            }
            log::debug!("ignoring line before identification: {:?}", String::from_utf8_lossy(&line));
        }
    }

    fn consume_line(&mut self) -> Result<Option<Bytes>> {
        let mut pos = match self.state {
            State::Ready => 0,
            State::ScanningLine { pos } => pos,
            State::DecryptedLen { .. } =>
                return Err(Error::Protocol("expected identification after binary packet")),
        };

        let mut line_len = None;
        while pos < self.buf.len() {
            if self.buf[pos] == b'\n' {
                // both CR LF and a lone LF are accepted as line terminators
                line_len = Some(if pos > 0 && self.buf[pos - 1] == b'\r' { pos - 1 } else { pos });
                pos += 1;
                break
            }
            pos += 1;
        }

        let Some(line_len) = line_len else {
            if pos > PREAMBLE_LINE_LEN_MAX {
                return Err(Error::Version("received line is too long"))
            }
            self.state = State::ScanningLine { pos };
            return Ok(None)
        };

        self.state = State::Ready;
        let mut line = self.buf.split_to(pos).freeze();
        line.truncate(line_len);
        Ok(Some(line))
    }

    pub fn consume_packet(&mut self) -> Result<Option<RecvPacket>> {
        let packet_len = match self.state {
            State::Ready => {
                let packet_len = match self.decrypt_packet_len() {
                    Some(packet_len) => packet_len as usize,
                    None => return Ok(None),
                };

                if packet_len > self.packet_len_max {
                    return Err(Error::Protocol("invalid packet length (too long, probably invalid)"));
                } else if packet_len < 5 {
                    return Err(Error::Protocol("invalid packet length (too short)"));
                }

                let aligned_len = if self.decrypt.is_aead() { packet_len } else { packet_len + 4 };
                if aligned_len % self.block_len != 0 {
                    return Err(Error::Protocol("invalid packet length (not aligned to cipher block length)"));
                }

                log::trace!("decrypted packet len {}", packet_len);
                self.state = State::DecryptedLen { packet_len };
                packet_len
            },
            State::DecryptedLen { packet_len } => packet_len,
            State::ScanningLine { .. } =>
                return Err(Error::Protocol("expected binary packet after incomplete line")),
        };

        let total_packet_len = 4 + packet_len + self.tag_len;
        if self.buf.len() < total_packet_len {
            self.buf.reserve(total_packet_len - self.buf.len());
            return Ok(None)
        }

        let mut packet = self.buf.split_to(total_packet_len);
        let _verified: MacVerified = self.decrypt_packet_body(&mut packet, packet_len)?;

        // the padding is checked only after the mac, so that a forged packet always fails with the
        // same error
        let padding_len = packet[4] as usize;
        if padding_len < 4 {
            return Err(Error::Protocol("invalid padding length (too short)"));
        } else if packet_len < 1 + padding_len {
            return Err(Error::Protocol("invalid packet length (too short for given padding)"));
        }

        let payload_len = packet_len - padding_len - 1;
        let mut payload = packet.freeze().slice(5..(5 + payload_len));
        if let Some(decompress) = self.decompress.context() {
            payload = Bytes::from(decompress.decompress(&payload)?);
        }

        let packet_seq = self.packet_seq;
        self.packet_seq = self.packet_seq.wrapping_add(1);
        self.bytes_since_kex += total_packet_len as u64;
        self.state = State::Ready;
        Ok(Some(RecvPacket { payload, packet_seq }))
    }

    fn decrypt_packet_len(&mut self) -> Option<u32> {
        let mut len_data = [0; 4];
        match self.decrypt {
            PacketDecrypt::EncryptAndMac(ref mut decrypt, _) => {
                if self.buf.len() < self.block_len { return None }
                decrypt.decrypt(&mut self.buf[..self.block_len]);
                len_data.copy_from_slice(&self.buf[..4]);
            },
            PacketDecrypt::Aead(ref mut aead) => {
                if self.buf.len() < 4 { return None }
                aead.decrypt_packet_len(self.packet_seq, &self.buf[..4], &mut len_data);
            },
        }
        Some(u32::from_be_bytes(len_data))
    }

    fn decrypt_packet_body(&mut self, packet: &mut [u8], packet_len: usize) -> Result<MacVerified> {
        match self.decrypt {
            PacketDecrypt::EncryptAndMac(ref mut decrypt, ref mut mac) => {
                decrypt.decrypt(&mut packet[self.block_len..(4 + packet_len)]);
                let (plaintext, tag) = packet.split_at(4 + packet_len);
                mac.verify(self.packet_seq, plaintext, tag)
            },
            PacketDecrypt::Aead(ref mut aead) => {
                let (packet, tag) = packet.split_at_mut(4 + packet_len);
                aead.decrypt_and_verify(self.packet_seq, packet, tag)
            },
        }
    }

    pub fn set_decrypt(&mut self, decrypt: PacketDecrypt, block_len: usize, tag_len: usize) {
        self.decrypt = decrypt;
        self.block_len = block_len;
        self.tag_len = tag_len;
    }

    pub fn set_decompress(&mut self, algo: &'static CompressAlgo, authenticated: bool) {
        self.decompress.set_algo(algo);
        self.enable_decompress(authenticated);
    }

    pub fn enable_decompress(&mut self, authenticated: bool) {
        let len_max = self.packet_len_max;
        self.decompress.enable(authenticated, |algo: &'static compress::CompressAlgo| (algo.make_decompress)(len_max));
    }

    pub fn bytes_since_kex(&self) -> u64 {
        self.bytes_since_kex
    }

    pub fn reset_kex_counter(&mut self) {
        self.bytes_since_kex = 0;
    }
}

#[cfg(test)]
mod tests {
    use rand::{Rng as _, SeedableRng as _};
    use crate::mac::Mac;
    use super::*;

    #[test]
    fn test_is_send() {
        fn assert_is_send<T: Send>() {}
        assert_is_send::<RecvPipe>()
    }

    fn b(data: &[u8]) -> Bytes {
        Bytes::copy_from_slice(data)
    }

    /// Feeds `data` into a fresh pipe in random pieces, checking the pipe before each piece and
    /// after all of them.
    fn check_feeding<F0, F1, F2>(data: &[u8], mut prepare: F0, mut before: F1, mut after: F2)
        where F0: FnMut(&mut RecvPipe),
              F1: FnMut(&mut RecvPipe),
              F2: FnMut(&mut RecvPipe),
    {
        let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(42);
        for iter in 0..50 {
            let mut data = data;
            let mut pipe = RecvPipe::new(32 * 1024);
            prepare(&mut pipe);

            while !data.is_empty() {
                before(&mut pipe);
                let feed_len = if iter == 0 { 1 } else { rng.gen_range(1..=data.len()) };
                pipe.feed_buf().extend_from_slice(&data[..feed_len]);
                data = &data[feed_len..];
            }

            after(&mut pipe);
        }
    }

    #[test]
    fn test_consume_ident_as_client() {
        check_feeding(
            b"welcome to the server\nfoo bar\r\nSSH-2.0-dummy\r\n",
            |_| (),
            |pipe| assert_eq!(pipe.consume_ident(true).unwrap(), None),
            |pipe| assert_eq!(pipe.consume_ident(true).unwrap(), Some(b(b"SSH-2.0-dummy"))),
        );

        check_feeding(
            b"SSH-2.0-dummy\n",
            |_| (),
            |pipe| assert_eq!(pipe.consume_ident(true).unwrap(), None),
            |pipe| assert_eq!(pipe.consume_ident(true).unwrap(), Some(b(b"SSH-2.0-dummy"))),
        );
    }

    #[test]
    fn test_consume_ident_as_server() {
        let mut pipe = RecvPipe::new(32 * 1024);
        pipe.feed_buf().extend_from_slice(b"GET / HTTP/1.1\r\n");
        assert!(matches!(pipe.consume_ident(false), Err(Error::Version(_))));
    }

    #[test]
    fn test_consume_ident_too_long() {
        let mut pipe = RecvPipe::new(32 * 1024);
        let mut line = b"SSH-2.0-".to_vec();
        line.extend(std::iter::repeat(b'x').take(300));
        line.extend_from_slice(b"\r\n");
        pipe.feed_buf().extend_from_slice(&line);
        assert!(matches!(pipe.consume_ident(true), Err(Error::Version(_))));
    }

    fn check_packet(data: &[u8], payload: &[u8]) {
        check_feeding(
            data,
            |_| (),
            |pipe| assert!(pipe.consume_packet().unwrap().is_none()),
            |pipe| assert_eq!(pipe.consume_packet().unwrap().unwrap().payload, b(payload)),
        );
    }

    fn check_packet_err(data: &[u8], expected_msg: &str) {
        check_feeding(
            data,
            |_| (),
            |pipe| assert!(pipe.consume_packet().unwrap().is_none()),
            |pipe| match pipe.consume_packet() {
                Err(Error::Protocol(msg)) => assert!(msg.contains(expected_msg), "{:?}", msg),
                Err(err) => panic!("unexpected error {:?}", err),
                Ok(_) => panic!("expected an error"),
            },
        );
    }

    #[test]
    fn test_consume_packet() {
        // 3 bytes of payload and 8 bytes of padding
        check_packet(b"\x00\x00\x00\x0c\x08foo01234567", b"foo");
        // 0 bytes of payload and 11 bytes of padding
        check_packet(b"\x00\x00\x00\x0c\x0b0123456789a", b"");

        check_packet_err(b"\x00\x01\x00\x0c\x00zzz", "too long");
        check_packet_err(b"\x00\x00\x00\x03\x00zzz", "too short");
        check_packet_err(b"\x00\x00\x00\x0c\x20zzzxxxxyyyy", "too short for given padding");
        check_packet_err(b"\x00\x00\x00\x0c\x02zzzzzzzzz01", "padding length");
        check_packet_err(b"\x00\x00\x00\x08\x04zzz", "not aligned");
    }

    #[test]
    fn test_sequence_numbers_wrap() {
        let mut pipe = RecvPipe::new(32 * 1024);
        pipe.packet_seq = u32::MAX;
        pipe.feed_buf().extend_from_slice(b"\x00\x00\x00\x0c\x08foo01234567");
        pipe.feed_buf().extend_from_slice(b"\x00\x00\x00\x0c\x08bar01234567");
        assert_eq!(pipe.consume_packet().unwrap().unwrap().packet_seq, u32::MAX);
        assert_eq!(pipe.consume_packet().unwrap().unwrap().packet_seq, 0);
        assert_eq!(pipe.bytes_since_kex(), 32);
    }

    #[test]
    fn test_consume_packet_mac() {
        struct DummyMac {
            expected_data: Bytes,
            verify: bool,
        }

        impl Mac for DummyMac {
            fn sign(&mut self, _: u32, _: &[u8], _: &mut [u8]) {
                panic!("called DummyMac::sign()")
            }

            fn verify(&mut self, packet_seq: u32, data: &[u8], tag: &[u8]) -> Result<MacVerified> {
                assert_eq!(packet_seq, 0);
                assert_eq!(data, self.expected_data.as_ref());
                assert_eq!(tag, b"magicmac");
                if self.verify { Ok(MacVerified::assertion()) } else { Err(Error::Mac) }
            }
        }

        let data = b"\x00\x00\x00\x0c\x08foo01234567magicmac";
        for verify in [true, false] {
            check_feeding(
                data,
                |pipe| {
                    let mac = DummyMac { expected_data: b(&data[..16]), verify };
                    let decrypt = PacketDecrypt::EncryptAndMac(Box::new(cipher::Identity), Box::new(mac));
                    pipe.set_decrypt(decrypt, 8, 8);
                },
                |pipe| assert!(pipe.consume_packet().unwrap().is_none()),
                |pipe| assert_eq!(pipe.consume_packet().is_ok(), verify),
            );
        }
    }
}
