use bytes::{BufMut as _, Bytes, BytesMut};
use num_bigint_dig::BigUint;

/// Encoding of SSH packets and other payloads (low level API).
///
/// The format is described in RFC 4251, section 5. This struct just wraps a [`BytesMut`] instance.
#[derive(Debug, Clone)]
pub struct PacketEncode {
    buf: BytesMut,
}

impl PacketEncode {
    /// Creates an empty [`PacketEncode`].
    pub fn new() -> PacketEncode {
        PacketEncode { buf: BytesMut::new() }
    }

    /// Creates a [`PacketEncode`] that starts with the given message id.
    pub fn with_msg(msg_id: u8) -> PacketEncode {
        let mut this = Self::new();
        this.put_u8(msg_id);
        this
    }

    /// Encode a `byte`.
    pub fn put_u8(&mut self, value: u8) {
        self.buf.put_u8(value);
    }

    /// Encode a `boolean`.
    pub fn put_bool(&mut self, value: bool) {
        self.buf.put_u8(value as u8);
    }

    /// Encode a `uint32`.
    pub fn put_u32(&mut self, value: u32) {
        self.buf.put_u32(value);
    }

    /// Encode a `string`.
    ///
    /// The length prefix saturates at `u32::MAX`. A payload with such a string is longer than any
    /// SSH packet, so the session refuses to send it.
    pub fn put_bytes(&mut self, value: &[u8]) {
        self.buf.reserve(4 + value.len());
        self.buf.put_u32(string_len(value.len()));
        self.buf.put_slice(value);
    }

    /// Encode a `string` in UTF-8.
    pub fn put_str(&mut self, value: &str) {
        self.put_bytes(value.as_bytes())
    }

    /// Encode a `name-list`.
    pub fn put_name_list<S: AsRef<str>>(&mut self, names: &[S]) {
        let joined = names.iter().map(|name| name.as_ref()).collect::<Vec<_>>().join(",");
        self.put_str(&joined);
    }

    /// Encode a `mpint` from a [`BigUint`].
    pub fn put_biguint(&mut self, value: &BigUint) {
        self.put_mpint_uint_be(&value.to_bytes_be());
    }

    /// Encode a non-negative `mpint` from its unsigned big endian digits.
    ///
    /// Leading zeros are stripped and a zero byte is prepended when the most significant bit is
    /// set, so that the number is not interpreted as negative (RFC 4251, section 5).
    pub fn put_mpint_uint_be(&mut self, digits_be: &[u8]) {
        let first_nonzero = digits_be.iter().position(|&x| x != 0).unwrap_or(digits_be.len());
        let digits_be = &digits_be[first_nonzero..];
        let sign_pad = matches!(digits_be.first(), Some(&x) if x >= 0x80);

        self.buf.reserve(5 + digits_be.len());
        self.buf.put_u32((digits_be.len() + sign_pad as usize) as u32);
        if sign_pad {
            self.buf.put_u8(0);
        }
        self.buf.put_slice(digits_be);
    }

    /// Append raw bytes to the buffer.
    pub fn put_raw(&mut self, data: &[u8]) {
        self.buf.put_slice(data);
    }

    /// Unwraps the internal bytes.
    pub fn into_bytes(self) -> BytesMut {
        self.buf
    }

    /// Unwraps and freezes the internal bytes.
    pub fn finish(self) -> Bytes {
        self.buf.freeze()
    }
}

impl Default for PacketEncode {
    fn default() -> Self { Self::new() }
}

fn string_len(len: usize) -> u32 {
    u32::try_from(len).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_msg() {
        let mut e = PacketEncode::with_msg(94);
        e.put_bool(true);
        assert_eq!(e.finish().as_ref(), &[94, 1]);
    }

    #[test]
    fn test_put_string() {
        let mut e = PacketEncode::new();
        e.put_bytes(&[]);
        e.put_str("ssh");
        assert_eq!(e.finish().as_ref(), &[0,0,0,0, 0,0,0,3, b's',b's',b'h']);
    }

    #[test]
    #[cfg(target_pointer_width = "64")]
    fn test_string_len_saturates() {
        assert_eq!(string_len(3), 3);
        assert_eq!(string_len(u32::MAX as usize), u32::MAX);
        assert_eq!(string_len(u32::MAX as usize + 1), u32::MAX);
    }

    #[test]
    fn test_put_name_list() {
        fn check(value: &[&str], expected_bytes: &[u8]) {
            let mut e = PacketEncode::new();
            e.put_name_list(value);
            assert_eq!(e.finish().as_ref(), expected_bytes);
        }

        check(&[], &[0,0,0,0]);
        check(&["zlib"], &[0,0,0,4, b'z',b'l',b'i',b'b']);
        check(&["a", "bc"], &[0,0,0,4, b'a', b',', b'b',b'c']);
    }

    #[test]
    fn test_put_mpint() {
        // examples from RFC 4251, section 5
        fn check(value_be: &[u8], expected_bytes: &[u8]) {
            let mut e = PacketEncode::new();
            e.put_biguint(&BigUint::from_bytes_be(value_be));
            assert_eq!(e.finish().as_ref(), expected_bytes);

            let mut e = PacketEncode::new();
            e.put_mpint_uint_be(value_be);
            assert_eq!(e.finish().as_ref(), expected_bytes);
        }

        check(&[], &[0,0,0,0]);
        check(&[0, 0], &[0,0,0,0]);
        check(&[0x09,0xa3,0x78,0xf9,0xb2,0xe3,0x32,0xa7],
            &[0,0,0,8, 0x09,0xa3,0x78,0xf9,0xb2,0xe3,0x32,0xa7]);
        check(&[0x80], &[0,0,0,2, 0x00,0x80]);
        check(&[0, 0, 0xc8, 0x1e], &[0,0,0,3, 0, 0xc8, 0x1e]);
    }
}
