use bytes::{Buf as _, Bytes};
use num_bigint_dig::BigUint;
use std::str;
use crate::{Error, Result};

/// Decoding of SSH packets and other payloads (low level API).
///
/// The format of SSH payloads is described in RFC 4251, section 5. This struct just wraps a
/// [`Bytes`] instance.
#[derive(Debug)]
pub struct PacketDecode {
    buf: Bytes,
}

impl PacketDecode {
    /// Wraps the bytes into [`PacketDecode`].
    pub fn new(buf: Bytes) -> PacketDecode {
        PacketDecode { buf }
    }

    /// Decode a `byte`.
    pub fn get_u8(&mut self) -> Result<u8> {
        self.ensure(1)?;
        Ok(self.buf.get_u8())
    }

    /// Decode a `boolean`.
    pub fn get_bool(&mut self) -> Result<bool> {
        self.get_u8().map(|x| x != 0)
    }

    /// Decode a `uint32`.
    pub fn get_u32(&mut self) -> Result<u32> {
        self.ensure(4)?;
        Ok(self.buf.get_u32())
    }

    /// Decode a `string`.
    pub fn get_bytes(&mut self) -> Result<Bytes> {
        let len = self.get_u32()? as usize;
        self.ensure(len)?;
        Ok(self.buf.split_to(len))
    }

    /// Decode a `string` with fixed length.
    pub fn get_byte_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let bytes = self.get_bytes()?;
        <[u8; N]>::try_from(bytes.as_ref()).map_err(|_| Error::Decode("wrong size of `string`"))
    }

    /// Decode a `string` in UTF-8.
    pub fn get_string(&mut self) -> Result<String> {
        let bytes = self.get_bytes()?;
        match str::from_utf8(&bytes) {
            Ok(string) => Ok(string.into()),
            Err(_) => Err(Error::Decode("string is not valid utf-8")),
        }
    }

    /// Decode a `name-list`.
    pub fn get_name_list(&mut self) -> Result<Vec<String>> {
        let list = self.get_string()?;
        if list.is_empty() {
            return Ok(Vec::new())
        }
        Ok(list.split(',').map(String::from).collect())
    }

    /// Decode a non-negative `mpint` as [`BigUint`].
    pub fn get_biguint(&mut self) -> Result<BigUint> {
        let bytes = self.get_bytes()?;
        if matches!(bytes.first(), Some(&x) if x >= 0x80) {
            return Err(Error::Decode("expected a non-negative mpint"))
        }
        Ok(BigUint::from_bytes_be(&bytes))
    }

    /// Decode a `mpint` as a scalar in unsigned big endian with given length.
    pub fn get_scalar(&mut self, len: usize) -> Result<Vec<u8>> {
        let bytes = self.get_bytes()?;
        let first_nonzero = bytes.iter().position(|&x| x != 0).unwrap_or(bytes.len());
        let digits = &bytes[first_nonzero..];
        if digits.len() > len {
            return Err(Error::Decode("decoded number is too long"));
        }

        let mut digits_be = vec![0; len];
        digits_be[len - digits.len()..].copy_from_slice(digits);
        Ok(digits_be)
    }

    /// Skip `len` bytes.
    pub fn skip(&mut self, len: usize) -> Result<()> {
        self.ensure(len)?;
        self.buf.advance(len);
        Ok(())
    }

    /// Read `len` bytes directly from the buffer.
    pub fn get_raw(&mut self, len: usize) -> Result<Bytes> {
        self.ensure(len)?;
        Ok(self.buf.split_to(len))
    }

    fn ensure(&self, min_remaining: usize) -> Result<()> {
        if min_remaining <= self.buf.remaining() {
            Ok(())
        } else {
            Err(Error::Decode("unexpected end of packet"))
        }
    }

    /// Return the remaining undecoded bytes.
    pub fn remaining(&self) -> Bytes {
        self.buf.clone()
    }

    /// Return the number of remaining undecoded bytes.
    pub fn remaining_len(&self) -> usize {
        self.buf.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(data: &[u8]) -> PacketDecode {
        PacketDecode::new(Bytes::copy_from_slice(data))
    }

    #[test]
    fn test_get_u32() {
        let mut d = decode(&[0,0,0,42, 0xde,0xad,0xbe,0xef]);
        assert_eq!(d.get_u32().unwrap(), 42);
        assert_eq!(d.get_u32().unwrap(), 0xdeadbeef);
        assert!(decode(&[0xde,0xad]).get_u32().is_err());
    }

    #[test]
    fn test_get_bytes() {
        let mut d = decode(&[0,0,0,2, 10,20]);
        assert_eq!(d.get_bytes().unwrap().as_ref(), &[10,20]);
        assert_eq!(d.remaining_len(), 0);
        assert!(decode(&[0,0,2]).get_bytes().is_err());
        assert!(decode(&[0,0,0,8, 10,20,30]).get_bytes().is_err());
    }

    #[test]
    fn test_get_name_list() {
        assert_eq!(decode(b"\x00\x00\x00\x00").get_name_list().unwrap(), Vec::<String>::new());
        assert_eq!(decode(b"\x00\x00\x00\x04zlib").get_name_list().unwrap(), vec!["zlib"]);
        assert_eq!(decode(b"\x00\x00\x00\x09zlib,none").get_name_list().unwrap(), vec!["zlib", "none"]);
        assert_eq!(decode(b"\x00\x00\x00\x05zlib,").get_name_list().unwrap(), vec!["zlib", ""]);
    }

    #[test]
    fn test_get_mpint() {
        let mut d = decode(&[0,0,0,2, 0x00,0x80]);
        assert_eq!(d.get_biguint().unwrap(), BigUint::from(0x80u32));
        assert!(decode(&[0,0,0,1, 0x80]).get_biguint().is_err());

        let mut d = decode(&[0,0,0,3, 0, 0xc8, 0x1e]);
        assert_eq!(d.get_scalar(4).unwrap(), vec![0, 0, 0xc8, 0x1e]);
        assert!(decode(&[0,0,0,3, 1, 2, 3]).get_scalar(2).is_err());
    }
}
