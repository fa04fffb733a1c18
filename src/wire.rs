//! Typed binary builder and reader for ledger wire formats.
//!
//! Every ledger structure the gateway emits goes through [`WireWriter`] as an
//! ordered list of typed fields: single tag bytes, fixed-width byte arrays,
//! little-endian integers and ULEB128 length-prefixed vectors. [`WireReader`]
//! is the exact inverse, so each structure has one encode/decode pair.

use crate::types::{GatewayError, Result};

/// Width of a ledger account address
pub const ADDRESS_LEN: usize = 32;

/// A ledger account address
pub type Address = [u8; ADDRESS_LEN];

/// Append-only builder for a wire structure
#[derive(Debug, Default, Clone)]
pub struct WireWriter {
    buf: Vec<u8>,
}

impl WireWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    /// Enum discriminant / tag byte
    pub fn tag(&mut self, tag: u8) -> &mut Self {
        self.buf.push(tag);
        self
    }

    /// Fixed-width bytes, written without a length prefix
    pub fn fixed(&mut self, bytes: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(bytes);
        self
    }

    pub fn u8(&mut self, value: u8) -> &mut Self {
        self.buf.push(value);
        self
    }

    pub fn u64(&mut self, value: u64) -> &mut Self {
        self.buf.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn uleb128(&mut self, mut value: u64) -> &mut Self {
        loop {
            let byte = (value & 0x7f) as u8;
            value >>= 7;
            if value == 0 {
                self.buf.push(byte);
                return self;
            }
            self.buf.push(byte | 0x80);
        }
    }

    /// Length-prefixed byte vector
    pub fn bytes(&mut self, bytes: &[u8]) -> &mut Self {
        self.uleb128(bytes.len() as u64);
        self.buf.extend_from_slice(bytes);
        self
    }

    /// Length-prefixed sequence of addresses
    pub fn addresses(&mut self, addresses: &[Address]) -> &mut Self {
        self.uleb128(addresses.len() as u64);
        for address in addresses {
            self.buf.extend_from_slice(address);
        }
        self
    }

    /// Empty length-prefixed sequence
    pub fn empty_seq(&mut self) -> &mut Self {
        self.uleb128(0)
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

/// Cursor over an encoded wire structure
#[derive(Debug, Clone)]
pub struct WireReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn is_finished(&self) -> bool {
        self.pos == self.data.len()
    }

    fn take(&mut self, len: usize, what: &str) -> Result<&'a [u8]> {
        if self.remaining() < len {
            return Err(GatewayError::Wire(format!(
                "truncated {what}: need {len} bytes at offset {}, have {}",
                self.pos,
                self.remaining()
            )));
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    pub fn tag(&mut self) -> Result<u8> {
        Ok(self.take(1, "tag")?[0])
    }

    /// Read a tag and require it to equal `expected`
    pub fn expect_tag(&mut self, expected: u8, what: &str) -> Result<()> {
        let offset = self.pos;
        let tag = self.tag()?;
        if tag != expected {
            return Err(GatewayError::Wire(format!(
                "{what}: expected tag 0x{expected:02x} at offset {offset}, found 0x{tag:02x}"
            )));
        }
        Ok(())
    }

    pub fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1, "u8")?[0])
    }

    pub fn u64(&mut self) -> Result<u64> {
        let bytes = self.take(8, "u64")?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(bytes);
        Ok(u64::from_le_bytes(buf))
    }

    pub fn uleb128(&mut self) -> Result<u64> {
        let mut value: u64 = 0;
        for shift in (0..64).step_by(7) {
            let byte = self.take(1, "uleb128")?[0];
            value |= u64::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
        }
        Err(GatewayError::Wire("uleb128 overflow".into()))
    }

    pub fn fixed(&mut self, len: usize) -> Result<&'a [u8]> {
        self.take(len, "fixed bytes")
    }

    pub fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N, "array")?);
        Ok(out)
    }

    pub fn address(&mut self) -> Result<Address> {
        self.array::<ADDRESS_LEN>()
    }

    pub fn bytes(&mut self) -> Result<&'a [u8]> {
        let len = self.uleb128()? as usize;
        self.take(len, "byte vector")
    }

    pub fn addresses(&mut self) -> Result<Vec<Address>> {
        let count = self.uleb128()? as usize;
        (0..count).map(|_| self.address()).collect()
    }

    /// Rest of the input
    pub fn rest(&mut self) -> &'a [u8] {
        let slice = &self.data[self.pos..];
        self.pos = self.data.len();
        slice
    }

    /// Fail if anything is left unread
    pub fn finish(&self, what: &str) -> Result<()> {
        if !self.is_finished() {
            return Err(GatewayError::Wire(format!(
                "{what}: {} trailing bytes",
                self.remaining()
            )));
        }
        Ok(())
    }
}

/// Hex form of an address with 0x prefix
pub fn address_to_hex(address: &Address) -> String {
    format!("0x{}", hex::encode(address))
}

/// Parse a 0x-prefixed (or bare) 64-character hex address
pub fn address_from_hex(s: &str) -> Result<Address> {
    let trimmed = s.strip_prefix("0x").unwrap_or(s);
    let bytes = hex::decode(trimmed)
        .map_err(|e| GatewayError::BadRequest(format!("invalid address hex: {e}")))?;
    bytes
        .try_into()
        .map_err(|_| GatewayError::BadRequest(format!("address must be {ADDRESS_LEN} bytes")))
}

/// Serde adapter: bytes as standard-alphabet base64 strings
pub mod serde_base64 {
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(d)?;
        BASE64.decode(encoded).map_err(serde::de::Error::custom)
    }
}

/// Serde adapter for optional base64 fields
pub mod serde_base64_opt {
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(b) => s.serialize_some(&BASE64.encode(b)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<u8>>, D::Error> {
        Option::<String>::deserialize(d)?
            .map(|encoded| BASE64.decode(encoded).map_err(serde::de::Error::custom))
            .transpose()
    }
}
