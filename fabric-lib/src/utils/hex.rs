use bytes::{BufMut, Bytes, BytesMut};

use crate::error::FabricLibError;

pub fn fmt_hex(f: &mut std::fmt::Formatter<'_>, bytes: &[u8]) -> std::fmt::Result {
    bytes.iter().try_for_each(|x| write!(f, "{:02x}", x))
}

/// Parses an even-length, non-empty hex string.
pub fn from_hex(s: &str) -> Result<Bytes, FabricLibError> {
    if s.is_empty() || !s.len().is_multiple_of(2) {
        return Err(FabricLibError::Custom("Invalid hex length"));
    }
    let mut bytes = BytesMut::with_capacity(s.len() / 2);
    for pair in s.as_bytes().chunks(2) {
        let digits =
            std::str::from_utf8(pair).map_err(|_| FabricLibError::Custom("Invalid hex"))?;
        let byte = u8::from_str_radix(digits, 16)
            .map_err(|_| FabricLibError::Custom("Invalid hex digit"))?;
        bytes.put_u8(byte);
    }
    Ok(bytes.freeze())
}
