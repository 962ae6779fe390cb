//! Byte-stable binary encoding for on-disk persistence.
//!
//! The metadata log and run files share one hand-written wire format via the
//! [`Encode`] and [`Decode`] traits. Owning the format keeps the on-disk
//! representation independent of any serialization dependency.
//!
//! # Wire format
//!
//! | Rust type         | Encoding                                     |
//! |-------------------|----------------------------------------------|
//! | `u8`              | 1 byte                                       |
//! | `u32`             | 4 bytes, little-endian                       |
//! | `u64`             | 8 bytes, little-endian                       |
//! | `bool`            | 1 byte (`0x00` = false, `0x01` = true)       |
//! | `Vec<u8>`         | `[u32 len][bytes]`                           |
//! | `String`          | `[u32 len][utf-8 bytes]`                     |
//! | `Option<T>`       | `[u8 tag: 0=None, 1=Some][T if Some]`        |
//! | `Vec<T>`          | `[u32 count][T₁][T₂]…`                       |
//! | `enum`            | `[u32 variant][fields…]` (hand-written)      |
//!
//! All multi-byte integers are little-endian. Lengths and counts are `u32`.
//!
//! Variable-length decoders enforce [`MAX_BYTE_LEN`] and [`MAX_ITEM_COUNT`]
//! so a corrupted length field cannot trigger an allocation bomb. Nothing in
//! this module panics; all failures surface as [`EncodingError`].

#[cfg(test)]
mod tests;

use thiserror::Error;

/// Maximum decoded byte length for a single `Vec<u8>` or `String` (64 MiB).
pub const MAX_BYTE_LEN: u32 = 64 * 1024 * 1024;

/// Maximum decoded element count for `Vec<T>` (4 M).
pub const MAX_ITEM_COUNT: u32 = 4 * 1024 * 1024;

// ------------------------------------------------------------------------------------------------
// Error type
// ------------------------------------------------------------------------------------------------

/// Errors produced while encoding or decoding wire data.
#[derive(Debug, Error)]
pub enum EncodingError {
    /// The buffer ran out of bytes before decoding completed.
    #[error("unexpected end of buffer (need {needed} bytes, have {available})")]
    UnexpectedEof { needed: usize, available: usize },

    /// An enum discriminant was not recognised.
    #[error("invalid tag {tag} for {type_name}")]
    InvalidTag { tag: u32, type_name: &'static str },

    /// A bool field held a byte other than `0x00` or `0x01`.
    #[error("invalid bool byte: 0x{0:02X}")]
    InvalidBool(u8),

    /// A byte sequence decoded as a string was not valid UTF-8.
    #[error("invalid UTF-8: {0}")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),

    /// A length or count exceeded its safety limit.
    #[error("length overflow: {0}")]
    LengthOverflow(String),
}

// ------------------------------------------------------------------------------------------------
// Core traits
// ------------------------------------------------------------------------------------------------

/// Serialize `self` into a byte buffer.
///
/// Implementations must be deterministic: the same logical value always
/// yields the same byte sequence.
pub trait Encode {
    /// Append the encoded representation of `self` to `buf`.
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError>;
}

/// Deserialize a value from the front of a byte slice.
///
/// Returns `(value, bytes_consumed)` so callers can advance a cursor through
/// a buffer holding several encoded items.
pub trait Decode: Sized {
    /// Decode one value starting at `buf[0]`.
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError>;
}

/// Encode a value into a freshly-allocated `Vec<u8>`.
pub fn encode_to_vec<T: Encode>(value: &T) -> Result<Vec<u8>, EncodingError> {
    let mut buf = Vec::new();
    value.encode_to(&mut buf)?;
    Ok(buf)
}

/// Decode a value from the beginning of `buf`, returning `(value, consumed)`.
pub fn decode_from_slice<T: Decode>(buf: &[u8]) -> Result<(T, usize), EncodingError> {
    T::decode_from(buf)
}

// ------------------------------------------------------------------------------------------------
// Internal helpers
// ------------------------------------------------------------------------------------------------

#[inline]
fn require(buf: &[u8], needed: usize) -> Result<(), EncodingError> {
    if buf.len() < needed {
        Err(EncodingError::UnexpectedEof {
            needed,
            available: buf.len(),
        })
    } else {
        Ok(())
    }
}

#[inline]
fn len_to_u32(len: usize) -> Result<u32, EncodingError> {
    u32::try_from(len)
        .map_err(|_| EncodingError::LengthOverflow(format!("length {len} exceeds u32::MAX")))
}

// ------------------------------------------------------------------------------------------------
// Primitives
// ------------------------------------------------------------------------------------------------

impl Encode for u8 {
    #[inline]
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        buf.push(*self);
        Ok(())
    }
}

impl Decode for u8 {
    #[inline]
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        require(buf, 1)?;
        Ok((buf[0], 1))
    }
}

impl Encode for u32 {
    #[inline]
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        buf.extend_from_slice(&self.to_le_bytes());
        Ok(())
    }
}

impl Decode for u32 {
    #[inline]
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        require(buf, 4)?;
        let mut b = [0u8; 4];
        b.copy_from_slice(&buf[..4]);
        Ok((u32::from_le_bytes(b), 4))
    }
}

impl Encode for u64 {
    #[inline]
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        buf.extend_from_slice(&self.to_le_bytes());
        Ok(())
    }
}

impl Decode for u64 {
    #[inline]
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        require(buf, 8)?;
        let mut b = [0u8; 8];
        b.copy_from_slice(&buf[..8]);
        Ok((u64::from_le_bytes(b), 8))
    }
}

impl Encode for bool {
    #[inline]
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        buf.push(u8::from(*self));
        Ok(())
    }
}

impl Decode for bool {
    #[inline]
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        require(buf, 1)?;
        match buf[0] {
            0x00 => Ok((false, 1)),
            0x01 => Ok((true, 1)),
            other => Err(EncodingError::InvalidBool(other)),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Byte strings
// ------------------------------------------------------------------------------------------------

impl Encode for Vec<u8> {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        len_to_u32(self.len())?.encode_to(buf)?;
        buf.extend_from_slice(self);
        Ok(())
    }
}

impl Decode for Vec<u8> {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (len, mut offset) = u32::decode_from(buf)?;
        if len > MAX_BYTE_LEN {
            return Err(EncodingError::LengthOverflow(format!(
                "byte length {len} exceeds limit {MAX_BYTE_LEN}"
            )));
        }
        let len = len as usize;
        require(&buf[offset..], len)?;
        let bytes = buf[offset..offset + len].to_vec();
        offset += len;
        Ok((bytes, offset))
    }
}

impl Encode for String {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        len_to_u32(self.len())?.encode_to(buf)?;
        buf.extend_from_slice(self.as_bytes());
        Ok(())
    }
}

impl Decode for String {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (bytes, consumed) = Vec::<u8>::decode_from(buf)?;
        Ok((String::from_utf8(bytes)?, consumed))
    }
}

// ------------------------------------------------------------------------------------------------
// Containers
// ------------------------------------------------------------------------------------------------

impl<T: Encode> Encode for Option<T> {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        match self {
            None => 0u8.encode_to(buf),
            Some(value) => {
                1u8.encode_to(buf)?;
                value.encode_to(buf)
            }
        }
    }
}

impl<T: Decode> Decode for Option<T> {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (tag, mut offset) = u8::decode_from(buf)?;
        match tag {
            0 => Ok((None, offset)),
            1 => {
                let (value, n) = T::decode_from(&buf[offset..])?;
                offset += n;
                Ok((Some(value), offset))
            }
            other => Err(EncodingError::InvalidTag {
                tag: u32::from(other),
                type_name: "Option",
            }),
        }
    }
}

/// Encode a slice of items as `[u32 count][items…]`.
pub fn encode_seq<T: Encode>(items: &[T], buf: &mut Vec<u8>) -> Result<(), EncodingError> {
    len_to_u32(items.len())?.encode_to(buf)?;
    for item in items {
        item.encode_to(buf)?;
    }
    Ok(())
}

/// Decode a `[u32 count][items…]` sequence, returning `(items, consumed)`.
pub fn decode_seq<T: Decode>(buf: &[u8]) -> Result<(Vec<T>, usize), EncodingError> {
    let (count, mut offset) = u32::decode_from(buf)?;
    if count > MAX_ITEM_COUNT {
        return Err(EncodingError::LengthOverflow(format!(
            "element count {count} exceeds limit {MAX_ITEM_COUNT}"
        )));
    }
    let mut items = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let (item, n) = T::decode_from(&buf[offset..])?;
        offset += n;
        items.push(item);
    }
    Ok((items, offset))
}
