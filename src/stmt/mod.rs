//! Statement model — tuples, keys, and index definitions.
//!
//! Every layer of the engine moves the same currency: a [`Statement`], which
//! is a tuple of byte-string fields stamped with an LSN and an operation
//! (`Replace` or `Delete`). Indexes interpret tuples through a [`KeyDef`]
//! that names which fields form the key and in what order, so a secondary
//! index can sort the same tuples differently from the primary.
//!
//! Keys extracted from tuples compare part-wise and lexicographically within
//! each part. Merge order everywhere is `(key ASC, LSN DESC)` — for a given
//! key the most recent version is seen first.

#[cfg(test)]
mod tests;

use std::cmp::Ordering;

use crate::encoding::{self, Decode, Encode, EncodingError};

// ------------------------------------------------------------------------------------------------
// Tuple
// ------------------------------------------------------------------------------------------------

/// An ordered list of byte-string fields.
///
/// The engine does not interpret field contents; comparison semantics come
/// entirely from the [`KeyDef`] applied to the tuple.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tuple {
    /// Field values, in schema order.
    pub fields: Vec<Vec<u8>>,
}

impl Tuple {
    /// Creates a tuple from raw field values.
    pub fn new(fields: Vec<Vec<u8>>) -> Self {
        Self { fields }
    }

    /// Total payload size in bytes across all fields.
    pub fn size(&self) -> usize {
        self.fields.iter().map(Vec::len).sum()
    }
}

impl Encode for Tuple {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        encoding::encode_seq(&self.fields, buf)
    }
}

impl Decode for Tuple {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (fields, n) = encoding::decode_seq::<Vec<u8>>(buf)?;
        Ok((Self { fields }, n))
    }
}

// ------------------------------------------------------------------------------------------------
// Key
// ------------------------------------------------------------------------------------------------

/// An extracted key: the ordered field values a [`KeyDef`] selected from a
/// tuple. Compares part-wise, each part lexicographically.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Key(pub Vec<Vec<u8>>);

impl Key {
    /// Total key size in bytes.
    pub fn size(&self) -> usize {
        self.0.iter().map(Vec::len).sum()
    }
}

impl Encode for Key {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        encoding::encode_seq(&self.0, buf)
    }
}

impl Decode for Key {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (parts, n) = encoding::decode_seq::<Vec<u8>>(buf)?;
        Ok((Self(parts), n))
    }
}

// ------------------------------------------------------------------------------------------------
// KeyDef
// ------------------------------------------------------------------------------------------------

/// Names the tuple fields that form an index key, in comparison order.
///
/// An LSM tree carries two of these: its own `key_def`, and a `cmp_def`
/// extended with the primary key's parts so that secondary-index entries for
/// distinct rows never compare equal. Background tasks deep-copy both at
/// construction so a concurrent schema alter cannot change comparison
/// semantics under a running worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyDef {
    /// Field indices forming the key, in comparison order.
    pub parts: Vec<usize>,
}

impl KeyDef {
    /// Creates a definition over the given field indices.
    pub fn new(parts: Vec<usize>) -> Self {
        Self { parts }
    }

    /// Returns a definition whose parts are `self`'s followed by any of
    /// `primary`'s parts not already present. This is the comparison
    /// definition a secondary index uses for uniqueness.
    pub fn merge(&self, primary: &KeyDef) -> KeyDef {
        let mut parts = self.parts.clone();
        for &p in &primary.parts {
            if !parts.contains(&p) {
                parts.push(p);
            }
        }
        KeyDef { parts }
    }

    /// Extracts the key fields from a tuple. Missing fields extract as empty.
    pub fn extract(&self, tuple: &Tuple) -> Key {
        Key(self
            .parts
            .iter()
            .map(|&i| tuple.fields.get(i).cloned().unwrap_or_default())
            .collect())
    }

    /// Compares two tuples under this definition.
    pub fn compare(&self, a: &Tuple, b: &Tuple) -> Ordering {
        for &i in &self.parts {
            let fa = a.fields.get(i).map(Vec::as_slice).unwrap_or(&[]);
            let fb = b.fields.get(i).map(Vec::as_slice).unwrap_or(&[]);
            match fa.cmp(fb) {
                Ordering::Equal => continue,
                other => return other,
            }
        }
        Ordering::Equal
    }

    /// Builds a surrogate delete for `old`: a `Delete` statement whose tuple
    /// keeps `old`'s key fields and blanks the rest. Secondary indexes can
    /// locate their entry for the stale row from this tuple alone.
    pub fn surrogate_delete(&self, old: &Statement, lsn: u64) -> Statement {
        let mut fields = vec![Vec::new(); old.tuple.fields.len()];
        for &i in &self.parts {
            if let Some(f) = old.tuple.fields.get(i) {
                fields[i] = f.clone();
            }
        }
        Statement {
            op: OpType::Delete,
            tuple: Tuple { fields },
            lsn,
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Statement
// ------------------------------------------------------------------------------------------------

/// Operation carried by a statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpType {
    /// Insert-or-overwrite of the full tuple.
    Replace,
    /// Deletion of the row the tuple's key identifies.
    Delete,
}

/// A single versioned mutation: an operation over a tuple at an LSN.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statement {
    /// The operation kind.
    pub op: OpType,
    /// The tuple payload. For `Delete` this may be a key-only surrogate.
    pub tuple: Tuple,
    /// Log sequence number; higher is newer.
    pub lsn: u64,
}

impl Statement {
    /// Creates a `Replace` statement.
    pub fn replace(fields: Vec<Vec<u8>>, lsn: u64) -> Self {
        Self {
            op: OpType::Replace,
            tuple: Tuple::new(fields),
            lsn,
        }
    }

    /// Creates a `Delete` statement.
    pub fn delete(fields: Vec<Vec<u8>>, lsn: u64) -> Self {
        Self {
            op: OpType::Delete,
            tuple: Tuple::new(fields),
            lsn,
        }
    }

    /// Approximate in-memory footprint in bytes.
    pub fn size(&self) -> usize {
        self.tuple.size() + std::mem::size_of::<u64>() + 1
    }

    /// True when the statement is a deletion.
    pub fn is_delete(&self) -> bool {
        self.op == OpType::Delete
    }
}

impl Encode for Statement {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        let tag: u8 = match self.op {
            OpType::Replace => 0,
            OpType::Delete => 1,
        };
        tag.encode_to(buf)?;
        self.lsn.encode_to(buf)?;
        self.tuple.encode_to(buf)
    }
}

impl Decode for Statement {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (tag, mut offset) = u8::decode_from(buf)?;
        let op = match tag {
            0 => OpType::Replace,
            1 => OpType::Delete,
            other => {
                return Err(EncodingError::InvalidTag {
                    tag: u32::from(other),
                    type_name: "Statement",
                });
            }
        };
        let (lsn, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (tuple, n) = Tuple::decode_from(&buf[offset..])?;
        offset += n;
        Ok((Self { op, tuple, lsn }, offset))
    }
}

// ------------------------------------------------------------------------------------------------
// Key intervals
// ------------------------------------------------------------------------------------------------

/// Returns true when `key` falls inside the half-open interval
/// `[begin, end)`, where `None` means unbounded on that side.
pub fn key_in_interval(key: &Key, begin: Option<&Key>, end: Option<&Key>) -> bool {
    if let Some(b) = begin
        && key < b
    {
        return false;
    }
    if let Some(e) = end
        && key >= e
    {
        return false;
    }
    true
}

/// Returns true when the half-open intervals `[a_begin, a_end)` and
/// `[b_begin, b_end)` overlap.
pub fn intervals_overlap(
    a_begin: Option<&Key>,
    a_end: Option<&Key>,
    b_begin: Option<&Key>,
    b_end: Option<&Key>,
) -> bool {
    let left_ok = match (a_begin, b_end) {
        (Some(ab), Some(be)) => ab < be,
        _ => true,
    };
    let right_ok = match (b_begin, a_end) {
        (Some(bb), Some(ae)) => bb < ae,
        _ => true,
    };
    left_ok && right_ok
}
