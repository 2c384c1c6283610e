//! Call-list wire format.
//!
//! An opaque buffer describes an ordered sequence of sub-calls. Layout, all
//! scalars big-endian:
//!
//! ```text
//! u32       record count
//! per record:
//!   u64       patch word: bits[0:24) source index, bits[24:64) dest offset
//!   [u8;20]   target address
//!   [u8;32]   value (unsigned; must fit u128)
//!   u32       payload length
//!   [..]      payload bytes
//! ```
//!
//! A patch word of zero means "no patch". A nonzero source index must
//! reference a record at a lower position than the one carrying it; the
//! decoder rejects forward and self references outright rather than leaving
//! them for the executor to trip over.

/// Width of the scalar slot a patch overwrites. The instruction does not
/// carry a width; every patch destination is one word by convention.
pub const WORD_BYTES: usize = 32;

pub const ADDRESS_BYTES: usize = 20;

/// Decode-time sanity caps. Count and length prefixes are attacker-supplied;
/// they must never drive allocation past these.
pub const MAX_CALL_RECORDS: usize = 1024;
pub const MAX_PAYLOAD_LEN: usize = 1 << 20;

const PATCH_SOURCE_INDEX_BITS: u32 = 24;
const PATCH_SOURCE_INDEX_MASK: u64 = (1 << PATCH_SOURCE_INDEX_BITS) - 1;
const PATCH_DEST_OFFSET_BITS: u32 = 40;

/// 20-byte account identifier.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Address(pub [u8; ADDRESS_BYTES]);

impl Address {
    pub const ZERO: Address = Address([0; ADDRESS_BYTES]);

    pub fn as_bytes(&self) -> &[u8; ADDRESS_BYTES] {
        &self.0
    }

    /// The address left-padded into a 32-byte argument word.
    pub fn to_word(&self) -> [u8; WORD_BYTES] {
        let mut word = [0u8; WORD_BYTES];
        word[WORD_BYTES - ADDRESS_BYTES..].copy_from_slice(&self.0);
        word
    }

    pub fn from_word(word: &[u8]) -> Option<Address> {
        if word.len() != WORD_BYTES || word[..WORD_BYTES - ADDRESS_BYTES].iter().any(|&b| b != 0) {
            return None;
        }
        let mut out = [0u8; ADDRESS_BYTES];
        out.copy_from_slice(&word[WORD_BYTES - ADDRESS_BYTES..]);
        Some(Address(out))
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{}", hex_lower(&self.0))
    }
}

impl std::fmt::Debug for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Address({self})")
    }
}

impl std::str::FromStr for Address {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let hex = s.strip_prefix("0x").unwrap_or(s);
        if hex.len() != ADDRESS_BYTES * 2 {
            return Err(AddressParseError::BadLength(hex.len()));
        }
        let mut out = [0u8; ADDRESS_BYTES];
        for (i, byte) in out.iter_mut().enumerate() {
            let hi = hex_nibble(hex.as_bytes()[i * 2]).ok_or(AddressParseError::BadDigit)?;
            let lo = hex_nibble(hex.as_bytes()[i * 2 + 1]).ok_or(AddressParseError::BadDigit)?;
            *byte = (hi << 4) | lo;
        }
        Ok(Address(out))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressParseError {
    BadLength(usize),
    BadDigit,
}

impl std::fmt::Display for AddressParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AddressParseError::BadLength(n) => {
                write!(f, "address must be {} hex digits, got {n}", ADDRESS_BYTES * 2)
            }
            AddressParseError::BadDigit => write!(f, "address contains a non-hex digit"),
        }
    }
}

impl std::error::Error for AddressParseError {}

/// Bit-field directive packed into the wire's single patch word.
///
/// `source_index` is the position of the earlier record whose captured
/// return supplies the injected value; `dest_offset` is the byte offset in
/// this record's payload where the word lands. Index zero is the wire's
/// "no patch" sentinel, so a constructed `Patch` always has a nonzero
/// source index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Patch {
    source_index: u32,
    dest_offset: u64,
}

impl Patch {
    pub fn new(source_index: u32, dest_offset: u64) -> Option<Patch> {
        if source_index == 0 || u64::from(source_index) > PATCH_SOURCE_INDEX_MASK {
            return None;
        }
        if dest_offset >= (1 << PATCH_DEST_OFFSET_BITS) {
            return None;
        }
        Some(Patch {
            source_index,
            dest_offset,
        })
    }

    pub fn source_index(&self) -> usize {
        self.source_index as usize
    }

    pub fn dest_offset(&self) -> usize {
        self.dest_offset as usize
    }

    fn to_word(self) -> u64 {
        u64::from(self.source_index) | (self.dest_offset << PATCH_SOURCE_INDEX_BITS)
    }

    /// Splits a raw patch word. `Ok(None)` is the no-patch sentinel; a word
    /// with an offset but a zero source index has no meaning and is rejected.
    fn from_word(word: u64) -> Result<Option<Patch>, &'static str> {
        if word == 0 {
            return Ok(None);
        }
        let source_index = (word & PATCH_SOURCE_INDEX_MASK) as u32;
        let dest_offset = word >> PATCH_SOURCE_INDEX_BITS;
        if source_index == 0 {
            return Err("patch word carries an offset but no source index");
        }
        Ok(Some(Patch {
            source_index,
            dest_offset,
        }))
    }
}

/// One entry in the decoded call sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallRecord {
    pub patch: Option<Patch>,
    pub target: Address,
    pub value: u128,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    Malformed { offset: usize, why: &'static str },
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeError::Malformed { offset, why } => {
                write!(f, "malformed call list at byte {offset}: {why}")
            }
        }
    }
}

impl std::error::Error for DecodeError {}

struct Reader<'a> {
    buf: &'a [u8],
    off: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize, why: &'static str) -> Result<&'a [u8], DecodeError> {
        let end = self.off.checked_add(n).filter(|&end| end <= self.buf.len());
        let Some(end) = end else {
            return Err(DecodeError::Malformed {
                offset: self.off,
                why,
            });
        };
        let out = &self.buf[self.off..end];
        self.off = end;
        Ok(out)
    }

    fn u32_be(&mut self, why: &'static str) -> Result<u32, DecodeError> {
        let b = self.take(4, why)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64_be(&mut self, why: &'static str) -> Result<u64, DecodeError> {
        let b = self.take(8, why)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(b);
        Ok(u64::from_be_bytes(raw))
    }
}

/// Decodes an opaque buffer into the call sequence it describes.
///
/// Truncated buffers, inconsistent length prefixes, trailing bytes, and
/// patch references at or past the carrying record are all rejected; there
/// is no best-effort mode.
pub fn decode(buf: &[u8]) -> Result<Vec<CallRecord>, DecodeError> {
    let mut r = Reader { buf, off: 0 };

    let count = r.u32_be("buffer truncated in record count")? as usize;
    if count > MAX_CALL_RECORDS {
        return Err(DecodeError::Malformed {
            offset: 0,
            why: "record count exceeds limit",
        });
    }

    let mut records = Vec::with_capacity(count);
    for position in 0..count {
        let word_offset = r.off;
        let word = r.u64_be("buffer truncated in patch word")?;
        let patch = Patch::from_word(word).map_err(|why| DecodeError::Malformed {
            offset: word_offset,
            why,
        })?;
        if let Some(p) = &patch {
            if p.source_index() >= position {
                return Err(DecodeError::Malformed {
                    offset: word_offset,
                    why: "patch references its own record or a later one",
                });
            }
        }

        let target_bytes = r.take(ADDRESS_BYTES, "buffer truncated in target address")?;
        let mut target = [0u8; ADDRESS_BYTES];
        target.copy_from_slice(target_bytes);

        let value_offset = r.off;
        let value_bytes = r.take(WORD_BYTES, "buffer truncated in call value")?;
        if value_bytes[..WORD_BYTES - 16].iter().any(|&b| b != 0) {
            return Err(DecodeError::Malformed {
                offset: value_offset,
                why: "call value exceeds u128 range",
            });
        }
        let mut value_raw = [0u8; 16];
        value_raw.copy_from_slice(&value_bytes[WORD_BYTES - 16..]);
        let value = u128::from_be_bytes(value_raw);

        let len_offset = r.off;
        let payload_len = r.u32_be("buffer truncated in payload length")? as usize;
        if payload_len > MAX_PAYLOAD_LEN {
            return Err(DecodeError::Malformed {
                offset: len_offset,
                why: "payload length exceeds limit",
            });
        }
        let payload = r.take(payload_len, "payload shorter than its length prefix")?;

        records.push(CallRecord {
            patch,
            target: Address(target),
            value,
            payload: payload.to_vec(),
        });
    }

    if r.off != buf.len() {
        return Err(DecodeError::Malformed {
            offset: r.off,
            why: "trailing bytes after final record",
        });
    }
    Ok(records)
}

/// Exact inverse of [`decode`]: `decode(&encode(s)) == s` for every
/// representable sequence.
pub fn encode(records: &[CallRecord]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&(records.len() as u32).to_be_bytes());
    for record in records {
        let word = record.patch.map(Patch::to_word).unwrap_or(0);
        out.extend_from_slice(&word.to_be_bytes());
        out.extend_from_slice(&record.target.0);
        let mut value_word = [0u8; WORD_BYTES];
        value_word[WORD_BYTES - 16..].copy_from_slice(&record.value.to_be_bytes());
        out.extend_from_slice(&value_word);
        out.extend_from_slice(&(record.payload.len() as u32).to_be_bytes());
        out.extend_from_slice(&record.payload);
    }
    out
}

pub fn hex_lower(bytes: &[u8]) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut out = Vec::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push(HEX[(b >> 4) as usize]);
        out.push(HEX[(b & 0x0f) as usize]);
    }
    String::from_utf8(out).unwrap_or_default()
}

fn hex_nibble(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}
