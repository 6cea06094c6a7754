//! Compact polymorphic value cell
//!
//! The slot type for both keys and values. Short strings are stored inline,
//! canonical integers as an i64, mid-size ASCII strings as a packed heap
//! blob, containers as typed payloads, and tiered values as a disk segment
//! descriptor. A side-band mask byte carries expiry/stickiness/touch state
//! and the ASCII length-rounding flags.
//!
//! Invariant: exactly one representation is active at any time; every
//! representation switch drops the previous inner allocation first (by Rust
//! ownership, the old payload is released on assignment).

use crate::ascii;
use crate::dense_table::{hash_bytes, DenseTable};
use crate::listpack::{parse_canonical_int, ListPack};
use crate::sbf::Sbf;
use crate::sorted_map::SortedMap;
use crate::string_map::StringMap;
use std::collections::VecDeque;

/// Inline capacity of the cell.
pub const INLINE_LEN: usize = 16;

/// Mask bits.
pub mod mask {
    /// Set on non-owning views produced for lookups; such a cell must never
    /// release an inner allocation.
    pub const REF: u8 = 0x01;
    /// The key has an expiry entry in the expire table.
    pub const EXPIRE: u8 = 0x02;
    /// The key carries memcache-style flags.
    pub const FLAG: u8 = 0x04;
    /// ASCII packing active; decoded length rounds down.
    pub const ASCII1_ENC: u8 = 0x08;
    /// ASCII packing active; decoded length rounds up.
    pub const ASCII2_ENC: u8 = 0x10;
    /// Tiered storage has an in-flight request for this value.
    pub const IO_PENDING: u8 = 0x20;
    /// Never evict.
    pub const STICKY: u8 = 0x40;
    /// Accessed since the last offloading sweep (SIEVE-style cold marker).
    pub const TOUCHED: u8 = 0x80;

    pub const ENC: u8 = ASCII1_ENC | ASCII2_ENC;
    /// Bits that survive a value overwrite.
    pub const PERSISTENT: u8 = EXPIRE | FLAG | STICKY;
}

/// Object types recognized by the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjType {
    String,
    List,
    Set,
    Hash,
    ZSet,
    Json,
    Sbf,
}

pub const NUM_OBJ_TYPES: usize = 7;

impl ObjType {
    pub fn as_index(self) -> usize {
        match self {
            ObjType::String => 0,
            ObjType::List => 1,
            ObjType::Set => 2,
            ObjType::Hash => 3,
            ObjType::ZSet => 4,
            ObjType::Json => 5,
            ObjType::Sbf => 6,
        }
    }

    /// Name reported by the TYPE command.
    pub fn type_name(self) -> &'static str {
        match self {
            ObjType::String => "string",
            ObjType::List => "list",
            ObjType::Set => "set",
            ObjType::Hash => "hash",
            ObjType::ZSet => "zset",
            ObjType::Json => "ReJSON-RL",
            ObjType::Sbf => "MBbloom--",
        }
    }
}

/// Hash value payload: packed or hashed encoding.
pub enum HashPayload {
    ListPack(ListPack),
    Map(Box<StringMap>),
}

impl HashPayload {
    pub fn len(&self) -> usize {
        match self {
            HashPayload::ListPack(lp) => lp.len() / 2,
            HashPayload::Map(sm) => sm.upper_bound_size(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn mem_used(&self) -> usize {
        match self {
            HashPayload::ListPack(lp) => lp.mem_used(),
            HashPayload::Map(sm) => sm.mem_used(),
        }
    }
}

/// Sorted-set value payload: packed or skip-list encoding.
pub enum ZSetPayload {
    ListPack(ListPack),
    SkipList(Box<SortedMap>),
}

impl ZSetPayload {
    pub fn len(&self) -> usize {
        match self {
            ZSetPayload::ListPack(lp) => lp.len() / 2,
            ZSetPayload::SkipList(sm) => sm.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn mem_used(&self) -> usize {
        match self {
            ZSetPayload::ListPack(lp) => lp.mem_used(),
            ZSetPayload::SkipList(sm) => sm.mem_used(),
        }
    }
}

/// Set value payload.
pub enum SetPayload {
    IntSet(Vec<i64>),
    Map(Box<DenseTable<()>>),
}

impl SetPayload {
    pub fn len(&self) -> usize {
        match self {
            SetPayload::IntSet(v) => v.len(),
            SetPayload::Map(m) => m.len(),
        }
    }

    pub fn mem_used(&self) -> usize {
        match self {
            SetPayload::IntSet(v) => v.capacity() * 8,
            SetPayload::Map(m) => m.mem_used(),
        }
    }
}

/// Typed container payload; the concrete encoding is recorded structurally
/// by the variant.
pub enum Payload {
    Str(Box<[u8]>),
    Hash(HashPayload),
    ZSet(ZSetPayload),
    Set(SetPayload),
    List(VecDeque<Box<[u8]>>),
}

impl Payload {
    pub fn obj_type(&self) -> ObjType {
        match self {
            Payload::Str(_) => ObjType::String,
            Payload::Hash(_) => ObjType::Hash,
            Payload::ZSet(_) => ObjType::ZSet,
            Payload::Set(_) => ObjType::Set,
            Payload::List(_) => ObjType::List,
        }
    }

    pub fn mem_used(&self) -> usize {
        match self {
            Payload::Str(s) => s.len(),
            Payload::Hash(h) => h.mem_used(),
            Payload::ZSet(z) => z.mem_used(),
            Payload::Set(s) => s.mem_used(),
            Payload::List(l) => l.iter().map(|e| e.len() + 8).sum(),
        }
    }
}

enum Repr {
    Inline { len: u8, buf: [u8; INLINE_LEN] },
    Int(i64),
    Small(Box<[u8]>),
    Robj(Payload),
    External { offset: u64, len: u32 },
    Json { encoding: u8, data: Box<[u8]> },
    Sbf(Box<Sbf>),
    /// Non-owning view of a container or filter cell (REF bit set): only
    /// the identity facts survive, never a handle to the owner's payload.
    View { obj_type: ObjType, len: usize },
}

impl Default for Repr {
    fn default() -> Self {
        Repr::Inline {
            len: 0,
            buf: [0; INLINE_LEN],
        }
    }
}

/// The 16-byte-style polymorphic cell.
#[derive(Default)]
pub struct CompactValue {
    repr: Repr,
    mask: u8,
}

// Strings above the inline size but within this bound go to the packed
// small-string representation when ASCII.
const SMALL_LEN: usize = 32;

impl CompactValue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn of(s: &[u8]) -> Self {
        let mut v = Self::default();
        v.set_string(s);
        v
    }

    // ==================== mask accessors ====================

    pub fn mask_bits(&self) -> u8 {
        self.mask
    }

    fn set_bit(&mut self, bit: u8, on: bool) {
        if on {
            self.mask |= bit;
        } else {
            self.mask &= !bit;
        }
    }

    pub fn has_expire(&self) -> bool {
        self.mask & mask::EXPIRE != 0
    }

    pub fn set_expire(&mut self, e: bool) {
        self.set_bit(mask::EXPIRE, e);
    }

    pub fn has_flag(&self) -> bool {
        self.mask & mask::FLAG != 0
    }

    pub fn set_flag(&mut self, f: bool) {
        self.set_bit(mask::FLAG, f);
    }

    pub fn was_touched(&self) -> bool {
        self.mask & mask::TOUCHED != 0
    }

    pub fn set_touched(&mut self, t: bool) {
        self.set_bit(mask::TOUCHED, t);
    }

    pub fn has_io_pending(&self) -> bool {
        self.mask & mask::IO_PENDING != 0
    }

    pub fn set_io_pending(&mut self, p: bool) {
        self.set_bit(mask::IO_PENDING, p);
    }

    pub fn is_sticky(&self) -> bool {
        self.mask & mask::STICKY != 0
    }

    pub fn set_sticky(&mut self, s: bool) {
        self.set_bit(mask::STICKY, s);
    }

    pub fn is_ref(&self) -> bool {
        self.mask & mask::REF != 0
    }

    /// Non-owning copy of this cell with the `REF` bit set, usable as a
    /// lookup key (hashing and decoded-space comparison behave like the
    /// original). String, external and JSON representations are duplicated
    /// byte for byte; container and filter payloads are reduced to their
    /// identity facts. A view therefore never holds the owner's inner
    /// allocation: dropping or resetting it cannot free the original's
    /// payload, and the tiered deallocation paths refuse views outright.
    pub fn as_ref(&self) -> CompactValue {
        let repr = match &self.repr {
            Repr::Inline { len, buf } => Repr::Inline {
                len: *len,
                buf: *buf,
            },
            Repr::Int(i) => Repr::Int(*i),
            Repr::Small(data) => Repr::Small(data.clone()),
            Repr::Robj(Payload::Str(data)) => Repr::Robj(Payload::Str(data.clone())),
            Repr::External { offset, len } => Repr::External {
                offset: *offset,
                len: *len,
            },
            Repr::Json { encoding, data } => Repr::Json {
                encoding: *encoding,
                data: data.clone(),
            },
            Repr::Robj(p) => Repr::View {
                obj_type: p.obj_type(),
                len: self.size(),
            },
            Repr::Sbf(_) => Repr::View {
                obj_type: ObjType::Sbf,
                len: self.size(),
            },
            Repr::View { obj_type, len } => Repr::View {
                obj_type: *obj_type,
                len: *len,
            },
        };
        CompactValue {
            repr,
            mask: self.mask | mask::REF,
        }
    }

    fn ascii_encoded(&self) -> bool {
        self.mask & mask::ENC != 0
    }

    fn rounds_down(&self) -> bool {
        self.mask & mask::ASCII1_ENC != 0
    }

    // ==================== string representation ====================

    /// Store a string, choosing the most compact representation. Persistent
    /// mask bits survive; encoding and io-pending bits are recomputed.
    pub fn set_string(&mut self, s: &[u8]) {
        let kept = self.mask & mask::PERSISTENT;
        self.mask = kept;
        if let Some(i) = parse_canonical_int(s) {
            self.repr = Repr::Int(i);
            return;
        }
        if s.len() <= INLINE_LEN {
            let mut buf = [0u8; INLINE_LEN];
            buf[..s.len()].copy_from_slice(s);
            self.repr = Repr::Inline {
                len: s.len() as u8,
                buf,
            };
            return;
        }
        if ascii::is_packable(s) {
            let packed = ascii::pack(s);
            let flag = if ascii::needs_round_down(s.len()) {
                mask::ASCII1_ENC
            } else {
                mask::ASCII2_ENC
            };
            self.mask |= flag;
            if s.len() <= SMALL_LEN {
                self.repr = Repr::Small(packed.into_boxed_slice());
            } else {
                self.repr = Repr::Robj(Payload::Str(packed.into_boxed_slice()));
            }
            return;
        }
        self.repr = Repr::Robj(Payload::Str(s.to_vec().into_boxed_slice()));
    }

    pub fn set_int(&mut self, i: i64) {
        let kept = self.mask & mask::PERSISTENT;
        self.mask = kept;
        self.repr = Repr::Int(i);
    }

    pub fn try_get_int(&self) -> Option<i64> {
        match &self.repr {
            Repr::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Decoded string view; uses `scratch` when the representation needs
    /// rendering or unpacking. Strings only: containers and external
    /// values yield an empty slice.
    pub fn get_slice<'a>(&'a self, scratch: &'a mut Vec<u8>) -> &'a [u8] {
        match &self.repr {
            Repr::Inline { len, buf } => &buf[..*len as usize],
            Repr::Int(i) => {
                scratch.clear();
                scratch.extend_from_slice(i.to_string().as_bytes());
                scratch
            }
            Repr::Small(data) | Repr::Robj(Payload::Str(data)) => {
                if self.ascii_encoded() {
                    let len = ascii::decoded_len(data.len(), self.rounds_down());
                    *scratch = ascii::unpack(data, len);
                    scratch
                } else {
                    data
                }
            }
            _ => &[],
        }
    }

    /// Owned decoded string.
    pub fn get_string(&self) -> Vec<u8> {
        let mut scratch = Vec::new();
        self.get_slice(&mut scratch).to_vec()
    }

    /// Raw stored bytes of a non-inline string (possibly ASCII-packed),
    /// used by the tiered layer to persist without decoding.
    pub fn get_raw_bytes(&self) -> Option<&[u8]> {
        match &self.repr {
            Repr::Small(data) | Repr::Robj(Payload::Str(data)) => Some(data),
            _ => None,
        }
    }

    // ==================== containers ====================

    /// Install a non-string container payload, releasing the previous
    /// representation.
    pub fn init_robj(&mut self, payload: Payload) {
        debug_assert!(payload.obj_type() != ObjType::String);
        let kept = self.mask & mask::PERSISTENT;
        self.mask = kept;
        self.repr = Repr::Robj(payload);
    }

    pub fn payload(&self) -> Option<&Payload> {
        match &self.repr {
            Repr::Robj(p) => Some(p),
            _ => None,
        }
    }

    pub fn payload_mut(&mut self) -> Option<&mut Payload> {
        match &mut self.repr {
            Repr::Robj(p) => Some(p),
            _ => None,
        }
    }

    pub fn set_json(&mut self, encoding: u8, data: Vec<u8>) {
        let kept = self.mask & mask::PERSISTENT;
        self.mask = kept;
        self.repr = Repr::Json {
            encoding,
            data: data.into_boxed_slice(),
        };
    }

    pub fn get_json(&self) -> Option<(u8, &[u8])> {
        match &self.repr {
            Repr::Json { encoding, data } => Some((*encoding, data)),
            _ => None,
        }
    }

    pub fn set_sbf(&mut self, sbf: Sbf) {
        let kept = self.mask & mask::PERSISTENT;
        self.mask = kept;
        self.repr = Repr::Sbf(Box::new(sbf));
    }

    pub fn sbf_mut(&mut self) -> Option<&mut Sbf> {
        match &mut self.repr {
            Repr::Sbf(s) => Some(s),
            _ => None,
        }
    }

    // ==================== external (tiered) ====================

    pub fn is_external(&self) -> bool {
        matches!(self.repr, Repr::External { .. })
    }

    /// Replace the in-memory payload with a disk segment descriptor. The
    /// mask (including encoding flags) is preserved so the raw bytes can be
    /// decoded after a fetch.
    pub fn set_external(&mut self, offset: u64, len: u32) {
        self.repr = Repr::External { offset, len };
        self.set_io_pending(false);
    }

    pub fn get_external_slice(&self) -> Option<(u64, u32)> {
        match self.repr {
            Repr::External { offset, len } => Some((offset, len)),
            _ => None,
        }
    }

    /// Copy only the descriptor and the encoding flags of an external cell;
    /// used to build a decoder for fetched raw bytes.
    pub fn import_external(&mut self, src: &CompactValue) {
        if let Repr::External { offset, len } = src.repr {
            self.repr = Repr::External { offset, len };
            self.mask = src.mask & mask::ENC;
        }
    }

    /// Transition from external back to an in-memory string. With
    /// `is_raw`, `data` is the stored (possibly packed) byte image and the
    /// current encoding flags describe how to decode it.
    pub fn materialize(&mut self, data: &[u8], is_raw: bool) {
        debug_assert!(self.is_external());
        if is_raw && self.ascii_encoded() {
            let len = ascii::decoded_len(data.len(), self.rounds_down());
            let decoded = ascii::unpack(data, len);
            self.set_string(&decoded);
        } else {
            self.set_string(data);
        }
    }

    // ==================== common ====================

    /// Logical size: string length for strings (including external ones),
    /// element count for containers.
    pub fn size(&self) -> usize {
        match &self.repr {
            Repr::Inline { len, .. } => *len as usize,
            Repr::Int(i) => i.to_string().len(),
            Repr::Small(data) | Repr::Robj(Payload::Str(data)) => {
                if self.ascii_encoded() {
                    ascii::decoded_len(data.len(), self.rounds_down())
                } else {
                    data.len()
                }
            }
            Repr::Robj(p) => match p {
                Payload::Hash(h) => h.len(),
                Payload::ZSet(z) => z.len(),
                Payload::Set(s) => s.len(),
                Payload::List(l) => l.len(),
                Payload::Str(_) => 0, // handled above
            },
            Repr::External { len, .. } => {
                if self.ascii_encoded() {
                    ascii::decoded_len(*len as usize, self.rounds_down())
                } else {
                    *len as usize
                }
            }
            Repr::Json { data, .. } => data.len(),
            Repr::Sbf(s) => s.len() as usize,
            Repr::View { len, .. } => *len,
        }
    }

    pub fn obj_type(&self) -> ObjType {
        match &self.repr {
            Repr::Inline { .. } | Repr::Int(_) | Repr::Small(_) | Repr::External { .. } => {
                ObjType::String
            }
            Repr::Robj(p) => p.obj_type(),
            Repr::Json { .. } => ObjType::Json,
            Repr::Sbf(_) => ObjType::Sbf,
            Repr::View { obj_type, .. } => *obj_type,
        }
    }

    /// Name reported by OBJECT ENCODING.
    pub fn encoding_name(&self) -> &'static str {
        match &self.repr {
            Repr::Int(_) => "int",
            Repr::Inline { .. } | Repr::Small(_) => "embstr",
            Repr::External { .. } => "raw",
            Repr::Json { .. } => "json",
            Repr::Sbf(_) => "sbf",
            Repr::View { .. } => "ref",
            Repr::Robj(p) => match p {
                Payload::Str(_) => "raw",
                Payload::Hash(HashPayload::ListPack(_)) => "listpack",
                Payload::Hash(HashPayload::Map(_)) => "hashtable",
                Payload::ZSet(ZSetPayload::ListPack(_)) => "listpack",
                Payload::ZSet(ZSetPayload::SkipList(_)) => "skiplist",
                Payload::Set(SetPayload::IntSet(_)) => "intset",
                Payload::Set(SetPayload::Map(_)) => "hashtable",
                Payload::List(_) => "quicklist",
            },
        }
    }

    /// Hash of the decoded string image; equals `hash_bytes` of the logical
    /// bytes whether or not ASCII packing is active.
    pub fn hash_code(&self) -> u64 {
        let mut scratch = Vec::new();
        hash_bytes(self.get_slice(&mut scratch))
    }

    /// Decoded-space equality against a plain string, without
    /// materializing the decoded image when packed.
    pub fn eq_bytes(&self, s: &[u8]) -> bool {
        match &self.repr {
            Repr::Inline { len, buf } => &buf[..*len as usize] == s,
            Repr::Int(i) => {
                parse_canonical_int(s).map(|v| v == *i).unwrap_or(false)
            }
            Repr::Small(data) | Repr::Robj(Payload::Str(data)) => {
                if self.ascii_encoded() {
                    ascii::decoded_len(data.len(), self.rounds_down()) == s.len()
                        && ascii::packed_eq(data, s)
                } else {
                    &**data == s
                }
            }
            _ => false,
        }
    }

    /// Heap bytes owned by the cell.
    pub fn malloc_used(&self) -> usize {
        match &self.repr {
            Repr::Inline { .. } | Repr::Int(_) | Repr::External { .. } | Repr::View { .. } => 0,
            Repr::Small(data) => data.len(),
            Repr::Robj(p) => p.mem_used(),
            Repr::Json { data, .. } => data.len(),
            Repr::Sbf(s) => s.mem_used(),
        }
    }

    /// Back to the empty string, dropping any payload and the whole mask.
    /// Safe on a `REF` view too: a view's representation is always its own
    /// duplicate or a bare identity record, never a handle into the owner,
    /// so clearing it cannot release the owner's robj payload or disk
    /// segment.
    pub fn reset(&mut self) {
        self.repr = Repr::default();
        self.mask = 0;
    }
}

impl PartialEq for CompactValue {
    fn eq(&self, other: &Self) -> bool {
        if self.obj_type() != ObjType::String || other.obj_type() != ObjType::String {
            return false;
        }
        let mut scratch = Vec::new();
        other.eq_bytes(self.get_slice(&mut scratch))
    }
}

impl std::fmt::Debug for CompactValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.repr {
            Repr::External { offset, len } => {
                write!(f, "CompactValue(external {offset}+{len})")
            }
            _ if self.obj_type() == ObjType::String => {
                write!(
                    f,
                    "CompactValue({:?})",
                    String::from_utf8_lossy(&self.get_string())
                )
            }
            _ => write!(f, "CompactValue({}/{})", self.obj_type().type_name(), self.size()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inline_roundtrip() {
        let v = CompactValue::of(b"short str!");
        assert_eq!(v.get_string(), b"short str!".to_vec());
        assert_eq!(v.size(), 10);
        assert_eq!(v.obj_type(), ObjType::String);
        assert!(v.eq_bytes(b"short str!"));
        assert!(!v.eq_bytes(b"short str?"));
    }

    #[test]
    fn test_int_representation() {
        let v = CompactValue::of(b"12345");
        assert_eq!(v.try_get_int(), Some(12345));
        assert_eq!(v.get_string(), b"12345".to_vec());
        assert_eq!(v.size(), 5);
        assert!(v.eq_bytes(b"12345"));
        // leading zeros are not canonical integers
        let v = CompactValue::of(b"007");
        assert_eq!(v.try_get_int(), None);
    }

    #[test]
    fn test_small_string_packed() {
        let s = b"twenty-four ascii chars!"; // len 24: small-string range
        let v = CompactValue::of(s);
        assert_eq!(v.get_string(), s.to_vec());
        assert_eq!(v.size(), s.len());
        assert!(v.eq_bytes(s));
        assert!(v.get_raw_bytes().is_some());
        assert!(v.get_raw_bytes().map(|r| r.len() < s.len()).unwrap_or(false));
    }

    #[test]
    fn test_large_string_packed_and_hash_agrees() {
        let s: Vec<u8> = (0..100).map(|i| b'a' + (i % 26)).collect();
        let v = CompactValue::of(&s);
        assert_eq!(v.get_string(), s);
        assert_eq!(v.hash_code(), hash_bytes(&s));
        assert!(v.eq_bytes(&s));

        // non-ascii strings stay raw but behave identically
        let mut nb = s.clone();
        nb[50] = 0xff;
        let v = CompactValue::of(&nb);
        assert_eq!(v.get_string(), nb);
        assert_eq!(v.hash_code(), hash_bytes(&nb));
    }

    #[test]
    fn test_ambiguous_packed_lengths() {
        // 23- and 24-byte ASCII strings pack into the same stored size; the
        // rounding flags must keep their logical lengths distinct.
        let s23 = b"abcdefghijklmnopqrstuvw";
        let s24 = b"abcdefghijklmnopqrstuvwx";
        let a = CompactValue::of(s23);
        let b = CompactValue::of(s24);
        assert_eq!(a.get_raw_bytes().unwrap().len(), b.get_raw_bytes().unwrap().len());
        assert_eq!(a.size(), 23);
        assert_eq!(b.size(), 24);
        assert!(a.eq_bytes(s23) && !a.eq_bytes(s24));
        assert!(b.eq_bytes(s24) && !b.eq_bytes(s23));
    }

    #[test]
    fn test_mask_bits_survive_overwrite() {
        let mut v = CompactValue::of(b"value");
        v.set_expire(true);
        v.set_sticky(true);
        v.set_touched(true);
        v.set_string(b"another value entirely, much longer than before");
        assert!(v.has_expire());
        assert!(v.is_sticky());
        assert!(!v.was_touched()); // touch state does not survive rewrites
    }

    #[test]
    fn test_external_descriptor_roundtrip() {
        let s: Vec<u8> = (0..80).map(|i| b'A' + (i % 26)).collect();
        let mut v = CompactValue::of(&s);
        let raw = v.get_raw_bytes().unwrap().to_vec();
        v.set_io_pending(true);
        v.set_external(4096, raw.len() as u32);
        assert!(v.is_external());
        assert!(!v.has_io_pending());
        assert_eq!(v.get_external_slice(), Some((4096, raw.len() as u32)));
        assert_eq!(v.size(), s.len());

        // decoder cell: descriptor + encoding flags only
        let mut decoder = CompactValue::new();
        decoder.import_external(&v);
        assert!(decoder.is_external());
        decoder.materialize(&raw, true);
        assert_eq!(decoder.get_string(), s);
    }

    #[test]
    fn test_container_payload() {
        let mut v = CompactValue::new();
        v.init_robj(Payload::Hash(HashPayload::ListPack(ListPack::new())));
        assert_eq!(v.obj_type(), ObjType::Hash);
        assert_eq!(v.encoding_name(), "listpack");
        assert_eq!(v.size(), 0);

        v.init_robj(Payload::ZSet(ZSetPayload::SkipList(Box::new(SortedMap::new()))));
        assert_eq!(v.obj_type(), ObjType::ZSet);
        assert_eq!(v.encoding_name(), "skiplist");
    }

    #[test]
    fn test_sbf_payload() {
        let mut v = CompactValue::new();
        v.set_sbf(crate::sbf::Sbf::new(32, 0.01, 2.0));
        assert_eq!(v.obj_type(), ObjType::Sbf);
        let sbf = v.sbf_mut().unwrap();
        assert!(sbf.add(b"x"));
        assert!(sbf.exists(b"x"));
    }

    #[test]
    fn test_value_equality() {
        let a = CompactValue::of(b"some value here beyond inline size ok");
        let b = CompactValue::of(b"some value here beyond inline size ok");
        let c = CompactValue::of(b"different");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_as_ref_string_views() {
        for s in [
            &b"tiny"[..],
            b"a packed ascii string in the small range",
            b"\xff\xfe not ascii, long enough to land in the robj string path",
        ] {
            let owner = CompactValue::of(s);
            let view = owner.as_ref();
            assert!(view.is_ref());
            assert!(!owner.is_ref());
            assert_eq!(view.hash_code(), owner.hash_code());
            assert!(view.eq_bytes(s));
            assert_eq!(view.size(), owner.size());
            // dropping or resetting the view leaves the owner intact
            let mut view = view;
            view.reset();
            assert_eq!(owner.get_string(), s.to_vec());
        }
    }

    #[test]
    fn test_as_ref_external_keeps_descriptor() {
        let mut owner = CompactValue::of(&vec![b'x'; 80]);
        owner.set_io_pending(true);
        owner.set_external(8192, 70);
        let view = owner.as_ref();
        assert!(view.is_ref());
        assert!(view.is_external());
        assert_eq!(view.get_external_slice(), owner.get_external_slice());
        assert_eq!(view.size(), owner.size());
    }

    #[test]
    fn test_as_ref_container_view_carries_identity_only() {
        let mut owner = CompactValue::new();
        let mut lp = ListPack::new();
        lp.insert_or_replace(b"f", b"v", false);
        owner.init_robj(Payload::Hash(HashPayload::ListPack(lp)));
        let view = owner.as_ref();
        assert!(view.is_ref());
        assert_eq!(view.obj_type(), ObjType::Hash);
        assert_eq!(view.size(), 1);
        assert_eq!(view.malloc_used(), 0);
        assert!(view.payload().is_none());
    }
}
