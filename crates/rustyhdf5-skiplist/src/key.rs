//! Key kinds understood by the skip list and their orderings.
//!
//! Every built-in kind implements [`ListKey`]; anything else goes through
//! [`SkipList::with_comparator`](crate::SkipList::with_comparator) and is
//! tagged [`KeyKind::Generic`].

use core::cmp::Ordering;
use core::fmt;

/// The kind of key a list was created for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyKind {
    /// Signed integers, numeric order.
    Int,
    /// Unsigned integers, numeric order.
    UInt,
    /// `usize` sizes, numeric order.
    Size,
    /// File addresses, numeric order.
    Address,
    /// `(file number, address)` object identity pairs.
    ObjectId,
    /// Byte strings. Lists order them by a 32-bit hash cached per node and
    /// compare bytes only when the hashes agree, so iteration order is not
    /// lexicographic.
    ByteString,
    /// Client supplied total order.
    Generic,
}

/// A key type with a built-in ordering.
pub trait ListKey {
    /// Which kind of key this is.
    const KIND: KeyKind;

    /// Total order between keys. Byte-string lists only consult it for
    /// keys whose hashes agree.
    fn compare(&self, other: &Self) -> Ordering;

    /// Hash cached on each node. Only byte-string keys use it.
    fn hash32(&self) -> u32 {
        0
    }
}

macro_rules! numeric_key {
    ($kind:expr => $($t:ty),+) => {
        $(
            impl ListKey for $t {
                const KIND: KeyKind = $kind;

                #[inline]
                fn compare(&self, other: &Self) -> Ordering {
                    self.cmp(other)
                }
            }
        )+
    };
}

numeric_key!(KeyKind::Int => i8, i16, i32, i64, isize);
numeric_key!(KeyKind::UInt => u8, u16, u32, u64);
numeric_key!(KeyKind::Size => usize);

/// A file address used as a key.
///
/// Plain `u64` keys are [`KeyKind::UInt`]; wrapping them marks the list as
/// address-keyed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Address(pub u64);

impl ListKey for Address {
    const KIND: KeyKind = KeyKind::Address;

    #[inline]
    fn compare(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Identity of an object: the file it lives in and its header address.
///
/// Ordered by file number first, then address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectId {
    /// File serial number.
    pub fileno: u64,
    /// Object header address within that file.
    pub addr: u64,
}

impl ObjectId {
    /// Create an object identity pair.
    pub fn new(fileno: u64, addr: u64) -> Self {
        Self { fileno, addr }
    }
}

impl ListKey for ObjectId {
    const KIND: KeyKind = KeyKind::ObjectId;

    fn compare(&self, other: &Self) -> Ordering {
        self.fileno
            .cmp(&other.fileno)
            .then(self.addr.cmp(&other.addr))
    }
}

/// djb2 over the key bytes.
pub fn hash_bytes(bytes: &[u8]) -> u32 {
    bytes.iter().fold(5381u32, |hash, &b| {
        (hash << 5).wrapping_add(hash).wrapping_add(u32::from(b))
    })
}

macro_rules! byte_string_key {
    ($($t:ty),+) => {
        $(
            impl ListKey for $t {
                const KIND: KeyKind = KeyKind::ByteString;

                fn compare(&self, other: &Self) -> Ordering {
                    AsRef::<[u8]>::as_ref(self).cmp(AsRef::<[u8]>::as_ref(other))
                }

                fn hash32(&self) -> u32 {
                    hash_bytes(AsRef::<[u8]>::as_ref(self))
                }
            }
        )+
    };
}

byte_string_key!(String, Vec<u8>, Box<[u8]>, &str, &[u8]);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_id_file_number_dominates() {
        let a = ObjectId::new(1, 900);
        let b = ObjectId::new(2, 10);
        assert_eq!(a.compare(&b), Ordering::Less);
        assert_eq!(b.compare(&a), Ordering::Greater);
        assert_eq!(a.compare(&ObjectId::new(1, 900)), Ordering::Equal);
        assert_eq!(a.compare(&ObjectId::new(1, 901)), Ordering::Less);
    }

    #[test]
    fn byte_strings_order_bytewise() {
        assert_eq!("abc".compare(&"abd"), Ordering::Less);
        assert_eq!("ab".compare(&"abc"), Ordering::Less);
        assert_eq!(String::from("z").compare(&String::from("a")), Ordering::Greater);
    }

    #[test]
    fn hash_matches_djb2() {
        assert_eq!(hash_bytes(b""), 5381);
        // 5381 * 33 + 'a'
        assert_eq!(hash_bytes(b"a"), 5381 * 33 + 97);
        assert_eq!("dataset".hash32(), b"dataset".to_vec().hash32());
    }

    #[test]
    fn kinds() {
        assert_eq!(<i32 as ListKey>::KIND, KeyKind::Int);
        assert_eq!(<u64 as ListKey>::KIND, KeyKind::UInt);
        assert_eq!(<usize as ListKey>::KIND, KeyKind::Size);
        assert_eq!(<Address as ListKey>::KIND, KeyKind::Address);
        assert_eq!(<ObjectId as ListKey>::KIND, KeyKind::ObjectId);
        assert_eq!(<&str as ListKey>::KIND, KeyKind::ByteString);
    }

    #[test]
    fn address_display_is_hex() {
        assert_eq!(Address(4096).to_string(), "0x1000");
    }
}
