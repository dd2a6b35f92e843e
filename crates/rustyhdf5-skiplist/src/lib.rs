//! Deterministic skip lists for in-memory indexing.
//!
//! [`SkipList`] is an ordered map built on the 1-2-3 skip list: node heights
//! follow from the insert/remove history instead of coin flips, which keeps
//! search, insert and remove logarithmic in the worst case. Nodes can be
//! reached by key or walked through [`NodeId`] handles in O(1) per step.
//!
//! Built-in key kinds ([`KeyKind`]) cover integers, sizes, file addresses,
//! object identities and byte strings. Any other type can be used with a
//! client comparator.
//!
//! ```
//! use rustyhdf5_skiplist::{Address, SkipList};
//!
//! let mut regions = SkipList::new();
//! regions.insert(Address(4096), 8191u64).unwrap();
//! regions.insert(Address(0), 4095u64).unwrap();
//! assert_eq!(regions.less(&Address(5000)), Some(&8191));
//! assert_eq!(regions.remove_first(), Some(4095));
//! ```

pub mod error;
pub mod key;
pub mod list;
pub mod pool;

pub use error::{Result, SkipListError};
pub use key::{hash_bytes, Address, KeyKind, ListKey, ObjectId};
pub use list::{Iter, NodeId, SkipList, Step};
pub use pool::{PoolPhase, PoolStats};
