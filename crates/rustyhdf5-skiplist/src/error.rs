//! Error types for skip list operations.

/// Errors returned by [`SkipList`](crate::SkipList) mutations.
///
/// Lookups never fail; they return `None` when nothing matches.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SkipListError {
    /// A key comparing equal to the inserted one is already in the list.
    #[error("duplicate key: an equal key is already in the skip list")]
    DuplicateKey,
    /// The node table could not grow.
    #[error("out of memory while allocating a skip list node")]
    OutOfMemory,
}

/// Result alias for skip list operations.
pub type Result<T> = core::result::Result<T, SkipListError>;
