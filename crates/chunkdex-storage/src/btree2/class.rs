//! Record classes for the keyed B-tree.

use bytes::BytesMut;
use std::cmp::Ordering;
use chunkdex_common::Result;

/// Type-specific record handling plugged into the keyed B-tree.
///
/// Records are fixed-size. The tree keeps them sorted by `compare` and never
/// looks inside them otherwise.
pub trait Bt2Class {
    /// Native record type.
    type Record: Clone + std::fmt::Debug;
    /// Search key. Usually a borrowed view of the fields that order records.
    type Key: ?Sized;

    /// Class identifier stored in the header and every node.
    fn type_id(&self) -> u8;

    /// Encoded size of one record.
    fn record_size(&self) -> usize;

    /// Appends exactly `record_size()` bytes for `record`.
    fn encode(&self, record: &Self::Record, buf: &mut BytesMut);

    /// Decodes one record from exactly `record_size()` bytes.
    fn decode(&self, raw: &[u8]) -> Result<Self::Record>;

    /// Orders a search key against a stored record.
    fn compare(&self, key: &Self::Key, record: &Self::Record) -> Ordering;
}
