//! Storage modules for Opalio
//!
//! The object store persists whole objects and announces hosting; the
//! fragment store layers erasure-coded redundancy on top of it.

pub mod fragment_store;
pub mod index;
pub mod object_store;

pub use fragment_store::{fragment_id, FragmentStore, FRAGMENT_TYPE};
pub use index::{IndexEntry, ObjectIndex};
pub use object_store::ObjectStore;
