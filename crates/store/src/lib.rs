//! vellum-store: the layered store stack over an authenticated data store.
//!
//! Blocks are executed as discrete write epochs: many transactions read at
//! a fixed snapshot, one writer commits the block's net effect. The stack
//! mirrors that shape:
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │             Transaction Store                │
//! │   (per-tx read cache + write buffer)        │
//! └────────────────┬────────────────────────────┘
//!                  │ shared lease, merge-back on commit
//! ┌────────────────▼────────────────────────────┐
//! │               Trunk Store                    │
//! │   (block-scoped write buffer, optional)     │
//! └────────────────┬────────────────────────────┘
//!                  │
//! ┌────────────────▼────────────────────────────┐
//! │               Root Store                     │
//! │  (sharded height-tagged cache, RW lease)    │
//! └────────────────┬────────────────────────────┘
//!                  │
//! ┌────────────────▼────────────────────────────┐
//! │        Authenticated Data Store              │
//! │  (value log + Merkle accumulator, external) │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! The root store owns the reader/writer lease that serializes block
//! writes against snapshot reads: transaction stores take the shared side
//! at creation and release it on close; the block writer takes the
//! exclusive side inside [`RootStore::update`], the only supported
//! merge-back path.
//!
//! The authenticated data store itself is a collaborator behind the
//! [`AuthenticatedStore`] trait. [`MemAuthStore`] is the in-memory
//! reference implementation: an append-only value log indexed by a
//! [`vellum_index::VersionedIndex`] and committed to with SHA-256.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]

mod ads;
mod cache;
mod mem;
mod parent;
mod root;
mod trunk;
mod tx;

pub use ads::AuthenticatedStore;
pub use mem::MemAuthStore;
pub use parent::{ParentStore, StoreWriter};
pub use root::{CacheablePredicate, RootStore};
pub use trunk::TrunkStore;
pub use tx::TxStore;
