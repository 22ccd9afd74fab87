//! A transactional, versioned, copy-on-write B+tree storage engine core.
//!
//! Data lives in a single global key/value byte space (spec §3), addressed by
//! [`Key`] and organized as a B+tree of [`node::Branch`]/[`node::Leaf`] nodes.
//! Every mutation runs against a private per-transaction [`heap::NodeHeap`]
//! via a [`pathstack::Cursor`], and only becomes visible to other readers
//! once a transaction commits a new entry onto the [`version::VersionList`].
//!
//! Module map:
//! - [`key`], [`noderef`], [`node`]: the on-disk/in-memory node model.
//! - [`encoding`]: byte-level (de)serialization of nodes and version records.
//! - [`store`]: the byte-addressable backing store abstraction.
//! - [`cache`]: the bounded interior-branch cache shared across transactions.
//! - [`pathstack`]: descent, copy-on-write mutation, and rebalancing.
//! - [`version`]: append-only version history and reclamation.
//! - [`config`]: tunables.
//! - [`error`]: error types shared across the crate.
//! - [`writeseq`]: flush planning from a transaction's dirty heap into the store.
//! - [`transaction`]: the per-caller mutable view over one snapshot.
//! - [`treesystem`]: the owning object tying store, cache, and version history together.
//! - [`datafile`]: a logical byte-sequence cursor over one key.
//! - [`datarange`]: a logical byte-sequence view spanning a contiguous run of keys.

pub mod cache;
pub mod config;
pub mod datafile;
pub mod datarange;
pub mod encoding;
pub mod error;
pub mod heap;
pub mod key;
pub mod node;
pub mod noderef;
pub mod pathstack;
pub mod store;
pub mod transaction;
pub mod treesystem;
pub mod version;
pub mod writeseq;

pub use config::Config;
pub use datafile::DataFile;
pub use datarange::DataRange;
pub use error::{TreeError, TreeResult};
pub use key::Key;
pub use noderef::NodeRef;
pub use transaction::Transaction;
pub use treesystem::TreeSystem;
