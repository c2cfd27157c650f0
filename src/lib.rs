//! A concurrent in-memory ordered index in which every node carries a linear
//! model predicting the slot of a key directly, instead of binary searching
//! within the node. Point lookups and point inserts are safe under arbitrary
//! concurrency; subtrees whose models drift are rebuilt in place and retired
//! through epoch-based reclamation.

mod build;
mod epoch;
mod lock;
mod model;
mod node;
mod tree;

pub mod entry;
pub mod kv;

pub use entry::Entry;
pub use kv::{Key, Value};
pub use tree::{Clipp, DepthStats, FitStats, Options};
