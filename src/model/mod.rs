//! # Data Model
//!
//! DTOs that cross every boundary: caller ↔ executor ↔ handlers ↔ host.
//!
//! Design rule: pure data. No I/O, no locks, no async.

pub mod node;
pub mod edge;
pub mod value;
pub mod property_map;

pub use node::NodeId;
pub use edge::{Edge, EdgeKey};
pub use value::Value;
pub use property_map::PropertyMap;
