//! Binding tables and the resource → binding back-reference relation.
//!
//! A binding table is created with one copy per frame slot. Binding a
//! relocatable resource (an array or a texture) also records a
//! [`BindingRef`] in the context's [`BindingRegistry`]. When that resource
//! moves, the deferred task refreshes each referencing copy as its frame slot
//! becomes idle:
//!
//! ```text
//!   array grows ──► task { per_frame: refresh(array, f) }
//!                          │
//!                          ├─► registry.refs(array) = [(table A, 0), (table B, 2)]
//!                          ├─► A.refresh(f, 0, new descriptor)
//!                          └─► B.refresh(f, 2, new descriptor)
//! ```

pub mod registry;
pub mod table;

pub use registry::{BindingRef, BindingRegistry};
pub use table::{BindingTable, BoundResource};
