pub mod access;
pub mod cache;
pub mod context;
pub mod cursor;
pub mod depends;
pub mod error;
pub mod expr;
pub mod inherits;
pub mod reconcile;
pub mod registry;
pub mod schema;
pub mod store;
pub mod tree;

pub use cache::{Handle, RecordCache, Resolved};
pub use context::Context;
pub use cursor::Cursor;
pub use error::{Result, StrataError};
pub use expr::{Condition, Domain, Op};
pub use registry::ModelRegistry;
pub use schema::{ComputeSpec, FieldDefinition, FieldType, ModelDefinition, StoreTrigger};
pub use store::{Model, Session};
