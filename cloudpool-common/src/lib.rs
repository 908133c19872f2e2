pub mod backend;
pub mod error;
pub mod range;

pub use backend::{BackendAdapter, ObjectDescriptor, ObjectReader};
pub use error::{Result, StorageError};
pub use range::{ByteRange, RangeRequest};
