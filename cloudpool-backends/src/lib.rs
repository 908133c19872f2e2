pub mod backend;
pub mod selection;
pub mod union;

pub use backend::{from_config, BackendConfig, BackendKind, RcloneSettings};
pub use selection::SelectionPolicy;
pub use union::{Availability, BackendDescriptor, UnionConfig, UnionCoordinator};
