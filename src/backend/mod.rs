//! Backend descriptors and the registry that resolves them

mod descriptor;
mod registry;

pub use descriptor::{BackendDescriptor, BackendId, Credential, TransportKind};
pub use registry::{HostRegistry, RegistryError, StaticRegistry};
