pub mod store;
pub mod types;

pub use types::{Credential, CredentialDescriptor, CredentialId, RequestScope};
