pub mod crypto;
pub mod error;
pub mod keys;
pub mod logging;

pub use error::{SshCoreError, SshResult};
