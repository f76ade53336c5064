pub mod endpoint;
pub mod error;
pub mod exec;
pub mod log;
pub mod net;

pub use endpoint::Endpoint;
pub use error::ExecError;
pub use exec::{ExecOptions, ExecOutput, Executor, SpawnedProcess};
