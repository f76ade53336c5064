pub mod capture;
pub mod cleanup;
pub mod config;
pub mod controller;
pub mod debuglog;
pub mod mount;
pub mod partition;
pub mod pids;
pub mod registry;
pub mod session;
pub mod stats;
pub mod tracepoints;

pub use config::HostConfig;
pub use controller::HostController;
pub use mount::MountOptions;
pub use registry::{KillPolicy, ProcessRegistry};
pub use session::{SessionError, TraceOptions};
