pub mod registry;
pub mod server;
pub mod session;
pub mod tu;

/// Capacity of the extension table; extensions live in [0, MAX_EXTENSIONS).
pub const MAX_EXTENSIONS: usize = 1024;

pub use registry::{Pbx, RegistryError};
pub use server::{Config, Server, DEFAULT_PORT, MIN_PORT};
pub use session::Command;
pub use tu::{Tu, TuError, TuState};
