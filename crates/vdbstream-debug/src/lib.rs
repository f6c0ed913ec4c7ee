//! Debug tools for vdbstream - TCP debug server for remote inspection
//!
//! Start the debug server in your app:
//! ```ignore
//! let handler = Arc::new(Mutex::new(MyHandler::new()));
//! let _server = DebugServer::start(handler, DEFAULT_PORT, &runtime_handle);
//! ```

pub mod protocol;
pub mod server;

pub use protocol::*;
pub use server::{DebugHandler, DebugServer, ServerError};

/// Default debug server port
pub const DEFAULT_PORT: u16 = 9743;
