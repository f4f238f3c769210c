// Core modules for the ferrokv key-value server
pub mod error; // ProtocolError + CommandError
pub mod protocol; // RESP decoder + encoders + Value/Command types
pub mod storage; // Store with lazy expiry + background sweeper
pub mod dispatch; // Cmd parsing and execution against the Store
pub mod conn; // per-connection buffer and command loop
pub mod config; // CLI / environment configuration
pub mod net; // bind_listener + Server (mio event loops)

pub use config::{Config, DEFAULT_ADDR};
pub use conn::{Connection, Flow};
pub use dispatch::{dispatch, Cmd, Expiry};
pub use error::{CommandError, ProtocolError};
pub use net::{Server, ServerHandle};
pub use protocol::{encode, parse_command, parse_one, read_frame, Command, Value};
pub use storage::{Entry, Store};
