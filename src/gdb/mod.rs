//! GDB Remote Serial Protocol front end

pub mod command;
pub mod connection;
pub mod feature;
pub mod packet;
pub mod response;
pub mod server;
pub mod session;

pub use command::{Command, CommandParseError};
pub use packet::ProtocolError;
pub use response::{Response, Signal};
pub use server::{GdbRspServer, GdbServerConfig};
pub use session::{DebugSession, SessionError};
