/// Client and backend wire protocol (RESP)
pub mod command;
pub mod resp;

pub use command::{Command, CommandKind, KeySpec};
pub use resp::{RespEncoder, RespParseError, RespParser, RespValue};
