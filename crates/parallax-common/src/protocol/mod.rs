pub mod content;
pub mod error;
pub mod message;
pub mod session;

#[cfg(test)]
mod tests;

pub use content::{
    ApplyRequestContent, ConnectionReply, EngineNotification, PurgeRequest,
    PurgeTarget, QueueRequest, RegistrationReply, RegistrationRequest, ResultRequest, Status,
};
pub use error::{EngineInfo, ParallelError, ProtocolError, RemoteError, Result};
pub use message::{Content, EngineId, Header, Message, MsgId, MsgType, DATE_FORMAT, DELIM};
pub use session::{Session, SessionConfig};
