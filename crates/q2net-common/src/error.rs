// error.rs -- error types for the protocol layer

use thiserror::Error;

/// A read ran past the end of the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("read past end of message")]
pub struct EndOfMessage;

/// Structural problems in a received message. Any of these is fatal to the
/// connection that produced the message, never to the process.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("read past end of message")]
    EndOfMessage(#[from] EndOfMessage),
    #[error("illegible server message: unknown command {0}")]
    BadCommand(u8),
    #[error("illegal command {cmd} while {state}")]
    IllegalCommand { cmd: &'static str, state: &'static str },
    #[error("bad entity number {0}")]
    BadEntityNumber(i32),
    #[error("configstring index {0} out of range")]
    BadConfigStringIndex(i32),
    #[error("Server returned version {server}, not {client}")]
    VersionMismatch { server: i32, client: i32 },
    #[error("{0}")]
    BadMessage(String),
    #[error("outgoing message overflow")]
    Overflow,
}

/// Why a connection ended. Every drop is reported with one of these and
/// goes through the same teardown.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DropReason {
    #[error("{0}")]
    Protocol(#[from] ProtocolError),
    #[error("Server disconnected")]
    ServerDisconnected,
    #[error("Server connection timed out.")]
    TimedOut,
    #[error("Connection refused: {0}")]
    Rejected(String),
    #[error("disconnected")]
    UserDisconnect,
    #[error("Bad server address {0}")]
    BadServerAddress(String),
    #[error("reliable message overflowed")]
    Overflow,
}

impl From<EndOfMessage> for DropReason {
    fn from(e: EndOfMessage) -> Self {
        DropReason::Protocol(e.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages() {
        let err = ProtocolError::VersionMismatch { server: 34, client: 1 };
        assert_eq!(err.to_string(), "Server returned version 34, not 1");

        let reason: DropReason = ProtocolError::from(EndOfMessage).into();
        assert_eq!(reason, DropReason::Protocol(ProtocolError::EndOfMessage(EndOfMessage)));
        assert_eq!(reason.to_string(), "read past end of message");
    }
}
