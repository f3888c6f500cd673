use thiserror::Error;

#[derive(Error, Debug)]
pub enum KeelError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt blob: {reason}")]
    Corrupt { reason: String },

    #[error("channel disconnected: {0}")]
    ChannelClosed(&'static str),

    #[error("peer {0} unreachable")]
    PeerUnreachable(usize),

    #[error("request timed out")]
    Timeout,

    #[error("not the leader")]
    NotLeader,
}

pub type Result<T> = std::result::Result<T, KeelError>;
