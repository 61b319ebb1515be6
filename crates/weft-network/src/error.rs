use thiserror::Error;

use crate::{frame::FrameError, tcp::ConnId};

#[derive(Error, Debug)]
pub enum NetError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
    #[error("unknown connection {0:?}")]
    UnknownConnection(ConnId),
    #[error("connection is closed")]
    Closed,
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
