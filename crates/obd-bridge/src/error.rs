//! Bridge error types

use elm_link::LinkError;
use obd_session::SessionError;
use svip_wire::WireError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Wire error: {0}")]
    Wire(#[from] WireError),

    #[error("Link error: {0}")]
    Link(#[from] LinkError),

    #[error("Consumer channel closed")]
    ChannelClosed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
