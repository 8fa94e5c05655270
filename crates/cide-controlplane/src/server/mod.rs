//! Client-facing transport

mod gateway;
mod socket;

pub use gateway::{authorize_terminal, Gateway, WsQuery};
pub use socket::{run_session, run_terminal, WsFrameSink, WsFrameSource};
