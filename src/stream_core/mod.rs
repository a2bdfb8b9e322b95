pub mod connection;
pub mod error_handler;
pub mod stomp;
pub mod transport;

pub use connection::{ConnectionState, StreamConnection, StreamHandler, StreamSettings};
pub use error_handler::{ExponentialBackoff, ReconnectPolicy};
pub use stomp::{Command, Frame, FrameError};
pub use transport::{ConnectionError, Connector, Transport, WebSocketConnector};
