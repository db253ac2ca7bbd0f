pub mod network;
pub mod service;
pub mod utils;

pub use network::{
    Connection, ConnectionHandler, ConnectionOwner, ConnectionState, DefaultProtocol,
    FrameProtocol, LengthPrefixProtocol, MessageHeader, PendingConnection, WireMessage,
};
pub use service::{
    setup_local_tracing, setup_tracing, AppConfig, AppError, AppResult, NetworkConfig,
};
pub use utils::{current_system_time, CrossThreadQueue};
