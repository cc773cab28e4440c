pub mod connection;
pub mod dispatcher;
pub mod registry;
pub mod rooms;
pub mod store;

pub use dispatcher::Dispatcher;
pub use registry::ConnectionRegistry;
pub use rooms::RoomIndex;
