pub mod broadcast;
pub mod connection;
pub mod packet;
pub mod registry;
pub mod session;
