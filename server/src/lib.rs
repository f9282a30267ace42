pub mod config;
pub mod lobby;
pub mod net;
pub mod protocol;
pub mod rooms;
