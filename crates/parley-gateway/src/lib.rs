pub mod connection;
pub mod identity;
pub mod registry;
pub mod router;
