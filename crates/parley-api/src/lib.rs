pub mod auth;
pub mod conversations;
pub mod error;
pub mod middleware;
pub mod users;
