//! Client side of the Parley message-delivery core: a resilient session over
//! the WebSocket gateway, the REST client used for pull-resync, and the
//! reconciler that merges optimistic sends with server data.

pub mod backoff;
pub mod config;
pub mod error;
pub mod machine;
pub mod reconciler;
pub mod rest;
pub mod session;

pub use config::ClientConfig;
pub use error::ClientError;
pub use machine::ConnectionState;
pub use reconciler::{DisplayedMessage, EntryId, OptimisticReconciler, Slot};
pub use rest::RestClient;
pub use session::{SessionEvent, SessionHandle, SessionManager};
