pub mod chat;
pub mod error;
pub mod events;
pub mod models;
pub mod providers;

pub use error::{ConfigInvalid, ErrorReason, ServiceError, ServiceErrorCode};
