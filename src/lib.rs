#[macro_use]
extern crate futures;

// modules are ordered leaf-first, the session at the bottom
// ties them together
pub mod response;
pub mod message;
mod mime;
pub mod auth;
pub mod events;
pub mod io;
mod session;
#[cfg(any(test, feature = "mock-support"))]
pub mod mock;

pub use self::auth::{AuthKind, AuthSet};
pub use self::events::{Event, EventLog, FailureCode, MessageId, SessionHandler};
pub use self::message::{Attachment, Message, RecipientKind};
pub use self::response::Response;
pub use self::session::{ClientId, Driving, Extensions, Session, SessionState};
