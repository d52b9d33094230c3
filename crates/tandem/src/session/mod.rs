//! Session management module.
//!
//! Sessions are the unit of conversation between users and agents. The
//! event stream core only consults them for existence and closed-status
//! checks; everything else here is ordinary lifecycle CRUD.

mod models;
mod repository;

pub use models::{CreateSessionRequest, Session, SessionStatus};
pub use repository::SessionRepository;
