//! User accounts.

mod models;
mod repository;
mod service;

pub use models::{User, UserInfo, normalize_email};
pub use repository::{FailedLogin, UserRepository};
pub use service::{LockoutPolicy, UserService};
