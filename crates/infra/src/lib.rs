//! Infrastructure layer: persistence, authentication providers and the
//! security services built on top of them.

pub mod converge;
pub mod evaluator;
pub mod mailer;
pub mod manager;
pub mod providers;
pub mod registration;
pub mod registry;
pub mod rotation;
pub mod security_views;
pub mod session;
pub mod store;

pub use evaluator::Evaluator;
pub use manager::{SecurityManager, SecurityManagerBuilder};
pub use registry::{PermissionRegistry, RegistryReport};
pub use session::{InMemorySessionStore, Session, SessionStore};
