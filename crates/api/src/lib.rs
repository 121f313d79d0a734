//! HTTP surface of the security layer: session cookies, the access guard and
//! the security administration routes.

pub mod app;
pub mod authz;
pub mod context;
pub mod middleware;
