//! Authentication of realtime connections

pub mod authenticator;

pub use authenticator::{Authenticator, MockAuthenticator, StaticTokenAuthenticator};
