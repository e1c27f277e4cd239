//! Identity services shared by the HTTP layer.
//!
//! - [`oauth`] - provider registry and the authorization-code handshake
//! - [`federation`] - external identity to local account mapping
//! - [`ticket`] - signed authentication tickets with sliding renewal
//! - [`session`] - idle-timeout session state
//! - [`session_sweeper`] - background eviction of idle sessions
//! - [`password`] - local credential hashing

pub mod federation;
pub mod oauth;
pub mod password;
pub mod session;
pub mod session_sweeper;
pub mod ticket;
