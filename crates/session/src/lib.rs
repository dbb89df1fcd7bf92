// tandem-session: negotiation, activity dispatch and session lifecycle.

pub mod activity;
pub mod config;
pub mod lifecycle;
pub mod manager;
pub mod negotiation;
pub mod resources;
pub mod session;
pub mod snapshot;
pub mod transport;
