pub mod negotiation;
pub mod packet;
pub mod version;
