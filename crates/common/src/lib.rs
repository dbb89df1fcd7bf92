// tandem-common: shared wire and domain types for tandem participants

pub mod activity;
pub mod filelist;
pub mod path;
pub mod protocol;
pub mod types;
