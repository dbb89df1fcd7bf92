pub mod normalize;

pub use normalize::{
    canonical_component, normalize_entry, normalize_path, parent_entry, PathError,
};
