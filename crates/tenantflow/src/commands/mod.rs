pub mod diff;
pub mod resource;
pub mod validate;
