pub mod attempts;
pub mod errors;
pub mod events;
pub mod models;
pub mod summary;
pub mod templates;
