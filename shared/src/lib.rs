pub mod protocol;
pub mod types;
pub mod version;
