pub mod auth;
pub mod fetch;
pub mod lifecycle;
pub mod resolver;
pub mod temp_files;
