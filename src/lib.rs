pub mod analyzer;
pub mod config;
pub mod extract;
pub mod layout;
pub mod log_parser;
pub mod module;
pub mod report;
pub mod runner;
pub mod summary;
pub mod tree;
