pub mod cache;
pub mod config;
pub mod error;
pub mod extractor;
pub mod format;
pub mod http;
pub mod index;
pub mod service;
pub mod sweeper;
pub mod ytdlp;
