pub mod config;
pub mod constants;
pub mod download;
pub mod engine;
pub mod error;
pub mod export;
pub mod fetch;
pub mod fs_utils;
pub mod logging;
pub mod manifest;
pub mod pipeline;
pub mod reference;
