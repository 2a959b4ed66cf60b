// upscale-proxy: fetch, upscale and cache images at a requested resolution.

pub mod config;
pub mod engine;
pub mod error;
pub mod server;
pub mod source;
