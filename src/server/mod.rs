// HTTP surface: routing, request validation and error-to-status mapping.

pub mod handler;
pub mod request;
