// Range-streaming bridge: HTTP endpoint, request correlation and the chunk controller.

pub mod bridge;
pub mod controller;
pub mod handler;
pub mod protocol;
