// Host-facing API: the engine facade and process setup.

pub mod engine_api;
pub mod simple;
