// Collaborator boundaries: the storage network SDK, shard transport, and trash client.

pub mod http_source;
pub mod traits;
