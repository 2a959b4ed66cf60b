// Cache and transform engine: key derivation, the artifact store, external
// tools and the resolve pipeline on top of them.

pub mod flight;
pub mod key;
pub mod pipeline;
pub mod stats;
pub mod store;
pub mod transform;
