//! Collaborator interfaces consumed by the recovery engine, with the stock
//! implementations the daemon uses.

pub mod bouncer;
pub mod favorites;
pub mod store;
pub mod transport;

pub use bouncer::{BouncerProvider, BouncerRegistry, NoBouncer};
pub use favorites::{FavoritesProvider, NoFavorites, StaticFavorites};
pub use store::{FileStore, MemoryStore, Store};
pub use transport::{ConnectionPool, Transport};
