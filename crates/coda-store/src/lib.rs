//! Durable SQLite storage for conversations, messages, settings, secrets,
//! and prompt history.
//!
//! The blocking engine work lives in [`db`]; the async [`Store`] facade runs
//! it on `spawn_blocking` and layers read caches on top. Engine lock
//! contention is absorbed by a bounded jittered retry; a connection that was
//! closed out from under a caller is reopened transparently, while a store
//! that was shut down deliberately rejects further work with
//! [`StoreError::Closed`].

mod cipher;
mod db;
mod error;
mod store;

pub use cipher::SecretCipher;
pub use error::StoreError;
pub use store::{Conversation, Store, StoredMessage};
