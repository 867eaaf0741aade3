//! Durable storage for saga transactions and the transactional outbox/inbox.
//!
//! The saga table is the sole source of truth for recovery; every checkpoint
//! is a conditional write gated on the row's [`Version`]. Outbox and inbox
//! writes go through a [`UnitOfWork`] so they commit atomically with the
//! business change they belong to.

pub mod error;
pub mod inbox;
pub mod memory;
pub mod outbox;
pub mod postgres;
pub mod saga;
pub mod store;
pub mod version;

pub use common::{OutboxStatus, SagaId, SagaStatus};
pub use error::{Result, StoreError};
pub use inbox::InboxRecord;
pub use memory::{InMemoryStore, MemoryUnitOfWork};
pub use outbox::{NewOutboxRecord, OutboxRecord};
pub use postgres::{PgUnitOfWork, PostgresStore};
pub use saga::SagaTransaction;
pub use store::{InboxStore, OutboxStore, SagaRepository, TransactionalStore, UnitOfWork};
pub use version::Version;
