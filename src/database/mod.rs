//! Payment ledger storage

pub mod error;
pub mod memory_ledger;
pub mod repository;

#[cfg(feature = "database")]
pub mod postgres_ledger;

pub use error::{DatabaseError, DatabaseResult};
pub use memory_ledger::InMemoryLedger;
pub use repository::{CommitOutcome, PaymentLedger, RefundChange, Transition};

#[cfg(feature = "database")]
pub use postgres_ledger::{PgLedger, PoolConfig};
