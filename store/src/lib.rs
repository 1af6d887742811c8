//! Per-user notification state store.
//!
//! Records items sent to a user, tracks which of them were dismissed, answers
//! "what is visible as of time T on device D", replays the message log for
//! catch-up sync, and leases reminder work to pollers.
//!
//! Two engines implement [`StateMachine`]:
//! - [`MemEngine`]: ephemeral reference engine, one lock for the whole store.
//! - `SqlEngine` (feature `sqlite`): durable engine over SQLite with a
//!   pluggable time encoding.

pub mod clock;
pub mod dismissal;
pub mod error;
pub mod factory;
pub mod snapshot;
pub mod store;
pub mod types;
pub mod values;

pub use clock::Clock;
pub use clock::FakeClock;
pub use clock::SystemClock;
pub use error::Result;
pub use error::StoreError;
pub use store::StateMachine;
pub use store::memory::MemEngine;
#[cfg(feature = "sqlite")]
pub use store::sqlite::SqlConfig;
#[cfg(feature = "sqlite")]
pub use store::sqlite::SqlEngine;
pub use types::*;
pub use values::OpaqueValues;
pub use values::ValueFactory;
