//! Admin database handle.

pub use relaygate_core::db::DatabaseError;

relaygate_core::define_database!(
    AdminDatabase,
    "./migrations/admin",
    "Admin database migrations complete"
);
