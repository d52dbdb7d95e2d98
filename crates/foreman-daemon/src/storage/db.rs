//! Database connection and initialization.

pub use foreman_core::db::DatabaseError;

foreman_core::define_database!(Database, "Database migrations complete");
