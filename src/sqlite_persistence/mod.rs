mod versioned_schema;

pub use versioned_schema::*;

/// Offset added to every schema version stored in `PRAGMA user_version`, so
/// databases created by this program can be told apart from foreign files.
pub const BASE_DB_VERSION: usize = 99999;
