//! Identifier generation for sessions and PTYs.

use uuid::Uuid;

/// Source of unique identifiers.
///
/// Implementations should hand out time-sortable strings. Registries never
/// rely on global uniqueness: a colliding id is detected at insertion and a
/// fresh one is requested.
pub trait IdGenerator: Send + Sync {
    /// Produces a new identifier.
    fn generate(&self) -> String;
}

/// Default generator producing UUIDv7 strings (millisecond timestamp prefix).
#[derive(Debug, Default, Clone, Copy)]
pub struct UuidV7Generator;

impl IdGenerator for UuidV7Generator {
    fn generate(&self) -> String {
        Uuid::now_v7().to_string()
    }
}

/// Number of times a registry asks for a fresh id before giving up.
pub const MAX_ID_ATTEMPTS: usize = 8;
