//! Maps `sqlx` failures onto the engine's own error taxonomy so callers of
//! `Storage` never see a `sqlx` type.

use durably_core::DurablyError;

pub fn map_sqlx_error(err: sqlx::Error) -> DurablyError {
    DurablyError::storage(err.to_string())
}
