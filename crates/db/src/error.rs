use srtcast_core::types::EntityId;

/// Errors surfaced by a [`Store`](crate::store::Store) implementation.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: EntityId },

    #[error("Conflict: {0}")]
    Conflict(String),
}

impl StoreError {
    pub fn not_found(entity: &'static str, id: EntityId) -> Self {
        StoreError::NotFound { entity, id }
    }

    /// Map a sqlx error, turning unique-constraint violations into
    /// [`StoreError::Conflict`].
    pub fn from_sqlx(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &err {
            if db_err.is_unique_violation() {
                let constraint = db_err.constraint().unwrap_or("unique constraint");
                return StoreError::Conflict(format!("violates {constraint}"));
            }
        }
        StoreError::Database(err)
    }
}
