use thiserror::Error;

/// Error taxonomy shared by every core operation. `NotFound` also covers
/// entities the caller is not allowed to see (unpublished offerings,
/// inactive users).
#[derive(Debug, Error)]
pub enum CoreError {
  #[error("not found: {0}")]
  NotFound(String),
  #[error("bad request: {0}")]
  BadRequest(String),
  #[error("conflict: {0}")]
  Conflict(String),
  #[error(transparent)]
  Internal(#[from] anyhow::Error),
}

pub type CoreResult<T> = Result<T, CoreError>;

impl CoreError {
  pub fn not_found(msg: impl Into<String>) -> Self {
    Self::NotFound(msg.into())
  }

  pub fn bad_request(msg: impl Into<String>) -> Self {
    Self::BadRequest(msg.into())
  }

  pub fn conflict(msg: impl Into<String>) -> Self {
    Self::Conflict(msg.into())
  }

  pub fn is_bad_request(&self) -> bool {
    matches!(self, Self::BadRequest(_))
  }

  pub fn is_not_found(&self) -> bool {
    matches!(self, Self::NotFound(_))
  }
}

impl From<sqlx::Error> for CoreError {
  fn from(err: sqlx::Error) -> Self {
    match &err {
      sqlx::Error::Database(db) if db.is_unique_violation() => CoreError::Conflict(db.message().to_string()),
      _ => CoreError::Internal(anyhow::Error::new(err)),
    }
  }
}
