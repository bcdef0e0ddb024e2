use std::env;

use anyhow::Context;
use anyhow::Result;

pub const DEFAULT_CANCEL_QUOTA: i64 = 3;

#[derive(Debug, Clone)]
pub struct Config {
  pub database_url: String,
  /// Free client cancellations per calendar month before refunds stop.
  pub cancel_quota: i64,
}

impl Config {
  pub fn from_env() -> Result<Self> {
    let database_url = env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
    let cancel_quota = parse_cancel_quota(env::var("CANCEL_QUOTA").ok().as_deref());
    Ok(Self {
      database_url,
      cancel_quota,
    })
  }
}

fn parse_cancel_quota(raw: Option<&str>) -> i64 {
  let Some(raw) = raw else {
    return DEFAULT_CANCEL_QUOTA;
  };
  match raw.trim().parse::<i64>() {
    Ok(value) if value >= 0 => value,
    _ => {
      tracing::warn!(value = raw, "invalid CANCEL_QUOTA, using default");
      DEFAULT_CANCEL_QUOTA
    },
  }
}
