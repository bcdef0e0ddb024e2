//! Maintenance of a seer's weekly schedule and day-offs.

use chrono::NaiveDate;
use chrono::NaiveTime;

use crate::error::CoreError;
use crate::error::CoreResult;
use crate::store::Store;

/// A schedule interval must run forward in civil time; an end of 00:00
/// is the midnight sentinel and always valid.
fn validate_times(start: NaiveTime, end: NaiveTime) -> CoreResult<()> {
  if end != NaiveTime::MIN && start >= end {
    return Err(CoreError::bad_request("start time must be before end time"));
  }
  Ok(())
}

async fn require_seer<S: Store>(store: &S, seer_id: i64) -> CoreResult<()> {
  store
    .seer_profile(seer_id)
    .await?
    .map(|_| ())
    .ok_or_else(|| CoreError::not_found("seer not found"))
}

pub async fn add_schedule<S: Store>(
  store: &S,
  seer_id: i64,
  day: u8,
  start: NaiveTime,
  end: NaiveTime,
) -> CoreResult<i64> {
  if day > 6 {
    return Err(CoreError::bad_request("day must be between 0 and 6"));
  }
  validate_times(start, end)?;
  require_seer(store, seer_id).await?;
  store.insert_schedule(seer_id, day, start, end).await
}

pub async fn update_schedule<S: Store>(
  store: &S,
  seer_id: i64,
  schedule_id: i64,
  start: NaiveTime,
  end: NaiveTime,
) -> CoreResult<()> {
  validate_times(start, end)?;
  if !store.update_schedule(seer_id, schedule_id, start, end).await? {
    return Err(CoreError::not_found("schedule not found"));
  }
  Ok(())
}

pub async fn remove_schedule<S: Store>(store: &S, seer_id: i64, schedule_id: i64) -> CoreResult<()> {
  if !store.delete_schedule(seer_id, schedule_id).await? {
    return Err(CoreError::not_found("schedule not found"));
  }
  Ok(())
}

/// Idempotent: marking the same date twice is fine.
pub async fn add_day_off<S: Store>(store: &S, seer_id: i64, date: NaiveDate) -> CoreResult<()> {
  require_seer(store, seer_id).await?;
  store.add_day_off(seer_id, date).await
}

pub async fn remove_day_off<S: Store>(store: &S, seer_id: i64, date: NaiveDate) -> CoreResult<()> {
  if !store.delete_day_off(seer_id, date).await? {
    return Err(CoreError::not_found("day off not found"));
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use chrono::NaiveDate;
  use chrono::NaiveTime;

  use super::add_day_off;
  use super::add_schedule;
  use super::remove_day_off;
  use super::update_schedule;
  use crate::error::CoreError;
  use crate::store::MemStore;
  use crate::store::Store;

  fn t(h: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(h, 0, 0).expect("valid time")
  }

  #[tokio::test]
  async fn duplicate_schedule_is_a_conflict() {
    let store = MemStore::new();
    let seer = store.add_seer(0);
    add_schedule(&store, seer, 0, t(9), t(17)).await.expect("first insert");
    let err = add_schedule(&store, seer, 0, t(9), t(17)).await.expect_err("duplicate");
    assert!(matches!(err, CoreError::Conflict(_)));
  }

  #[tokio::test]
  async fn inverted_times_are_rejected_but_midnight_end_is_allowed() {
    let store = MemStore::new();
    let seer = store.add_seer(0);
    assert!(add_schedule(&store, seer, 0, t(17), t(9)).await.is_err());
    add_schedule(&store, seer, 0, t(22), t(0)).await.expect("midnight sentinel");
  }

  #[tokio::test]
  async fn day_off_insert_is_idempotent() {
    let store = MemStore::new();
    let seer = store.add_seer(0);
    let date = NaiveDate::from_ymd_opt(2026, 9, 7).expect("valid date");
    add_day_off(&store, seer, date).await.expect("first");
    add_day_off(&store, seer, date).await.expect("second");
    assert_eq!(store.day_offs(seer, date, date).await.expect("day offs"), vec![date]);

    remove_day_off(&store, seer, date).await.expect("remove");
    assert!(remove_day_off(&store, seer, date).await.is_err());
  }

  #[tokio::test]
  async fn updating_missing_schedule_is_not_found() {
    let store = MemStore::new();
    let seer = store.add_seer(0);
    let err = update_schedule(&store, seer, 42, t(9), t(17)).await.expect_err("missing");
    assert!(err.is_not_found());
  }
}
