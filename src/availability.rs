//! Turns a seer's weekly schedule, day-offs, and existing commitments
//! into concrete bookable slots for a given offering duration.
//!
//! Weekly schedules and day-offs live in the seer's fixed civil time
//! zone (UTC+7); everything else is UTC.

use std::collections::HashSet;

use chrono::DateTime;
use chrono::Datelike;
use chrono::Duration;
use chrono::NaiveDate;
use chrono::NaiveTime;
use chrono::TimeZone;
use chrono::Utc;

use crate::error::CoreError;
use crate::error::CoreResult;
use crate::interval;
use crate::models::SeerProfile;
use crate::models::TimeRange;
use crate::models::WeeklySchedule;
use crate::store::Store;

/// The marketplace operates in UTC+7 civil time.
pub const BUSINESS_TZ_OFFSET_SECS: i64 = 7 * 3600;

/// Converts a civil date + time to the UTC instant it names.
pub fn civil_to_utc(date: NaiveDate, time: NaiveTime) -> DateTime<Utc> {
  Utc.from_utc_datetime(&(date.and_time(time) - Duration::seconds(BUSINESS_TZ_OFFSET_SECS)))
}

/// The civil date a UTC instant falls on.
pub fn utc_to_civil_date(at: DateTime<Utc>) -> NaiveDate {
  (at + Duration::seconds(BUSINESS_TZ_OFFSET_SECS)).date_naive()
}

fn start_secs(t: NaiveTime) -> i64 {
  use chrono::Timelike;
  t.num_seconds_from_midnight() as i64
}

/// End-of-interval seconds, honouring the midnight sentinel: an end time
/// of 00:00 means the following midnight, not the same instant as 00:00.
fn end_secs(t: NaiveTime) -> i64 {
  if t == NaiveTime::MIN { 86_400 } else { start_secs(t) }
}

/// Merges one seer's schedule rows into at most seven lists of
/// non-overlapping `(start, end)` pairs, one per weekday. Rows that touch
/// or overlap are concatenated.
pub fn merge_schedules(rows: &[WeeklySchedule]) -> [Vec<(NaiveTime, NaiveTime)>; 7] {
  let mut by_day: [Vec<(NaiveTime, NaiveTime)>; 7] = Default::default();
  let mut sorted: Vec<&WeeklySchedule> = rows.iter().filter(|r| r.day < 7).collect();
  sorted.sort_by_key(|r| (r.day, start_secs(r.start_time)));
  for row in sorted {
    let ranges = &mut by_day[row.day as usize];
    match ranges.last_mut() {
      Some(last) if end_secs(last.1) >= start_secs(row.start_time) => {
        if end_secs(row.end_time) > end_secs(last.1) {
          last.1 = row.end_time;
        }
      },
      _ => ranges.push((row.start_time, row.end_time)),
    }
  }
  by_day
}

/// Maps merged weekly intervals onto every calendar date in
/// `[from, to]` that is not a day off, producing concrete UTC ranges.
pub fn expand_free_ranges(
  merged: &[Vec<(NaiveTime, NaiveTime)>; 7],
  day_offs: &HashSet<NaiveDate>,
  from: NaiveDate,
  to: NaiveDate,
) -> Vec<TimeRange> {
  let mut ranges = Vec::new();
  let mut date = from;
  while date <= to {
    if !day_offs.contains(&date) {
      for (start, end) in &merged[date.weekday().num_days_from_monday() as usize] {
        let start_dt = civil_to_utc(date, *start);
        let end_dt = if *end == NaiveTime::MIN {
          match date.succ_opt() {
            Some(next) => civil_to_utc(next, NaiveTime::MIN),
            None => break,
          }
        } else {
          civil_to_utc(date, *end)
        };
        ranges.push(TimeRange::new(start_dt, end_dt));
      }
    }
    match date.succ_opt() {
      Some(next) => date = next,
      None => break,
    }
  }
  ranges
}

/// The full pipeline over pure inputs: expand, subtract busy ranges,
/// slice by duration + break, drop slots that do not start strictly in
/// the future.
#[allow(clippy::too_many_arguments)]
pub fn free_slots(
  merged: &[Vec<(NaiveTime, NaiveTime)>; 7],
  day_offs: &HashSet<NaiveDate>,
  busy: &[TimeRange],
  duration: Duration,
  gap: Duration,
  from: NaiveDate,
  to: NaiveDate,
  now: DateTime<Utc>,
) -> Vec<TimeRange> {
  let mut slots = Vec::new();
  for free in expand_free_ranges(merged, day_offs, from, to) {
    for remainder in interval::subtract_all(free, busy) {
      slots.extend(interval::slice(&remainder, duration, gap));
    }
  }
  slots.retain(|s| s.start > now);
  slots
}

/// Store-backed slot computation for an arbitrary duration. Used by the
/// public `get_free_slots` and re-run by the booking coordinator at
/// write time.
pub(crate) async fn slots_for_duration<S: Store>(
  store: &S,
  seer: &SeerProfile,
  duration: Duration,
  from: NaiveDate,
  to: NaiveDate,
  now: DateTime<Utc>,
) -> CoreResult<Vec<TimeRange>> {
  let merged = merge_schedules(&store.weekly_schedules(seer.id).await?);
  let day_offs: HashSet<NaiveDate> = store.day_offs(seer.id, from, to).await?.into_iter().collect();
  let window_start = civil_to_utc(from, NaiveTime::MIN);
  let window_end = match to.succ_opt() {
    Some(next) => civil_to_utc(next, NaiveTime::MIN),
    None => return Ok(Vec::new()),
  };
  let busy = store.busy_ranges(seer.id, window_start, window_end, now).await?;
  Ok(free_slots(
    &merged,
    &day_offs,
    &busy,
    duration,
    Duration::seconds(seer.break_secs),
    from,
    to,
    now,
  ))
}

/// Concrete bookable slots for one offering over a civil date range
/// (inclusive on both ends). A booking is valid iff its exact
/// `(start, end)` pair appears in this output.
pub async fn get_free_slots<S: Store>(
  store: &S,
  seer_id: i64,
  offering_id: i64,
  date_from: NaiveDate,
  date_to: NaiveDate,
) -> CoreResult<Vec<TimeRange>> {
  if date_from > date_to {
    return Err(CoreError::bad_request("date range is inverted"));
  }
  let seer = store
    .seer_profile(seer_id)
    .await?
    .ok_or_else(|| CoreError::not_found("seer not found"))?;
  let offering = store
    .offering(seer_id, offering_id)
    .await?
    .ok_or_else(|| CoreError::not_found("offering not found"))?;
  slots_for_duration(
    store,
    &seer,
    Duration::seconds(offering.duration_secs),
    date_from,
    date_to,
    Utc::now(),
  )
  .await
}

#[cfg(test)]
mod tests {
  use std::collections::HashSet;

  use chrono::Duration;
  use chrono::NaiveDate;
  use chrono::NaiveTime;

  use super::civil_to_utc;
  use super::expand_free_ranges;
  use super::free_slots;
  use super::merge_schedules;
  use super::utc_to_civil_date;
  use crate::models::TimeRange;
  use crate::models::WeeklySchedule;

  fn t(h: u32, m: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(h, m, 0).expect("valid time")
  }

  fn schedule(day: u8, start: NaiveTime, end: NaiveTime) -> WeeklySchedule {
    WeeklySchedule {
      id: 0,
      seer_id: 1,
      day,
      start_time: start,
      end_time: end,
    }
  }

  // 2026-09-07 is a Monday.
  fn monday() -> NaiveDate {
    NaiveDate::from_ymd_opt(2026, 9, 7).expect("valid date")
  }

  #[test]
  fn civil_conversion_round_trips() {
    let at = civil_to_utc(monday(), t(9, 0));
    assert_eq!(utc_to_civil_date(at), monday());
    assert_eq!(at.to_rfc3339(), "2026-09-07T02:00:00+00:00");
  }

  #[test]
  fn merge_concatenates_adjacent_and_overlapping_rows() {
    let rows = vec![
      schedule(0, t(13, 0), t(15, 0)),
      schedule(0, t(9, 0), t(11, 0)),
      schedule(0, t(11, 0), t(12, 0)),
      schedule(2, t(10, 0), t(18, 0)),
    ];
    let merged = merge_schedules(&rows);
    assert_eq!(merged[0], vec![(t(9, 0), t(12, 0)), (t(13, 0), t(15, 0))]);
    assert_eq!(merged[2], vec![(t(10, 0), t(18, 0))]);
    assert!(merged[1].is_empty());
  }

  #[test]
  fn merge_keeps_widest_end_when_contained() {
    let rows = vec![schedule(0, t(9, 0), t(17, 0)), schedule(0, t(10, 0), t(11, 0))];
    let merged = merge_schedules(&rows);
    assert_eq!(merged[0], vec![(t(9, 0), t(17, 0))]);
  }

  #[test]
  fn midnight_end_spans_into_next_day() {
    let rows = vec![schedule(0, t(22, 0), t(0, 0))];
    let merged = merge_schedules(&rows);
    let ranges = expand_free_ranges(&merged, &HashSet::new(), monday(), monday());
    assert_eq!(ranges.len(), 1);
    assert_eq!(ranges[0].start, civil_to_utc(monday(), t(22, 0)));
    let tuesday = monday().succ_opt().expect("valid date");
    assert_eq!(ranges[0].end, civil_to_utc(tuesday, t(0, 0)));
  }

  #[test]
  fn day_off_removes_whole_date() {
    let rows = vec![schedule(0, t(9, 0), t(17, 0))];
    let merged = merge_schedules(&rows);
    let day_offs: HashSet<NaiveDate> = [monday()].into_iter().collect();
    assert!(expand_free_ranges(&merged, &day_offs, monday(), monday()).is_empty());
  }

  #[test]
  fn booked_hour_is_excluded_from_slots() {
    let merged = merge_schedules(&[schedule(0, t(9, 0), t(17, 0))]);
    let busy = vec![TimeRange::new(
      civil_to_utc(monday(), t(10, 0)),
      civil_to_utc(monday(), t(11, 0)),
    )];
    let now = civil_to_utc(monday(), t(0, 0));
    let slots = free_slots(
      &merged,
      &HashSet::new(),
      &busy,
      Duration::hours(1),
      Duration::zero(),
      monday(),
      monday(),
      now,
    );
    let starts: Vec<_> = slots.iter().map(|s| s.start).collect();
    let expected: Vec<_> = [9, 11, 12, 13, 14, 15, 16]
      .iter()
      .map(|h| civil_to_utc(monday(), t(*h, 0)))
      .collect();
    assert_eq!(starts, expected);
  }

  #[test]
  fn slot_starting_at_now_is_dropped() {
    let merged = merge_schedules(&[schedule(0, t(9, 0), t(11, 0))]);
    let now = civil_to_utc(monday(), t(9, 0));
    let slots = free_slots(
      &merged,
      &HashSet::new(),
      &[],
      Duration::hours(1),
      Duration::zero(),
      monday(),
      monday(),
      now,
    );
    assert_eq!(slots.len(), 1);
    assert_eq!(slots[0].start, civil_to_utc(monday(), t(10, 0)));
  }

  #[test]
  fn duration_longer_than_remainder_yields_no_slots() {
    let merged = merge_schedules(&[schedule(0, t(9, 0), t(10, 0))]);
    let now = civil_to_utc(monday(), t(0, 0));
    let slots = free_slots(
      &merged,
      &HashSet::new(),
      &[],
      Duration::hours(2),
      Duration::zero(),
      monday(),
      monday(),
      now,
    );
    assert!(slots.is_empty());
  }

  #[test]
  fn break_duration_spaces_out_slots() {
    let merged = merge_schedules(&[schedule(0, t(9, 0), t(12, 0))]);
    let now = civil_to_utc(monday(), t(0, 0));
    let slots = free_slots(
      &merged,
      &HashSet::new(),
      &[],
      Duration::hours(1),
      Duration::minutes(30),
      monday(),
      monday(),
      now,
    );
    let starts: Vec<_> = slots.iter().map(|s| s.start).collect();
    assert_eq!(starts, vec![civil_to_utc(monday(), t(9, 0)), civil_to_utc(monday(), t(10, 30))]);
  }
}
