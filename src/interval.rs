//! Pure interval algebra over half-open `[start, end)` ranges.

use chrono::Duration;

use crate::models::TimeRange;

pub fn overlaps(a: &TimeRange, b: &TimeRange) -> bool {
  a.end > b.start && a.start < b.end
}

/// Subtracts one busy range from one free range. Returns zero, one, or
/// two remainders depending on whether the busy range consumes, truncates,
/// or splits the free range.
pub fn subtract(free: &TimeRange, busy: &TimeRange) -> Vec<TimeRange> {
  let mut remaining = Vec::with_capacity(2);
  if free.start < busy.start {
    remaining.push(TimeRange::new(free.start, free.end.min(busy.start)));
  }
  if free.end > busy.end {
    remaining.push(TimeRange::new(free.start.max(busy.end), free.end));
  }
  remaining
}

/// Subtracts every busy range in sequence. Each busy range is applied to
/// the current remainder list, not the original free range.
pub fn subtract_all(free: TimeRange, busy: &[TimeRange]) -> Vec<TimeRange> {
  let mut remaining = vec![free];
  for b in busy {
    let mut next = Vec::new();
    for r in &remaining {
      next.extend(subtract(r, b));
    }
    remaining = next;
  }
  remaining
}

/// Cuts a free range into `duration`-sized slots separated by `gap`,
/// starting at the range's start. A slot is emitted only if it fits
/// entirely inside the range.
pub fn slice(free: &TimeRange, duration: Duration, gap: Duration) -> Vec<TimeRange> {
  let mut slots = Vec::new();
  if duration <= Duration::zero() {
    return slots;
  }
  let mut start = free.start;
  loop {
    let end = start + duration;
    if end > free.end {
      break;
    }
    slots.push(TimeRange::new(start, end));
    start = end + gap;
  }
  slots
}

#[cfg(test)]
mod tests {
  use chrono::DateTime;
  use chrono::Duration;
  use chrono::Utc;

  use super::slice;
  use super::subtract;
  use super::subtract_all;

  fn at(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).expect("valid timestamp")
  }

  fn range(start: i64, end: i64) -> crate::models::TimeRange {
    crate::models::TimeRange::new(at(start), at(end))
  }

  #[test]
  fn busy_splits_free_range_in_two() {
    let out = subtract(&range(0, 100), &range(30, 50));
    assert_eq!(out, vec![range(0, 30), range(50, 100)]);
  }

  #[test]
  fn busy_consumes_free_range() {
    let out = subtract(&range(0, 100), &range(-10, 200));
    assert!(out.is_empty());
  }

  #[test]
  fn disjoint_busy_leaves_free_range_unchanged() {
    assert_eq!(subtract(&range(0, 100), &range(200, 300)), vec![range(0, 100)]);
    assert_eq!(subtract(&range(0, 100), &range(-20, -10)), vec![range(0, 100)]);
  }

  #[test]
  fn busy_truncates_one_side() {
    assert_eq!(subtract(&range(0, 100), &range(-10, 40)), vec![range(40, 100)]);
    assert_eq!(subtract(&range(0, 100), &range(60, 120)), vec![range(0, 60)]);
  }

  #[test]
  fn subtract_all_applies_each_busy_to_current_remainders() {
    let busy = [range(30, 50), range(10, 20), range(90, 95)];
    let out = subtract_all(range(0, 100), &busy);
    assert_eq!(out, vec![range(0, 10), range(20, 30), range(50, 90), range(95, 100)]);
  }

  #[test]
  fn subtract_all_order_does_not_change_result() {
    let forward = subtract_all(range(0, 100), &[range(30, 50), range(40, 70)]);
    let backward = subtract_all(range(0, 100), &[range(40, 70), range(30, 50)]);
    assert_eq!(forward, backward);
    assert_eq!(forward, vec![range(0, 30), range(70, 100)]);
  }

  #[test]
  fn slice_emits_fixed_slots_with_gap() {
    let out = slice(&range(0, 25), Duration::seconds(10), Duration::seconds(2));
    assert_eq!(out, vec![range(0, 10), range(12, 22)]);
  }

  #[test]
  fn slice_too_short_range_yields_nothing() {
    assert!(slice(&range(0, 5), Duration::seconds(10), Duration::zero()).is_empty());
  }
}
