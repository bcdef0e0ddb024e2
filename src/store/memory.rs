//! In-memory store with the same conditional-update semantics as the
//! Postgres backend. Backs the unit tests and doubles as a lightweight
//! fake for embedding applications.

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Mutex;
use std::sync::MutexGuard;

use async_trait::async_trait;
use chrono::DateTime;
use chrono::NaiveDate;
use chrono::NaiveTime;
use chrono::Utc;

use crate::error::CoreError;
use crate::error::CoreResult;
use crate::interval;
use crate::models::ApmtStatus;
use crate::models::Appointment;
use crate::models::Auction;
use crate::models::AuctionSpec;
use crate::models::Bid;
use crate::models::BidPlacement;
use crate::models::NewAppointment;
use crate::models::Offering;
use crate::models::SeerProfile;
use crate::models::TimeRange;
use crate::models::Transaction;
use crate::models::TxnStatus;
use crate::models::TxnType;
use crate::models::WeeklySchedule;
use crate::store::Store;

#[derive(Debug, Clone)]
struct UserRec {
  coins: i64,
  is_active: bool,
}

#[derive(Debug, Default)]
struct Inner {
  next_id: i64,
  users: HashMap<i64, UserRec>,
  seers: HashMap<i64, SeerProfile>,
  schedules: Vec<WeeklySchedule>,
  day_offs: HashSet<(i64, NaiveDate)>,
  offerings: HashMap<i64, Offering>,
  appointments: HashMap<i64, Appointment>,
  auctions: HashMap<i64, Auction>,
  bids: HashMap<(i64, i64), i64>,
  transactions: Vec<Transaction>,
}

impl Inner {
  fn next_id(&mut self) -> i64 {
    self.next_id += 1;
    self.next_id
  }

  fn seer_busy(&self, seer_id: i64, window: &TimeRange, now: DateTime<Utc>) -> bool {
    let apmt_clash = self
      .appointments
      .values()
      .any(|a| a.seer_id == seer_id && !a.status.is_cancelled() && interval::overlaps(window, &range_of(a)));
    let auction_clash = self.auctions.values().any(|a| {
      a.seer_id == seer_id
        && self.auction_can_still_win(a, now)
        && interval::overlaps(window, &TimeRange::new(a.appoint_start_time, a.appoint_end_time))
    });
    apmt_clash || auction_clash
  }

  /// An auction reserves its appointment window while bidding is open
  /// and, past the deadline, until conclusion has settled the winning
  /// hold.
  fn auction_can_still_win(&self, auction: &Auction, now: DateTime<Utc>) -> bool {
    auction.end_time > now
      || self.transactions.iter().any(|t| {
        t.activity_id == Some(auction.id) && t.txn_type == TxnType::AuctionBid && t.status == TxnStatus::Hold
      })
  }

  fn top_bid(&self, auction_id: i64) -> Option<Bid> {
    self
      .bids
      .iter()
      .filter(|((aid, _), _)| *aid == auction_id)
      .max_by_key(|(_, amount)| **amount)
      .map(|((aid, uid), amount)| Bid {
        auction_id: *aid,
        user_id: *uid,
        amount: *amount,
      })
  }
}

fn range_of(apmt: &Appointment) -> TimeRange {
  TimeRange::new(apmt.start_time, apmt.end_time)
}

#[derive(Debug, Default)]
pub struct MemStore {
  inner: Mutex<Inner>,
}

impl MemStore {
  pub fn new() -> Self {
    Self::default()
  }

  fn lock(&self) -> MutexGuard<'_, Inner> {
    self.inner.lock().expect("mem store mutex poisoned")
  }

  // Fixture helpers. User and seer registration is ordinary CRUD outside
  // the core, so only the in-memory backend carries it.

  pub fn add_user(&self, coins: i64) -> i64 {
    let mut inner = self.lock();
    let id = inner.next_id();
    inner.users.insert(id, UserRec { coins, is_active: true });
    id
  }

  pub fn add_seer(&self, break_secs: i64) -> i64 {
    let mut inner = self.lock();
    let id = inner.next_id();
    inner.users.insert(id, UserRec { coins: 0, is_active: true });
    inner.seers.insert(id, SeerProfile { id, break_secs });
    id
  }

  pub fn add_offering(&self, seer_id: i64, duration_secs: i64, price: i64, question_limit: i32) -> i64 {
    let mut inner = self.lock();
    let id = inner.next_id();
    inner.offerings.insert(
      id,
      Offering {
        id,
        seer_id,
        duration_secs,
        price,
        question_limit,
      },
    );
    id
  }

  pub fn deactivate_user(&self, user_id: i64) {
    let mut inner = self.lock();
    if let Some(user) = inner.users.get_mut(&user_id) {
      user.is_active = false;
    }
  }
}

#[async_trait]
impl Store for MemStore {
  async fn seer_profile(&self, seer_id: i64) -> CoreResult<Option<SeerProfile>> {
    let inner = self.lock();
    let active = inner.users.get(&seer_id).is_some_and(|u| u.is_active);
    Ok(if active { inner.seers.get(&seer_id).cloned() } else { None })
  }

  async fn weekly_schedules(&self, seer_id: i64) -> CoreResult<Vec<WeeklySchedule>> {
    let inner = self.lock();
    Ok(inner.schedules.iter().filter(|s| s.seer_id == seer_id).cloned().collect())
  }

  async fn insert_schedule(&self, seer_id: i64, day: u8, start: NaiveTime, end: NaiveTime) -> CoreResult<i64> {
    let mut inner = self.lock();
    let duplicate = inner
      .schedules
      .iter()
      .any(|s| s.seer_id == seer_id && s.day == day && s.start_time == start && s.end_time == end);
    if duplicate {
      return Err(CoreError::conflict("identical schedule already exists"));
    }
    let id = inner.next_id();
    inner.schedules.push(WeeklySchedule {
      id,
      seer_id,
      day,
      start_time: start,
      end_time: end,
    });
    Ok(id)
  }

  async fn update_schedule(
    &self,
    seer_id: i64,
    schedule_id: i64,
    start: NaiveTime,
    end: NaiveTime,
  ) -> CoreResult<bool> {
    let mut inner = self.lock();
    let Some(day) = inner
      .schedules
      .iter()
      .find(|s| s.seer_id == seer_id && s.id == schedule_id)
      .map(|s| s.day)
    else {
      return Ok(false);
    };
    let duplicate = inner.schedules.iter().any(|s| {
      s.seer_id == seer_id && s.id != schedule_id && s.day == day && s.start_time == start && s.end_time == end
    });
    if duplicate {
      return Err(CoreError::conflict("identical schedule already exists"));
    }
    if let Some(row) = inner
      .schedules
      .iter_mut()
      .find(|s| s.seer_id == seer_id && s.id == schedule_id)
    {
      row.start_time = start;
      row.end_time = end;
    }
    Ok(true)
  }

  async fn delete_schedule(&self, seer_id: i64, schedule_id: i64) -> CoreResult<bool> {
    let mut inner = self.lock();
    let before = inner.schedules.len();
    inner.schedules.retain(|s| !(s.seer_id == seer_id && s.id == schedule_id));
    Ok(inner.schedules.len() < before)
  }

  async fn add_day_off(&self, seer_id: i64, date: NaiveDate) -> CoreResult<()> {
    self.lock().day_offs.insert((seer_id, date));
    Ok(())
  }

  async fn delete_day_off(&self, seer_id: i64, date: NaiveDate) -> CoreResult<bool> {
    Ok(self.lock().day_offs.remove(&(seer_id, date)))
  }

  async fn day_offs(&self, seer_id: i64, from: NaiveDate, to: NaiveDate) -> CoreResult<Vec<NaiveDate>> {
    let inner = self.lock();
    let mut days: Vec<NaiveDate> = inner
      .day_offs
      .iter()
      .filter(|(id, d)| *id == seer_id && *d >= from && *d <= to)
      .map(|(_, d)| *d)
      .collect();
    days.sort();
    Ok(days)
  }

  async fn offering(&self, seer_id: i64, offering_id: i64) -> CoreResult<Option<Offering>> {
    let inner = self.lock();
    Ok(
      inner
        .offerings
        .get(&offering_id)
        .filter(|o| o.seer_id == seer_id)
        .cloned(),
    )
  }

  async fn busy_ranges(
    &self,
    seer_id: i64,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
    now: DateTime<Utc>,
  ) -> CoreResult<Vec<TimeRange>> {
    let inner = self.lock();
    let window = TimeRange::new(from, to);
    let mut busy: Vec<TimeRange> = inner
      .appointments
      .values()
      .filter(|a| a.seer_id == seer_id && !a.status.is_cancelled())
      .map(range_of)
      .filter(|r| interval::overlaps(r, &window))
      .collect();
    busy.extend(
      inner
        .auctions
        .values()
        .filter(|a| a.seer_id == seer_id && inner.auction_can_still_win(a, now))
        .map(|a| TimeRange::new(a.appoint_start_time, a.appoint_end_time))
        .filter(|r| interval::overlaps(r, &window)),
    );
    busy.sort_by_key(|r| r.start);
    Ok(busy)
  }

  async fn insert_appointment_if_free(&self, apmt: &NewAppointment, now: DateTime<Utc>) -> CoreResult<Option<i64>> {
    let mut inner = self.lock();
    let window = TimeRange::new(apmt.start_time, apmt.end_time);
    if inner.seer_busy(apmt.seer_id, &window, now) {
      return Ok(None);
    }
    let id = inner.next_id();
    inner.appointments.insert(id, materialize(id, apmt));
    Ok(Some(id))
  }

  async fn insert_appointment(&self, apmt: &NewAppointment) -> CoreResult<i64> {
    let mut inner = self.lock();
    let id = inner.next_id();
    inner.appointments.insert(id, materialize(id, apmt));
    Ok(id)
  }

  async fn appointment(&self, apmt_id: i64) -> CoreResult<Option<Appointment>> {
    Ok(self.lock().appointments.get(&apmt_id).cloned())
  }

  async fn transition_appointment(
    &self,
    apmt_id: i64,
    seer_id: Option<i64>,
    from: ApmtStatus,
    to: ApmtStatus,
  ) -> CoreResult<bool> {
    let mut inner = self.lock();
    let Some(apmt) = inner.appointments.get_mut(&apmt_id) else {
      return Ok(false);
    };
    if apmt.status != from || seer_id.is_some_and(|id| id != apmt.seer_id) {
      return Ok(false);
    }
    apmt.status = to;
    Ok(true)
  }

  async fn delete_appointment(&self, apmt_id: i64) -> CoreResult<bool> {
    Ok(self.lock().appointments.remove(&apmt_id).is_some())
  }

  async fn cancelled_in_range(&self, client_id: i64, from: DateTime<Utc>, to: DateTime<Utc>) -> CoreResult<i64> {
    let inner = self.lock();
    Ok(
      inner
        .appointments
        .values()
        .filter(|a| {
          a.client_id == client_id
            && a.status == ApmtStatus::UserCancelled
            && a.start_time >= from
            && a.start_time < to
        })
        .count() as i64,
    )
  }

  async fn change_balance(
    &self,
    user_id: i64,
    amount: i64,
    txn_type: TxnType,
    txn_status: TxnStatus,
    activity_id: Option<i64>,
  ) -> CoreResult<(i64, i64)> {
    let mut inner = self.lock();
    let Some(user) = inner.users.get(&user_id) else {
      return Err(CoreError::not_found("user not found"));
    };
    if !user.is_active {
      return Err(CoreError::not_found("user not found"));
    }
    if user.coins + amount < 0 {
      return Err(CoreError::bad_request("insufficient coins"));
    }
    let new_balance = user.coins + amount;
    if let Some(user) = inner.users.get_mut(&user_id) {
      user.coins = new_balance;
    }
    let txn_id = inner.next_id();
    inner.transactions.push(Transaction {
      id: txn_id,
      user_id,
      activity_id,
      amount,
      txn_type,
      status: txn_status,
      created_at: Utc::now(),
    });
    Ok((new_balance, txn_id))
  }

  async fn settle_holds(&self, user_id: i64, activity_id: i64, txn_type: TxnType, to: TxnStatus) -> CoreResult<i64> {
    let mut inner = self.lock();
    let mut sum = 0;
    for txn in inner.transactions.iter_mut() {
      if txn.user_id == user_id
        && txn.activity_id == Some(activity_id)
        && txn.txn_type == txn_type
        && txn.status == TxnStatus::Hold
      {
        txn.status = to;
        sum += txn.amount;
      }
    }
    if to == TxnStatus::Cancelled && sum != 0 {
      let Some(user) = inner.users.get_mut(&user_id) else {
        return Err(CoreError::not_found("user not found"));
      };
      user.coins -= sum;
    }
    Ok(sum)
  }

  async fn balance(&self, user_id: i64) -> CoreResult<Option<i64>> {
    Ok(self.lock().users.get(&user_id).map(|u| u.coins))
  }

  async fn transactions(&self, user_id: i64) -> CoreResult<Vec<Transaction>> {
    let inner = self.lock();
    Ok(inner.transactions.iter().filter(|t| t.user_id == user_id).cloned().collect())
  }

  async fn insert_auction(&self, seer_id: i64, spec: &AuctionSpec) -> CoreResult<i64> {
    let mut inner = self.lock();
    let id = inner.next_id();
    inner.auctions.insert(
      id,
      Auction {
        id,
        seer_id,
        name: spec.name.clone(),
        start_time: spec.start_time,
        end_time: spec.end_time,
        appoint_start_time: spec.appoint_start_time,
        appoint_end_time: spec.appoint_end_time,
        initial_bid: spec.initial_bid,
        min_increment: spec.min_increment,
      },
    );
    Ok(id)
  }

  async fn auction(&self, auction_id: i64) -> CoreResult<Option<Auction>> {
    Ok(self.lock().auctions.get(&auction_id).cloned())
  }

  async fn update_auction_if_unopened(
    &self,
    auction_id: i64,
    seer_id: i64,
    now: DateTime<Utc>,
    next: &Auction,
  ) -> CoreResult<bool> {
    let mut inner = self.lock();
    let has_bids = inner.bids.keys().any(|(aid, _)| *aid == auction_id);
    let Some(auction) = inner.auctions.get_mut(&auction_id) else {
      return Ok(false);
    };
    if auction.seer_id != seer_id || auction.start_time <= now || has_bids {
      return Ok(false);
    }
    *auction = Auction {
      id: auction_id,
      seer_id,
      ..next.clone()
    };
    Ok(true)
  }

  async fn delete_auction_if_unstarted(
    &self,
    auction_id: i64,
    seer_id: Option<i64>,
    now: DateTime<Utc>,
  ) -> CoreResult<bool> {
    let mut inner = self.lock();
    let matches = inner
      .auctions
      .get(&auction_id)
      .is_some_and(|a| a.start_time > now && seer_id.is_none_or(|id| id == a.seer_id));
    if matches {
      inner.auctions.remove(&auction_id);
    }
    Ok(matches)
  }

  async fn close_auction(&self, auction_id: i64, now: DateTime<Utc>) -> CoreResult<Option<Auction>> {
    let mut inner = self.lock();
    let Some(auction) = inner.auctions.get_mut(&auction_id) else {
      return Ok(None);
    };
    if auction.start_time > now || auction.end_time <= now {
      return Ok(None);
    }
    auction.end_time = now;
    Ok(Some(auction.clone()))
  }

  async fn highest_bid(&self, auction_id: i64) -> CoreResult<Option<Bid>> {
    Ok(self.lock().top_bid(auction_id))
  }

  async fn place_bid(&self, auction: &Auction, user_id: i64, amount: i64) -> CoreResult<BidPlacement> {
    let mut inner = self.lock();
    let displaced = inner.top_bid(auction.id);
    let qualifies = match &displaced {
      Some(top) => top.user_id != user_id && amount >= top.amount + auction.min_increment,
      None => amount >= auction.initial_bid,
    };
    if !qualifies {
      return Ok(BidPlacement::Rejected);
    }
    inner.bids.insert((auction.id, user_id), amount);
    Ok(BidPlacement::Accepted { displaced })
  }

  async fn bid_count(&self, auction_id: i64) -> CoreResult<i64> {
    let inner = self.lock();
    Ok(inner.bids.keys().filter(|(aid, _)| *aid == auction_id).count() as i64)
  }
}

fn materialize(id: i64, apmt: &NewAppointment) -> Appointment {
  Appointment {
    id,
    client_id: apmt.client_id,
    seer_id: apmt.seer_id,
    offering_id: apmt.offering_id,
    start_time: apmt.start_time,
    end_time: apmt.end_time,
    status: ApmtStatus::Pending,
    questions: apmt.questions.clone(),
    confirmation_code: apmt.confirmation_code.clone(),
  }
}
