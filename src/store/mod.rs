//! Storage seam for the marketplace core.
//!
//! Every state transition that must be exclusive (slot booking, bid
//! acceptance, hold settlement, auction conclusion) is a conditional
//! update that checks and changes state in one atomic step; zero
//! affected rows means "no longer valid", never a silent retry. Both
//! backends implement the same semantics, so the engines above this
//! trait behave identically in tests and production.

mod memory;
mod postgres;

use async_trait::async_trait;
use chrono::DateTime;
use chrono::NaiveDate;
use chrono::NaiveTime;
use chrono::Utc;

use crate::error::CoreResult;
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

pub use memory::MemStore;
pub use postgres::PgStore;

#[async_trait]
pub trait Store: Send + Sync {
  // --- seer calendar ---

  /// Active seer profile, or None if absent or deactivated.
  async fn seer_profile(&self, seer_id: i64) -> CoreResult<Option<SeerProfile>>;
  async fn weekly_schedules(&self, seer_id: i64) -> CoreResult<Vec<WeeklySchedule>>;
  /// Fails with `Conflict` when an identical row already exists.
  async fn insert_schedule(&self, seer_id: i64, day: u8, start: NaiveTime, end: NaiveTime) -> CoreResult<i64>;
  async fn update_schedule(
    &self,
    seer_id: i64,
    schedule_id: i64,
    start: NaiveTime,
    end: NaiveTime,
  ) -> CoreResult<bool>;
  async fn delete_schedule(&self, seer_id: i64, schedule_id: i64) -> CoreResult<bool>;
  /// Insert-or-ignore; adding the same date twice is not an error.
  async fn add_day_off(&self, seer_id: i64, date: NaiveDate) -> CoreResult<()>;
  async fn delete_day_off(&self, seer_id: i64, date: NaiveDate) -> CoreResult<bool>;
  async fn day_offs(&self, seer_id: i64, from: NaiveDate, to: NaiveDate) -> CoreResult<Vec<NaiveDate>>;

  // --- offerings & appointments ---

  /// Published offering with price and duration set, or None.
  async fn offering(&self, seer_id: i64, offering_id: i64) -> CoreResult<Option<Offering>>;
  /// Non-cancelled appointment intervals plus the reserved appointment
  /// windows of auctions that can still produce a winner, intersecting
  /// `[from, to)`. An auction keeps its window busy while its bidding is
  /// open and, after the deadline, for as long as a bid hold on it is
  /// still outstanding (conclusion has not settled it yet).
  async fn busy_ranges(
    &self,
    seer_id: i64,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
    now: DateTime<Utc>,
  ) -> CoreResult<Vec<TimeRange>>;
  /// Inserts a pending appointment only if the seer has no conflicting
  /// commitment; returns None when the slot was taken in the meantime.
  async fn insert_appointment_if_free(&self, apmt: &NewAppointment, now: DateTime<Utc>) -> CoreResult<Option<i64>>;
  /// Unguarded insert, used for auction-won appointments whose window
  /// was reserved at auction creation.
  async fn insert_appointment(&self, apmt: &NewAppointment) -> CoreResult<i64>;
  async fn appointment(&self, apmt_id: i64) -> CoreResult<Option<Appointment>>;
  /// Compare-and-swap on the status field; `seer_id` additionally scopes
  /// the update to that seer's appointments.
  async fn transition_appointment(
    &self,
    apmt_id: i64,
    seer_id: Option<i64>,
    from: ApmtStatus,
    to: ApmtStatus,
  ) -> CoreResult<bool>;
  /// Compensation path for a booking whose hold could not be placed.
  async fn delete_appointment(&self, apmt_id: i64) -> CoreResult<bool>;
  /// User-cancelled appointments with a start time inside `[from, to)`.
  async fn cancelled_in_range(&self, client_id: i64, from: DateTime<Utc>, to: DateTime<Utc>) -> CoreResult<i64>;

  // --- coin ledger ---

  /// Atomically adjusts the balance and appends a transaction row.
  /// Fails with `NotFound` for a missing or inactive user and with
  /// `BadRequest` when the adjustment would drive the balance negative.
  /// Returns `(new_balance, txn_id)`.
  async fn change_balance(
    &self,
    user_id: i64,
    amount: i64,
    txn_type: TxnType,
    txn_status: TxnStatus,
    activity_id: Option<i64>,
  ) -> CoreResult<(i64, i64)>;
  /// Moves every matching hold to a terminal status and returns the
  /// summed amount. Cancelling also restores the held money to the
  /// user's balance in the same unit of work.
  async fn settle_holds(&self, user_id: i64, activity_id: i64, txn_type: TxnType, to: TxnStatus) -> CoreResult<i64>;
  async fn balance(&self, user_id: i64) -> CoreResult<Option<i64>>;
  async fn transactions(&self, user_id: i64) -> CoreResult<Vec<Transaction>>;

  // --- auctions ---

  async fn insert_auction(&self, seer_id: i64, spec: &AuctionSpec) -> CoreResult<i64>;
  async fn auction(&self, auction_id: i64) -> CoreResult<Option<Auction>>;
  /// Replaces the auction's fields only while it has not opened and
  /// carries no bids; both guards sit inside the conditional update, so
  /// a bid or the opening instant landing concurrently makes this
  /// return false instead of editing terms under a live hold.
  async fn update_auction_if_unopened(
    &self,
    auction_id: i64,
    seer_id: i64,
    now: DateTime<Utc>,
    next: &Auction,
  ) -> CoreResult<bool>;
  async fn delete_auction_if_unstarted(
    &self,
    auction_id: i64,
    seer_id: Option<i64>,
    now: DateTime<Utc>,
  ) -> CoreResult<bool>;
  /// Forces `end_time` to `now`, only while the auction is open.
  /// Returns the closed auction, or None when it never opened or had
  /// already ended.
  async fn close_auction(&self, auction_id: i64, now: DateTime<Utc>) -> CoreResult<Option<Auction>>;
  async fn highest_bid(&self, auction_id: i64) -> CoreResult<Option<Bid>>;
  /// Accepts `amount` as the new top bid if it meets the initial price
  /// (first bid) or clears the current top by `min_increment` and comes
  /// from a different bidder. Check, upsert, and the read of the
  /// displaced top happen in one unit of work.
  async fn place_bid(&self, auction: &Auction, user_id: i64, amount: i64) -> CoreResult<BidPlacement>;
  async fn bid_count(&self, auction_id: i64) -> CoreResult<i64>;
}
