use chrono::DateTime;
use chrono::NaiveDate;
use chrono::NaiveTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;

/// Half-open interval `[start, end)` in UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
  pub start: DateTime<Utc>,
  pub end: DateTime<Utc>,
}

impl TimeRange {
  pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
    Self { start, end }
  }
}

/// One interval of weekly recurring availability, in the seer's civil
/// time (UTC+7). `end_time == 00:00` means midnight of the next day.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeeklySchedule {
  pub id: i64,
  pub seer_id: i64,
  /// 0 = Monday .. 6 = Sunday.
  pub day: u8,
  pub start_time: NaiveTime,
  pub end_time: NaiveTime,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeerProfile {
  pub id: i64,
  /// Break enforced after every booked slot, in seconds.
  pub break_secs: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Offering {
  pub id: i64,
  pub seer_id: i64,
  pub duration_secs: i64,
  /// Hundredths of a coin.
  pub price: i64,
  /// Negative means unlimited.
  pub question_limit: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApmtStatus {
  Pending,
  Completed,
  UserCancelled,
  SeerCancelled,
}

impl ApmtStatus {
  pub fn as_str(self) -> &'static str {
    match self {
      Self::Pending => "pending",
      Self::Completed => "completed",
      Self::UserCancelled => "user_cancelled",
      Self::SeerCancelled => "seer_cancelled",
    }
  }

  pub fn parse(raw: &str) -> Option<Self> {
    match raw {
      "pending" => Some(Self::Pending),
      "completed" => Some(Self::Completed),
      "user_cancelled" => Some(Self::UserCancelled),
      "seer_cancelled" => Some(Self::SeerCancelled),
      _ => None,
    }
  }

  pub fn is_cancelled(self) -> bool {
    matches!(self, Self::UserCancelled | Self::SeerCancelled)
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Appointment {
  pub id: i64,
  pub client_id: i64,
  pub seer_id: i64,
  /// None for auction-won appointments.
  pub offering_id: Option<i64>,
  pub start_time: DateTime<Utc>,
  pub end_time: DateTime<Utc>,
  pub status: ApmtStatus,
  pub questions: Vec<String>,
  pub confirmation_code: String,
}

#[derive(Debug, Clone)]
pub struct NewAppointment {
  pub client_id: i64,
  pub seer_id: i64,
  pub offering_id: Option<i64>,
  pub start_time: DateTime<Utc>,
  pub end_time: DateTime<Utc>,
  pub questions: Vec<String>,
  pub confirmation_code: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxnType {
  Topup,
  Appointment,
  AuctionBid,
  Withdraw,
  Other,
}

impl TxnType {
  pub fn as_str(self) -> &'static str {
    match self {
      Self::Topup => "topup",
      Self::Appointment => "appointment",
      Self::AuctionBid => "auction_bid",
      Self::Withdraw => "withdraw",
      Self::Other => "other",
    }
  }

  pub fn parse(raw: &str) -> Option<Self> {
    match raw {
      "topup" => Some(Self::Topup),
      "appointment" => Some(Self::Appointment),
      "auction_bid" => Some(Self::AuctionBid),
      "withdraw" => Some(Self::Withdraw),
      "other" => Some(Self::Other),
      _ => None,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxnStatus {
  Hold,
  Completed,
  Cancelled,
}

impl TxnStatus {
  pub fn as_str(self) -> &'static str {
    match self {
      Self::Hold => "hold",
      Self::Completed => "completed",
      Self::Cancelled => "cancelled",
    }
  }

  pub fn parse(raw: &str) -> Option<Self> {
    match raw {
      "hold" => Some(Self::Hold),
      "completed" => Some(Self::Completed),
      "cancelled" => Some(Self::Cancelled),
      _ => None,
    }
  }
}

/// Append-only ledger entry. The amount never changes after creation;
/// only the status moves, and only from `Hold` to a terminal state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
  pub id: i64,
  pub user_id: i64,
  pub activity_id: Option<i64>,
  /// Signed, hundredths of a coin.
  pub amount: i64,
  pub txn_type: TxnType,
  pub status: TxnStatus,
  pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Auction {
  pub id: i64,
  pub seer_id: i64,
  pub name: String,
  /// Bidding window.
  pub start_time: DateTime<Utc>,
  pub end_time: DateTime<Utc>,
  /// Reserved appointment window sold to the winner.
  pub appoint_start_time: DateTime<Utc>,
  pub appoint_end_time: DateTime<Utc>,
  pub initial_bid: i64,
  pub min_increment: i64,
}

impl Auction {
  pub fn has_valid_times(&self) -> bool {
    self.start_time < self.end_time
      && self.end_time < self.appoint_start_time
      && self.appoint_start_time < self.appoint_end_time
  }

  pub fn has_started(&self, now: DateTime<Utc>) -> bool {
    self.start_time <= now
  }

  pub fn has_ended(&self, now: DateTime<Utc>) -> bool {
    self.end_time <= now
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuctionSpec {
  pub name: String,
  pub start_time: DateTime<Utc>,
  pub end_time: DateTime<Utc>,
  pub appoint_start_time: DateTime<Utc>,
  pub appoint_end_time: DateTime<Utc>,
  pub initial_bid: i64,
  pub min_increment: i64,
}

impl AuctionSpec {
  pub fn has_valid_times(&self) -> bool {
    self.start_time < self.end_time
      && self.end_time < self.appoint_start_time
      && self.appoint_start_time < self.appoint_end_time
  }
}

/// Partial edit of an auction; unset fields keep their current value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuctionUpdate {
  pub name: Option<String>,
  pub start_time: Option<DateTime<Utc>>,
  pub end_time: Option<DateTime<Utc>>,
  pub appoint_start_time: Option<DateTime<Utc>>,
  pub appoint_end_time: Option<DateTime<Utc>>,
  pub initial_bid: Option<i64>,
  pub min_increment: Option<i64>,
}

impl AuctionUpdate {
  pub fn apply(&self, current: &Auction) -> Auction {
    Auction {
      id: current.id,
      seer_id: current.seer_id,
      name: self.name.clone().unwrap_or_else(|| current.name.clone()),
      start_time: self.start_time.unwrap_or(current.start_time),
      end_time: self.end_time.unwrap_or(current.end_time),
      appoint_start_time: self.appoint_start_time.unwrap_or(current.appoint_start_time),
      appoint_end_time: self.appoint_end_time.unwrap_or(current.appoint_end_time),
      initial_bid: self.initial_bid.unwrap_or(current.initial_bid),
      min_increment: self.min_increment.unwrap_or(current.min_increment),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bid {
  pub auction_id: i64,
  pub user_id: i64,
  pub amount: i64,
}

/// Outcome of an atomic bid placement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BidPlacement {
  /// The bid was stored; `displaced` is the top bid it superseded, read
  /// in the same unit of work so the caller releases the right hold.
  Accepted { displaced: Option<Bid> },
  /// The amount did not qualify against the bids present at placement
  /// time.
  Rejected,
}

/// A calendar date with no availability, in the seer's civil time zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DayOff {
  pub seer_id: i64,
  pub date: NaiveDate,
}
