//! Postgres-backed store. Exclusive transitions are single conditional
//! statements (`UPDATE ... WHERE status = 'expected' ... RETURNING`),
//! so concurrent callers race on rows-affected instead of locks.

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::DateTime;
use chrono::NaiveDate;
use chrono::NaiveTime;
use chrono::Utc;
use sqlx::Pool;
use sqlx::Postgres;
use sqlx::Row;
use sqlx::migrate::Migrator;
use sqlx::postgres::PgPoolOptions;
use sqlx::postgres::PgRow;
use tracing::instrument;

use crate::error::CoreError;
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
use crate::store::Store;

pub static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

#[derive(Clone)]
pub struct PgStore {
  pool: Pool<Postgres>,
}

impl PgStore {
  pub async fn connect(database_url: &str) -> CoreResult<Self> {
    let pool = PgPoolOptions::new().max_connections(10).connect(database_url).await?;
    MIGRATOR.run(&pool).await.map_err(|err| CoreError::Internal(err.into()))?;
    Ok(Self { pool })
  }

  pub fn pool(&self) -> &Pool<Postgres> {
    &self.pool
  }
}

fn appointment_from_row(row: &PgRow) -> CoreResult<Appointment> {
  let raw_status: String = row.get("status");
  let status = ApmtStatus::parse(&raw_status)
    .ok_or_else(|| CoreError::Internal(anyhow!("unknown appointment status {raw_status:?}")))?;
  Ok(Appointment {
    id: row.get("id"),
    client_id: row.get("client_id"),
    seer_id: row.get("seer_id"),
    offering_id: row.get("offering_id"),
    start_time: row.get("start_time"),
    end_time: row.get("end_time"),
    status,
    questions: row.get("questions"),
    confirmation_code: row.get("confirmation_code"),
  })
}

fn auction_from_row(row: &PgRow) -> Auction {
  Auction {
    id: row.get("id"),
    seer_id: row.get("seer_id"),
    name: row.get("name"),
    start_time: row.get("start_time"),
    end_time: row.get("end_time"),
    appoint_start_time: row.get("appoint_start_time"),
    appoint_end_time: row.get("appoint_end_time"),
    initial_bid: row.get("initial_bid"),
    min_increment: row.get("min_increment"),
  }
}

fn transaction_from_row(row: &PgRow) -> CoreResult<Transaction> {
  let raw_type: String = row.get("txn_type");
  let raw_status: String = row.get("status");
  let txn_type =
    TxnType::parse(&raw_type).ok_or_else(|| CoreError::Internal(anyhow!("unknown transaction type {raw_type:?}")))?;
  let status = TxnStatus::parse(&raw_status)
    .ok_or_else(|| CoreError::Internal(anyhow!("unknown transaction status {raw_status:?}")))?;
  Ok(Transaction {
    id: row.get("id"),
    user_id: row.get("user_id"),
    activity_id: row.get("activity_id"),
    amount: row.get("amount"),
    txn_type,
    status,
    created_at: row.get("created_at"),
  })
}

const APPOINTMENT_COLUMNS: &str =
  "id, client_id, seer_id, offering_id, start_time, end_time, status, questions, confirmation_code";
const AUCTION_COLUMNS: &str =
  "id, seer_id, name, start_time, end_time, appoint_start_time, appoint_end_time, initial_bid, min_increment";

#[async_trait]
impl Store for PgStore {
  #[instrument(skip(self))]
  async fn seer_profile(&self, seer_id: i64) -> CoreResult<Option<SeerProfile>> {
    let row = sqlx::query(
      r#"
      SELECT s.id, s.break_secs
      FROM seers s
      INNER JOIN users u ON u.id = s.id
      WHERE s.id = $1 AND s.is_active AND u.is_active
      "#,
    )
    .bind(seer_id)
    .fetch_optional(&self.pool)
    .await?;
    Ok(row.map(|row| SeerProfile {
      id: row.get("id"),
      break_secs: row.get("break_secs"),
    }))
  }

  #[instrument(skip(self))]
  async fn weekly_schedules(&self, seer_id: i64) -> CoreResult<Vec<WeeklySchedule>> {
    let rows = sqlx::query(
      r#"
      SELECT id, seer_id, day, start_time, end_time
      FROM schedules
      WHERE seer_id = $1
      ORDER BY day, start_time
      "#,
    )
    .bind(seer_id)
    .fetch_all(&self.pool)
    .await?;
    Ok(
      rows
        .into_iter()
        .map(|row| WeeklySchedule {
          id: row.get("id"),
          seer_id: row.get("seer_id"),
          day: row.get::<i16, _>("day") as u8,
          start_time: row.get("start_time"),
          end_time: row.get("end_time"),
        })
        .collect(),
    )
  }

  #[instrument(skip(self))]
  async fn insert_schedule(&self, seer_id: i64, day: u8, start: NaiveTime, end: NaiveTime) -> CoreResult<i64> {
    let id: i64 = sqlx::query_scalar(
      r#"
      INSERT INTO schedules (seer_id, day, start_time, end_time)
      VALUES ($1, $2, $3, $4)
      RETURNING id
      "#,
    )
    .bind(seer_id)
    .bind(day as i16)
    .bind(start)
    .bind(end)
    .fetch_one(&self.pool)
    .await?;
    Ok(id)
  }

  #[instrument(skip(self))]
  async fn update_schedule(
    &self,
    seer_id: i64,
    schedule_id: i64,
    start: NaiveTime,
    end: NaiveTime,
  ) -> CoreResult<bool> {
    let result = sqlx::query(
      r#"
      UPDATE schedules SET start_time = $3, end_time = $4
      WHERE id = $2 AND seer_id = $1
      "#,
    )
    .bind(seer_id)
    .bind(schedule_id)
    .bind(start)
    .bind(end)
    .execute(&self.pool)
    .await?;
    Ok(result.rows_affected() > 0)
  }

  #[instrument(skip(self))]
  async fn delete_schedule(&self, seer_id: i64, schedule_id: i64) -> CoreResult<bool> {
    let result = sqlx::query("DELETE FROM schedules WHERE id = $2 AND seer_id = $1")
      .bind(seer_id)
      .bind(schedule_id)
      .execute(&self.pool)
      .await?;
    Ok(result.rows_affected() > 0)
  }

  #[instrument(skip(self))]
  async fn add_day_off(&self, seer_id: i64, date: NaiveDate) -> CoreResult<()> {
    sqlx::query(
      r#"
      INSERT INTO day_offs (seer_id, day_off)
      VALUES ($1, $2)
      ON CONFLICT (seer_id, day_off) DO NOTHING
      "#,
    )
    .bind(seer_id)
    .bind(date)
    .execute(&self.pool)
    .await?;
    Ok(())
  }

  #[instrument(skip(self))]
  async fn delete_day_off(&self, seer_id: i64, date: NaiveDate) -> CoreResult<bool> {
    let result = sqlx::query("DELETE FROM day_offs WHERE seer_id = $1 AND day_off = $2")
      .bind(seer_id)
      .bind(date)
      .execute(&self.pool)
      .await?;
    Ok(result.rows_affected() > 0)
  }

  #[instrument(skip(self))]
  async fn day_offs(&self, seer_id: i64, from: NaiveDate, to: NaiveDate) -> CoreResult<Vec<NaiveDate>> {
    let days: Vec<NaiveDate> = sqlx::query_scalar(
      r#"
      SELECT day_off FROM day_offs
      WHERE seer_id = $1 AND day_off BETWEEN $2 AND $3
      ORDER BY day_off
      "#,
    )
    .bind(seer_id)
    .bind(from)
    .bind(to)
    .fetch_all(&self.pool)
    .await?;
    Ok(days)
  }

  #[instrument(skip(self))]
  async fn offering(&self, seer_id: i64, offering_id: i64) -> CoreResult<Option<Offering>> {
    let row = sqlx::query(
      r#"
      SELECT id, seer_id, duration_secs, price, question_limit
      FROM offerings
      WHERE id = $2 AND seer_id = $1 AND status = 'published'
        AND duration_secs IS NOT NULL AND price IS NOT NULL
      "#,
    )
    .bind(seer_id)
    .bind(offering_id)
    .fetch_optional(&self.pool)
    .await?;
    Ok(row.map(|row| Offering {
      id: row.get("id"),
      seer_id: row.get("seer_id"),
      duration_secs: row.get("duration_secs"),
      price: row.get("price"),
      question_limit: row.get("question_limit"),
    }))
  }

  #[instrument(skip(self))]
  async fn busy_ranges(
    &self,
    seer_id: i64,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
    now: DateTime<Utc>,
  ) -> CoreResult<Vec<TimeRange>> {
    let rows = sqlx::query(
      r#"
      SELECT start_time, end_time
      FROM appointments
      WHERE seer_id = $1 AND status NOT IN ('user_cancelled', 'seer_cancelled')
        AND end_time > $2 AND start_time < $3
      UNION ALL
      SELECT a.appoint_start_time, a.appoint_end_time
      FROM auctions a
      WHERE a.seer_id = $1
        AND (a.end_time > $4 OR EXISTS (
          SELECT 1 FROM transactions t
          WHERE t.activity_id = a.id AND t.txn_type = 'auction_bid' AND t.status = 'hold'
        ))
        AND a.appoint_end_time > $2 AND a.appoint_start_time < $3
      ORDER BY start_time
      "#,
    )
    .bind(seer_id)
    .bind(from)
    .bind(to)
    .bind(now)
    .fetch_all(&self.pool)
    .await?;
    Ok(
      rows
        .into_iter()
        .map(|row| TimeRange::new(row.get("start_time"), row.get("end_time")))
        .collect(),
    )
  }

  #[instrument(skip(self, apmt))]
  async fn insert_appointment_if_free(&self, apmt: &NewAppointment, now: DateTime<Utc>) -> CoreResult<Option<i64>> {
    let mut tx = self.pool.begin().await?;
    let activity_id: i64 = sqlx::query_scalar("INSERT INTO activities (kind) VALUES ('appointment') RETURNING id")
      .fetch_one(&mut *tx)
      .await?;
    let inserted: Option<i64> = sqlx::query_scalar(
      r#"
      INSERT INTO appointments
        (id, client_id, seer_id, offering_id, start_time, end_time, status, questions, confirmation_code)
      SELECT $1, $2, $3, $4, $5, $6, 'pending', $7, $8
      WHERE NOT EXISTS (
        SELECT 1 FROM appointments
        WHERE seer_id = $3 AND status NOT IN ('user_cancelled', 'seer_cancelled')
          AND end_time > $5 AND start_time < $6
      ) AND NOT EXISTS (
        SELECT 1 FROM auctions a
        WHERE a.seer_id = $3
          AND (a.end_time > $9 OR EXISTS (
            SELECT 1 FROM transactions t
            WHERE t.activity_id = a.id AND t.txn_type = 'auction_bid' AND t.status = 'hold'
          ))
          AND a.appoint_end_time > $5 AND a.appoint_start_time < $6
      )
      RETURNING id
      "#,
    )
    .bind(activity_id)
    .bind(apmt.client_id)
    .bind(apmt.seer_id)
    .bind(apmt.offering_id)
    .bind(apmt.start_time)
    .bind(apmt.end_time)
    .bind(&apmt.questions)
    .bind(&apmt.confirmation_code)
    .bind(now)
    .fetch_optional(&mut *tx)
    .await?;
    match inserted {
      Some(id) => {
        tx.commit().await?;
        Ok(Some(id))
      },
      None => {
        tx.rollback().await?;
        Ok(None)
      },
    }
  }

  #[instrument(skip(self, apmt))]
  async fn insert_appointment(&self, apmt: &NewAppointment) -> CoreResult<i64> {
    let mut tx = self.pool.begin().await?;
    let activity_id: i64 = sqlx::query_scalar("INSERT INTO activities (kind) VALUES ('appointment') RETURNING id")
      .fetch_one(&mut *tx)
      .await?;
    sqlx::query(
      r#"
      INSERT INTO appointments
        (id, client_id, seer_id, offering_id, start_time, end_time, status, questions, confirmation_code)
      VALUES ($1, $2, $3, $4, $5, $6, 'pending', $7, $8)
      "#,
    )
    .bind(activity_id)
    .bind(apmt.client_id)
    .bind(apmt.seer_id)
    .bind(apmt.offering_id)
    .bind(apmt.start_time)
    .bind(apmt.end_time)
    .bind(&apmt.questions)
    .bind(&apmt.confirmation_code)
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(activity_id)
  }

  #[instrument(skip(self))]
  async fn appointment(&self, apmt_id: i64) -> CoreResult<Option<Appointment>> {
    let row = sqlx::query(&format!("SELECT {APPOINTMENT_COLUMNS} FROM appointments WHERE id = $1"))
      .bind(apmt_id)
      .fetch_optional(&self.pool)
      .await?;
    row.map(|row| appointment_from_row(&row)).transpose()
  }

  #[instrument(skip(self))]
  async fn transition_appointment(
    &self,
    apmt_id: i64,
    seer_id: Option<i64>,
    from: ApmtStatus,
    to: ApmtStatus,
  ) -> CoreResult<bool> {
    let result = sqlx::query(
      r#"
      UPDATE appointments SET status = $3
      WHERE id = $1 AND status = $2
        AND ($4::BIGINT IS NULL OR seer_id = $4)
      "#,
    )
    .bind(apmt_id)
    .bind(from.as_str())
    .bind(to.as_str())
    .bind(seer_id)
    .execute(&self.pool)
    .await?;
    Ok(result.rows_affected() > 0)
  }

  #[instrument(skip(self))]
  async fn delete_appointment(&self, apmt_id: i64) -> CoreResult<bool> {
    let result = sqlx::query("DELETE FROM appointments WHERE id = $1")
      .bind(apmt_id)
      .execute(&self.pool)
      .await?;
    Ok(result.rows_affected() > 0)
  }

  #[instrument(skip(self))]
  async fn cancelled_in_range(&self, client_id: i64, from: DateTime<Utc>, to: DateTime<Utc>) -> CoreResult<i64> {
    let count: i64 = sqlx::query_scalar(
      r#"
      SELECT COUNT(*) FROM appointments
      WHERE client_id = $1 AND status = 'user_cancelled'
        AND start_time >= $2 AND start_time < $3
      "#,
    )
    .bind(client_id)
    .bind(from)
    .bind(to)
    .fetch_one(&self.pool)
    .await?;
    Ok(count)
  }

  #[instrument(skip(self))]
  async fn change_balance(
    &self,
    user_id: i64,
    amount: i64,
    txn_type: TxnType,
    txn_status: TxnStatus,
    activity_id: Option<i64>,
  ) -> CoreResult<(i64, i64)> {
    let mut tx = self.pool.begin().await?;
    let new_balance: Option<i64> = sqlx::query_scalar(
      r#"
      UPDATE users SET coins = coins + $2
      WHERE id = $1 AND is_active AND coins + $2 >= 0
      RETURNING coins
      "#,
    )
    .bind(user_id)
    .bind(amount)
    .fetch_optional(&mut *tx)
    .await?;
    let Some(new_balance) = new_balance else {
      let active: Option<bool> = sqlx::query_scalar("SELECT is_active FROM users WHERE id = $1")
        .bind(user_id)
        .fetch_optional(&mut *tx)
        .await?;
      return match active {
        Some(true) => Err(CoreError::bad_request("insufficient coins")),
        _ => Err(CoreError::not_found("user not found")),
      };
    };
    let txn_id: i64 = sqlx::query_scalar(
      r#"
      INSERT INTO transactions (user_id, activity_id, amount, txn_type, status)
      VALUES ($1, $2, $3, $4, $5)
      RETURNING id
      "#,
    )
    .bind(user_id)
    .bind(activity_id)
    .bind(amount)
    .bind(txn_type.as_str())
    .bind(txn_status.as_str())
    .fetch_one(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok((new_balance, txn_id))
  }

  #[instrument(skip(self))]
  async fn settle_holds(&self, user_id: i64, activity_id: i64, txn_type: TxnType, to: TxnStatus) -> CoreResult<i64> {
    let mut tx = self.pool.begin().await?;
    let amounts: Vec<i64> = sqlx::query_scalar(
      r#"
      UPDATE transactions SET status = $4
      WHERE user_id = $1 AND activity_id = $2 AND txn_type = $3 AND status = 'hold'
      RETURNING amount
      "#,
    )
    .bind(user_id)
    .bind(activity_id)
    .bind(txn_type.as_str())
    .bind(to.as_str())
    .fetch_all(&mut *tx)
    .await?;
    let sum: i64 = amounts.iter().sum();
    if to == TxnStatus::Cancelled && sum != 0 {
      let result = sqlx::query("UPDATE users SET coins = coins - $2 WHERE id = $1 AND is_active")
        .bind(user_id)
        .bind(sum)
        .execute(&mut *tx)
        .await?;
      if result.rows_affected() == 0 {
        return Err(CoreError::not_found("user not found"));
      }
    }
    tx.commit().await?;
    Ok(sum)
  }

  #[instrument(skip(self))]
  async fn balance(&self, user_id: i64) -> CoreResult<Option<i64>> {
    let coins: Option<i64> = sqlx::query_scalar("SELECT coins FROM users WHERE id = $1")
      .bind(user_id)
      .fetch_optional(&self.pool)
      .await?;
    Ok(coins)
  }

  #[instrument(skip(self))]
  async fn transactions(&self, user_id: i64) -> CoreResult<Vec<Transaction>> {
    let rows = sqlx::query(
      r#"
      SELECT id, user_id, activity_id, amount, txn_type, status, created_at
      FROM transactions
      WHERE user_id = $1
      ORDER BY id
      "#,
    )
    .bind(user_id)
    .fetch_all(&self.pool)
    .await?;
    rows.iter().map(transaction_from_row).collect()
  }

  #[instrument(skip(self, spec))]
  async fn insert_auction(&self, seer_id: i64, spec: &AuctionSpec) -> CoreResult<i64> {
    let mut tx = self.pool.begin().await?;
    let activity_id: i64 = sqlx::query_scalar("INSERT INTO activities (kind) VALUES ('auction') RETURNING id")
      .fetch_one(&mut *tx)
      .await?;
    sqlx::query(
      r#"
      INSERT INTO auctions
        (id, seer_id, name, start_time, end_time, appoint_start_time, appoint_end_time, initial_bid, min_increment)
      VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
      "#,
    )
    .bind(activity_id)
    .bind(seer_id)
    .bind(&spec.name)
    .bind(spec.start_time)
    .bind(spec.end_time)
    .bind(spec.appoint_start_time)
    .bind(spec.appoint_end_time)
    .bind(spec.initial_bid)
    .bind(spec.min_increment)
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(activity_id)
  }

  #[instrument(skip(self))]
  async fn auction(&self, auction_id: i64) -> CoreResult<Option<Auction>> {
    let row = sqlx::query(&format!("SELECT {AUCTION_COLUMNS} FROM auctions WHERE id = $1"))
      .bind(auction_id)
      .fetch_optional(&self.pool)
      .await?;
    Ok(row.map(|row| auction_from_row(&row)))
  }

  #[instrument(skip(self, next))]
  async fn update_auction_if_unopened(
    &self,
    auction_id: i64,
    seer_id: i64,
    now: DateTime<Utc>,
    next: &Auction,
  ) -> CoreResult<bool> {
    let result = sqlx::query(
      r#"
      UPDATE auctions SET
        name = $3,
        start_time = $4,
        end_time = $5,
        appoint_start_time = $6,
        appoint_end_time = $7,
        initial_bid = $8,
        min_increment = $9
      WHERE id = $1 AND seer_id = $2 AND start_time > $10
        AND NOT EXISTS (SELECT 1 FROM bids WHERE auction_id = $1)
      "#,
    )
    .bind(auction_id)
    .bind(seer_id)
    .bind(&next.name)
    .bind(next.start_time)
    .bind(next.end_time)
    .bind(next.appoint_start_time)
    .bind(next.appoint_end_time)
    .bind(next.initial_bid)
    .bind(next.min_increment)
    .bind(now)
    .execute(&self.pool)
    .await?;
    Ok(result.rows_affected() > 0)
  }

  #[instrument(skip(self))]
  async fn delete_auction_if_unstarted(
    &self,
    auction_id: i64,
    seer_id: Option<i64>,
    now: DateTime<Utc>,
  ) -> CoreResult<bool> {
    let result = sqlx::query(
      r#"
      DELETE FROM auctions
      WHERE id = $1 AND start_time > $2
        AND ($3::BIGINT IS NULL OR seer_id = $3)
      "#,
    )
    .bind(auction_id)
    .bind(now)
    .bind(seer_id)
    .execute(&self.pool)
    .await?;
    Ok(result.rows_affected() > 0)
  }

  #[instrument(skip(self))]
  async fn close_auction(&self, auction_id: i64, now: DateTime<Utc>) -> CoreResult<Option<Auction>> {
    let row = sqlx::query(&format!(
      r#"
      UPDATE auctions SET end_time = $2
      WHERE id = $1 AND start_time <= $2 AND end_time > $2
      RETURNING {AUCTION_COLUMNS}
      "#
    ))
    .bind(auction_id)
    .bind(now)
    .fetch_optional(&self.pool)
    .await?;
    Ok(row.map(|row| auction_from_row(&row)))
  }

  #[instrument(skip(self))]
  async fn highest_bid(&self, auction_id: i64) -> CoreResult<Option<Bid>> {
    let row = sqlx::query(
      r#"
      SELECT auction_id, user_id, amount
      FROM bids
      WHERE auction_id = $1
      ORDER BY amount DESC, created_at ASC
      LIMIT 1
      "#,
    )
    .bind(auction_id)
    .fetch_optional(&self.pool)
    .await?;
    Ok(row.map(|row| Bid {
      auction_id: row.get("auction_id"),
      user_id: row.get("user_id"),
      amount: row.get("amount"),
    }))
  }

  #[instrument(skip(self, auction))]
  async fn place_bid(&self, auction: &Auction, user_id: i64, amount: i64) -> CoreResult<BidPlacement> {
    let mut tx = self.pool.begin().await?;
    // Bidders on one auction serialize on its row, so the qualification
    // check and the upsert see a stable top bid.
    let locked: Option<i64> = sqlx::query_scalar("SELECT id FROM auctions WHERE id = $1 FOR UPDATE")
      .bind(auction.id)
      .fetch_optional(&mut *tx)
      .await?;
    if locked.is_none() {
      tx.rollback().await?;
      return Ok(BidPlacement::Rejected);
    }
    let displaced = sqlx::query(
      r#"
      SELECT auction_id, user_id, amount
      FROM bids
      WHERE auction_id = $1
      ORDER BY amount DESC, created_at ASC
      LIMIT 1
      "#,
    )
    .bind(auction.id)
    .fetch_optional(&mut *tx)
    .await?
    .map(|row| Bid {
      auction_id: row.get("auction_id"),
      user_id: row.get("user_id"),
      amount: row.get("amount"),
    });
    let qualifies = match &displaced {
      Some(top) => top.user_id != user_id && amount >= top.amount + auction.min_increment,
      None => amount >= auction.initial_bid,
    };
    if !qualifies {
      tx.rollback().await?;
      return Ok(BidPlacement::Rejected);
    }
    sqlx::query(
      r#"
      INSERT INTO bids (auction_id, user_id, amount)
      VALUES ($1, $2, $3)
      ON CONFLICT (auction_id, user_id) DO UPDATE SET amount = EXCLUDED.amount
      "#,
    )
    .bind(auction.id)
    .bind(user_id)
    .bind(amount)
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(BidPlacement::Accepted { displaced })
  }

  #[instrument(skip(self))]
  async fn bid_count(&self, auction_id: i64) -> CoreResult<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM bids WHERE auction_id = $1")
      .bind(auction_id)
      .fetch_one(&self.pool)
      .await?;
    Ok(count)
  }
}
