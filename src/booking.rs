//! Booking coordinator: validates a requested slot at write time,
//! creates the appointment, and places the matching coin hold
//! all-or-nothing.

use chrono::DateTime;
use chrono::Datelike;
use chrono::Duration;
use chrono::NaiveDate;
use chrono::NaiveTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use tracing::info;
use tracing::warn;

use crate::availability;
use crate::availability::civil_to_utc;
use crate::availability::utc_to_civil_date;
use crate::error::CoreError;
use crate::error::CoreResult;
use crate::ledger;
use crate::models::ApmtStatus;
use crate::models::Appointment;
use crate::models::NewAppointment;
use crate::models::TxnStatus;
use crate::models::TxnType;
use crate::notify;
use crate::notify::Notifier;
use crate::store::Store;
use crate::util;

/// Client cancellations inside the cutoff are rejected outright.
const CANCEL_CUTOFF_SECS: i64 = 3600;

const CONFIRMATION_CODE_LEN: usize = 6;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookingRequest {
  pub client_id: i64,
  pub seer_id: i64,
  pub offering_id: i64,
  pub start_time: DateTime<Utc>,
  pub questions: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppointmentCreated {
  pub appointment_id: i64,
  pub start_time: DateTime<Utc>,
  pub end_time: DateTime<Utc>,
  pub confirmation_code: String,
  /// What the client paid, in hundredths of a coin.
  pub total: i64,
  pub new_balance: i64,
}

/// Books a slot for a published offering. The availability engine is
/// re-run at write time; a stale slot list on the client's side is
/// never trusted.
pub async fn book<S: Store, N: Notifier>(store: &S, notifier: &N, req: BookingRequest) -> CoreResult<AppointmentCreated> {
  let now = Utc::now();
  if req.start_time <= now {
    return Err(CoreError::bad_request("cannot book a past slot"));
  }
  let seer = store
    .seer_profile(req.seer_id)
    .await?
    .ok_or_else(|| CoreError::not_found("seer not found"))?;
  let offering = store
    .offering(req.seer_id, req.offering_id)
    .await?
    .ok_or_else(|| CoreError::not_found("offering not found"))?;
  if offering.question_limit >= 0 && req.questions.len() > offering.question_limit as usize {
    return Err(CoreError::bad_request("question limit exceeded"));
  }

  let duration = Duration::seconds(offering.duration_secs);
  let end_time = req.start_time + duration;
  let date = utc_to_civil_date(req.start_time);
  let slots = availability::slots_for_duration(store, &seer, duration, date, date, now).await?;
  if !slots.iter().any(|s| s.start == req.start_time && s.end == end_time) {
    return Err(CoreError::bad_request("slot not available"));
  }

  let code = util::confirmation_code(CONFIRMATION_CODE_LEN);
  let apmt = NewAppointment {
    client_id: req.client_id,
    seer_id: req.seer_id,
    offering_id: Some(req.offering_id),
    start_time: req.start_time,
    end_time,
    questions: req.questions,
    confirmation_code: code.clone(),
  };
  let apmt_id = store
    .insert_appointment_if_free(&apmt, now)
    .await?
    .ok_or_else(|| CoreError::bad_request("slot not available"))?;

  // The hold and the appointment stand or fall together; if the hold
  // cannot be placed the appointment row is compensated away.
  let new_balance = match ledger::change_balance(
    store,
    req.client_id,
    -offering.price,
    TxnType::Appointment,
    TxnStatus::Hold,
    Some(apmt_id),
  )
  .await
  {
    Ok((balance, _)) => balance,
    Err(err) => {
      if let Err(cleanup) = store.delete_appointment(apmt_id).await {
        warn!(apmt_id, error = %cleanup, "failed to compensate appointment after hold failure");
      }
      return Err(err);
    },
  };

  info!(apmt_id, client_id = req.client_id, seer_id = req.seer_id, "appointment booked");
  notify::try_notify(notifier, req.seer_id, "appointment booked").await;
  Ok(AppointmentCreated {
    appointment_id: apmt_id,
    start_time: req.start_time,
    end_time,
    confirmation_code: code,
    total: offering.price,
    new_balance,
  })
}

async fn require_appointment<S: Store>(store: &S, apmt_id: i64) -> CoreResult<Appointment> {
  store
    .appointment(apmt_id)
    .await?
    .ok_or_else(|| CoreError::not_found("appointment not found"))
}

/// Marks a pending appointment completed, settles the client's hold and
/// pays the seer. Auction-won appointments were paid at conclusion and
/// move no money here.
pub async fn complete<S: Store>(store: &S, apmt_id: i64, seer_id: i64) -> CoreResult<()> {
  let apmt = require_appointment(store, apmt_id).await?;
  if apmt.seer_id != seer_id {
    return Err(CoreError::not_found("appointment not found"));
  }
  let updated = store
    .transition_appointment(apmt_id, Some(seer_id), ApmtStatus::Pending, ApmtStatus::Completed)
    .await?;
  if !updated {
    return Err(CoreError::bad_request("appointment is no longer pending"));
  }
  let settled = ledger::settle_holds(store, apmt.client_id, apmt_id, TxnType::Appointment, TxnStatus::Completed).await?;
  if settled != 0 {
    ledger::change_balance(
      store,
      seer_id,
      -settled,
      TxnType::Appointment,
      TxnStatus::Completed,
      Some(apmt_id),
    )
    .await?;
  }
  info!(apmt_id, seer_id, paid = -settled, "appointment completed");
  Ok(())
}

async fn cancel<S: Store>(store: &S, apmt: &Appointment, to: ApmtStatus, refund: bool) -> CoreResult<()> {
  let seer_scope = if to == ApmtStatus::SeerCancelled { Some(apmt.seer_id) } else { None };
  let updated = store
    .transition_appointment(apmt.id, seer_scope, ApmtStatus::Pending, to)
    .await?;
  if !updated {
    return Err(CoreError::bad_request("appointment is no longer pending"));
  }
  if refund {
    ledger::settle_holds(store, apmt.client_id, apmt.id, TxnType::Appointment, TxnStatus::Cancelled).await?;
  } else {
    // No refund: the held amount is still paid out to the seer.
    let settled =
      ledger::settle_holds(store, apmt.client_id, apmt.id, TxnType::Appointment, TxnStatus::Completed).await?;
    if settled != 0 {
      ledger::change_balance(
        store,
        apmt.seer_id,
        -settled,
        TxnType::Appointment,
        TxnStatus::Completed,
        Some(apmt.id),
      )
      .await?;
    }
  }
  info!(apmt_id = apmt.id, status = to.as_str(), refund, "appointment cancelled");
  Ok(())
}

/// First and one-past-last instant of the civil month `now` falls in.
fn current_month_window(now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
  let today = utc_to_civil_date(now);
  let first = NaiveDate::from_ymd_opt(today.year(), today.month(), 1).expect("first of month is a valid date");
  let next_first = if today.month() == 12 {
    NaiveDate::from_ymd_opt(today.year() + 1, 1, 1)
  } else {
    NaiveDate::from_ymd_opt(today.year(), today.month() + 1, 1)
  }
  .expect("first of month is a valid date");
  (civil_to_utc(first, NaiveTime::MIN), civil_to_utc(next_first, NaiveTime::MIN))
}

/// Client-initiated cancellation. Rejected within one hour of the start;
/// refunded only while the month's cancellation count is under `quota`.
pub async fn cancel_by_client<S: Store>(store: &S, apmt_id: i64, client_id: i64, quota: i64) -> CoreResult<()> {
  let apmt = require_appointment(store, apmt_id).await?;
  if apmt.client_id != client_id {
    return Err(CoreError::not_found("appointment not found"));
  }
  let now = Utc::now();
  if apmt.start_time - now < Duration::seconds(CANCEL_CUTOFF_SECS) {
    return Err(CoreError::bad_request("cannot cancel within one hour of the appointment"));
  }
  let (month_start, month_end) = current_month_window(now);
  let cancelled = store.cancelled_in_range(client_id, month_start, month_end).await?;
  cancel(store, &apmt, ApmtStatus::UserCancelled, cancelled < quota).await
}

/// Seer-initiated cancellation, always refunded.
pub async fn cancel_by_seer<S: Store>(store: &S, apmt_id: i64, seer_id: i64) -> CoreResult<()> {
  let apmt = require_appointment(store, apmt_id).await?;
  if apmt.seer_id != seer_id {
    return Err(CoreError::not_found("appointment not found"));
  }
  cancel(store, &apmt, ApmtStatus::SeerCancelled, true).await
}
