//! Coin ledger operations.
//!
//! Every balance mutation goes through `change_balance`, which adjusts
//! the cached balance and appends a transaction row in one unit of work.
//! Holds are released exclusively through `settle_holds`; amounts are
//! never edited and rows are never deleted, so for any activity the sum
//! of amounts across terminal transactions is conserved.

use tracing::info;

use crate::error::CoreError;
use crate::error::CoreResult;
use crate::models::TxnStatus;
use crate::models::TxnType;
use crate::store::Store;
use crate::util;

/// Adjusts a user's balance by a signed amount and records the matching
/// transaction. Returns `(new_balance, txn_id)`.
pub async fn change_balance<S: Store>(
  store: &S,
  user_id: i64,
  amount: i64,
  txn_type: TxnType,
  txn_status: TxnStatus,
  activity_id: Option<i64>,
) -> CoreResult<(i64, i64)> {
  let (balance, txn_id) = store
    .change_balance(user_id, amount, txn_type, txn_status, activity_id)
    .await?;
  info!(user_id, amount, txn_type = txn_type.as_str(), txn_id, "balance changed");
  Ok((balance, txn_id))
}

/// Moves all outstanding holds for `(user, activity, type)` to a
/// terminal status and returns the summed amount. Cancelling restores
/// the held money; completing leaves the debit in place.
pub async fn settle_holds<S: Store>(
  store: &S,
  user_id: i64,
  activity_id: i64,
  txn_type: TxnType,
  to: TxnStatus,
) -> CoreResult<i64> {
  if to == TxnStatus::Hold {
    return Err(CoreError::bad_request("holds can only move to a terminal status"));
  }
  let sum = store.settle_holds(user_id, activity_id, txn_type, to).await?;
  info!(user_id, activity_id, sum, to = to.as_str(), "holds settled");
  Ok(sum)
}

pub async fn topup<S: Store>(store: &S, user_id: i64, amount: i64) -> CoreResult<(i64, i64)> {
  if amount <= 0 {
    return Err(CoreError::bad_request("amount must be positive"));
  }
  change_balance(store, user_id, amount, TxnType::Topup, TxnStatus::Completed, None).await
}

pub async fn withdraw<S: Store>(store: &S, user_id: i64, amount: i64) -> CoreResult<(i64, i64)> {
  if amount <= 0 {
    return Err(CoreError::bad_request("amount must be positive"));
  }
  change_balance(store, user_id, -amount, TxnType::Withdraw, TxnStatus::Completed, None).await
}

/// Topup from a user-supplied decimal string ("10", "10.50").
pub async fn topup_from_input<S: Store>(store: &S, user_id: i64, input: &str) -> CoreResult<(i64, i64)> {
  let amount = parse_amount(input)?;
  info!(user_id, amount = %util::format_coins(amount), "topup requested");
  topup(store, user_id, amount).await
}

pub async fn withdraw_from_input<S: Store>(store: &S, user_id: i64, input: &str) -> CoreResult<(i64, i64)> {
  let amount = parse_amount(input)?;
  info!(user_id, amount = %util::format_coins(amount), "withdrawal requested");
  withdraw(store, user_id, amount).await
}

fn parse_amount(input: &str) -> CoreResult<i64> {
  util::parse_coin_amount(input).map_err(|err| CoreError::bad_request(err.to_string()))
}

#[cfg(test)]
mod tests {
  use super::change_balance;
  use super::settle_holds;
  use super::topup;
  use super::topup_from_input;
  use super::withdraw;
  use super::withdraw_from_input;
  use crate::models::TxnStatus;
  use crate::models::TxnType;
  use crate::store::MemStore;
  use crate::store::Store;

  async fn ledger_balance(store: &MemStore, user_id: i64) -> i64 {
    store
      .transactions(user_id)
      .await
      .expect("transactions")
      .iter()
      .filter(|t| t.status != TxnStatus::Cancelled)
      .map(|t| t.amount)
      .sum()
  }

  #[tokio::test]
  async fn balance_tracks_non_cancelled_transaction_sum() {
    let store = MemStore::new();
    let user = store.add_user(0);

    topup(&store, user, 10_000).await.expect("topup");
    change_balance(&store, user, -2_500, TxnType::Appointment, TxnStatus::Hold, Some(99))
      .await
      .expect("hold");
    withdraw(&store, user, 1_000).await.expect("withdraw");

    assert_eq!(store.balance(user).await.expect("balance"), Some(6_500));
    assert_eq!(ledger_balance(&store, user).await, 6_500);
  }

  #[tokio::test]
  async fn cancelling_a_hold_restores_the_balance() {
    let store = MemStore::new();
    let user = store.add_user(5_000);

    change_balance(&store, user, -3_000, TxnType::AuctionBid, TxnStatus::Hold, Some(7))
      .await
      .expect("hold");
    assert_eq!(store.balance(user).await.expect("balance"), Some(2_000));

    let sum = settle_holds(&store, user, 7, TxnType::AuctionBid, TxnStatus::Cancelled)
      .await
      .expect("settle");
    assert_eq!(sum, -3_000);
    assert_eq!(store.balance(user).await.expect("balance"), Some(5_000));
    assert_eq!(ledger_balance(&store, user).await, 5_000);
  }

  #[tokio::test]
  async fn completing_a_hold_keeps_the_debit() {
    let store = MemStore::new();
    let user = store.add_user(5_000);

    change_balance(&store, user, -3_000, TxnType::Appointment, TxnStatus::Hold, Some(7))
      .await
      .expect("hold");
    let sum = settle_holds(&store, user, 7, TxnType::Appointment, TxnStatus::Completed)
      .await
      .expect("settle");
    assert_eq!(sum, -3_000);
    assert_eq!(store.balance(user).await.expect("balance"), Some(2_000));
  }

  #[tokio::test]
  async fn settling_twice_is_a_no_op() {
    let store = MemStore::new();
    let user = store.add_user(5_000);

    change_balance(&store, user, -3_000, TxnType::AuctionBid, TxnStatus::Hold, Some(7))
      .await
      .expect("hold");
    settle_holds(&store, user, 7, TxnType::AuctionBid, TxnStatus::Cancelled)
      .await
      .expect("settle");
    let sum = settle_holds(&store, user, 7, TxnType::AuctionBid, TxnStatus::Cancelled)
      .await
      .expect("settle again");
    assert_eq!(sum, 0);
    assert_eq!(store.balance(user).await.expect("balance"), Some(5_000));
  }

  #[tokio::test]
  async fn insufficient_balance_is_rejected_atomically() {
    let store = MemStore::new();
    let user = store.add_user(100);

    let err = withdraw(&store, user, 200).await.expect_err("should fail");
    assert!(err.is_bad_request());
    assert_eq!(store.balance(user).await.expect("balance"), Some(100));
    assert!(store.transactions(user).await.expect("transactions").is_empty());
  }

  #[tokio::test]
  async fn inactive_user_is_not_found() {
    let store = MemStore::new();
    let user = store.add_user(1_000);
    store.deactivate_user(user);

    let err = topup(&store, user, 100).await.expect_err("should fail");
    assert!(err.is_not_found());
  }

  #[tokio::test]
  async fn string_amounts_are_parsed_into_hundredths() {
    let store = MemStore::new();
    let user = store.add_user(0);

    topup_from_input(&store, user, "10.50").await.expect("topup");
    assert_eq!(store.balance(user).await.expect("balance"), Some(1_050));

    withdraw_from_input(&store, user, "0.5").await.expect("withdraw");
    assert_eq!(store.balance(user).await.expect("balance"), Some(1_000));

    let err = topup_from_input(&store, user, "ten").await.expect_err("invalid");
    assert!(err.is_bad_request());
  }

  #[tokio::test]
  async fn non_positive_topup_is_rejected() {
    let store = MemStore::new();
    let user = store.add_user(0);
    assert!(topup(&store, user, 0).await.is_err());
    assert!(withdraw(&store, user, -5).await.is_err());
  }
}
