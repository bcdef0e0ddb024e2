//! Auction lifecycle: creation over a reserved appointment window,
//! monotonic bidding with coin holds, and idempotent conclusion.

use chrono::Utc;
use tracing::info;
use tracing::warn;

use crate::error::CoreError;
use crate::error::CoreResult;
use crate::ledger;
use crate::models::Auction;
use crate::models::AuctionSpec;
use crate::models::AuctionUpdate;
use crate::models::BidPlacement;
use crate::models::NewAppointment;
use crate::models::TxnStatus;
use crate::models::TxnType;
use crate::notify;
use crate::notify::Notifier;
use crate::store::Store;
use crate::util;

const CONFIRMATION_CODE_LEN: usize = 6;

async fn require_auction<S: Store>(store: &S, auction_id: i64) -> CoreResult<Auction> {
  store
    .auction(auction_id)
    .await?
    .ok_or_else(|| CoreError::not_found("auction not found"))
}

/// Creates an auction whose reserved window is free, and asks the timer
/// service to conclude it at the bidding deadline.
pub async fn create_auction<S: Store, N: Notifier>(
  store: &S,
  notifier: &N,
  seer_id: i64,
  spec: AuctionSpec,
) -> CoreResult<i64> {
  let now = Utc::now();
  store
    .seer_profile(seer_id)
    .await?
    .ok_or_else(|| CoreError::not_found("seer not found"))?;
  if spec.start_time <= now {
    return Err(CoreError::bad_request("auction must start in the future"));
  }
  if !spec.has_valid_times() {
    return Err(CoreError::bad_request("auction times are out of order"));
  }
  if spec.initial_bid <= 0 || spec.min_increment <= 0 {
    return Err(CoreError::bad_request("initial bid and increment must be positive"));
  }
  let busy = store
    .busy_ranges(seer_id, spec.appoint_start_time, spec.appoint_end_time, now)
    .await?;
  if !busy.is_empty() {
    return Err(CoreError::bad_request("appointment window is not free"));
  }

  let auction_id = store.insert_auction(seer_id, &spec).await?;
  info!(auction_id, seer_id, "auction created");
  notify::try_schedule_conclude(notifier, auction_id, spec.end_time).await;
  Ok(auction_id)
}

/// Edits an auction that has not opened and has no bids. The merged
/// result is re-validated as if it were being created now.
pub async fn edit_auction<S: Store, N: Notifier>(
  store: &S,
  notifier: &N,
  auction_id: i64,
  seer_id: i64,
  update: AuctionUpdate,
) -> CoreResult<()> {
  let auction = require_auction(store, auction_id).await?;
  if auction.seer_id != seer_id {
    return Err(CoreError::not_found("auction not found"));
  }
  let now = Utc::now();
  if auction.has_started(now) {
    return Err(CoreError::bad_request("auction has already started"));
  }
  if store.bid_count(auction_id).await? > 0 {
    return Err(CoreError::bad_request("auction already has bids"));
  }

  let next = update.apply(&auction);
  if next.start_time <= now {
    return Err(CoreError::bad_request("auction must start in the future"));
  }
  if !next.has_valid_times() {
    return Err(CoreError::bad_request("auction times are out of order"));
  }
  if next.initial_bid <= 0 || next.min_increment <= 0 {
    return Err(CoreError::bad_request("initial bid and increment must be positive"));
  }
  if (next.appoint_start_time, next.appoint_end_time) != (auction.appoint_start_time, auction.appoint_end_time) {
    let busy = store
      .busy_ranges(seer_id, next.appoint_start_time, next.appoint_end_time, now)
      .await?;
    // The window reserved by this auction itself is the only overlap
    // allowed to remain.
    let foreign = busy
      .iter()
      .any(|r| r.start != auction.appoint_start_time || r.end != auction.appoint_end_time);
    if foreign {
      return Err(CoreError::bad_request("appointment window is not free"));
    }
  }

  if !store.update_auction_if_unopened(auction_id, seer_id, now, &next).await? {
    return Err(CoreError::bad_request("auction can no longer be edited"));
  }
  info!(auction_id, seer_id, "auction edited");
  notify::try_schedule_conclude(notifier, auction_id, next.end_time).await;
  Ok(())
}

/// Deletes an auction that has not opened yet.
pub async fn cancel_auction<S: Store>(store: &S, auction_id: i64, seer_id: i64) -> CoreResult<()> {
  let now = Utc::now();
  if store.delete_auction_if_unstarted(auction_id, Some(seer_id), now).await? {
    info!(auction_id, seer_id, "auction cancelled");
    return Ok(());
  }
  let auction = require_auction(store, auction_id).await?;
  if auction.seer_id != seer_id {
    return Err(CoreError::not_found("auction not found"));
  }
  Err(CoreError::bad_request("auction has already started"))
}

/// Places a bid. The caller's coins are held before the bid is accepted;
/// on a lost race the hold is released immediately, and accepting a bid
/// releases the previous highest bidder's hold.
pub async fn bid<S: Store, N: Notifier>(
  store: &S,
  notifier: &N,
  auction_id: i64,
  user_id: i64,
  amount: i64,
) -> CoreResult<()> {
  let auction = require_auction(store, auction_id).await?;
  let now = Utc::now();
  if !auction.has_started(now) {
    return Err(CoreError::bad_request("auction has not opened yet"));
  }
  if auction.has_ended(now) {
    return Err(CoreError::bad_request("auction has ended"));
  }

  // Friendly rejections on the state visible now; the placement below
  // re-checks atomically and is the authority.
  match store.highest_bid(auction_id).await? {
    Some(top) if top.user_id == user_id => {
      return Err(CoreError::bad_request("already the highest bidder"));
    },
    Some(top) if amount < top.amount + auction.min_increment => {
      return Err(CoreError::bad_request("amount too low"));
    },
    None if amount < auction.initial_bid => {
      return Err(CoreError::bad_request("amount too low"));
    },
    _ => {},
  }

  // Hold first. If the placement then loses a race the hold is
  // compensated away, never left dangling.
  ledger::change_balance(
    store,
    user_id,
    -amount,
    TxnType::AuctionBid,
    TxnStatus::Hold,
    Some(auction_id),
  )
  .await?;
  match store.place_bid(&auction, user_id, amount).await? {
    BidPlacement::Accepted { displaced } => {
      // The displaced top comes from the placement itself, so the hold
      // released here belongs to whoever actually lost the top spot.
      if let Some(top) = displaced {
        ledger::settle_holds(store, top.user_id, auction_id, TxnType::AuctionBid, TxnStatus::Cancelled).await?;
        notify::try_notify(notifier, top.user_id, "outbid").await;
      }
      info!(auction_id, user_id, amount, "bid accepted");
      Ok(())
    },
    BidPlacement::Rejected => {
      ledger::settle_holds(store, user_id, auction_id, TxnType::AuctionBid, TxnStatus::Cancelled).await?;
      Err(CoreError::bad_request("amount too low"))
    },
  }
}

/// Concludes an ended auction: settles the winner's hold, books the
/// reserved window for them and pays the seer. Safe to call repeatedly;
/// the hold settlement is the idempotency gate, so the winner is charged
/// and the appointment created exactly once. Returns the appointment id,
/// or None when there was no winner or the work was already done.
pub async fn conclude_auction<S: Store, N: Notifier>(
  store: &S,
  notifier: &N,
  auction_id: i64,
) -> CoreResult<Option<i64>> {
  let auction = require_auction(store, auction_id).await?;
  if !auction.has_ended(Utc::now()) {
    return Err(CoreError::bad_request("auction has not ended"));
  }
  let Some(winner) = store.highest_bid(auction_id).await? else {
    info!(auction_id, "auction concluded with no bids");
    return Ok(None);
  };

  // The appointment goes in before the winner's hold is settled; the
  // hold settlement stays the idempotency gate, and every failure past
  // the insert compensates so the winner is never charged without the
  // appointment to show for it.
  let apmt_id = store
    .insert_appointment(&NewAppointment {
      client_id: winner.user_id,
      seer_id: auction.seer_id,
      offering_id: None,
      start_time: auction.appoint_start_time,
      end_time: auction.appoint_end_time,
      questions: Vec::new(),
      confirmation_code: util::confirmation_code(CONFIRMATION_CODE_LEN),
    })
    .await?;
  let settled =
    match ledger::settle_holds(store, winner.user_id, auction_id, TxnType::AuctionBid, TxnStatus::Completed).await {
      Ok(sum) => sum,
      Err(err) => {
        remove_appointment(store, apmt_id).await;
        return Err(err);
      },
    };
  if settled == 0 {
    // A concurrent conclusion already charged the winner and booked the
    // window.
    remove_appointment(store, apmt_id).await;
    return Ok(None);
  }
  if let Err(err) = ledger::change_balance(
    store,
    auction.seer_id,
    -settled,
    TxnType::AuctionBid,
    TxnStatus::Completed,
    Some(auction_id),
  )
  .await
  {
    remove_appointment(store, apmt_id).await;
    if let Err(refund) = ledger::change_balance(
      store,
      winner.user_id,
      -settled,
      TxnType::AuctionBid,
      TxnStatus::Completed,
      Some(auction_id),
    )
    .await
    {
      warn!(auction_id, winner = winner.user_id, error = %refund, "failed to refund winner after conclusion failure");
    }
    return Err(err);
  }
  info!(auction_id, winner = winner.user_id, apmt_id, amount = winner.amount, "auction concluded");
  notify::try_notify(notifier, winner.user_id, "auction won").await;
  Ok(Some(apmt_id))
}

async fn remove_appointment<S: Store>(store: &S, apmt_id: i64) {
  if let Err(err) = store.delete_appointment(apmt_id).await {
    warn!(apmt_id, error = %err, "failed to remove appointment while unwinding conclusion");
  }
}

/// Ends an open auction now and concludes it with the bids placed so
/// far.
pub async fn close_auction_early<S: Store, N: Notifier>(
  store: &S,
  notifier: &N,
  auction_id: i64,
  seer_id: i64,
) -> CoreResult<Option<i64>> {
  let now = Utc::now();
  let auction = require_auction(store, auction_id).await?;
  if auction.seer_id != seer_id {
    return Err(CoreError::not_found("auction not found"));
  }
  if store.close_auction(auction_id, now).await?.is_none() {
    return Err(CoreError::bad_request("auction is not open"));
  }
  info!(auction_id, seer_id, "auction closed early");
  conclude_auction(store, notifier, auction_id).await
}

#[cfg(test)]
mod tests {
  use chrono::Duration;
  use chrono::Utc;

  use super::bid;
  use super::cancel_auction;
  use super::close_auction_early;
  use super::conclude_auction;
  use super::create_auction;
  use super::edit_auction;
  use crate::models::AuctionSpec;
  use crate::models::AuctionUpdate;
  use crate::models::BidPlacement;
  use crate::models::TxnStatus;
  use crate::models::TxnType;
  use crate::notify::NoopNotifier;
  use crate::store::MemStore;
  use crate::store::Store;

  fn future_spec() -> AuctionSpec {
    let now = Utc::now();
    AuctionSpec {
      name: "evening reading".into(),
      start_time: now + Duration::hours(1),
      end_time: now + Duration::hours(2),
      appoint_start_time: now + Duration::hours(3),
      appoint_end_time: now + Duration::hours(4),
      initial_bid: 5_000,
      min_increment: 1_000,
    }
  }

  /// An auction already inside its bidding window, inserted directly so
  /// bids can be placed without waiting.
  fn open_spec() -> AuctionSpec {
    let now = Utc::now();
    AuctionSpec {
      name: "open reading".into(),
      start_time: now - Duration::hours(1),
      end_time: now + Duration::hours(1),
      appoint_start_time: now + Duration::hours(3),
      appoint_end_time: now + Duration::hours(4),
      initial_bid: 5_000,
      min_increment: 1_000,
    }
  }

  #[tokio::test]
  async fn creation_rejects_out_of_order_times() {
    let store = MemStore::new();
    let seer = store.add_seer(0);
    let mut spec = future_spec();
    spec.appoint_start_time = spec.end_time - Duration::minutes(1);
    let err = create_auction(&store, &NoopNotifier, seer, spec)
      .await
      .expect_err("invalid times");
    assert!(err.is_bad_request());
  }

  #[tokio::test]
  async fn creation_rejects_an_occupied_window() {
    let store = MemStore::new();
    let seer = store.add_seer(0);
    let first = create_auction(&store, &NoopNotifier, seer, future_spec())
      .await
      .expect("first auction");
    assert!(first > 0);

    let err = create_auction(&store, &NoopNotifier, seer, future_spec())
      .await
      .expect_err("window taken");
    assert!(err.is_bad_request());
  }

  #[tokio::test]
  async fn bids_must_climb_by_the_minimum_increment() {
    let store = MemStore::new();
    let seer = store.add_seer(0);
    let auction = store.insert_auction(seer, &open_spec()).await.expect("auction");
    let alice = store.add_user(50_000);
    let bob = store.add_user(50_000);
    let carol = store.add_user(50_000);

    bid(&store, &NoopNotifier, auction, alice, 10_000).await.expect("first bid");
    bid(&store, &NoopNotifier, auction, bob, 15_000).await.expect("second bid");
    let err = bid(&store, &NoopNotifier, auction, carol, 14_000)
      .await
      .expect_err("too low");
    assert!(err.is_bad_request());

    // Alice was outbid and refunded; Bob's hold is the only one live.
    assert_eq!(store.balance(alice).await.expect("balance"), Some(50_000));
    assert_eq!(store.balance(bob).await.expect("balance"), Some(35_000));
    assert_eq!(store.balance(carol).await.expect("balance"), Some(50_000));
    let top = store.highest_bid(auction).await.expect("highest").expect("present");
    assert_eq!((top.user_id, top.amount), (bob, 15_000));
  }

  #[tokio::test]
  async fn first_bid_must_meet_the_initial_price() {
    let store = MemStore::new();
    let seer = store.add_seer(0);
    let auction = store.insert_auction(seer, &open_spec()).await.expect("auction");
    let alice = store.add_user(50_000);

    let err = bid(&store, &NoopNotifier, auction, alice, 4_999)
      .await
      .expect_err("below initial");
    assert!(err.is_bad_request());
    bid(&store, &NoopNotifier, auction, alice, 5_000).await.expect("at initial");
  }

  #[tokio::test]
  async fn highest_bidder_cannot_raise_their_own_bid() {
    let store = MemStore::new();
    let seer = store.add_seer(0);
    let auction = store.insert_auction(seer, &open_spec()).await.expect("auction");
    let alice = store.add_user(50_000);

    bid(&store, &NoopNotifier, auction, alice, 10_000).await.expect("bid");
    let err = bid(&store, &NoopNotifier, auction, alice, 20_000)
      .await
      .expect_err("self outbid");
    assert!(err.is_bad_request());
    assert_eq!(store.balance(alice).await.expect("balance"), Some(40_000));
  }

  #[tokio::test]
  async fn bidding_outside_the_window_is_rejected() {
    let store = MemStore::new();
    let seer = store.add_seer(0);
    let alice = store.add_user(50_000);

    let unopened = store.insert_auction(seer, &future_spec()).await.expect("auction");
    assert!(bid(&store, &NoopNotifier, unopened, alice, 10_000).await.is_err());

    let mut spec = open_spec();
    spec.start_time = Utc::now() - Duration::hours(2);
    spec.end_time = Utc::now() - Duration::hours(1);
    let ended = store.insert_auction(seer, &spec).await.expect("auction");
    assert!(bid(&store, &NoopNotifier, ended, alice, 10_000).await.is_err());
  }

  #[tokio::test]
  async fn conclusion_charges_the_winner_exactly_once() {
    let store = MemStore::new();
    let seer = store.add_seer(0);
    let auction = store.insert_auction(seer, &open_spec()).await.expect("auction");
    let alice = store.add_user(50_000);
    bid(&store, &NoopNotifier, auction, alice, 10_000).await.expect("bid");

    let apmt = close_auction_early(&store, &NoopNotifier, auction, seer)
      .await
      .expect("close")
      .expect("appointment created");

    assert_eq!(store.balance(alice).await.expect("balance"), Some(40_000));
    assert_eq!(store.balance(seer).await.expect("balance"), Some(10_000));
    let won = store.appointment(apmt).await.expect("fetch").expect("exists");
    assert_eq!(won.client_id, alice);
    assert_eq!(won.offering_id, None);

    let again = conclude_auction(&store, &NoopNotifier, auction).await.expect("conclude");
    assert_eq!(again, None);
    assert_eq!(store.balance(alice).await.expect("balance"), Some(40_000));
    assert_eq!(store.balance(seer).await.expect("balance"), Some(10_000));

    let txns = store.transactions(alice).await.expect("transactions");
    assert_eq!(txns.len(), 1);
    assert_eq!(txns[0].status, TxnStatus::Completed);
  }

  #[tokio::test]
  async fn conclusion_with_no_bids_creates_nothing() {
    let store = MemStore::new();
    let seer = store.add_seer(0);
    let auction = store.insert_auction(seer, &open_spec()).await.expect("auction");
    let apmt = close_auction_early(&store, &NoopNotifier, auction, seer)
      .await
      .expect("close");
    assert_eq!(apmt, None);
    assert_eq!(store.balance(seer).await.expect("balance"), Some(0));
  }

  #[tokio::test]
  async fn closing_early_twice_is_rejected() {
    let store = MemStore::new();
    let seer = store.add_seer(0);
    let auction = store.insert_auction(seer, &open_spec()).await.expect("auction");
    close_auction_early(&store, &NoopNotifier, auction, seer)
      .await
      .expect("first close");
    let err = close_auction_early(&store, &NoopNotifier, auction, seer)
      .await
      .expect_err("second close");
    assert!(err.is_bad_request());
  }

  #[tokio::test]
  async fn editing_is_blocked_once_bids_exist() {
    let store = MemStore::new();
    let seer = store.add_seer(0);
    let auction = store.insert_auction(seer, &open_spec()).await.expect("auction");
    let alice = store.add_user(50_000);
    bid(&store, &NoopNotifier, auction, alice, 10_000).await.expect("bid");

    let update = AuctionUpdate {
      initial_bid: Some(6_000),
      ..AuctionUpdate::default()
    };
    let err = edit_auction(&store, &NoopNotifier, auction, seer, update)
      .await
      .expect_err("already started");
    assert!(err.is_bad_request());
  }

  #[tokio::test]
  async fn editing_an_unopened_auction_revalidates_times() {
    let store = MemStore::new();
    let seer = store.add_seer(0);
    let auction = create_auction(&store, &NoopNotifier, seer, future_spec())
      .await
      .expect("auction");

    let bad = AuctionUpdate {
      end_time: Some(Utc::now() + Duration::hours(5)),
      ..AuctionUpdate::default()
    };
    assert!(edit_auction(&store, &NoopNotifier, auction, seer, bad).await.is_err());

    let good = AuctionUpdate {
      initial_bid: Some(8_000),
      ..AuctionUpdate::default()
    };
    edit_auction(&store, &NoopNotifier, auction, seer, good).await.expect("edit");
    let fetched = store.auction(auction).await.expect("fetch").expect("exists");
    assert_eq!(fetched.initial_bid, 8_000);
  }

  #[tokio::test]
  async fn displacement_is_reported_by_the_placement_itself() {
    let store = MemStore::new();
    let seer = store.add_seer(0);
    let auction_id = store.insert_auction(seer, &open_spec()).await.expect("auction");
    let auction = store.auction(auction_id).await.expect("fetch").expect("exists");
    let alice = store.add_user(50_000);
    let carol = store.add_user(50_000);
    let dave = store.add_user(50_000);

    bid(&store, &NoopNotifier, auction_id, alice, 10_000).await.expect("first bid");
    bid(&store, &NoopNotifier, auction_id, carol, 15_000).await.expect("second bid");

    // A bidder whose own top-bid read predates carol's bid still learns
    // who they displaced from the placement and releases that hold.
    store
      .change_balance(dave, -20_000, TxnType::AuctionBid, TxnStatus::Hold, Some(auction_id))
      .await
      .expect("hold");
    let placement = store.place_bid(&auction, dave, 20_000).await.expect("place");
    let BidPlacement::Accepted {
      displaced: Some(displaced),
    } = placement
    else {
      panic!("expected an accepted bid displacing the previous top");
    };
    assert_eq!((displaced.user_id, displaced.amount), (carol, 15_000));
    store
      .settle_holds(displaced.user_id, auction_id, TxnType::AuctionBid, TxnStatus::Cancelled)
      .await
      .expect("refund");
    assert_eq!(store.balance(carol).await.expect("balance"), Some(50_000));
    assert_eq!(store.balance(dave).await.expect("balance"), Some(30_000));

    // Below the increment over the new top the placement refuses.
    let rejected = store.place_bid(&auction, alice, 20_500).await.expect("place");
    assert_eq!(rejected, BidPlacement::Rejected);
  }

  #[tokio::test]
  async fn failed_seer_credit_unwinds_the_conclusion() {
    let store = MemStore::new();
    let seer = store.add_seer(0);
    let spec = open_spec();
    let auction = store.insert_auction(seer, &spec).await.expect("auction");
    let alice = store.add_user(50_000);
    bid(&store, &NoopNotifier, auction, alice, 10_000).await.expect("bid");

    store.deactivate_user(seer);
    let err = close_auction_early(&store, &NoopNotifier, auction, seer)
      .await
      .expect_err("credit fails");
    assert!(err.is_not_found());

    // The winner got their money back and the window is free again.
    assert_eq!(store.balance(alice).await.expect("balance"), Some(50_000));
    let busy = store
      .busy_ranges(seer, spec.appoint_start_time, spec.appoint_end_time, Utc::now())
      .await
      .expect("busy ranges");
    assert!(busy.is_empty());
    assert_eq!(conclude_auction(&store, &NoopNotifier, auction).await.expect("retry"), None);
  }

  #[tokio::test]
  async fn the_update_itself_refuses_opened_or_bid_on_auctions() {
    let store = MemStore::new();
    let seer = store.add_seer(0);
    let alice = store.add_user(50_000);

    let opened_id = store.insert_auction(seer, &open_spec()).await.expect("auction");
    let opened = store.auction(opened_id).await.expect("fetch").expect("exists");
    assert!(
      !store
        .update_auction_if_unopened(opened_id, seer, Utc::now(), &opened)
        .await
        .expect("update")
    );

    let bid_on_id = store.insert_auction(seer, &future_spec()).await.expect("auction");
    let bid_on = store.auction(bid_on_id).await.expect("fetch").expect("exists");
    store.place_bid(&bid_on, alice, 10_000).await.expect("place");
    assert!(
      !store
        .update_auction_if_unopened(bid_on_id, seer, Utc::now(), &bid_on)
        .await
        .expect("update")
    );

    let clean_id = store.insert_auction(seer, &future_spec()).await.expect("auction");
    let clean = store.auction(clean_id).await.expect("fetch").expect("exists");
    assert!(
      store
        .update_auction_if_unopened(clean_id, seer, Utc::now(), &clean)
        .await
        .expect("update")
    );
  }

  #[tokio::test]
  async fn only_unstarted_auctions_can_be_cancelled() {
    let store = MemStore::new();
    let seer = store.add_seer(0);
    let unopened = store.insert_auction(seer, &future_spec()).await.expect("auction");
    cancel_auction(&store, unopened, seer).await.expect("cancel");
    assert!(store.auction(unopened).await.expect("fetch").is_none());

    let open = store.insert_auction(seer, &open_spec()).await.expect("auction");
    let err = cancel_auction(&store, open, seer).await.expect_err("already started");
    assert!(err.is_bad_request());
  }
}
