//! Ledger Property Tests
//!
//! End-to-end checks of the admission and commit protocol against the
//! in-memory store: concurrency, sticky limits, month rollover, failed calls
//! and hard reservations.
//!
//! Run: cargo nextest run --test ledger_properties

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use chrono::{TimeZone, Utc};
use futures::future::join_all;
use usage_ledger::{
    DenyReason, EnforcementMode, Error, LedgerConfig, LedgerStore, ManualClock,
    MemoryLedgerStore, OperationType, PeriodKey, SubscriptionTier, TieredCeilings, UsageLedger,
    UserId,
};

fn user(id: &str) -> UserId {
    UserId::new(id).unwrap()
}

fn clock_at(year: i32, month: u32, day: u32, h: u32, m: u32, s: u32) -> ManualClock {
    ManualClock::new(Utc.with_ymd_and_hms(year, month, day, h, m, s).unwrap())
}

fn ledger_with(mode: EnforcementMode, ceiling: u64, clock: &ManualClock) -> Arc<UsageLedger> {
    Arc::new(
        UsageLedger::builder()
            .clock(Arc::new(clock.clone()))
            .config(
                LedgerConfig::new()
                    .enforcement(mode)
                    .default_ceiling_cents(ceiling),
            )
            .build()
            .unwrap(),
    )
}

async fn wait_for_reserved(ledger: &UsageLedger, user: &UserId, expected: u64) -> u64 {
    let mut reserved = u64::MAX;
    for _ in 0..50 {
        reserved = ledger.get_summary(user).await.unwrap().reserved_cents;
        if reserved == expected {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    reserved
}

// =============================================================================
// Concurrency
// =============================================================================

mod concurrency_tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_no_lost_updates_under_concurrent_commits() {
        let clock = clock_at(2026, 4, 12, 10, 0, 0);
        let ledger = ledger_with(EnforcementMode::SoftCap, 100_000, &clock);
        let alice = user("alice");

        let handles: Vec<_> = (0..64)
            .map(|i| {
                let ledger = Arc::clone(&ledger);
                let alice = alice.clone();
                let op = OperationType::ALL[i % OperationType::ALL.len()];
                tokio::spawn(async move { ledger.record_commit(&alice, op, 3).await })
            })
            .collect();

        for result in join_all(handles).await {
            result.unwrap().unwrap();
        }

        let summary = ledger.get_summary(&alice).await.unwrap();
        assert_eq!(summary.total_cost_cents, 192);
        assert_eq!(summary.commit_count, 64);
        let category_total: u64 = summary.per_category.values().map(|c| c.cost_cents).sum();
        assert_eq!(category_total, summary.total_cost_cents);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_period_created_once_under_concurrent_creators() {
        let store = Arc::new(MemoryLedgerStore::new());
        let key = PeriodKey::new(user("bob"), 2026, 4).unwrap();

        let handles: Vec<_> = (0..32u64)
            .map(|i| {
                let store = Arc::clone(&store);
                let key = key.clone();
                tokio::spawn(async move { store.create_if_absent(&key, 100 + i).await })
            })
            .collect();

        let periods: Vec<_> = join_all(handles)
            .await
            .into_iter()
            .map(|r| r.unwrap().unwrap())
            .collect();

        let ceiling = periods[0].ceiling_cents;
        assert!(periods.iter().all(|p| p.ceiling_cents == ceiling));
        assert!(periods.iter().all(|p| p.created_at == periods[0].created_at));
        assert_eq!(store.count(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 3)]
    async fn test_three_concurrent_80_cent_commits_against_200() {
        let clock = clock_at(2026, 4, 1, 0, 0, 0);
        let ledger = ledger_with(EnforcementMode::SoftCap, 200, &clock);
        let carol = user("carol");

        let reservations = join_all(
            (0..3).map(|_| ledger.check_and_reserve(&carol, OperationType::MealPlan, 80)),
        )
        .await;
        let commits = reservations
            .into_iter()
            .map(|r| r.unwrap().commit(80));
        let results = join_all(commits).await;

        assert!(results.iter().all(|r| r.is_ok()));
        let summary = ledger.get_summary(&carol).await.unwrap();
        assert_eq!(summary.total_cost_cents, 240);
        assert!(summary.limit_reached);
        assert!(summary.limit_reached_at.is_some());
        assert_eq!(summary.remaining_cents, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_hard_reservation_never_overshoots() {
        let clock = clock_at(2026, 4, 20, 18, 0, 0);
        let ledger = ledger_with(EnforcementMode::HardReservation, 200, &clock);
        let dave = user("dave");
        let invoked = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..12)
            .map(|_| {
                let ledger = Arc::clone(&ledger);
                let dave = dave.clone();
                let invoked = Arc::clone(&invoked);
                tokio::spawn(async move {
                    ledger
                        .execute(&dave, OperationType::BodyScan, 40, || async move {
                            invoked.fetch_add(1, Ordering::SeqCst);
                            Ok::<_, std::io::Error>(((), 40))
                        })
                        .await
                })
            })
            .collect();

        let outcomes: Vec<_> = join_all(handles)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();

        let admitted = outcomes.iter().filter(|o| o.is_ok()).count();
        assert_eq!(admitted, 5);
        assert_eq!(invoked.load(Ordering::SeqCst), 5);
        assert!(
            outcomes
                .iter()
                .filter_map(|o| o.as_ref().err())
                .all(|e| e.is_resource_limit())
        );

        let summary = ledger.get_summary(&dave).await.unwrap();
        assert_eq!(summary.total_cost_cents, 200);
        assert_eq!(summary.reserved_cents, 0);
        assert!(summary.limit_reached);
    }
}

// =============================================================================
// Limits and admission
// =============================================================================

mod limit_tests {
    use super::*;

    #[tokio::test]
    async fn test_limit_flag_is_sticky() {
        let clock = clock_at(2026, 5, 3, 9, 0, 0);
        let ledger = ledger_with(EnforcementMode::SoftCap, 100, &clock);
        let erin = user("erin");

        ledger
            .record_commit(&erin, OperationType::Chat, 60)
            .await
            .unwrap();
        let crossed = ledger
            .record_commit(&erin, OperationType::ScanImage, 45)
            .await
            .unwrap();
        assert!(crossed.limit_reached);

        let late = ledger.record_commit(&erin, OperationType::Chat, 1).await;
        assert!(matches!(late, Err(Error::LimitReached { .. })));

        clock.advance(chrono::Duration::days(3));
        let summary = ledger.get_summary(&erin).await.unwrap();
        assert!(summary.limit_reached);
        assert_eq!(summary.total_cost_cents, 105);
        assert!(summary.status.is_exceeded());
        assert_eq!(ledger.metrics().commits_rejected, 1);
    }

    #[tokio::test]
    async fn test_denial_blocks_spend() {
        let clock = clock_at(2026, 5, 3, 9, 0, 0);
        let ledger = ledger_with(EnforcementMode::HardReservation, 50, &clock);
        let frank = user("frank");
        ledger
            .record_commit(&frank, OperationType::MealPlan, 50)
            .await
            .unwrap();

        let invoked = AtomicBool::new(false);
        let result = ledger
            .execute(&frank, OperationType::Chat, 1, || async {
                invoked.store(true, Ordering::SeqCst);
                Ok::<_, std::io::Error>(("reply", 1))
            })
            .await;

        match result {
            Err(Error::BudgetExceeded { reason, used, ceiling }) => {
                assert_eq!(reason, DenyReason::AlreadyAtLimit);
                assert_eq!((used, ceiling), (50, 50));
            }
            other => panic!("expected BudgetExceeded, got {:?}", other),
        }
        assert!(!invoked.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_would_exceed_denial_is_user_facing() {
        let clock = clock_at(2026, 5, 3, 9, 0, 0);
        let ledger = ledger_with(EnforcementMode::SoftCap, 200, &clock);
        let gina = user("gina");
        ledger
            .record_commit(&gina, OperationType::ScanImage, 195)
            .await
            .unwrap();

        let err = ledger
            .check_and_reserve(&gina, OperationType::BodyScan, 6)
            .await
            .unwrap_err();
        assert_eq!(err.deny_reason(), Some(DenyReason::WouldExceed));
        assert!(err.user_message().contains("Upgrade"));

        // A smaller request still fits.
        let ok = ledger
            .check_and_reserve(&gina, OperationType::Chat, 5)
            .await
            .unwrap();
        ok.commit(5).await.unwrap();
        assert!(ledger.get_summary(&gina).await.unwrap().limit_reached);
    }

    #[tokio::test]
    async fn test_failed_ai_calls_are_free() {
        let clock = clock_at(2026, 5, 28, 14, 0, 0);
        let ledger = ledger_with(EnforcementMode::HardReservation, 200, &clock);
        let hank = user("hank");
        ledger
            .record_commit(&hank, OperationType::ScanImage, 190)
            .await
            .unwrap();

        let outcome = ledger
            .execute(&hank, OperationType::ScanImage, 10, || async {
                Err::<((), u64), _>(std::io::Error::other("vision model timeout"))
            })
            .await
            .unwrap();
        assert!(outcome.is_err());

        let summary = ledger.get_summary(&hank).await.unwrap();
        assert_eq!(summary.total_cost_cents, 190);
        assert_eq!(summary.reserved_cents, 0);
        assert!(!summary.limit_reached);
    }
}

// =============================================================================
// Month rollover and ceilings
// =============================================================================

mod period_tests {
    use super::*;

    #[tokio::test]
    async fn test_commit_after_midnight_lands_in_new_month() {
        for mode in [EnforcementMode::SoftCap, EnforcementMode::HardReservation] {
            let clock = clock_at(2026, 1, 31, 23, 59, 58);
            let ledger = ledger_with(mode, 200, &clock);
            let ivan = user("ivan");

            let reservation = ledger
                .check_and_reserve(&ivan, OperationType::MealPlan, 5)
                .await
                .unwrap();
            assert_eq!(reservation.admitted_in().month, 1);

            clock.advance(chrono::Duration::seconds(5));
            let period = reservation.commit(5).await.unwrap();
            assert_eq!((period.key.year, period.key.month), (2026, 2));

            let january = ledger.summary_for(&ivan, 2026, 1).await.unwrap();
            assert_eq!(january.total_cost_cents, 0);
            assert_eq!(january.reserved_cents, 0);
            let february = ledger.get_summary(&ivan).await.unwrap();
            assert_eq!(february.total_cost_cents, 5);
        }
    }

    #[tokio::test]
    async fn test_new_month_starts_fresh_after_limit() {
        let clock = clock_at(2026, 11, 30, 12, 0, 0);
        let ledger = ledger_with(EnforcementMode::HardReservation, 10, &clock);
        let judy = user("judy");
        ledger
            .record_commit(&judy, OperationType::BodyScan, 10)
            .await
            .unwrap();
        assert!(
            ledger
                .check_and_reserve(&judy, OperationType::Chat, 1)
                .await
                .is_err()
        );

        clock.set(Utc.with_ymd_and_hms(2026, 12, 1, 0, 0, 1).unwrap());
        let reservation = ledger
            .check_and_reserve(&judy, OperationType::Chat, 1)
            .await
            .unwrap();
        reservation.commit(1).await.unwrap();

        let december = ledger.get_summary(&judy).await.unwrap();
        assert_eq!((december.year, december.month), (2026, 12));
        assert_eq!(december.total_cost_cents, 1);
        assert!(!december.limit_reached);
    }

    #[tokio::test]
    async fn test_ceiling_fixed_for_the_month_after_upgrade() {
        let clock = clock_at(2026, 7, 10, 8, 0, 0);
        let ceilings = Arc::new(TieredCeilings::new(100, 1_000));
        let ledger = UsageLedger::builder()
            .clock(Arc::new(clock.clone()))
            .ceilings(ceilings.clone())
            .build()
            .unwrap();
        let kim = user("kim");

        ledger
            .record_commit(&kim, OperationType::Chat, 20)
            .await
            .unwrap();
        ceilings.set_tier(kim.clone(), SubscriptionTier::Premium);

        let july = ledger.get_summary(&kim).await.unwrap();
        assert_eq!(july.ceiling_cents, 100);
        assert_eq!(july.remaining_cents, 80);

        clock.set(Utc.with_ymd_and_hms(2026, 8, 1, 0, 0, 0).unwrap());
        let august = ledger.get_summary(&kim).await.unwrap();
        assert_eq!(august.ceiling_cents, 1_000);
        assert_eq!(august.total_cost_cents, 0);
    }
}

// =============================================================================
// Hard reservations
// =============================================================================

mod reservation_tests {
    use super::*;
    use usage_ledger::ReservationState;

    #[tokio::test]
    async fn test_dropped_reservation_is_released() {
        let clock = clock_at(2026, 6, 5, 12, 0, 0);
        let ledger = ledger_with(EnforcementMode::HardReservation, 200, &clock);
        let liam = user("liam");

        {
            let reservation = ledger
                .check_and_reserve(&liam, OperationType::MealPlan, 50)
                .await
                .unwrap();
            assert_eq!(reservation.state(), ReservationState::Admitted);
            assert_eq!(ledger.get_summary(&liam).await.unwrap().reserved_cents, 50);
        }

        assert_eq!(wait_for_reserved(&ledger, &liam, 0).await, 0);
        assert_eq!(ledger.get_summary(&liam).await.unwrap().total_cost_cents, 0);
        assert_eq!(ledger.metrics().open_reservations, 0);
    }

    #[tokio::test]
    async fn test_retried_commit_charges_once() {
        let clock = clock_at(2026, 6, 5, 12, 0, 0);
        let ledger = ledger_with(EnforcementMode::HardReservation, 200, &clock);
        let mia = user("mia");

        for _ in 0..3 {
            ledger
                .record_commit_with_key(&mia, OperationType::RecipeSuggestion, 2, "req-7f3a")
                .await
                .unwrap();
        }

        let summary = ledger.get_summary(&mia).await.unwrap();
        assert_eq!(summary.total_cost_cents, 2);
        assert_eq!(summary.commit_count, 1);
        assert_eq!(ledger.metrics().commits_duplicate, 2);
    }

    #[tokio::test]
    async fn test_expired_reservations_are_swept() {
        let clock = clock_at(2026, 6, 5, 12, 0, 0);
        let ledger = Arc::new(
            UsageLedger::builder()
                .clock(Arc::new(clock.clone()))
                .config(LedgerConfig::new().reservation_ttl(std::time::Duration::from_secs(600)))
                .build()
                .unwrap(),
        );
        let noah = user("noah");

        let reservation = ledger
            .check_and_reserve(&noah, OperationType::BodyScan, 6)
            .await
            .unwrap();
        // Simulate a handler that died without committing or releasing.
        std::mem::forget(reservation);

        clock.advance(chrono::Duration::minutes(5));
        assert_eq!(ledger.release_expired_reservations().await.unwrap(), 0);

        clock.advance(chrono::Duration::minutes(6));
        assert_eq!(ledger.release_expired_reservations().await.unwrap(), 1);
        assert_eq!(ledger.get_summary(&noah).await.unwrap().reserved_cents, 0);
        assert_eq!(ledger.metrics().reservations_expired, 1);
    }

    #[tokio::test]
    async fn test_commit_above_estimate_is_recorded_in_full() {
        let clock = clock_at(2026, 6, 5, 12, 0, 0);
        let ledger = ledger_with(EnforcementMode::HardReservation, 200, &clock);
        let olga = user("olga");

        let reservation = ledger
            .check_and_reserve(&olga, OperationType::Chat, 1)
            .await
            .unwrap();
        let period = reservation.commit(3).await.unwrap();

        assert_eq!(period.total_cost_cents, 3);
        assert_eq!(period.reserved_cents, 0);
    }
}

// =============================================================================
// Configuration
// =============================================================================

mod config_tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn test_ledger_from_config_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "enforcement": "soft_cap",
                "default_ceiling_cents": 30,
                "allowed_operations": ["scan_image", "chat"],
                "retry": {{ "max_retries": 1, "initial_backoff_ms": 5, "max_backoff_ms": 20 }}
            }}"#
        )
        .unwrap();

        let config = LedgerConfig::from_file(file.path()).unwrap();
        config.validate().unwrap();
        assert_eq!(config.enforcement, EnforcementMode::SoftCap);
        assert_eq!(config.retry.max_retries, 1);

        let ledger = UsageLedger::builder().config(config).build().unwrap();
        let pat = user("pat");
        let err = ledger
            .check_and_reserve_default(&pat, OperationType::MealPlan)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::OperationNotAllowed(OperationType::MealPlan)));

        let reservation = ledger
            .check_and_reserve_default(&pat, OperationType::ScanImage)
            .await
            .unwrap();
        reservation.commit(4).await.unwrap();
        assert_eq!(ledger.get_summary(&pat).await.unwrap().remaining_cents, 26);
    }

    #[test]
    fn test_summary_of_untouched_user() {
        let ledger = UsageLedger::builder().build().unwrap();
        let summary = tokio_test::block_on(ledger.get_summary(&user("quinn"))).unwrap();

        assert_eq!(summary.total_cost_cents, 0);
        assert_eq!(summary.ceiling_cents, 200);
        assert!(summary.per_category.is_empty());
    }

    #[test]
    fn test_invalid_config_file_is_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "enforcement": "unlimited" }}"#).unwrap();
        assert!(LedgerConfig::from_file(file.path()).is_err());
    }
}
