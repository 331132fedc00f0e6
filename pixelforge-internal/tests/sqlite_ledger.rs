//! Points ledger invariants against a file-backed SQLite database with a real connection pool.

use std::sync::Arc;

use futures::future::join_all;
use pixelforge_internal::error::ErrorDetails;
use pixelforge_internal::ledger::LedgerConnectionInfo;
use pixelforge_internal::points::PointsLedger;

async fn file_ledger(dir: &tempfile::TempDir) -> PointsLedger {
    let url = format!("sqlite://{}", dir.path().join("ledger.db").display());
    PointsLedger::new(Arc::new(
        LedgerConnectionInfo::new_sqlite(&url).await.unwrap(),
    ))
}

#[tokio::test]
async fn test_concurrent_deductions_never_go_negative() {
    let dir = tempfile::tempdir().unwrap();
    let points = file_ledger(&dir).await;
    points
        .credit_points("user-1", 5, "purchase", "order-1")
        .await
        .unwrap();

    let results = join_all((0..20).map(|i| {
        let points = points.clone();
        async move {
            points
                .deduct_points("user-1", 1, "generation", &format!("generation:{i}"))
                .await
        }
    }))
    .await;

    let succeeded = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(succeeded, 5);
    for result in results.iter().filter_map(|r| r.as_ref().err()) {
        assert!(matches!(
            result.get_details(),
            ErrorDetails::InsufficientPoints {
                required: 1,
                available: 0
            }
        ));
    }
    assert_eq!(points.balance("user-1").await.unwrap(), 0);
    assert_eq!(points.transactions("user-1", 100).await.unwrap().len(), 6);
}

#[tokio::test]
async fn test_concurrent_replays_charge_once() {
    let dir = tempfile::tempdir().unwrap();
    let points = file_ledger(&dir).await;
    points
        .credit_points("user-2", 10, "purchase", "order-2")
        .await
        .unwrap();

    let results = join_all((0..8).map(|_| {
        let points = points.clone();
        async move {
            points
                .deduct_points("user-2", 3, "generation", "generation:same")
                .await
                .unwrap()
        }
    }))
    .await;

    assert_eq!(results.iter().filter(|d| !d.replayed).count(), 1);
    let transaction_id = results[0].transaction_id;
    assert!(results.iter().all(|d| d.transaction_id == transaction_id));
    assert_eq!(points.balance("user-2").await.unwrap(), 7);
}

#[tokio::test]
async fn test_balances_survive_reconnect() {
    let dir = tempfile::tempdir().unwrap();
    {
        let points = file_ledger(&dir).await;
        points
            .credit_points("user-3", 25, "purchase", "order-3")
            .await
            .unwrap();
        points
            .deduct_points("user-3", 4, "generation", "generation:a")
            .await
            .unwrap();
    }

    let points = file_ledger(&dir).await;
    assert_eq!(points.balance("user-3").await.unwrap(), 21);
    let replay = points
        .deduct_points("user-3", 4, "generation", "generation:a")
        .await
        .unwrap();
    assert!(replay.replayed);
    assert_eq!(replay.new_balance, 21);
}
