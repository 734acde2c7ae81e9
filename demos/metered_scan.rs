//! Metered Food Scan Demo
//!
//! Walks a free-tier user through a month of food scans against a small
//! ceiling: admitted scans, a failed scan that costs nothing, and the
//! refusal once the allowance is used up.
//!
//! Run: cargo run --example metered_scan

use std::sync::Arc;

use usage_ledger::{
    EnforcementMode, LedgerConfig, OperationType, SubscriptionTier, TieredCeilings, UsageLedger,
    UserId,
};

#[derive(Debug)]
struct VisionError(&'static str);

impl std::fmt::Display for VisionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.0)
    }
}

/// Stand-in for the vision model: returns a label and what the call cost.
async fn scan_photo(photo: &str) -> Result<(String, u64), VisionError> {
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    if photo.ends_with(".heic") {
        return Err(VisionError("unsupported image format"));
    }
    Ok((format!("{}: 520 kcal", photo.trim_end_matches(".jpg")), 4))
}

#[tokio::main]
async fn main() -> Result<(), usage_ledger::Error> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let ceilings = Arc::new(TieredCeilings::new(12, 500));
    let ledger = UsageLedger::builder()
        .ceilings(ceilings.clone())
        .config(LedgerConfig::from_env()?.enforcement(EnforcementMode::HardReservation))
        .build()?;

    let free = UserId::new("free-user")?;
    let premium = UserId::new("premium-user")?;
    ceilings.set_tier(premium.clone(), SubscriptionTier::Premium);

    println!("=== Free tier ===");
    for photo in ["salmon.jpg", "ramen.heic", "salad.jpg", "burger.jpg", "pancakes.jpg"] {
        let outcome = ledger
            .execute(&free, OperationType::ScanImage, 4, || scan_photo(photo))
            .await;
        match outcome {
            Ok(Ok(billed)) => println!("  {} (billed {}¢)", billed.value, billed.cost_cents),
            Ok(Err(e)) => println!("  {} failed: {} (not billed)", photo, e),
            Err(e) if e.is_resource_limit() => println!("  {} refused: {}", photo, e.user_message()),
            Err(e) => return Err(e),
        }
    }

    println!("\n=== Premium tier ===");
    let reservation = ledger
        .check_and_reserve_default(&premium, OperationType::MealPlan)
        .await?;
    reservation.commit(5).await?;

    for user in [&free, &premium] {
        let summary = ledger.get_summary(user).await?;
        println!(
            "{}: {}¢ of {}¢ used ({:.0}%), limit reached: {}",
            user,
            summary.total_cost_cents,
            summary.ceiling_cents,
            summary.usage_percent,
            summary.limit_reached
        );
    }

    let metrics = ledger.metrics();
    println!(
        "\nadmitted={} denied={} committed={}¢",
        metrics.admitted, metrics.denied, metrics.committed_cents
    );
    Ok(())
}
