use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;

use docket::config::Config;
use docket::engine::Engine;
use docket::notify::NotifyHub;
use docket::store;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = Config::from_env();
    docket::observability::init(config.metrics_port)?;

    std::fs::create_dir_all(&config.data_dir)?;
    let snapshot = store::load_snapshot(&config.data_dir)?;
    info!(
        "loaded {} providers, {} bookings from {}",
        snapshot.providers.len(),
        snapshot.bookings.len(),
        config.data_dir.display()
    );
    let engine = Engine::from_snapshot(snapshot, Arc::new(NotifyHub::new()));

    let today = chrono::Local::now().date_naive();
    let providers = engine.list_providers().await;
    if providers.is_empty() {
        println!("no providers in {}", config.data_dir.display());
    }
    for p in providers {
        println!("{} {} ({}) [{}]", p.name, p.title, p.subject, p.id);
        let dates = engine.available_dates(p.id, today, config.report_days).await?;
        if dates.is_empty() {
            println!("  no clinic days in the next {} days", config.report_days);
        }
        for date in dates {
            println!("  {date}");
            for slot in engine.slot_board(p.id, date).await? {
                let mark = if slot.is_full() { " full" } else { "" };
                println!("    {}  {}/{}{mark}", slot.key, slot.booked, slot.capacity);
            }
        }
    }

    // Rewrite so skipped records do not linger on disk.
    store::save_snapshot(&config.data_dir, &engine.snapshot().await)?;
    info!("snapshot saved");
    Ok(())
}
