use portbridge_core::{Config, Paths};
use portbridge_storage::StorageAreas;
use portbridge_worker::{cleanup_all_pending_requests, PendingRequestStore};

fn open_store() -> anyhow::Result<PendingRequestStore> {
    let paths = Paths::new();
    let config = Config::load_or_default(&paths)?;
    let areas = StorageAreas::open(&paths);
    Ok(PendingRequestStore::new(areas.local, &config.pending.storage_key))
}

pub async fn list(kind: Option<String>, json: bool) -> anyhow::Result<()> {
    let store = open_store()?;
    let requests = store.list(kind.as_deref()).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&requests)?);
        return Ok(());
    }

    if requests.is_empty() {
        println!("No pending requests.");
        return Ok(());
    }

    println!(
        "{:<38} {:<20} {:<8} {:<20} ROUTABLE",
        "ID", "TYPE", "TAB", "CREATED"
    );
    for r in &requests {
        let tab = r
            .tab_id
            .map(|t| t.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<38} {:<20} {:<8} {:<20} {}",
            r.request_id,
            r.kind,
            tab,
            r.created_at_utc.format("%Y-%m-%d %H:%M:%S"),
            if r.is_routable() { "yes" } else { "no" }
        );
        if let Some(url) = &r.tab_url {
            println!("  {}", url);
        }
    }
    println!();
    println!("{} request(s)", requests.len());
    Ok(())
}

pub async fn clear(reason: &str) -> anyhow::Result<()> {
    let store = open_store()?;
    // Surface an unreadable queue here; the cleanup itself only logs.
    store.snapshot().await?;
    let removed = cleanup_all_pending_requests(&store, reason).await;
    println!("Removed {} pending request(s).", removed.len());
    Ok(())
}
