use portbridge_core::{Config, Paths};
use portbridge_storage::StorageAreas;
use portbridge_worker::PendingRequestStore;

pub async fn run() -> anyhow::Result<()> {
    let paths = Paths::new();

    println!("portbridge status");
    println!("=================");
    println!();

    let config_path = paths.config_file();
    let config_exists = config_path.exists();
    println!(
        "Config:    {} {}",
        config_path.display(),
        if config_exists { "✓" } else { "(defaults)" }
    );
    let storage_dir = paths.storage_dir();
    println!(
        "Storage:   {} {}",
        storage_dir.display(),
        if storage_dir.exists() { "✓" } else { "✗ (not created yet)" }
    );

    let config = Config::load_or_default(&paths)?;
    println!();
    println!("Listen:            {}:{}", config.gateway.host, config.gateway.port);
    println!("RPC timeout:       {} ms", config.rpc.call_timeout_ms);
    println!(
        "Inactivity lock:   {} s (checked every {} s)",
        config.session.inactivity_timeout_secs,
        config.session.check_interval().as_secs()
    );
    println!("Lock on sys lock:  {}", config.session.lock_on_system_idle);
    println!("Pending max age:   {} s", config.pending.max_age_secs);

    let areas = StorageAreas::open(&paths);
    let store = PendingRequestStore::new(areas.local, &config.pending.storage_key);
    println!();
    match store.snapshot().await {
        Ok(pending) => {
            println!("Pending requests:  {}", pending.len());
            let mut kinds: Vec<&str> = pending.iter().map(|r| r.kind.as_str()).collect();
            kinds.sort_unstable();
            kinds.dedup();
            for kind in kinds {
                println!("  {:<20} {}", kind, pending.of_type(kind).count());
            }
        }
        Err(e) => println!("Pending requests:  ✗ unreadable ({})", e),
    }
    Ok(())
}
