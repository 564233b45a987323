//! Global command - Run a standalone global component manager

use colored::*;
use mtask_core::communication::network::{TcpTransport, Transport};
use mtask_core::error::{MtaskError, MtaskResult};
use mtask_core::manager::GlobalManager;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Serve the registry on `listen` until Ctrl+C
pub fn run_global(listen: &str, connect_timeout: Duration) -> MtaskResult<()> {
    let transport: Arc<dyn Transport> = TcpTransport::new(connect_timeout)?;
    let global = Arc::new(GlobalManager::new());
    let address = global.serve(&transport, listen)?;

    println!(
        "{} Global component manager listening on {}",
        "[MTASK]".green().bold(),
        address.white().bold()
    );
    println!("  {} Press Ctrl+C to stop", "Tip:".dimmed());

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })
    .map_err(|e| MtaskError::Internal(format!("cannot install Ctrl+C handler: {}", e)))?;

    let mut last = (0, 0, 0);
    while running.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(200));
        let now = (
            global.processes().len(),
            global.components(None).len(),
            global.connections().len(),
        );
        if now != last {
            tracing::info!(
                processes = now.0,
                components = now.1,
                connections = now.2,
                "registry changed"
            );
            last = now;
        }
    }

    println!("\n{} Shutting down global manager...", "[MTASK]".yellow().bold());
    transport.stop(&address);
    Ok(())
}
