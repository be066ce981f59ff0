use tracing::{debug, info};

use crate::bus::Bus;
use crate::scheduler::Scheduler;

/// Log a one-line summary of bus activity
pub fn log_heartbeat(bus: &Bus) {
    let metrics = bus.metrics();
    let accepted: u64 = metrics.accepted.values().sum();
    let dropped: u64 = metrics.dropped.values().sum();
    let overflowed: u64 = metrics.overflowed.values().sum();
    info!(
        "Heartbeat: {} links, {} sources tracked, {} lanes open, {} accepted, {} dropped, {} overflowed",
        bus.links().len(),
        bus.tracked_sources(),
        bus.open_lanes(),
        accepted,
        dropped,
        overflowed
    );
}

/// Forget refilled rate buckets and close lanes to unlinked destinations.
/// Buckets that have refilled are indistinguishable from new ones.
pub fn prune_idle_state(bus: &Bus) {
    let buckets = bus.prune_idle_buckets();
    let lanes = bus.prune_idle_lanes();
    debug!(
        "Pruned {} idle rate buckets and {} delivery lanes",
        buckets, lanes
    );
}

/// Register built-in background tasks
pub async fn register_builtin_tasks(scheduler: &mut Scheduler) -> anyhow::Result<()> {
    scheduler
        .every("0 0 * * * *", "heartbeat", log_heartbeat)
        .await?;
    scheduler
        .every("0 */10 * * * *", "prune-idle-state", prune_idle_state)
        .await?;
    Ok(())
}
