use tracing::debug;

/// Lower bound on rows fetched per snapshot batch.
pub const MIN_SNAPSHOT_BATCH_ROWS: usize = 1;

/// Upper bound on rows fetched per snapshot batch, regardless of available memory.
pub const MAX_SNAPSHOT_BATCH_ROWS: usize = 100_000;

/// Estimated bytes a row occupies once decoded, when the table is empty or its size is unknown.
pub const DEFAULT_ROW_SIZE_BYTES: u64 = 1024;

/// Bytes of memory the process may still allocate.
///
/// Inside a cgroup the limit is the cgroup's, otherwise it is the host's.
pub fn available_memory_bytes() -> u64 {
    let mut system = sysinfo::System::new();
    system.refresh_memory_specifics(sysinfo::MemoryRefreshKind::nothing().with_ram());

    let (used, total) = match system.cgroup_limits() {
        Some(cgroup) => (cgroup.rss, cgroup.total_memory),
        None => (system.used_memory(), system.total_memory()),
    };

    let available = total.saturating_sub(used);
    debug!(used, total, available, "sampled process memory");

    available
}

/// Number of rows to fetch per snapshot batch so that a batch stays within
/// `available_bytes * safety_factor`.
///
/// Decoded rows are JSON encoded and buffered on a channel, so the average on-disk row size is
/// doubled to account for that overhead.
pub fn snapshot_batch_size(available_bytes: u64, safety_factor: f64, avg_row_bytes: u64) -> usize {
    let row_bytes = avg_row_bytes.max(1).saturating_mul(2);
    let budget = (available_bytes as f64 * safety_factor.clamp(0.0, 1.0)) as u64;
    let rows = budget / row_bytes;

    (rows.min(MAX_SNAPSHOT_BATCH_ROWS as u64) as usize).max(MIN_SNAPSHOT_BATCH_ROWS)
}
