//! Auto-tuning module
//!
//! Detects hardware capabilities and sizes the sync worker pool and
//! transfer chunks. Leaves headroom for the local document store, which
//! competes for the same cores while applying chunks.

use sysinfo::System;

use crate::config::SyncConfig;

/// Tuned configuration values based on hardware detection
#[derive(Debug, Clone)]
pub struct TunedConfig {
    /// Collections synced in parallel per database
    pub collection_concurrency: usize,
    /// Suggested records per transfer chunk
    pub chunk_size: usize,
    /// Detected CPU cores
    pub detected_cores: usize,
    /// Detected RAM in MB
    pub detected_ram_mb: u64,
}

impl Default for TunedConfig {
    fn default() -> Self {
        Self {
            collection_concurrency: 2,
            chunk_size: 1000,
            detected_cores: 4,
            detected_ram_mb: 8192,
        }
    }
}

/// Detect the number of available CPU cores
pub fn detect_cpu_cores() -> usize {
    let sys = System::new_all();
    sys.cpus().len().max(1)
}

/// Detect total RAM in megabytes
pub fn detect_ram_mb() -> u64 {
    let sys = System::new_all();
    sys.total_memory() / 1024 / 1024
}

/// Auto-tune sync parameters based on detected hardware
///
/// Allocation strategy:
/// - Half the cores run collection transfers (min 2, max 8)
/// - About 5% of RAM holds in-flight chunks across all workers
pub fn auto_tune() -> TunedConfig {
    let cores = detect_cpu_cores();
    let ram_mb = detect_ram_mb();

    let collection_concurrency = (cores / 2).clamp(2, 8);

    // ~1000 records per 100 MB of chunk budget, split over the workers
    let chunk_budget_mb = ram_mb * 5 / 100;
    let chunk_size = ((chunk_budget_mb / 100) as usize * 1000 / collection_concurrency)
        .clamp(500, 10_000);

    let config = TunedConfig {
        collection_concurrency,
        chunk_size,
        detected_cores: cores,
        detected_ram_mb: ram_mb,
    };

    tracing::info!(
        cores = cores,
        ram_mb = ram_mb,
        collection_concurrency = config.collection_concurrency,
        chunk_size = config.chunk_size,
        "Auto-tuned sync configuration based on hardware"
    );

    config
}

/// Fill in `collection_concurrency` and `chunk_size` where they are 0,
/// detecting hardware at most once
pub fn resolve_sync_settings(settings: &mut SyncConfig) {
    if settings.collection_concurrency > 0 && settings.chunk_size > 0 {
        return;
    }
    let tuned = auto_tune();
    apply_tuned(settings, &tuned);
}

/// Copy tuned values into settings left at 0
pub fn apply_tuned(settings: &mut SyncConfig, tuned: &TunedConfig) {
    if settings.collection_concurrency == 0 {
        settings.collection_concurrency = tuned.collection_concurrency;
    }
    if settings.chunk_size == 0 {
        settings.chunk_size = tuned.chunk_size;
    }
}

/// Get a human-readable summary of the tuned configuration
pub fn tuning_summary(config: &TunedConfig) -> String {
    format!(
        "Detected: {} cores, {} MB RAM\n\
         WolfSync: {} parallel collections, chunk_size={}",
        config.detected_cores,
        config.detected_ram_mb,
        config.collection_concurrency,
        config.chunk_size,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auto_tune_returns_sensible_values() {
        let config = auto_tune();

        assert!(config.collection_concurrency >= 2);
        assert!(config.collection_concurrency <= 8);
        assert!(config.chunk_size >= 500);
        assert!(config.chunk_size <= 10_000);
    }

    #[test]
    fn test_explicit_settings_win() {
        let mut settings = SyncConfig {
            collection_concurrency: 5,
            chunk_size: 250,
            ..SyncConfig::default()
        };
        resolve_sync_settings(&mut settings);
        assert_eq!(settings.collection_concurrency, 5);
        assert_eq!(settings.chunk_size, 250);
    }

    #[test]
    fn test_zero_settings_take_tuned_values() {
        let tuned = TunedConfig {
            collection_concurrency: 6,
            chunk_size: 4000,
            ..TunedConfig::default()
        };
        let mut settings = SyncConfig {
            collection_concurrency: 0,
            chunk_size: 0,
            ..SyncConfig::default()
        };
        apply_tuned(&mut settings, &tuned);
        assert_eq!(settings.collection_concurrency, 6);
        assert_eq!(settings.chunk_size, 4000);

        let mut detected = SyncConfig {
            chunk_size: 0,
            ..SyncConfig::default()
        };
        resolve_sync_settings(&mut detected);
        assert!((500..=10_000).contains(&detected.chunk_size));
        assert!(detected.collection_concurrency >= 2);
    }

    #[test]
    fn test_detection_returns_positive_values() {
        assert!(detect_cpu_cores() >= 1);
        assert!(detect_ram_mb() > 0);
    }
}
