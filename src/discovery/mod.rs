// Discovery orchestration
//
// Public entry point wiring the template store, transport factory, crawler,
// and assembler together. Returns the assembled map plus the crawl stats;
// persistence helpers write the topology document atomically.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tracing::info;

use crate::config::DiscoveryConfig;
use crate::crawler::{
    CancelFlag, CrawlOptions, CrawlStats, Crawler, Device, ProgressEvent,
};
use crate::error::{DiscoveryError, ErrorContext, Result};
use crate::template::TemplateEngine;
use crate::topology::{self, TopologyMap};
use crate::transport::{Credentials, SessionFactory, SshSessionFactory};

/// Caller-supplied progress consumer; invoked from a forwarding task, so it
/// must not block for long
pub type ProgressCallback = Box<dyn Fn(&ProgressEvent) + Send + Sync>;

/// Raw intermediate records, returned when `save_debug_info` is set
#[derive(Debug, Serialize)]
pub struct DebugRecords {
    pub visited: Vec<String>,
    pub failed: Vec<String>,
    pub unreachable: Vec<String>,
    pub devices: Vec<Device>,
}

#[derive(Debug)]
pub struct DiscoveryReport {
    pub topology: TopologyMap,
    pub stats: CrawlStats,
    pub dropped_links: usize,
    pub failures: std::collections::BTreeMap<String, String>,
    pub cancelled: bool,
    pub debug: Option<DebugRecords>,
}

/// Run a full discovery: resolve the seed, crawl to quiescence, assemble
/// the map. Cancellation is observed cooperatively through `cancel`.
pub async fn discover(
    config: &DiscoveryConfig,
    cancel: CancelFlag,
    progress: Option<ProgressCallback>,
) -> Result<DiscoveryReport> {
    let engine = match &config.templates_dir {
        Some(dir) => Arc::new(TemplateEngine::from_dir(dir)?),
        None => Arc::new(TemplateEngine::embedded()),
    };
    let factory: Arc<dyn SessionFactory> =
        Arc::new(SshSessionFactory::new(config.timeout_per_device()));
    discover_with(config, cancel, progress, engine, factory).await
}

/// Same as [`discover`] with the template store and session factory
/// injected; the seam tests drive with transcript players
pub async fn discover_with(
    config: &DiscoveryConfig,
    cancel: CancelFlag,
    progress: Option<ProgressCallback>,
    engine: Arc<TemplateEngine>,
    factory: Arc<dyn SessionFactory>,
) -> Result<DiscoveryReport> {
    let seed = crate::transport::resolve_seed(&config.seed_ip)
        .await
        .ok_or_else(|| DiscoveryError::Config {
            field: "seed_ip".to_string(),
            reason: format!("cannot resolve '{}'", config.seed_ip),
        })?;

    let mut opts = CrawlOptions::new(seed, Credentials::new(&config.username, &config.password));
    if !config.alternate_username.is_empty() {
        opts.alternate = Some(Credentials::new(
            &config.alternate_username,
            &config.alternate_password,
        ));
    }
    opts.max_devices = config.max_devices;
    opts.timeout_per_device = config.timeout_per_device();
    opts.exclude = config.exclude_list();
    opts.blacklist = config.blacklist_list();
    opts.max_workers = config.max_workers;

    let mut crawler = Crawler::new(opts, engine, factory, cancel);
    let forwarder = progress.map(|callback| {
        let mut rx = crawler.progress_channel();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                callback(&event);
            }
        })
    });

    let outcome = crawler.run().await;
    if let Some(handle) = forwarder {
        let _ = handle.await;
    }

    let exclude = config.exclude_list();
    let assembled = topology::assemble(&outcome.devices, &exclude);
    info!(
        nodes = assembled.map.len(),
        discovered = outcome.stats.devices_discovered,
        failed = outcome.stats.devices_failed,
        unreachable = outcome.stats.unreachable_hosts,
        "discovery finished"
    );

    let debug = config.save_debug_info.then(|| DebugRecords {
        visited: outcome.visited.clone(),
        failed: outcome.failures.keys().cloned().collect(),
        unreachable: outcome.unreachable.clone(),
        devices: outcome.devices.clone(),
    });

    Ok(DiscoveryReport {
        topology: assembled.map,
        stats: outcome.stats,
        dropped_links: assembled.dropped_links,
        failures: outcome.failures,
        cancelled: outcome.cancelled,
        debug,
    })
}

/// Write the topology document atomically: serialize to a temp file in the
/// target directory, then rename into place
pub fn save_topology(map: &TopologyMap, output_dir: &Path, map_name: &str) -> Result<PathBuf> {
    std::fs::create_dir_all(output_dir).with_path_context(&output_dir.display().to_string())?;
    let final_path = output_dir.join(format!("{}.json", map_name));
    let tmp_path = output_dir.join(format!(".{}.json.tmp", map_name));

    let body = serde_json::to_string_pretty(map).map_err(|e| DiscoveryError::Serialization {
        what: "topology map".to_string(),
        source: e,
    })?;
    std::fs::write(&tmp_path, body).with_path_context(&tmp_path.display().to_string())?;
    std::fs::rename(&tmp_path, &final_path)
        .with_path_context(&final_path.display().to_string())?;
    info!(path = %final_path.display(), "topology map written");
    Ok(final_path)
}

/// Debug dump mirroring the raw crawl state, plus one neighbor file per
/// device, stamped with the completion time
pub fn save_debug_info(report: &DiscoveryReport, output_dir: &Path) -> Result<()> {
    let Some(debug) = &report.debug else {
        return Ok(());
    };
    std::fs::create_dir_all(output_dir).with_path_context(&output_dir.display().to_string())?;

    #[derive(Serialize)]
    struct DebugDocument<'a> {
        generated_at: chrono::DateTime<chrono::Utc>,
        stats: &'a CrawlStats,
        #[serde(flatten)]
        records: &'a DebugRecords,
    }

    let doc = DebugDocument {
        generated_at: chrono::Utc::now(),
        stats: &report.stats,
        records: debug,
    };
    let path = output_dir.join("discovery_debug.json");
    let body = serde_json::to_string_pretty(&doc).map_err(|e| DiscoveryError::Serialization {
        what: "debug records".to_string(),
        source: e,
    })?;
    std::fs::write(&path, body).with_path_context(&path.display().to_string())?;

    for device in &debug.devices {
        let host = device.hostname.split('.').next().unwrap_or("device");
        let device_path = output_dir.join(format!("{}_neighbors.json", host));
        let body =
            serde_json::to_string_pretty(&device.connections).map_err(|e| {
                DiscoveryError::Serialization {
                    what: format!("neighbors of {}", device.hostname),
                    source: e,
                }
            })?;
        std::fs::write(&device_path, body).with_path_context(&device_path.display().to_string())?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crawler::tests::ios_leaf_transcript;
    use crate::transport::playback::TranscriptFactory;
    use parking_lot::Mutex;

    fn base_config(seed: &str) -> DiscoveryConfig {
        DiscoveryConfig {
            seed_ip: seed.to_string(),
            username: "admin".to_string(),
            password: "pw".to_string(),
            ..DiscoveryConfig::default()
        }
    }

    #[test]
    fn test_discover_with_transcripts_end_to_end() {
        let factory = Arc::new(
            TranscriptFactory::new().device("10.0.0.1", ios_leaf_transcript("r1")),
        );
        let engine = Arc::new(TemplateEngine::embedded());
        let config = base_config("10.0.0.1");

        let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let seen_in_cb = Arc::clone(&seen);
        let callback: ProgressCallback = Box::new(move |event| {
            seen_in_cb.lock().push(event.status.as_str().to_string());
        });

        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap();
        let report = rt
            .block_on(discover_with(
                &config,
                CancelFlag::default(),
                Some(callback),
                engine,
                factory,
            ))
            .unwrap();

        assert_eq!(report.topology.len(), 1);
        let node = &report.topology["r1"];
        assert_eq!(node.node_details.ip, "10.0.0.1");
        assert_eq!(node.node_details.platform, "ios");
        assert!(node.peers.is_empty());
        assert_eq!(report.stats.devices_discovered, 1);
        assert!(!seen.lock().is_empty());
    }

    #[test]
    fn test_save_topology_is_atomic_rename() {
        let dir = tempfile::tempdir().unwrap();
        let mut map = TopologyMap::new();
        map.insert("r1".to_string(), Default::default());

        let path = save_topology(&map, dir.path(), "network_map").unwrap();
        assert_eq!(path, dir.path().join("network_map.json"));
        let body = std::fs::read_to_string(&path).unwrap();
        assert!(body.contains("\"r1\""));
        // No temp file left behind
        assert!(!dir.path().join(".network_map.json.tmp").exists());
    }

    #[test]
    fn test_save_debug_info_writes_dumps() {
        let dir = tempfile::tempdir().unwrap();
        let report = DiscoveryReport {
            topology: TopologyMap::new(),
            stats: CrawlStats::default(),
            dropped_links: 0,
            failures: Default::default(),
            cancelled: false,
            debug: Some(DebugRecords {
                visited: vec!["10.0.0.1".to_string()],
                failed: vec![],
                unreachable: vec![],
                devices: vec![Device {
                    hostname: "r1".to_string(),
                    ip: "10.0.0.1".to_string(),
                    platform: "ios".to_string(),
                    serial: String::new(),
                    connections: Default::default(),
                }],
            }),
        };
        save_debug_info(&report, dir.path()).unwrap();
        assert!(dir.path().join("discovery_debug.json").exists());
        assert!(dir.path().join("r1_neighbors.json").exists());
    }
}
