use std::collections::HashMap;

use chrono::Utc;
use nr_db::models::{InstanceMetrics, Server, ServerStatus};
use serde::Deserialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::JobOutcome;
use crate::{Result, Services};

const STATS_COMMAND: &str = "docker stats --no-stream --format '{{json .}}'";

/// One line of `docker stats --format '{{json .}}'`.
#[derive(Debug, Deserialize)]
struct StatsLine {
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "CPUPerc")]
    cpu_perc: String,
    #[serde(rename = "MemUsage")]
    mem_usage: String,
}

/// Parsed sample for one container.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerStats {
    pub name: String,
    pub cpu_percent: f64,
    pub memory_used_mb: i32,
    pub memory_limit_mb: i32,
}

/// Sample every active server, or just `server_id`.
///
/// Each server is sampled independently; one unreachable host does not stop the rest.
pub async fn run(svc: &Services, server_id: Option<Uuid>) -> Result<JobOutcome> {
    let servers = match server_id {
        Some(id) => vec![svc.store.get_server(id).await?],
        None => svc.store.list_servers_by_status(ServerStatus::Active).await?,
    };

    let mut sampled = 0;
    for server in &servers {
        match sync_server(svc, server).await {
            Ok(count) => sampled += count,
            Err(e) => {
                warn!(server_id = %server.id, server = %server.name, error = %e, "metrics: server skipped");
            }
        }
    }
    info!(servers = servers.len(), instances = sampled, "metrics: sync complete");
    Ok(JobOutcome::Done)
}

async fn sync_server(svc: &Services, server: &Server) -> Result<usize> {
    let exec = svc.executor_for(server)?;
    let out = exec.execute(STATS_COMMAND, true).await?;
    let stats: HashMap<String, ContainerStats> = parse_stats(&out.stdout)
        .into_iter()
        .map(|s| (s.name.clone(), s))
        .collect();

    let now = Utc::now();
    let mut recorded = 0;
    for instance in svc.store.list_instances_on_server(server.id).await? {
        let Some(sample) = stats.get(&instance.container_name()) else {
            debug!(instance_id = %instance.id, "metrics: no container sample");
            continue;
        };
        svc.store
            .record_metrics(&InstanceMetrics {
                instance_id: instance.id,
                cpu_percent: sample.cpu_percent,
                memory_used_mb: sample.memory_used_mb,
                memory_limit_mb: sample.memory_limit_mb,
                sampled_at: now,
            })
            .await?;
        recorded += 1;
    }

    let used = svc.planner().recalculate_capacity(server.id).await?;
    debug!(server_id = %server.id, memory_mb = used.memory_mb, storage_gb = used.storage_gb, "metrics: capacity recalculated");
    Ok(recorded)
}

/// Parse `docker stats` JSON lines, skipping anything malformed.
pub fn parse_stats(output: &str) -> Vec<ContainerStats> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(|line| match serde_json::from_str::<StatsLine>(line) {
            Ok(raw) => Some(raw),
            Err(e) => {
                debug!(line, error = %e, "metrics: unparseable stats line");
                None
            }
        })
        .filter_map(|raw| {
            let cpu_percent = raw.cpu_perc.trim().trim_end_matches('%').parse().ok()?;
            let (used, limit) = raw.mem_usage.split_once('/')?;
            Some(ContainerStats {
                name: raw.name,
                cpu_percent,
                memory_used_mb: parse_size_mb(used)?,
                memory_limit_mb: parse_size_mb(limit)?,
            })
        })
        .collect()
}

/// `"45.6MiB"` → 45. Accepts binary and decimal units.
pub fn parse_size_mb(raw: &str) -> Option<i32> {
    let raw = raw.trim();
    let split = raw
        .find(|c: char| c.is_ascii_alphabetic())
        .unwrap_or(raw.len());
    let (number, unit) = raw.split_at(split);
    let value: f64 = number.trim().parse().ok()?;
    let bytes = match unit.trim() {
        "" | "B" => value,
        "KiB" => value * 1024.0,
        "MiB" => value * 1024.0 * 1024.0,
        "GiB" => value * 1024.0 * 1024.0 * 1024.0,
        "kB" | "KB" => value * 1e3,
        "MB" => value * 1e6,
        "GB" => value * 1e9,
        _ => return None,
    };
    Some((bytes / (1024.0 * 1024.0)) as i32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nr_db::models::InstanceStatus;

    use crate::testing::{Harness, seed_instance, seed_server};

    const SAMPLE: &str = r#"{"BlockIO":"0B / 0B","CPUPerc":"1.25%","Container":"4f2a","ID":"4f2a","MemPerc":"9.00%","MemUsage":"46.08MiB / 512MiB","Name":"nr-lab","NetIO":"1kB / 2kB","PIDs":"11"}
{"CPUPerc":"0.10%","MemUsage":"30MiB / 7.6GiB","Name":"traefik"}
not json
"#;

    #[test]
    fn sizes_in_mixed_units() {
        assert_eq!(parse_size_mb("512MiB"), Some(512));
        assert_eq!(parse_size_mb(" 1.5GiB "), Some(1536));
        assert_eq!(parse_size_mb("2048KiB"), Some(2));
        assert_eq!(parse_size_mb("0B"), Some(0));
        assert_eq!(parse_size_mb("100MB"), Some(95));
        assert_eq!(parse_size_mb("12parsecs"), None);
    }

    #[test]
    fn parses_stats_and_skips_junk() {
        let stats = parse_stats(SAMPLE);
        assert_eq!(stats.len(), 2);
        assert_eq!(
            stats[0],
            ContainerStats {
                name: "nr-lab".into(),
                cpu_percent: 1.25,
                memory_used_mb: 46,
                memory_limit_mb: 512,
            }
        );
        assert_eq!(stats[1].memory_limit_mb, 7782);
    }

    #[tokio::test]
    async fn records_samples_and_recalculates() {
        let h = Harness::new();
        let server = seed_server(&h, "vm", 4096, 80, ServerStatus::Active).await;
        let instance = seed_instance(&h, "lab", Some(server.id)).await;
        h.store
            .set_instance_status(instance.id, InstanceStatus::Active)
            .await
            .unwrap();
        h.store
            .set_instance_capacity_counted(instance.id, true)
            .await
            .unwrap();
        h.store.set_server_usage(server.id, 3000, 70).await.unwrap();
        h.exec(server.public_ip.as_deref().unwrap())
            .respond("docker stats", SAMPLE);

        run(&h.svc, None).await.unwrap();

        let sample = h.store.get_metrics(instance.id).await.unwrap().unwrap();
        assert_eq!(sample.memory_used_mb, 46);
        assert_eq!(sample.cpu_percent, 1.25);
        let server = h.store.get_server(server.id).await.unwrap();
        assert_eq!((server.used_memory_mb, server.used_disk_gb), (512, 10));
    }

    #[tokio::test]
    async fn unreachable_server_does_not_stop_the_others() {
        let h = Harness::new();
        let down = seed_server(&h, "down", 4096, 80, ServerStatus::Active).await;
        let up = seed_server(&h, "up", 4096, 80, ServerStatus::Active).await;
        let instance = seed_instance(&h, "lab", Some(up.id)).await;
        h.exec(down.public_ip.as_deref().unwrap()).unreachable_for(100);
        h.exec(up.public_ip.as_deref().unwrap())
            .respond("docker stats", SAMPLE);

        run(&h.svc, None).await.unwrap();

        assert!(h.store.get_metrics(instance.id).await.unwrap().is_some());
    }
}
