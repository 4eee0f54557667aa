use chrono::Utc;
use nr_db::models::{Instance, InstanceStatus, NewServer, Plan, Server, ServerStatus};
use nr_infra::types::{ServerSpec, ServerState, ServerTypeInfo};
use tokio::time::Instant;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::jobs::Job;
use crate::{Error, Result, Services};

/// Memory and disk an instance occupies on its server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    pub memory_mb: i32,
    pub storage_gb: i32,
}

impl From<&Plan> for Allocation {
    fn from(plan: &Plan) -> Self {
        Self {
            memory_mb: plan.memory_mb,
            storage_gb: plan.storage_gb,
        }
    }
}

impl From<&Instance> for Allocation {
    fn from(instance: &Instance) -> Self {
        Self {
            memory_mb: instance.memory_mb,
            storage_gb: instance.storage_gb,
        }
    }
}

/// Picks servers for new instances and keeps their used counters in step.
pub struct CapacityPlanner<'a> {
    svc: &'a Services,
}

impl<'a> CapacityPlanner<'a> {
    pub fn new(svc: &'a Services) -> Self {
        Self { svc }
    }

    fn reserved(&self) -> (i32, i32) {
        let cfg = &self.svc.config;
        (cfg.reserved_memory_mb, cfg.reserved_disk_gb)
    }

    pub fn can_fit(&self, server: &Server, alloc: Allocation) -> bool {
        let (mem, disk) = self.reserved();
        server.available_memory_mb(mem) >= alloc.memory_mb
            && server.available_disk_gb(disk) >= alloc.storage_gb
    }

    fn free_score(&self, server: &Server) -> i64 {
        let (mem, disk) = self.reserved();
        i64::from(server.available_memory_mb(mem)) + 100 * i64::from(server.available_disk_gb(disk))
    }

    /// Server for a new instance of size `alloc`.
    ///
    /// An explicit server is returned without a capacity check as long as it is
    /// active or provisioning. Otherwise the active server with the most free
    /// room wins, and a new server is created when none fits.
    pub async fn find_or_create_server(
        &self,
        alloc: Allocation,
        explicit_server_id: Option<Uuid>,
    ) -> Result<Server> {
        if let Some(id) = explicit_server_id {
            let server = self.svc.store.get_server(id).await.map_err(|e| {
                if e.is_not_found() {
                    Error::Precondition(format!("server {id} does not exist"))
                } else {
                    e.into()
                }
            })?;
            return match server.status {
                ServerStatus::Active | ServerStatus::Provisioning => Ok(server),
                ServerStatus::Error | ServerStatus::Deleting => Err(Error::Precondition(format!(
                    "server {} is {} and cannot take instances",
                    server.name, server.status
                ))),
            };
        }

        let candidates = self.svc.store.list_servers_by_status(ServerStatus::Active).await?;
        let best = candidates
            .into_iter()
            .filter(|s| self.can_fit(s, alloc))
            .max_by_key(|s| self.free_score(s));

        if let Some(server) = best {
            info!(server_id = %server.id, memory_mb = alloc.memory_mb, storage_gb = alloc.storage_gb, "capacity: placing on existing server");
            return Ok(server);
        }

        info!(memory_mb = alloc.memory_mb, storage_gb = alloc.storage_gb, "capacity: no server fits, creating one");
        self.create_new_server(alloc).await
    }

    /// Smallest server type with twice the room the instance and reserve need.
    pub fn pick_server_type<'t>(
        &self,
        types: &'t [ServerTypeInfo],
        alloc: Allocation,
        location: &str,
    ) -> Option<&'t ServerTypeInfo> {
        let (mem, disk) = self.reserved();
        let need_mem = 2 * (alloc.memory_mb + mem);
        let need_disk = 2 * (alloc.storage_gb + disk);
        types
            .iter()
            .filter(|t| t.memory_mb >= need_mem && t.disk_gb >= need_disk)
            .filter(|t| t.is_available_in(location))
            .min_by_key(|t| (t.memory_mb, t.disk_gb))
    }

    /// Create a server at the provider, wait until it runs, and queue its bootstrap.
    pub async fn create_new_server(&self, alloc: Allocation) -> Result<Server> {
        let cfg = &self.svc.config;
        if !cfg.provisioning_enabled {
            return Err(Error::Config(
                "server provisioning is disabled in this environment; register a server first (POST /servers)".into(),
            ));
        }

        let cloud = &self.svc.cloud;
        let location = cfg
            .location
            .clone()
            .unwrap_or_else(|| cloud.default_location().to_string());
        let types = cloud.list_server_types().await?;
        let server_type = self.pick_server_type(&types, alloc, &location).ok_or_else(|| {
            Error::Precondition(format!(
                "no server type in {location} fits {} MB / {} GB with headroom",
                alloc.memory_mb, alloc.storage_gb
            ))
        })?;

        let mut ssh_keys = Vec::new();
        if let (Some(name), Some(key)) = (cfg.ssh_key_name.as_deref(), self.svc.remote.public_key()) {
            cloud.ensure_ssh_key(name, key).await?;
            ssh_keys.push(name.to_string());
        }

        let spec = ServerSpec {
            name: format!("nr-{location}-{}", &Uuid::new_v4().simple().to_string()[..8]),
            server_type: server_type.name.clone(),
            image: cloud.default_image().to_string(),
            location: location.clone(),
            ssh_keys,
        };

        let info = cloud.create_server(&spec).await.map_err(|e| {
            error!(server_type = %spec.server_type, location = %spec.location, error = %e, "capacity: provider create failed");
            Error::from(e)
        })?;

        let server = self
            .svc
            .store
            .insert_server(&NewServer {
                provider_id: Some(info.id.0.clone()),
                name: spec.name.clone(),
                public_ip: info.public_ip.clone(),
                private_ip: info.private_ip.clone(),
                region: location,
                server_type: server_type.name.clone(),
                total_memory_mb: server_type.memory_mb,
                total_disk_gb: server_type.disk_gb,
                status: ServerStatus::Provisioning,
            })
            .await?;
        info!(server_id = %server.id, provider_id = %info.id.0, server_type = %spec.server_type, "capacity: server created");

        let timings = &cfg.timings;
        let deadline = Instant::now() + timings.server_ready_timeout;
        let running = loop {
            match cloud.get_server(&info.id).await {
                Ok(current) if current.state == ServerState::Running => break current,
                Ok(current) => {
                    info!(server_id = %server.id, state = ?current.state, "capacity: waiting for server to run");
                }
                Err(e) => {
                    warn!(server_id = %server.id, error = %e, "capacity: server status check failed");
                }
            }
            if Instant::now() >= deadline {
                self.svc
                    .store
                    .set_server_status(server.id, ServerStatus::Error)
                    .await?;
                return Err(Error::Timeout(format!(
                    "server {} not running after {}s",
                    server.name,
                    timings.server_ready_timeout.as_secs()
                )));
            }
            tokio::time::sleep(timings.server_poll_interval).await;
        };

        self.svc
            .store
            .update_server_addresses(
                server.id,
                running.public_ip.as_deref(),
                running.private_ip.as_deref(),
            )
            .await?;
        self.svc
            .store
            .mark_server_provisioned(server.id, Utc::now())
            .await?;

        self.svc.queue.dispatch(Job::BootstrapServer {
            server_id: server.id,
            actor_id: None,
        });

        Ok(self.svc.store.get_server(server.id).await?)
    }

    pub async fn update_server_capacity(&self, server_id: Uuid, alloc: Allocation) -> Result<()> {
        self.svc
            .store
            .adjust_server_usage(server_id, alloc.memory_mb, alloc.storage_gb)
            .await?;
        info!(server_id = %server_id, memory_mb = alloc.memory_mb, storage_gb = alloc.storage_gb, "capacity: reserved");
        Ok(())
    }

    pub async fn release_server_capacity(&self, server_id: Uuid, alloc: Allocation) -> Result<()> {
        self.svc
            .store
            .adjust_server_usage(server_id, -alloc.memory_mb, -alloc.storage_gb)
            .await?;
        info!(server_id = %server_id, memory_mb = alloc.memory_mb, storage_gb = alloc.storage_gb, "capacity: released");
        Ok(())
    }

    /// Rewrite the used counters from the instances counted against the server.
    pub async fn recalculate_capacity(&self, server_id: Uuid) -> Result<Allocation> {
        let instances = self.svc.store.list_instances_on_server(server_id).await?;
        let used = instances
            .iter()
            .filter(|i| i.capacity_counted)
            .filter(|i| {
                matches!(
                    i.status,
                    InstanceStatus::Active | InstanceStatus::Stopped | InstanceStatus::Deploying
                )
            })
            .fold(Allocation { memory_mb: 0, storage_gb: 0 }, |acc, i| Allocation {
                memory_mb: acc.memory_mb + i.memory_mb,
                storage_gb: acc.storage_gb + i.storage_gb,
            });

        self.svc
            .store
            .set_server_usage(server_id, used.memory_mb, used.storage_gb)
            .await?;
        Ok(used)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Harness, seed_instance, seed_server, server_type};
    use nr_infra::types::Pricing;

    fn alloc(memory_mb: i32, storage_gb: i32) -> Allocation {
        Allocation { memory_mb, storage_gb }
    }

    #[tokio::test]
    async fn fits_exactly_into_reserved_margin() {
        let h = Harness::new();
        let server = seed_server(&h, "vm-1", 1024, 100, ServerStatus::Active).await;

        let picked = h
            .svc
            .planner()
            .find_or_create_server(alloc(512, 10), None)
            .await
            .unwrap();

        assert_eq!(picked.id, server.id);
        assert!(h.cloud.created().is_empty());
    }

    #[tokio::test]
    async fn prefers_server_with_most_free_room() {
        let h = Harness::new();
        let small = seed_server(&h, "small", 2048, 40, ServerStatus::Active).await;
        let big = seed_server(&h, "big", 4096, 80, ServerStatus::Active).await;
        let _ = small;

        let picked = h
            .svc
            .planner()
            .find_or_create_server(alloc(512, 10), None)
            .await
            .unwrap();
        assert_eq!(picked.id, big.id);
    }

    #[tokio::test]
    async fn never_returns_a_server_that_cannot_fit() {
        let h = Harness::new();
        let full = seed_server(&h, "full", 1024, 100, ServerStatus::Active).await;
        h.store.adjust_server_usage(full.id, 256, 0).await.unwrap();
        seed_server(&h, "idle", 8192, 100, ServerStatus::Provisioning).await;

        let picked = h
            .svc
            .planner()
            .find_or_create_server(alloc(512, 10), None)
            .await
            .unwrap();

        assert_ne!(picked.id, full.id);
        assert!(h.svc.planner().can_fit(&picked, alloc(512, 10)));
        assert_eq!(h.cloud.created().len(), 1);
    }

    #[tokio::test]
    async fn explicit_server_skips_capacity_check() {
        let h = Harness::new();
        let tiny = seed_server(&h, "tiny", 256, 5, ServerStatus::Provisioning).await;

        let picked = h
            .svc
            .planner()
            .find_or_create_server(alloc(512, 10), Some(tiny.id))
            .await
            .unwrap();
        assert_eq!(picked.id, tiny.id);
    }

    #[tokio::test]
    async fn explicit_server_in_error_is_rejected() {
        let h = Harness::new();
        let broken = seed_server(&h, "broken", 4096, 80, ServerStatus::Error).await;

        let err = h
            .svc
            .planner()
            .find_or_create_server(alloc(512, 10), Some(broken.id))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Precondition(_)));
    }

    #[tokio::test]
    async fn creating_servers_is_refused_without_provisioning() {
        let h = Harness::with_config(|cfg| cfg.provisioning_enabled = false);

        let err = h
            .svc
            .planner()
            .find_or_create_server(alloc(512, 10), None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(h.cloud.created().is_empty());
    }

    #[tokio::test]
    async fn new_server_is_persisted_and_bootstrap_queued() {
        let mut h = Harness::new();

        let server = h.svc.planner().create_new_server(alloc(512, 10)).await.unwrap();

        assert_eq!(server.status, ServerStatus::Provisioning);
        assert!(server.provider_id.is_some());
        assert!(server.provisioned_at.is_some());
        assert_eq!(server.public_ip.as_deref(), Some("198.51.100.1"));
        // 2 x (512 + 512) MB and 2 x (10 + 10) GB
        assert_eq!(server.server_type, "cx22");

        let jobs = h.dispatched();
        assert!(matches!(jobs.as_slice(), [Job::BootstrapServer { server_id, .. }] if *server_id == server.id));
    }

    #[tokio::test]
    async fn server_that_never_runs_is_marked_error() {
        let h = Harness::new();
        h.cloud.never_run();

        let err = h.svc.planner().create_new_server(alloc(512, 10)).await.unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));

        let servers = h.store.list_servers().await.unwrap();
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].status, ServerStatus::Error);
    }

    #[test]
    fn picks_smallest_type_with_headroom_in_location() {
        let h = Harness::new();
        let planner = h.svc.planner();
        let types = vec![
            server_type("cx52", 32768, 320),
            server_type("cx22", 4096, 40),
            server_type("cx32", 8192, 80),
            ServerTypeInfo {
                prices: vec![Pricing {
                    location: "hel1".into(),
                    hourly_net: 0.01,
                    monthly_net: 4.0,
                }],
                ..server_type("cax11", 4096, 40)
            },
        ];

        let picked = planner.pick_server_type(&types, alloc(512, 10), "fsn1").unwrap();
        assert_eq!(picked.name, "cx22");

        let picked = planner.pick_server_type(&types, alloc(2048, 10), "fsn1").unwrap();
        assert_eq!(picked.name, "cx32");

        assert!(planner.pick_server_type(&types, alloc(65536, 10), "fsn1").is_none());
    }

    #[tokio::test]
    async fn recalculate_counts_only_counted_live_instances() {
        let h = Harness::new();
        let server = seed_server(&h, "vm", 8192, 160, ServerStatus::Active).await;
        h.store.set_server_usage(server.id, 9999, 999).await.unwrap();

        let live = seed_instance(&h, "live", Some(server.id)).await;
        h.store.set_instance_status(live.id, InstanceStatus::Active).await.unwrap();
        h.store.set_instance_capacity_counted(live.id, true).await.unwrap();

        let stopped = seed_instance(&h, "paused", Some(server.id)).await;
        h.store.set_instance_status(stopped.id, InstanceStatus::Stopped).await.unwrap();
        h.store.set_instance_capacity_counted(stopped.id, true).await.unwrap();

        // never counted
        seed_instance(&h, "fresh", Some(server.id)).await;

        let used = h.svc.planner().recalculate_capacity(server.id).await.unwrap();
        assert_eq!(used, alloc(1024, 20));

        let server = h.store.get_server(server.id).await.unwrap();
        assert_eq!(server.used_memory_mb, 1024);
        assert_eq!(server.used_disk_gb, 20);
    }
}
