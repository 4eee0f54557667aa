pub mod instances;
pub mod metrics;
pub mod plans;
pub mod servers;

use axum::http::StatusCode;
use axum::middleware;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use nr_engine::Job;

use crate::auth::auth_middleware;
use crate::dto::JobAccepted;
use crate::state::AppState;

/// Queue `job` and answer 202 with its execution id.
pub(crate) fn accepted(state: &AppState, job: Job) -> (StatusCode, Json<JobAccepted>) {
    let name = job.name();
    let execution_id = state.svc.queue.dispatch(job);
    (
        StatusCode::ACCEPTED,
        Json(JobAccepted {
            job: name,
            execution_id,
        }),
    )
}

pub fn api_router(state: AppState) -> Router {
    let authed = Router::new()
        // Plans
        .route("/plans", post(plans::create_plan))
        .route("/plans/{id}", get(plans::get_plan))
        // Instances
        .route("/instances", post(instances::create_instance))
        .route(
            "/instances/{id}",
            get(instances::get_instance).delete(instances::delete_instance),
        )
        .route("/instances/{id}/start", post(instances::start_instance))
        .route("/instances/{id}/stop", post(instances::stop_instance))
        .route("/instances/{id}/restart", post(instances::restart_instance))
        .route("/instances/{id}/move", post(instances::move_instance))
        .route("/instances/{id}/rename", post(instances::rename_instance))
        .route("/instances/{id}/redeploy", post(instances::redeploy_instance))
        .route("/instances/{id}/users", post(instances::add_user))
        .route("/instances/{id}/users/sync", post(instances::sync_users))
        .route("/instances/{id}/logs", get(instances::get_logs))
        // Servers
        .route(
            "/servers",
            get(servers::list_servers).post(servers::register_server),
        )
        .route("/servers/{id}", delete(servers::delete_server))
        .route("/servers/{id}/bootstrap", post(servers::bootstrap_server))
        // Metrics
        .route("/metrics/sync", post(metrics::sync_metrics))
        // Auth middleware
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    Router::new()
        .route("/health", get(|| async { "ok" }))
        .merge(authed)
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::Request;
    use nr_db::models::{NewPlan, ServerStatus};
    use nr_engine::testing::{Harness, seed_instance, seed_server};
    use serde_json::{Value, json};
    use tower::ServiceExt;

    use super::*;
    use crate::config::AppConfig;

    const KEY: &str = "test-key";

    fn app(h: &Harness) -> Router {
        api_router(AppState {
            svc: h.svc.clone(),
            config: AppConfig {
                database_url: None,
                listen_addr: "127.0.0.1:0".parse().unwrap(),
                control_plane_api_key: KEY.into(),
                metrics_interval_secs: 0,
                worker_count: 1,
            },
        })
    }

    async fn call(h: &Harness, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut req = Request::builder()
            .method(method)
            .uri(uri)
            .header("authorization", format!("Bearer {KEY}"));
        let body = match body {
            Some(v) => {
                req = req.header("content-type", "application/json");
                Body::from(v.to_string())
            }
            None => Body::empty(),
        };
        let res = app(h).oneshot(req.body(body).unwrap()).await.unwrap();
        let status = res.status();
        let bytes = axum::body::to_bytes(res.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    async fn plan(h: &Harness) -> uuid::Uuid {
        h.store
            .insert_plan(&NewPlan {
                name: "starter".into(),
                memory_mb: 512,
                storage_gb: 10,
                cpu_millicores: 500,
                price_cents: 500,
            })
            .await
            .unwrap()
            .id
    }

    #[tokio::test]
    async fn rejects_missing_or_wrong_key() {
        let h = Harness::new();
        let res = app(&h)
            .oneshot(Request::get("/servers").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

        let res = app(&h)
            .oneshot(
                Request::get("/servers")
                    .header("authorization", "Bearer nope")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

        let res = app(&h)
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn create_instance_queues_deploy() {
        let mut h = Harness::new();
        let plan_id = plan(&h).await;

        let (status, body) = call(
            &h,
            "POST",
            "/instances",
            Some(json!({
                "user_id": uuid::Uuid::new_v4(),
                "plan_id": plan_id,
                "slug": "lab",
                "admin_password_hash": "$2b$10$hash",
            })),
        )
        .await;

        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["instance"]["url"], "https://lab.flows.test");
        assert_eq!(body["instance"]["status"], "pending");
        assert_eq!(body["instance"]["memory_mb"], 512);
        let jobs = h.dispatched();
        assert_eq!(jobs.len(), 1);
        assert!(matches!(jobs[0], Job::Deploy { .. }));
    }

    #[tokio::test]
    async fn create_instance_refuses_taken_subdomain() {
        let mut h = Harness::new();
        seed_instance(&h, "lab", None).await;
        let plan_id = plan(&h).await;

        let (status, _) = call(
            &h,
            "POST",
            "/instances",
            Some(json!({
                "user_id": uuid::Uuid::new_v4(),
                "plan_id": plan_id,
                "slug": "other",
                "subdomain": "lab",
                "admin_password_hash": "$2b$10$hash",
            })),
        )
        .await;

        assert_eq!(status, StatusCode::CONFLICT);
        assert!(h.dispatched().is_empty());
    }

    #[tokio::test]
    async fn create_instance_refuses_unusable_server() {
        let h = Harness::new();
        let plan_id = plan(&h).await;
        let broken = seed_server(&h, "nr-broken", 4096, 40, ServerStatus::Error).await;

        let (status, body) = call(
            &h,
            "POST",
            "/instances",
            Some(json!({
                "user_id": uuid::Uuid::new_v4(),
                "plan_id": plan_id,
                "slug": "lab",
                "admin_password_hash": "$2b$10$hash",
                "server_id": broken.id,
            })),
        )
        .await;

        assert_eq!(status, StatusCode::CONFLICT);
        assert!(body["error"].as_str().unwrap().contains("nr-broken"));
    }

    #[tokio::test]
    async fn rename_validates_before_queueing() {
        let mut h = Harness::new();
        let instance = seed_instance(&h, "lab", None).await;

        let (status, _) = call(
            &h,
            "POST",
            &format!("/instances/{}/rename", instance.id),
            Some(json!({ "subdomain": "-Bad-" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(h.dispatched().is_empty());

        let (status, body) = call(
            &h,
            "POST",
            &format!("/instances/{}/rename", instance.id),
            Some(json!({ "subdomain": "studio" })),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["job"], "rename");
    }

    #[tokio::test]
    async fn unknown_instance_is_not_found() {
        let h = Harness::new();
        let (status, body) = call(
            &h,
            "GET",
            &format!("/instances/{}", uuid::Uuid::new_v4()),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].is_string());
    }

    #[tokio::test]
    async fn register_server_queues_bootstrap() {
        let mut h = Harness::new();
        let (status, body) = call(
            &h,
            "POST",
            "/servers",
            Some(json!({
                "name": "nr-byo-1",
                "public_ip": "192.0.2.10",
                "total_memory_mb": 8192,
                "total_disk_gb": 80,
            })),
        )
        .await;

        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["status"], "provisioning");
        assert!(body["provider_id"].is_null());
        assert_eq!(body["available_memory_mb"], 8192 - 512);
        let jobs = h.dispatched();
        assert!(matches!(jobs.as_slice(), [Job::BootstrapServer { .. }]));
    }

    #[tokio::test]
    async fn delete_server_refused_while_hosting() {
        let mut h = Harness::new();
        let server = seed_server(&h, "nr-1", 4096, 40, ServerStatus::Active).await;
        seed_instance(&h, "lab", Some(server.id)).await;

        let (status, _) = call(&h, "DELETE", &format!("/servers/{}", server.id), None).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert!(h.dispatched().is_empty());
    }

    #[tokio::test]
    async fn logs_are_read_from_the_server() {
        let h = Harness::new();
        let server = seed_server(&h, "nr-1", 4096, 40, ServerStatus::Active).await;
        let instance = seed_instance(&h, "lab", Some(server.id)).await;
        h.exec("203.0.113.1").respond("docker logs", "flows started\n");

        let (status, body) = call(
            &h,
            "GET",
            &format!("/instances/{}/logs?lines=20", instance.id),
            None,
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["logs"], "flows started\n");
        assert!(h.exec("203.0.113.1").ran("docker logs --tail 20"));
    }

    #[tokio::test]
    async fn actor_id_travels_with_the_job() {
        let mut h = Harness::new();
        let instance = seed_instance(&h, "lab", None).await;
        let actor = uuid::Uuid::new_v4();

        let res = app(&h)
            .oneshot(
                Request::post(format!("/instances/{}/redeploy", instance.id))
                    .header("authorization", format!("Bearer {KEY}"))
                    .header("x-actor-id", actor.to_string())
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(res.status(), StatusCode::ACCEPTED);
        assert_eq!(h.dispatched()[0].actor_id(), Some(actor));
    }
}
