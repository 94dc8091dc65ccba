// ABOUTME: gRPC transport for the administrative operations
// ABOUTME: Bearer-token interceptor in front of a tonic SyncAdmin service

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::service::Interceptor;
use tonic::{transport::Server, Request, Response, Status};

use sync_store::{ResolutionChoice, Snapshot};

use crate::admin::AdminService;
use crate::admin_proto::sync_admin_server::{SyncAdmin, SyncAdminServer};
use crate::admin_proto::{
    Ack, ChangePage, ConflictList, GetStatusRequest, HealthCheckRequest, HealthCheckResponse,
    InvalidateCacheRequest, ListConflictsRequest, ListUnprocessedRequest, NotifyChangeRequest,
    RearmStuckReply, RearmStuckRequest, ResolveAllReply, ResolveAllRequest,
    ResolveConflictRequest, StatusReply, SyncResultReply, TestWebhookReply, TestWebhookRequest,
    ToggleSchedulerRequest, TriggerSyncRequest, WebhookProbe,
};
use crate::error::SyncError;
use crate::scheduler::ChangeNotification;

/// Running admin server. Dropping the handle stops it.
pub struct AdminServerHandle {
    local_addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<Result<()>>>,
}

impl Drop for AdminServerHandle {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

impl AdminServerHandle {
    /// Bind `addr` and serve on the current runtime. Port 0 picks a free port.
    pub async fn spawn(addr: SocketAddr, admin: Arc<AdminService>, token: String) -> Result<Self> {
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind admin listener on {}", addr))?;
        let local_addr = listener.local_addr()?;
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let svc = AdminGrpc { admin };
        let interceptor = AuthInterceptor {
            token: Arc::new(token),
        };
        let task = tokio::spawn(async move {
            Server::builder()
                .add_service(SyncAdminServer::with_interceptor(svc, interceptor))
                .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async move {
                    let _ = shutdown_rx.await;
                })
                .await
                .context("grpc server exited with error")?;
            Ok(())
        });

        tracing::info!(listen = %local_addr, "admin server listening");
        Ok(Self {
            local_addr,
            shutdown: Some(shutdown_tx),
            task: Some(task),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting requests and wait for in-flight ones to finish.
    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            task.await.context("admin server task panicked")??;
        }
        Ok(())
    }
}

struct AdminGrpc {
    admin: Arc<AdminService>,
}

fn to_status(err: SyncError) -> Status {
    match err {
        SyncError::AlreadyInProgress => Status::already_exists(err.to_string()),
        SyncError::ConflictNotFound(_) => Status::not_found(err.to_string()),
        ref e if e.is_validation() => Status::invalid_argument(err.to_string()),
        _ => Status::internal(err.to_string()),
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, Status> {
    serde_json::to_string(value).map_err(|err| Status::internal(err.to_string()))
}

fn parse_choice(raw: &str) -> Result<ResolutionChoice, Status> {
    raw.parse()
        .map_err(|_| Status::invalid_argument(format!("unknown resolution choice: {}", raw)))
}

#[tonic::async_trait]
impl SyncAdmin for AdminGrpc {
    async fn health_check(
        &self,
        _: Request<HealthCheckRequest>,
    ) -> Result<Response<HealthCheckResponse>, Status> {
        let healthy = self.admin.status().map(|s| s.healthy).unwrap_or(false);
        Ok(Response::new(HealthCheckResponse {
            status: "ok".to_string(),
            healthy,
        }))
    }

    async fn trigger_sync(
        &self,
        request: Request<TriggerSyncRequest>,
    ) -> Result<Response<SyncResultReply>, Status> {
        let batch_size = request
            .get_ref()
            .batch_size
            .map(|n| n as usize)
            .unwrap_or_else(|| self.admin.scheduler().batch_size());
        let result = self
            .admin
            .trigger_sync(batch_size)
            .await
            .map_err(to_status)?;
        Ok(Response::new(SyncResultReply {
            success: result.success,
            changes_processed: result.changes_processed,
            successful_changes: result.successful_changes,
            failed_changes: result.failed_changes,
            retried_changes: result.retried_changes,
            conflicts_detected: result.conflicts_detected,
            webhook_failures: result.webhook_failures,
            cancelled: result.cancelled,
            message: result.message,
            duration_ms: result.duration_ms,
        }))
    }

    async fn get_status(
        &self,
        _: Request<GetStatusRequest>,
    ) -> Result<Response<StatusReply>, Status> {
        let status = self.admin.status().map_err(to_status)?;
        Ok(Response::new(StatusReply {
            enabled: status.enabled,
            in_progress: status.in_progress,
            last_sync_time: status
                .last_sync_time
                .map(|at| at.to_rfc3339())
                .unwrap_or_default(),
            last_error: status.last_error.unwrap_or_default(),
            unprocessed_count: status.unprocessed_count,
            failed_count: status.failed_count,
            stuck_count: status.stuck_count,
            open_conflicts: status.open_conflicts,
            processing_lag_seconds: status.processing_lag_seconds,
            oldest_unprocessed_age_seconds: status.oldest_unprocessed_age.unwrap_or_default(),
            run_count: status.run_count,
            cumulative_processed: status.cumulative_processed,
            cumulative_failed: status.cumulative_failed,
            webhook_failures: status.webhook_failures,
            healthy: status.healthy,
        }))
    }

    async fn invalidate_cache(
        &self,
        request: Request<InvalidateCacheRequest>,
    ) -> Result<Response<Ack>, Status> {
        let payload = request.into_inner();
        self.admin
            .invalidate_cache(&payload.cache, payload.key.as_deref())
            .map_err(to_status)?;
        Ok(Response::new(Ack {
            message: format!("invalidated {}", payload.cache),
        }))
    }

    async fn toggle_scheduler(
        &self,
        request: Request<ToggleSchedulerRequest>,
    ) -> Result<Response<Ack>, Status> {
        let enabled = request.get_ref().enabled;
        self.admin.toggle_scheduler(enabled);
        Ok(Response::new(Ack {
            message: if enabled { "enabled" } else { "disabled" }.to_string(),
        }))
    }

    async fn list_unprocessed_changes(
        &self,
        request: Request<ListUnprocessedRequest>,
    ) -> Result<Response<ChangePage>, Status> {
        let payload = request.into_inner();
        let size = if payload.size == 0 { 20 } else { payload.size as usize };
        let page = self
            .admin
            .list_unprocessed(payload.page as usize, size, payload.table.as_deref())
            .map_err(to_status)?;
        let changes_json = page
            .items
            .iter()
            .map(to_json)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Response::new(ChangePage {
            changes_json,
            page: page.page as u32,
            size: page.size as u32,
            total: page.total,
        }))
    }

    async fn test_webhook(
        &self,
        request: Request<TestWebhookRequest>,
    ) -> Result<Response<TestWebhookReply>, Status> {
        let url = request.into_inner().url;
        let results = self
            .admin
            .test_webhook(url.as_deref())
            .await
            .into_iter()
            .map(|probe| WebhookProbe {
                endpoint: probe.endpoint,
                success: probe.success,
                response_time_ms: probe.response_time_ms,
                status_code: probe.status_code.map(u32::from).unwrap_or_default(),
                error: probe.error.unwrap_or_default(),
            })
            .collect();
        Ok(Response::new(TestWebhookReply { results }))
    }

    async fn list_conflicts(
        &self,
        _: Request<ListConflictsRequest>,
    ) -> Result<Response<ConflictList>, Status> {
        let conflicts = self.admin.list_conflicts().map_err(to_status)?;
        let conflicts_json = conflicts
            .iter()
            .map(to_json)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Response::new(ConflictList { conflicts_json }))
    }

    async fn resolve_conflict(
        &self,
        request: Request<ResolveConflictRequest>,
    ) -> Result<Response<Ack>, Status> {
        let payload = request.into_inner();
        if payload.key.is_empty() {
            return Err(Status::invalid_argument("key is required"));
        }
        let choice = parse_choice(&payload.choice)?;
        let merged = payload
            .merged_json
            .map(|raw| serde_json::from_str::<Snapshot>(&raw))
            .transpose()
            .map_err(|err| Status::invalid_argument(format!("invalid merged snapshot: {}", err)))?;
        let outcome = self
            .admin
            .resolve_conflict(&payload.key, choice, merged)
            .map_err(to_status)?;
        let message = if outcome.already_resolved {
            format!("conflict for {} was already resolved", outcome.key)
        } else {
            format!("conflict for {} resolved with {}", outcome.key, choice)
        };
        Ok(Response::new(Ack { message }))
    }

    async fn resolve_all_conflicts(
        &self,
        request: Request<ResolveAllRequest>,
    ) -> Result<Response<ResolveAllReply>, Status> {
        let choice = parse_choice(&request.get_ref().choice)?;
        let report = self
            .admin
            .resolve_all_conflicts(choice)
            .map_err(to_status)?;
        Ok(Response::new(ResolveAllReply {
            resolved: report.resolved,
            failures: report
                .failures
                .into_iter()
                .map(|(key, err)| format!("{}: {}", key, err))
                .collect(),
        }))
    }

    async fn rearm_stuck(
        &self,
        _: Request<RearmStuckRequest>,
    ) -> Result<Response<RearmStuckReply>, Status> {
        let rearmed = self.admin.rearm_stuck().map_err(to_status)?;
        Ok(Response::new(RearmStuckReply { rearmed }))
    }

    async fn notify_change(
        &self,
        request: Request<NotifyChangeRequest>,
    ) -> Result<Response<Ack>, Status> {
        let notification =
            ChangeNotification::parse(&request.get_ref().payload_json).map_err(to_status)?;
        let message = if self.admin.notify_change(notification) {
            "queued"
        } else {
            "dropped, next poll will pick it up"
        };
        Ok(Response::new(Ack {
            message: message.to_string(),
        }))
    }
}

#[derive(Clone)]
struct AuthInterceptor {
    token: Arc<String>,
}

impl Interceptor for AuthInterceptor {
    fn call(&mut self, request: Request<()>) -> Result<Request<()>, Status> {
        let header = request
            .metadata()
            .get("authorization")
            .ok_or_else(|| Status::unauthenticated("missing authorization header"))?;
        let expected = format!("Bearer {}", self.token.as_ref());
        if header
            .to_str()
            .map(|value| value == expected)
            .unwrap_or(false)
        {
            Ok(request)
        } else {
            Err(Status::unauthenticated("invalid authorization header"))
        }
    }
}
