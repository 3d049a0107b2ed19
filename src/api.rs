use actix_web::http::StatusCode;
use actix_web::{web, HttpResponse, Responder};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::account_pool::PoolStatus;
use crate::error::GatewayError;
use crate::gateway::Gateway;
use crate::metrics;
use crate::model::{ErrorKind, SubmitRequest};

#[derive(Serialize)]
pub struct HealthResponse {
    status: String,
    version: String,
    in_flight: usize,
}

#[derive(Debug, Deserialize)]
pub struct SubmitQuery {
    /// `false` returns as soon as the request is queued
    #[serde(default = "default_wait")]
    pub wait: bool,
}

fn default_wait() -> bool {
    true
}

#[derive(Serialize)]
struct Accepted {
    request_id: String,
    correlation_id: String,
}

#[derive(Serialize)]
struct ApiError {
    kind: ErrorKind,
    message: String,
}

fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::InvalidRequest => StatusCode::BAD_REQUEST,
        ErrorKind::QueueFull | ErrorKind::RateLimited => StatusCode::TOO_MANY_REQUESTS,
        ErrorKind::CircuitOpen => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::BackendTransient => StatusCode::BAD_GATEWAY,
        ErrorKind::BackendPermanent => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorKind::TimedOut => StatusCode::GATEWAY_TIMEOUT,
        ErrorKind::Cancelled => StatusCode::CONFLICT,
    }
}

fn rejection(e: GatewayError) -> HttpResponse {
    let kind = e.kind();
    let status = match e {
        GatewayError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
        _ => status_for(kind),
    };
    HttpResponse::build(status).json(ApiError {
        kind,
        message: e.to_string(),
    })
}

pub async fn health_check(gateway: web::Data<Arc<Gateway>>) -> impl Responder {
    let degraded = gateway
        .pool_health()
        .iter()
        .any(|pool| pool.status != PoolStatus::Ready);
    HttpResponse::Ok().json(HealthResponse {
        status: if degraded { "degraded" } else { "ok" }.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        in_flight: gateway.in_flight(),
    })
}

pub async fn submit_request(
    gateway: web::Data<Arc<Gateway>>,
    query: web::Query<SubmitQuery>,
    body: web::Json<SubmitRequest>,
) -> impl Responder {
    let handle = match gateway.submit(body.into_inner()) {
        Ok(handle) => handle,
        Err(e) => return rejection(e),
    };

    if !query.wait {
        return HttpResponse::Accepted().json(Accepted {
            request_id: handle.request_id().to_string(),
            correlation_id: handle.correlation_id().to_string(),
        });
    }

    let response = handle.await;
    let status = response.error_kind().map_or(StatusCode::OK, status_for);
    HttpResponse::build(status).json(response)
}

pub async fn cancel_request(
    gateway: web::Data<Arc<Gateway>>,
    path: web::Path<String>,
) -> impl Responder {
    let request_id = path.into_inner();
    if gateway.cancel(&request_id) {
        HttpResponse::Accepted().json(serde_json::json!({
            "request_id": request_id,
            "cancel_requested": true
        }))
    } else {
        HttpResponse::NotFound().json(ApiError {
            kind: ErrorKind::InvalidRequest,
            message: format!("no live request '{}'", request_id),
        })
    }
}

pub async fn get_pools(gateway: web::Data<Arc<Gateway>>) -> impl Responder {
    HttpResponse::Ok().json(serde_json::json!({
        "pools": gateway.pool_health()
    }))
}

pub async fn get_metrics() -> impl Responder {
    match metrics::render() {
        Ok(body) => HttpResponse::Ok()
            .content_type("text/plain; version=0.0.4")
            .body(body),
        Err(e) => HttpResponse::InternalServerError().body(e.to_string()),
    }
}

// Define scope configuration
pub fn config(cfg: &mut web::ServiceConfig) {
    cfg.service(web::resource("/health").route(web::get().to(health_check)))
        .service(web::resource("/metrics").route(web::get().to(get_metrics)))
        .service(web::resource("/v1/pools").route(web::get().to(get_pools)))
        .service(web::resource("/v1/requests").route(web::post().to(submit_request)))
        .service(
            web::resource("/v1/requests/{request_id}").route(web::delete().to(cancel_request)),
        );
}
