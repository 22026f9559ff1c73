use actix_web::HttpResponse;

/// GET /health_check
///
/// Liveness only; does not touch the store.
pub async fn health_check() -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({ "status": "ok" }))
}
