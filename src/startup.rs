use actix_web::dev::Server;
use actix_web::{web, App, HttpServer};
use std::net::TcpListener;

use crate::auth::SessionIssuer;
use crate::error::{AppError, ErrorContext, ValidationError};
use crate::middleware::{JwtMiddleware, RequestLogger};
use crate::routes::{change_password, get_current_user, health_check, login, logout, refresh, register};

/// Build the HTTP server around a ready `SessionIssuer`.
///
/// The issuer carries its store, so the same wiring serves Postgres in
/// production and the in-memory store in tests.
pub fn run(listener: TcpListener, issuer: SessionIssuer) -> Result<Server, std::io::Error> {
    let jwt_config = issuer.jwt_settings().clone();
    let issuer = web::Data::new(issuer);

    let server = HttpServer::new(move || {
        // Malformed or incomplete bodies become VALIDATION_ERROR responses
        let json_config = web::JsonConfig::default()
            .limit(4096)
            .error_handler(|err, req| {
                tracing::debug!(error = %err, "Rejected request body");
                ErrorContext::for_request(req, "parse_body")
                    .fail(AppError::from(ValidationError::InvalidFormat("request body")))
                    .into()
            });

        App::new()
            .wrap(RequestLogger)
            .app_data(issuer.clone())
            .app_data(json_config)
            // Public routes
            .route("/health_check", web::get().to(health_check))
            .route("/auth/register", web::post().to(register))
            .route("/auth/login", web::post().to(login))
            .route("/auth/refresh", web::post().to(refresh))
            // Routes requiring an access token
            .service(
                web::resource("/auth/logout")
                    .wrap(JwtMiddleware::new(jwt_config.clone()))
                    .route(web::post().to(logout)),
            )
            .service(
                web::resource("/auth/change-password")
                    .wrap(JwtMiddleware::new(jwt_config.clone()))
                    .route(web::post().to(change_password)),
            )
            .service(
                web::resource("/auth/me")
                    .wrap(JwtMiddleware::new(jwt_config.clone()))
                    .route(web::get().to(get_current_user)),
            )
    })
    .listen(listener)?
    .run();

    Ok(server)
}
