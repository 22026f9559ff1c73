/// Authentication Routes
///
/// Thin JSON adapters over `SessionIssuer`. All security decisions live in
/// the issuer; these handlers only shape requests and responses.

use actix_web::{web, HttpRequest, HttpResponse};
use serde::Deserialize;

use crate::auth::{AuthenticatedUser, SessionIssuer};
use crate::error::{ErrorContext, RequestError};

#[derive(Deserialize)]
pub struct RegisterRequest {
    pub email: String,
    pub username: String,
    pub password: String,
}

#[derive(Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshRequest {
    pub refresh_token: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangePasswordRequest {
    pub current_password: String,
    pub new_password: String,
}

/// POST /auth/register
///
/// # Errors
/// - 400: invalid email, username or password
/// - 409: email or username already registered (case-insensitive)
pub async fn register(
    req: HttpRequest,
    form: web::Json<RegisterRequest>,
    issuer: web::Data<SessionIssuer>,
) -> Result<HttpResponse, RequestError> {
    let context = ErrorContext::for_request(&req, "user_registration");

    let session = issuer
        .register(&form.email, &form.username, &form.password)
        .await
        .map_err(|e| context.fail(e))?;

    Ok(HttpResponse::Created().json(session))
}

/// POST /auth/login
///
/// # Errors
/// - 401: unknown email or wrong password (indistinguishable)
/// - 423: account locked after repeated failures
pub async fn login(
    req: HttpRequest,
    form: web::Json<LoginRequest>,
    issuer: web::Data<SessionIssuer>,
) -> Result<HttpResponse, RequestError> {
    let context = ErrorContext::for_request(&req, "user_login");

    let session = issuer
        .login(&form.email, &form.password)
        .await
        .map_err(|e| context.fail(e))?;

    Ok(HttpResponse::Ok().json(session))
}

/// POST /auth/refresh
///
/// Rotates the refresh token. Replaying a consumed token revokes its family.
///
/// # Errors
/// - 401: unknown, expired, revoked or replayed refresh token
pub async fn refresh(
    req: HttpRequest,
    form: web::Json<RefreshRequest>,
    issuer: web::Data<SessionIssuer>,
) -> Result<HttpResponse, RequestError> {
    let context = ErrorContext::for_request(&req, "token_refresh");

    let tokens = issuer
        .refresh(&form.refresh_token)
        .await
        .map_err(|e| context.fail(e))?;

    Ok(HttpResponse::Ok().json(tokens))
}

/// POST /auth/logout
///
/// **Requires a valid access token.** Always 204 once authenticated.
pub async fn logout(
    req: HttpRequest,
    user: web::ReqData<AuthenticatedUser>,
    form: web::Json<RefreshRequest>,
    issuer: web::Data<SessionIssuer>,
) -> Result<HttpResponse, RequestError> {
    let context = ErrorContext::for_request(&req, "user_logout").with_user_id(user.user_id);

    issuer
        .logout(user.user_id, &form.refresh_token)
        .await
        .map_err(|e| context.fail(e))?;

    Ok(HttpResponse::NoContent().finish())
}

/// POST /auth/change-password
///
/// **Requires a valid access token.**
///
/// # Errors
/// - 401: current password does not match
/// - 400: new password fails validation
pub async fn change_password(
    req: HttpRequest,
    user: web::ReqData<AuthenticatedUser>,
    form: web::Json<ChangePasswordRequest>,
    issuer: web::Data<SessionIssuer>,
) -> Result<HttpResponse, RequestError> {
    let context = ErrorContext::for_request(&req, "change_password").with_user_id(user.user_id);

    issuer
        .change_password(user.user_id, &form.current_password, &form.new_password)
        .await
        .map_err(|e| context.fail(e))?;

    Ok(HttpResponse::NoContent().finish())
}

/// GET /auth/me
///
/// **Requires a valid access token.**
pub async fn get_current_user(
    req: HttpRequest,
    user: web::ReqData<AuthenticatedUser>,
    issuer: web::Data<SessionIssuer>,
) -> Result<HttpResponse, RequestError> {
    let context = ErrorContext::for_request(&req, "current_user").with_user_id(user.user_id);

    let profile = issuer
        .current_user(user.user_id)
        .await
        .map_err(|e| context.fail(e))?;

    Ok(HttpResponse::Ok().json(profile))
}
