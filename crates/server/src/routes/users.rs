use axum::{
    Json, Router,
    extract::{Path, State},
    response::Json as ResponseJson,
    routing::get,
};
use chrono::NaiveDate;
use chrono_tz::Tz;
use db::models::user::{CreateUser, UpdateUser, User};
use utils::response::ApiResponse;
use uuid::Uuid;

use crate::{AppState, error::ApiError};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/users", get(list_users).post(create_user))
        .route(
            "/users/{id}",
            get(get_user).put(update_user).delete(delete_user),
        )
}

pub async fn list_users(
    State(state): State<AppState>,
) -> Result<ResponseJson<ApiResponse<Vec<User>>>, ApiError> {
    let users = User::find_all(&state.db.pool).await?;
    Ok(ResponseJson(ApiResponse::success(users)))
}

pub async fn get_user(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<ResponseJson<ApiResponse<User>>, ApiError> {
    let user = User::find_by_uuid(&state.db.pool, id)
        .await?
        .ok_or_else(|| ApiError::NotFound("User not found".to_string()))?;
    Ok(ResponseJson(ApiResponse::success(user)))
}

pub async fn create_user(
    State(state): State<AppState>,
    Json(payload): Json<CreateUser>,
) -> Result<ResponseJson<ApiResponse<User>>, ApiError> {
    validate_name("first_name", &payload.first_name)?;
    validate_name("last_name", &payload.last_name)?;
    validate_email(&payload.email)?;
    validate_birthday(&payload.birthday)?;
    validate_timezone(&payload.timezone)?;

    let user = User::create(&state.db.pool, &payload, Uuid::new_v4()).await?;
    tracing::info!(user_id = %user.id, "user created");
    Ok(ResponseJson(ApiResponse::success(user)))
}

pub async fn update_user(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(payload): Json<UpdateUser>,
) -> Result<ResponseJson<ApiResponse<User>>, ApiError> {
    if let Some(first_name) = &payload.first_name {
        validate_name("first_name", first_name)?;
    }
    if let Some(last_name) = &payload.last_name {
        validate_name("last_name", last_name)?;
    }
    if let Some(email) = &payload.email {
        validate_email(email)?;
    }
    if let Some(birthday) = &payload.birthday {
        validate_birthday(birthday)?;
    }
    if let Some(timezone) = &payload.timezone {
        validate_timezone(timezone)?;
    }

    let user = User::update(&state.db.pool, id, &payload).await?;
    Ok(ResponseJson(ApiResponse::success(user)))
}

pub async fn delete_user(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<ResponseJson<ApiResponse<()>>, ApiError> {
    User::delete(&state.db.pool, id).await?;
    tracing::info!(user_id = %id, "user deleted with scheduled messages");
    Ok(ResponseJson(ApiResponse::success(())))
}

fn validate_name(field: &str, value: &str) -> Result<(), ApiError> {
    if value.trim().is_empty() {
        return Err(ApiError::BadRequest(format!("{field} must not be empty")));
    }
    Ok(())
}

fn validate_email(email: &str) -> Result<(), ApiError> {
    let trimmed = email.trim();
    let valid = trimmed
        .split_once('@')
        .is_some_and(|(local, domain)| !local.is_empty() && domain.contains('.'));
    if !valid {
        return Err(ApiError::BadRequest(format!(
            "'{email}' is not a valid email address"
        )));
    }
    Ok(())
}

fn validate_birthday(birthday: &str) -> Result<(), ApiError> {
    NaiveDate::parse_from_str(birthday, "%Y-%m-%d").map_err(|_| {
        ApiError::BadRequest(format!("'{birthday}' is not a valid YYYY-MM-DD date"))
    })?;
    Ok(())
}

fn validate_timezone(timezone: &str) -> Result<(), ApiError> {
    timezone.parse::<Tz>().map_err(|_| {
        ApiError::BadRequest(format!("'{timezone}' is not a known IANA timezone"))
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn email_validation_accepts_plausible_addresses() {
        assert!(validate_email("john.doe@example.com").is_ok());
        assert!(validate_email("a@b.co").is_ok());
        assert!(validate_email("plainaddress").is_err());
        assert!(validate_email("@example.com").is_err());
        assert!(validate_email("user@nodot").is_err());
    }

    #[test]
    fn birthday_validation_requires_a_civil_date() {
        assert!(validate_birthday("1990-05-15").is_ok());
        assert!(validate_birthday("1996-02-29").is_ok());
        assert!(validate_birthday("1990-02-30").is_err());
        assert!(validate_birthday("15/05/1990").is_err());
    }

    #[test]
    fn timezone_validation_requires_a_known_zone() {
        assert!(validate_timezone("America/New_York").is_ok());
        assert!(validate_timezone("Pacific/Auckland").is_ok());
        assert!(validate_timezone("Mars/Olympus_Mons").is_err());
    }
}
