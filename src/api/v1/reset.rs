//! Password reset by a short-lived one-time code.
//!
//! Only the newest code of an account is live, and each code allows a
//! bounded number of guesses before it is burned.

use std::sync::Arc;

use argon2::Argon2;
use axum::{extract::State, http::StatusCode, Json};
use bson::oid::ObjectId;
use mongodb::options::FindOneOptions;
use password_hash::rand_core::{OsRng, RngCore};
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};
use validator::Validate;

use crate::{
    error::{Error, UnauthorizedType},
    mongo_ext::Collection,
    util::{hash_password, now, verify_password},
};

use super::{
    auth::{normalize_email, UserCollection, UserModel},
    token::RefreshTokenCollection,
};

pub const RESET_CODE_TTL: Duration = Duration::hours(1);

/// Wrong guesses a code survives.
pub const MAX_RESET_ATTEMPTS: i32 = 5;

#[derive(Clone)]
pub struct PasswordResetCollection(pub Collection<PasswordResetModel>);

impl std::ops::Deref for PasswordResetCollection {
    type Target = Collection<PasswordResetModel>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct PasswordResetModel {
    #[serde(rename = "_id")]
    pub id: ObjectId,
    pub user_id: ObjectId,
    /// Argon2 hash of the code.
    pub code: String,
    pub expired_at: bson::DateTime,
    pub used_at: Option<bson::DateTime>,
    #[serde(default)]
    pub attempts: i32,
}

impl PasswordResetModel {
    pub fn is_usable(&self, at: OffsetDateTime) -> bool {
        self.used_at.is_none()
            && self.attempts < MAX_RESET_ATTEMPTS
            && OffsetDateTime::from(self.expired_at) > at
    }
}

/// Delivers reset codes to their owners.
#[axum::async_trait]
pub trait ResetNotifier: Send + Sync {
    async fn send_code(&self, user: &UserModel, code: &str) -> Result<(), Error>;
}

/// Writes the code to the log; stands in until a mail transport is configured.
pub struct LogNotifier;

#[axum::async_trait]
impl ResetNotifier for LogNotifier {
    async fn send_code(&self, user: &UserModel, code: &str) -> Result<(), Error> {
        tracing::info!(email = %user.email, "password reset code {}", code);
        Ok(())
    }
}

#[derive(Clone)]
pub struct Notifier(pub Arc<dyn ResetNotifier>);

impl std::ops::Deref for Notifier {
    type Target = dyn ResetNotifier;

    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

/// Six decimal digits.
pub fn generate_code() -> String {
    format!("{:06}", OsRng.next_u32() % 1_000_000)
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ResetRequest {
    pub email: String,
}

/// Always answers `202`, so the endpoint cannot be used to probe for accounts.
#[tracing::instrument(skip_all)]
pub async fn request_reset(
    State(users): State<UserCollection>,
    State(resets): State<PasswordResetCollection>,
    State(notifier): State<Notifier>,
    State(argon): State<Argon2<'static>>,
    Json(request): Json<ResetRequest>,
) -> Result<StatusCode, Error> {
    let user = users
        .find_one(bson::doc! { "email": normalize_email(&request.email) }, None)
        .await?;

    let user = match user {
        Some(user) => user,
        None => {
            tracing::debug!("reset requested for unknown email");
            return Ok(StatusCode::ACCEPTED);
        }
    };

    // a new code retires every earlier one
    resets
        .update_many(
            bson::doc! { "user_id": user.id, "used_at": null },
            bson::doc! { "$set": { "used_at": now() } },
            None,
        )
        .await?;

    let code = generate_code();
    resets
        .insert_one(
            PasswordResetModel {
                id: ObjectId::new(),
                user_id: user.id,
                code: hash_password(&argon, &code)?,
                expired_at: (OffsetDateTime::now_utc() + RESET_CODE_TTL).into(),
                used_at: None,
                attempts: 0,
            },
            None,
        )
        .await?;

    notifier.send_code(&user, &code).await?;

    Ok(StatusCode::ACCEPTED)
}

#[derive(Validate, Serialize, Deserialize, Debug, Clone)]
pub struct ResetConfirmRequest {
    pub email: String,
    pub code: String,

    #[validate(length(min = 6, message = "Password must be at least 6 characters"))]
    pub password: String,
}

/// Sets the new password, burns the code and signs the account out everywhere.
#[tracing::instrument(skip_all)]
pub async fn confirm_reset(
    State(users): State<UserCollection>,
    State(resets): State<PasswordResetCollection>,
    State(refresh_tokens): State<RefreshTokenCollection>,
    State(argon): State<Argon2<'static>>,
    Json(request): Json<ResetConfirmRequest>,
) -> Result<StatusCode, Error> {
    request.validate()?;

    let invalid = || Error::Unauthorized(UnauthorizedType::InvalidResetCode);

    let user = users
        .find_one(bson::doc! { "email": normalize_email(&request.email) }, None)
        .await?
        .ok_or_else(invalid)?;

    let reset = resets
        .find_one(
            bson::doc! { "user_id": user.id, "used_at": null },
            FindOneOptions::builder()
                .sort(bson::doc! { "expired_at": -1 })
                .build(),
        )
        .await?
        .filter(|it| it.is_usable(OffsetDateTime::now_utc()))
        .ok_or_else(invalid)?;

    // the attempt is counted before the code is checked, so parallel guesses
    // cannot exceed the limit
    let counted = resets
        .update_one(
            bson::doc! {
                "_id": reset.id,
                "used_at": null,
                "attempts": { "$lt": MAX_RESET_ATTEMPTS },
            },
            bson::doc! { "$inc": { "attempts": 1 } },
            None,
        )
        .await?;
    if counted.modified_count == 0 {
        return Err(invalid());
    }

    if !verify_password(&argon, request.code.trim(), &reset.code) {
        tracing::debug!("wrong reset code for {}", user.id);
        return Err(invalid());
    }

    let burned = resets
        .update_one(
            bson::doc! { "_id": reset.id, "used_at": null },
            bson::doc! { "$set": { "used_at": now() } },
            None,
        )
        .await?;
    if burned.modified_count == 0 {
        return Err(invalid());
    }

    let password = hash_password(&argon, &request.password)?;
    users
        .update_one_by_id(user.id, bson::doc! { "$set": { "password": password } })
        .await?;
    refresh_tokens
        .delete_many(bson::doc! { "user_id": user.id }, None)
        .await?;

    tracing::info!("password reset for {}", user.id);

    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use assert_matches::assert_matches;

    use super::*;
    use crate::api::v1::{
        auth::UserRole,
        tests::{bootstrap, Bootstrap},
    };

    #[test]
    fn test_generate_code() {
        for _ in 0..100 {
            let code = generate_code();
            assert_eq!(code.len(), 6);
            assert!(code.chars().all(|it| it.is_ascii_digit()));
        }
    }

    #[test]
    fn test_is_usable() {
        let now = OffsetDateTime::now_utc();
        let mut reset = PasswordResetModel {
            id: ObjectId::new(),
            user_id: ObjectId::new(),
            code: String::new(),
            expired_at: (now + RESET_CODE_TTL).into(),
            used_at: None,
            attempts: 0,
        };
        assert!(reset.is_usable(now));
        assert!(!reset.is_usable(now + Duration::hours(2)));

        reset.attempts = MAX_RESET_ATTEMPTS - 1;
        assert!(reset.is_usable(now));
        reset.attempts = MAX_RESET_ATTEMPTS;
        assert!(!reset.is_usable(now));
        reset.attempts = 0;

        reset.used_at = Some(crate::util::now());
        assert!(!reset.is_usable(now));
    }

    #[derive(Default)]
    struct RecordingNotifier {
        codes: Mutex<Vec<String>>,
    }

    #[axum::async_trait]
    impl ResetNotifier for RecordingNotifier {
        async fn send_code(&self, _user: &UserModel, code: &str) -> Result<(), Error> {
            self.codes.lock().unwrap().push(code.to_string());
            Ok(())
        }
    }

    #[tokio::test]
    #[ignore = "needs MONGODB_URI pointing at a replica set"]
    async fn test_reset_flow() {
        let bootstrap = bootstrap().await;
        let (user, _) = bootstrap.create_user("asha@example.in", UserRole::User).await;
        let recorder = Arc::new(RecordingNotifier::default());

        let status = request_reset(
            bootstrap.user_collection(),
            bootstrap.password_reset_collection(),
            State(Notifier(recorder.clone())),
            bootstrap.argon(),
            Json(ResetRequest {
                email: "nobody@example.in".to_string(),
            }),
        )
        .await
        .unwrap();
        assert_eq!(status, StatusCode::ACCEPTED);
        assert!(recorder.codes.lock().unwrap().is_empty());

        request_reset(
            bootstrap.user_collection(),
            bootstrap.password_reset_collection(),
            State(Notifier(recorder.clone())),
            bootstrap.argon(),
            Json(ResetRequest {
                email: " ASHA@example.in".to_string(),
            }),
        )
        .await
        .unwrap();
        let code = recorder.codes.lock().unwrap()[0].clone();

        let confirm = |code: String| {
            confirm_reset(
                bootstrap.user_collection(),
                bootstrap.password_reset_collection(),
                bootstrap.refresh_token_collection(),
                bootstrap.argon(),
                Json(ResetConfirmRequest {
                    email: "asha@example.in".to_string(),
                    code,
                    password: "brandnew1".to_string(),
                }),
            )
        };

        let wrong = if code == "000000" { "000001" } else { "000000" };
        let err = confirm(wrong.to_string()).await.unwrap_err();
        assert_matches!(err, Error::Unauthorized(UnauthorizedType::InvalidResetCode));

        assert_eq!(confirm(code.clone()).await.unwrap(), StatusCode::NO_CONTENT);

        let err = confirm(code).await.unwrap_err();
        assert_matches!(err, Error::Unauthorized(UnauthorizedType::InvalidResetCode));

        let stored = bootstrap
            .app_state
            .user_collection
            .find_one_by_id(user.id)
            .await
            .unwrap()
            .unwrap();
        assert!(verify_password(
            &bootstrap.app_state.argon,
            "brandnew1",
            &stored.password
        ));

        bootstrap.teardown().await;
    }

    async fn request_code(bootstrap: &Bootstrap, recorder: &Arc<RecordingNotifier>) -> String {
        request_reset(
            bootstrap.user_collection(),
            bootstrap.password_reset_collection(),
            State(Notifier(recorder.clone())),
            bootstrap.argon(),
            Json(ResetRequest {
                email: "asha@example.in".to_string(),
            }),
        )
        .await
        .unwrap();

        recorder.codes.lock().unwrap().last().unwrap().clone()
    }

    async fn confirm_code(bootstrap: &Bootstrap, code: &str) -> Result<StatusCode, Error> {
        confirm_reset(
            bootstrap.user_collection(),
            bootstrap.password_reset_collection(),
            bootstrap.refresh_token_collection(),
            bootstrap.argon(),
            Json(ResetConfirmRequest {
                email: "asha@example.in".to_string(),
                code: code.to_string(),
                password: "brandnew1".to_string(),
            }),
        )
        .await
    }

    fn other_code(code: &str) -> &'static str {
        if code == "000000" {
            "000001"
        } else {
            "000000"
        }
    }

    #[tokio::test]
    #[ignore = "needs MONGODB_URI pointing at a replica set"]
    async fn test_only_latest_code_is_live() {
        let bootstrap = bootstrap().await;
        bootstrap.create_user("asha@example.in", UserRole::User).await;
        let recorder = Arc::new(RecordingNotifier::default());

        let first = request_code(&bootstrap, &recorder).await;
        let second = request_code(&bootstrap, &recorder).await;

        if first != second {
            let err = confirm_code(&bootstrap, &first).await.unwrap_err();
            assert_matches!(err, Error::Unauthorized(UnauthorizedType::InvalidResetCode));
        }
        assert_eq!(
            confirm_code(&bootstrap, &second).await.unwrap(),
            StatusCode::NO_CONTENT
        );

        bootstrap.teardown().await;
    }

    #[tokio::test]
    #[ignore = "needs MONGODB_URI pointing at a replica set"]
    async fn test_code_is_burned_after_too_many_guesses() {
        let bootstrap = bootstrap().await;
        bootstrap.create_user("asha@example.in", UserRole::User).await;
        let recorder = Arc::new(RecordingNotifier::default());

        let code = request_code(&bootstrap, &recorder).await;
        for _ in 0..MAX_RESET_ATTEMPTS {
            let err = confirm_code(&bootstrap, other_code(&code)).await.unwrap_err();
            assert_matches!(err, Error::Unauthorized(UnauthorizedType::InvalidResetCode));
        }

        let err = confirm_code(&bootstrap, &code).await.unwrap_err();
        assert_matches!(err, Error::Unauthorized(UnauthorizedType::InvalidResetCode));

        bootstrap.teardown().await;
    }
}
