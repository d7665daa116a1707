use argon2::Argon2;
use axum::{
    extract::{FromRef, FromRequestParts, State},
    headers::{authorization::Bearer, Authorization, Cookie},
    http::{header::SET_COOKIE, request::Parts, HeaderName},
    response::AppendHeaders,
    Json, RequestPartsExt, TypedHeader,
};
use bson::oid::ObjectId;
use serde::{Deserialize, Serialize};
use tap::TapFallible;
use validator::Validate;

use crate::{
    error::{Error, UnauthorizedType},
    mongo_ext::Collection,
    util::{hash_password, now, verify_password, FormattedDateTime, ObjectIdString},
};

use super::token::{
    create_refresh_token, decode_access_token, decode_refresh_token, generate_access_token,
    JwtState, RefreshTokenClaims, RefreshTokenCollection,
};

pub const REFRESH_COOKIE: &str = "refresh_token";

#[derive(Clone)]
pub struct UserCollection(pub Collection<UserModel>);

impl std::ops::Deref for UserCollection {
    type Target = Collection<UserModel>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Address {
    pub street: String,
    pub city: String,
    pub state: String,
    pub zip: String,
    pub country: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct UserModel {
    #[serde(rename = "_id")]
    pub id: ObjectId,

    pub email: String,
    pub full_name: String,
    pub phone: String,
    pub address: Address,
    pub password: String,

    #[serde(default)]
    pub role: UserRole,

    pub created_at: bson::DateTime,
}

/// Only changed out of band, never through the API.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    #[default]
    User,
    Admin,
}

/// Who is calling, resolved once from the access token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Session {
    pub id: ObjectId,
    pub role: UserRole,
}

impl Session {
    pub fn from_token(jwt_state: &JwtState, token: &str) -> Result<Self, Error> {
        let token = decode_access_token(jwt_state, token)
            .map_err(|_| Error::Unauthorized(UnauthorizedType::InvalidAccessToken))?;

        if token.claims.is_expired() {
            return Err(Error::Unauthorized(UnauthorizedType::InvalidAccessToken));
        }

        Ok(Self {
            id: token.claims.sub.0,
            role: token.claims.user_role,
        })
    }

    pub fn is_admin(&self) -> bool {
        self.role == UserRole::Admin
    }

    /// Owners see their own records, administrators see everything.
    pub fn can_view(&self, owner: ObjectId) -> bool {
        self.is_admin() || self.id == owner
    }
}

#[axum::async_trait]
impl<S> FromRequestParts<S> for Session
where
    JwtState: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let TypedHeader(Authorization(token)) = parts
            .extract::<TypedHeader<Authorization<Bearer>>>()
            .await
            .map_err(|_| Error::Unauthorized(UnauthorizedType::InvalidAccessToken))?;

        let jwt = JwtState::from_ref(state);

        Self::from_token(&jwt, token.token())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AdminSession(pub Session);

#[axum::async_trait]
impl<S> FromRequestParts<S> for AdminSession
where
    JwtState: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let session = parts.extract_with_state::<Session, _>(state).await?;

        if !session.is_admin() {
            return Err(Error::Forbidden)
                .tap_err(|_| tracing::debug!("non admin {} tried an admin route", session.id));
        }

        Ok(Self(session))
    }
}

/// A signed-in account that is not an administrator.
#[derive(Debug, Clone, Copy)]
pub struct CustomerSession(pub Session);

#[axum::async_trait]
impl<S> FromRequestParts<S> for CustomerSession
where
    JwtState: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let session = parts.extract_with_state::<Session, _>(state).await?;

        if session.is_admin() {
            return Err(Error::Forbidden)
                .tap_err(|_| tracing::debug!("admin {} tried a customer route", session.id));
        }

        Ok(Self(session))
    }
}

#[derive(Debug)]
pub struct RefreshToken(String);

#[axum::async_trait]
impl<S> FromRequestParts<S> for RefreshToken
where
    S: Send + Sync,
{
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let cookie = parts
            .extract::<TypedHeader<Cookie>>()
            .await
            .map_err(|_| Error::Unauthorized(UnauthorizedType::InvalidRefreshToken))
            .tap_err(|_| tracing::debug!("cookie not found"))?;

        let refresh_token = cookie
            .get(REFRESH_COOKIE)
            .ok_or(Error::Unauthorized(UnauthorizedType::InvalidRefreshToken))
            .tap_err(|_| tracing::debug!("token not found"))?;

        Ok(Self(refresh_token.to_string()))
    }
}

#[derive(Debug)]
pub struct RefreshClaim(pub RefreshTokenClaims, pub String);

impl RefreshClaim {
    pub fn from_token(jwt_state: &JwtState, refresh_token: String) -> Result<Self, Error> {
        let token = decode_refresh_token(jwt_state, &refresh_token)
            .map_err(|_| Error::Unauthorized(UnauthorizedType::InvalidRefreshToken))?;

        Ok(Self(token.claims, refresh_token))
    }
}

#[axum::async_trait]
impl<S> FromRequestParts<S> for RefreshClaim
where
    JwtState: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let RefreshToken(refresh_token) = parts.extract::<RefreshToken>().await?;

        let jwt = JwtState::from_ref(state);

        Self::from_token(&jwt, refresh_token)
    }
}

impl UserModel {
    pub async fn from_id(id: ObjectId, users: &UserCollection) -> Result<Self, Error> {
        users
            .find_one_by_id(id)
            .await?
            .ok_or(Error::Unauthorized(UnauthorizedType::InvalidAccessToken))
    }
}

#[axum::async_trait]
impl<S> FromRequestParts<S> for UserModel
where
    JwtState: FromRef<S>,
    UserCollection: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let session = parts.extract_with_state::<Session, _>(state).await?;
        let users = UserCollection::from_ref(state);
        Self::from_id(session.id, &users).await
    }
}

pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

#[derive(Validate, Serialize, Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    #[validate(
        custom = "crate::validation::non_blank",
        regex(path = "crate::validation::EMAIL_SHAPE", message = "Invalid email format")
    )]
    pub email: String,

    #[validate(
        custom = "crate::validation::non_blank",
        length(min = 6, message = "Password must be at least 6 characters")
    )]
    pub password: String,

    #[validate(custom = "crate::validation::non_blank")]
    pub full_name: String,

    #[validate(
        custom = "crate::validation::non_blank",
        length(min = 10, message = "Phone number must be at least 10 digits")
    )]
    pub phone: String,

    #[validate(custom = "crate::validation::non_blank")]
    pub street: String,

    #[validate(custom = "crate::validation::non_blank")]
    pub city: String,

    #[validate(custom = "crate::validation::non_blank")]
    pub state: String,

    #[validate(
        custom = "crate::validation::non_blank",
        length(min = 4, message = "ZIP code must be at least 4 digits")
    )]
    pub zip: String,

    #[validate(custom = "crate::validation::non_blank")]
    pub country: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ProfileResponse {
    pub id: ObjectIdString,

    pub email: String,
    pub full_name: String,
    pub phone: String,
    pub address: Address,
    pub role: UserRole,

    pub created_at: FormattedDateTime,
}

impl From<UserModel> for ProfileResponse {
    fn from(value: UserModel) -> Self {
        Self {
            id: value.id.into(),
            email: value.email,
            full_name: value.full_name,
            phone: value.phone,
            address: value.address,
            role: value.role,

            created_at: value.created_at.into(),
        }
    }
}

pub async fn create_user(
    users: &UserCollection,
    argon: &Argon2<'_>,
    request: RegisterRequest,
    role: UserRole,
) -> Result<UserModel, Error> {
    request.validate()?;

    let email = normalize_email(&request.email);
    let count = users
        .count_documents(bson::doc! { "email": &email }, None)
        .await?;

    if count > 0 {
        return Err(Error::MustUniqueError("email".to_string()));
    }

    let model = UserModel {
        id: ObjectId::new(),
        email,
        full_name: request.full_name.trim().to_string(),
        phone: request.phone.trim().to_string(),
        address: Address {
            street: request.street,
            city: request.city,
            state: request.state,
            zip: request.zip,
            country: request.country,
        },
        password: hash_password(argon, &request.password)?,
        role,
        created_at: now(),
    };
    users.insert_one(&model, None).await?;

    Ok(model)
}

#[tracing::instrument(skip_all, fields(email = %request.email))]
pub async fn register(
    State(users): State<UserCollection>,
    State(argon): State<Argon2<'static>>,
    Json(request): Json<RegisterRequest>,
) -> Result<Json<ProfileResponse>, Error> {
    let user = create_user(&users, &argon, request, UserRole::User).await?;

    tracing::info!("registered user {}", user.id);

    Ok(Json(user.into()))
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct LoginResponse {
    pub refresh_token: String,
    pub access_token: String,
    pub expired_at: FormattedDateTime,
    pub role: UserRole,
}

type CookieHeader = AppendHeaders<[(HeaderName, String); 1]>;

fn refresh_cookie(value: &str, max_age: Option<i64>) -> CookieHeader {
    let cookie = match max_age {
        Some(age) => format!("{REFRESH_COOKIE}={value}; HttpOnly; Path=/; Max-Age={age}"),
        None => format!("{REFRESH_COOKIE}={value}; HttpOnly; Path=/"),
    };

    AppendHeaders([(SET_COOKIE, cookie)])
}

#[tracing::instrument(skip_all, fields(email = %request.email))]
pub async fn login(
    State(users): State<UserCollection>,
    State(refresh_tokens): State<RefreshTokenCollection>,
    State(jwt_state): State<JwtState>,
    State(argon): State<Argon2<'static>>,
    Json(request): Json<LoginRequest>,
) -> Result<(CookieHeader, Json<LoginResponse>), Error> {
    let user = users
        .find_one(
            bson::doc! {
                "email": normalize_email(&request.email)
            },
            None,
        )
        .await?;

    let user = match user {
        Some(user) if verify_password(&argon, &request.password, &user.password) => user,
        _ => {
            return Err(Error::Unauthorized(
                UnauthorizedType::WrongUsernameOrPassword,
            ))
        }
    };

    let refresh_token = create_refresh_token(&jwt_state, &argon, &refresh_tokens, &user).await?;
    let access_token = generate_access_token(&jwt_state, &user)?;

    tracing::info!("user {} signed in", user.id);

    Ok((
        refresh_cookie(&refresh_token, None),
        Json(LoginResponse {
            refresh_token,
            access_token: access_token.token,
            expired_at: access_token.expired_at.into(),
            role: user.role,
        }),
    ))
}

pub async fn logout(
    State(refresh_tokens): State<RefreshTokenCollection>,
    RefreshClaim(claim, _): RefreshClaim,
) -> Result<CookieHeader, Error> {
    let removed = refresh_tokens.delete_one_by_id(claim.sub.0).await?;

    if !removed {
        return Err(Error::Unauthorized(UnauthorizedType::InvalidRefreshToken));
    }

    tracing::info!("user {} signed out", claim.user_id);

    Ok(refresh_cookie("", Some(0)))
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RefreshAccessTokenResponse {
    pub access_token: String,
    pub expired_at: FormattedDateTime,
    pub role: UserRole,
}

/// Issues a new access token; the role is read again here, so a role change
/// takes effect on the next refresh.
pub async fn refresh_access_token(
    State(users): State<UserCollection>,
    State(refresh_tokens): State<RefreshTokenCollection>,
    State(jwt_state): State<JwtState>,
    State(argon): State<Argon2<'static>>,
    RefreshClaim(claim, refresh_token): RefreshClaim,
) -> Result<Json<RefreshAccessTokenResponse>, Error> {
    if claim.is_expired() {
        refresh_tokens.delete_one_by_id(claim.sub.0).await?;
        return Err(Error::Unauthorized(UnauthorizedType::InvalidRefreshToken));
    }

    let model = refresh_tokens
        .find_one_by_id(claim.sub.0)
        .await?
        .ok_or(Error::Unauthorized(UnauthorizedType::InvalidRefreshToken))?;

    if !verify_password(&argon, &refresh_token, &model.token) {
        refresh_tokens.delete_one_by_id(claim.sub.0).await?;
        return Err(Error::Unauthorized(UnauthorizedType::InvalidRefreshToken));
    }

    let user = users
        .find_one_by_id(claim.user_id.0)
        .await?
        .ok_or(Error::Unauthorized(UnauthorizedType::InvalidRefreshToken))?;

    let access_token = generate_access_token(&jwt_state, &user)?;

    Ok(Json(RefreshAccessTokenResponse {
        access_token: access_token.token,
        expired_at: access_token.expired_at.into(),
        role: user.role,
    }))
}
