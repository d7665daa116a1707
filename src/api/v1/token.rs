use argon2::Argon2;
use base64::{engine::general_purpose, Engine as _};
use bson::oid::ObjectId;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, TokenData, Validation};
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};

use crate::{
    config::JwtKeys,
    error::Error,
    mongo_ext::Collection,
    util::{hash_password, ObjectIdString},
};

use super::auth::{UserModel, UserRole};

pub const ACCESS_TOKEN_TTL: Duration = Duration::minutes(10);
pub const REFRESH_TOKEN_TTL: Duration = Duration::weeks(1);

#[derive(Clone)]
pub struct JwtState {
    validation: Validation,
    header: Header,

    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
}

impl JwtState {
    pub fn new(keys: &JwtKeys) -> anyhow::Result<Self> {
        match keys {
            JwtKeys::Secret(secret) => Ok(Self::from_secret(secret)),
            JwtKeys::Rsa {
                private_pem_b64,
                public_pem_b64,
            } => {
                let private_pem = general_purpose::STANDARD.decode(private_pem_b64)?;
                let public_pem = general_purpose::STANDARD.decode(public_pem_b64)?;

                Ok(Self::with_algorithm(
                    Algorithm::RS256,
                    EncodingKey::from_rsa_pem(&private_pem)?,
                    DecodingKey::from_rsa_pem(&public_pem)?,
                ))
            }
        }
    }

    pub fn from_secret(secret: &[u8]) -> Self {
        Self::with_algorithm(
            Algorithm::HS256,
            EncodingKey::from_secret(secret),
            DecodingKey::from_secret(secret),
        )
    }

    fn with_algorithm(
        algorithm: Algorithm,
        encoding_key: EncodingKey,
        decoding_key: DecodingKey,
    ) -> Self {
        let header = Header::new(algorithm);
        let mut validation = Validation::new(algorithm);
        // expiry is checked by the claims themselves so callers can tell the cases apart
        validation.validate_exp = false;

        Self {
            header,
            validation,

            encoding_key,
            decoding_key,
        }
    }
}

#[derive(Clone)]
pub struct RefreshTokenCollection(pub Collection<RefreshTokenModel>);

impl std::ops::Deref for RefreshTokenCollection {
    type Target = Collection<RefreshTokenModel>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

pub fn current_timestamp() -> OffsetDateTime {
    OffsetDateTime::now_utc()
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RefreshTokenClaims {
    pub sub: ObjectIdString,
    pub user_id: ObjectIdString,
    pub exp: i64,
}

impl RefreshTokenClaims {
    pub fn is_expired(&self) -> bool {
        self.exp < current_timestamp().unix_timestamp()
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RefreshTokenModel {
    #[serde(rename = "_id")]
    pub id: ObjectId,
    pub user_id: ObjectId,
    pub token: String,
    pub expired_at: bson::DateTime,
}

pub async fn create_refresh_token(
    jwt_state: &JwtState,
    argon: &Argon2<'_>,
    refresh_tokens: &RefreshTokenCollection,
    user: &UserModel,
) -> Result<String, Error> {
    let (model, token) = generate_refresh_token_model(jwt_state, argon, user)?;

    refresh_tokens.insert_one(model, None).await?;

    Ok(token)
}

pub fn generate_refresh_token_model(
    jwt_state: &JwtState,
    argon: &Argon2,
    user: &UserModel,
) -> Result<(RefreshTokenModel, String), Error> {
    let expired_at = current_timestamp() + REFRESH_TOKEN_TTL;

    generate_refresh_token_model_with_exp(jwt_state, argon, user, expired_at)
}

pub fn generate_refresh_token_model_with_exp(
    jwt_state: &JwtState,
    argon: &Argon2,
    user: &UserModel,
    expired_at: OffsetDateTime,
) -> Result<(RefreshTokenModel, String), Error> {
    let id = ObjectId::new();
    let token =
        generate_refresh_token_string(jwt_state, id, user.id, expired_at.unix_timestamp())?;

    Ok((
        RefreshTokenModel {
            id,
            user_id: user.id,
            token: hash_password(argon, &token)?,
            expired_at: expired_at.into(),
        },
        token,
    ))
}

pub fn generate_refresh_token_string(
    jwt_state: &JwtState,
    id: ObjectId,
    user_id: ObjectId,
    exp: i64,
) -> Result<String, Error> {
    let claims = RefreshTokenClaims {
        sub: id.into(),
        user_id: user_id.into(),
        exp,
    };

    jsonwebtoken::encode(&jwt_state.header, &claims, &jwt_state.encoding_key).map_err(Into::into)
}

pub fn decode_refresh_token(
    jwt_state: &JwtState,
    token: &str,
) -> Result<TokenData<RefreshTokenClaims>, Error> {
    jsonwebtoken::decode(token, &jwt_state.decoding_key, &jwt_state.validation).map_err(Into::into)
}

/// The role travels inside the access token, so a session resolves it once at
/// login or refresh instead of on every request.
#[derive(Serialize, Deserialize)]
pub struct AccessTokenClaims {
    pub sub: ObjectIdString,
    pub user_role: UserRole,
    pub exp: i64,
}

impl AccessTokenClaims {
    pub fn is_expired(&self) -> bool {
        self.exp < current_timestamp().unix_timestamp()
    }
}

pub struct GenerateAccessTokenResponse {
    pub expired_at: OffsetDateTime,
    pub token: String,
}

pub fn generate_access_token(
    jwt_state: &JwtState,
    user: &UserModel,
) -> Result<GenerateAccessTokenResponse, Error> {
    let expired_at = current_timestamp() + ACCESS_TOKEN_TTL;
    let token = generate_access_token_with_exp(jwt_state, user, expired_at.unix_timestamp())?;

    Ok(GenerateAccessTokenResponse { expired_at, token })
}

pub fn generate_access_token_with_exp(
    jwt_state: &JwtState,
    user: &UserModel,
    exp: i64,
) -> Result<String, Error> {
    jsonwebtoken::encode(
        &jwt_state.header,
        &AccessTokenClaims {
            sub: user.id.into(),
            user_role: user.role,
            exp,
        },
        &jwt_state.encoding_key,
    )
    .map_err(Into::into)
}

pub fn decode_access_token(
    jwt_state: &JwtState,
    token: &str,
) -> Result<TokenData<AccessTokenClaims>, Error> {
    jsonwebtoken::decode(token, &jwt_state.decoding_key, &jwt_state.validation).map_err(Into::into)
}
