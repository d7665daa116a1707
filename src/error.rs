use axum::{
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};

use crate::{payment::GatewayError, receipt::ReceiptError, status::IllegalTransition};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("validation error: {0}")]
    ValidationError(#[from] validator::ValidationErrors),

    #[error("No resource found")]
    NoResource,

    #[error("{0}")]
    PasswordHashError(#[from] password_hash::Error),

    #[error("{0}")]
    DatabaseError(#[from] mongodb::error::Error),

    #[error("{0}")]
    JWTError(#[from] jsonwebtoken::errors::Error),

    #[error("{0} must unique")]
    MustUniqueError(String),

    #[error("{0}")]
    Unauthorized(UnauthorizedType),

    #[error("You have no permission to access this resource")]
    Forbidden,

    #[error("{0}")]
    BSONSerError(#[from] bson::ser::Error),

    #[error("{0}")]
    BSONDeError(#[from] bson::de::Error),

    #[error("{0}")]
    IllegalTransition(#[from] IllegalTransition),

    #[error("Payment could not be verified")]
    PaymentNotVerified,

    #[error("{0}")]
    GatewayError(#[from] GatewayError),

    #[error("{0}")]
    ReceiptError(#[from] ReceiptError),

    #[error("{1}")]
    CustomStr(StatusCode, &'static str),
}

#[derive(Debug, thiserror::Error)]
pub enum UnauthorizedType {
    #[error("Invalid email or password")]
    WrongUsernameOrPassword,

    #[error("Invalid access token")]
    InvalidAccessToken,

    #[error("Invalid refresh token")]
    InvalidRefreshToken,

    #[error("Invalid or expired reset code")]
    InvalidResetCode,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorJson {
    #[serde(skip_serializing_if = "Option::is_none")]
    errors: Option<serde_json::Value>,
    r#type: String,
    message: String,
}

impl From<Error> for ErrorJson {
    fn from(err: Error) -> Self {
        let message = err.to_string();

        let r#type = err.to_string_variant();

        let errors = match err {
            Error::ValidationError(err) => serde_json::to_value(err).ok(),
            Error::NoResource
            | Error::PasswordHashError(..)
            | Error::DatabaseError(..)
            | Error::JWTError(..)
            | Error::BSONSerError(..)
            | Error::BSONDeError(..)
            | Error::MustUniqueError(..)
            | Error::Unauthorized(..)
            | Error::Forbidden
            | Error::IllegalTransition(..)
            | Error::PaymentNotVerified
            | Error::GatewayError(..)
            | Error::ReceiptError(..)
            | Error::CustomStr(..) => None,
        };

        Self {
            errors,
            message,
            r#type,
        }
    }
}

impl Error {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Unauthorized(..) => StatusCode::UNAUTHORIZED,
            Self::ValidationError(..) | Self::MustUniqueError(..) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            Self::IllegalTransition(..) => StatusCode::CONFLICT,
            Self::PaymentNotVerified => StatusCode::PAYMENT_REQUIRED,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::NoResource => StatusCode::NOT_FOUND,
            Self::GatewayError(..) => StatusCode::BAD_GATEWAY,
            Self::PasswordHashError(..)
            | Self::DatabaseError(..)
            | Self::JWTError(..)
            | Self::BSONSerError(..)
            | Self::BSONDeError(..)
            | Self::ReceiptError(..) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::CustomStr(code, ..) => *code,
        }
    }

    pub fn to_string_variant(&self) -> String {
        macro_rules! match_var {
            ($id:ident !) => {
                Self::$id
            };
            ($id:ident (..)) => {
                Self::$id(..)
            };
            ($id:ident {..}) => {
                Self::$id { .. }
            };
        }

        macro_rules! variant {
            ($($name:ident $tt:tt),+) => {
                match self {
                    $(
                        match_var!($name $tt) => {
                            stringify!($name)
                       }
                    )+
                }
            };
        }

        variant! {
            NoResource!,
            Forbidden!,
            PaymentNotVerified!,
            ValidationError(..),
            PasswordHashError(..),
            DatabaseError(..),
            JWTError(..),
            BSONSerError(..),
            BSONDeError(..),
            MustUniqueError(..),
            Unauthorized(..),
            IllegalTransition(..),
            GatewayError(..),
            ReceiptError(..),
            CustomStr(..)
        }
        .to_string()
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!("error: {:?}", self);
        } else {
            tracing::debug!("rejected: {:?}", self);
        }

        let error = ErrorJson::from(self);

        (status, Json(error)).into_response()
    }
}

impl From<axum::extract::rejection::PathRejection> for Error {
    fn from(_value: axum::extract::rejection::PathRejection) -> Self {
        Self::NoResource
    }
}
