use std::net::SocketAddr;

use crate::status::TransitionPolicy;

const DEFAULT_DATABASE: &str = "dakiya";
const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8080";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),

    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, String),
}

/// How access and refresh tokens are signed.
#[derive(Clone)]
pub enum JwtKeys {
    /// Shared secret, HS256.
    Secret(Vec<u8>),
    /// Base64 encoded PEM pair, RS256.
    Rsa {
        private_pem_b64: String,
        public_pem_b64: String,
    },
}

impl std::fmt::Debug for JwtKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Secret(_) => f.write_str("JwtKeys::Secret(..)"),
            Self::Rsa { .. } => f.write_str("JwtKeys::Rsa(..)"),
        }
    }
}

#[derive(Clone)]
pub struct GatewayConfig {
    pub key_id: String,
    pub key_secret: String,
    pub base_url: Option<String>,
}

impl std::fmt::Debug for GatewayConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayConfig")
            .field("key_id", &self.key_id)
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub mongodb_uri: String,
    pub database_name: String,
    pub bind_addr: SocketAddr,
    pub jwt: JwtKeys,
    pub gateway: GatewayConfig,
    pub transition_policy: TransitionPolicy,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads configuration through `lookup`, which returns `None` for unset keys.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let required = |key: &'static str| {
            lookup(key)
                .filter(|it| !it.is_empty())
                .ok_or(ConfigError::Missing(key))
        };

        let bind_addr = lookup("BIND_ADDR").unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string());
        let bind_addr = bind_addr
            .parse()
            .map_err(|_| ConfigError::Invalid("BIND_ADDR", bind_addr))?;

        let jwt = match lookup("JWT_SECRET").filter(|it| !it.is_empty()) {
            Some(secret) => JwtKeys::Secret(secret.into_bytes()),
            None => JwtKeys::Rsa {
                private_pem_b64: required("JWT_SECRET_KEY")?,
                public_pem_b64: required("JWT_PUBLIC_KEY")?,
            },
        };

        let transition_policy = match lookup("STATUS_TRANSITION_POLICY") {
            Some(value) => value
                .parse()
                .map_err(|_| ConfigError::Invalid("STATUS_TRANSITION_POLICY", value))?,
            None => TransitionPolicy::default(),
        };

        Ok(Self {
            mongodb_uri: required("MONGODB_URI")?,
            database_name: lookup("DATABASE_NAME").unwrap_or_else(|| DEFAULT_DATABASE.to_string()),
            bind_addr,
            jwt,
            gateway: GatewayConfig {
                key_id: required("RAZORPAY_KEY_ID")?,
                key_secret: required("RAZORPAY_KEY_SECRET")?,
                base_url: lookup("RAZORPAY_BASE_URL"),
            },
            transition_policy,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use assert_matches::assert_matches;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();

        move |key| map.get(key).cloned()
    }

    const BASE: &[(&str, &str)] = &[
        ("MONGODB_URI", "mongodb://localhost:27017"),
        ("JWT_SECRET", "dev-secret"),
        ("RAZORPAY_KEY_ID", "rzp_test_key"),
        ("RAZORPAY_KEY_SECRET", "rzp_test_secret"),
    ];

    #[test]
    fn test_defaults() {
        let config = Config::from_lookup(lookup(BASE)).unwrap();

        assert_eq!(config.database_name, "dakiya");
        assert_eq!(config.bind_addr, "0.0.0.0:8080".parse().unwrap());
        assert_eq!(config.transition_policy, TransitionPolicy::Override);
        assert_matches!(config.jwt, JwtKeys::Secret(secret) if secret == b"dev-secret");
        assert_eq!(config.gateway.base_url, None);
    }

    #[test]
    fn test_overrides() {
        let mut pairs = BASE.to_vec();
        pairs.push(("DATABASE_NAME", "dakiya-staging"));
        pairs.push(("BIND_ADDR", "127.0.0.1:9000"));
        pairs.push(("STATUS_TRANSITION_POLICY", "guarded"));

        let config = Config::from_lookup(lookup(&pairs)).unwrap();

        assert_eq!(config.database_name, "dakiya-staging");
        assert_eq!(config.bind_addr.port(), 9000);
        assert_eq!(config.transition_policy, TransitionPolicy::Guarded);
    }

    #[test]
    fn test_missing_and_invalid() {
        let pairs: Vec<_> = BASE
            .iter()
            .copied()
            .filter(|(k, _)| *k != "MONGODB_URI")
            .collect();
        assert_matches!(
            Config::from_lookup(lookup(&pairs)),
            Err(ConfigError::Missing("MONGODB_URI"))
        );

        let pairs: Vec<_> = BASE
            .iter()
            .copied()
            .filter(|(k, _)| *k != "JWT_SECRET")
            .collect();
        assert_matches!(
            Config::from_lookup(lookup(&pairs)),
            Err(ConfigError::Missing("JWT_SECRET_KEY"))
        );

        let mut pairs = BASE.to_vec();
        pairs.push(("STATUS_TRANSITION_POLICY", "strict"));
        assert_matches!(
            Config::from_lookup(lookup(&pairs)),
            Err(ConfigError::Invalid("STATUS_TRANSITION_POLICY", _))
        );
    }
}
