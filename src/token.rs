//! 会话令牌的签发与校验（HS256 JWT）。

use chrono::{DateTime, TimeDelta, Utc};
use httpdate::fmt_http_date;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime};
use tracing::debug;
use uuid::Uuid;

use crate::error::{ApiError, ErrorKind};

/// 令牌内携带的声明。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionClaims {
    pub login: String,
    pub iat: i64,
    pub exp: i64,
    /// Unique per issuance, so two logins in the same second still differ.
    pub jti: String,
}

/// 已签发的会话令牌。
#[derive(Debug, Clone)]
pub struct SessionToken {
    pub login: String,
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

impl SessionToken {
    /// HTTP 日期格式的过期时间。
    pub fn expires_http(&self) -> String {
        fmt_http_date(SystemTime::from(self.expires_at))
    }
}

/// 使用进程级对称密钥签发与校验令牌，启动后只读。
pub struct TokenService {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
    ttl: Duration,
}

impl std::fmt::Debug for TokenService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenService")
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl TokenService {
    pub fn new(secret: &[u8], ttl: Duration) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.validate_exp = true;
        validation.set_required_spec_claims(&["exp"]);
        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            validation,
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// 为已注册的登录名签发令牌。
    pub fn issue(&self, login: &str) -> Result<SessionToken, ApiError> {
        self.issue_at(login, Utc::now())
    }

    fn issue_at(&self, login: &str, now: DateTime<Utc>) -> Result<SessionToken, ApiError> {
        if login.is_empty() {
            return Err(ApiError::bad_request("login is required").with_sender("token.issue"));
        }
        let expires_at = i64::try_from(self.ttl.as_secs())
            .ok()
            .and_then(TimeDelta::try_seconds)
            .and_then(|ttl| now.checked_add_signed(ttl))
            .ok_or_else(|| {
                ApiError::internal("token ttl out of range").with_sender("token.issue")
            })?;
        let claims = SessionClaims {
            login: login.to_string(),
            iat: now.timestamp(),
            exp: expires_at.timestamp(),
            jti: Uuid::new_v4().to_string(),
        };
        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|err| ApiError::internal(err).with_sender("token.issue"))?;
        Ok(SessionToken {
            login: claims.login,
            token,
            expires_at,
        })
    }

    /// 校验签名与有效期，并要求令牌中的登录名与 `expected_login` 一致。
    pub fn verify(&self, raw: &str, expected_login: &str) -> Result<SessionClaims, ApiError> {
        let claims = self.decode_claims(raw)?;
        if claims.login != expected_login {
            debug!(
                token_login = %claims.login,
                expected_login, "token login mismatch"
            );
            return Err(ApiError::unauthorized().with_sender("token.verify"));
        }
        Ok(claims)
    }

    /// 仅校验签名与有效期，返回令牌声明。
    pub fn decode_claims(&self, raw: &str) -> Result<SessionClaims, ApiError> {
        if raw.is_empty() {
            return Err(ApiError::unauthorized().with_sender("token.verify"));
        }
        let data = decode::<SessionClaims>(raw, &self.decoding, &self.validation)
            .map_err(|err| ApiError::classify(ErrorKind::Unauthorized, err).with_sender("token.verify"))?;
        if data.claims.login.is_empty() {
            return Err(ApiError::unauthorized().with_sender("token.verify"));
        }
        Ok(data.claims)
    }
}
