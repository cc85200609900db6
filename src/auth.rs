//! 请求身份识别、注册/登录处理器与登录限流。

use axum::extract::rejection::JsonRejection;
use axum::extract::{Extension, FromRequestParts, Json};
use axum::http::request::Parts;
use axum::http::{HeaderMap, header};
use axum_extra::extract::CookieJar;
use axum_extra::extract::cookie::{Cookie, SameSite};
use cookie::time::Duration as CookieDuration;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::{LOGIN_COOKIE_NAME, MAX_LOGIN_LEN, MAX_PASSWORD_LEN, TOKEN_COOKIE_NAME};
use crate::error::{ApiError, ErrorKind};
use crate::http::{ClientIp, RequestScheme, is_https_request};
use crate::password;
use crate::response::{ApiResult, Reply};
use crate::storage::Storage;
use crate::store::{StoreError, UserStore};
use crate::token::{SessionToken, TokenService};

/// 经过校验的调用者身份，仅在单个请求内有效。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub login: String,
    pub user_id: u64,
}

/// 从请求中读取凭据、校验令牌并由服务端解析用户 id。
pub struct Authenticator {
    tokens: TokenService,
    store: Arc<dyn UserStore>,
}

#[derive(Debug, Default)]
struct RawCredentials {
    login_cookie: Option<String>,
    token_cookie: Option<String>,
    bearer: Option<String>,
}

impl Authenticator {
    pub fn new(tokens: TokenService, store: Arc<dyn UserStore>) -> Self {
        Self { tokens, store }
    }

    pub fn tokens(&self) -> &TokenService {
        &self.tokens
    }

    pub fn store(&self) -> &Arc<dyn UserStore> {
        &self.store
    }

    /// 识别调用者。客户端提交的任何用户 id 都会被忽略，
    /// `user_id` 总是由已校验的登录名重新查询得到。
    pub async fn identify_caller(&self, headers: &HeaderMap) -> Result<Principal, ApiError> {
        let credentials = read_credentials(headers);
        let login = match (credentials.token_cookie, credentials.bearer) {
            (Some(token), _) => {
                let login = credentials
                    .login_cookie
                    .ok_or_else(|| ApiError::unauthorized().with_sender("auth.identify"))?;
                self.tokens.verify(&token, &login)?.login
            }
            (None, Some(bearer)) => {
                let claims = self.tokens.decode_claims(&bearer)?;
                if let Some(login) = credentials.login_cookie
                    && login != claims.login
                {
                    return Err(ApiError::unauthorized().with_sender("auth.identify"));
                }
                claims.login
            }
            (None, None) => return Err(ApiError::unauthorized().with_sender("auth.identify")),
        };

        match self.store.lookup_user_by_login(&login).await {
            Ok(user) => Ok(Principal {
                login: user.login,
                user_id: user.id,
            }),
            Err(StoreError::NotFound) => {
                Err(ApiError::unauthorized().with_sender("auth.identify"))
            }
            Err(err) => Err(ApiError::from(err).with_sender("auth.identify")),
        }
    }
}

fn read_credentials(headers: &HeaderMap) -> RawCredentials {
    let jar = CookieJar::from_headers(headers);
    let cookie_value = |name: &str| {
        jar.get(name)
            .map(|cookie| cookie.value().to_string())
            .filter(|value| !value.is_empty())
    };
    RawCredentials {
        login_cookie: cookie_value(LOGIN_COOKIE_NAME),
        token_cookie: cookie_value(TOKEN_COOKIE_NAME),
        bearer: headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string),
    }
}

impl<S> FromRequestParts<S> for Principal
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let authenticator = parts
            .extensions
            .get::<Arc<Authenticator>>()
            .cloned()
            .ok_or_else(|| {
                ApiError::internal("authenticator extension missing").with_sender("auth.identify")
            })?;
        authenticator.identify_caller(&parts.headers).await
    }
}

/// 登录失败计数与锁定。
#[derive(Debug)]
pub struct LoginThrottle {
    attempts: Mutex<HashMap<IpAddr, LoginAttempt>>,
    window: Duration,
    max_attempts: u32,
    lockout: Duration,
}

#[derive(Debug)]
struct LoginAttempt {
    window_start: Instant,
    failures: u32,
    locked_until: Option<Instant>,
}

impl LoginAttempt {
    fn fresh(now: Instant) -> Self {
        Self {
            window_start: now,
            failures: 0,
            locked_until: None,
        }
    }
}

impl LoginThrottle {
    /// `max_attempts` 为 0 时关闭限流。
    pub fn new(window: Duration, max_attempts: u32, lockout: Duration) -> Self {
        Self {
            attempts: Mutex::new(HashMap::new()),
            window,
            max_attempts,
            lockout,
        }
    }

    /// 若该 IP 处于锁定期，返回剩余秒数。
    pub async fn check(&self, ip: IpAddr) -> Option<u64> {
        if self.max_attempts == 0 {
            return None;
        }

        let mut attempts = self.attempts.lock().await;
        let now = Instant::now();
        let entry = attempts.get(&ip)?;

        if let Some(locked_until) = entry.locked_until {
            if now < locked_until {
                return Some(locked_until.saturating_duration_since(now).as_secs().max(1));
            }
            attempts.remove(&ip);
        } else if now.duration_since(entry.window_start) > self.window {
            attempts.remove(&ip);
        }

        None
    }

    pub async fn register_failure(&self, ip: IpAddr) {
        if self.max_attempts == 0 {
            return;
        }

        let mut attempts = self.attempts.lock().await;
        let now = Instant::now();
        let entry = attempts.entry(ip).or_insert_with(|| LoginAttempt::fresh(now));

        if now.duration_since(entry.window_start) > self.window {
            *entry = LoginAttempt::fresh(now);
        }

        entry.failures = entry.failures.saturating_add(1);
        if entry.failures >= self.max_attempts {
            entry.locked_until = Some(now + self.lockout);
            warn!(client_ip = %ip, "login locked out");
        }
    }

    pub async fn clear(&self, ip: IpAddr) {
        let mut attempts = self.attempts.lock().await;
        attempts.remove(&ip);
    }

    /// 清理过期的登录失败记录。
    pub async fn prune(&self) {
        let mut attempts = self.attempts.lock().await;
        let now = Instant::now();
        let window = self.window;
        attempts.retain(|_, entry| {
            if let Some(locked_until) = entry.locked_until {
                return locked_until > now;
            }
            now.duration_since(entry.window_start) <= window
        });
    }
}

#[derive(Deserialize)]
pub(crate) struct CredentialsRequest {
    login: String,
    password: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct TokenResponse {
    pub login: String,
    pub token: String,
    pub expires: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct AuthStatus {
    pub status: String,
}

fn parse_credentials(
    payload: Result<Json<CredentialsRequest>, JsonRejection>,
) -> Result<CredentialsRequest, ApiError> {
    let Json(payload) = payload.map_err(|rejection| {
        ApiError::classify(ErrorKind::BadRequest, rejection)
            .with_message("malformed credentials")
            .with_sender("auth.credentials")
    })?;
    if payload.login.is_empty() || payload.password.is_empty() {
        return Err(ApiError::bad_request("login and password are required")
            .with_sender("auth.credentials"));
    }
    Ok(payload)
}

fn validate_new_login(login: &str) -> Result<(), ApiError> {
    let allowed = |c: char| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '@');
    if login.chars().count() > MAX_LOGIN_LEN || !login.chars().all(allowed) {
        return Err(ApiError::bad_request("login contains invalid characters or is too long")
            .with_sender("auth.register"));
    }
    Ok(())
}

fn session_cookies(jar: CookieJar, session: &SessionToken, ttl: Duration, secure: bool) -> CookieJar {
    let max_age = CookieDuration::seconds(i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX));
    let login = Cookie::build((LOGIN_COOKIE_NAME, session.login.clone()))
        .path("/")
        .secure(secure)
        .same_site(SameSite::Strict)
        .max_age(max_age)
        .build();
    let token = Cookie::build((TOKEN_COOKIE_NAME, session.token.clone()))
        .path("/")
        .http_only(true)
        .secure(secure)
        .same_site(SameSite::Strict)
        .max_age(max_age)
        .build();
    jar.add(login).add(token)
}

fn token_reply(
    auth: &Authenticator,
    jar: CookieJar,
    session: SessionToken,
    secure: bool,
) -> (CookieJar, Reply<TokenResponse>) {
    let jar = session_cookies(jar, &session, auth.tokens().ttl(), secure);
    let expires = session.expires_http();
    (
        jar,
        Reply::ok(TokenResponse {
            login: session.login,
            token: session.token,
            expires,
        }),
    )
}

/// 注册：写入用户记录、创建用户目录后再签发令牌。
pub async fn register(
    Extension(auth): Extension<Arc<Authenticator>>,
    Extension(storage): Extension<Arc<Storage>>,
    Extension(scheme): Extension<RequestScheme>,
    headers: HeaderMap,
    jar: CookieJar,
    payload: Result<Json<CredentialsRequest>, JsonRejection>,
) -> Result<(CookieJar, Reply<TokenResponse>), ApiError> {
    let CredentialsRequest { login, password } = parse_credentials(payload)?;
    validate_new_login(&login)?;
    if password.len() > MAX_PASSWORD_LEN {
        return Err(ApiError::bad_request("password is too long").with_sender("auth.register"));
    }

    let password_hash = password::hash(password).await?;
    let user = auth
        .store()
        .create_user(&login, &password_hash)
        .await
        .map_err(|err| ApiError::from(err).with_sender("auth.register"))?;
    storage
        .ensure_user_dir(user.id)
        .await
        .map_err(|err| ApiError::from(err).with_sender("auth.register"))?;
    let session = auth.tokens().issue(&user.login)?;
    info!(login = %user.login, user_id = user.id, "user registered");

    Ok(token_reply(
        &auth,
        jar,
        session,
        is_https_request(&headers, scheme),
    ))
}

/// 登录：校验口令并签发新令牌。
pub async fn login(
    Extension(auth): Extension<Arc<Authenticator>>,
    Extension(throttle): Extension<Arc<LoginThrottle>>,
    Extension(scheme): Extension<RequestScheme>,
    ClientIp(client_ip): ClientIp,
    headers: HeaderMap,
    jar: CookieJar,
    payload: Result<Json<CredentialsRequest>, JsonRejection>,
) -> Result<(CookieJar, Reply<TokenResponse>), ApiError> {
    if let Some(ip) = client_ip
        && let Some(retry_after) = throttle.check(ip).await
    {
        return Err(ApiError::too_many_requests(retry_after).with_sender("auth.login"));
    }

    let CredentialsRequest { login, password } = parse_credentials(payload)?;
    let verified = match auth.store().lookup_user_by_login(&login).await {
        Ok(user) => password::verify(user.password_hash.clone(), password)
            .await
            .map(|_| user)
            .map_err(ApiError::from),
        Err(StoreError::NotFound) => {
            Err(ApiError::from(password::verify_unknown(password).await))
        }
        Err(err) => return Err(ApiError::from(err).with_sender("auth.login")),
    };
    let user = match verified {
        Ok(user) => user,
        Err(err) => {
            if err.kind() == ErrorKind::Unauthorized
                && let Some(ip) = client_ip
            {
                throttle.register_failure(ip).await;
            }
            return Err(err.with_sender("auth.login"));
        }
    };

    if let Some(ip) = client_ip {
        throttle.clear(ip).await;
    }
    let session = auth.tokens().issue(&user.login)?;
    info!(login = %user.login, user_id = user.id, "user logged in");

    Ok(token_reply(
        &auth,
        jar,
        session,
        is_https_request(&headers, scheme),
    ))
}

/// 校验当前凭据。
pub async fn check(principal: Principal) -> ApiResult<AuthStatus> {
    tracing::debug!(login = %principal.login, "auth check passed");
    Ok(Reply::ok(AuthStatus {
        status: "Authorized".to_string(),
    }))
}

/// 登出：仅清除客户端 Cookie，服务端不保存会话。
pub async fn logout(jar: CookieJar) -> (CookieJar, Reply<&'static str>) {
    let jar = jar
        .remove(Cookie::build(LOGIN_COOKIE_NAME).path("/").build())
        .remove(Cookie::build(TOKEN_COOKIE_NAME).path("/").build());
    (jar, Reply::ok("OK"))
}
