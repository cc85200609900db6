//! CLI arguments, server configuration defaults and signing key loading.

use clap::{Parser, ValueEnum};
use std::path::PathBuf;

pub const LOGIN_COOKIE_NAME: &str = "login";
pub const TOKEN_COOKIE_NAME: &str = "token";
pub const MAX_LOGIN_LEN: usize = 64;
pub const MAX_PASSWORD_LEN: usize = 1024;
pub const MIN_SIGNING_KEY_LEN: usize = 16;
pub const DEFAULT_TOKEN_TTL_SECS: u64 = 15 * 60;
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 15;
pub const DEFAULT_LOGIN_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_LOGIN_WINDOW_SECS: u64 = 5 * 60;
pub const DEFAULT_LOGIN_LOCKOUT_SECS: u64 = 10 * 60;
pub const DEFAULT_UPLOAD_MAX_SIZE: u64 = 10 * 1024 * 1024 * 1024;
pub const DEFAULT_UPLOAD_TEMP_TTL_SECS: u64 = 24 * 60 * 60;
pub const LOGIN_PRUNE_INTERVAL_SECS: u64 = 300;
pub const UPLOAD_SWEEP_INTERVAL_SECS: u64 = 600;

/// How a multi-file upload behaves when one of its files fails.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum UploadPolicy {
    /// Commit nothing unless every file in the request was received.
    Atomic,
    /// Commit the files received before the failure, then report it.
    BestEffort,
}

/// CLI arguments and environment configuration for the server.
#[derive(Parser, Debug)]
#[command(name = "axo-locker", version, about = "AxoLocker multi-user file server")]
pub struct Args {
    #[arg(
        short = 's',
        long,
        env = "AXO_STORAGE_DIR",
        default_value = ".axo/storage",
        help = "Root directory for per-user files"
    )]
    pub storage_dir: String,
    #[arg(
        short = 'd',
        long,
        env = "AXO_DATABASE",
        default_value = ".axo/users.json",
        help = "User and file record database"
    )]
    pub database: String,
    #[arg(
        long,
        env = "AXO_JWT_SECRET",
        hide_env_values = true,
        help = "Token signing secret"
    )]
    pub jwt_secret: Option<String>,
    #[arg(
        long,
        env = "AXO_JWT_SECRET_FILE",
        conflicts_with = "jwt_secret",
        help = "File containing the token signing secret"
    )]
    pub jwt_secret_file: Option<PathBuf>,
    #[arg(
        long,
        env = "AXO_TOKEN_TTL_SECS",
        default_value_t = DEFAULT_TOKEN_TTL_SECS,
        help = "Session token lifetime in seconds"
    )]
    pub token_ttl_secs: u64,
    #[arg(
        short = 'b',
        long,
        env = "AXO_BIND",
        default_value = "0.0.0.0",
        help = "Bind address"
    )]
    pub host: String,
    #[arg(
        short = 'p',
        long,
        env = "AXO_PORT",
        default_value_t = 5005,
        help = "Listening port"
    )]
    pub port: u16,
    #[arg(short = 'c', long, env = "AXO_TLS_CERT", requires = "tls_key", help = "TLS cert path")]
    pub tls_cert: Option<String>,
    #[arg(short = 'k', long, env = "AXO_TLS_KEY", requires = "tls_cert", help = "TLS key path")]
    pub tls_key: Option<String>,
    #[arg(
        long,
        env = "AXO_TRUST_FORWARDED",
        help = "Take the client IP from X-Forwarded-For (only behind a trusted proxy)"
    )]
    pub trust_forwarded: bool,
    #[arg(long, env = "AXO_CORS_ORIGINS", help = "Comma separated CORS origins")]
    pub cors_origins: Option<String>,
    #[arg(
        long,
        env = "AXO_REQUEST_TIMEOUT_SECS",
        default_value_t = DEFAULT_REQUEST_TIMEOUT_SECS,
        help = "Per-request deadline in seconds (0 to disable)"
    )]
    pub request_timeout_secs: u64,
    #[arg(
        long,
        env = "AXO_UPLOAD_POLICY",
        value_enum,
        default_value_t = UploadPolicy::Atomic,
        help = "Multi-file upload failure policy"
    )]
    pub upload_policy: UploadPolicy,
    #[arg(
        long,
        env = "AXO_UPLOAD_MAX_SIZE",
        default_value_t = DEFAULT_UPLOAD_MAX_SIZE,
        help = "Max size of a single uploaded file in bytes (0 to disable)"
    )]
    pub upload_max_size: u64,
    #[arg(
        long,
        env = "AXO_UPLOAD_TEMP_TTL_SECS",
        default_value_t = DEFAULT_UPLOAD_TEMP_TTL_SECS,
        help = "Age after which orphaned upload temp files are removed (0 to disable)"
    )]
    pub upload_temp_ttl_secs: u64,
    #[arg(
        long,
        env = "AXO_LOGIN_MAX_ATTEMPTS",
        default_value_t = DEFAULT_LOGIN_MAX_ATTEMPTS,
        help = "Max login attempts before lockout (0 to disable)"
    )]
    pub login_max_attempts: u32,
    #[arg(
        long,
        env = "AXO_LOGIN_WINDOW_SECS",
        default_value_t = DEFAULT_LOGIN_WINDOW_SECS,
        help = "Login attempt window in seconds"
    )]
    pub login_window_secs: u64,
    #[arg(
        long,
        env = "AXO_LOGIN_LOCKOUT_SECS",
        default_value_t = DEFAULT_LOGIN_LOCKOUT_SECS,
        help = "Login lockout time after max attempts"
    )]
    pub login_lockout_secs: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("no signing key configured (set AXO_JWT_SECRET or AXO_JWT_SECRET_FILE)")]
    MissingSigningKey,
    #[error("signing key must be at least {} bytes", MIN_SIGNING_KEY_LEN)]
    WeakSigningKey,
    #[error("cannot read signing key file {path}: {source}")]
    SigningKeyFile {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid bind address {0}")]
    InvalidHost(String),
}

/// 启动时读取签名密钥，只读取一次。
pub fn load_signing_key(args: &Args) -> Result<Vec<u8>, ConfigError> {
    let key = match (&args.jwt_secret, &args.jwt_secret_file) {
        (Some(secret), _) => secret.as_bytes().to_vec(),
        (None, Some(path)) => {
            let contents =
                std::fs::read(path).map_err(|source| ConfigError::SigningKeyFile {
                    path: path.clone(),
                    source,
                })?;
            trim_trailing_newline(contents)
        }
        (None, None) => return Err(ConfigError::MissingSigningKey),
    };
    if key.len() < MIN_SIGNING_KEY_LEN {
        return Err(ConfigError::WeakSigningKey);
    }
    Ok(key)
}

fn trim_trailing_newline(mut bytes: Vec<u8>) -> Vec<u8> {
    while matches!(bytes.last(), Some(b'\n' | b'\r')) {
        bytes.pop();
    }
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn parse(extra: &[&str]) -> Args {
        let mut argv = vec!["axo-locker"];
        argv.extend_from_slice(extra);
        Args::try_parse_from(argv).expect("parse args")
    }

    #[test]
    fn defaults_match_session_model() {
        let args = parse(&["--jwt-secret", "0123456789abcdef"]);
        assert_eq!(args.token_ttl_secs, 900);
        assert_eq!(args.request_timeout_secs, 15);
        assert_eq!(args.upload_policy, UploadPolicy::Atomic);
        assert!(!args.trust_forwarded);
        assert_eq!(args.upload_temp_ttl_secs, 24 * 60 * 60);
    }

    #[test]
    fn upload_policy_is_parsed() {
        let args = parse(&["--jwt-secret", "x", "--upload-policy", "best-effort"]);
        assert_eq!(args.upload_policy, UploadPolicy::BestEffort);
    }

    #[test]
    fn signing_key_must_exist_and_be_long_enough() {
        let missing = parse(&[]);
        assert!(matches!(
            load_signing_key(&missing),
            Err(ConfigError::MissingSigningKey)
        ));
        let short = parse(&["--jwt-secret", "short"]);
        assert!(matches!(
            load_signing_key(&short),
            Err(ConfigError::WeakSigningKey)
        ));
        let good = parse(&["--jwt-secret", "0123456789abcdef"]);
        assert_eq!(load_signing_key(&good).unwrap(), b"0123456789abcdef");
    }

    #[test]
    fn signing_key_file_is_read_and_trimmed() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("key");
        std::fs::write(&path, b"file-based-signing-key\n").unwrap();
        let args = parse(&["--jwt-secret-file", path.to_str().unwrap()]);
        assert_eq!(load_signing_key(&args).unwrap(), b"file-based-signing-key");

        let args = parse(&["--jwt-secret-file", "/nonexistent/axo/key"]);
        assert!(matches!(
            load_signing_key(&args),
            Err(ConfigError::SigningKeyFile { .. })
        ));
    }
}
