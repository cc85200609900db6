//! Argon2 口令哈希与校验，在阻塞线程池中执行。

use argon2::{Argon2, PasswordHasher, PasswordVerifier};
use password_hash::{PasswordHash, SaltString};

/// 用于未知账号的固定哈希，参数与 `Argon2::default()` 一致，保证耗时相同。
const DUMMY_HASH: &str =
    "$argon2id$v=19$m=19456,t=2,p=1$K8mQBZRzRI5uvUQqoWv6oA$8aN49HTRt5nXcREljbaYmpoeGozf4EfKZKeNwqfmpvI";

#[derive(Debug, thiserror::Error)]
pub enum PasswordError {
    #[error("password does not match")]
    Mismatch,
    #[error("password hashing failed: {0}")]
    Hashing(String),
}

/// 生成 PHC 格式的口令哈希。
pub async fn hash(password: String) -> Result<String, PasswordError> {
    tokio::task::spawn_blocking(move || hash_blocking(&password))
        .await
        .map_err(|err| PasswordError::Hashing(err.to_string()))?
}

/// 校验口令；不匹配或哈希无法解析时返回 `Mismatch`。
pub async fn verify(stored_hash: String, password: String) -> Result<(), PasswordError> {
    tokio::task::spawn_blocking(move || verify_blocking(&stored_hash, &password))
        .await
        .map_err(|err| PasswordError::Hashing(err.to_string()))?
}

/// 对不存在的账号执行一次等价的校验，结果总是 `Mismatch`。
pub async fn verify_unknown(password: String) -> PasswordError {
    match verify(DUMMY_HASH.to_string(), password).await {
        Ok(()) | Err(PasswordError::Mismatch) => PasswordError::Mismatch,
        Err(err) => err,
    }
}

fn hash_blocking(password: &str) -> Result<String, PasswordError> {
    let mut salt_bytes = [0u8; 16];
    getrandom::getrandom(&mut salt_bytes).map_err(|err| PasswordError::Hashing(err.to_string()))?;
    let salt =
        SaltString::encode_b64(&salt_bytes).map_err(|err| PasswordError::Hashing(err.to_string()))?;
    let phc = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|err| PasswordError::Hashing(err.to_string()))?
        .to_string();
    Ok(phc)
}

fn verify_blocking(stored_hash: &str, password: &str) -> Result<(), PasswordError> {
    let parsed = PasswordHash::new(stored_hash).map_err(|_| PasswordError::Mismatch)?;
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .map_err(|_| PasswordError::Mismatch)
}
