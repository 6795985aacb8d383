//! MySQL 인증 처리
//!
//! `mysql_native_password`와 `caching_sha2_password`(fast path)를 지원합니다.
//! caching_sha2의 full authentication은 TLS 또는 RSA 키 교환이 필요하므로
//! 지원하지 않습니다.

use crate::error::{CdcError, Result};
use byteorder::{LittleEndian, WriteBytesExt};
use std::io::Write;

pub const NATIVE_PASSWORD: &str = "mysql_native_password";
pub const CACHING_SHA2_PASSWORD: &str = "caching_sha2_password";

/// caching_sha2 응답: 0x01 뒤의 상태 바이트
pub const FAST_AUTH_SUCCESS: u8 = 0x03;
pub const PERFORM_FULL_AUTHENTICATION: u8 = 0x04;

/// Client capability flags
pub mod capabilities {
    pub const LONG_PASSWORD: u32 = 1;
    pub const LONG_FLAG: u32 = 4;
    pub const CONNECT_WITH_DB: u32 = 8;
    pub const PROTOCOL_41: u32 = 512;
    pub const TRANSACTIONS: u32 = 8192;
    pub const SECURE_CONNECTION: u32 = 32768;
    pub const MULTI_STATEMENTS: u32 = 1 << 16;
    pub const MULTI_RESULTS: u32 = 1 << 17;
    pub const PLUGIN_AUTH: u32 = 1 << 19;
}

/// 플러그인별 인증 응답 생성
pub fn scramble_for_plugin(plugin: &str, password: &str, scramble: &[u8]) -> Result<Vec<u8>> {
    match plugin {
        NATIVE_PASSWORD | "" => Ok(create_auth_response(password, scramble)),
        CACHING_SHA2_PASSWORD => Ok(create_sha2_auth_response(password, scramble)),
        other => Err(CdcError::ConnectionError(format!(
            "Unsupported auth plugin: {}",
            other
        ))),
    }
}

/// Native password 인증 응답 생성
pub fn create_auth_response(password: &str, scramble: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }

    // SHA1(password)
    let stage1 = sha1(password.as_bytes());

    // SHA1(SHA1(password))
    let stage2 = sha1(&stage1);

    // SHA1(scramble + SHA1(SHA1(password)))
    let mut combined = scramble.to_vec();
    combined.extend_from_slice(&stage2);
    let stage3 = sha1(&combined);

    // XOR(SHA1(password), SHA1(scramble + SHA1(SHA1(password))))
    stage1.iter().zip(stage3.iter()).map(|(a, b)| a ^ b).collect()
}

/// caching_sha2_password 응답:
/// XOR(SHA256(password), SHA256(SHA256(SHA256(password)) + scramble))
pub fn create_sha2_auth_response(password: &str, scramble: &[u8]) -> Vec<u8> {
    use sha2::{Digest, Sha256};

    if password.is_empty() {
        return Vec::new();
    }

    let hash1 = Sha256::digest(password.as_bytes());
    let hash2 = Sha256::digest(hash1);

    let mut hasher = Sha256::new();
    hasher.update(hash2);
    hasher.update(scramble);
    let hash3 = hasher.finalize();

    hash1.iter().zip(hash3.iter()).map(|(a, b)| a ^ b).collect()
}

/// SHA1 해시 계산 (SHA1을 사용하는 것이 MySQL native password의 표준)
fn sha1(data: &[u8]) -> Vec<u8> {
    use sha1::{Digest, Sha1};
    let mut hasher = Sha1::new();
    hasher.update(data);
    hasher.finalize().to_vec()
}

/// 인증 패킷 생성
pub fn create_handshake_response(
    username: &str,
    password: &str,
    database: Option<&str>,
    scramble: &[u8],
    collation: u8,
    plugin: &str,
) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();

    // Client capability flags (4 bytes)
    let mut capabilities = capabilities::LONG_PASSWORD
        | capabilities::LONG_FLAG
        | capabilities::PROTOCOL_41
        | capabilities::TRANSACTIONS
        | capabilities::SECURE_CONNECTION
        | capabilities::MULTI_STATEMENTS
        | capabilities::MULTI_RESULTS
        | capabilities::PLUGIN_AUTH;

    if database.is_some() {
        capabilities |= capabilities::CONNECT_WITH_DB;
    }

    buffer.write_u32::<LittleEndian>(capabilities)?;

    // Max packet size (4 bytes) - 0 means default (16MB)
    buffer.write_u32::<LittleEndian>(0)?;

    // Character set (1 byte)
    buffer.write_u8(collation)?;

    // Reserved (23 bytes of zeros)
    buffer.write_all(&[0u8; 23])?;

    // Username (null-terminated string)
    buffer.write_all(username.as_bytes())?;
    buffer.write_u8(0)?;

    // Authentication response
    let plugin = if plugin.is_empty() { NATIVE_PASSWORD } else { plugin };
    let auth_response = scramble_for_plugin(plugin, password, scramble)?;
    buffer.write_u8(auth_response.len() as u8)?;
    buffer.write_all(&auth_response)?;

    // Database name (null-terminated string, if provided)
    if let Some(db) = database {
        buffer.write_all(db.as_bytes())?;
        buffer.write_u8(0)?;
    }

    // Authentication plugin name (null-terminated)
    buffer.write_all(plugin.as_bytes())?;
    buffer.write_u8(0)?;

    Ok(buffer)
}

/// Auth switch request (0xFE, plugin name NUL, auth data)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthSwitchRequest {
    pub plugin: String,
    pub scramble: Vec<u8>,
}

impl AuthSwitchRequest {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.first() != Some(&0xFE) {
            return Err(CdcError::ProtocolError("Not an auth switch request".to_string()));
        }
        let body = &data[1..];
        let name_end = body.iter().position(|&b| b == 0).unwrap_or(body.len());
        let plugin = String::from_utf8_lossy(&body[..name_end]).to_string();

        // 서버는 scramble 뒤에 NUL을 붙여 보낸다
        let mut scramble = body.get(name_end + 1..).unwrap_or_default().to_vec();
        if scramble.last() == Some(&0) {
            scramble.pop();
        }

        Ok(AuthSwitchRequest { plugin, scramble })
    }
}
