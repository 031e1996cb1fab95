//! MySQL 인증 처리
//!
//! - mysql_native_password: SHA1 스크램블
//! - caching_sha2_password: SHA256 fast auth + full auth (TLS 평문 또는 RSA-OAEP)
//! - sha256_password: full auth만 존재
//! - client_ed25519 (MariaDB): SHA512(P) 를 확장 비밀키로 써서 salt 에 Ed25519 서명
//!
//! 클라이언트 쪽은 `Authenticator`가 서버 패킷 하나를 받을 때마다 다음 동작을 결정합니다.

use crate::error::{BinlogError, Result};
use crate::protocol::codec::ReadMysqlExt;
use crate::protocol::handshake::parse_err_packet;
use crate::protocol::{EOF_HEADER, ERR_HEADER, MORE_DATA_HEADER, OK_HEADER};
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::pkcs8::DecodePublicKey;
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha1::Sha1;
use ed25519_dalek::hazmat::{raw_sign, ExpandedSecretKey};
use ed25519_dalek::{Signature, VerifyingKey};
use sha2::{Digest, Sha256, Sha512};
use std::io::Cursor;
use tracing::debug;

pub const MYSQL_NATIVE_PASSWORD: &str = "mysql_native_password";
pub const CACHING_SHA2_PASSWORD: &str = "caching_sha2_password";
pub const SHA256_PASSWORD: &str = "sha256_password";
pub const MYSQL_CLEAR_PASSWORD: &str = "mysql_clear_password";
pub const CLIENT_ED25519: &str = "client_ed25519";

/// caching_sha2 AuthMoreData 코드
pub const CACHING_SHA2_REQUEST_PUBLIC_KEY: u8 = 0x02;
pub const CACHING_SHA2_FAST_AUTH_SUCCESS: u8 = 0x03;
pub const CACHING_SHA2_PERFORM_FULL_AUTH: u8 = 0x04;

/// sha256_password 공개키 요청 바이트
pub const SHA256_REQUEST_PUBLIC_KEY: u8 = 0x01;

/// 서버가 보내는 salt 길이
pub const SCRAMBLE_LEN: usize = 20;

/// client_ed25519 nonce 길이
pub const ED25519_NONCE_LEN: usize = 32;

/// 지원하는 인증 플러그인
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthPlugin {
    NativePassword,
    CachingSha2Password,
    Sha256Password,
    ClearPassword,
    Ed25519,
}

impl AuthPlugin {
    /// 플러그인 이름 → AuthPlugin. 빈 이름은 native로 간주
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "" | MYSQL_NATIVE_PASSWORD => Ok(AuthPlugin::NativePassword),
            CACHING_SHA2_PASSWORD => Ok(AuthPlugin::CachingSha2Password),
            SHA256_PASSWORD => Ok(AuthPlugin::Sha256Password),
            MYSQL_CLEAR_PASSWORD => Ok(AuthPlugin::ClearPassword),
            CLIENT_ED25519 => Ok(AuthPlugin::Ed25519),
            other => Err(BinlogError::ProtocolError(format!(
                "unsupported auth plugin '{}'",
                other
            ))),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            AuthPlugin::NativePassword => MYSQL_NATIVE_PASSWORD,
            AuthPlugin::CachingSha2Password => CACHING_SHA2_PASSWORD,
            AuthPlugin::Sha256Password => SHA256_PASSWORD,
            AuthPlugin::ClearPassword => MYSQL_CLEAR_PASSWORD,
            AuthPlugin::Ed25519 => CLIENT_ED25519,
        }
    }
}

/// Native password 인증 응답: SHA1(P) XOR SHA1(salt + SHA1(SHA1(P)))
pub fn native_password_response(password: &str, scramble: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }

    let stage1 = Sha1::digest(password.as_bytes());
    let stage2 = Sha1::digest(stage1);

    let mut hasher = Sha1::new();
    hasher.update(scramble);
    hasher.update(stage2);
    let stage3 = hasher.finalize();

    stage1.iter().zip(stage3.iter()).map(|(a, b)| a ^ b).collect()
}

/// caching_sha2 fast auth 응답: SHA256(P) XOR SHA256(SHA256(SHA256(P)) + salt)
pub fn caching_sha2_response(password: &str, scramble: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }

    let message1 = Sha256::digest(password.as_bytes());
    let message1_hash = Sha256::digest(message1);

    let mut hasher = Sha256::new();
    hasher.update(message1_hash);
    hasher.update(scramble);
    let message2 = hasher.finalize();

    message1.iter().zip(message2.iter()).map(|(a, b)| a ^ b).collect()
}

fn ed25519_secret(password: &str) -> ExpandedSecretKey {
    let mut bytes = [0u8; 64];
    bytes.copy_from_slice(&Sha512::digest(password.as_bytes()));
    ExpandedSecretKey::from_bytes(&bytes)
}

/// client_ed25519 응답: 64 bytes 서명 (R || s)
pub fn ed25519_response(password: &str, scramble: &[u8]) -> Vec<u8> {
    let secret = ed25519_secret(password);
    let public = VerifyingKey::from(&secret);
    raw_sign::<Sha512>(&secret, scramble, &public).to_bytes().to_vec()
}

/// 서버에 저장되는 공개키
pub fn ed25519_public_key(password: &str) -> [u8; 32] {
    VerifyingKey::from(&ed25519_secret(password)).to_bytes()
}

/// 서버 쪽 client_ed25519 검증
pub fn check_ed25519(response: &[u8], scramble: &[u8], public_key: &[u8; 32]) -> bool {
    let Ok(signature) = Signature::from_slice(response) else {
        return false;
    };
    VerifyingKey::from_bytes(public_key)
        .map(|key| key.verify_strict(scramble, &signature).is_ok())
        .unwrap_or(false)
}

/// (password + NUL) XOR salt (salt 반복)
pub fn xor_password(password: &str, salt: &[u8]) -> Vec<u8> {
    let mut plain = password.as_bytes().to_vec();
    plain.push(0);
    if salt.is_empty() {
        return plain;
    }
    for (i, b) in plain.iter_mut().enumerate() {
        *b ^= salt[i % salt.len()];
    }
    plain
}

/// PEM (PKCS#8 SubjectPublicKeyInfo 또는 PKCS#1) 공개키 파싱
pub fn parse_public_key(pem: &[u8]) -> Result<RsaPublicKey> {
    let text = std::str::from_utf8(pem)
        .map_err(|_| BinlogError::ProtocolError("public key is not valid PEM".to_string()))?
        .trim_end_matches('\0')
        .trim();
    RsaPublicKey::from_public_key_pem(text)
        .or_else(|_| RsaPublicKey::from_pkcs1_pem(text))
        .map_err(|e| BinlogError::ProtocolError(format!("invalid server public key: {}", e)))
}

/// 서버 공개키로 비밀번호 암호화 (RSA-OAEP, SHA-1)
pub fn encrypt_password(password: &str, salt: &[u8], key: &RsaPublicKey) -> Result<Vec<u8>> {
    let plain = xor_password(password, salt);
    key.encrypt(&mut rand::thread_rng(), Oaep::new::<Sha1>(), &plain)
        .map_err(|e| BinlogError::AuthFailed(format!("RSA encryption failed: {}", e)))
}

/// 서버 쪽: 암호문 복호화 후 salt XOR를 되돌려 평문 비밀번호 반환
pub fn decrypt_password(ciphertext: &[u8], salt: &[u8], key: &RsaPrivateKey) -> Result<String> {
    let mut plain = key
        .decrypt(Oaep::new::<Sha1>(), ciphertext)
        .map_err(|e| BinlogError::AuthFailed(format!("RSA decryption failed: {}", e)))?;
    if !salt.is_empty() {
        for (i, b) in plain.iter_mut().enumerate() {
            *b ^= salt[i % salt.len()];
        }
    }
    if plain.last() == Some(&0) {
        plain.pop();
    }
    String::from_utf8(plain).map_err(|_| BinlogError::AuthFailed("password is not utf8".to_string()))
}

/// 길이가 같을 때 입력에 관계없이 같은 시간에 비교
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// 서버 쪽 native password 검증
pub fn check_native_password(response: &[u8], salt: &[u8], password: &str) -> bool {
    constant_time_eq(response, &native_password_response(password, salt))
}

/// 서버 쪽 caching_sha2 fast auth 검증
pub fn check_caching_sha2(response: &[u8], salt: &[u8], password: &str) -> bool {
    constant_time_eq(response, &caching_sha2_response(password, salt))
}

/// caching_sha2 서버 캐시에 저장하는 값: SHA256(SHA256(P))
pub fn caching_sha2_digest(password: &str) -> Vec<u8> {
    Sha256::digest(Sha256::digest(password.as_bytes())).to_vec()
}

/// 캐시된 SHA256(SHA256(P)) 로 fast auth 검증.
/// 응답에 SHA256(digest + salt) 를 XOR 하면 SHA256(P) 가 나와야 함
pub fn check_caching_sha2_digest(response: &[u8], salt: &[u8], digest: &[u8]) -> bool {
    if response.len() != 32 {
        return false;
    }
    let mut hasher = Sha256::new();
    hasher.update(digest);
    hasher.update(salt);
    let mask = hasher.finalize();
    let stage1: Vec<u8> = response.iter().zip(mask.iter()).map(|(a, b)| a ^ b).collect();
    constant_time_eq(&Sha256::digest(Sha256::digest(&stage1)), digest)
}

/// 서버 패킷 처리 결과
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthStep {
    /// 이 페이로드를 보내고 다음 패킷을 읽음
    Write(Vec<u8>),
    /// 아무것도 보내지 않고 다음 패킷을 읽음
    Continue,
    /// OK 수신. 인증 완료
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AuthState {
    /// 초기 응답을 보낸 직후
    Sent,
    /// 공개키 요청을 보내고 PEM 대기
    WaitPublicKey,
    /// 최종 OK 대기
    WaitOk,
}

/// 클라이언트 인증 상태 머신
pub struct Authenticator {
    plugin: AuthPlugin,
    password: String,
    salt: Vec<u8>,
    tls: bool,
    server_key: Option<RsaPublicKey>,
    state: AuthState,
}

impl Authenticator {
    pub fn new(
        plugin_name: &str,
        password: impl Into<String>,
        salt: &[u8],
        tls: bool,
        server_key: Option<RsaPublicKey>,
    ) -> Result<Self> {
        Ok(Authenticator {
            plugin: AuthPlugin::from_name(plugin_name)?,
            password: password.into(),
            salt: salt.to_vec(),
            tls,
            server_key,
            state: AuthState::Sent,
        })
    }

    pub fn plugin(&self) -> AuthPlugin {
        self.plugin
    }

    /// 핸드셰이크 응답(또는 auth switch 응답)에 실을 첫 auth 데이터
    pub fn initial_response(&mut self) -> Result<Vec<u8>> {
        self.state = AuthState::Sent;
        let response = match self.plugin {
            AuthPlugin::NativePassword => native_password_response(&self.password, &self.salt),
            AuthPlugin::CachingSha2Password => caching_sha2_response(&self.password, &self.salt),
            AuthPlugin::ClearPassword => self.cleartext(),
            AuthPlugin::Ed25519 => ed25519_response(&self.password, &self.salt),
            AuthPlugin::Sha256Password => {
                if self.password.is_empty() {
                    vec![0]
                } else if self.tls {
                    self.cleartext()
                } else if let Some(key) = &self.server_key {
                    encrypt_password(&self.password, &self.salt, key)?
                } else {
                    self.state = AuthState::WaitPublicKey;
                    vec![SHA256_REQUEST_PUBLIC_KEY]
                }
            }
        };
        Ok(response)
    }

    /// 서버 패킷 하나 처리
    pub fn handle_packet(&mut self, data: &[u8]) -> Result<AuthStep> {
        match data.first() {
            Some(&OK_HEADER) => Ok(AuthStep::Done),
            Some(&ERR_HEADER) => {
                let err = parse_err_packet(data, crate::protocol::capabilities::PROTOCOL_41)?;
                Err(BinlogError::AuthFailed(err.to_string()))
            }
            Some(&EOF_HEADER) => self.switch_plugin(&data[1..]),
            Some(&MORE_DATA_HEADER) => self.more_data(&data[1..]),
            _ => Err(BinlogError::ProtocolError(format!(
                "unexpected packet during authentication: {:02x?}",
                &data[..data.len().min(8)]
            ))),
        }
    }

    fn switch_plugin(&mut self, body: &[u8]) -> Result<AuthStep> {
        if body.is_empty() {
            return Err(BinlogError::ProtocolError(
                "old password authentication is not supported".to_string(),
            ));
        }
        let mut cursor = Cursor::new(body);
        let name = cursor.read_null_terminated_string()?;
        let plugin = AuthPlugin::from_name(&name)?;
        let salt = cursor.rest();
        let salt = match plugin {
            // nonce 는 임의 바이트라 끝의 0 도 데이터
            AuthPlugin::Ed25519 => salt.get(..ED25519_NONCE_LEN).ok_or_else(|| {
                BinlogError::ProtocolError(format!("client_ed25519 nonce too short: {} bytes", salt.len()))
            })?,
            _ => salt.strip_suffix(&[0]).unwrap_or(salt),
        };

        self.plugin = plugin;
        self.salt = salt.to_vec();
        debug!("Auth switch requested: plugin={}", name);
        Ok(AuthStep::Write(self.initial_response()?))
    }

    fn more_data(&mut self, payload: &[u8]) -> Result<AuthStep> {
        match (self.plugin, self.state) {
            (AuthPlugin::CachingSha2Password, AuthState::Sent) => match payload.first() {
                Some(&CACHING_SHA2_FAST_AUTH_SUCCESS) => {
                    self.state = AuthState::WaitOk;
                    Ok(AuthStep::Continue)
                }
                Some(&CACHING_SHA2_PERFORM_FULL_AUTH) => self.full_auth(),
                _ => Err(BinlogError::ProtocolError(format!(
                    "unknown caching_sha2 auth state {:02x?}",
                    payload.first()
                ))),
            },
            (AuthPlugin::CachingSha2Password | AuthPlugin::Sha256Password, AuthState::WaitPublicKey) => {
                let key = parse_public_key(payload)?;
                let encrypted = encrypt_password(&self.password, &self.salt, &key)?;
                self.server_key = Some(key);
                self.state = AuthState::WaitOk;
                Ok(AuthStep::Write(encrypted))
            }
            _ => Err(BinlogError::ProtocolError(format!(
                "unexpected auth more data for {}",
                self.plugin.name()
            ))),
        }
    }

    fn full_auth(&mut self) -> Result<AuthStep> {
        if self.tls {
            self.state = AuthState::WaitOk;
            return Ok(AuthStep::Write(self.cleartext()));
        }
        if let Some(key) = &self.server_key {
            let encrypted = encrypt_password(&self.password, &self.salt, key)?;
            self.state = AuthState::WaitOk;
            return Ok(AuthStep::Write(encrypted));
        }
        self.state = AuthState::WaitPublicKey;
        Ok(AuthStep::Write(vec![CACHING_SHA2_REQUEST_PUBLIC_KEY]))
    }

    fn cleartext(&self) -> Vec<u8> {
        let mut data = self.password.as_bytes().to_vec();
        data.push(0);
        data
    }
}

impl std::fmt::Debug for Authenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Authenticator")
            .field("plugin", &self.plugin)
            .field("tls", &self.tls)
            .field("state", &self.state)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsa::pkcs8::{EncodePublicKey, LineEnding};

    const SALT: [u8; 20] = [
        0x40, 0x3B, 0x57, 0x68, 0x3A, 0x77, 0x23, 0x29, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77,
        0x01, 0x02, 0x03, 0x04, 0x05,
    ];

    #[test]
    fn test_native_response_empty_password() {
        assert!(native_password_response("", &[1, 2, 3, 4]).is_empty());
    }

    #[test]
    fn test_native_response() {
        let response = native_password_response("password", &SALT);
        assert_eq!(response.len(), 20);

        // 같은 비밀번호는 검증 통과, 다른 비밀번호는 실패
        assert!(check_native_password(&response, &SALT, "password"));
        assert!(!check_native_password(&response, &SALT, "passw0rd"));
    }

    #[test]
    fn test_native_response_matches_formula() {
        let stage1 = Sha1::digest(b"secret");
        let stage2 = Sha1::digest(stage1);
        let mut concat = SALT.to_vec();
        concat.extend_from_slice(&stage2);
        let stage3 = Sha1::digest(&concat);
        let expected: Vec<u8> = stage1.iter().zip(stage3.iter()).map(|(a, b)| a ^ b).collect();
        assert_eq!(native_password_response("secret", &SALT), expected);
    }

    #[test]
    fn test_caching_sha2_response() {
        let response = caching_sha2_response("secret", &SALT);
        assert_eq!(response.len(), 32);
        assert!(check_caching_sha2(&response, &SALT, "secret"));
        assert!(!check_caching_sha2(&response, &SALT, "other"));

        let digest = caching_sha2_digest("secret");
        assert!(check_caching_sha2_digest(&response, &SALT, &digest));
        assert!(!check_caching_sha2_digest(&response, &SALT, &caching_sha2_digest("other")));
        assert!(!check_caching_sha2_digest(&[], &SALT, &digest));
    }

    fn hex(s: &str) -> Vec<u8> {
        (0..s.len()).step_by(2).map(|i| u8::from_str_radix(&s[i..i + 2], 16).unwrap()).collect()
    }

    #[test]
    fn test_ed25519_known_vector() {
        let nonce: Vec<u8> = (1..=32).collect();
        let response = ed25519_response("secret", &nonce);
        assert_eq!(
            response,
            hex("60a0f4f8bcb6396043e44b2a25521af16f0815ff6369cc541c281e2c4455c823\
                 2b79b21ee5bb933507725db2f2919ea09e676f6abee19c5c7b98b40a627a9707")
        );
        let public = ed25519_public_key("secret");
        assert_eq!(
            public.to_vec(),
            hex("648814444520e4f56043a2ec9215e63be7992d2d270bc6dee873e36164786096")
        );
        assert!(check_ed25519(&response, &nonce, &public));
        assert!(!check_ed25519(&response, &nonce, &ed25519_public_key("other")));
        assert!(!check_ed25519(&response, &[0u8; 32], &public));
        assert!(!check_ed25519(&response[..63], &nonce, &public));
    }

    #[test]
    fn test_ed25519_switch_keeps_trailing_zero() {
        let mut auth = Authenticator::new(MYSQL_NATIVE_PASSWORD, "secret", &SALT, false, None).unwrap();
        auth.initial_response().unwrap();

        let mut nonce = [9u8; ED25519_NONCE_LEN];
        nonce[ED25519_NONCE_LEN - 1] = 0;
        let mut switch = vec![0xFE];
        switch.extend_from_slice(b"client_ed25519\0");
        switch.extend_from_slice(&nonce);
        assert_eq!(
            auth.handle_packet(&switch).unwrap(),
            AuthStep::Write(ed25519_response("secret", &nonce))
        );
        assert_eq!(auth.plugin(), AuthPlugin::Ed25519);

        let mut short = vec![0xFE];
        short.extend_from_slice(b"client_ed25519\0");
        short.extend_from_slice(&[1, 2, 3]);
        assert!(matches!(auth.handle_packet(&short), Err(BinlogError::ProtocolError(_))));
    }

    #[test]
    fn test_unknown_plugin() {
        assert_eq!(AuthPlugin::from_name(CLIENT_ED25519).unwrap(), AuthPlugin::Ed25519);
        assert!(matches!(
            AuthPlugin::from_name("auth_gssapi_client"),
            Err(BinlogError::ProtocolError(_))
        ));
        assert!(AuthPlugin::from_name("caching_sha2_password1").is_err());
        assert_eq!(AuthPlugin::from_name("").unwrap(), AuthPlugin::NativePassword);
    }

    #[test]
    fn test_fast_auth_flow() {
        let mut auth = Authenticator::new(CACHING_SHA2_PASSWORD, "secret", &SALT, false, None).unwrap();
        assert_eq!(auth.initial_response().unwrap().len(), 32);
        assert_eq!(auth.handle_packet(&[0x01, 0x03]).unwrap(), AuthStep::Continue);
        assert_eq!(auth.handle_packet(&[0x00, 0x00, 0x00, 0x02, 0x00]).unwrap(), AuthStep::Done);
    }

    #[test]
    fn test_full_auth_over_tls_sends_cleartext() {
        let mut auth = Authenticator::new(CACHING_SHA2_PASSWORD, "secret", &SALT, true, None).unwrap();
        auth.initial_response().unwrap();
        assert_eq!(
            auth.handle_packet(&[0x01, 0x04]).unwrap(),
            AuthStep::Write(b"secret\0".to_vec())
        );
    }

    #[test]
    fn test_full_auth_requests_public_key() {
        let mut rng = rand::thread_rng();
        let private = RsaPrivateKey::new(&mut rng, 1024).unwrap();
        let pem = RsaPublicKey::from(&private)
            .to_public_key_pem(LineEnding::LF)
            .unwrap();

        let mut auth = Authenticator::new(CACHING_SHA2_PASSWORD, "secret", &SALT, false, None).unwrap();
        auth.initial_response().unwrap();
        assert_eq!(
            auth.handle_packet(&[0x01, 0x04]).unwrap(),
            AuthStep::Write(vec![CACHING_SHA2_REQUEST_PUBLIC_KEY])
        );

        let mut more = vec![0x01];
        more.extend_from_slice(pem.as_bytes());
        let AuthStep::Write(encrypted) = auth.handle_packet(&more).unwrap() else {
            panic!("expected encrypted password");
        };
        assert_eq!(decrypt_password(&encrypted, &SALT, &private).unwrap(), "secret");
    }

    #[test]
    fn test_auth_switch_uses_new_salt() {
        let mut auth = Authenticator::new(CACHING_SHA2_PASSWORD, "secret", &SALT, false, None).unwrap();
        auth.initial_response().unwrap();

        let new_salt = [7u8; 20];
        let mut switch = vec![0xFE];
        switch.extend_from_slice(b"mysql_native_password\0");
        switch.extend_from_slice(&new_salt);
        switch.push(0);

        let step = auth.handle_packet(&switch).unwrap();
        assert_eq!(step, AuthStep::Write(native_password_response("secret", &new_salt)));
        assert_eq!(auth.plugin(), AuthPlugin::NativePassword);
    }

    #[test]
    fn test_err_packet_is_auth_failed() {
        let mut auth = Authenticator::new(MYSQL_NATIVE_PASSWORD, "x", &SALT, false, None).unwrap();
        let mut err = vec![0xFF, 0x15, 0x04, b'#'];
        err.extend_from_slice(b"28000Access denied");
        assert!(matches!(auth.handle_packet(&err), Err(BinlogError::AuthFailed(_))));
    }

    #[test]
    fn test_sha256_without_key_requests_it() {
        let mut auth = Authenticator::new(SHA256_PASSWORD, "secret", &SALT, false, None).unwrap();
        assert_eq!(auth.initial_response().unwrap(), vec![SHA256_REQUEST_PUBLIC_KEY]);
    }
}
