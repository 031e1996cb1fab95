//! TLS 설정 (rustls)
//!
//! 클라이언트는 SSLRequest 이후, 서버는 SSLRequest 수신 후 같은 스트림을 TLS로 감쌉니다.

use crate::error::{BinlogError, Result};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_rustls::{TlsAcceptor, TlsConnector};

/// TLS 사용 방식
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SslMode {
    /// 평문 연결
    #[default]
    Disable,
    /// 서버가 지원하면 TLS 사용
    Prefer,
    /// TLS 필수
    Require,
}

impl std::str::FromStr for SslMode {
    type Err = BinlogError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "disable" | "off" | "false" | "0" => Ok(SslMode::Disable),
            "prefer" | "preferred" => Ok(SslMode::Prefer),
            "require" | "required" | "on" | "true" | "1" => Ok(SslMode::Require),
            _ => Err(BinlogError::ConfigError(format!("Invalid SSL mode '{}'", s))),
        }
    }
}

/// 클라이언트 TLS 설정
#[derive(Debug, Clone, Default)]
pub struct TlsConfig {
    pub mode: SslMode,
    /// CA 인증서 (PEM). 없으면 webpki 루트 사용
    pub ca_cert_path: Option<PathBuf>,
    /// 클라이언트 인증서 (mTLS)
    pub client_cert_path: Option<PathBuf>,
    pub client_key_path: Option<PathBuf>,
    /// SNI / 호스트명 검증용 이름. 없으면 접속 호스트명
    pub server_name: Option<String>,
    /// 인증서 검증 생략 (테스트 전용)
    pub skip_verify: bool,
}

impl TlsConfig {
    pub fn new(mode: SslMode) -> Self {
        TlsConfig {
            mode,
            ..Default::default()
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.mode != SslMode::Disable
    }

    pub fn is_required(&self) -> bool {
        self.mode == SslMode::Require
    }

    pub fn validate(&self) -> Result<()> {
        if self.client_cert_path.is_some() != self.client_key_path.is_some() {
            return Err(BinlogError::ConfigError(
                "client certificate and key must be given together".to_string(),
            ));
        }
        Ok(())
    }

    /// 검증할 서버 이름
    pub fn server_name(&self, hostname: &str) -> Result<ServerName<'static>> {
        let name = self.server_name.clone().unwrap_or_else(|| hostname.to_string());
        ServerName::try_from(name)
            .map_err(|e| BinlogError::ConfigError(format!("Invalid TLS server name: {}", e)))
    }

    /// rustls ClientConfig 생성
    pub fn build_client_config(&self) -> Result<rustls::ClientConfig> {
        self.validate()?;

        let builder = if self.skip_verify {
            rustls::ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(NoCertificateVerification))
        } else {
            let mut root_store = rustls::RootCertStore::empty();
            match &self.ca_cert_path {
                Some(ca_path) => {
                    for cert in load_certs(ca_path)? {
                        root_store.add(cert).map_err(|e| {
                            BinlogError::ConfigError(format!("Failed to add CA cert: {}", e))
                        })?;
                    }
                }
                None => root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned()),
            }
            rustls::ClientConfig::builder().with_root_certificates(root_store)
        };

        let config = match (&self.client_cert_path, &self.client_key_path) {
            (Some(cert_path), Some(key_path)) => builder
                .with_client_auth_cert(load_certs(cert_path)?, load_key(key_path)?)
                .map_err(|e| BinlogError::ConfigError(format!("Failed to set client auth: {}", e)))?,
            _ => builder.with_no_client_auth(),
        };
        Ok(config)
    }

    pub fn connector(&self) -> Result<TlsConnector> {
        Ok(TlsConnector::from(Arc::new(self.build_client_config()?)))
    }
}

/// 서버용 TLS acceptor (인증서 체인 + 개인키 PEM)
pub fn build_acceptor(cert_path: &Path, key_path: &Path) -> Result<TlsAcceptor> {
    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(load_certs(cert_path)?, load_key(key_path)?)
        .map_err(|e| BinlogError::ConfigError(format!("Invalid server certificate: {}", e)))?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path).map_err(|e| {
        BinlogError::ConfigError(format!("Failed to open {}: {}", path.display(), e))
    })?;
    rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| BinlogError::ConfigError(format!("Failed to parse certs: {}", e)))
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(path).map_err(|e| {
        BinlogError::ConfigError(format!("Failed to open {}: {}", path.display(), e))
    })?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|e| BinlogError::ConfigError(format!("Failed to parse key: {}", e)))?
        .ok_or_else(|| BinlogError::ConfigError("No private key found in file".to_string()))
}

/// 모든 인증서를 허용하는 검증기 (skip_verify 전용)
#[derive(Debug)]
struct NoCertificateVerification;

impl rustls::client::danger::ServerCertVerifier for NoCertificateVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::ED25519,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
        ]
    }
}
