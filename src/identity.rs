/// 身份与信任锚加载
///
/// 读取 OpenSSH 格式的私钥、可选的用户证书，以及作为证书颁发者的信任锚公钥。
/// 加载完成后全部只读，由 SSH 服务端与隧道客户端共享。
use crate::error::{Result, TunnelError};
use russh::keys::ssh_key::certificate::Field;
use russh::keys::ssh_key::{self, HashAlg};
use russh::keys::{Certificate, PrivateKey, PublicKey};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// 签名身份：私钥 + 可选证书
#[derive(Clone)]
pub struct Identity {
    key: Arc<PrivateKey>,
    certificate: Option<Certificate>,
}

impl Identity {
    /// 创建身份，证书（如果有）必须是为该私钥签发的
    pub fn new(key: PrivateKey, certificate: Option<Certificate>) -> Result<Self> {
        if let Some(ref cert) = certificate {
            if cert.public_key() != key.public_key().key_data() {
                return Err(TunnelError::identity(
                    "certificate was not issued for the configured private key",
                ));
            }
        }
        Ok(Self {
            key: Arc::new(key),
            certificate,
        })
    }

    pub fn key(&self) -> Arc<PrivateKey> {
        self.key.clone()
    }

    pub fn public_key(&self) -> &PublicKey {
        self.key.public_key()
    }

    pub fn certificate(&self) -> Option<&Certificate> {
        self.certificate.as_ref()
    }

    /// SHA256 指纹，用于日志
    pub fn fingerprint(&self) -> String {
        self.key.public_key().fingerprint(HashAlg::Sha256).to_string()
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("fingerprint", &self.fingerprint())
            .field("certificate", &self.certificate.is_some())
            .finish()
    }
}

/// 从文件加载身份
pub fn load_identity(key_path: &Path, cert_path: Option<&Path>) -> Result<Identity> {
    let key_text = read_file(key_path, "private key")?;
    let key = parse_private_key(&key_text)?;

    let certificate = match cert_path {
        Some(path) => {
            let text = read_file(path, "certificate")?;
            Some(parse_certificate(&text)?)
        }
        None => None,
    };

    let identity = Identity::new(key, certificate)?;
    info!(
        "Loaded identity {} ({})",
        identity.fingerprint(),
        if identity.certificate().is_some() {
            "with certificate"
        } else {
            "raw key"
        }
    );
    Ok(identity)
}

/// 加载信任锚（authorized_keys 格式的单行公钥）
pub fn load_trust_anchor(path: &Path) -> Result<PublicKey> {
    let text = read_file(path, "trust anchor")?;
    let anchor = parse_public_key(&text)?;
    info!(
        "Loaded trust anchor {}",
        anchor.fingerprint(HashAlg::Sha256)
    );
    Ok(anchor)
}

/// 解析私钥（OpenSSH / PKCS#8 / PEM）
pub fn parse_private_key(text: &str) -> Result<PrivateKey> {
    if text.trim().is_empty() {
        return Err(TunnelError::identity("empty private key"));
    }
    russh::keys::decode_secret_key(text, None)
        .map_err(|e| TunnelError::identity(format!("could not parse private key: {}", e)))
}

/// 解析 OpenSSH 证书（`*-cert.pub` 文件内容）
pub fn parse_certificate(text: &str) -> Result<Certificate> {
    let line = first_entry(text).ok_or_else(|| TunnelError::identity("empty certificate"))?;
    let cert = Certificate::from_openssh(line).map_err(certificate_error)?;
    debug!(
        "Parsed certificate key_id='{}' serial={}",
        cert.key_id(),
        cert.serial()
    );
    Ok(cert)
}

/// 有效期时间戳超出 i64 时解码失败，常见于未加 `-V` 签发的永久证书
fn certificate_error(e: ssh_key::Error) -> TunnelError {
    match e {
        ssh_key::Error::Time | ssh_key::Error::CertificateFieldInvalid(Field::ValidBefore) => {
            TunnelError::identity(
                "could not parse certificate: validity end is beyond the supported range, \
                 re-issue it with an explicit expiry (ssh-keygen -V)",
            )
        }
        e => TunnelError::identity(format!("could not parse certificate: {}", e)),
    }
}

/// 解析 authorized_keys 格式的公钥，忽略空行和注释
pub fn parse_public_key(text: &str) -> Result<PublicKey> {
    let line = first_entry(text).ok_or_else(|| TunnelError::identity("empty public key"))?;
    PublicKey::from_openssh(line)
        .map_err(|e| TunnelError::identity(format!("could not parse public key: {}", e)))
}

fn first_entry(text: &str) -> Option<&str> {
    text.lines()
        .map(str::trim)
        .find(|line| !line.is_empty() && !line.starts_with('#'))
}

fn read_file(path: &Path, what: &str) -> Result<String> {
    std::fs::read_to_string(path).map_err(|e| {
        TunnelError::identity(format!(
            "could not open {} file ({}): {}",
            what,
            path.display(),
            e
        ))
    })
}
