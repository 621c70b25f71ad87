/// 入站认证
///
/// 只有两种凭据可以通过：与信任锚完全一致的公钥，或由信任锚签发且签名有效的证书。
/// 证书的有效期与 principals 不做检查。
use russh::keys::ssh_key::HashAlg;
use russh::keys::{Certificate, PublicKey};
use tracing::{debug, warn};

/// 对端提交的凭据
#[derive(Debug, Clone, Copy)]
pub enum Credential<'a> {
    /// 原始公钥
    Key(&'a PublicKey),
    /// OpenSSH 证书
    Certificate(&'a Certificate),
    /// 其他方式（password / none / keyboard-interactive），值为方式名
    Unsupported(&'a str),
}

/// 基于单一信任锚的认证器
#[derive(Debug, Clone)]
pub struct Authenticator {
    anchor: PublicKey,
}

impl Authenticator {
    pub fn new(anchor: PublicKey) -> Self {
        Self { anchor }
    }

    /// 判断凭据是否可信
    pub fn authenticate(&self, credential: &Credential<'_>) -> bool {
        match credential {
            Credential::Key(key) => key.key_data() == self.anchor.key_data(),
            Credential::Certificate(cert) => match self.check_certificate(cert) {
                Ok(()) => true,
                Err(reason) => {
                    debug!("Rejected certificate '{}': {}", cert.key_id(), reason);
                    false
                }
            },
            Credential::Unsupported(method) => {
                warn!("Rejected unsupported authentication method '{}'", method);
                false
            }
        }
    }

    fn check_certificate(&self, cert: &Certificate) -> Result<(), String> {
        if cert.signature_key() != self.anchor.key_data() {
            return Err("not signed by the trust anchor".to_string());
        }

        // validate_at 同时校验签名与有效期；取证书自身的起始时间，使有效期检查恒成立
        let fingerprint = self.anchor.fingerprint(HashAlg::Sha256);
        cert.validate_at(cert.valid_after(), [&fingerprint])
            .map_err(|e| format!("signature check failed: {}", e))
    }
}
