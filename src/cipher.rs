//! 缓存加密能力
//!
//! 任务缓存落盘前统一经过 `CacheCipher` 加密，缓存本身只看到不透明的字节。
//! 宿主应用负责提供实现（通常从系统钥匙串取出密钥后构造 `AesGcmCipher`）。

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use rand::RngCore;
use thiserror::Error;

/// AES-GCM nonce 长度（字节）
const NONCE_LEN: usize = 12;

/// AES-256 密钥长度（字节）
pub const AES_KEY_LEN: usize = 32;

/// 加解密错误
#[derive(Debug, Error)]
pub enum CipherError {
    #[error("密钥无效: {0}")]
    InvalidKey(String),
    #[error("加密失败: {0}")]
    Encrypt(String),
    #[error("解密失败: {0}")]
    Decrypt(String),
}

/// 缓存加解密接口
pub trait CacheCipher: Send + Sync {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CipherError>;

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CipherError>;
}

/// 不加密（测试或调试用）
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainCipher;

impl CacheCipher for PlainCipher {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CipherError> {
        Ok(plaintext.to_vec())
    }

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CipherError> {
        Ok(ciphertext.to_vec())
    }
}

/// AES-256-GCM 加密
///
/// 输出格式：`nonce(12 字节) || ciphertext+tag`，每次加密使用随机 nonce
pub struct AesGcmCipher {
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for AesGcmCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AesGcmCipher").finish_non_exhaustive()
    }
}

impl AesGcmCipher {
    /// 从 32 字节原始密钥创建
    pub fn new(key: &[u8]) -> Result<Self, CipherError> {
        if key.len() != AES_KEY_LEN {
            return Err(CipherError::InvalidKey(format!(
                "密钥长度应为 {} 字节，实际 {} 字节",
                AES_KEY_LEN,
                key.len()
            )));
        }

        let cipher = Aes256Gcm::new_from_slice(key)
            .map_err(|e| CipherError::InvalidKey(e.to_string()))?;

        Ok(Self { cipher })
    }

    /// 从 base64 编码的密钥创建
    pub fn from_base64(encoded: &str) -> Result<Self, CipherError> {
        let key = STANDARD
            .decode(encoded.trim())
            .map_err(|e| CipherError::InvalidKey(e.to_string()))?;
        Self::new(&key)
    }

    /// 生成随机密钥（base64 编码），由宿主应用自行保存
    pub fn generate_key() -> String {
        let mut key = [0u8; AES_KEY_LEN];
        rand::thread_rng().fill_bytes(&mut key);
        STANDARD.encode(key)
    }
}

impl CacheCipher for AesGcmCipher {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CipherError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext)
            .map_err(|e| CipherError::Encrypt(e.to_string()))?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CipherError> {
        if ciphertext.len() < NONCE_LEN {
            return Err(CipherError::Decrypt(format!(
                "数据过短: {} 字节",
                ciphertext.len()
            )));
        }

        let (nonce_bytes, body) = ciphertext.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce_bytes), body)
            .map_err(|e| CipherError::Decrypt(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aes_gcm_seal_and_open() {
        let cipher = AesGcmCipher::from_base64(&AesGcmCipher::generate_key()).unwrap();

        let sealed = cipher.encrypt(b"task metadata").unwrap();
        assert_ne!(&sealed[NONCE_LEN..], b"task metadata");
        assert_eq!(cipher.decrypt(&sealed).unwrap(), b"task metadata");
    }

    #[test]
    fn test_aes_gcm_random_nonce() {
        let cipher = AesGcmCipher::new(&[7u8; AES_KEY_LEN]).unwrap();
        let a = cipher.encrypt(b"same").unwrap();
        let b = cipher.encrypt(b"same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_aes_gcm_wrong_key() {
        let a = AesGcmCipher::new(&[1u8; AES_KEY_LEN]).unwrap();
        let b = AesGcmCipher::new(&[2u8; AES_KEY_LEN]).unwrap();

        let sealed = a.encrypt(b"secret").unwrap();
        assert!(b.decrypt(&sealed).is_err());
        assert!(a.decrypt(&sealed[..4]).is_err());
    }

    #[test]
    fn test_invalid_key_length() {
        assert!(matches!(
            AesGcmCipher::new(&[0u8; 16]),
            Err(CipherError::InvalidKey(_))
        ));
        assert!(AesGcmCipher::from_base64("not base64!").is_err());
    }
}
