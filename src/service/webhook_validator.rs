//! Webhook签名验证与载荷校验
//!
//! 推送模式下索引服务回调的入口校验：
//! - 配置了密钥时，`x-webhook-signature` 必须是请求体的 HMAC-SHA256（hex）
//! - 载荷缺字段、类型错误或负数一律拒绝，不进入状态机

use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use utoipa::ToSchema;
use zeroize::Zeroizing;

use crate::domain::{normalize_address, ChainEvent, EventSource};

type HmacSha256 = Hmac<Sha256>;

/// 交易哈希（32 字节）的十六进制长度
const TX_HASH_HEX_LEN: usize = 64;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum WebhookError {
    #[error("missing webhook signature")]
    MissingSignature,
    #[error("invalid webhook signature")]
    InvalidSignature,
    #[error("malformed webhook payload: {0}")]
    Malformed(String),
}

/// 链上事件推送载荷
#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct ChainWebhookPayload {
    pub address: String,
    pub tx_hash: String,
    /// 支付到该地址的金额（最小单位）
    pub value: u64,
    pub confirmations: u32,
    /// 交易已从所有池中消失
    #[serde(default)]
    pub dropped: bool,
}

impl ChainWebhookPayload {
    pub fn into_event(self) -> ChainEvent {
        if self.dropped {
            ChainEvent::dropped(self.address, self.tx_hash, EventSource::Push)
        } else {
            ChainEvent::seen(
                self.address,
                self.tx_hash,
                self.value,
                self.confirmations,
                EventSource::Push,
            )
        }
    }
}

/// Webhook验证器
pub struct WebhookValidator {
    secret: Option<Zeroizing<String>>,
}

impl WebhookValidator {
    pub fn new(secret: Option<String>) -> Self {
        Self {
            secret: secret.filter(|s| !s.is_empty()).map(Zeroizing::new),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.secret.is_some()
    }

    /// 验证签名；未配置密钥时直接通过
    pub fn verify_signature(&self, body: &[u8], signature: Option<&str>) -> Result<(), WebhookError> {
        let Some(secret) = &self.secret else {
            return Ok(());
        };
        let provided = signature.ok_or(WebhookError::MissingSignature)?;
        let provided = provided.trim();
        let provided = provided.strip_prefix("sha256=").unwrap_or(provided);

        let expected = compute_hmac_sha256(secret, body);
        if bool::from(expected.as_bytes().ct_eq(provided.to_ascii_lowercase().as_bytes())) {
            Ok(())
        } else {
            Err(WebhookError::InvalidSignature)
        }
    }

    /// 解析并校验载荷
    ///
    /// 交易哈希必须是 64 位十六进制，统一转为小写；bech32 地址统一转为小写。
    pub fn parse_payload(&self, body: &[u8]) -> Result<ChainWebhookPayload, WebhookError> {
        let mut payload: ChainWebhookPayload =
            serde_json::from_slice(body).map_err(|e| WebhookError::Malformed(e.to_string()))?;

        payload.address = normalize_address(&payload.address);
        if payload.address.is_empty() {
            return Err(WebhookError::Malformed("address must not be empty".into()));
        }
        let tx_hash = payload.tx_hash.trim();
        if tx_hash.len() != TX_HASH_HEX_LEN || !tx_hash.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(WebhookError::Malformed(format!(
                "tx_hash must be {} hex characters",
                TX_HASH_HEX_LEN
            )));
        }
        payload.tx_hash = tx_hash.to_ascii_lowercase();
        if !payload.dropped && payload.value == 0 {
            return Err(WebhookError::Malformed("value must be positive".into()));
        }
        Ok(payload)
    }
}

/// 计算HMAC-SHA256签名（hex）
pub fn compute_hmac_sha256(secret: &str, message: &[u8]) -> String {
    // HMAC 接受任意长度的密钥
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return String::new(),
    };
    mac.update(message);
    hex::encode(mac.finalize().into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ChainEventKind;

    const TXID: &str = "00ff000000000000000000000000000000000000000000000000000000000000";
    const BODY: &[u8] = br#"{"address":"tb1qabc","tx_hash":"00ff000000000000000000000000000000000000000000000000000000000000","value":1500,"confirmations":2}"#;

    #[test]
    fn test_hmac_sha256() {
        let signature = compute_hmac_sha256("test_secret", b"test_message");
        assert_eq!(signature.len(), 64); // SHA256 hex = 64 chars
        assert_eq!(signature, compute_hmac_sha256("test_secret", b"test_message"));
        assert_ne!(signature, compute_hmac_sha256("other", b"test_message"));
    }

    #[test]
    fn test_signature_verification() {
        let validator = WebhookValidator::new(Some("s3cret".into()));
        let good = compute_hmac_sha256("s3cret", BODY);

        assert!(validator.verify_signature(BODY, Some(&good)).is_ok());
        assert!(validator
            .verify_signature(BODY, Some(&format!("sha256={}", good.to_uppercase())))
            .is_ok());
        assert_eq!(
            validator.verify_signature(BODY, None),
            Err(WebhookError::MissingSignature)
        );
        assert_eq!(
            validator.verify_signature(b"{}", Some(&good)),
            Err(WebhookError::InvalidSignature)
        );
    }

    #[test]
    fn test_disabled_validator_accepts_unsigned() {
        let validator = WebhookValidator::new(None);
        assert!(!validator.is_enabled());
        assert!(validator.verify_signature(BODY, None).is_ok());
        assert!(!WebhookValidator::new(Some(String::new())).is_enabled());
    }

    #[test]
    fn test_payload_validation() {
        let validator = WebhookValidator::new(None);
        let payload = validator.parse_payload(BODY).unwrap();
        let event = payload.into_event();
        assert_eq!(event.amount, 1500);
        assert_eq!(event.confirmations, 2);
        assert_eq!(event.tx_hash, TXID);
        assert_eq!(event.kind, ChainEventKind::Seen);

        let bad_payloads = [
            format!(r#"{{"address":"tb1qabc","tx_hash":"{TXID}","value":-5,"confirmations":2}}"#),
            r#"{"address":"tb1qabc","value":5,"confirmations":2}"#.to_string(),
            format!(r#"{{"address":"","tx_hash":"{TXID}","value":5,"confirmations":2}}"#),
            r#"{"address":"tb1qabc","tx_hash":"zz","value":5,"confirmations":2}"#.to_string(),
            r#"{"address":"tb1qabc","tx_hash":"00ff","value":5,"confirmations":2}"#.to_string(),
            format!(r#"{{"address":"tb1qabc","tx_hash":"{TXID}00","value":5,"confirmations":2}}"#),
            format!(r#"{{"address":"tb1qabc","tx_hash":"{TXID}","value":0,"confirmations":2}}"#),
            "not json".to_string(),
        ];
        for bad in bad_payloads {
            assert!(
                matches!(
                    validator.parse_payload(bad.as_bytes()),
                    Err(WebhookError::Malformed(_))
                ),
                "{bad}"
            );
        }
    }

    #[test]
    fn test_identifiers_are_lowercased() {
        let validator = WebhookValidator::new(None);
        let body = format!(
            r#"{{"address":"TB1QABC","tx_hash":"{}","value":5,"confirmations":1}}"#,
            TXID.to_uppercase()
        );
        let payload = validator.parse_payload(body.as_bytes()).unwrap();
        assert_eq!(payload.address, "tb1qabc");
        assert_eq!(payload.tx_hash, TXID);
    }

    #[test]
    fn test_dropped_payload_becomes_drop_event() {
        let validator = WebhookValidator::new(None);
        let body = format!(
            r#"{{"address":"tb1qabc","tx_hash":"{TXID}","value":0,"confirmations":0,"dropped":true}}"#
        );
        let payload = validator.parse_payload(body.as_bytes()).unwrap();
        assert_eq!(payload.into_event().kind, ChainEventKind::Dropped);
    }
}
