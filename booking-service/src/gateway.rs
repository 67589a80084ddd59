use std::sync::Mutex;

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use uuid::Uuid;

use shared::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

/// The consumed slice of the payment provider's contract. The real SDK
/// sits outside this core; webhooks from it are re-verified here before
/// anything inside trusts them.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Registers an order for `amount` and returns the gateway-side id
    /// the buyer pays against.
    async fn create_order(
        &self,
        amount: &BigDecimal,
        currency: &str,
        reference: Uuid,
    ) -> Result<String>;

    /// Checks the payment proof the gateway attached to a capture.
    async fn verify_signature(
        &self,
        order_id: &str,
        payment_id: &str,
        signature: &str,
    ) -> Result<bool>;

    /// Returns the gateway refund id.
    async fn refund(&self, payment_id: &str, amount: &BigDecimal) -> Result<String>;
}

/// hex(HMAC-SHA256(secret, "{order_id}|{payment_id}")), the shape most
/// gateways use for capture proofs.
pub fn payment_signature(secret: &str, order_id: &str, payment_id: &str) -> String {
    sign(secret, format!("{order_id}|{payment_id}").as_bytes())
}

pub fn webhook_signature(secret: &str, body: &[u8]) -> String {
    sign(secret, body)
}

/// Inbound webhook bodies are HMAC-signed by the gateway and must be
/// independently re-verified before being trusted.
pub fn verify_webhook(secret: &str, body: &[u8], signature: &str) -> bool {
    constant_time_eq(&webhook_signature(secret, body), signature)
}

fn sign(secret: &str, message: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .unwrap_or_else(|_| unreachable!("hmac accepts any key length"));
    mac.update(message);
    hex::encode(mac.finalize().into_bytes())
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.bytes().zip(b.bytes()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Signs and verifies locally with the shared secret. Stands in for the
/// provider in dev and tests; the signature math matches what the
/// webhook path checks.
pub struct LocalPaymentGateway {
    secret: String,
    refund_calls: Mutex<u32>,
    fail_refunds: bool,
}

impl LocalPaymentGateway {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
            refund_calls: Mutex::new(0),
            fail_refunds: false,
        }
    }

    /// Gateway that rejects every refund, for exercising the
    /// leave-paid-for-retry path.
    pub fn failing_refunds(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
            refund_calls: Mutex::new(0),
            fail_refunds: true,
        }
    }

    pub fn sign_payment(&self, order_id: &str, payment_id: &str) -> String {
        payment_signature(&self.secret, order_id, payment_id)
    }

    pub fn refund_calls(&self) -> u32 {
        self.refund_calls.lock().map(|n| *n).unwrap_or(0)
    }
}

#[async_trait]
impl PaymentGateway for LocalPaymentGateway {
    async fn create_order(
        &self,
        _amount: &BigDecimal,
        _currency: &str,
        reference: Uuid,
    ) -> Result<String> {
        Ok(format!("order_{reference}"))
    }

    async fn verify_signature(
        &self,
        order_id: &str,
        payment_id: &str,
        signature: &str,
    ) -> Result<bool> {
        Ok(constant_time_eq(
            &payment_signature(&self.secret, order_id, payment_id),
            signature,
        ))
    }

    async fn refund(&self, payment_id: &str, _amount: &BigDecimal) -> Result<String> {
        if let Ok(mut n) = self.refund_calls.lock() {
            *n += 1;
        }
        if self.fail_refunds {
            return Err(Error::external("refund endpoint returned 503"));
        }
        Ok(format!("rfnd_{payment_id}"))
    }
}
