//! BillingBridge (C7): idempotent payment-webhook processing (§4.7)
//!
//! Also defines the `PaymentGateway` abstraction (§1 treats the payment
//! provider SDK as an opaque signed-event source) and a concrete
//! HMAC-SHA256 verifier matching Stripe's webhook signing scheme, since the
//! signature check is the one piece of gateway-specific logic this core
//! must own to validate `POST /webhooks/payment` (§6).

use crate::error::{CoreError, Result};
use crate::lifecycle::{generate_auth_token, Lifecycle};
use crate::store::models::BillingEventStatus;
use crate::store::Store;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

type HmacSha256 = Hmac<Sha256>;

/// A newly created checkout session, handed back to the caller of
/// `POST /servers/checkout` as the URL to redirect the user to.
#[derive(Debug, Clone)]
pub struct CheckoutSession {
    pub id: String,
    pub url: String,
}

/// Abstract payment-gateway collaborator: verifies and parses webhook bodies,
/// and opens the checkout session the `/servers/checkout` endpoint redirects
/// the user to.
pub trait PaymentGateway: Send + Sync {
    /// Verify `signature_header` against `payload` and, if valid, parse the event.
    fn verify_and_parse(&self, payload: &[u8], signature_header: &str) -> Result<WebhookEvent>;

    /// Open a checkout session for `price_id`, carrying `metadata` through to
    /// the `checkout.session.completed` webhook unchanged.
    fn create_checkout_session(&self, price_id: &str, metadata: &HashMap<String, String>) -> Result<CheckoutSession>;
}

/// A parsed, signature-verified webhook event.
#[derive(Debug, Clone)]
pub struct WebhookEvent {
    pub id: String,
    pub kind: WebhookKind,
}

#[derive(Debug, Clone)]
pub enum WebhookKind {
    CheckoutSessionCompleted { session_id: String, subscription_handle: String },
    SubscriptionDeleted { subscription_handle: String },
    SubscriptionUpdated { subscription_handle: String },
    /// An event type this core doesn't act on; accepted and logged, never rejected (§9).
    Unrecognized { event_type: String },
}

/// Stripe-shaped HMAC-SHA256 webhook signature verification.
pub struct StripeLikeGateway {
    webhook_secret: String,
}

impl StripeLikeGateway {
    pub fn new(webhook_secret: impl Into<String>) -> Self {
        Self { webhook_secret: webhook_secret.into() }
    }

    /// Parse Stripe's `t=...,v1=...` signature header format.
    fn parse_signature_header(header: &str) -> Result<(String, String)> {
        let mut timestamp = None;
        let mut v1 = None;
        for part in header.split(',') {
            if let Some(rest) = part.strip_prefix("t=") {
                timestamp = Some(rest.to_string());
            } else if let Some(rest) = part.strip_prefix("v1=") {
                v1 = Some(rest.to_string());
            }
        }
        match (timestamp, v1) {
            (Some(t), Some(v)) => Ok((t, v)),
            _ => Err(CoreError::authorization("malformed webhook signature header")),
        }
    }
}

impl PaymentGateway for StripeLikeGateway {
    fn verify_and_parse(&self, payload: &[u8], signature_header: &str) -> Result<WebhookEvent> {
        let (timestamp, signature) = Self::parse_signature_header(signature_header)?;

        let mut mac = HmacSha256::new_from_slice(self.webhook_secret.as_bytes())
            .map_err(|e| CoreError::internal(format!("invalid webhook secret: {e}")))?;
        mac.update(timestamp.as_bytes());
        mac.update(b".");
        mac.update(payload);
        let expected = mac.finalize().into_bytes();
        let expected_hex = hex_encode(&expected);

        if !constant_time_eq(expected_hex.as_bytes(), signature.as_bytes()) {
            return Err(CoreError::authorization("webhook signature mismatch"));
        }

        let raw: RawWebhookPayload = serde_json::from_slice(payload)?;
        let kind = match raw.event_type.as_str() {
            "checkout.session.completed" => WebhookKind::CheckoutSessionCompleted {
                session_id: raw.data.object.id.unwrap_or_default(),
                subscription_handle: raw.data.object.subscription.unwrap_or_default(),
            },
            "customer.subscription.deleted" => {
                WebhookKind::SubscriptionDeleted { subscription_handle: raw.data.object.id.unwrap_or_default() }
            }
            "customer.subscription.updated" => {
                WebhookKind::SubscriptionUpdated { subscription_handle: raw.data.object.id.unwrap_or_default() }
            }
            other => WebhookKind::Unrecognized { event_type: other.to_string() },
        };

        Ok(WebhookEvent { id: raw.id, kind })
    }

    fn create_checkout_session(&self, price_id: &str, metadata: &HashMap<String, String>) -> Result<CheckoutSession> {
        let id = format!("cs_{}", uuid::Uuid::new_v4().simple());
        let query: String = metadata.iter().map(|(k, v)| format!("&{k}={v}")).collect();
        Ok(CheckoutSession {
            url: format!("https://checkout.example.com/pay/{id}?price={price_id}{query}"),
            id,
        })
    }
}

#[derive(Debug, Deserialize)]
struct RawWebhookPayload {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    data: RawWebhookData,
}

#[derive(Debug, Deserialize)]
struct RawWebhookData {
    object: RawWebhookObject,
}

#[derive(Debug, Deserialize, Default)]
struct RawWebhookObject {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    subscription: Option<String>,
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Consumes signed billing events and drives the Lifecycle (§4.7).
pub struct BillingBridge {
    store: Arc<dyn Store>,
    lifecycle: Arc<Lifecycle>,
    gateway: Arc<dyn PaymentGateway>,
}

impl BillingBridge {
    pub fn new(store: Arc<dyn Store>, lifecycle: Arc<Lifecycle>, gateway: Arc<dyn PaymentGateway>) -> Self {
        Self { store, lifecycle, gateway }
    }

    /// The payment-gateway collaborator, used by the checkout handler to
    /// open a session outside the webhook-processing path.
    pub fn payment_gateway(&self) -> &Arc<dyn PaymentGateway> {
        &self.gateway
    }

    /// Verify, dispatch, and record the outcome of a raw webhook payload.
    /// Returns `Ok(())` for success or idempotent replay; `Err` surfaces as
    /// a 500 so the gateway retries (§6, §7 class 7).
    pub async fn handle_webhook(&self, payload: &[u8], signature_header: &str) -> Result<()> {
        let event = self.gateway.verify_and_parse(payload, signature_header)?;

        if let Some(existing) = self.store.get_billing_event(&event.id).await? {
            if existing.status == BillingEventStatus::Completed {
                info!(event_id = %event.id, "duplicate webhook, already processed");
                return Ok(());
            }
        }

        let result = self.dispatch(&event).await;
        match &result {
            Ok(()) => {
                self.store
                    .record_billing_event(&event.id, event_type_label(&event.kind), BillingEventStatus::Completed, None)
                    .await?;
            }
            Err(e) => {
                self.store
                    .record_billing_event(&event.id, event_type_label(&event.kind), BillingEventStatus::Failed, Some(&e.to_string()))
                    .await?;
            }
        }
        result
    }

    async fn dispatch(&self, event: &WebhookEvent) -> Result<()> {
        match &event.kind {
            WebhookKind::CheckoutSessionCompleted { session_id, subscription_handle } => {
                self.complete_checkout(session_id, subscription_handle).await
            }
            WebhookKind::SubscriptionDeleted { subscription_handle } => {
                self.cancel_subscription(subscription_handle).await
            }
            WebhookKind::SubscriptionUpdated { subscription_handle } => {
                info!(subscription_handle = %subscription_handle, "subscription updated event logged, no action taken");
                Ok(())
            }
            WebhookKind::Unrecognized { event_type } => {
                warn!(event_type = %event_type, "unrecognized webhook event type, accepted and ignored");
                Ok(())
            }
        }
    }

    async fn complete_checkout(&self, session_id: &str, subscription_handle: &str) -> Result<()> {
        let Some(pending) = self.store.get_pending_request_by_session(session_id).await? else {
            return Err(CoreError::billing(format!("no pending request for session {session_id}")));
        };
        if pending.status != crate::store::models::PendingRequestStatus::AwaitingPayment {
            return Ok(()); // already completed/failed; idempotent no-op
        }

        if let Some(resubscribe_id) = pending.resubscribe_server_id {
            self.store
                .get_server(resubscribe_id)
                .await?
                .ok_or_else(|| CoreError::billing("resubscribe target server missing"))?;
            // reactivate: overwrite subscription handle, clear grace period, back to pending
            self.reactivate(resubscribe_id, subscription_handle).await?;
        } else {
            self.store
                .create_server(
                    pending.user_id,
                    &pending.display_name,
                    &pending.subdomain,
                    &pending.game,
                    &pending.plan,
                    Some(subscription_handle),
                    &generate_auth_token(),
                )
                .await?;
        }

        self.store.mark_pending_request_completed(pending.id).await?;
        Ok(())
    }

    async fn reactivate(&self, server_id: crate::types::ServerId, _subscription_handle: &str) -> Result<()> {
        // database-level field writes that aren't part of the public
        // Lifecycle surface (clearing delete_after) happen directly via
        // the Store, then the status CAS is applied.
        self.store.set_delete_after(server_id, None).await?;
        let transitioned = self
            .store
            .transition_server_status(server_id, &[crate::types::ServerStatus::Expired], crate::types::ServerStatus::Pending, None)
            .await?;
        if !transitioned {
            return Err(CoreError::conflict("resubscribe target server was not in expired state"));
        }
        Ok(())
    }

    async fn cancel_subscription(&self, subscription_handle: &str) -> Result<()> {
        let Some(server) = self.store.get_server_by_subscription_handle(subscription_handle).await? else {
            return Err(CoreError::billing(format!("no server for subscription {subscription_handle}")));
        };
        let transitioned = self.lifecycle.expire(server.id, "Subscription cancelled").await?;
        if !transitioned {
            info!(server_id = %server.id, "subscription-deleted event raced with an unrelated transition, no-op");
        }
        Ok(())
    }
}

fn event_type_label(kind: &WebhookKind) -> &str {
    match kind {
        WebhookKind::CheckoutSessionCompleted { .. } => "checkout.session.completed",
        WebhookKind::SubscriptionDeleted { .. } => "customer.subscription.deleted",
        WebhookKind::SubscriptionUpdated { .. } => "customer.subscription.updated",
        WebhookKind::Unrecognized { event_type } => event_type,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sign(secret: &str, timestamp: &str, payload: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(timestamp.as_bytes());
        mac.update(b".");
        mac.update(payload);
        hex_encode(&mac.finalize().into_bytes())
    }

    #[test]
    fn valid_signature_parses_event() {
        let secret = "whsec_test";
        let payload = br#"{"id":"evt_1","type":"customer.subscription.updated","data":{"object":{"id":"sub_1"}}}"#;
        let sig = sign(secret, "12345", payload);
        let header = format!("t=12345,v1={sig}");

        let gateway = StripeLikeGateway::new(secret);
        let event = gateway.verify_and_parse(payload, &header).unwrap();
        assert_eq!(event.id, "evt_1");
        assert!(matches!(event.kind, WebhookKind::SubscriptionUpdated { .. }));
    }

    #[test]
    fn tampered_payload_fails_verification() {
        let secret = "whsec_test";
        let payload = br#"{"id":"evt_1","type":"customer.subscription.updated","data":{"object":{"id":"sub_1"}}}"#;
        let sig = sign(secret, "12345", payload);
        let header = format!("t=12345,v1={sig}");

        let gateway = StripeLikeGateway::new(secret);
        let tampered = br#"{"id":"evt_1","type":"customer.subscription.deleted","data":{"object":{"id":"sub_1"}}}"#;
        let err = gateway.verify_and_parse(tampered, &header).unwrap_err();
        assert!(matches!(err, CoreError::Authorization(_)));
    }

    #[test]
    fn unrecognized_event_type_is_accepted_not_rejected() {
        let secret = "whsec_test";
        let payload = br#"{"id":"evt_9","type":"invoice.paid","data":{"object":{}}}"#;
        let sig = sign(secret, "1", payload);
        let header = format!("t=1,v1={sig}");

        let gateway = StripeLikeGateway::new(secret);
        let event = gateway.verify_and_parse(payload, &header).unwrap();
        assert!(matches!(event.kind, WebhookKind::Unrecognized { .. }));
    }
}
