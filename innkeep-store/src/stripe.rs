//! Stripe Checkout over the REST API

use async_trait::async_trait;
use innkeep_core::payment::{PaymentGateway, PaymentSession, SessionRequest, SessionStatus};
use innkeep_core::{CoreError, CoreResult};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::app_config::StripeConfig;

#[derive(Clone)]
pub struct StripeGateway {
    client: reqwest::Client,
    secret_key: String,
    base_url: String,
    success_url: String,
    cancel_url: String,
}

fn gateway_err(e: reqwest::Error) -> CoreError {
    CoreError::GatewayError(e.to_string())
}

impl StripeGateway {
    pub fn new(config: &StripeConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()?;

        Ok(Self {
            client,
            secret_key: config.secret_key.clone(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            success_url: config.success_url.clone(),
            cancel_url: config.cancel_url.clone(),
        })
    }

    fn sessions_url(&self) -> String {
        format!("{}/v1/checkout/sessions", self.base_url)
    }

    /// Form body for a one-off card payment billed per day.
    pub fn session_form(&self, request: &SessionRequest) -> Vec<(String, String)> {
        let mut form = vec![
            ("mode".to_string(), "payment".to_string()),
            ("payment_method_types[0]".to_string(), "card".to_string()),
            ("line_items[0][price_data][currency]".to_string(), request.currency.clone()),
            ("line_items[0][price_data][unit_amount]".to_string(), request.unit_amount.to_string()),
            ("line_items[0][price_data][product_data][name]".to_string(), request.description.clone()),
            ("line_items[0][quantity]".to_string(), request.quantity.to_string()),
            ("success_url".to_string(), self.success_url.clone()),
            ("cancel_url".to_string(), self.cancel_url.clone()),
            ("client_reference_id".to_string(), request.order_id.to_string()),
        ];
        for (key, value) in request.metadata() {
            form.push((format!("metadata[{}]", key), value));
        }
        form
    }

    async fn read(resp: reqwest::Response) -> CoreResult<serde_json::Value> {
        let status = resp.status();
        let body: serde_json::Value = resp.json().await.map_err(gateway_err)?;
        if !status.is_success() {
            let message = body["error"]["message"].as_str().unwrap_or("unknown error");
            warn!(%status, "Stripe request rejected: {}", message);
            return Err(CoreError::GatewayError(format!("stripe returned {}: {}", status, message)));
        }
        Ok(body)
    }
}

fn text(value: &serde_json::Value, field: &str) -> Option<String> {
    value[field].as_str().map(String::from)
}

#[async_trait]
impl PaymentGateway for StripeGateway {
    async fn create_session(&self, request: &SessionRequest) -> CoreResult<PaymentSession> {
        let resp = self
            .client
            .post(self.sessions_url())
            .basic_auth(&self.secret_key, None::<&str>)
            // Retried creates for the same order collapse into one session
            .header("Idempotency-Key", request.order_id.to_string())
            .form(&self.session_form(request))
            .send()
            .await
            .map_err(gateway_err)?;

        let body = Self::read(resp).await?;
        let id = text(&body, "id")
            .ok_or_else(|| CoreError::GatewayError(format!("Stripe create_session failed: {}", body)))?;

        info!(session_id = %id, order_id = %request.order_id, "Checkout session created");
        Ok(PaymentSession {
            client_secret: text(&body, "client_secret"),
            url: text(&body, "url"),
            status: text(&body, "status").unwrap_or_else(|| "open".to_string()),
            capture_method: body["payment_intent_data"]["capture_method"].as_str().map(String::from),
            description: Some(request.description.clone()),
            id,
        })
    }

    async fn get_status(&self, session_id: &str) -> CoreResult<SessionStatus> {
        let resp = self
            .client
            .get(format!("{}/{}", self.sessions_url(), session_id))
            .basic_auth(&self.secret_key, None::<&str>)
            .send()
            .await
            .map_err(gateway_err)?;

        let body = Self::read(resp).await?;
        debug!(session_id, payload = %body, "Checkout session fetched");

        let status = text(&body, "status")
            .ok_or_else(|| CoreError::GatewayError(format!("session {} has no status", session_id)))?;
        Ok(SessionStatus {
            id: session_id.to_string(),
            payment_status: text(&body, "payment_status"),
            status,
            raw: body,
        })
    }

    async fn expire_session(&self, session_id: &str) -> CoreResult<()> {
        let resp = self
            .client
            .post(format!("{}/{}/expire", self.sessions_url(), session_id))
            .basic_auth(&self.secret_key, None::<&str>)
            .send()
            .await
            .map_err(gateway_err)?;

        Self::read(resp).await?;
        info!(session_id, "Checkout session expired");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn gateway() -> StripeGateway {
        StripeGateway::new(&StripeConfig {
            secret_key: "sk_test_x".to_string(),
            publishable_key: "pk_test_x".to_string(),
            base_url: "https://api.stripe.com/".to_string(),
            success_url: "https://innkeep.test/ok".to_string(),
            cancel_url: "https://innkeep.test/cancel".to_string(),
            timeout_ms: 1000,
        })
        .unwrap()
    }

    #[test]
    fn test_session_form_bills_per_day() {
        let order_id = Uuid::new_v4();
        let request = SessionRequest {
            order_id,
            user_id: 7,
            room_id: 12,
            unit_amount: 10000,
            quantity: 2,
            currency: "kes".to_string(),
            description: "booking_12".to_string(),
        };

        let form = gateway().session_form(&request);
        let get = |k: &str| form.iter().find(|(key, _)| key == k).map(|(_, v)| v.as_str());

        assert_eq!(get("mode"), Some("payment"));
        assert_eq!(get("line_items[0][price_data][unit_amount]"), Some("10000"));
        assert_eq!(get("line_items[0][quantity]"), Some("2"));
        assert_eq!(get("line_items[0][price_data][currency]"), Some("kes"));
        assert_eq!(get("line_items[0][price_data][product_data][name]"), Some("booking_12"));
        assert_eq!(get("metadata[order_id]"), Some(order_id.to_string().as_str()));
        assert_eq!(get("metadata[user_id]"), Some("7"));
    }

    #[test]
    fn test_base_url_is_normalized() {
        assert_eq!(gateway().sessions_url(), "https://api.stripe.com/v1/checkout/sessions");
    }
}
