use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;

use super::auth::{GatewayAuth, SIGNATURE_HEADER, TIMESTAMP_HEADER};
use super::{CloseFill, OrderParams, OrderStatus, VenueAdapter, VenueClose, VenueError};
use crate::models::{CloseReason, Venue};

/// Talks to a per-venue gateway service over JSON/HTTP.
///
/// Every endpoint is a POST answering `{"success": bool, "error"?: string, ...}`.
#[derive(Debug, Clone)]
pub struct HttpVenueAdapter {
    http: Client,
    venue: Venue,
    base_url: String,
    auth: Option<GatewayAuth>,
    timeout: Duration,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AvailabilityResponse {
    #[serde(alias = "available")]
    is_available: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct BalanceResponse {
    #[serde(alias = "balance")]
    usdc_balance: Decimal,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubmitResponse {
    #[serde(alias = "orderId", alias = "txHash")]
    tx_ref: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatusResponse {
    status: String,
    entry_price: Option<Decimal>,
    qty: Option<Decimal>,
    position_ref: Option<String>,
    reason: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LookupResponse {
    #[serde(alias = "orderId", alias = "txHash")]
    tx_ref: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CloseResponse {
    exit_price: Decimal,
    qty: Decimal,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClosedPosition {
    position_ref: String,
    exit_price: Decimal,
    qty: Decimal,
    reason: Option<String>,
}

#[derive(Deserialize)]
struct ClosedPositionsResponse {
    #[serde(default)]
    positions: Vec<ClosedPosition>,
}

impl HttpVenueAdapter {
    pub fn new(
        http: Client,
        venue: Venue,
        base_url: impl Into<String>,
        auth: Option<GatewayAuth>,
        timeout: Duration,
    ) -> Self {
        Self {
            http,
            venue,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            auth,
            timeout,
        }
    }

    async fn post<B: Serialize + Sync, R: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<R, VenueError> {
        let payload = serde_json::to_string(body)
            .map_err(|e| VenueError::Rejected(format!("unserializable request: {e}")))?;

        let mut req = self
            .http
            .post(format!("{}{}", self.base_url, path))
            .timeout(self.timeout)
            .header(reqwest::header::CONTENT_TYPE, "application/json");

        if let Some(auth) = &self.auth {
            let timestamp = chrono::Utc::now().timestamp().to_string();
            let signature = auth
                .sign(&timestamp, "POST", path, &payload)
                .map_err(|e| VenueError::Rejected(e.to_string()))?;
            req = req
                .header(SIGNATURE_HEADER, signature)
                .header(TIMESTAMP_HEADER, timestamp);
        }

        let resp = req.body(payload).send().await.map_err(|e| {
            if e.is_timeout() {
                VenueError::Timeout(format!("{} {path}", self.venue))
            } else {
                VenueError::Transient(e.to_string())
            }
        })?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| VenueError::Transient(e.to_string()))?;
        let value: Value = serde_json::from_str(&text).unwrap_or(Value::Null);

        if let Some(err) = classify_status(status, &value, &text) {
            return Err(err);
        }

        if value.get("success").and_then(Value::as_bool) == Some(false) {
            return Err(VenueError::Rejected(error_message(&value, &text)));
        }

        serde_json::from_value(value)
            .map_err(|e| VenueError::Transient(format!("malformed {path} response: {e}")))
    }
}

fn error_message(value: &Value, raw: &str) -> String {
    value
        .get("error")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| raw.chars().take(200).collect())
}

fn classify_status(status: StatusCode, value: &Value, raw: &str) -> Option<VenueError> {
    if status.is_success() {
        return None;
    }
    let msg = format!("{status}: {}", error_message(value, raw));
    Some(match status {
        StatusCode::TOO_MANY_REQUESTS | StatusCode::REQUEST_TIMEOUT => VenueError::Transient(msg),
        StatusCode::NOT_FOUND => VenueError::NotFound(msg),
        s if s.is_server_error() => VenueError::Transient(msg),
        _ => VenueError::Rejected(msg),
    })
}

#[async_trait]
impl VenueAdapter for HttpVenueAdapter {
    fn venue(&self) -> Venue {
        self.venue
    }

    async fn is_available(&self, token_symbol: &str) -> Result<bool, VenueError> {
        let resp: AvailabilityResponse = self
            .post("/validate-market", &json!({ "market": token_symbol }))
            .await?;
        Ok(resp.is_available)
    }

    async fn available_balance(&self, wallet_address: &str) -> Result<Decimal, VenueError> {
        let resp: BalanceResponse = self
            .post("/balance", &json!({ "address": wallet_address }))
            .await?;
        Ok(resp.usdc_balance)
    }

    async fn submit_order(&self, params: &OrderParams) -> Result<String, VenueError> {
        let resp: SubmitResponse = self.post("/open-position", params).await?;
        Ok(resp.tx_ref)
    }

    async fn get_order_status(&self, tx_ref: &str) -> Result<OrderStatus, VenueError> {
        let resp: StatusResponse = self
            .post("/order-status", &json!({ "txRef": tx_ref }))
            .await?;
        parse_status(resp)
    }

    async fn find_order(&self, client_ref: &str) -> Result<Option<String>, VenueError> {
        match self
            .post::<_, LookupResponse>("/order-lookup", &json!({ "clientRef": client_ref }))
            .await
        {
            Ok(resp) => Ok(resp.tx_ref),
            Err(VenueError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn close_position(&self, position_ref: &str) -> Result<CloseFill, VenueError> {
        let resp: CloseResponse = self
            .post("/close-position", &json!({ "positionRef": position_ref }))
            .await?;
        Ok(CloseFill {
            exit_price: resp.exit_price,
            qty: resp.qty,
        })
    }

    async fn closed_positions(&self, wallet_address: &str) -> Result<Vec<VenueClose>, VenueError> {
        let resp: ClosedPositionsResponse = self
            .post("/closed-positions", &json!({ "address": wallet_address }))
            .await?;
        Ok(resp.positions.into_iter().map(venue_close).collect())
    }
}

/// Gateways report the trigger as free text; anything unrecognised is booked
/// as a reconciliation close.
fn venue_close(p: ClosedPosition) -> VenueClose {
    let trigger = p
        .reason
        .as_deref()
        .map(|r| r.trim().to_uppercase().replace(['-', ' '], "_"))
        .and_then(|r| match r.as_str() {
            "SL" | "STOP" => Some(CloseReason::StopLoss),
            "TP" | "TARGET" => Some(CloseReason::TakeProfit),
            other => CloseReason::from_str(other),
        })
        .unwrap_or(CloseReason::Reconciliation);
    VenueClose {
        position_ref: p.position_ref,
        fill: CloseFill {
            exit_price: p.exit_price,
            qty: p.qty,
        },
        trigger,
    }
}

fn parse_status(resp: StatusResponse) -> Result<OrderStatus, VenueError> {
    match resp.status.to_uppercase().as_str() {
        "OPEN" | "FILLED" => match (resp.entry_price, resp.qty, resp.position_ref) {
            (Some(entry_price), Some(qty), Some(position_ref)) => Ok(OrderStatus::Open {
                entry_price,
                qty,
                position_ref,
            }),
            _ => Err(VenueError::Transient(
                "open order status missing entryPrice/qty/positionRef".into(),
            )),
        },
        "FAILED" | "REJECTED" | "CANCELLED" => Ok(OrderStatus::Failed(
            resp.reason.unwrap_or_else(|| resp.status.clone()),
        )),
        "PENDING" | "SUBMITTED" => Ok(OrderStatus::Pending),
        other => Err(VenueError::Transient(format!("unknown order status '{other}'"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limits_and_5xx_are_transient() {
        let v = json!({"success": false, "error": "slow down"});
        let err = classify_status(StatusCode::TOO_MANY_REQUESTS, &v, "").unwrap();
        assert!(err.is_transient());
        let err = classify_status(StatusCode::BAD_GATEWAY, &Value::Null, "upstream").unwrap();
        assert!(err.is_transient());
    }

    #[test]
    fn client_errors_are_rejections() {
        let v = json!({"success": false, "error": "market closed"});
        let err = classify_status(StatusCode::BAD_REQUEST, &v, "").unwrap();
        assert_eq!(err, VenueError::Rejected("400 Bad Request: market closed".into()));
        assert!(classify_status(StatusCode::OK, &v, "").is_none());
    }

    #[test]
    fn open_status_needs_fill_details() {
        let resp = StatusResponse {
            status: "open".into(),
            entry_price: Some(Decimal::from(100)),
            qty: Some(Decimal::from(2)),
            position_ref: Some("pos-1".into()),
            reason: None,
        };
        assert_eq!(
            parse_status(resp).unwrap(),
            OrderStatus::Open {
                entry_price: Decimal::from(100),
                qty: Decimal::from(2),
                position_ref: "pos-1".into(),
            }
        );

        let partial = StatusResponse {
            status: "OPEN".into(),
            entry_price: None,
            qty: None,
            position_ref: None,
            reason: None,
        };
        assert!(parse_status(partial).unwrap_err().is_transient());
    }

    #[test]
    fn closed_position_triggers_are_normalised() {
        let resp: ClosedPositionsResponse = serde_json::from_value(json!({
            "success": true,
            "positions": [
                { "positionRef": "p-1", "exitPrice": "95", "qty": "2", "reason": "stop-loss" },
                { "positionRef": "p-2", "exitPrice": "120", "qty": "1", "reason": "TP" },
                { "positionRef": "p-3", "exitPrice": "101", "qty": "1" }
            ]
        }))
        .unwrap();
        let closes: Vec<VenueClose> = resp.positions.into_iter().map(venue_close).collect();
        assert_eq!(closes[0].trigger, CloseReason::StopLoss);
        assert_eq!(closes[0].fill.exit_price, Decimal::from(95));
        assert_eq!(closes[1].trigger, CloseReason::TakeProfit);
        assert_eq!(closes[2].trigger, CloseReason::Reconciliation);
    }
}
