use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::HashMap;
use tokio::sync::Mutex;

use super::{CloseFill, OrderParams, OrderStatus, VenueAdapter, VenueClose, VenueError};
use crate::models::{CloseReason, Side, Venue};

/// Simulated venue for dry runs. Orders fill instantly at the configured mark
/// price, and stops and targets trigger when the mark crosses them.
pub struct PaperVenue {
    venue: Venue,
    balance: Decimal,
    inner: Mutex<PaperBook>,
}

#[derive(Debug, Clone)]
struct PaperOrder {
    token: String,
    side: Side,
    wallet: String,
    entry: Decimal,
    qty: Decimal,
    /// Price move against the position, in percent, that stops it out.
    stop_loss_pct: Decimal,
    take_profit_pct: Decimal,
}

#[derive(Default)]
struct PaperBook {
    prices: HashMap<String, Decimal>,
    /// Keyed by tx_ref.
    orders: HashMap<String, PaperOrder>,
    closed: HashMap<String, (CloseFill, CloseReason)>,
}

impl PaperBook {
    fn mark(&self, token: &str) -> Result<Decimal, VenueError> {
        self.prices
            .get(token)
            .copied()
            .ok_or_else(|| VenueError::Rejected(format!("{token} not listed")))
    }

    /// Close every open order whose stop or target the current mark has crossed.
    fn trigger_exits(&mut self) {
        let mut hits = Vec::new();
        for (tx_ref, order) in &self.orders {
            if self.closed.contains_key(tx_ref) || order.entry.is_zero() {
                continue;
            }
            let Some(mark) = self.prices.get(&order.token).copied() else {
                continue;
            };
            let moved = (mark - order.entry) / order.entry * Decimal::ONE_HUNDRED
                * order.side.direction_sign();
            let trigger = if moved <= -order.stop_loss_pct {
                CloseReason::StopLoss
            } else if moved >= order.take_profit_pct {
                CloseReason::TakeProfit
            } else {
                continue;
            };
            hits.push((tx_ref.clone(), CloseFill { exit_price: mark, qty: order.qty }, trigger));
        }
        for (tx_ref, fill, trigger) in hits {
            self.closed.insert(tx_ref, (fill, trigger));
        }
    }
}

impl PaperVenue {
    pub fn new(venue: Venue, balance: Decimal, prices: HashMap<String, Decimal>) -> Self {
        let prices = prices
            .into_iter()
            .map(|(k, v)| (k.to_uppercase(), v))
            .collect();
        Self {
            venue,
            balance,
            inner: Mutex::new(PaperBook {
                prices,
                ..Default::default()
            }),
        }
    }

    /// Move the mark price; subsequent closes fill at it.
    pub async fn set_price(&self, token_symbol: &str, price: Decimal) {
        let mut book = self.inner.lock().await;
        book.prices.insert(token_symbol.to_uppercase(), price);
    }

    fn tx_ref(client_ref: &str) -> String {
        format!("paper-{client_ref}")
    }
}

fn percent(name: &str, value: f64) -> Result<Decimal, VenueError> {
    Decimal::try_from(value).map_err(|e| VenueError::Rejected(format!("bad {name}: {e}")))
}

#[async_trait]
impl VenueAdapter for PaperVenue {
    fn venue(&self) -> Venue {
        self.venue
    }

    async fn is_available(&self, token_symbol: &str) -> Result<bool, VenueError> {
        let book = self.inner.lock().await;
        Ok(book.prices.contains_key(&token_symbol.to_uppercase()))
    }

    async fn available_balance(&self, _wallet_address: &str) -> Result<Decimal, VenueError> {
        Ok(self.balance)
    }

    async fn submit_order(&self, params: &OrderParams) -> Result<String, VenueError> {
        let mut book = self.inner.lock().await;
        let tx_ref = Self::tx_ref(&params.client_ref);
        if book.orders.contains_key(&tx_ref) {
            return Ok(tx_ref);
        }

        let token = params.token_symbol.to_uppercase();
        let price = book.mark(&token)?;
        if price <= Decimal::ZERO {
            return Err(VenueError::Rejected(format!("{token} has no mark price")));
        }

        let leverage = percent("leverage", params.leverage)?;
        let qty = (params.collateral_usd * leverage / price).round_dp(8);
        if qty.is_zero() {
            return Err(VenueError::Rejected("order rounds to zero size".into()));
        }

        book.orders.insert(
            tx_ref.clone(),
            PaperOrder {
                token,
                side: params.side,
                wallet: params.wallet_address.clone(),
                entry: price,
                qty,
                stop_loss_pct: percent("stop loss", params.stop_loss_percent)?,
                take_profit_pct: percent("take profit", params.take_profit_percent)?,
            },
        );
        Ok(tx_ref)
    }

    async fn get_order_status(&self, tx_ref: &str) -> Result<OrderStatus, VenueError> {
        let book = self.inner.lock().await;
        match book.orders.get(tx_ref) {
            Some(order) => Ok(OrderStatus::Open {
                entry_price: order.entry,
                qty: order.qty,
                position_ref: tx_ref.to_string(),
            }),
            None => Err(VenueError::NotFound(tx_ref.to_string())),
        }
    }

    async fn find_order(&self, client_ref: &str) -> Result<Option<String>, VenueError> {
        let book = self.inner.lock().await;
        let tx_ref = Self::tx_ref(client_ref);
        Ok(book.orders.contains_key(&tx_ref).then_some(tx_ref))
    }

    async fn close_position(&self, position_ref: &str) -> Result<CloseFill, VenueError> {
        let mut book = self.inner.lock().await;
        if let Some((fill, _)) = book.closed.get(position_ref) {
            return Ok(*fill);
        }
        let order = book
            .orders
            .get(position_ref)
            .cloned()
            .ok_or_else(|| VenueError::NotFound(position_ref.to_string()))?;
        let exit_price = book.mark(&order.token)?;

        let fill = CloseFill {
            exit_price,
            qty: order.qty,
        };
        book.closed
            .insert(position_ref.to_string(), (fill, CloseReason::Manual));
        Ok(fill)
    }

    async fn closed_positions(&self, wallet_address: &str) -> Result<Vec<VenueClose>, VenueError> {
        let mut book = self.inner.lock().await;
        book.trigger_exits();
        Ok(book
            .closed
            .iter()
            .filter(|(tx_ref, _)| {
                book.orders
                    .get(*tx_ref)
                    .is_some_and(|o| o.wallet.eq_ignore_ascii_case(wallet_address))
            })
            .map(|(tx_ref, (fill, trigger))| VenueClose {
                position_ref: tx_ref.clone(),
                fill: *fill,
                trigger: *trigger,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Side;

    fn params(client_ref: &str) -> OrderParams {
        OrderParams {
            client_ref: client_ref.into(),
            token_symbol: "eth".into(),
            side: Side::Long,
            collateral_usd: Decimal::from(200),
            leverage: 2.0,
            stop_loss_percent: 5.0,
            take_profit_percent: 10.0,
            wallet_address: "0xabc".into(),
        }
    }

    #[tokio::test]
    async fn resubmitting_same_client_ref_is_idempotent() {
        let venue = PaperVenue::new(
            Venue::Hyperliquid,
            Decimal::from(1_000),
            HashMap::from([("ETH".to_string(), Decimal::from(2_000))]),
        );
        let a = venue.submit_order(&params("intent-1")).await.unwrap();
        let b = venue.submit_order(&params("intent-1")).await.unwrap();
        assert_eq!(a, b);

        match venue.get_order_status(&a).await.unwrap() {
            OrderStatus::Open { qty, entry_price, .. } => {
                assert_eq!(entry_price, Decimal::from(2_000));
                // 200 × 2 / 2000
                assert_eq!(qty, Decimal::new(2, 1));
            }
            other => panic!("expected open, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn close_fills_at_current_mark() {
        let venue = PaperVenue::new(
            Venue::Gmx,
            Decimal::from(1_000),
            HashMap::from([("ETH".to_string(), Decimal::from(2_000))]),
        );
        let tx = venue.submit_order(&params("intent-2")).await.unwrap();
        venue.set_price("ETH", Decimal::from(2_100)).await;

        let fill = venue.close_position(&tx).await.unwrap();
        assert_eq!(fill.exit_price, Decimal::from(2_100));
        assert_eq!(venue.close_position(&tx).await.unwrap(), fill);
    }

    #[tokio::test]
    async fn stop_loss_triggers_when_mark_falls_through_it() {
        let venue = PaperVenue::new(
            Venue::Ostium,
            Decimal::from(1_000),
            HashMap::from([("ETH".to_string(), Decimal::from(2_000))]),
        );
        let tx = venue.submit_order(&params("intent-3")).await.unwrap();
        assert_eq!(venue.find_order("intent-3").await.unwrap(), Some(tx.clone()));
        assert_eq!(venue.find_order("intent-4").await.unwrap(), None);

        // 2% down is inside the 5% stop.
        venue.set_price("ETH", Decimal::from(1_960)).await;
        assert!(venue.closed_positions("0xabc").await.unwrap().is_empty());

        venue.set_price("ETH", Decimal::from(1_880)).await;
        let closed = venue.closed_positions("0xABC").await.unwrap();
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].position_ref, tx);
        assert_eq!(closed[0].trigger, CloseReason::StopLoss);
        assert_eq!(closed[0].fill.exit_price, Decimal::from(1_880));

        // Other wallets see nothing.
        assert!(venue.closed_positions("0xdef").await.unwrap().is_empty());
    }
}
