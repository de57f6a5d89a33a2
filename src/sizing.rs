//! Valuation and order sizing
//!
//! Quantities sent to the exchange are truncated, never rounded up, to
//! the precision the order book implies: the written exponent of a
//! level's quantity string is the market's required step. A truncation
//! that hits zero is bumped to exactly one step so an intended trade is
//! never submitted as zero.

use std::collections::HashMap;

use rust_decimal::{Decimal, RoundingStrategy};
use tracing::debug;
use uuid::Uuid;

use crate::db::Chain;
use crate::exchange::{BackpackClient, ExchangeError};
use crate::types::{
    Balances, BorrowLendPosition, OrderBookDepth, Side, WithdrawalRequest, WithdrawalResponse,
};

/// Funding pair and asset used for sub-account top-ups.
pub const TOP_UP_SYMBOL: &str = "SOL_USDC";
pub const TOP_UP_ASSET: &str = "SOL";

/// Static precision fallback for flows with no book at hand (the
/// convert-to-USDC sweep). The order book stays the source of truth
/// everywhere else.
pub fn fallback_precision(symbol: &str) -> u32 {
    match symbol {
        "SOL" => 2,
        "ETH" => 4,
        "BTC" => 5,
        _ => 1,
    }
}

/// USD-equivalent of an account's holdings: per token, available spot
/// plus net lending exposure, priced via `{token}_USDC` with a
/// `{token}_USDC_PERP` fallback. Tokens with no discoverable price are
/// skipped, not an error.
pub fn total_usd_balance(
    balances: &Balances,
    positions: &[BorrowLendPosition],
    tickers: &HashMap<String, Decimal>,
) -> Decimal {
    let mut net_exposure: HashMap<String, Decimal> = HashMap::new();
    for position in positions {
        let token = position.symbol.trim_end_matches("_USDC").to_string();
        *net_exposure.entry(token).or_default() += position.net_exposure_quantity;
    }

    let mut total = Decimal::ZERO;
    for (token, balance) in balances {
        let quantity = balance.available
            + net_exposure.get(token.as_str()).copied().unwrap_or_default();
        if quantity <= Decimal::ZERO {
            continue;
        }
        if token == "USDC" {
            total += quantity;
            continue;
        }
        let pair = format!("{token}_USDC");
        let price = tickers
            .get(&pair)
            .or_else(|| tickers.get(&format!("{pair}_PERP")));
        if let Some(price) = price {
            total += quantity * price;
        }
    }

    debug!("Computed total USD balance = {total}");
    total
}

/// Decimal places of a quantity string as written: `"0.01"` → 2,
/// `"5"` → 0. Trailing zeros count; the exchange's rendering is the
/// contract.
pub fn quantity_decimal_places(quantity: &str) -> u32 {
    quantity
        .split_once('.')
        .map(|(_, frac)| frac.len() as u32)
        .unwrap_or(0)
}

/// A quantity derived from the book, with its provenance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SizedOrder {
    pub quantity: Decimal,
    pub reference_price: Decimal,
    pub step: Decimal,
}

/// Size a quote-denominated amount against the best level of the given
/// side. Returns `None` when the side is empty, unpriced, or the amount
/// is non-positive.
pub fn size_order(book: &OrderBookDepth, side: Side, amount_quote: Decimal) -> Option<SizedOrder> {
    if amount_quote <= Decimal::ZERO {
        return None;
    }
    let level = book.best_level(side)?;
    let price = level.price().filter(|p| *p > Decimal::ZERO)?;

    let places = quantity_decimal_places(level.quantity_str());
    let step = Decimal::new(1, places);
    let mut quantity =
        (amount_quote / price).round_dp_with_strategy(places, RoundingStrategy::ToZero);
    if quantity.is_zero() {
        quantity = step;
    }

    Some(SizedOrder {
        quantity,
        reference_price: price,
        step,
    })
}

/// Fund a sub-account from the main account: convert the threshold USD
/// into SOL at the best ask and withdraw it to the sub-account's
/// Solana deposit address.
pub async fn top_up(
    main: &BackpackClient,
    deposit_address: &str,
    threshold_usd: Decimal,
) -> Result<WithdrawalResponse, ExchangeError> {
    let book = main.get_order_book_depth(TOP_UP_SYMBOL).await?;
    let sized = size_order(&book, Side::Ask, threshold_usd).ok_or_else(|| {
        ExchangeError::Unexpected(format!("cannot size top-up: no usable {TOP_UP_SYMBOL} asks"))
    })?;

    debug!(
        "Top-up: {} {} (~${threshold_usd}) to {deposit_address}",
        sized.quantity, TOP_UP_ASSET
    );
    let request = WithdrawalRequest::new(
        deposit_address,
        Chain::Solana.as_str(),
        TOP_UP_ASSET,
        sized.quantity,
    )
    .with_client_id(Uuid::new_v4().to_string());

    main.request_withdrawal(&request).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::from_str;

    fn balances(entries: &[(&str, &str)]) -> Balances {
        entries
            .iter()
            .map(|(token, available)| {
                (
                    token.to_string(),
                    from_str(&format!(
                        r#"{{"available": "{available}", "locked": "0", "staked": "0"}}"#
                    ))
                    .unwrap(),
                )
            })
            .collect()
    }

    fn tickers(entries: &[(&str, &str)]) -> HashMap<String, Decimal> {
        entries
            .iter()
            .map(|(symbol, price)| (symbol.to_string(), price.parse().unwrap()))
            .collect()
    }

    fn book(bids: &[(&str, &str)], asks: &[(&str, &str)]) -> OrderBookDepth {
        let render = |levels: &[(&str, &str)]| {
            levels
                .iter()
                .map(|(p, q)| format!(r#"["{p}", "{q}"]"#))
                .collect::<Vec<_>>()
                .join(", ")
        };
        from_str(&format!(
            r#"{{"bids": [{}], "asks": [{}]}}"#,
            render(bids),
            render(asks)
        ))
        .unwrap()
    }

    #[test]
    fn aggregates_usdc_plus_priced_tokens() {
        let total = total_usd_balance(
            &balances(&[("USDC", "10"), ("SOL", "2")]),
            &[],
            &tickers(&[("SOL_USDC", "20")]),
        );
        assert_eq!(total, dec!(50));
    }

    #[test]
    fn falls_back_to_perp_ticker() {
        let total = total_usd_balance(
            &balances(&[("ETH", "1")]),
            &[],
            &tickers(&[("ETH_USDC_PERP", "3000")]),
        );
        assert_eq!(total, dec!(3000));
    }

    #[test]
    fn unpriceable_tokens_are_skipped() {
        let total = total_usd_balance(
            &balances(&[("USDC", "7"), ("WEN", "100000")]),
            &[],
            &tickers(&[("SOL_USDC", "20")]),
        );
        assert_eq!(total, dec!(7));
    }

    #[test]
    fn lending_exposure_adjusts_quantity() {
        let positions: Vec<BorrowLendPosition> = from_str(
            r#"[{"symbol": "SOL", "netExposureQuantity": "-3", "netExposureNotional": "-60"}]"#,
        )
        .unwrap();
        // 2 available - 3 borrowed = net -1, skipped entirely.
        let total = total_usd_balance(
            &balances(&[("SOL", "2")]),
            &positions,
            &tickers(&[("SOL_USDC", "20")]),
        );
        assert_eq!(total, Decimal::ZERO);
    }

    #[test]
    fn decimal_places_follow_the_written_exponent() {
        assert_eq!(quantity_decimal_places("0.01"), 2);
        assert_eq!(quantity_decimal_places("5"), 0);
        assert_eq!(quantity_decimal_places("1.20"), 2);
        assert_eq!(quantity_decimal_places("0.000001"), 6);
    }

    #[test]
    fn sizing_truncates_to_book_step() {
        let book = book(&[], &[("20", "0.01")]);
        let sized = size_order(&book, Side::Ask, dec!(1.05)).unwrap();
        // 1.05 / 20 = 0.0525, truncated down to the 0.01 step.
        assert_eq!(sized.quantity, dec!(0.05));
        assert_eq!(sized.step, dec!(0.01));
        assert_eq!(sized.reference_price, dec!(20));
    }

    #[test]
    fn sizing_never_returns_zero_for_positive_amounts() {
        let book = book(&[], &[("20", "0.01")]);
        let sized = size_order(&book, Side::Ask, dec!(0.1)).unwrap();
        // 0.1 / 20 = 0.005 truncates to zero; one step is substituted.
        assert_eq!(sized.quantity, dec!(0.01));
    }

    #[test]
    fn sizing_never_rounds_up() {
        let book = book(&[], &[("3", "0.001")]);
        for amount in ["0.01", "0.5", "1", "7.77", "123.456"] {
            let amount: Decimal = amount.parse().unwrap();
            let sized = size_order(&book, Side::Ask, amount).unwrap();
            // Except for the one-step floor, quantity * price stays
            // within the requested amount.
            if sized.quantity > sized.step {
                assert!(
                    sized.quantity * sized.reference_price <= amount,
                    "amount {amount} sized to {}",
                    sized.quantity
                );
            }
            assert!(sized.quantity.scale() <= 3);
        }
    }

    #[test]
    fn bid_sizing_reads_the_top_of_the_bid_stack() {
        // Bids sort ascending; the best bid is the last entry.
        let book = book(&[("99.0", "0.5"), ("99.8", "0.1")], &[("100.2", "0.3")]);
        let sized = size_order(&book, Side::Bid, dec!(199.6)).unwrap();
        assert_eq!(sized.reference_price, dec!(99.8));
        assert_eq!(sized.quantity, dec!(2.0));
    }

    #[test]
    fn empty_side_yields_none() {
        let book = book(&[], &[]);
        assert!(size_order(&book, Side::Ask, dec!(10)).is_none());
        assert!(size_order(&book, Side::Bid, dec!(10)).is_none());
    }

    #[test]
    fn non_positive_amounts_yield_none() {
        let book = book(&[], &[("20", "0.01")]);
        assert!(size_order(&book, Side::Ask, Decimal::ZERO).is_none());
        assert!(size_order(&book, Side::Ask, dec!(-5)).is_none());
    }
}
