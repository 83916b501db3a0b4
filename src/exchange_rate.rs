use rust_decimal::Decimal;

use crate::error::Error;

const EXCHANGE_RATE_API_URL: &str = "https://api.exchangerate-api.com/v4/latest/USD";

#[derive(Debug, serde::Deserialize)]
struct LatestRates {
    rates: std::collections::HashMap<String, f64>,
}

/// Yen per US dollar.
pub(crate) async fn get_usd_jpy_rate() -> Result<Decimal, Error> {
    let response = crate::CLIENT
        .get(EXCHANGE_RATE_API_URL)
        .send()
        .await
        .and_then(reqwest::Response::error_for_status)
        .map_err(|e| Error::Fetch(format!("exchange rate request failed: {e}")))?;

    let latest: LatestRates = response
        .json()
        .await
        .map_err(|e| Error::Fetch(format!("invalid exchange rate response: {e}")))?;

    rate_from(&latest, "JPY")
}

fn rate_from(latest: &LatestRates, currency: &str) -> Result<Decimal, Error> {
    let rate = latest
        .rates
        .get(currency)
        .ok_or_else(|| Error::Fetch(format!("{currency} rate is not found")))?;

    Decimal::try_from(*rate).map_err(|e| Error::Fetch(format!("invalid {currency} rate: {e}")))
}

/// Whole yen, truncated.
pub(crate) fn convert_usd_to_jpy(usd: Decimal, jpy_rate: Decimal) -> Decimal {
    (usd * jpy_rate).trunc()
}
