//! Account model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::str::FromStr;

/// Currencies an account may be opened in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Currency {
    Usd,
    Eur,
    Cad,
}

impl Currency {
    /// Get string representation for database.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Usd => "USD",
            Self::Eur => "EUR",
            Self::Cad => "CAD",
        }
    }

    /// Check whether a currency code is one the ledger accepts.
    pub fn is_supported(code: &str) -> bool {
        code.parse::<Self>().is_ok()
    }
}

impl FromStr for Currency {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "USD" => Ok(Self::Usd),
            "EUR" => Ok(Self::Eur),
            "CAD" => Ok(Self::Cad),
            other => Err(format!("unsupported currency '{}'", other)),
        }
    }
}

impl std::fmt::Display for Currency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Ledger account. `balance` is in the smallest currency unit.
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize, Deserialize)]
pub struct Account {
    pub id: i64,
    pub owner: String,
    pub balance: i64,
    pub currency: String,
    pub created_at: DateTime<Utc>,
}

impl Account {
    /// Get parsed currency.
    pub fn parsed_currency(&self) -> Option<Currency> {
        self.currency.parse().ok()
    }
}

/// Input for creating a new account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateAccount {
    pub owner: String,
    pub balance: i64,
    pub currency: Currency,
}

/// Offset pagination for list queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    pub limit: i64,
    pub offset: i64,
}

impl Pagination {
    pub const MAX_LIMIT: i64 = 100;

    pub fn new(limit: i64, offset: i64) -> Self {
        Self { limit, offset }
    }

    /// Limit clamped to `1..=MAX_LIMIT`.
    pub fn clamped_limit(&self) -> i64 {
        self.limit.clamp(1, Self::MAX_LIMIT)
    }

    /// Offset clamped to be non-negative.
    pub fn clamped_offset(&self) -> i64 {
        self.offset.max(0)
    }
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            limit: 10,
            offset: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn currency_round_trips_through_its_code() {
        for currency in [Currency::Usd, Currency::Eur, Currency::Cad] {
            assert_eq!(currency.as_str().parse::<Currency>(), Ok(currency));
        }
    }

    #[test]
    fn unsupported_currency_is_rejected() {
        assert!(!Currency::is_supported("JPY"));
        assert!(!Currency::is_supported("usd"));
        assert!(Currency::is_supported("CAD"));
    }

    #[test]
    fn pagination_is_clamped() {
        let page = Pagination::new(500, -3);
        assert_eq!(page.clamped_limit(), 100);
        assert_eq!(page.clamped_offset(), 0);

        let page = Pagination::new(0, 7);
        assert_eq!(page.clamped_limit(), 1);
        assert_eq!(page.clamped_offset(), 7);
    }
}
