//! Commission schedule and input validation helpers
//!
//! Address checks are prefix/length heuristics per currency, not full
//! checksum verification; the gateway rejects anything the chain refuses.

use rand::Rng;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use crate::error::EscrowError;
use crate::models::Currency;
use crate::EscrowResult;

/// Title length bounds for a trade
pub const TITLE_MIN: usize = 3;
pub const TITLE_MAX: usize = 200;

/// Description length bounds for a trade
pub const DESCRIPTION_MIN: usize = 10;
pub const DESCRIPTION_MAX: usize = 2000;

/// Network fee for moving funds out of escrow.
///
/// Fixed minimum per currency; ETH-class currencies use a
/// percentage-of-amount floor instead.
pub fn network_fee(currency: Currency, amount: Decimal) -> Decimal {
    match currency {
        Currency::Bitcoin => dec!(0.0001),
        Currency::Ethereum => dec!(0.002).max(amount * dec!(0.001)),
        Currency::Usdt => dec!(5.0),
    }
}

/// Validate a wallet address format for the given currency
pub fn validate_wallet_address(address: &str, currency: Currency) -> bool {
    match currency {
        Currency::Bitcoin => {
            let legacy = (address.starts_with('1') || address.starts_with('3'))
                && (26..=35).contains(&address.len());
            let bech32 = address.starts_with("bc1") && (42..=62).contains(&address.len());
            legacy || bech32
        }
        Currency::Ethereum | Currency::Usdt => {
            address.len() == 42
                && address.starts_with("0x")
                && address[2..].chars().all(|c| c.is_ascii_hexdigit())
        }
    }
}

/// Validate a trade amount against the configured bounds
pub fn validate_amount(amount: Decimal, min: Decimal, max: Decimal) -> EscrowResult<()> {
    if amount <= Decimal::ZERO {
        return Err(EscrowError::validation("Amount must be greater than zero"));
    }
    if amount < min {
        return Err(EscrowError::validation(format!("Minimum amount is {min}")));
    }
    if amount > max {
        return Err(EscrowError::validation(format!("Maximum amount is {max}")));
    }
    Ok(())
}

/// Validate free-text trade fields.
///
/// Bounds count characters, not bytes, so non-ASCII titles are not
/// penalized.
pub fn validate_trade_text(title: &str, description: Option<&str>) -> EscrowResult<()> {
    let title_chars = title.trim().chars().count();
    if title_chars < TITLE_MIN {
        return Err(EscrowError::validation(format!(
            "Title must be at least {TITLE_MIN} characters long"
        )));
    }
    if title_chars > TITLE_MAX {
        return Err(EscrowError::validation(format!(
            "Title cannot exceed {TITLE_MAX} characters"
        )));
    }
    if let Some(description) = description {
        let description_chars = description.trim().chars().count();
        if description_chars < DESCRIPTION_MIN {
            return Err(EscrowError::validation(format!(
                "Description must be at least {DESCRIPTION_MIN} characters long"
            )));
        }
        if description_chars > DESCRIPTION_MAX {
            return Err(EscrowError::validation(format!(
                "Description cannot exceed {DESCRIPTION_MAX} characters"
            )));
        }
    }
    Ok(())
}

/// Generate a unique short trade hash (16 uppercase hex chars)
pub fn generate_trade_hash() -> String {
    hex_token(8).to_uppercase()
}

/// Random lowercase hex string of `bytes * 2` characters
pub(crate) fn hex_token(bytes: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..bytes)
        .map(|_| format!("{:02x}", rng.gen::<u8>()))
        .collect()
}

/// Format an amount with the display precision and symbol of its currency
pub fn format_currency(amount: Decimal, currency: Currency) -> String {
    match currency {
        Currency::Bitcoin => format!("BTC {:.8}", amount),
        Currency::Ethereum => format!("ETH {:.6}", amount),
        Currency::Usdt => format!("USDT {:.2}", amount),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bitcoin_address_heuristics() {
        assert!(validate_wallet_address(
            "1A1zP1eP5QGefi2DMPTfTL5SLmv7DivfNa",
            Currency::Bitcoin
        ));
        assert!(validate_wallet_address(
            "bc1qar0srrr7xfkvy5l643lydnw9re59gtzzwf5mdq",
            Currency::Bitcoin
        ));
        assert!(!validate_wallet_address("bc1", Currency::Bitcoin));
        assert!(!validate_wallet_address(
            "0x52908400098527886E0F7030069857D2E4169EE7",
            Currency::Bitcoin
        ));
    }

    #[test]
    fn ethereum_address_heuristics() {
        assert!(validate_wallet_address(
            "0x52908400098527886E0F7030069857D2E4169EE7",
            Currency::Ethereum
        ));
        assert!(validate_wallet_address(
            "0x52908400098527886E0F7030069857D2E4169EE7",
            Currency::Usdt
        ));
        assert!(!validate_wallet_address(
            "0x52908400098527886E0F7030069857D2E4169EE",
            Currency::Ethereum
        ));
        assert!(!validate_wallet_address(
            "52908400098527886E0F7030069857D2E4169EE700",
            Currency::Ethereum
        ));
    }

    #[test]
    fn amount_bounds() {
        assert!(validate_amount(dec!(10), dec!(0.0001), dec!(1000000)).is_ok());
        assert!(validate_amount(dec!(0), dec!(0.0001), dec!(1000000)).is_err());
        assert!(validate_amount(dec!(-5), dec!(0.0001), dec!(1000000)).is_err());
        assert!(validate_amount(dec!(0.00001), dec!(0.0001), dec!(1000000)).is_err());
        assert!(validate_amount(dec!(2000000), dec!(0.0001), dec!(1000000)).is_err());
    }

    #[test]
    fn trade_text_bounds() {
        assert!(validate_trade_text("Gift card", Some("Brand new, unused code")).is_ok());
        assert!(validate_trade_text("ab", None).is_err());
        assert!(validate_trade_text("Valid title", Some("too short")).is_err());
        let long = "x".repeat(2001);
        assert!(validate_trade_text("Valid title", Some(&long)).is_err());
    }

    #[test]
    fn text_bounds_count_characters_not_bytes() {
        // 150 Cyrillic characters are 300 bytes but well within the limit
        let title = "д".repeat(150);
        assert!(validate_trade_text(&title, None).is_ok());

        let over = "д".repeat(201);
        assert!(validate_trade_text(&over, None).is_err());

        let description = "описание товара для сделки".to_string();
        assert!(validate_trade_text("Продажа ключа", Some(&description)).is_ok());
    }

    #[test]
    fn eth_fee_uses_percentage_floor() {
        assert_eq!(network_fee(Currency::Ethereum, dec!(1)), dec!(0.002));
        assert_eq!(network_fee(Currency::Ethereum, dec!(10)), dec!(0.01));
        assert_eq!(network_fee(Currency::Bitcoin, dec!(10)), dec!(0.0001));
        assert_eq!(network_fee(Currency::Usdt, dec!(10)), dec!(5.0));
    }

    #[test]
    fn trade_hash_shape() {
        let hash = generate_trade_hash();
        assert_eq!(hash.len(), 16);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(hash, hash.to_uppercase());
    }
}
