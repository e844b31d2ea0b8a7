//! Names of the collections the order book occupies in the ordered store.
//!
//! Every key is derived from the trading pair so several engines can share one
//! store without colliding.

use crate::domain::models::types::Side;

/// Separator used to build namespaced key names.
pub const KEY_SEP: &str = "_";

/// Sorted collection holding one side of the book, e.g. `book_BTCUSD_bid`.
pub fn book_key(pair: &str, side: Side) -> String {
    format!("book{KEY_SEP}{pair}{KEY_SEP}{side}")
}

/// Sorted collection receiving entries of `side` that failed to decode.
pub fn quarantine_key(pair: &str, side: Side) -> String {
    format!("{}{KEY_SEP}malformed", book_key(pair, side))
}

/// Sorted collection of every order id ever admitted to the pair, scored by order time.
pub fn admitted_key(pair: &str) -> String {
    format!("book{KEY_SEP}{pair}{KEY_SEP}admitted")
}

/// String slot holding the last published ticker snapshot.
pub fn ticker_key(pair: &str) -> String {
    format!("ticker{KEY_SEP}{pair}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_names() {
        assert_eq!(book_key("BTCUSD", Side::Bid), "book_BTCUSD_bid");
        assert_eq!(book_key("BTCUSD", Side::Ask), "book_BTCUSD_ask");
        assert_eq!(quarantine_key("BTCUSD", Side::Ask), "book_BTCUSD_ask_malformed");
        assert_eq!(admitted_key("BTCUSD"), "book_BTCUSD_admitted");
        assert_eq!(ticker_key("ETHUSD"), "ticker_ETHUSD");
    }
}
