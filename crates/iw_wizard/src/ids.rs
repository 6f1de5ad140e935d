//! Author/book selectable-item id derivation (§3).

/// `"author:" || first 16 hex of SHA-256("a|" + author_key)`.
pub fn author_item_id(author_key: &str) -> String {
    let full = iw_canon::fingerprint_str(&format!("a|{}", author_key));
    format!("author:{}", &full[..16])
}

/// `"book:" || first 16 hex of SHA-256("b|" + author_key + "|" + book_key)`.
pub fn book_item_id(author_key: &str, book_key: &str) -> String {
    let full = iw_canon::fingerprint_str(&format!("b|{}|{}", author_key, book_key));
    format!("book:{}", &full[..16])
}

/// ASCII-coerced label (§3: "Labels are ASCII-coerced (non-ASCII -> '?')").
pub fn label(s: &str) -> String {
    iw_canon::ascii_coerce(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_stable_and_prefixed() {
        let a = author_item_id("Author");
        assert!(a.starts_with("author:"));
        assert_eq!(a.len(), "author:".len() + 16);
        let b = book_item_id("Author", "Book");
        assert!(b.starts_with("book:"));
        assert_eq!(author_item_id("Author"), a);
    }
}
