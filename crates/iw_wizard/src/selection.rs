//! `multi_select_indexed` selection-expression grammar (§4.H, §8 property
//! 10):
//!
//! ```text
//! expression := "all" | token ("," token)*
//! token      := integer | integer "-" integer
//! ```
//!
//! Ranges are inclusive and 1-based; `0` and reversed ranges are rejected.
//! An empty expression yields an empty selection.

use iw_canon::error::CoreError;
use std::collections::BTreeSet;

/// Parse `expr` against a universe of `max` 1-based indices, returning the
/// sorted set of selected indices.
pub fn parse_selection_expr(expr: &str, max: usize) -> Result<BTreeSet<usize>, CoreError> {
    let trimmed = expr.trim();
    if trimmed.is_empty() {
        return Ok(BTreeSet::new());
    }
    if trimmed.eq_ignore_ascii_case("all") {
        return Ok((1..=max).collect());
    }

    let mut out = BTreeSet::new();
    for token in trimmed.split(',') {
        let token = token.trim();
        if token.is_empty() {
            continue;
        }
        if let Some((lo, hi)) = token.split_once('-') {
            let lo: usize = lo
                .trim()
                .parse()
                .map_err(|_| invalid_token(token))?;
            let hi: usize = hi
                .trim()
                .parse()
                .map_err(|_| invalid_token(token))?;
            if lo == 0 || hi == 0 {
                return Err(invalid_token(token));
            }
            if lo > hi {
                return Err(CoreError::validation(
                    "$.selection_expr",
                    "reversed_range",
                    format!("reversed range: {}", token),
                ));
            }
            if hi > max {
                return Err(out_of_range(token, max));
            }
            for i in lo..=hi {
                out.insert(i);
            }
        } else {
            let i: usize = token.parse().map_err(|_| invalid_token(token))?;
            if i == 0 {
                return Err(invalid_token(token));
            }
            if i > max {
                return Err(out_of_range(token, max));
            }
            out.insert(i);
        }
    }
    Ok(out)
}

fn invalid_token(token: &str) -> CoreError {
    CoreError::validation(
        "$.selection_expr",
        "invalid_token",
        format!("invalid selection token: {}", token),
    )
}

fn out_of_range(token: &str, max: usize) -> CoreError {
    CoreError::validation(
        "$.selection_expr",
        "out_of_range",
        format!("selection out of range: {} (max {})", token, max),
    )
}

/// Select items from `items` (by 1-based position, preserving the
/// discovery order `items` is already in) using an explicit id list.
/// Unknown ids fail with `unknown_id`.
pub fn select_by_ids<'a, T>(items: &'a [T], ids: &[String], id_of: impl Fn(&T) -> &str) -> Result<Vec<&'a T>, CoreError> {
    let known: BTreeSet<&str> = items.iter().map(|i| id_of(i)).collect();
    for id in ids {
        if !known.contains(id.as_str()) {
            return Err(CoreError::validation(
                "$.selection_ids",
                "unknown_id",
                format!("unknown selection id: {}", id),
            ));
        }
    }
    let wanted: BTreeSet<&str> = ids.iter().map(|s| s.as_str()).collect();
    Ok(items.iter().filter(|i| wanted.contains(id_of(i))).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_all() {
        let set = parse_selection_expr("all", 5).unwrap();
        assert_eq!(set, (1..=5).collect());
    }

    #[test]
    fn parses_mixed_list_and_ranges() {
        let set = parse_selection_expr("1,3,5-8", 8).unwrap();
        assert_eq!(set, [1, 3, 5, 6, 7, 8].into_iter().collect());
    }

    #[test]
    fn rejects_reversed_range() {
        assert!(parse_selection_expr("2-1", 8).is_err());
    }

    #[test]
    fn rejects_zero() {
        assert!(parse_selection_expr("0", 8).is_err());
        assert!(parse_selection_expr("0-3", 8).is_err());
    }

    #[test]
    fn empty_expression_is_allowed() {
        assert!(parse_selection_expr("", 8).unwrap().is_empty());
    }

    #[test]
    fn rejects_index_beyond_max() {
        let err = parse_selection_expr("7", 5).unwrap_err();
        assert_eq!(err.details()[0].reason, "out_of_range");
    }

    #[test]
    fn rejects_range_extending_beyond_max() {
        let err = parse_selection_expr("5-8", 6).unwrap_err();
        assert_eq!(err.details()[0].reason, "out_of_range");
    }
}
