//! SQL identifier quoting and alias shortening.
//!
//! Quoting functions escape embedded quote characters by doubling them, so
//! any input string becomes a single identifier. Alias helpers build join
//! and column aliases and keep them under a driver's identifier length limit.

use sha1::{Digest, Sha1};

/// Quote a SQL identifier using ANSI double-quoting.
///
/// ```
/// use persisto_core::quote_ident;
///
/// assert_eq!(quote_ident("users"), "\"users\"");
/// assert_eq!(quote_ident("user\"name"), "\"user\"\"name\"");
/// ```
#[inline]
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quote a SQL identifier using MySQL backtick quoting.
///
/// ```
/// use persisto_core::quote_ident_mysql;
///
/// assert_eq!(quote_ident_mysql("user`name"), "`user``name`");
/// ```
#[inline]
pub fn quote_ident_mysql(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

/// Quote a SQL identifier using SQL Server bracket quoting.
#[inline]
pub fn quote_ident_mssql(name: &str) -> String {
    format!("[{}]", name.replace(']', "]]"))
}

const SEGMENT_SEPARATOR: &str = "__";
const SEGMENT_LENGTH: usize = 4;
const TERM_LENGTH: usize = 2;

/// Shorten an alias segment by segment.
///
/// Segments are separated by `__`. A camel-cased segment keeps the first two
/// characters of every term (`OrderItemList` becomes `OrItLi`); any other
/// segment keeps its first four characters (`company` becomes `comp`).
pub fn shorten(input: &str) -> String {
    input
        .split(SEGMENT_SEPARATOR)
        .map(|segment| {
            let terms = camel_terms(segment);
            let keep = if terms.len() > 1 {
                TERM_LENGTH
            } else {
                SEGMENT_LENGTH
            };
            terms
                .iter()
                .map(|term| term.chars().take(keep).collect::<String>())
                .collect::<String>()
        })
        .collect::<Vec<_>>()
        .join(SEGMENT_SEPARATOR)
}

fn camel_terms(segment: &str) -> Vec<String> {
    let mut terms = Vec::new();
    let mut current = String::new();
    let mut prev_lower = false;
    for ch in segment.chars() {
        if prev_lower && ch.is_uppercase() && !current.is_empty() {
            terms.push(std::mem::take(&mut current));
        }
        prev_lower = ch.is_lowercase();
        current.push(ch);
    }
    if !current.is_empty() || terms.is_empty() {
        terms.push(current);
    }
    terms
}

/// Hash an alias to a hex digest of at most `length` characters.
pub fn hash_alias(input: &str, length: usize) -> String {
    let mut hasher = Sha1::new();
    hasher.update(input.as_bytes());
    let digest = hex::encode(hasher.finalize());
    digest.chars().take(length).collect()
}

/// Options for [`build_alias`].
#[derive(Debug, Clone, Copy, Default)]
pub struct AliasOptions {
    /// Maximum identifier length accepted by the driver
    pub max_alias_length: Option<usize>,
    /// Try segment shortening before falling back to a hash
    pub shorten: bool,
}

/// Join alias parts with `_` and fit the result into the driver limit.
///
/// The result is deterministic for the same parts and options. When the
/// joined alias is too long it is shortened (if enabled) and, if that is
/// still too long, replaced by a truncated SHA-1 digest.
pub fn build_alias(options: AliasOptions, parts: &[&str]) -> String {
    fit_alias(options, parts.join("_"))
}

/// Alias of a relation path: segments joined with `__`.
///
/// Result columns are named `alias_column`, so a relation alias must not
/// be reachable by appending `_column` to its parent alias.
pub fn build_path_alias(options: AliasOptions, parts: &[&str]) -> String {
    fit_alias(options, parts.join("__"))
}

fn fit_alias(options: AliasOptions, alias: String) -> String {
    match options.max_alias_length {
        Some(max) if max > 0 && alias.chars().count() > max => {
            if options.shorten {
                let shortened = shorten(&alias);
                if shortened.chars().count() < max {
                    return shortened;
                }
            }
            hash_alias(&alias, max)
        }
        _ => alias,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_ident_embedded_double_quote() {
        assert_eq!(quote_ident("user\"name"), "\"user\"\"name\"");
    }

    #[test]
    fn test_quote_ident_sql_injection_attempt() {
        let malicious = "users\"; DROP TABLE secrets; --";
        assert_eq!(quote_ident(malicious), "\"users\"\"; DROP TABLE secrets; --\"");
    }

    #[test]
    fn test_quote_ident_mysql_multiple_backticks() {
        assert_eq!(quote_ident_mysql("a`b`c"), "`a``b``c`");
    }

    #[test]
    fn test_quote_ident_mssql_brackets() {
        assert_eq!(quote_ident_mssql("weird]name"), "[weird]]name]");
    }

    #[test]
    fn test_shorten_camel_and_plain_segments() {
        assert_eq!(shorten("OrderItemList"), "OrItLi");
        assert_eq!(shorten("company"), "comp");
        assert_eq!(shorten("company__OrderItemList"), "comp__OrItLi");
    }

    #[test]
    fn test_build_alias_within_limit_is_joined() {
        let opts = AliasOptions {
            max_alias_length: Some(63),
            shorten: true,
        };
        assert_eq!(build_alias(opts, &["user", "profile"]), "user_profile");
        assert_eq!(build_path_alias(opts, &["user", "profile"]), "user__profile");
    }

    #[test]
    fn test_build_alias_no_limit() {
        let long = "x".repeat(200);
        assert_eq!(build_alias(AliasOptions::default(), &[&long]), long);
    }

    #[test]
    fn test_build_alias_shortens_when_too_long() {
        let opts = AliasOptions {
            max_alias_length: Some(15),
            shorten: true,
        };
        assert_eq!(build_alias(opts, &["company__OrderItemList"]), "comp__OrItLi");
    }

    #[test]
    fn test_build_alias_falls_back_to_hash_when_shortening_overflows() {
        let opts = AliasOptions {
            max_alias_length: Some(10),
            shorten: true,
        };
        let alias = build_alias(opts, &["companyName__OrderItemList"]);
        assert_eq!(alias, hash_alias("companyName__OrderItemList", 10));
        assert_eq!(alias.len(), 10);
    }

    #[test]
    fn test_build_alias_hash_is_deterministic_and_bounded() {
        let opts = AliasOptions {
            max_alias_length: Some(30),
            shorten: false,
        };
        let parts = ["averyveryverylongparentalias", "anotherverylongrelationname"];
        let a = build_alias(opts, &parts);
        let b = build_alias(opts, &parts);
        assert_eq!(a, b);
        assert_eq!(a.len(), 30);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
