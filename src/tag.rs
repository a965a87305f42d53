/// The default tag scheme used when a tag expression doesn't specify one.
pub const DEFAULT_SCHEME: &str = "forsta";

#[cfg(test)]
#[path = "tag_test.rs"]
mod tests;

/// Parse a single tag token into `(tag, scheme)`.
///
/// A leading `@` is stripped. Exactly one `:` splits tag from scheme; `"foo:bar"` is
/// `("foo", "bar")`. Without a `:`, the scheme defaults to [`DEFAULT_SCHEME`].
///
/// Full tag *expressions* (`@a + @b - @c`) are set algebra resolved by Atlas; this
/// parses one token of such an expression, not the expression itself.
pub fn parse_tag(token: &str) -> (String, String) {
    let token = token.strip_prefix('@').unwrap_or(token);
    match token.split_once(':') {
        Some((tag, scheme)) => (tag.to_string(), scheme.to_string()),
        None => (token.to_string(), DEFAULT_SCHEME.to_string()),
    }
}
