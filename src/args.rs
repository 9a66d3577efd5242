//! Splitting of free-text argument strings.

/// Split `raw` into arguments.
///
/// Tokens are separated by whitespace. A token that starts with `"` and has a
/// matching closing `"` is taken verbatim up to that quote, with both quotes
/// stripped; the closing quote also ends the token. A `"` with no partner is an
/// ordinary character. There is no escape syntax for embedded quotes.
pub fn parse(raw: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut rest = raw.trim_start();

    while !rest.is_empty() {
        if let Some(quoted) = rest.strip_prefix('"') {
            if let Some(end) = quoted.find('"') {
                args.push(quoted[..end].to_string());
                rest = quoted[end + 1..].trim_start();
                continue;
            }
        }

        let end = rest.find(char::is_whitespace).unwrap_or(rest.len());
        args.push(rest[..end].to_string());
        rest = rest[end..].trim_start();
    }

    args
}
