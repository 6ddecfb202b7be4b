/// Unescape a TEXT value.
///
/// Unknown escape sequences (some exporters write `\:`) are kept as the
/// escaped character rather than rejected.
pub fn unescape(s: &str) -> String {
    let mut chars = s.chars();
    let mut out = String::with_capacity(s.len());

    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }

        match chars.next() {
            Some('n') | Some('N') => out.push('\n'),
            Some(c) => out.push(c),
            None => out.push('\\'),
        }
    }

    out
}
