//! Shell-style patterns used by configuration entries to select channels
//! and hosts.
//!
//! Supported: `*`, `?`, `[abc]`, `[^abc]`, `\x`, and `{a,b,c}` alternation
//! as the last element of a pattern. Matching is byte-wise and case
//! sensitive; callers lower-case names before matching.

const SPECIALS: &[u8] = b"*[{\\?";

/// Check whether `name` is matched by `pattern`
pub fn matches(pattern: &str, name: &str) -> bool {
    match_bytes(pattern.as_bytes(), name.as_bytes())
}

fn match_bytes(mut pattern: &[u8], mut name: &[u8]) -> bool {
    loop {
        let Some((&c, rest)) = pattern.split_first() else {
            return name.is_empty();
        };

        match c {
            b'{' => return alternation(rest, name),
            b'*' => {
                if rest.is_empty() {
                    return true;
                }

                if !rest.iter().any(|b| SPECIALS.contains(b)) {
                    return name.ends_with(rest);
                }

                return (0..=name.len()).any(|skip| match_bytes(rest, &name[skip..]));
            }
            b'?' => {
                let Some((_, tail)) = name.split_first() else {
                    return false;
                };
                pattern = rest;
                name = tail;
            }
            b'[' => {
                let Some((&n, tail)) = name.split_first() else {
                    return false;
                };
                let Some(after) = class(rest, n) else {
                    return false;
                };
                pattern = after;
                name = tail;
            }
            b'\\' => {
                let (Some((&literal, after)), Some((&n, tail))) =
                    (rest.split_first(), name.split_first())
                else {
                    return false;
                };
                if literal != n {
                    return false;
                }
                pattern = after;
                name = tail;
            }
            _ => {
                let Some((&n, tail)) = name.split_first() else {
                    return false;
                };
                if c != n {
                    return false;
                }
                pattern = rest;
                name = tail;
            }
        }
    }
}

/// Match one byte against a class body (everything after the `[`).
///
/// Returns the pattern remaining after the closing `]` when the byte is
/// accepted; an unterminated class never matches.
fn class(body: &[u8], n: u8) -> Option<&[u8]> {
    let (negated, body) = match body.split_first() {
        Some((b'^', rest)) => (true, rest),
        _ => (false, body),
    };

    let close = body.iter().position(|&b| b == b']')?;
    let members = &body[..close];

    (members.contains(&n) != negated).then_some(&body[close + 1..])
}

/// `{a,b,c}`: the whole remaining name must equal one of the alternatives.
/// Anything after the closing brace is ignored.
fn alternation(body: &[u8], name: &[u8]) -> bool {
    let end = body.iter().position(|&b| b == b'}').unwrap_or(body.len());

    body[..end].split(|&b| b == b',').any(|alt| alt == name)
}
