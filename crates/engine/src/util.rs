//! Argument parsing helpers shared by the command families.

use crate::error::{OpResult, OpStatus};
use bytes::Bytes;

/// Uppercase a token argument for keyword matching.
pub fn upper(arg: &[u8]) -> String {
    String::from_utf8_lossy(arg).to_uppercase()
}

pub fn parse_i64(arg: &[u8]) -> OpResult<i64> {
    std::str::from_utf8(arg)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or(OpStatus::InvalidInt)
}

/// Parse a score-style float; accepts inf/-inf/+inf, rejects NaN.
pub fn parse_f64(arg: &[u8]) -> OpResult<f64> {
    let s = std::str::from_utf8(arg).map_err(|_| {
        OpStatus::InvalidValue("value is not a valid float".into())
    })?;
    let v = match s.to_ascii_lowercase().as_str() {
        "inf" | "+inf" | "infinity" | "+infinity" => f64::INFINITY,
        "-inf" | "-infinity" => f64::NEG_INFINITY,
        _ => s
            .parse::<f64>()
            .map_err(|_| OpStatus::InvalidValue("value is not a valid float".into()))?,
    };
    if v.is_nan() {
        return Err(OpStatus::InvalidValue("value is not a valid float".into()));
    }
    Ok(v)
}

/// Glob matching for SCAN-style MATCH patterns: `*`, `?`, `[...]` and
/// backslash escapes.
pub fn glob_match(pattern: &[u8], text: &[u8]) -> bool {
    glob_inner(pattern, text)
}

fn glob_inner(p: &[u8], t: &[u8]) -> bool {
    let (mut pi, mut ti) = (0, 0);
    let mut star: Option<(usize, usize)> = None;
    while ti < t.len() {
        if pi < p.len() {
            match p[pi] {
                b'*' => {
                    star = Some((pi, ti));
                    pi += 1;
                    continue;
                }
                b'?' => {
                    pi += 1;
                    ti += 1;
                    continue;
                }
                b'[' => {
                    if let Some((matched, next)) = class_match(p, pi, t[ti]) {
                        if matched {
                            pi = next;
                            ti += 1;
                            continue;
                        }
                    }
                }
                b'\\' if pi + 1 < p.len() => {
                    if p[pi + 1] == t[ti] {
                        pi += 2;
                        ti += 1;
                        continue;
                    }
                }
                c if c == t[ti] => {
                    pi += 1;
                    ti += 1;
                    continue;
                }
                _ => {}
            }
        }
        match star {
            Some((sp, st)) => {
                pi = sp + 1;
                ti = st + 1;
                star = Some((sp, st + 1));
            }
            None => return false,
        }
    }
    while pi < p.len() && p[pi] == b'*' {
        pi += 1;
    }
    pi == p.len()
}

fn class_match(p: &[u8], open: usize, c: u8) -> Option<(bool, usize)> {
    let mut i = open + 1;
    let negate = p.get(i) == Some(&b'^');
    if negate {
        i += 1;
    }
    let mut matched = false;
    let mut first = true;
    while i < p.len() && (p[i] != b']' || first) {
        first = false;
        if i + 2 < p.len() && p[i + 1] == b'-' && p[i + 2] != b']' {
            if p[i] <= c && c <= p[i + 2] {
                matched = true;
            }
            i += 3;
        } else {
            if p[i] == c {
                matched = true;
            }
            i += 1;
        }
    }
    if i >= p.len() {
        return None; // unterminated class
    }
    Some((matched != negate, i + 1))
}

/// Consume keyword-value options of the SCAN family: returns
/// (match pattern, count).
pub fn parse_scan_opts(args: &[Bytes]) -> OpResult<(Option<Bytes>, usize)> {
    let mut pattern = None;
    let mut count = 10usize;
    let mut i = 0;
    while i < args.len() {
        match upper(&args[i]).as_str() {
            "MATCH" => {
                i += 1;
                pattern = Some(args.get(i).cloned().ok_or(OpStatus::SyntaxErr)?);
            }
            "COUNT" => {
                i += 1;
                let n = parse_i64(args.get(i).ok_or(OpStatus::SyntaxErr)?)?;
                if n < 1 {
                    return Err(OpStatus::SyntaxErr);
                }
                count = n as usize;
            }
            _ => return Err(OpStatus::SyntaxErr),
        }
        i += 1;
    }
    Ok((pattern, count))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_glob() {
        assert!(glob_match(b"*", b"anything"));
        assert!(glob_match(b"h?llo", b"hello"));
        assert!(glob_match(b"h[ae]llo", b"hallo"));
        assert!(!glob_match(b"h[^ae]llo", b"hello"));
        assert!(glob_match(b"h[a-c]llo", b"hbllo"));
        assert!(glob_match(b"user:*:name", b"user:42:name"));
        assert!(!glob_match(b"user:*:name", b"user:42:age"));
        assert!(glob_match(b"a\\*b", b"a*b"));
        assert!(!glob_match(b"a\\*b", b"axb"));
    }

    #[test]
    fn test_parse_f64() {
        assert_eq!(parse_f64(b"1.5").unwrap(), 1.5);
        assert_eq!(parse_f64(b"inf").unwrap(), f64::INFINITY);
        assert_eq!(parse_f64(b"-inf").unwrap(), f64::NEG_INFINITY);
        assert!(parse_f64(b"bogus").is_err());
    }

    #[test]
    fn test_parse_scan_opts() {
        let args = vec![Bytes::from("MATCH"), Bytes::from("x*"), Bytes::from("COUNT"), Bytes::from("50")];
        let (pat, count) = parse_scan_opts(&args).unwrap();
        assert_eq!(pat, Some(Bytes::from("x*")));
        assert_eq!(count, 50);
        assert!(parse_scan_opts(&[Bytes::from("BOGUS")]).is_err());
    }
}
