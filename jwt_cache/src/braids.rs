use aliri_braid::braid;
use std::fmt;

fn limited_reveal(unprotected: &str, f: &mut fmt::Formatter, default_len: usize) -> fmt::Result {
    let max_len = f.width().unwrap_or(default_len);
    if max_len <= 1 {
        f.write_str("…")
    } else if max_len > unprotected.len() {
        f.write_str(unprotected)
    } else {
        match unprotected.char_indices().nth(max_len - 2) {
            Some((idx, c)) if idx + c.len_utf8() < unprotected.len() => {
                f.write_str(&unprotected[0..idx + c.len_utf8()])?;
                f.write_str("…")
            }
            _ => f.write_str(unprotected),
        }
    }
}

/// A bearer credential exactly as handed out by the token source
///
/// Formatting hides the credential. The alternate flag reveals a prefix
/// when debugging (`{:#?}`, width-limited with `{:#20?}`) or the whole
/// value when displaying (`{:#}`).
#[braid(serde, debug = "owned", display = "owned")]
pub struct AccessToken;

impl fmt::Debug for AccessTokenRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if f.alternate() {
            f.write_str("\"")?;
            limited_reveal(self.as_str(), &mut *f, 15)?;
            f.write_str("\"")
        } else {
            f.write_str("***ACCESS TOKEN***")
        }
    }
}

impl fmt::Display for AccessTokenRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if f.alternate() {
            limited_reveal(self.as_str(), &mut *f, usize::MAX)
        } else {
            f.write_str("***ACCESS TOKEN***")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formatting_redacts_by_default() {
        let token = AccessToken::from("eyJhbGciOiJub25lIn0.e30.");
        assert_eq!(format!("{:?}", token), "***ACCESS TOKEN***");
        assert_eq!(format!("{}", token), "***ACCESS TOKEN***");
    }

    #[test]
    fn alternate_formatting_reveals_a_prefix() {
        let token = AccessToken::from("abcdefghijklmnopqrstuvwxyz");
        assert_eq!(format!("{:#?}", token), "\"abcdefghijklmn…\"");
        assert_eq!(format!("{:#5?}", token), "\"abcd…\"");
        assert_eq!(format!("{:#}", token), "abcdefghijklmnopqrstuvwxyz");
    }
}
