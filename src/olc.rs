//! Validation of full Open Location Codes.
//!
//! The indexer decodes viewpoint recipients as structured keys whose leading
//! token may be a plus code (e.g. `6FG22222+222`). Only validation of full
//! codes is needed here; nothing decodes to coordinates.

/// The base-20 digit set used by plus codes.
const DIGITS: &str = "23456789CFGHJMPQRVWX";

/// The separator between the area and local portions of a code.
const SEPARATOR: char = '+';

/// Position of the separator in a full code.
const SEPARATOR_POSITION: usize = 8;

/// The character used to pad short area codes.
const PADDING: char = '0';

/// Returns true if the string is a valid full Open Location Code.
pub fn is_full(code: &str) -> bool {
    if !is_valid(code) {
        return false;
    }

    // a full code has the separator in its fixed position
    let sep = match code.find(SEPARATOR) {
        Some(i) => i,
        None => return false,
    };
    if sep != SEPARATOR_POSITION {
        return false;
    }

    let bytes = code.as_bytes();
    // the first latitude digit must stay below 90 degrees and the first
    // longitude digit below 180
    let lat = match digit_value(bytes[0] as char) {
        Some(v) => v,
        None => return false,
    };
    if lat >= 9 {
        return false;
    }
    let lng = match digit_value(bytes[1] as char) {
        Some(v) => v,
        None => return false,
    };
    if lng >= 18 {
        return false;
    }

    true
}

/// Structural validity shared by full and short codes.
fn is_valid(code: &str) -> bool {
    if code.len() < 2 {
        return false;
    }

    // exactly one separator, at an even position no later than its fixed slot
    let sep = match code.find(SEPARATOR) {
        Some(i) => i,
        None => return false,
    };
    if code.rfind(SEPARATOR) != Some(sep) || sep > SEPARATOR_POSITION || sep % 2 == 1 {
        return false;
    }

    // padding only appears before the separator, in one contiguous
    // even-length run ending at it, and nothing may follow the separator
    if let Some(pad) = code.find(PADDING) {
        if pad == 0 || pad > sep {
            return false;
        }
        let padded = &code[pad..sep];
        if padded.chars().any(|c| c != PADDING) || padded.len() % 2 == 1 {
            return false;
        }
        if sep != code.len() - 1 {
            return false;
        }
    }

    // a single trailing character after the separator is invalid
    if code.len() - sep - 1 == 1 {
        return false;
    }

    code.chars().enumerate().all(|(i, c)| {
        c == SEPARATOR && i == sep || c == PADDING || digit_value(c).is_some()
    })
}

fn digit_value(c: char) -> Option<usize> {
    DIGITS.find(c.to_ascii_uppercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_full_codes() {
        assert!(is_full("6FG22222+222"));
        assert!(is_full("8FVC9G8F+6X"));
        assert!(is_full("8FVC9G8F+"));
        assert!(is_full("8FVC0000+"));
        assert!(is_full("6fg22222+222")); // case-insensitive digits
    }

    #[test]
    fn rejects_malformed_codes() {
        assert!(!is_full(""));
        assert!(!is_full("6FG22222")); // no separator
        assert!(!is_full("6FG2+22")); // separator too early: short code
        assert!(!is_full("6FG22222+2")); // single trailing character
        assert!(!is_full("6FG22222+222+")); // two separators
        assert!(!is_full("6FG2222L+22")); // invalid digit
        assert!(!is_full("6FG00200+")); // non-contiguous padding
        assert!(!is_full("6FG22000+22")); // trailing chars after padding
    }

    #[test]
    fn rejects_out_of_range_first_digits() {
        // first latitude digit limited to values below 9 ('C')
        assert!(!is_full("F2G22222+22"));
        // first longitude digit limited to values below 18 ('X' is 19)
        assert!(!is_full("2X222222+22"));
        assert!(is_full("2V222222+22"));
    }
}
