/// Output Comparator - text matching with capture-artifact tolerance
///
/// **Core Responsibility:**
/// Decide whether captured subject output matches the expected text.
///
/// **Critical Properties:**
/// - Knows nothing about sessions or processes
/// - Knows nothing about fixtures or scheduling
/// - Pure function: (expected text, actual text) → match/mismatch
///
/// **Widening Rules:**
/// Terminal capture renders tab characters as runs of spaces. To tolerate
/// that without masking real formatting bugs, only the *expected* side is
/// widened: the raw expected text is tried first, then each transform
/// candidate. The captured text is never rewritten.

/// Terminal tab stops are every 8 columns.
const TAB_STOP: usize = 8;

/// A transform producing an alternate acceptable rendering of the expected
/// text, or `None` when it does not apply.
type ExpectedTransform = fn(&str) -> Option<String>;

/// Named transform table; candidates are tried in order after the raw text.
const EXPECTED_TRANSFORMS: &[(&str, ExpectedTransform)] = &[("tab expansion", tab_expanded)];

fn tab_expanded(expected: &str) -> Option<String> {
    if expected.contains('\t') {
        Some(expand_tabs(expected, TAB_STOP))
    } else {
        None
    }
}

/// Expand tabs to spaces, advancing to the next multiple of `stop` the way a
/// terminal does, resetting the column at each line break.
fn expand_tabs(text: &str, stop: usize) -> String {
    let mut expanded = String::with_capacity(text.len());
    let mut column = 0usize;
    for c in text.chars() {
        match c {
            '\t' => {
                let pad = stop - (column % stop);
                expanded.extend(std::iter::repeat(' ').take(pad));
                column += pad;
            }
            '\n' => {
                expanded.push('\n');
                column = 0;
            }
            _ => {
                expanded.push(c);
                column += 1;
            }
        }
    }
    expanded
}

/// All acceptable renderings of the expected text, raw first.
pub fn expected_candidates(expected: &str) -> Vec<String> {
    let mut candidates = vec![expected.to_string()];
    for (name, transform) in EXPECTED_TRANSFORMS {
        if let Some(candidate) = transform(expected) {
            tracing::trace!(transform = name, "added expected-text candidate");
            candidates.push(candidate);
        }
    }
    candidates
}

/// Exact equality with any candidate counts as a match.
pub fn texts_match(expected: &str, actual: &str) -> bool {
    expected_candidates(expected)
        .iter()
        .any(|candidate| candidate == actual)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidates_raw_first_then_tab_expanded() {
        let candidates = expected_candidates("a\tb");
        assert_eq!(candidates, vec!["a\tb".to_string(), "a       b".to_string()]);
    }

    #[test]
    fn candidates_without_tabs_are_just_raw() {
        let candidates = expected_candidates("plain text\n");
        assert_eq!(candidates, vec!["plain text\n".to_string()]);
    }

    #[test]
    fn expand_tabs_advances_to_stops() {
        assert_eq!(expand_tabs("1\twords", TAB_STOP), "1       words");
        assert_eq!(expand_tabs("12345678\tx", TAB_STOP), "12345678        x");
        assert_eq!(expand_tabs("a\tb\tc", TAB_STOP), "a       b       c");
    }

    #[test]
    fn expand_tabs_resets_column_per_line() {
        assert_eq!(expand_tabs("1\tx\n1\ty", TAB_STOP), "1       x\n1       y");
    }

    #[test]
    fn tab_expanded_capture_matches() {
        let expected = "Please enter a line of text:\n  x  * \n1\twords\n1\tx\n";
        let actual = "Please enter a line of text:\n  x  * \n1       words\n1       x\n";
        assert!(texts_match(expected, actual));
    }

    #[test]
    fn literal_tabs_still_match_raw() {
        let text = "A\tB\tC\n";
        assert!(texts_match(text, text));
    }

    #[test]
    fn reordered_fields_do_not_match() {
        assert!(!texts_match("A\tB\tC\n", "A\tC\tB\n"));
    }

    #[test]
    fn actual_side_is_never_widened() {
        // a subject that prints a literal tab when spaces were expected must
        // not be forgiven by the tolerance running in reverse
        assert!(!texts_match("a       b", "a\tb"));
    }
}
