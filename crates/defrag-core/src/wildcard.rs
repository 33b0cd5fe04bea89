/// Case-insensitive `?`/`*` glob matching, used for include/exclude paths
/// and space-hog patterns (§2, §4.1 "classification").
///
/// Grounded on `match_mask` (defrag_lib.cpp): recursive match with `*`
/// handled by trying every possible consumption length of the remaining
/// string, `?` matching exactly one character, everything else compared
/// case-insensitively.
pub fn match_mask(text: &str, mask: &str) -> bool {
    if mask == "*" {
        return true;
    }
    match_mask_chars(&to_lower_chars(text), &to_lower_chars(mask))
}

fn to_lower_chars(s: &str) -> Vec<char> {
    s.chars().flat_map(|c| c.to_lowercase()).collect()
}

fn match_mask_chars(s: &[char], m: &[char]) -> bool {
    let mut si = 0;
    let mut mi = 0;

    while mi < m.len() && si < s.len() {
        if m[mi] != '?' && m[mi] != s[si] {
            if m[mi] != '*' {
                return false;
            }
            mi += 1;
            if mi == m.len() {
                return true;
            }
            // Try every possible split point for the star, mirroring the
            // original's recursive "try matching from here, then advance
            // one character" loop.
            for start in si..s.len() {
                if match_mask_chars(&s[start..], &m[mi..]) {
                    return true;
                }
            }
            return false;
        }
        mi += 1;
        si += 1;
    }

    while mi < m.len() && m[mi] == '*' {
        mi += 1;
    }

    si == s.len() && mi == m.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lone_star_matches_everything() {
        assert!(match_mask("anything at all", "*"));
        assert!(match_mask("", "*"));
    }

    #[test]
    fn question_mark_matches_exactly_one_character() {
        assert!(match_mask("cat", "c?t"));
        assert!(!match_mask("ct", "c?t"));
        assert!(!match_mask("caat", "c?t"));
    }

    #[test]
    fn star_matches_zero_or_more_characters() {
        assert!(match_mask("c:\\windows\\system32\\foo.sys", "*\\foo.sys"));
        assert!(match_mask("c:\\foo.sys", "*\\foo.sys"));
        assert!(!match_mask("c:\\foo.sys.bak", "*\\foo.sys"));
    }

    #[test]
    fn matching_is_case_insensitive() {
        assert!(match_mask("C:\\BOOTWIZ\\config.bin", "*\\bootwiz\\*"));
        assert!(match_mask("c:\\bootwiz.sys", "?:\\BootWiz.sys"));
    }

    #[test]
    fn drive_letter_wildcard_matches_any_single_letter_prefix() {
        assert!(match_mask("c:\\$mft", "?:\\$MFT"));
        assert!(match_mask("d:\\$mft", "?:\\$MFT"));
        assert!(!match_mask("cd:\\$mft", "?:\\$MFT"));
    }

    #[test]
    fn non_matching_strings_are_rejected() {
        assert!(!match_mask("c:\\documents\\report.docx", "*.sys"));
    }

    #[test]
    fn multiple_stars_compose() {
        assert!(match_mask("c:\\a\\b\\c\\d.tmp", "*\\*\\d.tmp"));
    }
}
