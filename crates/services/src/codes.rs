use rand::Rng;

/// Room codes: three lowercase 4-letter segments, `abcd-efgh-ijkl`.
/// Lookup always goes through [`normalize`] first.

pub fn generate() -> String {
    let mut rng = rand::rng();
    let mut segment = || -> String {
        (0..4).map(|_| rng.random_range('a'..='z')).collect()
    };
    format!("{}-{}-{}", segment(), segment(), segment())
}

pub fn normalize(code: &str) -> String {
    code.trim().to_lowercase()
}

pub fn is_valid(code: &str) -> bool {
    let segments: Vec<&str> = code.split('-').collect();
    segments.len() == 3
        && segments
            .iter()
            .all(|s| s.len() == 4 && s.chars().all(|c| c.is_ascii_lowercase()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_codes_match_grammar() {
        for _ in 0..100 {
            let code = generate();
            assert!(is_valid(&code), "bad code: {code}");
        }
    }

    #[test]
    fn normalize_trims_and_lowercases() {
        assert_eq!(normalize("  AAAA-bBbB-cccc "), "aaaa-bbbb-cccc");
        assert!(is_valid(&normalize(" AAAA-BBBB-CCCC ")));
    }

    #[test]
    fn rejects_malformed_codes() {
        for bad in [
            "",
            "aaaa-bbbb",
            "aaaa-bbbb-cccc-dddd",
            "aaa-bbbb-cccc",
            "aaaa-bbbb-ccc1",
            "AAAA-BBBB-CCCC",
            "aaaa_bbbb_cccc",
        ] {
            assert!(!is_valid(bad), "accepted: {bad}");
        }
    }
}
