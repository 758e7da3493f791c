//! Text normalization for matching.
//!
//! Matching is done on folded forms: project names lose case, punctuation
//! and whitespace runs; streets lose their type suffix variants; postcodes
//! are digit strings. The default is locale-agnostic (street + postcode),
//! with the regional fields carried as data only.

/// Case-fold, collapse whitespace, strip punctuation. The canonical form
/// used for name and alias comparison.
pub fn normalize_name(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut last_space = true;
    for ch in raw.chars() {
        if ch.is_alphanumeric() {
            out.extend(ch.to_lowercase());
            last_space = false;
        } else if !last_space {
            out.push(' ');
            last_space = true;
        }
    }
    out.trim().to_string()
}

/// Normalize a street line: fold case, expand common abbreviations to one
/// canonical suffix so "12 Baker St" and "12 Baker Street" compare equal.
pub fn normalize_street(raw: &str) -> String {
    let folded = normalize_name(raw);
    folded
        .split(' ')
        .map(canonical_street_token)
        .collect::<Vec<_>>()
        .join(" ")
}

fn canonical_street_token(token: &str) -> &str {
    match token {
        "street" => "st",
        "road" => "rd",
        "avenue" | "av" => "ave",
        "drive" | "drv" => "dr",
        "court" | "crt" => "ct",
        "place" => "pl",
        "lane" => "ln",
        "crescent" | "cres" => "cr",
        "highway" => "hwy",
        "parade" => "pde",
        "boulevard" | "blvd" => "bvd",
        other => other,
    }
}

/// Keep only digits; empty if nothing remains.
pub fn normalize_postcode(raw: &str) -> String {
    raw.chars().filter(|c| c.is_ascii_digit()).collect()
}

/// Fold a job number for set membership: uppercase, no separators.
/// "JOB-2024-087", "job 2024 087" and "2024-087" all share a suffix form,
/// so comparison also accepts a suffix match on the digit groups.
pub fn normalize_job_number(raw: &str) -> String {
    raw.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect::<String>()
        .to_uppercase()
}

/// Canonical form for address-based pattern keys: normalized street plus
/// postcode digits, pipe-separated. Hashed before storage.
pub fn address_pattern_key(street: &str, postcode: Option<&str>) -> String {
    format!(
        "{}|{}",
        normalize_street(street),
        postcode.map(normalize_postcode).unwrap_or_default()
    )
}

/// Whether two job numbers refer to the same job: exact normalized match,
/// or one is a digit-suffix of the other ("087" vs "2024-087").
pub fn job_numbers_match(a: &str, b: &str) -> bool {
    let na = normalize_job_number(a);
    let nb = normalize_job_number(b);
    if na.is_empty() || nb.is_empty() {
        return false;
    }
    if na == nb {
        return true;
    }
    let (shorter, longer) = if na.len() < nb.len() { (&na, &nb) } else { (&nb, &na) };
    shorter.len() >= 3 && longer.ends_with(shorter.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_name_folds_case_and_punctuation() {
        assert_eq!(normalize_name("Smith  Residence — Reno!"), "smith residence reno");
        assert_eq!(normalize_name("12 Baker St."), "12 baker st");
        assert_eq!(normalize_name("  "), "");
    }

    #[test]
    fn test_normalize_street_equates_suffixes() {
        assert_eq!(normalize_street("12 Baker Street"), normalize_street("12 Baker St"));
        assert_eq!(normalize_street("5 Ocean Cres"), normalize_street("5 Ocean Crescent"));
        assert_ne!(normalize_street("12 Baker St"), normalize_street("14 Baker St"));
    }

    #[test]
    fn test_normalize_postcode() {
        assert_eq!(normalize_postcode(" 3000 "), "3000");
        assert_eq!(normalize_postcode("VIC 3000"), "3000");
    }

    #[test]
    fn test_address_pattern_key() {
        assert_eq!(
            address_pattern_key("12 Baker Street", Some("3000")),
            address_pattern_key("12 Baker St", Some(" 3000 "))
        );
        assert_eq!(address_pattern_key("12 Baker St", None), "12 baker st|");
    }

    #[test]
    fn test_job_numbers_match() {
        assert!(job_numbers_match("JOB-2024-087", "2024-087"));
        assert!(job_numbers_match("2024-087", "job 2024 087"));
        assert!(job_numbers_match("087", "2024-087"));
        assert!(!job_numbers_match("088", "2024-087"));
        assert!(!job_numbers_match("", "2024-087"));
        // Too-short suffixes do not match: "87" could be anything
        assert!(!job_numbers_match("87", "2024-087"));
    }
}
