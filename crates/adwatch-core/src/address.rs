use once_cell::sync::Lazy;
use regex::Regex;

/// Constant added to the leading house number of every published
/// address so listings cannot be traced back to the exact building.
pub const HOUSE_NUMBER_OFFSET: u64 = 20;

static HYPHEN_SPACING: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s*-\s*").expect("hyphen regex"));
static PARENTHETICAL: Lazy<Regex> = Lazy::new(|| Regex::new(r"\(.*?\)").expect("paren regex"));
static HOUSE_NUMBER: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d+").expect("house regex"));
// ASCII word class on purpose: house-number suffixes like "12/3A" or
// "45-B" are ASCII even in otherwise accented addresses.
static LEADING_NUMBER_TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\D*\d+[0-9A-Za-z_/.\-]*").expect("leading regex"));
static ROAD_AFTER_NUMBER: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d+\s+(.*)").expect("road regex"));

/// Privacy-preserving display form of a listing address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObfuscatedAddress {
    /// Full derived address, house number shifted by the fixed offset.
    pub address: String,
    /// Street portion only (derived address minus the house number).
    pub road: String,
}

/// Deterministically derives the published address from the raw one:
/// drop the trailing administrative components (ward/district/city)
/// when present, strip parentheticals, normalize hyphen spacing, add
/// the fixed offset to the leading house number, and title-case the
/// remaining tokens. Same input always yields the same output.
pub fn obfuscate_address(raw: &str) -> ObfuscatedAddress {
    let parts: Vec<&str> = raw.split(',').map(str::trim).collect();
    let main = if parts.len() > 3 {
        parts[..parts.len() - 3].join(", ")
    } else {
        raw.trim().to_string()
    };
    let address = refine(&main);
    let road = match ROAD_AFTER_NUMBER.captures(&address) {
        Some(caps) => title_case(caps.get(1).expect("road group").as_str()),
        None => title_case(&address),
    };
    ObfuscatedAddress { address, road }
}

fn refine(address: &str) -> String {
    let address = HYPHEN_SPACING.replace_all(address, "-");
    let address = PARENTHETICAL.replace_all(&address, "");
    let address = address.trim();

    if let Some(found) = HOUSE_NUMBER.find(address) {
        // Absurdly long digit runs are not house numbers; fall through
        // to plain title-casing rather than overflowing.
        if let Ok(number) = found.as_str().parse::<u64>() {
            let rest = LEADING_NUMBER_TOKEN.replace(address, "");
            let rest = rest
                .trim()
                .trim_matches(|c: char| matches!(c, ' ' | ',' | '.' | '-'));
            return format!("{} {}", number + HOUSE_NUMBER_OFFSET, title_case(rest));
        }
    }
    title_case(address)
}

/// Lowercases the input and uppercases the first character of each
/// space-separated token.
pub fn title_case(input: &str) -> String {
    input
        .to_lowercase()
        .split(' ')
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn house_number_is_shifted_and_parentheticals_dropped() {
        let got = obfuscate_address("123 (Cũ) Nguyen Trai");
        assert_eq!(got.address, "143 Nguyen Trai");
        assert_eq!(got.road, "Nguyen Trai");
    }

    #[test]
    fn transform_is_deterministic() {
        let first = obfuscate_address("123 (Cũ) Nguyen Trai");
        let second = obfuscate_address("123 (Cũ) Nguyen Trai");
        assert_eq!(first, second);
    }

    #[test]
    fn trailing_admin_components_are_dropped() {
        let got = obfuscate_address("12/3 Le Van Sy, Phường 13, Quận 3, Hồ Chí Minh");
        assert_eq!(got.address, "32 Le Van Sy");
        assert_eq!(got.road, "Le Van Sy");
    }

    #[test]
    fn hyphen_spacing_is_normalized() {
        let got = obfuscate_address("45 - B Tran Phu");
        assert_eq!(got.address, "65 Tran Phu");
    }

    #[test]
    fn address_without_number_is_title_cased_only() {
        let got = obfuscate_address("hem nho khong so");
        assert_eq!(got.address, "Hem Nho Khong So");
        assert_eq!(got.road, "Hem Nho Khong So");
    }
}
