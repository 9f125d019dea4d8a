//! Canonical location names for raw career-site location strings.

use std::sync::LazyLock;

use regex::Regex;

pub const UNKNOWN_LOCATION: &str = "Unknown";

const KNOWN_VARIANTS: &[(&str, &str)] = &[
    ("NEW YORK, NEW YORK, UNITED STATES", "New York"),
    ("New York, NY, United States", "New York"),
    ("New York, New York, United States", "New York"),
    ("New York·United States", "New York"),
    ("United States - New York", "New York"),
    ("Chicago, IL, United States", "Chicago"),
    ("Chicago, Illinois, United States", "Chicago"),
    ("Chicago·United States", "Chicago"),
    ("San Francisco, California, United States", "San Francisco"),
    ("San Francisco·United States", "San Francisco"),
    ("Dallas, Texas, United States", "Dallas"),
    ("Dallas·United States", "Dallas"),
    ("Houston, Texas, United States", "Houston"),
    ("Houston·United States", "Houston"),
    ("Salt Lake City·United States", "Salt Lake City"),
    ("MIAMI, FLORIDA, UNITED STATES", "Miami"),
    ("JERSEY CITY, NEW JERSEY, UNITED STATES", "Jersey City"),
    ("Jersey City, NJ, United States", "Jersey City"),
    ("Atlanta, GA, United States", "Atlanta"),
    ("Columbus, OH, United States", "Columbus"),
    ("Jacksonville, Florida, United States", "Jacksonville"),
    ("Tampa, Florida, United States", "Tampa"),
    ("Hong Kong SAR", "Hong Kong"),
    ("Switzerland - Western Switzerland", "Switzerland"),
    ("Switzerland - Zürich", "Switzerland"),
    ("2 Locations", "Multiple Locations"),
    ("3 Locations", "Multiple Locations"),
    (
        "United States - California, United States - Illinois",
        "Multiple US Locations",
    ),
    (
        "United States - California, United States - Illinois, United States - New York",
        "Multiple US Locations",
    ),
];

const STATE_TO_CITY: &[(&str, &str)] = &[
    ("California", "California"),
    ("New York", "New York"),
    ("Illinois", "Chicago"),
    ("Texas", "Texas"),
];

static US_STATE_CODE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([^,]+),\s+[A-Z]{2},\s+United States$").expect("static regex")
});
static US_STATE_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([^,]+),\s+[A-Za-z\s]+,\s+United States$").expect("static regex")
});

const US_DOT_SUFFIX: &str = "·United States";
const US_STATE_PREFIX: &str = "United States - ";

/// Map a raw location string to its canonical name.
///
/// Total and idempotent: blank input becomes `"Unknown"`, unrecognised input
/// is returned trimmed, and the result is a fixpoint of the rules.
pub fn normalize_location(raw: &str) -> String {
    // Each pass returns a table value (already a fixpoint) or a strictly
    // shorter string, so this terminates.
    let mut current = normalize_once(raw);
    loop {
        let next = normalize_once(&current);
        if next == current {
            return current;
        }
        current = next;
    }
}

fn normalize_once(raw: &str) -> String {
    let location = raw.trim();
    if location.is_empty() {
        return UNKNOWN_LOCATION.to_string();
    }

    if let Some((_, canonical)) = KNOWN_VARIANTS.iter().find(|(variant, _)| *variant == location) {
        return (*canonical).to_string();
    }

    let location = location.trim_end_matches(|c| c == '.' || c == ' ');
    if location.is_empty() {
        return UNKNOWN_LOCATION.to_string();
    }

    for pattern in [&*US_STATE_CODE, &*US_STATE_NAME] {
        if let Some(city) = pattern.captures(location).and_then(|c| c.get(1)) {
            return city.as_str().trim().to_string();
        }
    }

    if location.contains(US_DOT_SUFFIX) {
        return location.replace(US_DOT_SUFFIX, "").trim().to_string();
    }

    if let Some(state) = location.strip_prefix(US_STATE_PREFIX) {
        let state = state.trim();
        return STATE_TO_CITY
            .iter()
            .find(|(name, _)| *name == state)
            .map(|(_, city)| (*city).to_string())
            .unwrap_or_else(|| state.to_string());
    }

    location.to_string()
}
