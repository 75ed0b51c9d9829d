use std::sync::OnceLock;

use regex::Regex;

/// UTF-8 accents that were decoded as Latin-1, and what they should read.
const SUBSTITUTIONS: &[(&str, &str)] = &[
    ("Ã£o", "ão"),
    ("Ãªncia", "ência"),
    ("Ã¡", "á"),
    ("Ã©", "é"),
    ("Ã\u{AD}", "í"),
    ("Ã³", "ó"),
    ("Ãº", "ú"),
    ("Ã§", "ç"),
    ("Ãµ", "õ"),
    ("Ão", "ão"),
    ("Ãa", "ã"),
];

fn stray_prefix() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"Ã+\w+").expect("static pattern"))
}

/// Repairs descriptions whose accented characters were mis-decoded.
///
/// Known sequences are substituted first; any remaining `Ã` that starts a
/// word run is dropped.
pub fn repair_mojibake(text: &str) -> String {
    let mut repaired = text.to_string();
    for (broken, fixed) in SUBSTITUTIONS {
        repaired = repaired.replace(broken, fixed);
    }
    stray_prefix()
        .replace_all(&repaired, |caps: &regex::Captures| {
            caps[0].trim_start_matches('Ã').to_string()
        })
        .into_owned()
}
