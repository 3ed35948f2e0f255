//! Language name to ISO-639-1 code lookup.

/// Code sent when the language is not in the table.
pub const AUTO: &str = "auto";

const LANGUAGES: &[(&str, &str)] = &[
    ("english", "en"),
    ("german", "de"),
    ("french", "fr"),
    ("spanish", "es"),
    ("italian", "it"),
    ("dutch", "nl"),
    ("portuguese", "pt"),
    ("indonesian", "id"),
    ("japanese", "ja"),
    ("chinese", "zh"),
    ("korean", "ko"),
    ("russian", "ru"),
    ("turkish", "tr"),
    ("polish", "pl"),
    ("swedish", "sv"),
];

/// Two-letter code for a language name as written by the model.
///
/// Matching ignores case and surrounding punctuation, and accepts a code
/// that is already two letters.
pub fn code_for(language: &str) -> Option<&'static str> {
    let name = language
        .trim()
        .trim_matches(|c: char| !c.is_alphanumeric())
        .to_lowercase();
    LANGUAGES
        .iter()
        .find(|(n, c)| *n == name || *c == name)
        .map(|(_, c)| *c)
}

/// Code for the search backend, falling back to [`AUTO`].
pub fn search_code(language: &str) -> &'static str {
    code_for(language).unwrap_or(AUTO)
}
