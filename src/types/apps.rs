//! Application-hint canonicalization.
//!
//! VLM output and user filters name applications loosely; both are mapped
//! onto one canonical vocabulary so filters and ranking compare equals.

/// Canonical app names and the aliases that map onto them.
const ALIASES: &[(&str, &[&str])] = &[
    ("vscode", &["visual studio code", "vs code", "code", "code - oss", "vscodium"]),
    ("chrome", &["google chrome", "chromium"]),
    ("firefox", &["mozilla firefox", "firefox developer edition"]),
    ("safari", &["safari technology preview"]),
    ("edge", &["microsoft edge"]),
    ("iterm", &["iterm2"]),
    ("terminal", &["apple terminal", "gnome terminal", "konsole", "alacritty", "kitty"]),
    ("intellij", &["intellij idea", "idea"]),
    ("slack", &[]),
    ("discord", &[]),
    ("notion", &[]),
    ("obsidian", &[]),
    ("figma", &[]),
    ("zoom", &["zoom.us"]),
    ("mail", &["apple mail", "thunderbird"]),
    ("finder", &[]),
    ("preview", &[]),
    ("xcode", &[]),
];

/// Maps a raw application hint onto the canonical vocabulary.
///
/// Unknown names pass through lowercased; `None` only for empty input.
pub fn canonicalize_app_hint(raw: &str) -> Option<String> {
    let needle = raw.trim().to_lowercase();
    if needle.is_empty() {
        return None;
    }
    for (canonical, aliases) in ALIASES {
        if needle == *canonical || aliases.contains(&needle.as_str()) {
            return Some((*canonical).to_string());
        }
    }
    Some(needle)
}

/// Whether a hint is part of the canonical vocabulary.
///
/// Filter merging only admits known values from the query planner.
pub fn is_known_app(hint: &str) -> bool {
    ALIASES
        .iter()
        .any(|(canonical, _)| *canonical == hint.to_lowercase())
}
