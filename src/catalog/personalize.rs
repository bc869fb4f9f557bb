//! `{name}` substitution for outgoing bodies.

use std::sync::LazyLock;

use regex::Regex;

/// A placeholder that opens a line, with its glued punctuation and the
/// spacing after it.
static LEADING_PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^([ \t]*)\{name\}[,.!?;:]*[ \t]*").unwrap());

/// The placeholder plus any punctuation glued to it, and one leading space.
static NAME_PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r" ?\{name\}[,.!?;:]*").unwrap());

/// Render a template body for one recipient.
///
/// With a name, `{name}` is replaced verbatim. Without one the placeholder is
/// removed together with its trailing punctuation so `"Hi {name}, breathe"`
/// becomes `"Hi breathe"` rather than `"Hi , breathe"`. Text away from the
/// placeholder is left as written.
pub fn personalize(body: &str, name: Option<&str>) -> String {
    if !body.contains("{name}") {
        return body.to_string();
    }
    match name.map(str::trim).filter(|n| !n.is_empty()) {
        Some(name) => body.replace("{name}", name),
        None => {
            let leading = LEADING_PLACEHOLDER.replace_all(body, "$1");
            NAME_PLACEHOLDER.replace_all(&leading, "").into_owned()
        }
    }
}
