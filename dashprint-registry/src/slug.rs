//! Slug derivation for printers that don't specify `uniqueName` up front.

/// Lowercases, strips a handful of common Latin diacritics, and collapses
/// every run of non-`[a-z0-9]` characters into a single `-`, trimming
/// leading/trailing hyphens — e.g. `"Prusa MK3S+"` becomes `"prusa-mk3s"`.
pub fn slugify(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut last_was_sep = true; // swallow a leading separator
    for ch in name.chars() {
        for base in strip_diacritic(ch).to_lowercase() {
            if base.is_ascii_alphanumeric() {
                out.push(base);
                last_was_sep = false;
            } else if !last_was_sep {
                out.push('-');
                last_was_sep = true;
            }
        }
    }
    while out.ends_with('-') {
        out.pop();
    }
    if out.is_empty() {
        out.push_str("printer");
    }
    out
}

/// Maps the common accented Latin letters likely to show up in a printer's
/// human label to their unaccented ASCII base. Not a general Unicode
/// normalization — just enough to keep `slugify` from emitting non-ASCII.
fn strip_diacritic(ch: char) -> char {
    match ch {
        'à' | 'á' | 'â' | 'ã' | 'ä' | 'å' | 'ā' => 'a',
        'è' | 'é' | 'ê' | 'ë' | 'ē' => 'e',
        'ì' | 'í' | 'î' | 'ï' | 'ī' => 'i',
        'ò' | 'ó' | 'ô' | 'õ' | 'ö' | 'ō' => 'o',
        'ù' | 'ú' | 'û' | 'ü' | 'ū' => 'u',
        'ý' | 'ÿ' => 'y',
        'ñ' => 'n',
        'ç' => 'c',
        other => other,
    }
}
