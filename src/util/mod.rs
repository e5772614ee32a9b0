//! Case-insensitive string and path helpers.
//!
//! Virtual paths are matched without regard to case, including non-ASCII
//! input, so every comparison here folds through Unicode lowercasing with an
//! ASCII fast path. Path splitting treats the root as the empty string, never
//! as `"/"`.

pub mod sys;

/// Lowercase `s`. ASCII-only input takes the cheap byte-wise path.
pub fn lower(s: &str) -> String {
    if s.is_ascii() {
        s.to_ascii_lowercase()
    } else {
        s.to_lowercase()
    }
}

/// Case-insensitive equality.
pub fn iequals(lhs: &str, rhs: &str) -> bool {
    if lhs.is_ascii() && rhs.is_ascii() {
        return lhs.eq_ignore_ascii_case(rhs);
    }
    lhs.chars()
        .flat_map(char::to_lowercase)
        .eq(rhs.chars().flat_map(char::to_lowercase))
}

/// Case-insensitive prefix test.
pub fn istarts_with(lhs: &str, rhs: &str) -> bool {
    if rhs.is_empty() {
        return true;
    }
    if lhs.len() < rhs.len() || !lhs.is_char_boundary(rhs.len()) {
        return false;
    }
    iequals(&lhs[..rhs.len()], rhs)
}

/// Case-insensitive suffix test.
pub fn iends_with(lhs: &str, rhs: &str) -> bool {
    if rhs.is_empty() {
        return true;
    }
    if lhs.len() < rhs.len() {
        return false;
    }
    let split = lhs.len() - rhs.len();
    if !lhs.is_char_boundary(split) {
        return false;
    }
    iequals(&lhs[split..], rhs)
}

/// Parent of `path`: everything before the last `'/'`.
///
/// Returns the empty string (not `"/"`) for top-level entries like `"/a"`,
/// and the input unchanged when it contains no separator.
pub fn parent_path(path: &str) -> &str {
    match path.rfind('/') {
        Some(pos) => &path[..pos],
        None => path,
    }
}

/// Last component of `path`: everything after the last `'/'`, or the whole
/// string when there is no separator.
pub fn file_name(path: &str) -> &str {
    match path.rfind('/') {
        Some(pos) => &path[pos + 1..],
        None => path,
    }
}
