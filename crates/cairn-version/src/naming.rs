//! Names for checked-in versions.
//!
//! A version is named after the predecessor it grows from. The first
//! versions after the root are `1.0`, `2.0`, ... by how many successors the
//! root already has. After any other version the number behind the last dot
//! is incremented (`1.2` → `1.3`); if that name is taken by another branch,
//! `.0` is appended until it is free (`1.2.0`, `1.2.0.0`, ...).

/// A predecessor candidate for naming.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NamingBase<'a> {
    /// Local name of the predecessor version.
    pub name: &'a str,
    pub is_root: bool,
    /// Number of successors the predecessor already has.
    pub successor_count: usize,
}

/// Pick the predecessor to name a new version after.
///
/// The shortest name wins; on equal length the first candidate does.
pub fn select_base<'a, 'b>(candidates: &'b [NamingBase<'a>]) -> Option<&'b NamingBase<'a>> {
    let mut best: Option<&NamingBase<'a>> = None;
    for candidate in candidates {
        match best {
            Some(b) if candidate.name.len() >= b.name.len() => {}
            _ => best = Some(candidate),
        }
    }
    best
}

/// The name for a new version grown from `base`. `taken` reports names
/// already used in the history.
pub fn next_version_name(base: &NamingBase<'_>, taken: impl Fn(&str) -> bool) -> String {
    let mut prefix;
    let mut candidate;
    if base.is_root {
        candidate = format!("{}.0", base.successor_count + 1);
        prefix = candidate.clone();
    } else {
        prefix = base.name.to_string();
        candidate = match base.name.rsplit_once('.') {
            Some((head, last)) => match last.parse::<u64>() {
                Ok(n) => format!("{head}.{}", n + 1),
                Err(_) => format!("{}.0", base.name),
            },
            None => match base.name.parse::<u64>() {
                Ok(n) => (n + 1).to_string(),
                Err(_) => format!("{}.0", base.name),
            },
        };
    }
    while taken(&candidate) {
        prefix.push_str(".0");
        candidate = prefix.clone();
    }
    candidate
}
