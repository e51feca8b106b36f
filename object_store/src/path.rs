//! Store-agnostic object locations.

use std::fmt::{Display, Formatter};

pub const DELIMITER: &str = "/";

/// A location in the store, made of `/`-separated parts.
///
/// Parts never contain the delimiter themselves, so a path always maps to
/// the same key in every backend.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectPath {
    parts: Vec<String>,
}

impl ObjectPath {
    /// A directory-like prefix.
    pub fn from_dirs<I, S>(dirs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut path = Self::default();
        for d in dirs {
            path.push_dir(d.as_ref());
        }
        path
    }

    /// A file inside the given directories.
    pub fn from_dirs_and_file<I, S>(dirs: I, file: &str) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut path = Self::from_dirs(dirs);
        path.push_dir(file);
        path
    }

    /// Parse a raw `/`-separated string, ignoring empty segments.
    pub fn from_raw(raw: &str) -> Self {
        Self::from_dirs(raw.split(DELIMITER))
    }

    /// Append a segment. The segment is split on the delimiter so that a
    /// working directory such as `/data/lineitem` adds two parts.
    pub fn push_dir(&mut self, dir: &str) {
        self.parts.extend(
            dir.split(DELIMITER)
                .filter(|s| !s.is_empty())
                .map(ToString::to_string),
        );
    }

    /// Returns a new path with `part` appended.
    pub fn child(&self, part: &str) -> Self {
        let mut path = self.clone();
        path.push_dir(part);
        path
    }

    pub fn parts(&self) -> &[String] {
        &self.parts
    }

    /// The final part, if any.
    pub fn file_name(&self) -> Option<&str> {
        self.parts.last().map(String::as_str)
    }

    pub fn starts_with(&self, prefix: &Self) -> bool {
        self.parts.starts_with(&prefix.parts)
    }

    /// The `/`-joined form used as the key in flat backends.
    pub fn to_raw(&self) -> String {
        self.parts.join(DELIMITER)
    }
}

impl Display for ObjectPath {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_raw())
    }
}
