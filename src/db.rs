//! SKU/version database lookup.

use std::fs;
use std::io;
use std::path::Path;

/// One database line split on `_`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbRecord {
    pub fields: Vec<String>,
}

impl DbRecord {
    pub fn get(&self, index: usize) -> Option<&str> {
        self.fields.get(index).map(String::as_str)
    }

    /// Family column of a public key line.
    pub fn variant(&self) -> Option<&str> {
        self.get(1)
    }
}

pub trait FirmwareDb: Send + Sync {
    fn lookup(&self, key: &str) -> Option<DbRecord>;
}

/// Line-oriented database file. Lines starting with `***` are comments.
#[derive(Debug, Clone, Default)]
pub struct FlatFileDb {
    lines: Vec<String>,
}

impl FlatFileDb {
    pub fn open(path: &Path) -> io::Result<Self> {
        Ok(Self::from_text(&fs::read_to_string(path)?))
    }

    pub fn from_text(text: &str) -> Self {
        let lines = text
            .lines()
            .filter(|line| line.len() >= 2 && !line.starts_with("***"))
            .map(|line| line.trim().to_string())
            .collect();
        FlatFileDb { lines }
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

impl FirmwareDb for FlatFileDb {
    /// First line containing `key`.
    fn lookup(&self, key: &str) -> Option<DbRecord> {
        if key.is_empty() {
            return None;
        }
        self.lines.iter().find(|line| line.contains(key)).map(|line| DbRecord {
            fields: line.split('_').map(str::to_string).collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const DB: &str = "\
*** Public keys
3B6F2B4A9D1A0E7DCE0D3E4C1F5A7B21_TXE
C7F2A8B1D6E4F3A95E0C2B7D9A4F1E06_ME
*

*** Versions
ME11_11.8.50.3425_CON_H_PRD
";

    #[test]
    fn finds_first_matching_line() {
        let db = FlatFileDb::from_text(DB);
        assert_eq!(db.len(), 3);

        let hit = db.lookup("C7F2A8B1D6E4F3A95E0C2B7D9A4F1E06").unwrap();
        assert_eq!(hit.variant(), Some("ME"));
        let hit = db.lookup("11.8.50.3425").unwrap();
        assert_eq!(hit.get(2), Some("CON"));
        assert_eq!(hit.fields.len(), 5);

        assert!(db.lookup("Public keys").is_none());
        assert!(db.lookup("").is_none());
    }

    #[test]
    fn opens_from_disk() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(DB.as_bytes()).unwrap();
        let db = FlatFileDb::open(file.path()).unwrap();
        assert_eq!(
            db.lookup("3B6F2B4A").and_then(|r| r.variant().map(str::to_string)),
            Some("TXE".to_string())
        );
        assert!(FlatFileDb::open(Path::new("/nonexistent/MEA.dat")).is_err());
    }
}
