//! Local override file.
//!
//! Plain text, one route per line:
//!
//! ```text
//! # comment
//! www.example.com 10443
//! ```
//!
//! Blank lines and `#` comments are ignored. Anything else must be exactly
//! a host and a port separated by whitespace; other lines are skipped with
//! a warning.

use std::fs;
use std::io;
use std::path::Path;

use tracing::{info, warn};

/// Default override file path, relative to the working directory.
pub const DEFAULT_OVERRIDES_PATH: &str = "config";

/// One parsed override line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverrideEntry {
    pub host: String,
    pub port: u16,
}

/// Why a line was skipped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineError {
    /// Not exactly two whitespace-separated tokens.
    Shape,
    /// Second token is not a port in 1-65535.
    Port,
}

/// Parse one line. `Ok(None)` for blank lines and comments.
pub fn parse_line(line: &str) -> Result<Option<OverrideEntry>, LineError> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }

    let mut tokens = line.split_whitespace();
    let (Some(host), Some(port), None) = (tokens.next(), tokens.next(), tokens.next()) else {
        return Err(LineError::Shape);
    };

    match port.parse::<u16>() {
        Ok(port) if port != 0 => Ok(Some(OverrideEntry {
            host: host.to_string(),
            port,
        })),
        _ => Err(LineError::Port),
    }
}

/// Parse file contents, skipping (and logging) malformed lines.
///
/// Lines are decoded one at a time; a line that is not valid UTF-8 is
/// skipped like any other malformed line.
pub fn parse_overrides(content: &[u8]) -> Vec<OverrideEntry> {
    let mut entries = Vec::new();

    for (idx, raw) in content.split(|&b| b == b'\n').enumerate() {
        let line = match std::str::from_utf8(raw) {
            Ok(line) => line,
            Err(_) if raw.trim_ascii_start().starts_with(b"#") => continue,
            Err(_) => {
                warn!(line = idx + 1, "Invalid UTF-8 in override file");
                continue;
            }
        };

        match parse_line(line) {
            Ok(Some(entry)) => entries.push(entry),
            Ok(None) => {}
            Err(LineError::Shape) => {
                warn!(line = idx + 1, content = %line.trim(), "Invalid line in override file");
            }
            Err(LineError::Port) => {
                warn!(line = idx + 1, content = %line.trim(), "Invalid port in override file");
            }
        }
    }

    entries
}

/// Read and parse the override file.
///
/// A missing file is not an error and yields no entries. Any other read
/// error is returned.
pub fn load_overrides(path: &Path) -> io::Result<Vec<OverrideEntry>> {
    let content = match fs::read(path) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            info!(path = %path.display(), "Override file not found; using database routes only");
            return Ok(Vec::new());
        }
        Err(e) => return Err(e),
    };

    Ok(parse_overrides(&content))
}
