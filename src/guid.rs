//! Engine GUID detection through an external UEFI pattern scanner.

use crate::error::DecodeResult;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::NamedTempFile;
use tracing::debug;

/// Firmware volume GUIDs known to hold engine regions, as stored on disk.
const ENGINE_GUIDS: [&str; 11] = [
    "533A14F1EBCB3348A4DC0826E063EC08",
    "A8FF90DE85B97545AB8DADE52C362CA3",
    "A9A41FFC4E03D54693EEE6ECC6C7945E",
    "FC9137C45BE0A04A84B1F14547885C70",
    "89068D094542654F80C97F3202C5F44E",
    "F0D505D07598EA4A8F3996FC50DAEB94",
    "9BD5B898BAE8EE4898DDC295392F1EDB",
    "390716B36513A748AECB038652E2B528",
    "0C111D82A3D0F74CAEF3E28088491704",
    "6E1F582C87B1AA4696E72081098D6413",
    "8226C7591C5C22479F25B26F4275BFEF",
];

/// Stored GUID bytes of the standalone ME recovery module.
pub const RECOVERY_MODULE_GUID: &str = "0C111D82A3D0F74CAEF3E28088491704";

/// Convert 32 hex digits in on-disk order to the dashed GUID form, swapping
/// the first three fields.
pub fn switch_guid(raw: &str) -> Option<String> {
    if raw.len() != 32 || !raw.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    let g = raw.to_ascii_uppercase();
    let swap = |range: std::ops::Range<usize>| -> String {
        g[range]
            .as_bytes()
            .chunks(2)
            .rev()
            .map(|pair| String::from_utf8_lossy(pair).into_owned())
            .collect()
    };
    Some(format!(
        "{}-{}-{}-{}-{}",
        swap(0..8),
        swap(8..12),
        swap(12..16),
        &g[16..20],
        &g[20..]
    ))
}

/// Pattern file for one image.
fn pattern_text(image: &Path) -> String {
    ENGINE_GUIDS
        .iter()
        .map(|guid| format!("header count {guid} {}\n", image.display()))
        .collect()
}

/// Scanner output comes in blocks of four lines: the pattern echoed back,
/// a blank line, the result and another blank line.
pub fn parse_output(stdout: &str) -> Option<String> {
    let text = stdout.replace("\r\r\n", "\r\n").replace("\r\n\r\n", "\r\n");
    let lines: Vec<&str> = text.lines().collect();
    lines
        .chunks(4)
        .filter(|block| block.len() >= 3 && !block[2].contains("nothing found"))
        .find_map(|block| block[0].split_whitespace().nth(2).and_then(switch_guid))
}

#[derive(Debug, Clone)]
pub struct GuidScanner {
    pub program: PathBuf,
    /// Pattern file supplied by the user; the built-in list otherwise.
    pub pattern: Option<PathBuf>,
}

impl GuidScanner {
    pub fn new(program: PathBuf, pattern: Option<PathBuf>) -> Self {
        GuidScanner { program, pattern }
    }

    /// Run the scanner over `image`. A scanner that exits with a failure
    /// status found nothing; failing to run it at all is an error.
    pub fn scan(&self, image: &Path) -> DecodeResult<Option<String>> {
        // Removed when dropped, on every return path.
        let mut builtin = None;
        let pattern = match &self.pattern {
            Some(path) => path.clone(),
            None => {
                let mut file = NamedTempFile::new()?;
                file.write_all(pattern_text(image).as_bytes())?;
                file.flush()?;
                let path = file.path().to_path_buf();
                builtin = Some(file);
                path
            }
        };

        let output = Command::new(&self.program)
            .arg("file")
            .arg(&pattern)
            .arg(image)
            .output()?;
        drop(builtin);

        if !output.status.success() {
            debug!(status = %output.status, "GUID scanner reported no match");
            return Ok(None);
        }
        Ok(parse_output(&String::from_utf8_lossy(&output.stdout)))
    }
}
