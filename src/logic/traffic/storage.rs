use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::logic::error::PeakFileError;

/// `<hostNumber> <peakRate>`, single space separated. Peaks are never
/// negative.
static PEAK_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(\d+) (\+?(?:\d+\.?\d*|\.\d+)(?:[eE][+-]?\d+)?)$")
        .expect("peak line pattern is valid")
});

/// Parse a peak snapshot. Any bad line rejects the whole file.
pub fn parse_peaks(content: &str) -> Result<BTreeMap<u32, f64>, PeakFileError> {
    let mut peaks = BTreeMap::new();

    for (i, line) in content.lines().enumerate() {
        let malformed = || PeakFileError::Malformed { line: i + 1, content: line.to_string() };
        let caps = PEAK_LINE.captures(line).ok_or_else(malformed)?;
        let host: u32 = caps[1].parse().map_err(|_| malformed())?;
        let peak: f64 = caps[2].parse().map_err(|_| malformed())?;
        peaks.insert(host, peak);
    }

    Ok(peaks)
}

/// Load the peak snapshot from disk
pub fn load_peaks(path: &Path) -> Result<BTreeMap<u32, f64>, PeakFileError> {
    if !path.exists() {
        return Err(PeakFileError::NotFound(path.to_path_buf()));
    }

    let content = fs::read_to_string(path)?;
    let peaks = parse_peaks(&content)?;
    if peaks.is_empty() {
        return Err(PeakFileError::Empty(path.to_path_buf()));
    }
    Ok(peaks)
}

/// Rewrite the peak snapshot
pub fn save_peaks(path: &Path, peaks: &BTreeMap<u32, f64>) -> Result<(), PeakFileError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let mut content = String::new();
    for (host, peak) in peaks {
        content.push_str(&format!("{} {}\n", host, peak));
    }
    fs::write(path, content)?;
    Ok(())
}
