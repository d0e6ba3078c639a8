//! Directory enumeration for frame sequences
//!
//! Every configured directory is expanded against every filemask with a
//! case-insensitive glob, then the combined listing is sorted and
//! deduplicated. Positions in that listing are the frame indices, so the
//! ordering must be deterministic across rescans of unchanged content.

use log::debug;
use std::path::PathBuf;

use crate::frame::FrameError;

/// Expand `directories` x `filemasks` into a sorted, deduplicated file list.
///
/// Results are appended to `out` (cleared first) so callers can recycle the
/// vector across rescans. A missing directory or an invalid pattern fails
/// the whole scan; the caller reports it once and treats the frame list as
/// empty.
pub fn enumerate(
    directories: &[PathBuf],
    filemasks: &[String],
    out: &mut Vec<PathBuf>,
) -> Result<(), FrameError> {
    out.clear();

    // TGA vs tga and friends: match masks case-insensitively everywhere
    let options = glob::MatchOptions {
        case_sensitive: false,
        ..Default::default()
    };

    for dir in directories {
        if !dir.is_dir() {
            return Err(FrameError::Enumeration(format!(
                "directory not found: {}",
                dir.display()
            )));
        }

        for mask in filemasks {
            let pattern = dir.join(mask).to_string_lossy().replace('\\', "/");
            let entries = glob::glob_with(&pattern, options).map_err(|e| {
                FrameError::Enumeration(format!("bad pattern '{}': {}", pattern, e))
            })?;

            for entry in entries {
                let path = entry.map_err(|e| {
                    FrameError::Enumeration(format!("unreadable entry: {}", e))
                })?;
                if path.is_file() {
                    out.push(path);
                }
            }
        }
    }

    out.sort();
    out.dedup();
    debug!("Scan: {} files from {} dir(s)", out.len(), directories.len());
    Ok(())
}
