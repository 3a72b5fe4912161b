use crate::error::{Result, TransferError};
use crate::transfer::constants::MAX_FILENAME_LENGTH;
use std::path::{Component, Path, PathBuf};
use tokio::fs::{File, OpenOptions};

/// Windows device names that cannot be used as file names
const RESERVED_NAMES: [&str; 22] = [
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

/// Longest single path component we write
const MAX_COMPONENT_LENGTH: usize = 255;

/// Map a name received on the wire to a path under `download_dir`.
///
/// The name may carry `/` or `\` separated directories. Empty, `.` and `..`
/// components are dropped, so the result never escapes `download_dir`.
pub fn resolve_output_path(download_dir: &Path, file_name: &str) -> Result<PathBuf> {
    if file_name.len() > MAX_FILENAME_LENGTH {
        return Err(TransferError::Protocol(format!(
            "filename too long ({} bytes, max {})",
            file_name.len(),
            MAX_FILENAME_LENGTH
        )));
    }

    let components: Vec<String> = file_name
        .split(['/', '\\'])
        .filter_map(sanitize_component)
        .collect();

    if components.is_empty() {
        return Err(TransferError::Protocol(format!(
            "unusable filename {:?}",
            file_name
        )));
    }

    let mut path = download_dir.to_path_buf();
    path.extend(components);
    Ok(path)
}

/// Clean one path component. `None` means "skip it".
fn sanitize_component(component: &str) -> Option<String> {
    let mut clean: String = component.chars().filter(|c| !c.is_control()).collect();

    if clean.trim().is_empty() || clean == "." || clean == ".." {
        return None;
    }

    // Windows drive prefixes such as "C:"
    if clean.len() == 2 && clean.ends_with(':') {
        return None;
    }

    let stem = clean.split('.').next().unwrap_or_default();
    if RESERVED_NAMES.iter().any(|r| stem.eq_ignore_ascii_case(r)) {
        clean.insert(0, '_');
    }

    if clean.len() > MAX_COMPONENT_LENGTH {
        truncate_keeping_extension(&mut clean, MAX_COMPONENT_LENGTH);
    }

    Some(clean)
}

fn truncate_keeping_extension(name: &mut String, max_len: usize) {
    let extension = name
        .rfind('.')
        .map(|idx| name[idx..].to_string())
        .filter(|ext| ext.len() < 20 && ext.len() < max_len)
        .unwrap_or_default();

    let mut cutoff = max_len - extension.len();
    while !name.is_char_boundary(cutoff) {
        cutoff -= 1;
    }
    name.truncate(cutoff);
    name.push_str(&extension);
}

/// Wire name for `path` relative to `base`, always `/`-separated.
pub fn relative_wire_name(path: &Path, base: &Path) -> Option<String> {
    let relative = path.strip_prefix(base).ok()?;
    let parts: Vec<&str> = relative
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => part.to_str(),
            _ => None,
        })
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

/// Create (truncating) or append to a received file with owner-only permissions.
pub async fn open_output_file(path: &Path, append: bool) -> std::io::Result<File> {
    let mut options = OpenOptions::new();
    options.create(true);

    if append {
        options.append(true);
    } else {
        options.write(true).truncate(true);
    }
    #[cfg(unix)]
    options.mode(0o600);

    options.open(path).await
}

/// Format transfer speed from bytes and elapsed time
pub fn format_transfer_speed(bytes_transferred: u64, elapsed_secs: f64) -> String {
    if elapsed_secs <= 0.0 {
        return "Starting...".to_string();
    }

    let speed_bps = bytes_transferred as f64 / elapsed_secs;
    if speed_bps > 1_000_000.0 {
        format!("{:.2} MB/s", speed_bps / 1_000_000.0)
    } else if speed_bps > 1_000.0 {
        format!("{:.1} KB/s", speed_bps / 1_000.0)
    } else {
        format!("{:.0} B/s", speed_bps)
    }
}

/// Human-readable size with binary units
pub fn format_size(size: u64) -> String {
    let mut value = size as f64;
    for unit in ["B", "KB", "MB", "GB", "TB"] {
        if value < 1024.0 {
            return format!("{:.2} {}", value, unit);
        }
        value /= 1024.0;
    }
    format!("{:.2} PB", value)
}
