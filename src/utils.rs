//! Output naming and filesystem helpers

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::types::{ContentKind, ContentNode};

/// Longest file or directory name produced for delivered content
pub const MAX_SEGMENT_LEN: usize = 100;

/// Extension given to documents whose name carries none
const DEFAULT_DOCUMENT_EXTENSION: &str = "pdf";

/// Make a course, folder or content name safe as a single path segment
///
/// Reserved characters (`<>:"/\|?*` and control characters) become `_`,
/// whitespace runs collapse to one space, leading/trailing dots and spaces are
/// dropped, and the result is cut to [`MAX_SEGMENT_LEN`] characters.
///
/// # Examples
///
/// ```
/// use course_dl::utils::sanitize_segment;
///
/// assert_eq!(sanitize_segment("Unit 1: Basics / Intro"), "Unit 1_ Basics _ Intro");
/// assert_eq!(sanitize_segment("  ..  "), "untitled");
/// ```
pub fn sanitize_segment(name: &str) -> String {
    let replaced: String = name
        .chars()
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' => '_',
            c if c.is_whitespace() => ' ',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();

    let collapsed = replaced.split_whitespace().collect::<Vec<_>>().join(" ");
    let trimmed = collapsed.trim_matches(|c: char| c == '.' || c == ' ');
    let truncated: String = trimmed.chars().take(MAX_SEGMENT_LEN).collect();
    let truncated = truncated.trim_end_matches(|c: char| c == '.' || c == ' ');

    if truncated.is_empty() {
        "untitled".to_string()
    } else {
        truncated.to_string()
    }
}

/// Whether `name` ends in a short alphanumeric extension (`report.pdf`, not `Part 2. Review`)
fn has_extension(name: &str) -> bool {
    match name.rsplit_once('.') {
        Some((stem, ext)) => {
            !stem.is_empty()
                && (1..=5).contains(&ext.len())
                && ext.chars().all(|c| c.is_ascii_alphanumeric())
        }
        None => false,
    }
}

/// File name a leaf is delivered under
///
/// Documents without an extension are given `.pdf`.
pub fn leaf_file_name(node: &ContentNode) -> String {
    let name = sanitize_segment(&node.name);
    if node.kind != ContentKind::Document || has_extension(&name) {
        return name;
    }
    let room = MAX_SEGMENT_LEN - DEFAULT_DOCUMENT_EXTENSION.len() - 1;
    let stem: String = name.chars().take(room).collect();
    format!("{}.{DEFAULT_DOCUMENT_EXTENSION}", stem.trim_end())
}

/// Where a leaf lands: `output/<course>/<folders...>/<leaf>`
pub fn destination_for(output_dir: &Path, course_name: &str, node: &ContentNode) -> PathBuf {
    let mut path = output_dir.join(sanitize_segment(course_name));
    for folder in &node.path {
        path.push(sanitize_segment(folder));
    }
    path.push(leaf_file_name(node));
    path
}

/// Maximum number of ` (n)` suffixes tried before giving up on a unique name
const MAX_RENAME_ATTEMPTS: u32 = 9999;

/// Pick a destination not already claimed by another leaf of the same run
///
/// Two leaves with the same name in the same folder get `name (1).ext`,
/// `name (2).ext`, and so on. The chosen path is added to `taken`.
pub fn claim_destination(path: PathBuf, taken: &mut HashSet<PathBuf>) -> PathBuf {
    if taken.insert(path.clone()) {
        return path;
    }

    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "untitled".to_string());
    let extension = path.extension().map(|e| e.to_string_lossy().into_owned());

    for i in 1..=MAX_RENAME_ATTEMPTS {
        let name = match &extension {
            Some(ext) => format!("{stem} ({i}).{ext}"),
            None => format!("{stem} ({i})"),
        };
        let candidate = path.with_file_name(name);
        if taken.insert(candidate.clone()) {
            return candidate;
        }
    }

    // Unreachable in practice; fall back to sharing the path
    path
}

/// Free space available to this process on the filesystem holding `path`
///
/// `statvfs` on unix, `GetDiskFreeSpaceExW` on windows; other platforms
/// return [`std::io::ErrorKind::Unsupported`] and the caller skips the check.
pub fn get_available_space(path: &Path) -> std::io::Result<u64> {
    #[cfg(unix)]
    {
        use std::ffi::CString;
        use std::os::unix::ffi::OsStrExt;

        let c_path = CString::new(path.as_os_str().as_bytes())
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;

        // SAFETY: c_path is NUL-terminated and `stat` is only read after statvfs succeeds
        unsafe {
            let mut stat: libc::statvfs = std::mem::zeroed();
            if libc::statvfs(c_path.as_ptr(), &mut stat) != 0 {
                return Err(std::io::Error::last_os_error());
            }

            // Blocks available to unprivileged users, in fragment-size units
            #[allow(clippy::unnecessary_cast)]
            let available = (stat.f_bavail as u64).saturating_mul(stat.f_frsize as u64);
            Ok(available)
        }
    }

    #[cfg(windows)]
    {
        use std::os::windows::ffi::OsStrExt;
        use winapi::um::fileapi::GetDiskFreeSpaceExW;

        let wide_path: Vec<u16> = path
            .as_os_str()
            .encode_wide()
            .chain(std::iter::once(0))
            .collect();

        // SAFETY: wide_path is NUL-terminated and every out pointer refers to a live u64
        unsafe {
            let mut available: u64 = 0;
            let mut total: u64 = 0;
            let mut free: u64 = 0;

            if GetDiskFreeSpaceExW(
                wide_path.as_ptr(),
                &mut available as *mut u64 as *mut _,
                &mut total as *mut u64 as *mut _,
                &mut free as *mut u64 as *mut _,
            ) == 0
            {
                return Err(std::io::Error::last_os_error());
            }

            Ok(available)
        }
    }

    #[cfg(not(any(unix, windows)))]
    {
        Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "free space query is not supported on this platform",
        ))
    }
}
