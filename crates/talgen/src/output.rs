//! Writes generated files with owner-only permissions, or shows how they would change.

use std::{
    fs::{self, DirBuilder, OpenOptions, Permissions},
    io::{self, Write},
    os::unix::fs::{DirBuilderExt, OpenOptionsExt, PermissionsExt},
    path::{Path, PathBuf},
};

use similar::{Algorithm, TextDiff};
use snafu::{ResultExt, Snafu};
use tracing::debug;

pub const DIRECTORY_MODE: u32 = 0o700;
pub const FILE_MODE: u32 = 0o600;

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to create output directory {path:?}"))]
    CreateOutputDirectory { source: io::Error, path: PathBuf },

    #[snafu(display("failed to write {path:?}"))]
    WriteOutputFile { source: io::Error, path: PathBuf },

    #[snafu(display("failed to read previous version of {path:?}"))]
    ReadPreviousFile { source: io::Error, path: PathBuf },

    #[snafu(display("failed to resolve absolute path of {path:?}"))]
    ResolveAbsolutePath { source: io::Error, path: PathBuf },

    #[snafu(display("failed to print result"))]
    PrintResult { source: io::Error },
}

/// The file a node's config is written to.
pub fn node_config_path(out_dir: &Path, cluster_name: &str, hostname: &str) -> PathBuf {
    out_dir.join(format!("{cluster_name}-{hostname}.yaml"))
}

/// Writes `contents` to `path`, replacing any previous file. Missing parent directories are
/// created.
pub fn write_private(path: &Path, contents: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        DirBuilder::new()
            .recursive(true)
            .mode(DIRECTORY_MODE)
            .create(parent)
            .context(CreateOutputDirectorySnafu { path: parent })?;
    }

    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(FILE_MODE)
        .open(path)
        .context(WriteOutputFileSnafu { path })?;
    // The mode only applies to newly created files.
    file.set_permissions(Permissions::from_mode(FILE_MODE))
        .context(WriteOutputFileSnafu { path })?;
    file.write_all(contents)
        .context(WriteOutputFileSnafu { path })?;
    debug!(file.path = %path.display(), file.len = contents.len(), "wrote file");
    Ok(())
}

/// Writes a node config and reports it on `out`.
pub fn write_node_config(
    path: &Path,
    hostname: &str,
    contents: &[u8],
    out: &mut impl Write,
) -> Result<()> {
    write_private(path, contents)?;
    writeln!(out, "generated config for {hostname} in {}", path.display()).context(PrintResultSnafu)
}

/// Prints the difference between the file at `path` and `contents` to `out`. Nothing is written
/// to disk.
pub fn show_diff(path: &Path, contents: &[u8], out: &mut impl Write) -> Result<()> {
    let before = match fs::read_to_string(path) {
        Ok(before) => before,
        Err(err) if err.kind() == io::ErrorKind::NotFound => String::new(),
        Err(err) => return Err(err).context(ReadPreviousFileSnafu { path }),
    };
    let after = String::from_utf8_lossy(contents);

    let printed = match unified_diff(path, &before, &after)? {
        Some(diff) => writeln!(out, "{diff}"),
        None => writeln!(out, "no changes found on {}", path.display()),
    };
    printed.context(PrintResultSnafu)
}

/// Returns a unified diff from `before` to `after`, or nothing if they are equal.
///
/// The headers carry the absolute path of `path`, prefixed with `a` and `b`.
pub fn unified_diff(path: &Path, before: &str, after: &str) -> Result<Option<String>> {
    if before == after {
        return Ok(None);
    }
    let absolute = std::path::absolute(path).context(ResolveAbsolutePathSnafu { path })?;

    let diff = TextDiff::configure()
        .algorithm(Algorithm::Myers)
        .diff_lines(before, after);
    let text = diff
        .unified_diff()
        .header(
            &format!("a{}", absolute.display()),
            &format!("b{}", absolute.display()),
        )
        .to_string();
    Ok(Some(text))
}
