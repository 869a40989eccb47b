use super::{ArchiveCodec, ArchiveReport, CompressionProfile};
use crate::errors::ArchiveError;
use async_trait::async_trait;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use std::fs::{File, FileTimes};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tar::{Archive, Builder, EntryType, Header, HeaderMode};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// PAX record carrying the nanosecond-precision modification time.
const PAX_MTIME: &str = "mtime";

/// gzip-compressed tar archives with ustar headers plus PAX `mtime` records.
///
/// Symlinks are stored as links (never followed) and metadata is captured in
/// `HeaderMode::Complete`. The PAX record keeps the sub-second part of each
/// modification time, which restore reapplies exactly. Build tools rely on
/// those timestamps to stay incremental across invocations. Source access
/// times are put back after each file is read.
#[derive(Debug, Clone, Default)]
pub struct TarCodec {
    /// Paths relative to the source root that are never walked into
    exclude: Vec<PathBuf>,
}

impl TarCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Skip `paths` (relative to the source root) while walking entries. An
    /// entry named explicitly is still archived even if it sits below one.
    pub fn excluding(mut self, paths: impl IntoIterator<Item = PathBuf>) -> Self {
        self.exclude.extend(paths);
        self
    }

    fn is_excluded(exclude: &[PathBuf], rel: &Path) -> bool {
        exclude.iter().any(|prefix| rel.starts_with(prefix))
    }

    fn create_blocking(
        source_root: &Path,
        entries: &[PathBuf],
        exclude: &[PathBuf],
        dest: &Path,
        profile: CompressionProfile,
    ) -> Result<ArchiveReport, ArchiveError> {
        let present: Vec<&PathBuf> = entries
            .iter()
            .filter(|entry| {
                let exists = source_root.join(entry).symlink_metadata().is_ok();
                if !exists {
                    warn!(entry = %entry.display(), "Archive entry missing, skipping");
                }
                exists
            })
            .collect();
        if present.is_empty() {
            return Err(ArchiveError::NothingToArchive {
                root: source_root.to_path_buf(),
            });
        }

        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent).map_err(io_at(parent))?;
        }
        let file = File::create(dest).map_err(io_at(dest))?;
        let encoder = GzEncoder::new(BufWriter::new(file), profile.level());
        let mut builder = Builder::new(encoder);
        builder.follow_symlinks(false);

        let mut count = 0usize;
        for entry in present {
            let walk = WalkDir::new(source_root.join(entry))
                .follow_links(false)
                .into_iter()
                .filter_entry(|item| {
                    if item.path() == dest {
                        return false;
                    }
                    if item.depth() == 0 {
                        return true;
                    }
                    let rel = item.path().strip_prefix(source_root).unwrap_or(item.path());
                    !Self::is_excluded(exclude, rel)
                });
            for item in walk {
                let item = item.map_err(|e| {
                    let path = e.path().map(Path::to_path_buf).unwrap_or_default();
                    ArchiveError::Io {
                        path,
                        source: e.into(),
                    }
                })?;
                let abs = item.path();
                let rel = abs.strip_prefix(source_root).unwrap_or(abs);
                // The source root itself (an entry of ".") has no name in the archive.
                if rel.as_os_str().is_empty() {
                    continue;
                }
                append_path(&mut builder, abs, rel)?;
                count += 1;
            }
        }

        let encoder = builder.into_inner().map_err(io_at(dest))?;
        let mut writer = encoder.finish().map_err(io_at(dest))?;
        writer.flush().map_err(io_at(dest))?;
        drop(writer);

        let bytes = std::fs::metadata(dest).map_err(io_at(dest))?.len();
        info!(
            archive = %dest.display(),
            entries = count,
            bytes,
            compression = %profile,
            "Archive created"
        );
        Ok(ArchiveReport {
            path: dest.to_path_buf(),
            entries: count,
            bytes,
        })
    }

    fn restore_blocking(archive: &Path, dest_root: &Path) -> Result<(), ArchiveError> {
        std::fs::create_dir_all(dest_root).map_err(io_at(dest_root))?;
        let file = File::open(archive).map_err(io_at(archive))?;
        let mut tar = Archive::new(GzDecoder::new(BufReader::new(file)));
        tar.set_preserve_mtime(true);
        tar.set_preserve_permissions(true);
        tar.set_overwrite(true);

        // Directory entries are unpacked after their contents so restrictive
        // directory modes cannot block the files below them.
        let mut files = Vec::new();
        let mut dirs = Vec::new();
        let mut count = 0usize;
        for entry in tar.entries().map_err(io_at(archive))? {
            let mut entry = entry.map_err(io_at(archive))?;
            let kind = entry.header().entry_type();
            let exact = pax_mtime(&mut entry);
            let rel = entry.path().map_err(io_at(archive))?.into_owned();
            if kind == EntryType::Directory {
                dirs.push((entry, rel, exact));
                continue;
            }
            if !entry.unpack_in(dest_root).map_err(io_at(archive))? {
                warn!(entry = %rel.display(), "Archive entry escapes the destination, skipped");
                continue;
            }
            count += 1;
            if let Some(mtime) = exact
                && kind != EntryType::Symlink
                && kind != EntryType::Link
            {
                files.push((dest_root.join(&rel), mtime));
            }
        }
        for (path, mtime) in &files {
            set_mtime(path, *mtime);
        }

        // Deepest first, so a parent's mtime is set after its children exist.
        dirs.sort_by_key(|(_, rel, _)| std::cmp::Reverse(rel.components().count()));
        for (mut entry, rel, exact) in dirs {
            if !entry.unpack_in(dest_root).map_err(io_at(archive))? {
                warn!(entry = %rel.display(), "Archive entry escapes the destination, skipped");
                continue;
            }
            count += 1;
            if let Some(mtime) = exact {
                set_mtime(&dest_root.join(&rel), mtime);
            }
        }

        info!(
            archive = %archive.display(),
            dest = %dest_root.display(),
            entries = count,
            "Archive restored"
        );
        Ok(())
    }
}

/// Render a timestamp as a PAX time value: `<secs>.<nanos>`.
fn format_pax_time(time: SystemTime) -> Option<String> {
    let since = time.duration_since(UNIX_EPOCH).ok()?;
    Some(format!("{}.{:09}", since.as_secs(), since.subsec_nanos()))
}

/// Parse a non-negative PAX time value.
fn parse_pax_time(value: &str) -> Option<SystemTime> {
    let (secs, frac) = match value.split_once('.') {
        Some((secs, frac)) => (secs, frac),
        None => (value, ""),
    };
    let secs: u64 = secs.parse().ok()?;
    let mut nanos = 0u32;
    if !frac.is_empty() {
        let digits: String = frac.chars().take(9).collect();
        if !digits.chars().all(|c| c.is_ascii_digit()) {
            return None;
        }
        nanos = format!("{:0<9}", digits).parse().ok()?;
    }
    Some(UNIX_EPOCH + Duration::new(secs, nanos))
}

fn pax_mtime<R: Read>(entry: &mut tar::Entry<'_, R>) -> Option<SystemTime> {
    let extensions = entry.pax_extensions().ok()??;
    for extension in extensions.flatten() {
        if extension.key().ok() == Some(PAX_MTIME) {
            return extension.value().ok().and_then(parse_pax_time);
        }
    }
    None
}

fn set_mtime(path: &Path, mtime: SystemTime) {
    let result = File::open(path).and_then(|f| f.set_times(FileTimes::new().set_modified(mtime)));
    if let Err(e) = result {
        debug!(path = %path.display(), error = %e, "Could not reapply exact mtime");
    }
}

fn append_path<W: Write>(
    builder: &mut Builder<W>,
    abs: &Path,
    rel: &Path,
) -> Result<(), ArchiveError> {
    let meta = abs.symlink_metadata().map_err(io_at(abs))?;
    let mut header = Header::new_ustar();
    header.set_metadata_in_mode(&meta, HeaderMode::Complete);

    let file_type = meta.file_type();
    if (file_type.is_file() || file_type.is_dir())
        && let Some(mtime) = meta.modified().ok().and_then(format_pax_time)
    {
        builder
            .append_pax_extensions([(PAX_MTIME, mtime.as_bytes())])
            .map_err(io_at(abs))?;
    }

    if file_type.is_symlink() {
        let target = std::fs::read_link(abs).map_err(io_at(abs))?;
        header.set_entry_type(EntryType::Symlink);
        header.set_size(0);
        builder
            .append_link(&mut header, rel, &target)
            .map_err(io_at(abs))?;
    } else if file_type.is_dir() {
        header.set_size(0);
        builder
            .append_data(&mut header, rel, io::empty())
            .map_err(io_at(abs))?;
    } else if file_type.is_file() {
        let file = File::open(abs).map_err(io_at(abs))?;
        builder
            .append_data(&mut header, rel, BufReader::new(&file))
            .map_err(io_at(abs))?;
        // Reading bumped the access time; put the original back.
        if let Ok(atime) = meta.accessed()
            && let Err(e) = file.set_times(FileTimes::new().set_accessed(atime))
        {
            debug!(path = %abs.display(), error = %e, "Could not restore access time");
        }
    } else {
        debug!(path = %abs.display(), "Skipping special file");
    }
    Ok(())
}

fn io_at(path: &Path) -> impl FnOnce(io::Error) -> ArchiveError + '_ {
    move |source| ArchiveError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[async_trait]
impl ArchiveCodec for TarCodec {
    async fn create(
        &self,
        source_root: &Path,
        entries: &[PathBuf],
        dest: &Path,
        profile: CompressionProfile,
    ) -> Result<ArchiveReport, ArchiveError> {
        let source_root = source_root.to_path_buf();
        let entries = entries.to_vec();
        let exclude = self.exclude.clone();
        let dest = dest.to_path_buf();
        tokio::task::spawn_blocking(move || {
            Self::create_blocking(&source_root, &entries, &exclude, &dest, profile)
        })
        .await
        .map_err(|e| ArchiveError::Join(e.to_string()))?
    }

    async fn restore(&self, archive: &Path, dest_root: &Path) -> Result<(), ArchiveError> {
        let archive = archive.to_path_buf();
        let dest_root = dest_root.to_path_buf();
        tokio::task::spawn_blocking(move || Self::restore_blocking(&archive, &dest_root))
            .await
            .map_err(|e| ArchiveError::Join(e.to_string()))?
    }
}
