//! Online backup to, and restore from, a gzip-compressed tar stream.
//!
//! An archive holds the config file plus the records and index files of
//! every retained segment, all at the top level. The segment holding the
//! durable end is cut at that end, so restoring yields exactly the state
//! [`Log::stat`] reported when the backup started.

use crate::error::{Error, Result};
use crate::index::{self, ENTRY_SIZE};
use crate::log::{CONFIG_FILENAME, Log, LogInfo};
use crate::segment::{self, SegmentDescriptor, list_segments, sync_directory};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use log::{debug, info, warn};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Component, Path};
use std::time::{SystemTime, UNIX_EPOCH};

/// Retention may delete a segment between listing and opening it; retry
/// with a fresh checkpoint this many times.
const BACKUP_ATTEMPTS: usize = 3;

/// A file opened for backup together with the number of bytes to copy.
struct Member {
    name: String,
    file: File,
    len: u64,
}

impl Log {
    /// Write a consistent, compressed snapshot of the log to `out`.
    ///
    /// The writer may keep appending while the backup runs; the snapshot
    /// reflects the [`LogInfo`] current when the call started.
    pub fn backup<W: Write>(&self, out: W) -> Result<()> {
        let path = self.path();
        let mut attempt = 0;
        let (info, members) = loop {
            let info = self.stat();
            match collect_members(path, &info) {
                Ok(members) => break (info, members),
                Err(Error::OutOfRange) if attempt + 1 < BACKUP_ATTEMPTS => {
                    debug!("reclog: backup checkpoint of {} expired, retrying", path.display());
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        };

        write_archive(out, members)?;
        info!(
            "reclog: backed up {} (positions {}..{})",
            path.display(),
            info.start_position,
            info.end_position
        );
        Ok(())
    }

    /// Recreate a log at `path` from an archive produced by
    /// [`backup`](Log::backup). The directory must not exist.
    ///
    /// On failure the partially restored directory is removed.
    pub fn restore<R: Read>(path: impl AsRef<Path>, input: R) -> Result<()> {
        let path = path.as_ref();
        match fs::create_dir(path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                return Err(Error::AlreadyExists);
            }
            Err(e) => return Err(e.into()),
        }

        if let Err(e) = unpack(path, input) {
            warn!("reclog: restore into {} failed: {}", path.display(), e);
            let _ = fs::remove_dir_all(path);
            return Err(e);
        }

        info!("reclog: restored log into {}", path.display());
        Ok(())
    }
}

/// Open every file that belongs to the snapshot of `info`.
fn collect_members(dir: &Path, info: &LogInfo) -> Result<Vec<Member>> {
    let segments: Vec<SegmentDescriptor> = list_segments(dir)?
        .into_iter()
        .filter(|d| d.base_position >= info.start_position)
        .filter(|d| d.base_position < info.end_position || d.base_position == info.start_position)
        .collect();
    match segments.first() {
        Some(first) if first.base_position == info.start_position => {}
        _ => return Err(Error::OutOfRange),
    }

    let mut members = vec![open_member(dir, CONFIG_FILENAME, None)?];
    let last = segments.len() - 1;
    for (i, desc) in segments.iter().enumerate() {
        if i < last {
            members.push(open_member(dir, &desc.records_file(), None)?);
            members.push(open_member(dir, &desc.index_file(), None)?);
            continue;
        }

        let records_len = info.end_offset.saturating_sub(desc.base_offset);
        members.push(open_member(dir, &desc.records_file(), Some(records_len))?);

        let mut index_file = match File::open(dir.join(desc.index_file())) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(Error::OutOfRange),
            Err(e) => return Err(e.into()),
        };
        let kept = index::read_entries(&mut index_file)?
            .iter()
            .take_while(|e| e.position < info.end_position)
            .count();
        let index_len = (kept * ENTRY_SIZE) as u64;
        members.push(open_member(dir, &desc.index_file(), Some(index_len))?);
    }
    Ok(members)
}

fn open_member(dir: &Path, name: &str, len: Option<u64>) -> Result<Member> {
    let file = match File::open(dir.join(name)) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(Error::OutOfRange),
        Err(e) => return Err(e.into()),
    };
    let available = file.metadata()?.len();
    let len = match len {
        Some(len) if len > available => {
            return Err(Error::Corrupt(format!(
                "{name} holds {available} bytes, expected at least {len}"
            )));
        }
        Some(len) => len,
        None => available,
    };
    Ok(Member {
        name: name.to_string(),
        file,
        len,
    })
}

fn write_archive<W: Write>(out: W, members: Vec<Member>) -> Result<()> {
    let mtime = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);

    let mut archive = tar::Builder::new(GzEncoder::new(out, Compression::default()));
    for member in members {
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Regular);
        header.set_size(member.len);
        header.set_mode(0o644);
        header.set_mtime(mtime);
        archive.append_data(&mut header, &member.name, member.file.take(member.len))?;
    }
    archive.into_inner()?.finish()?;
    Ok(())
}

fn unpack<R: Read>(dir: &Path, input: R) -> Result<()> {
    let mut archive = tar::Archive::new(GzDecoder::new(input));
    for entry in archive.entries()? {
        let mut entry = entry?;
        let entry_path = entry.path()?.into_owned();
        let name = member_name(&entry_path)
            .ok_or_else(|| Error::Corrupt(format!("unexpected archive entry {}", entry_path.display())))?;

        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(dir.join(&name))?;
        io::copy(&mut entry, &mut file)?;
        file.sync_all()?;
    }

    if !dir.join(CONFIG_FILENAME).exists() {
        return Err(Error::Corrupt("archive has no config file".to_string()));
    }
    sync_directory(dir)?;
    if let Some(parent) = dir.parent().filter(|p| !p.as_os_str().is_empty()) {
        sync_directory(parent)?;
    }
    Ok(())
}

/// Accept only flat names of files a log directory holds.
fn member_name(path: &Path) -> Option<String> {
    let mut components = path.components();
    let name = match (components.next(), components.next()) {
        (Some(Component::Normal(name)), None) => name.to_str()?,
        _ => return None,
    };
    let is_segment_file = [segment::RECORDS_SUFFIX, segment::INDEX_SUFFIX]
        .iter()
        .any(|suffix| {
            name.strip_suffix(suffix)
                .is_some_and(|stem| segment::parse_segment_name(stem).is_some())
        });
    (name == CONFIG_FILENAME || is_segment_file).then(|| name.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn member_names_are_flat_log_files() {
        let seg = segment::segment_name(0, 0, 0);
        assert_eq!(member_name(Path::new("config")).as_deref(), Some("config"));
        assert!(member_name(Path::new(&format!("{seg}.records"))).is_some());
        assert!(member_name(Path::new(&format!("{seg}.index"))).is_some());
        assert!(member_name(Path::new("../config")).is_none());
        assert!(member_name(Path::new("/etc/passwd")).is_none());
        assert!(member_name(Path::new(&format!("nested/{seg}.records"))).is_none());
        assert!(member_name(Path::new("lock")).is_none());
    }
}
