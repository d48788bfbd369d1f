//! FIT files wrapped in zip archives
//!
//! Account exports and the activity download endpoint both hand out the
//! original FIT file inside a zip.

use std::fs::File;
use std::io::{Cursor, Read, Seek};
use std::path::Path;

use crate::error::{IngestError, Result};

const ZIP_MAGIC: &[u8] = b"PK\x03\x04";

/// Largest entry we are willing to inflate; real activity files stay far below
pub const MAX_ENTRY_BYTES: u64 = 128 * 1024 * 1024;

/// Preallocation cap; the declared size of an entry is not trusted
const PREALLOC_LIMIT: u64 = 4 * 1024 * 1024;

pub fn is_zip(bytes: &[u8]) -> bool {
    bytes.starts_with(ZIP_MAGIC)
}

/// Sniff the zip signature without reading the whole file
pub fn is_zip_file(path: &Path) -> Result<bool> {
    let mut magic = [0u8; 4];
    let mut file = File::open(path)?;
    let mut read = 0;
    while read < magic.len() {
        match file.read(&mut magic[read..])? {
            0 => break,
            n => read += n,
        }
    }
    Ok(is_zip(&magic[..read]))
}

pub fn is_fit_name(name: &str) -> bool {
    name.to_ascii_lowercase().ends_with(".fit")
}

fn open_archive<R: Read + Seek>(reader: R) -> Result<zip::ZipArchive<R>> {
    zip::ZipArchive::new(reader).map_err(|e| IngestError::decode(format!("unreadable zip archive: {}", e)))
}

/// Read one entry, rejecting anything that inflates past `limit`
fn read_entry(entry: &mut zip::read::ZipFile<'_, impl Read>, name: &str, limit: u64) -> Result<Vec<u8>> {
    let mut data = Vec::with_capacity(entry.size().min(limit).min(PREALLOC_LIMIT) as usize);
    entry
        .take(limit + 1)
        .read_to_end(&mut data)
        .map_err(|e| IngestError::decode(format!("{}: {}", name, e)))?;
    if data.len() as u64 > limit {
        return Err(IngestError::decode(format!("{}: entry exceeds {} bytes", name, limit)));
    }
    Ok(data)
}

/// Names of the `.fit` entries, in archive order
pub fn fit_entry_names<R: Read + Seek>(reader: R) -> Result<Vec<String>> {
    let archive = open_archive(reader)?;
    Ok(archive
        .file_names()
        .filter(|name| is_fit_name(name))
        .map(|name| name.to_string())
        .collect())
}

/// Contents of one named entry
pub fn read_fit_entry<R: Read + Seek>(reader: R, name: &str) -> Result<Vec<u8>> {
    let mut archive = open_archive(reader)?;
    let mut entry = archive
        .by_name(name)
        .map_err(|e| IngestError::decode(format!("corrupt zip entry {}: {}", name, e)))?;
    read_entry(&mut entry, name, MAX_ENTRY_BYTES)
}

/// Every `.fit` entry of an in-memory archive as (entry name, bytes), in archive order
pub fn fit_entries(bytes: &[u8]) -> Result<Vec<(String, Vec<u8>)>> {
    let mut archive = open_archive(Cursor::new(bytes))?;

    let mut entries = Vec::new();
    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|e| IngestError::decode(format!("corrupt zip entry {}: {}", i, e)))?;
        let name = entry.name().to_string();
        if !is_fit_name(&name) {
            continue;
        }
        let data = read_entry(&mut entry, &name, MAX_ENTRY_BYTES)?;
        entries.push((name, data));
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn build_zip(files: &[(&str, &[u8])]) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        let options = zip::write::SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Deflated);
        for (name, data) in files {
            writer.start_file(*name, options).unwrap();
            writer.write_all(data).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    #[test]
    fn test_extracts_only_fit_entries() {
        let bytes = build_zip(&[("a/123_ACTIVITY.FIT", b"one"), ("notes.txt", b"x"), ("b.fit", b"two")]);
        assert!(is_zip(&bytes));
        let entries = fit_entries(&bytes).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0], ("a/123_ACTIVITY.FIT".to_string(), b"one".to_vec()));
        assert_eq!(entries[1].1, b"two".to_vec());
    }

    #[test]
    fn test_garbage_is_decode_error() {
        assert!(!is_zip(b"hello"));
        assert!(matches!(fit_entries(b"hello"), Err(IngestError::Decode(_))));
    }

    #[test]
    fn test_oversized_entry_is_rejected() {
        // Highly compressible, so the declared and inflated sizes dwarf the archive
        let bytes = build_zip(&[("big.fit", &[0u8; 4096])]);
        let mut archive = open_archive(Cursor::new(bytes.as_slice())).unwrap();
        let mut entry = archive.by_index(0).unwrap();
        let err = read_entry(&mut entry, "big.fit", 1024).unwrap_err();
        assert!(matches!(err, IngestError::Decode(ref m) if m.contains("exceeds 1024 bytes")));
    }

    #[test]
    fn test_entry_at_limit_is_accepted() {
        let bytes = build_zip(&[("ok.fit", &[7u8; 1024])]);
        let mut archive = open_archive(Cursor::new(bytes.as_slice())).unwrap();
        let mut entry = archive.by_index(0).unwrap();
        assert_eq!(read_entry(&mut entry, "ok.fit", 1024).unwrap().len(), 1024);
    }

    #[test]
    fn test_entries_read_lazily_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("export.zip");
        std::fs::write(&path, build_zip(&[("x.txt", b"no"), ("b.fit", b"two"), ("a.FIT", b"one")])).unwrap();

        assert!(is_zip_file(&path).unwrap());
        let names = fit_entry_names(File::open(&path).unwrap()).unwrap();
        assert_eq!(names, vec!["b.fit".to_string(), "a.FIT".to_string()]);
        assert_eq!(read_fit_entry(File::open(&path).unwrap(), "a.FIT").unwrap(), b"one".to_vec());
    }
}
