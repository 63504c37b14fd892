use crc32fast::Hasher as Crc32;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Component, Path};
use zip::read::ZipArchive;

/// Result alias for APK (ZIP) operations.
pub type ApkZipResult<T> = Result<T, ApkZipError>;

/// Errors surfaced by the APK container.
#[derive(Debug, thiserror::Error)]
pub enum ApkZipError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("ZIP error: {0}")]
    Zip(#[from] zip::result::ZipError),
    #[error("entry '{0}' not found in archive")]
    MissingEntry(String),
    #[error("{0}")]
    InvalidInput(String),
}

/// Compression preference for an APK entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApkCompression {
    Stored,
    Deflated,
}

/// A single file entry stored in [`ApkFile`].
#[derive(Clone, Debug)]
pub struct ApkEntry {
    pub data: Vec<u8>,
    pub unix_mode: Option<u32>,
    pub compression: Option<ApkCompression>,
}

impl ApkEntry {
    pub fn new(data: Vec<u8>) -> Self {
        ApkEntry {
            data,
            unix_mode: None,
            compression: None,
        }
    }

    pub fn with_mode(mut self, mode: Option<u32>) -> Self {
        self.unix_mode = mode;
        self
    }

    pub fn with_compression(mut self, compression: Option<ApkCompression>) -> Self {
        self.compression = compression;
        self
    }
}

/// An in-memory representation of an APK (ZIP) file.
///
/// Entries keep the order they had in the source archive; entries added later are appended.
/// Nothing touches the disk until [`ApkFile::to_bytes`] or [`ApkFile::write_to_file`].
pub struct ApkFile {
    entries: BTreeMap<String, ApkEntry>,
    order: Vec<String>,
}

impl Default for ApkFile {
    fn default() -> Self {
        Self::new()
    }
}

impl ApkFile {
    pub fn new() -> Self {
        ApkFile {
            entries: BTreeMap::new(),
            order: Vec::new(),
        }
    }

    /// Load an APK from disk into memory.
    pub fn from_file(path: impl AsRef<Path>) -> ApkZipResult<Self> {
        let file = File::open(path.as_ref())?;
        let mut archive = ZipArchive::new(file)?;
        let mut apk = ApkFile::new();
        for idx in 0..archive.len() {
            let mut entry = archive.by_index(idx)?;
            if entry.is_dir() {
                continue;
            }
            // Names are opaque keys here; only names this crate creates get normalized.
            let name = entry.name().to_string();
            let mut data = Vec::with_capacity(entry.size() as usize);
            entry.read_to_end(&mut data)?;
            let compression = match entry.compression() {
                zip::CompressionMethod::Stored => Some(ApkCompression::Stored),
                zip::CompressionMethod::Deflated => Some(ApkCompression::Deflated),
                _ => None,
            };
            let apk_entry = ApkEntry::new(data)
                .with_mode(entry.unix_mode())
                .with_compression(compression);
            apk.insert(name, apk_entry);
        }
        Ok(apk)
    }

    /// Serialize the archive, entries in their recorded order.
    pub fn to_bytes(&self) -> ApkZipResult<Vec<u8>> {
        let mut buffer = Vec::new();
        let mut central_records = Vec::new();

        for name in &self.order {
            let entry = &self.entries[name];
            let plan = plan_entry(name, entry);
            let record = write_local_entry(&mut buffer, name, entry, &plan)?;
            central_records.push(record);
        }

        let central_start = offset_u32(buffer.len())?;
        for record in &central_records {
            write_central_directory_entry(&mut buffer, record);
        }
        let central_size = offset_u32(buffer.len())? - central_start;
        if central_records.len() > u16::MAX as usize {
            return Err(ApkZipError::InvalidInput(
                "too many entries for a non-ZIP64 archive".to_string(),
            ));
        }
        write_end_of_central_directory(
            &mut buffer,
            central_records.len(),
            central_size,
            central_start,
        );
        Ok(buffer)
    }

    /// Serialize the in-memory APK back to disk as a ZIP/APK file.
    pub fn write_to_file(&self, path: impl AsRef<Path>) -> ApkZipResult<()> {
        let bytes = self.to_bytes()?;
        fs::write(path, bytes)?;
        Ok(())
    }

    /// Iterate over entry names in archive order.
    pub fn entry_names(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(|s| s.as_str())
    }

    /// Borrow an entry by name (e.g., `classes.dex`).
    pub fn entry(&self, name: &str) -> Option<&ApkEntry> {
        self.entries.get(name)
    }

    /// Copy out the uncompressed contents of an entry.
    pub fn read_entry(&self, name: &str) -> ApkZipResult<Vec<u8>> {
        self.entries
            .get(name)
            .map(|entry| entry.data.clone())
            .ok_or_else(|| ApkZipError::MissingEntry(name.to_string()))
    }

    /// Replace the contents of an entry (or add a new entry), keeping the existing
    /// entry's mode and compression.
    pub fn replace_entry(&mut self, name: impl AsRef<str>, data: Vec<u8>) -> ApkZipResult<()> {
        let normalized = normalize_entry_name(name.as_ref())?;
        let entry = match self.entries.get(&normalized) {
            Some(existing) => ApkEntry::new(data)
                .with_mode(existing.unix_mode)
                .with_compression(existing.compression),
            None => ApkEntry::new(data),
        };
        self.insert(normalized, entry);
        Ok(())
    }

    /// Add or overwrite an entry with an explicit compression method.
    pub fn write_entry(
        &mut self,
        name: impl AsRef<str>,
        data: Vec<u8>,
        compression: ApkCompression,
    ) -> ApkZipResult<()> {
        let normalized = normalize_entry_name(name.as_ref())?;
        let mode = self.entries.get(&normalized).and_then(|entry| entry.unix_mode);
        self.insert(
            normalized,
            ApkEntry::new(data)
                .with_mode(mode)
                .with_compression(Some(compression)),
        );
        Ok(())
    }

    /// Remove an entry by name.
    pub fn remove_entry(&mut self, name: &str) -> bool {
        if self.entries.remove(name).is_some() {
            self.order.retain(|entry| entry != name);
            true
        } else {
            false
        }
    }

    /// Drop v1 (JAR) signature files that re-signing would invalidate.
    pub fn strip_signature_entries(&mut self) -> Vec<String> {
        let stale: Vec<String> = self
            .order
            .iter()
            .filter(|name| is_signature_entry(name))
            .cloned()
            .collect();
        for name in &stale {
            self.remove_entry(name);
        }
        stale
    }

    pub(crate) fn insert(&mut self, name: String, entry: ApkEntry) {
        if self.entries.insert(name.clone(), entry).is_none() {
            self.order.push(name);
        }
    }
}

fn is_signature_entry(name: &str) -> bool {
    let upper = name.to_ascii_uppercase();
    let Some(file) = upper.strip_prefix("META-INF/") else {
        return false;
    };
    if file.contains('/') {
        return false;
    }
    file == "MANIFEST.MF"
        || [".SF", ".RSA", ".DSA", ".EC"]
            .iter()
            .any(|ext| file.ends_with(ext))
}

/// Regular file (`S_IFREG`), rw-r--r--.
const DEFAULT_UNIX_MODE: u32 = 0o100644;

#[derive(Clone, Copy)]
struct EntryPlan {
    compression: ApkCompression,
    alignment: Option<u32>,
}

#[derive(Clone)]
struct CentralDirectoryRecord {
    file_name: Vec<u8>,
    compression: ApkCompression,
    crc32: u32,
    compressed_size: u32,
    uncompressed_size: u32,
    local_header_offset: u32,
    external_attrs: u32,
}

fn offset_u32(value: usize) -> ApkZipResult<u32> {
    u32::try_from(value).map_err(|_| {
        ApkZipError::InvalidInput("archive exceeds 4 GiB; ZIP64 is not supported".to_string())
    })
}

fn plan_entry(name: &str, entry: &ApkEntry) -> EntryPlan {
    let mut plan = classify_entry(name);
    if let Some(preferred) = entry.compression {
        plan.compression = preferred;
    }
    match plan.compression {
        ApkCompression::Deflated => plan.alignment = None,
        ApkCompression::Stored if plan.alignment.is_none() => plan.alignment = Some(4),
        ApkCompression::Stored => {}
    }
    plan
}

fn write_local_entry(
    buf: &mut Vec<u8>,
    name: &str,
    entry: &ApkEntry,
    plan: &EntryPlan,
) -> ApkZipResult<CentralDirectoryRecord> {
    let name_len = u16::try_from(name.len()).map_err(|_| {
        ApkZipError::InvalidInput(format!("entry name longer than 65535 bytes: {name:.64}..."))
    })?;
    let offset = offset_u32(buf.len())?;
    let extra_len = match plan.alignment {
        Some(align) => alignment_padding(offset, name.len(), align),
        None => 0,
    };

    let (compressed_bytes, compression_method) = match plan.compression {
        ApkCompression::Stored => (entry.data.clone(), 0u16),
        ApkCompression::Deflated => (deflate_bytes(&entry.data)?, 8u16),
    };
    let compressed_size = offset_u32(compressed_bytes.len())?;
    let uncompressed_size = offset_u32(entry.data.len())?;

    let mut crc = Crc32::new();
    crc.update(&entry.data);
    let crc32 = crc.finalize();

    write_u32(buf, 0x04034b50);
    write_u16(buf, 20);
    write_u16(buf, 0);
    write_u16(buf, compression_method);
    write_u16(buf, 0);
    write_u16(buf, 0);
    write_u32(buf, crc32);
    write_u32(buf, compressed_size);
    write_u32(buf, uncompressed_size);
    write_u16(buf, name_len);
    write_u16(buf, extra_len as u16);
    buf.extend_from_slice(name.as_bytes());
    buf.extend(std::iter::repeat(0u8).take(extra_len as usize));
    buf.extend_from_slice(&compressed_bytes);

    Ok(CentralDirectoryRecord {
        file_name: name.as_bytes().to_vec(),
        compression: plan.compression,
        crc32,
        compressed_size,
        uncompressed_size,
        local_header_offset: offset,
        external_attrs: entry.unix_mode.unwrap_or(DEFAULT_UNIX_MODE) << 16,
    })
}

fn write_central_directory_entry(buf: &mut Vec<u8>, record: &CentralDirectoryRecord) {
    write_u32(buf, 0x02014b50);
    write_u16(buf, 0x031E);
    write_u16(buf, 20);
    write_u16(buf, 0);
    let method = match record.compression {
        ApkCompression::Stored => 0u16,
        ApkCompression::Deflated => 8u16,
    };
    write_u16(buf, method);
    write_u16(buf, 0);
    write_u16(buf, 0);
    write_u32(buf, record.crc32);
    write_u32(buf, record.compressed_size);
    write_u32(buf, record.uncompressed_size);
    write_u16(buf, record.file_name.len() as u16);
    write_u16(buf, 0);
    write_u16(buf, 0);
    write_u16(buf, 0);
    write_u16(buf, 0);
    write_u32(buf, record.external_attrs);
    write_u32(buf, record.local_header_offset);
    buf.extend_from_slice(&record.file_name);
}

fn write_end_of_central_directory(
    buf: &mut Vec<u8>,
    entry_count: usize,
    central_size: u32,
    central_offset: u32,
) {
    write_u32(buf, 0x06054b50);
    write_u16(buf, 0);
    write_u16(buf, 0);
    write_u16(buf, entry_count as u16);
    write_u16(buf, entry_count as u16);
    write_u32(buf, central_size);
    write_u32(buf, central_offset);
    write_u16(buf, 0);
}

fn deflate_bytes(data: &[u8]) -> ApkZipResult<Vec<u8>> {
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::best());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

fn path_to_entry_name(path: &Path) -> ApkZipResult<String> {
    let mut components = Vec::new();
    for comp in path.components() {
        match comp {
            Component::Normal(part) => components.push(part.to_string_lossy().replace('\\', "/")),
            Component::CurDir => {}
            Component::RootDir | Component::Prefix(_) => {
                return Err(ApkZipError::InvalidInput(format!(
                    "invalid entry path component in {}",
                    path.display()
                )));
            }
            Component::ParentDir => {
                return Err(ApkZipError::InvalidInput(
                    "entry paths may not contain parent components".to_string(),
                ));
            }
        }
    }
    if components.is_empty() {
        return Err(ApkZipError::InvalidInput(
            "entry name must not be empty".to_string(),
        ));
    }
    Ok(components.join("/"))
}

fn normalize_entry_name(name: &str) -> ApkZipResult<String> {
    path_to_entry_name(Path::new(name))
}

fn write_u16(buf: &mut Vec<u8>, value: u16) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn write_u32(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn alignment_padding(offset: u32, name_len: usize, alignment: u32) -> u32 {
    if alignment <= 1 {
        return 0;
    }
    let base = offset as u64 + 30 + name_len as u64;
    let align = alignment as u64;
    ((align - (base % align)) % align) as u32
}

fn classify_entry(name: &str) -> EntryPlan {
    let lower = name.to_ascii_lowercase();
    let compression = if should_store_uncompressed(&lower) {
        ApkCompression::Stored
    } else {
        ApkCompression::Deflated
    };
    let alignment = if compression == ApkCompression::Stored {
        if lower.starts_with("lib/") && lower.ends_with(".so") {
            Some(16 * 1024)
        } else {
            Some(4)
        }
    } else {
        None
    };
    EntryPlan {
        compression,
        alignment,
    }
}

fn should_store_uncompressed(name: &str) -> bool {
    name.ends_with(".arsc")
        || name.ends_with(".so")
        || matches!(
            name.rsplit('.').next(),
            Some(
                "png" | "jpg" | "jpeg" | "gif" | "webp" | "mp3" | "ogg" | "wav" | "aac" | "m4a"
                    | "mp4" | "webm"
            )
        )
}
