/// Archive decoding into an in-memory name table
///
/// The primary container is ZIP. The secondary format is a gzip-wrapped tar
/// stream; when the gzip layer itself cannot be decoded the bytes are read
/// as a bare tar stream before giving up. Every entry is read against the
/// configured per-entry and per-archive byte limits.
use crate::config::settings::ArchiveLimits;
use crate::config::types::ArchiveFormatError;
use flate2::read::GzDecoder;
use log::debug;
use std::collections::BTreeMap;
use std::io::{Cursor, Read};

/// Which container a table was decoded from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerKind {
    Zip,
    GzipTar,
    Tar,
}

/// Immutable name -> bytes table of one archive
#[derive(Debug, Clone)]
pub struct ArchiveTable {
    kind: ContainerKind,
    entries: BTreeMap<String, Vec<u8>>,
}

impl ArchiveTable {
    pub fn kind(&self) -> ContainerKind {
        self.kind
    }

    pub fn get(&self, name: &str) -> Option<&[u8]> {
        self.entries.get(normalize_name(name)).map(Vec::as_slice)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(normalize_name(name))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total decoded size in bytes.
    pub fn byte_size(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }
}

/// Entry names are stored without a leading '/'.
pub fn normalize_name(name: &str) -> &str {
    name.trim_start_matches('/')
}

/// Running total of decoded bytes for one container attempt
struct Budget {
    limits: ArchiveLimits,
    used: u64,
}

impl Budget {
    fn new(limits: ArchiveLimits) -> Self {
        Self { limits, used: 0 }
    }

    /// Read one entry whose header claims `declared` bytes. Neither the
    /// claim nor the stream may go past what the limits still allow.
    fn read<R: Read>(
        &mut self,
        name: &str,
        declared: u64,
        reader: R,
    ) -> Result<Vec<u8>, String> {
        let remaining = self.limits.max_archive_bytes.saturating_sub(self.used);
        let allowed = self.limits.max_entry_bytes.min(remaining);
        if declared > allowed {
            return Err(self.over_limit(name, remaining));
        }

        let mut data = Vec::with_capacity(declared as usize);
        reader
            .take(allowed + 1)
            .read_to_end(&mut data)
            .map_err(|e| format!("{}: {}", name, e))?;
        if data.len() as u64 > allowed {
            return Err(self.over_limit(name, remaining));
        }
        self.used += data.len() as u64;
        Ok(data)
    }

    fn over_limit(&self, name: &str, remaining: u64) -> String {
        if remaining < self.limits.max_entry_bytes {
            format!(
                "{} takes the archive past {} decoded bytes",
                name, self.limits.max_archive_bytes
            )
        } else {
            format!(
                "entry {} is larger than {} bytes",
                name, self.limits.max_entry_bytes
            )
        }
    }
}

/// Decode `bytes` (the archive fetched from `archive`) into a table.
pub fn decode(
    archive: &str,
    bytes: &[u8],
    limits: &ArchiveLimits,
) -> Result<ArchiveTable, ArchiveFormatError> {
    let primary = match decode_zip(bytes, Budget::new(*limits)) {
        Ok(entries) => {
            debug!("Decoded {} as zip ({} entries)", archive, entries.len());
            return Ok(ArchiveTable {
                kind: ContainerKind::Zip,
                entries,
            });
        }
        Err(e) => e,
    };

    let gzip_error = match decode_tar(GzDecoder::new(bytes), Budget::new(*limits)) {
        Ok(entries) if !entries.is_empty() => {
            debug!("Decoded {} as gzip tar ({} entries)", archive, entries.len());
            return Ok(ArchiveTable {
                kind: ContainerKind::GzipTar,
                entries,
            });
        }
        Ok(_) => "gzip stream holds no files".to_string(),
        Err(e) => e,
    };

    let tar_error = match decode_tar(bytes, Budget::new(*limits)) {
        Ok(entries) if !entries.is_empty() => {
            debug!("Decoded {} as tar ({} entries)", archive, entries.len());
            return Ok(ArchiveTable {
                kind: ContainerKind::Tar,
                entries,
            });
        }
        Ok(_) => "no files".to_string(),
        Err(e) => e,
    };

    Err(ArchiveFormatError {
        archive: archive.to_string(),
        primary,
        fallback: format!("{}; bare tar: {}", gzip_error, tar_error),
    })
}

fn decode_zip(bytes: &[u8], mut budget: Budget) -> Result<BTreeMap<String, Vec<u8>>, String> {
    let mut zip = zip::ZipArchive::new(Cursor::new(bytes)).map_err(|e| e.to_string())?;
    let mut entries = BTreeMap::new();
    for i in 0..zip.len() {
        let mut file = zip.by_index(i).map_err(|e| e.to_string())?;
        if file.is_dir() {
            continue;
        }
        let name = normalize_name(file.name()).to_string();
        let declared = file.size();
        let data = budget.read(&name, declared, &mut file)?;
        entries.insert(name, data);
    }
    Ok(entries)
}

fn decode_tar<R: Read>(
    reader: R,
    mut budget: Budget,
) -> Result<BTreeMap<String, Vec<u8>>, String> {
    let mut archive = tar::Archive::new(reader);
    let mut entries = BTreeMap::new();
    for entry in archive.entries().map_err(|e| e.to_string())? {
        let mut entry = entry.map_err(|e| e.to_string())?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let path = entry.path().map_err(|e| e.to_string())?;
        let name = path.to_string_lossy();
        let name = normalize_name(name.trim_start_matches("./")).to_string();
        let declared = entry.size();
        let data = budget.read(&name, declared, &mut entry)?;
        entries.insert(name, data);
    }
    Ok(entries)
}

#[cfg(test)]
pub(crate) mod test_archives {
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    pub fn zip_bytes(files: &[(&str, &str)]) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
        let options = zip::write::SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Deflated);
        for (name, data) in files {
            writer.start_file(*name, options).unwrap();
            writer.write_all(data.as_bytes()).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    pub fn tar_bytes(files: &[(&str, &str)]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (name, data) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, data.as_bytes()).unwrap();
        }
        builder.into_inner().unwrap()
    }

    /// Stored single-entry zip whose central directory defers the
    /// uncompressed size to a zip64 extra field claiming `declared` bytes.
    pub fn zip64_claiming(name: &str, data: &[u8], declared: u64) -> Vec<u8> {
        let mut crc = flate2::Crc::new();
        crc.update(data);
        let crc = crc.sum();

        let mut out = Vec::new();
        out.extend_from_slice(&0x0403_4b50u32.to_le_bytes());
        out.extend_from_slice(&45u16.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes()); // flags
        out.extend_from_slice(&0u16.to_le_bytes()); // stored
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(&0x21u16.to_le_bytes()); // 1980-01-01
        out.extend_from_slice(&crc.to_le_bytes());
        out.extend_from_slice(&(data.len() as u32).to_le_bytes());
        out.extend_from_slice(&(data.len() as u32).to_le_bytes());
        out.extend_from_slice(&(name.len() as u16).to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(data);

        let central_start = out.len();
        out.extend_from_slice(&0x0201_4b50u32.to_le_bytes());
        out.extend_from_slice(&45u16.to_le_bytes());
        out.extend_from_slice(&45u16.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(&0x21u16.to_le_bytes());
        out.extend_from_slice(&crc.to_le_bytes());
        out.extend_from_slice(&(data.len() as u32).to_le_bytes());
        out.extend_from_slice(&0xFFFF_FFFFu32.to_le_bytes());
        out.extend_from_slice(&(name.len() as u16).to_le_bytes());
        out.extend_from_slice(&12u16.to_le_bytes()); // extra field length
        out.extend_from_slice(&0u16.to_le_bytes()); // comment
        out.extend_from_slice(&0u16.to_le_bytes()); // disk
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes()); // local header offset
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(&0x0001u16.to_le_bytes());
        out.extend_from_slice(&8u16.to_le_bytes());
        out.extend_from_slice(&declared.to_le_bytes());
        let central_size = out.len() - central_start;

        out.extend_from_slice(&0x0605_4b50u32.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(&1u16.to_le_bytes());
        out.extend_from_slice(&1u16.to_le_bytes());
        out.extend_from_slice(&(central_size as u32).to_le_bytes());
        out.extend_from_slice(&(central_start as u32).to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        out
    }

    pub fn gzip(bytes: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(bytes).unwrap();
        encoder.finish().unwrap()
    }
}
