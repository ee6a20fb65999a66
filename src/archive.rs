//! Zip container for protected objects
//!
//! `manifest.json` holds the object with chunk ciphertexts stripped;
//! `0.payload` holds the ciphertexts back to back. On read the payload is
//! split again by each chunk's `encryptedSize`.

use crate::manifest::ProtectedObject;
use std::fs::File;
use std::io::{self, Cursor, Read, Seek, Write};
use std::path::Path;
use zip::write::FileOptions;
use zip::{ZipArchive, ZipWriter};

const MANIFEST_ENTRY: &str = "manifest.json";
const PAYLOAD_ENTRY: &str = "0.payload";

#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("ZIP error: {0}")]
    ZipError(#[from] zip::result::ZipError),
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
    #[error("Invalid archive structure: {0}")]
    Structure(String),
}

impl ArchiveError {
    pub fn error_code(&self) -> &'static str {
        match self {
            ArchiveError::ZipError(_) => "CTDF_E_ARCHIVE_ZIP",
            ArchiveError::JsonError(_) => "CTDF_E_ARCHIVE_JSON",
            ArchiveError::IoError(_) => "CTDF_E_ARCHIVE_IO",
            ArchiveError::Structure(_) => "CTDF_E_ARCHIVE_STRUCTURE",
        }
    }
}

/// Read side of the container
pub struct ObjectArchive<R: Read + Seek> {
    zip_archive: ZipArchive<R>,
}

impl ObjectArchive<File> {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, ArchiveError> {
        let file = File::open(path)?;
        Self::new(file)
    }
}

impl ObjectArchive<Cursor<Vec<u8>>> {
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self, ArchiveError> {
        Self::new(Cursor::new(bytes))
    }
}

impl<R: Read + Seek> ObjectArchive<R> {
    pub fn new(reader: R) -> Result<Self, ArchiveError> {
        let zip_archive = ZipArchive::new(reader)?;
        Ok(Self { zip_archive })
    }

    /// Reassemble the protected object
    ///
    /// Structural problems are reported here; hash verification is left to
    /// [`ProtectedObject::verify`].
    pub fn read_object(&mut self) -> Result<ProtectedObject, ArchiveError> {
        let mut object = {
            let mut manifest_file = self.zip_archive.by_name(MANIFEST_ENTRY).map_err(|_| {
                ArchiveError::Structure(format!("Missing manifest file: {}", MANIFEST_ENTRY))
            })?;
            let mut contents = String::new();
            manifest_file.read_to_string(&mut contents)?;
            ProtectedObject::from_json(&contents)?
        };

        let payload = {
            let mut payload_file = self.zip_archive.by_name(PAYLOAD_ENTRY).map_err(|_| {
                ArchiveError::Structure(format!("Missing payload file: {}", PAYLOAD_ENTRY))
            })?;
            let mut payload = Vec::new();
            payload_file.read_to_end(&mut payload)?;
            payload
        };

        let mut offset = 0usize;
        for chunk in object.payload.chunks.iter_mut() {
            let len = usize::try_from(chunk.encrypted_size).map_err(|_| {
                ArchiveError::Structure(format!("chunk {} size overflows", chunk.index))
            })?;
            let end = offset.checked_add(len).filter(|end| *end <= payload.len()).ok_or_else(|| {
                ArchiveError::Structure(format!(
                    "payload truncated at chunk {} ({} bytes available)",
                    chunk.index,
                    payload.len()
                ))
            })?;
            chunk.ciphertext = payload[offset..end].to_vec();
            offset = end;
        }
        if offset != payload.len() {
            return Err(ArchiveError::Structure(format!(
                "{} trailing payload bytes",
                payload.len() - offset
            )));
        }
        Ok(object)
    }
}

/// Write side of the container
pub struct ObjectArchiveBuilder<W: Write + Seek> {
    writer: ZipWriter<W>,
}

impl ObjectArchiveBuilder<File> {
    pub fn create<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = File::create(path)?;
        Ok(Self::new(file))
    }
}

impl<W: Write + Seek> ObjectArchiveBuilder<W> {
    pub fn new(inner: W) -> Self {
        Self {
            writer: ZipWriter::new(inner),
        }
    }

    pub fn write_object(&mut self, object: &ProtectedObject) -> Result<(), ArchiveError> {
        let mut stripped = object.clone();
        for chunk in stripped.payload.chunks.iter_mut() {
            chunk.ciphertext.clear();
        }
        let manifest_json = stripped.to_json()?;

        self.writer.start_file::<_, ()>(
            MANIFEST_ENTRY,
            FileOptions::default().compression_method(zip::CompressionMethod::Stored),
        )?;
        self.writer.write_all(manifest_json.as_bytes())?;

        self.writer.start_file::<_, ()>(
            PAYLOAD_ENTRY,
            FileOptions::default().compression_method(zip::CompressionMethod::Stored),
        )?;
        for chunk in &object.payload.chunks {
            self.writer.write_all(&chunk.ciphertext)?;
        }
        Ok(())
    }

    pub fn finish(self) -> Result<W, ArchiveError> {
        Ok(self.writer.finish()?)
    }
}

impl ProtectedObject {
    /// Serialize into an in-memory zip container
    pub fn to_archive_bytes(&self) -> Result<Vec<u8>, ArchiveError> {
        let mut builder = ObjectArchiveBuilder::new(Cursor::new(Vec::new()));
        builder.write_object(self)?;
        Ok(builder.finish()?.into_inner())
    }

    pub fn from_archive_bytes(bytes: Vec<u8>) -> Result<Self, ArchiveError> {
        ObjectArchive::from_bytes(bytes)?.read_object()
    }

    pub fn write_archive<P: AsRef<Path>>(&self, path: P) -> Result<(), ArchiveError> {
        let mut builder = ObjectArchiveBuilder::create(path)?;
        builder.write_object(self)?;
        builder.finish()?;
        Ok(())
    }

    pub fn read_archive<P: AsRef<Path>>(path: P) -> Result<Self, ArchiveError> {
        ObjectArchive::open(path)?.read_object()
    }
}
