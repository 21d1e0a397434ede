//! Filesystem storage for recorded streams.
//!
//! Layout under the configured root:
//!
//! ```text
//! <root>/
//!   temporary/          staging area, purged and recreated on startup
//!   files/
//!     default           text file holding the default display name
//!     <id>.protostream/ one directory per stream
//! ```
//!
//! Display names are trimmed; stream IDs escape every character outside
//! ASCII letters and digits as `_<hex>_`, so arbitrary display names map to
//! safe directory names. The default-name file is written via a temp file
//! and rename so an interrupted write leaves the previous default intact.

use crate::error::{Error, Result};
use crate::streamfile::{
    self, Compression, Metadata, StreamConfig, StreamReader, StreamWriter, STREAM_EXT,
};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

const TEMP_DIR: &str = "temporary";
const FILE_DIR: &str = "files";
const DEFAULT_FILE: &str = "default";

/// A stored stream as returned by [`Storage::list_files`].
#[derive(Debug, Clone)]
pub struct StoredFile {
    pub display_name: String,
    pub id: String,
    pub path: PathBuf,
    /// On-disk size in bytes.
    pub size: u64,
    pub metadata: Metadata,
}

/// Manages the storage root. Assumes exclusive ownership of everything under
/// it.
pub struct Storage {
    root: PathBuf,
    temp_dir: PathBuf,
    file_dir: PathBuf,
    default_path: PathBuf,
    compression: Compression,
}

impl Storage {
    pub fn new(root: PathBuf, compression: Compression) -> Self {
        let temp_dir = root.join(TEMP_DIR);
        let file_dir = root.join(FILE_DIR);
        let default_path = file_dir.join(DEFAULT_FILE);
        Self {
            root,
            temp_dir,
            file_dir,
            default_path,
            compression,
        }
    }

    /// Initialize the storage filesystem: create directories, purge stale
    /// temporary files, and report invalid entries left in `files/`.
    pub fn prepare(&self) -> Result<()> {
        fs::create_dir_all(&self.root)?;

        if self.temp_dir.exists() {
            log::debug!("removing temporary directory {:?}", self.temp_dir);
            fs::remove_dir_all(&self.temp_dir)?;
        }
        fs::create_dir_all(&self.temp_dir)?;
        fs::create_dir_all(&self.file_dir)?;

        for entry in fs::read_dir(&self.file_dir)? {
            let entry = entry?;
            let path = entry.path();
            if path == self.default_path {
                continue;
            }
            if streamfile::validate(&path).is_err() {
                log::warn!("file {:?} is out of place or invalid", path);
            }
        }

        log::debug!("storage is set up at {:?}", self.root);
        Ok(())
    }

    /// Set the default file name. An empty name clears the default. The name
    /// does not have to refer to an existing stream.
    pub fn set_default(&self, name: &str) -> Result<()> {
        if name.is_empty() {
            match fs::remove_file(&self.default_path) {
                Ok(()) => return Ok(()),
                Err(ref e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
                Err(e) => return Err(e.into()),
            }
        }

        let name = sanitize_display_name(name);
        let tmp_path = self.temp_dir.join(DEFAULT_FILE);
        {
            let mut file = fs::File::create(&tmp_path)?;
            file.write_all(name.as_bytes())?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, &self.default_path)?;
        Ok(())
    }

    /// The current default file name; empty when unset.
    pub fn get_default(&self) -> Result<String> {
        match fs::read_to_string(&self.default_path) {
            Ok(content) => Ok(content),
            Err(ref e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// List all stored streams, skipping unreadable entries.
    pub fn list_files(&self) -> Result<Vec<StoredFile>> {
        let mut files = Vec::new();
        for entry in fs::read_dir(&self.file_dir)? {
            let entry = entry?;
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }

            let name = entry.file_name();
            let name = name.to_string_lossy();
            let id = match name.strip_suffix(STREAM_EXT) {
                Some(id) => id.to_string(),
                None => continue,
            };

            match streamfile::load_metadata_and_size(&path) {
                Ok((metadata, size)) => files.push(StoredFile {
                    display_name: metadata.name.clone(),
                    id,
                    path,
                    size,
                    metadata,
                }),
                Err(e) => {
                    log::debug!("ignoring invalid file {:?}: {}", path, e);
                }
            }
        }
        Ok(files)
    }

    /// Open a writer for a stream with the given display name. The stream is
    /// committed when the writer closes.
    pub fn open_writer(&self, name: &str) -> Result<StreamWriter> {
        let name = sanitize_display_name(name);
        if name.is_empty() {
            return Err(Error::InvalidInput("empty file name".to_string()));
        }
        StreamWriter::create(&self.stream_config(), self.path_for_name(&name), &name)
    }

    /// Open a reader for a stored stream.
    pub fn open_reader(&self, name: &str) -> Result<StreamReader> {
        let name = sanitize_display_name(name);
        let path = self.path_for_name(&name);
        if !path.exists() {
            return Err(Error::NotFound(name));
        }
        StreamReader::open(&path)
    }

    /// Delete a stream by display name; deleting a missing stream succeeds.
    pub fn delete_file(&self, name: &str) -> Result<()> {
        let name = sanitize_display_name(name);
        streamfile::delete(&self.path_for_name(&name))
    }

    /// Merge `srcs` (in order) into a new stream named `dest`.
    pub fn merge_files(&self, dest: &str, srcs: &[String]) -> Result<()> {
        let dest = sanitize_display_name(dest);
        if dest.is_empty() {
            return Err(Error::InvalidInput("empty destination name".to_string()));
        }

        let mut src_paths = Vec::with_capacity(srcs.len());
        for src in srcs {
            let src = sanitize_display_name(src);
            let path = self.path_for_name(&src);
            if !path.exists() {
                return Err(Error::NotFound(src));
            }
            src_paths.push(path);
        }

        streamfile::merge(
            &self.stream_config(),
            self.path_for_name(&dest),
            &dest,
            &src_paths,
        )
    }

    fn stream_config(&self) -> StreamConfig {
        StreamConfig {
            temp_dir: self.temp_dir.clone(),
            compression: self.compression,
        }
    }

    fn path_for_name(&self, name: &str) -> PathBuf {
        self.file_dir
            .join(format!("{}{}", file_id_from_display_name(name), STREAM_EXT))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

/// Canonicalize a display name.
pub fn sanitize_display_name(v: &str) -> String {
    v.trim().to_string()
}

/// Map a display name to a filesystem-safe ID by escaping everything outside
/// ASCII letters and digits as `_<hex>_`.
pub fn file_id_from_display_name(v: &str) -> String {
    use std::fmt::Write;

    let mut id = String::with_capacity(v.len());
    for c in v.chars() {
        if c.is_ascii_alphanumeric() {
            id.push(c);
        } else {
            let _ = write!(id, "_{:x}_", c as u32);
        }
    }
    id
}
