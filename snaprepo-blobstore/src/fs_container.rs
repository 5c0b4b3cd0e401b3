use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, format_err, Context, Error};

use snaprepo_api_types::{new_uuid, RepoError};

use crate::container::{BlobContainer, BlobEntry, DeleteStats};

/// Directory backed [`BlobContainer`].
///
/// Blobs are plain files, sub-containers are subdirectories. Atomic
/// writes go through a `tmp.*` file in the same directory followed by
/// a rename; stray `tmp.*` files from interrupted writes are left for
/// the shard-level garbage collection to reclaim.
pub struct FilesystemBlobContainer {
    dir: PathBuf,
    rel_path: String,
}

impl FilesystemBlobContainer {
    /// Open (and create, if missing) the container rooted at `dir`.
    pub fn new<P: Into<PathBuf>>(dir: P) -> Result<Self, Error> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("unable to create blob container at {:?}", dir))?;
        Ok(Self {
            dir,
            rel_path: String::new(),
        })
    }

    fn blob_path(&self, name: &str) -> Result<PathBuf, Error> {
        if name.is_empty() || name.contains('/') || name.contains('\\') || name.starts_with('.') {
            bail!("invalid blob name {:?}", name);
        }
        Ok(self.dir.join(name))
    }

    fn not_found(&self, name: &str) -> Error {
        Error::new(RepoError::NotFound {
            container: self.rel_path.clone(),
            name: name.to_string(),
        })
    }

    fn write_to_path(
        &self,
        path: &PathBuf,
        data: &mut dyn Read,
        length: u64,
    ) -> Result<(), Error> {
        let mut file = std::fs::File::create(path)
            .with_context(|| format!("unable to create blob file {:?}", path))?;
        let copied = std::io::copy(data, &mut file)?;
        if copied != length {
            let _ = std::fs::remove_file(path);
            bail!(
                "short write for blob {:?}: got {} bytes, expected {}",
                path,
                copied,
                length,
            );
        }
        file.flush()?;
        Ok(())
    }
}

impl BlobContainer for FilesystemBlobContainer {
    fn path(&self) -> &str {
        &self.rel_path
    }

    fn list_blobs(&self) -> Result<BTreeMap<String, BlobEntry>, Error> {
        let mut listing = BTreeMap::new();
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            // a container nothing was written to yet is empty, not an error
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(listing),
            Err(err) => {
                return Err(format_err!("unable to list container {:?} - {}", self.dir, err))
            }
        };
        for entry in entries {
            let entry = entry?;
            let metadata = entry.metadata()?;
            if !metadata.is_file() {
                continue;
            }
            let name = match entry.file_name().into_string() {
                Ok(name) => name,
                Err(_) => continue,
            };
            listing.insert(
                name,
                BlobEntry {
                    length: metadata.len(),
                },
            );
        }
        Ok(listing)
    }

    fn read_blob(&self, name: &str) -> Result<Box<dyn Read + Send>, Error> {
        let path = self.blob_path(name)?;
        match std::fs::File::open(&path) {
            Ok(file) => Ok(Box::new(file)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Err(self.not_found(name)),
            Err(err) => Err(format_err!("unable to open blob {:?} - {}", path, err)),
        }
    }

    fn write_blob(
        &self,
        name: &str,
        data: &mut dyn Read,
        length: u64,
        fail_if_exists: bool,
    ) -> Result<(), Error> {
        let path = self.blob_path(name)?;
        if fail_if_exists && path.exists() {
            bail!("blob '{}' already exists in container '{}'", name, self.rel_path);
        }
        std::fs::create_dir_all(&self.dir)?;
        self.write_to_path(&path, data, length)
    }

    fn write_blob_atomic(
        &self,
        name: &str,
        data: &mut dyn Read,
        length: u64,
        fail_if_exists: bool,
    ) -> Result<(), Error> {
        let path = self.blob_path(name)?;
        if fail_if_exists && path.exists() {
            bail!("blob '{}' already exists in container '{}'", name, self.rel_path);
        }
        std::fs::create_dir_all(&self.dir)?;
        let tmp_path = self.dir.join(format!("tmp.{}", new_uuid()));
        if let Err(err) = self.write_to_path(&tmp_path, data, length) {
            let _ = std::fs::remove_file(&tmp_path);
            return Err(err);
        }
        if let Err(err) = std::fs::rename(&tmp_path, &path) {
            let _ = std::fs::remove_file(&tmp_path);
            bail!("rename of blob {:?} failed - {}", path, err);
        }
        Ok(())
    }

    fn delete_blobs_ignoring_if_not_exists(&self, names: &[String]) -> Result<(), Error> {
        for name in names {
            let path = self.blob_path(name)?;
            match std::fs::remove_file(&path) {
                Ok(()) => (),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => (),
                Err(err) => bail!("unable to delete blob {:?} - {}", path, err),
            }
        }
        Ok(())
    }

    fn children(&self) -> Result<BTreeMap<String, Arc<dyn BlobContainer>>, Error> {
        let mut children: BTreeMap<String, Arc<dyn BlobContainer>> = BTreeMap::new();
        match std::fs::read_dir(&self.dir) {
            Ok(entries) => {
                for entry in entries {
                    let entry = entry?;
                    if !entry.metadata()?.is_dir() {
                        continue;
                    }
                    let name = match entry.file_name().into_string() {
                        Ok(name) => name,
                        Err(_) => continue,
                    };
                    children.insert(name.clone(), self.child(&name)?);
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => (),
            Err(err) => bail!("unable to list container {:?} - {}", self.dir, err),
        }
        Ok(children)
    }

    fn child(&self, name: &str) -> Result<Arc<dyn BlobContainer>, Error> {
        if name.is_empty() || name.contains('/') || name.contains('\\') || name.starts_with('.') {
            bail!("invalid container name {:?}", name);
        }
        let rel_path = if self.rel_path.is_empty() {
            name.to_string()
        } else {
            format!("{}/{}", self.rel_path, name)
        };
        Ok(Arc::new(FilesystemBlobContainer {
            dir: self.dir.join(name),
            rel_path,
        }))
    }

    fn delete(&self) -> Result<DeleteStats, Error> {
        let mut stats = DeleteStats::default();
        if !self.dir.exists() {
            return Ok(stats);
        }
        for entry in walkdir::WalkDir::new(&self.dir) {
            let entry = entry?;
            if entry.file_type().is_file() {
                stats.blobs_deleted += 1;
                stats.bytes_deleted += entry.metadata()?.len();
            }
        }
        std::fs::remove_dir_all(&self.dir)
            .with_context(|| format!("unable to delete container {:?}", self.dir))?;
        Ok(stats)
    }
}
