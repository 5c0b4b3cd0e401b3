//! Small filesystem helpers shared by the blob store backends.

use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{format_err, Context, Error};

/// Atomically replace the contents of `path`.
///
/// The data is written to a temporary file in the same directory and
/// then renamed over the target, so concurrent readers either see the
/// old or the new contents, never a partial write.
pub fn replace_file<P: AsRef<Path>>(path: P, data: &[u8], fsync: bool) -> Result<(), Error> {
    let path = path.as_ref();
    let dir = path
        .parent()
        .ok_or_else(|| format_err!("path {:?} has no parent directory", path))?;

    let tmp_path = dir.join(format!("tmp.{}", uuid::Uuid::new_v4().simple()));

    let result: Result<(), Error> = (|| {
        let mut file = std::fs::File::create(&tmp_path)
            .with_context(|| format!("unable to create temporary file {:?}", tmp_path))?;
        use std::io::Write;
        file.write_all(data)?;
        if fsync {
            file.sync_all()?;
        }
        drop(file);
        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("rename {:?} to {:?} failed", tmp_path, path))?;
        Ok(())
    })();

    if result.is_err() {
        let _ = std::fs::remove_file(&tmp_path);
    }
    result
}

/// Seconds since the unix epoch.
pub fn epoch_i64() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(duration) => duration.as_secs() as i64,
        Err(err) => -(err.duration().as_secs() as i64),
    }
}

/// Milliseconds since the unix epoch.
pub fn epoch_millis_i64() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(duration) => duration.as_millis() as i64,
        Err(err) => -(err.duration().as_millis() as i64),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn replace_file_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob");
        replace_file(&path, b"one", false).unwrap();
        replace_file(&path, b"two", false).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"two");
        // no temporary files left behind
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|entry| {
                let name = entry.unwrap().file_name();
                let name = name.to_string_lossy().to_string();
                name.starts_with("tmp.").then_some(name)
            })
            .collect();
        assert!(leftovers.is_empty());
    }
}
