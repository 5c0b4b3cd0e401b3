//! Repository verification: a seeded probe blob written once and read
//! back on every participating node to confirm cross-node visibility
//! of the store.

use anyhow::Error;

use snaprepo_api_types::{new_uuid, RepoError};
use snaprepo_blobstore::container::{BlobContainer, BlobContainerExt};

use super::BlobStoreRepository;

const VERIFICATION_BLOB: &str = "master.dat";

fn verification_container_name(seed: &str) -> String {
    format!("tests-{}", seed)
}

impl BlobStoreRepository {
    /// Write the probe blob. Returns the seed the participants verify
    /// against.
    pub fn start_verification(&self) -> Result<String, Error> {
        self.ensure_writable()?;
        let seed = new_uuid();
        let container = self.root()?.child(&verification_container_name(&seed))?;
        container.write_blob_bytes(VERIFICATION_BLOB, seed.as_bytes(), true)?;
        Ok(seed)
    }

    /// Read the probe back and compare it to the seed.
    pub fn verify(&self, seed: &str) -> Result<(), Error> {
        let container = self.root()?.child(&verification_container_name(seed))?;
        let contents = container.read_blob_bytes(VERIFICATION_BLOB).map_err(|err| {
            Error::new(RepoError::VerificationFailed(format!(
                "unable to read the verification blob: {}",
                err,
            )))
        })?;
        if contents != seed.as_bytes() {
            return Err(Error::new(RepoError::VerificationFailed(format!(
                "expected seed '{}', got {} unexpected bytes",
                seed,
                contents.len(),
            ))));
        }
        Ok(())
    }

    /// Remove the probe container.
    pub fn end_verification(&self, seed: &str) -> Result<(), Error> {
        self.ensure_writable()?;
        self.root()?
            .child(&verification_container_name(seed))?
            .delete()?;
        Ok(())
    }
}
