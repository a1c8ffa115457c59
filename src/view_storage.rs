//! Storage of raw view data: full views on the filesystem (optionally
//! zstd-compressed), headers and their store timestamps in a key-value store.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;

use crate::consideration::Consideration;
use crate::error::StorageError;
use crate::view::{View, ViewHeader, ViewID};

/// Interface for storing views and their considerations.
pub trait ViewStorage: Send + Sync {
    /// Stores all of the view's information. `now` is the store timestamp.
    fn store(&self, id: &ViewID, view: &View, now: i64) -> Result<(), StorageError>;

    /// Returns the referenced view.
    fn get_view(&self, id: &ViewID) -> Result<Option<View>, StorageError>;

    /// Returns the referenced view's serialized bytes.
    fn get_view_bytes(&self, id: &ViewID) -> Result<Option<Vec<u8>>, StorageError>;

    /// Returns the referenced view's header and the timestamp of when it was
    /// stored.
    fn get_view_header(&self, id: &ViewID) -> Result<Option<(ViewHeader, i64)>, StorageError>;

    /// Returns a consideration within a view along with the view's header.
    fn get_consideration(
        &self,
        id: &ViewID,
        index: usize,
    ) -> Result<Option<(Consideration, ViewHeader)>, StorageError>;
}

/// On-disk view storage: each view as `<id>.json` or `<id>.zst` under
/// `dir_path`, headers as `(stored_at_be_i64 ‖ header_json)` keyed by id.
pub struct ViewStorageDisk {
    db: sled::Db,
    dir_path: PathBuf,
    read_only: bool,
    compress: bool,
}

impl ViewStorageDisk {
    pub fn new(
        dir_path: impl AsRef<Path>,
        db_path: impl AsRef<Path>,
        read_only: bool,
        compress: bool,
    ) -> Result<Self, StorageError> {
        let dir_path = dir_path.as_ref().to_path_buf();
        if !read_only {
            fs::create_dir_all(&dir_path)?;
        }
        let db = sled::open(db_path)?;
        Ok(ViewStorageDisk {
            db,
            dir_path,
            read_only,
            compress,
        })
    }

    fn view_path(&self, id: &ViewID, compressed: bool) -> PathBuf {
        let ext = if compressed { "zst" } else { "json" };
        self.dir_path.join(format!("{}.{}", id, ext))
    }
}

impl ViewStorage for ViewStorageDisk {
    fn store(&self, id: &ViewID, view: &View, now: i64) -> Result<(), StorageError> {
        if self.read_only {
            return Err(StorageError::ReadOnly);
        }

        let mut view_bytes = serde_json::to_vec(view)?;
        if self.compress {
            view_bytes = zstd::encode_all(&view_bytes[..], 0)?;
        }

        // write the view and sync
        let view_path = self.view_path(id, self.compress);
        let mut f = fs::File::create(&view_path)?;
        f.write_all(&view_bytes)?;
        f.sync_all()?;

        // save the header alongside its store timestamp
        let encoded = encode_view_header(&view.header, now)?;
        self.db.insert(id.as_bytes(), encoded)?;
        self.db.flush()?;
        Ok(())
    }

    fn get_view(&self, id: &ViewID) -> Result<Option<View>, StorageError> {
        match self.get_view_bytes(id)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn get_view_bytes(&self, id: &ViewID) -> Result<Option<Vec<u8>>, StorageError> {
        // order to try finding the view by extension
        let exts = if self.compress {
            [true, false]
        } else {
            [false, true]
        };

        for compressed in exts {
            let path = self.view_path(id, compressed);
            match fs::read(&path) {
                Ok(bytes) => {
                    if compressed {
                        return Ok(Some(zstd::decode_all(&bytes[..])?));
                    }
                    return Ok(Some(bytes));
                }
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(err) => return Err(err.into()),
            }
        }
        Ok(None)
    }

    fn get_view_header(&self, id: &ViewID) -> Result<Option<(ViewHeader, i64)>, StorageError> {
        match self.db.get(id.as_bytes())? {
            Some(encoded) => Ok(Some(decode_view_header(&encoded)?)),
            None => Ok(None),
        }
    }

    fn get_consideration(
        &self,
        id: &ViewID,
        index: usize,
    ) -> Result<Option<(Consideration, ViewHeader)>, StorageError> {
        let view = match self.get_view(id)? {
            Some(view) => view,
            None => return Ok(None),
        };
        let cn = match view.considerations.into_iter().nth(index) {
            Some(cn) => cn,
            None => return Ok(None),
        };
        Ok(Some((cn, view.header)))
    }
}

fn encode_view_header(header: &ViewHeader, when: i64) -> Result<Vec<u8>, StorageError> {
    let mut buf = Vec::with_capacity(8 + 256);
    buf.extend_from_slice(&when.to_be_bytes());
    serde_json::to_writer(&mut buf, header)?;
    Ok(buf)
}

fn decode_view_header(encoded: &[u8]) -> Result<(ViewHeader, i64), StorageError> {
    if encoded.len() < 8 {
        return Err(StorageError::Corrupt("short view header record".to_owned()));
    }
    let mut when_bytes = [0u8; 8];
    when_bytes.copy_from_slice(&encoded[..8]);
    let when = i64::from_be_bytes(when_bytes);
    let header: ViewHeader = serde_json::from_slice(&encoded[8..])?;
    Ok((header, when))
}

/// In-memory view storage, for tools and tests.
#[derive(Default)]
pub struct ViewStorageMemory {
    inner: RwLock<std::collections::HashMap<ViewID, (Vec<u8>, ViewHeader, i64)>>,
}

impl ViewStorageMemory {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ViewStorage for ViewStorageMemory {
    fn store(&self, id: &ViewID, view: &View, now: i64) -> Result<(), StorageError> {
        let bytes = serde_json::to_vec(view)?;
        self.inner
            .write()
            .insert(*id, (bytes, view.header.clone(), now));
        Ok(())
    }

    fn get_view(&self, id: &ViewID) -> Result<Option<View>, StorageError> {
        match self.inner.read().get(id) {
            Some((bytes, _, _)) => Ok(Some(serde_json::from_slice(bytes)?)),
            None => Ok(None),
        }
    }

    fn get_view_bytes(&self, id: &ViewID) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.inner.read().get(id).map(|(bytes, _, _)| bytes.clone()))
    }

    fn get_view_header(&self, id: &ViewID) -> Result<Option<(ViewHeader, i64)>, StorageError> {
        Ok(self
            .inner
            .read()
            .get(id)
            .map(|(_, header, when)| (header.clone(), *when)))
    }

    fn get_consideration(
        &self,
        id: &ViewID,
        index: usize,
    ) -> Result<Option<(Consideration, ViewHeader)>, StorageError> {
        let view = match self.get_view(id)? {
            Some(view) => view,
            None => return Ok(None),
        };
        let cn = match view.considerations.into_iter().nth(index) {
            Some(cn) => cn,
            None => return Ok(None),
        };
        Ok(Some((cn, view.header)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consideration::{Consideration, PublicKey};

    fn make_view() -> View {
        let mut viewpoint = Consideration::new(None, PublicKey([0xaa; 32]), 0, 0, 0, "stored");
        viewpoint.time = 1_700_000_000;
        viewpoint.nonce = 1;
        View::new(
            ViewID::default(),
            0,
            ViewID([0xff; 32]),
            ViewID::default(),
            vec![viewpoint],
        )
        .unwrap()
    }

    fn round_trip(compress: bool) {
        let dir = tempfile::tempdir().unwrap();
        let storage = ViewStorageDisk::new(
            dir.path().join("views"),
            dir.path().join("headers"),
            false,
            compress,
        )
        .unwrap();

        let view = make_view();
        let id = view.id().unwrap();
        storage.store(&id, &view, 12345).unwrap();

        let (header, when) = storage.get_view_header(&id).unwrap().unwrap();
        assert_eq!(header, view.header);
        assert_eq!(when, 12345);

        let loaded = storage.get_view(&id).unwrap().unwrap();
        assert_eq!(loaded.header, view.header);
        assert_eq!(loaded.considerations, view.considerations);

        let (cn, header) = storage.get_consideration(&id, 0).unwrap().unwrap();
        assert_eq!(cn, view.considerations[0]);
        assert_eq!(header, view.header);
        assert!(storage.get_consideration(&id, 1).unwrap().is_none());

        let missing = ViewID([0x01; 32]);
        assert!(storage.get_view(&missing).unwrap().is_none());
        assert!(storage.get_view_header(&missing).unwrap().is_none());
    }

    #[test]
    fn stores_and_loads_views() {
        round_trip(false);
    }

    #[test]
    fn stores_and_loads_compressed_views() {
        round_trip(true);
    }

    #[test]
    fn read_only_storage_rejects_writes() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("views")).unwrap();
        let storage = ViewStorageDisk::new(
            dir.path().join("views"),
            dir.path().join("headers"),
            true,
            false,
        )
        .unwrap();
        let view = make_view();
        let id = view.id().unwrap();
        assert!(matches!(
            storage.store(&id, &view, 0),
            Err(StorageError::ReadOnly)
        ));
    }
}
