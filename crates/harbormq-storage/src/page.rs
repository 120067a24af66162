//! Page files: the on-disk spill area of a paging address.
//!
//! Each address owns a directory named by a random UUID. The directory holds
//! an `address` marker with the address name, a `first-page` marker with the
//! first page number still in use, and one `{page_id:010}.page` file per page.
//! A page file starts with an 8-byte header (magic `HMQP`, version) followed
//! by framed, bincode-encoded [`PageRecord`]s.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{StorageError, StorageResult};
use crate::frame::{decode_frames, encode_frame};
use crate::mirror::ReplicationMirror;

/// Page file magic.
pub const PAGE_MAGIC: [u8; 4] = *b"HMQP";

/// Current page format version.
pub const PAGE_VERSION: u8 = 1;

/// Length of the page file header.
pub const PAGE_HEADER_LEN: u64 = 8;

const ADDRESS_MARKER: &str = "address";
const FIRST_PAGE_MARKER: &str = "first-page";
const PAGE_EXTENSION: &str = "page";

/// One paged message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRecord {
    /// Broker-assigned message ID.
    pub message_id: u64,
    /// Address the message was sent to.
    pub address: String,
    /// Queues the message was routed to before it was paged.
    pub queue_ids: Vec<u64>,
    /// Transaction that paged it, if any.
    pub tx_id: Option<u64>,
    /// Encoded message.
    pub body: Vec<u8>,
}

impl PageRecord {
    /// Encodes the record as one page frame.
    pub fn to_frame(&self) -> StorageResult<Vec<u8>> {
        Ok(encode_frame(&bincode::serialize(self)?))
    }
}

fn page_header() -> [u8; PAGE_HEADER_LEN as usize] {
    let mut header = [0u8; PAGE_HEADER_LEN as usize];
    header[..4].copy_from_slice(&PAGE_MAGIC);
    header[4] = PAGE_VERSION;
    header
}

/// A single page file.
pub struct Page {
    page_id: u64,
    address: String,
    path: PathBuf,
    writer: Option<File>,
    size: u64,
    record_count: u32,
    mirror: Option<Arc<dyn ReplicationMirror>>,
}

impl std::fmt::Debug for Page {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Page")
            .field("page_id", &self.page_id)
            .field("address", &self.address)
            .field("size", &self.size)
            .field("open", &self.writer.is_some())
            .finish()
    }
}

impl Page {
    fn new(
        page_id: u64,
        address: String,
        path: PathBuf,
        mirror: Option<Arc<dyn ReplicationMirror>>,
    ) -> Self {
        Self {
            page_id,
            address,
            path,
            writer: None,
            size: 0,
            record_count: 0,
            mirror,
        }
    }

    /// Page number.
    pub fn page_id(&self) -> u64 {
        self.page_id
    }

    /// Path of the page file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bytes in the file, header included.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Records written through this handle since it was opened.
    pub fn record_count(&self) -> u32 {
        self.record_count
    }

    /// True while open for writing.
    pub fn is_open(&self) -> bool {
        self.writer.is_some()
    }

    /// True if the file exists on disk.
    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Opens the page for appending, writing the header on a new file.
    pub fn open(&mut self) -> StorageResult<()> {
        if self.writer.is_some() {
            return Ok(());
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(&self.path)?;
        let len = file.metadata()?.len();
        if len == 0 {
            file.write_all(&page_header())?;
            self.size = PAGE_HEADER_LEN;
        } else {
            self.size = len;
        }
        debug!(address = %self.address, page_id = self.page_id, size = self.size, "page opened");
        self.writer = Some(file);
        Ok(())
    }

    /// Appends a record; returns the number of bytes written.
    pub fn write(&mut self, record: &PageRecord) -> StorageResult<u64> {
        let frame = record.to_frame()?;
        self.write_frame(&frame)
    }

    /// Appends an already-encoded frame.
    pub fn write_frame(&mut self, frame: &[u8]) -> StorageResult<u64> {
        let file = self.writer.as_mut().ok_or(StorageError::Closed { what: "page" })?;
        file.write_all(frame)?;
        self.size += frame.len() as u64;
        self.record_count += 1;
        if let Some(mirror) = &self.mirror {
            mirror.page_write(&self.address, self.page_id, frame);
        }
        Ok(frame.len() as u64)
    }

    /// Flushes written records to stable storage.
    pub fn sync(&mut self) -> StorageResult<()> {
        if let Some(file) = self.writer.as_mut() {
            file.sync_data()?;
        }
        Ok(())
    }

    /// Syncs and closes the write handle.
    pub fn close(&mut self) -> StorageResult<()> {
        if let Some(file) = self.writer.take() {
            file.sync_all()?;
            debug!(address = %self.address, page_id = self.page_id, size = self.size, "page closed");
        }
        Ok(())
    }

    /// Reads every intact record; a torn tail is dropped with a warning.
    pub fn read(&self) -> StorageResult<Vec<PageRecord>> {
        let mut data = Vec::new();
        File::open(&self.path)?.read_to_end(&mut data)?;
        if data.len() < PAGE_HEADER_LEN as usize || data[..4] != PAGE_MAGIC {
            return Err(StorageError::CorruptedPage {
                page_id: self.page_id,
                reason: "missing page header".to_string(),
            });
        }
        if data[4] != PAGE_VERSION {
            return Err(StorageError::CorruptedPage {
                page_id: self.page_id,
                reason: format!("unsupported version {}", data[4]),
            });
        }

        let body = &data[PAGE_HEADER_LEN as usize..];
        let decoded = decode_frames(body);
        if decoded.is_torn(body.len()) {
            warn!(
                address = %self.address,
                page_id = self.page_id,
                torn_bytes = body.len() - decoded.valid_len,
                "ignoring torn page tail"
            );
        }
        decoded
            .frames
            .iter()
            .map(|frame| bincode::deserialize(frame).map_err(StorageError::from))
            .collect()
    }

    /// Closes and deletes the file; returns false if it was already gone.
    pub fn delete(&mut self) -> StorageResult<bool> {
        self.writer = None;
        match std::fs::remove_file(&self.path) {
            Ok(()) => {
                if let Some(mirror) = &self.mirror {
                    mirror.page_deleted(&self.address, self.page_id);
                }
                debug!(address = %self.address, page_id = self.page_id, "page deleted");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

/// The page directory of one address.
#[derive(Clone)]
pub struct PageDirectory {
    dir: PathBuf,
    address: String,
    mirror: Option<Arc<dyn ReplicationMirror>>,
}

impl std::fmt::Debug for PageDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageDirectory")
            .field("dir", &self.dir)
            .field("address", &self.address)
            .finish()
    }
}

impl PageDirectory {
    /// Creates a new directory for `address` under `root`.
    pub fn create(root: &Path, address: &str) -> StorageResult<Self> {
        let dir = root.join(uuid::Uuid::new_v4().to_string());
        std::fs::create_dir_all(&dir)?;
        write_atomically(&dir.join(ADDRESS_MARKER), address.as_bytes())?;
        info!(address, dir = %dir.display(), "page directory created");
        Ok(Self {
            dir,
            address: address.to_string(),
            mirror: None,
        })
    }

    /// Opens an existing directory, reading its address marker.
    pub fn open(dir: PathBuf) -> StorageResult<Self> {
        let address = std::fs::read_to_string(dir.join(ADDRESS_MARKER))?;
        Ok(Self {
            dir,
            address: address.trim_end().to_string(),
            mirror: None,
        })
    }

    /// Finds every address directory under `root`.
    pub fn scan(root: &Path) -> StorageResult<Vec<Self>> {
        if !root.exists() {
            return Ok(Vec::new());
        }
        let mut dirs = Vec::new();
        for entry in std::fs::read_dir(root)? {
            let path = entry?.path();
            if !path.is_dir() {
                continue;
            }
            if !path.join(ADDRESS_MARKER).exists() {
                warn!(dir = %path.display(), "skipping page directory without address marker");
                continue;
            }
            dirs.push(Self::open(path)?);
        }
        dirs.sort_by(|a, b| a.address.cmp(&b.address));
        Ok(dirs)
    }

    /// Returns the directory for `address`, creating it if none exists.
    pub fn find_or_create(root: &Path, address: &str) -> StorageResult<Self> {
        match Self::scan(root)?.into_iter().find(|d| d.address == address) {
            Some(dir) => Ok(dir),
            None => Self::create(root, address),
        }
    }

    /// Address this directory pages for.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Filesystem path.
    pub fn path(&self) -> &Path {
        &self.dir
    }

    /// Installs the mirror handed to every page created afterwards.
    pub fn set_mirror(&mut self, mirror: Option<Arc<dyn ReplicationMirror>>) {
        self.mirror = mirror;
    }

    /// A handle to page `page_id`; the file is not touched until opened.
    pub fn page(&self, page_id: u64) -> Page {
        Page::new(
            page_id,
            self.address.clone(),
            self.dir.join(format!("{page_id:010}.{PAGE_EXTENSION}")),
            self.mirror.clone(),
        )
    }

    /// Page numbers present on disk, ascending.
    pub fn page_ids(&self) -> StorageResult<Vec<u64>> {
        let mut ids = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(PAGE_EXTENSION) {
                continue;
            }
            if let Some(id) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<u64>().ok())
            {
                ids.push(id);
            }
        }
        ids.sort_unstable();
        Ok(ids)
    }

    /// Persists the first usable page number.
    pub fn write_first_page(&self, page_id: u64) -> StorageResult<()> {
        write_atomically(&self.dir.join(FIRST_PAGE_MARKER), page_id.to_string().as_bytes())?;
        if let Some(mirror) = &self.mirror {
            mirror.first_page(&self.address, page_id);
        }
        Ok(())
    }

    /// Reads the first usable page number, if recorded.
    pub fn read_first_page(&self) -> StorageResult<Option<u64>> {
        let path = self.dir.join(FIRST_PAGE_MARKER);
        if !path.exists() {
            return Ok(None);
        }
        let text = std::fs::read_to_string(&path)?;
        text.trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|e| StorageError::CorruptedPage {
                page_id: 0,
                reason: format!("bad first-page marker: {e}"),
            })
    }

    /// Deletes page `page_id`; returns false if it did not exist.
    pub fn delete_page(&self, page_id: u64) -> StorageResult<bool> {
        self.page(page_id).delete()
    }

    /// Removes the whole directory.
    pub fn remove(self) -> StorageResult<()> {
        std::fs::remove_dir_all(&self.dir)?;
        Ok(())
    }
}

fn write_atomically(path: &Path, data: &[u8]) -> StorageResult<()> {
    let tmp = path.with_extension("tmp");
    {
        let mut file = File::create(&tmp)?;
        file.write_all(data)?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp, path)?;
    Ok(())
}
