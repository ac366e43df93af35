//! Windowed file downloads over the in-sequence channel
//!
//! A download never blocks the tick: at most one block is read and sent per
//! client per tick. Blocks are kept in a sliding window until the client acks
//! them with `nextdl`; if the client goes quiet the window is resent from the
//! oldest unacknowledged block.

use std::io::{Read, Seek, SeekFrom};
use std::path::{Component, Path, PathBuf};

use tracing::debug;

use crate::net::protocol::DownloadBlock;

#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("Downloads are disabled on this server")]
    Disabled,
    #[error("Invalid download name {0:?}")]
    InvalidName(String),
    #[error("File not found: {0}")]
    NotFound(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Seekable byte stream behind a download
pub trait DownloadFile: Read + Seek + Send {}

impl<T: Read + Seek + Send> DownloadFile for T {}

/// Where downloadable files come from
pub trait DownloadSource: Send {
    /// Open `name` and report its size
    fn open(&self, name: &str) -> Result<(Box<dyn DownloadFile>, u64), DownloadError>;
}

/// Serves files from one directory tree
pub struct DirectorySource {
    root: PathBuf,
}

impl DirectorySource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

/// Reject anything that could leave the download directory
pub fn validate_name(name: &str) -> Result<&Path, DownloadError> {
    let invalid = || DownloadError::InvalidName(name.to_string());
    if name.is_empty() || name.len() > 256 || name.contains('\\') || name.contains(':') {
        return Err(invalid());
    }

    let path = Path::new(name);
    for component in path.components() {
        match component {
            Component::Normal(part) => {
                if part.to_string_lossy().starts_with('.') {
                    return Err(invalid());
                }
            }
            _ => return Err(invalid()),
        }
    }
    Ok(path)
}

impl DownloadSource for DirectorySource {
    fn open(&self, name: &str) -> Result<(Box<dyn DownloadFile>, u64), DownloadError> {
        let relative = validate_name(name)?;
        let path = self.root.join(relative);
        let file = std::fs::File::open(&path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => DownloadError::NotFound(name.to_string()),
            _ => DownloadError::Io(e),
        })?;
        let metadata = file.metadata()?;
        if !metadata.is_file() {
            return Err(DownloadError::NotFound(name.to_string()));
        }
        Ok((Box::new(file), metadata.len()))
    }
}

/// Outcome of a `nextdl` acknowledgment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadAck {
    Progress,
    /// Final block acknowledged; session can be closed
    Complete,
    /// Not the block we were waiting for
    Ignored,
}

/// Per-connection download state
pub struct DownloadSession {
    name: String,
    file: Box<dyn DownloadFile>,
    size: u64,
    block_size: usize,
    /// Buffered blocks indexed by `block % window`
    blocks: Vec<Option<Vec<u8>>>,
    /// Oldest block the client has not acknowledged
    client_block: u32,
    /// Next block to read from the file
    current_block: u32,
    /// Next block to transmit
    xmit_block: u32,
    /// One past the highest block ever transmitted
    sent_limit: u32,
    /// Block number of the final (short or empty) block once read
    eof_block: Option<u32>,
    send_time: u64,
    bytes_read: u64,
}

impl DownloadSession {
    pub fn new(
        name: String,
        file: Box<dyn DownloadFile>,
        size: u64,
        block_size: usize,
        window: usize,
    ) -> Self {
        Self {
            name,
            file,
            size,
            block_size: block_size.max(1),
            blocks: (0..window.max(1)).map(|_| None).collect(),
            client_block: 0,
            current_block: 0,
            xmit_block: 0,
            sent_limit: 0,
            eof_block: None,
            send_time: 0,
            bytes_read: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    fn window(&self) -> u32 {
        self.blocks.len() as u32
    }

    /// Read ahead until the window is full or the file is exhausted
    fn fill_window(&mut self) -> Result<(), DownloadError> {
        while self.eof_block.is_none()
            && self.current_block.wrapping_sub(self.client_block) < self.window()
        {
            let offset = self.current_block as u64 * self.block_size as u64;
            let remaining = self.size.saturating_sub(offset);
            let len = remaining.min(self.block_size as u64) as usize;

            let mut data = vec![0u8; len];
            if len > 0 {
                self.file.seek(SeekFrom::Start(offset))?;
                self.file.read_exact(&mut data)?;
            }
            self.bytes_read += len as u64;

            // A short block (possibly empty) terminates the transfer
            if len < self.block_size {
                self.eof_block = Some(self.current_block);
            }
            let slot = (self.current_block % self.window()) as usize;
            self.blocks[slot] = Some(data);
            self.current_block += 1;
        }
        Ok(())
    }

    /// Block to send this tick, if any
    pub fn next_block(
        &mut self,
        now_ms: u64,
        timeout_ms: u64,
    ) -> Result<Option<DownloadBlock>, DownloadError> {
        self.fill_window()?;

        if self.xmit_block == self.current_block {
            // Whole window is out; resend from the oldest unacked after a pause
            if now_ms.saturating_sub(self.send_time) < timeout_ms {
                return Ok(None);
            }
            debug!(
                "Download {} stalled, resending from block {}",
                self.name, self.client_block
            );
            self.xmit_block = self.client_block;
        }

        let block = self.xmit_block;
        let slot = (block % self.window()) as usize;
        let Some(data) = self.blocks[slot].clone() else {
            return Ok(None);
        };

        self.xmit_block += 1;
        self.sent_limit = self.sent_limit.max(self.xmit_block);
        self.send_time = now_ms;
        Ok(Some(DownloadBlock {
            block,
            total_size: (block == 0).then_some(self.size),
            data,
        }))
    }

    /// Handle `nextdl <block>`
    pub fn acknowledge(&mut self, block: u32, now_ms: u64) -> DownloadAck {
        // The client cannot have a block we never sent
        if block != self.client_block || block >= self.sent_limit {
            return DownloadAck::Ignored;
        }
        let slot = (block % self.window()) as usize;
        self.blocks[slot] = None;
        self.client_block += 1;
        self.send_time = now_ms;

        if self.eof_block == Some(block) {
            DownloadAck::Complete
        } else {
            DownloadAck::Progress
        }
    }
}
