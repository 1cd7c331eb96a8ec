//! Archive extraction.
//!
//! An archive blob is walked on a blocking thread and its regular-file
//! entries are handed to the async side over a small bounded channel, so at
//! most a couple of decoded entries are held in memory at once. The
//! resulting [`EntryStream`] is lazy, finite and single-pass.
//!
//! Supported containers:
//!
//! - **Tar** (`.tar`)
//! - **Tar.gz** (`.tar.gz`, `.tgz`)
//! - **Zip** (`.zip`)
//!
//! Failures are split three ways. A container that cannot be opened at all
//! is reported by [`open_blob`]. A zip member that fails to decompress is
//! yielded as a recoverable [`ArchiveError::Entry`] and iteration continues.
//! A tar stream that breaks mid-way yields [`ArchiveError::Corrupt`] and
//! ends the sequence, since nothing after the break can be located.
//!
//! Entry bodies are read without trusting the size declared in the header
//! and are capped at [`MAX_ENTRY_BYTES`]. The extractor finishes every
//! archive with an explicit end marker; a channel that closes without it
//! surfaces as [`ArchiveError::Interrupted`].

use std::collections::VecDeque;
use std::fmt;
use std::io::{self, BufReader, Read};

use bytes::Bytes;
use flate2::read::GzDecoder;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use cobalt_storage::Blob;

/// Decoded entries buffered between the extractor thread and the consumer.
const ENTRY_BUFFER: usize = 2;

/// Largest entry body held in memory. Bigger entries are skipped with
/// [`ArchiveError::Entry`].
pub const MAX_ENTRY_BYTES: u64 = 512 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("cannot open {format} archive: {reason}")]
    Open { format: ArchiveFormat, reason: String },

    #[error("corrupt archive stream: {0}")]
    Corrupt(String),

    #[error("cannot read entry {name}: {reason}")]
    Entry { name: String, reason: String },

    #[error("unrecognized archive type for {0}")]
    UnknownFormat(String),

    #[error("extractor stopped unexpectedly")]
    Interrupted,
}

impl ArchiveError {
    /// Whether iteration cannot continue past this error.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, ArchiveError::Entry { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    Tar,
    TarGz,
    Zip,
}

impl ArchiveFormat {
    /// Guess the container from an object key suffix.
    pub fn detect(key: &str) -> Option<Self> {
        let lower = key.to_ascii_lowercase();
        if lower.ends_with(".tar.gz") || lower.ends_with(".tgz") {
            Some(ArchiveFormat::TarGz)
        } else if lower.ends_with(".tar") {
            Some(ArchiveFormat::Tar)
        } else if lower.ends_with(".zip") {
            Some(ArchiveFormat::Zip)
        } else {
            None
        }
    }
}

impl fmt::Display for ArchiveFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ArchiveFormat::Tar => "tar",
            ArchiveFormat::TarGz => "tar.gz",
            ArchiveFormat::Zip => "zip",
        })
    }
}

/// One regular file from an archive. The body is dropped with the entry.
#[derive(Debug, Clone)]
pub struct ArchiveEntry {
    /// Path inside the archive, `/`-separated.
    pub name: String,
    /// Lowercased extension of the last path component, without the dot.
    pub extension: String,
    pub size: u64,
    pub body: Bytes,
}

impl ArchiveEntry {
    pub fn new(name: impl Into<String>, body: Vec<u8>) -> Self {
        let name = name.into();
        Self {
            extension: extension_of(&name),
            size: body.len() as u64,
            body: Bytes::from(body),
            name,
        }
    }

    /// Last path component of the entry name.
    pub fn base_name(&self) -> &str {
        base_name(&self.name)
    }
}

pub fn base_name(name: &str) -> &str {
    name.rsplit('/').next().unwrap_or(name)
}

fn extension_of(name: &str) -> String {
    match base_name(name).rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => ext.to_ascii_lowercase(),
        _ => String::new(),
    }
}

type EntryResult = Result<ArchiveEntry, ArchiveError>;

#[derive(Debug)]
enum Frame {
    Entry(EntryResult),
    /// The extractor walked the whole archive.
    End,
}

/// Lazy sequence of entries from one or more archives, in order.
pub struct EntryStream {
    sources: VecDeque<mpsc::Receiver<Frame>>,
}

impl EntryStream {
    pub fn empty() -> Self {
        Self {
            sources: VecDeque::new(),
        }
    }

    /// Yield `other`'s entries after this stream is exhausted.
    pub fn chain(mut self, mut other: EntryStream) -> Self {
        self.sources.append(&mut other.sources);
        self
    }

    fn single(rx: mpsc::Receiver<Frame>) -> Self {
        let mut sources = VecDeque::with_capacity(1);
        sources.push_back(rx);
        Self { sources }
    }

    pub async fn next(&mut self) -> Option<EntryResult> {
        while let Some(rx) = self.sources.front_mut() {
            match rx.recv().await {
                Some(Frame::Entry(item)) => return Some(item),
                Some(Frame::End) => {
                    self.sources.pop_front();
                }
                // Extractor died before reaching the end of its archive.
                None => {
                    self.sources.pop_front();
                    return Some(Err(ArchiveError::Interrupted));
                }
            }
        }
        None
    }
}

/// Open an archive blob and start extracting it in the background.
///
/// Returns once the container header has been validated; entries are then
/// produced on demand as the stream is polled.
pub async fn open_blob(blob: Blob, format: ArchiveFormat) -> Result<EntryStream, ArchiveError> {
    let (tx, rx) = mpsc::channel(ENTRY_BUFFER);
    let (open_tx, open_rx) = oneshot::channel();

    let size = blob.size;
    tokio::task::spawn_blocking(move || {
        let opened = Opened(Some(open_tx));
        match format {
            ArchiveFormat::Tar => walk_tar(BufReader::new(blob.file), format, opened, &tx),
            ArchiveFormat::TarGz => {
                let decoder = GzDecoder::new(BufReader::new(blob.file));
                if decoder.header().is_none() {
                    opened.fail(format, "not a gzip stream".into());
                    return;
                }
                walk_tar(decoder, format, opened, &tx)
            }
            ArchiveFormat::Zip => walk_zip(blob.file, opened, &tx),
        }
    });

    match open_rx.await {
        Ok(Ok(())) => {
            debug!(%format, size, "Archive opened");
            Ok(EntryStream::single(rx))
        }
        Ok(Err(e)) => Err(e),
        Err(_) => Err(ArchiveError::Interrupted),
    }
}

/// One-shot open acknowledgement, sent at most once.
struct Opened(Option<oneshot::Sender<Result<(), ArchiveError>>>);

impl Opened {
    fn succeed(&mut self) {
        if let Some(tx) = self.0.take() {
            let _ = tx.send(Ok(()));
        }
    }

    fn fail(mut self, format: ArchiveFormat, reason: String) {
        if let Some(tx) = self.0.take() {
            let _ = tx.send(Err(ArchiveError::Open { format, reason }));
        }
    }

    fn is_pending(&self) -> bool {
        self.0.is_some()
    }
}

enum BodyError {
    TooLarge(u64),
    Io(io::Error),
}

impl fmt::Display for BodyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BodyError::TooLarge(size) => {
                write!(f, "entry of {size} bytes exceeds the {MAX_ENTRY_BYTES} byte limit")
            }
            BodyError::Io(e) => write!(f, "{e}"),
        }
    }
}

/// Read an entry body. `declared` only rejects oversized entries early;
/// the buffer grows with the bytes actually read.
fn read_body<R: Read>(reader: R, declared: u64) -> Result<Vec<u8>, BodyError> {
    if declared > MAX_ENTRY_BYTES {
        return Err(BodyError::TooLarge(declared));
    }
    let mut body = Vec::new();
    reader
        .take(MAX_ENTRY_BYTES + 1)
        .read_to_end(&mut body)
        .map_err(BodyError::Io)?;
    if body.len() as u64 > MAX_ENTRY_BYTES {
        return Err(BodyError::TooLarge(body.len() as u64));
    }
    Ok(body)
}

fn send(tx: &mpsc::Sender<Frame>, item: EntryResult) -> bool {
    tx.blocking_send(Frame::Entry(item)).is_ok()
}

/// Report a break in the stream and close it; nothing after it is readable.
fn corrupt(tx: &mpsc::Sender<Frame>, reason: String) {
    if send(tx, Err(ArchiveError::Corrupt(reason))) {
        let _ = tx.blocking_send(Frame::End);
    }
}

fn walk_tar<R: Read>(
    reader: R,
    format: ArchiveFormat,
    mut opened: Opened,
    tx: &mpsc::Sender<Frame>,
) {
    let mut archive = tar::Archive::new(reader);
    let entries = match archive.entries() {
        Ok(entries) => entries,
        Err(e) => return opened.fail(format, e.to_string()),
    };

    for next in entries {
        let mut entry = match next {
            Ok(entry) => entry,
            // A bad first header means this was never a tar stream.
            Err(e) if opened.is_pending() => return opened.fail(format, e.to_string()),
            Err(e) => return corrupt(tx, e.to_string()),
        };
        opened.succeed();

        if entry.header().entry_type().is_dir() {
            continue;
        }

        let name = match entry.path() {
            Ok(path) => path.to_string_lossy().into_owned(),
            Err(e) => {
                let failed = ArchiveError::Entry {
                    name: String::from_utf8_lossy(&entry.path_bytes()).into_owned(),
                    reason: e.to_string(),
                };
                if !send(tx, Err(failed)) {
                    return;
                }
                continue;
            }
        };

        let declared = entry.size();
        let item = match read_body(&mut entry, declared) {
            Ok(body) if body.len() as u64 == declared => Ok(ArchiveEntry::new(name, body)),
            Ok(body) => {
                return corrupt(
                    tx,
                    format!("{name}: stream ended after {} of {declared} bytes", body.len()),
                )
            }
            // The tar reader skips the unread remainder on the next header.
            Err(e @ BodyError::TooLarge(_)) => Err(ArchiveError::Entry {
                name,
                reason: e.to_string(),
            }),
            Err(e) => return corrupt(tx, format!("{name}: {e}")),
        };

        // Receiver gone: the consumer stopped early.
        if !send(tx, item) {
            return;
        }
    }

    // An empty archive is still a valid one.
    opened.succeed();
    let _ = tx.blocking_send(Frame::End);
}

fn walk_zip(file: std::fs::File, mut opened: Opened, tx: &mpsc::Sender<Frame>) {
    let mut archive = match zip::ZipArchive::new(file) {
        Ok(archive) => archive,
        Err(e) => return opened.fail(ArchiveFormat::Zip, e.to_string()),
    };
    opened.succeed();

    for i in 0..archive.len() {
        let item = match archive.by_index(i) {
            Ok(mut member) => {
                if member.is_dir() {
                    continue;
                }
                let name = member.name().to_string();
                let declared = member.size();
                match read_body(&mut member, declared) {
                    Ok(body) => Ok(ArchiveEntry::new(name, body)),
                    Err(e) => Err(ArchiveError::Entry {
                        name,
                        reason: e.to_string(),
                    }),
                }
            }
            Err(e) => Err(ArchiveError::Entry {
                name: format!("#{i}"),
                reason: e.to_string(),
            }),
        };
        if !send(tx, item) {
            return;
        }
    }
    let _ = tx.blocking_send(Frame::End);
}
