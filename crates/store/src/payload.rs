use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;

use futures::FutureExt;
use futures::channel::oneshot;
use futures::future::{self, BoxFuture};

use crate::StoreError;

const FLOAT_SIZE: usize = 4;

/// A byte range inside a file holding little-endian `f32` samples.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobHandle {
    pub path: PathBuf,
    pub offset: u64,
    pub len: u64,
}

/// Raw chunk data as handed over by a store.
///
/// Stores either return the bytes inline or a handle to where they live; the
/// distinction is resolved exactly once, by [`ChunkPayload::resolve`].
#[derive(Debug, Clone, PartialEq)]
pub enum ChunkPayload {
    RawBytes(Vec<u8>),
    Blob(BlobHandle),
}

impl ChunkPayload {
    /// Encode samples as an inline little-endian payload.
    pub fn from_samples(samples: &[f32]) -> Self {
        ChunkPayload::RawBytes(samples.iter().flat_map(|s| s.to_le_bytes()).collect())
    }

    /// Resolve to samples without blocking the polling thread.
    ///
    /// Inline bytes decode immediately; a blob is read on its own thread and
    /// the future completes once the read is done.
    pub fn resolve(self) -> BoxFuture<'static, Result<Vec<f32>, StoreError>> {
        let handle = match self {
            ChunkPayload::Blob(handle) => handle,
            inline => return future::ready(inline.into_samples()).boxed(),
        };

        let (tx, rx) = oneshot::channel();
        let spawned = std::thread::Builder::new()
            .name("deck-blob-reader".into())
            .spawn(move || {
                let _ = tx.send(ChunkPayload::Blob(handle).into_samples());
            });
        if let Err(err) = spawned {
            return future::ready(Err(StoreError::Io(err))).boxed();
        }

        rx.map(|result| {
            result.unwrap_or_else(|_canceled| {
                Err(StoreError::Io(std::io::Error::other("blob reader stopped")))
            })
        })
        .boxed()
    }

    /// Resolve on the calling thread.
    pub fn into_samples(self) -> Result<Vec<f32>, StoreError> {
        let bytes = match self {
            ChunkPayload::RawBytes(bytes) => bytes,
            ChunkPayload::Blob(handle) => read_blob(&handle)?,
        };
        decode_f32_le(&bytes)
    }
}

fn read_blob(handle: &BlobHandle) -> Result<Vec<u8>, StoreError> {
    let mut file = File::open(&handle.path)?;
    file.seek(SeekFrom::Start(handle.offset))?;
    let mut bytes = vec![0u8; handle.len as usize];
    file.read_exact(&mut bytes)?;
    Ok(bytes)
}

fn decode_f32_le(bytes: &[u8]) -> Result<Vec<f32>, StoreError> {
    if bytes.len() % FLOAT_SIZE != 0 {
        return Err(StoreError::Malformed(format!(
            "{} bytes is not a whole number of f32 samples",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(FLOAT_SIZE)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect())
}
