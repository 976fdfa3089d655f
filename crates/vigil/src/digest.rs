//! Content measurement: streaming SHA-1 over files and buffers.
//!
//! ## Design
//!
//! File measurement is double-buffered. The calling thread is the I/O
//! producer and a dedicated absorber thread runs the hash, exchanging two
//! fixed-size buffers over bounded channels:
//!
//! 1. The producer reads the next chunk into a free buffer and hands it to
//!    the absorber over a capacity-1 channel.
//! 2. While the absorber digests chunk `n`, the producer is already reading
//!    chunk `n + 1` into the other buffer.
//! 3. Drained buffers travel back on a return channel; closing the forward
//!    channel tells the absorber to finalize.
//!
//! Files that fit into a single buffer skip the absorber thread entirely
//! and take the read-then-finalize path.
//!
//! ## Interruption and retry
//!
//! A read that fails with `ErrorKind::Interrupted` (signal delivery)
//! surfaces as [`DigestError::Interrupted`]. Any failure retries the whole
//! measurement once before being returned; interruption is never reported
//! as an integrity violation by callers.

use std::io::{self, ErrorKind};
use std::sync::mpsc;
use std::thread;

use log::warn;
use sha1::{Digest, Sha1};
use thiserror::Error;

use crate::fs::Filesystem;
use crate::types::{FileId, Sha1Digest};

/// Upper bound for one I/O buffer. Two of these are in flight during
/// double-buffered measurement.
pub const MAX_BUFFER_SIZE: usize = 32 * 1024;

/// Smallest buffer worth allocating (one page).
pub const MIN_BUFFER_SIZE: usize = 4096;

/// Measurement failure.
#[derive(Debug, Error)]
pub enum DigestError {
    /// Recomputed digest differs from the reference value.
    #[error("content digest does not match the reference value")]
    Mismatch,
    /// Signal delivery interrupted a read. Not a violation.
    #[error("measurement interrupted by signal delivery")]
    Interrupted,
    /// Underlying read failed.
    #[error("read error during measurement: {0}")]
    Io(io::Error),
}

fn map_io(err: io::Error) -> DigestError {
    if err.kind() == ErrorKind::Interrupted {
        DigestError::Interrupted
    } else {
        DigestError::Io(err)
    }
}

/// SHA-1 of an in-memory buffer.
pub fn digest_buffer(buf: &[u8]) -> Sha1Digest {
    Sha1::digest(buf).into()
}

/// Pick the chunk size for a file of `size` bytes: the next power of two,
/// clamped to one page at the low end and [`MAX_BUFFER_SIZE`] at the top.
fn buffer_size_for(size: u64) -> usize {
    let wanted = size.max(1).next_power_of_two();
    (wanted.min(MAX_BUFFER_SIZE as u64) as usize).max(MIN_BUFFER_SIZE)
}

/// Fill `buf` from `offset`, looping over partial reads. A premature end of
/// file is an error: the size was sampled before reading and the content
/// must still be there.
fn read_chunk(fs: &dyn Filesystem, id: FileId, mut offset: u64, buf: &mut [u8]) -> io::Result<()> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = fs.read_at(id, offset, &mut buf[filled..])?;
        if n == 0 {
            return Err(io::Error::new(
                ErrorKind::UnexpectedEof,
                "short read during measurement",
            ));
        }
        filled += n;
        offset += n as u64;
    }
    Ok(())
}

/// One measurement attempt over the whole file.
fn digest_file_once(fs: &dyn Filesystem, id: FileId) -> Result<Sha1Digest, DigestError> {
    let size = fs.metadata(id).map_err(map_io)?.size;
    let buf_size = buffer_size_for(size);

    if size <= buf_size as u64 {
        // Single-buffer path: one read, then the final update and finalize
        // together.
        let mut buf = vec![0u8; size as usize];
        read_chunk(fs, id, 0, &mut buf).map_err(map_io)?;
        return Ok(digest_buffer(&buf));
    }

    // Double-buffered path. The forward channel holds at most one filled
    // buffer, so while the absorber digests one chunk the producer reads
    // the next into the other buffer.
    let (filled_tx, filled_rx) = mpsc::sync_channel::<(Vec<u8>, usize)>(1);
    let (empty_tx, empty_rx) = mpsc::sync_channel::<Vec<u8>>(2);
    empty_tx
        .send(vec![0u8; buf_size])
        .expect("return channel has capacity for both buffers");
    empty_tx
        .send(vec![0u8; buf_size])
        .expect("return channel has capacity for both buffers");

    thread::scope(|s| {
        let absorber = s.spawn(move || {
            let mut hasher = Sha1::new();
            while let Ok((buf, len)) = filled_rx.recv() {
                hasher.update(&buf[..len]);
                // The producer may already be gone on a read error.
                let _ = empty_tx.send(buf);
            }
            let out: Sha1Digest = hasher.finalize().into();
            out
        });

        let mut offset = 0u64;
        let mut failure: Option<DigestError> = None;
        while offset < size {
            let mut buf = match empty_rx.recv() {
                Ok(buf) => buf,
                Err(_) => break,
            };
            let want = ((size - offset) as usize).min(buf_size);
            match read_chunk(fs, id, offset, &mut buf[..want]) {
                Ok(()) => {
                    offset += want as u64;
                    if filled_tx.send((buf, want)).is_err() {
                        break;
                    }
                }
                Err(err) => {
                    failure = Some(map_io(err));
                    break;
                }
            }
        }
        drop(filled_tx);

        let digest = absorber.join().map_err(|_| {
            DigestError::Io(io::Error::new(ErrorKind::Other, "digest absorber panicked"))
        })?;
        match failure {
            Some(err) => Err(err),
            None => Ok(digest),
        }
    })
}

/// SHA-1 of file content, with one retry on failure.
pub fn digest_file(fs: &dyn Filesystem, id: FileId) -> Result<Sha1Digest, DigestError> {
    match digest_file_once(fs, id) {
        Ok(digest) => Ok(digest),
        Err(first) => {
            warn!("measurement of ino {} failed ({first}), retrying once", id.ino);
            digest_file_once(fs, id)
        }
    }
}

/// Measure the file and compare against `expected`. The comparison is a
/// fixed-length 20-byte equality.
pub fn verify_refhash(
    fs: &dyn Filesystem,
    id: FileId,
    expected: &Sha1Digest,
) -> Result<(), DigestError> {
    let digest = digest_file(fs, id)?;
    if digest == *expected {
        Ok(())
    } else {
        Err(DigestError::Mismatch)
    }
}
