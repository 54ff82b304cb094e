//! Output sinks for downloaded blocks.
//!
//! Blocks arrive in arbitrary order from up to two connections. A file
//! sink writes them at their final offset directly; stdout cannot seek, so
//! it holds out-of-order blocks in a reorder buffer and flushes the
//! in-order prefix.

use std::collections::BTreeMap;
use std::io::SeekFrom;

use tokio::fs::File;
use tokio::io::{self, AsyncSeekExt, AsyncWriteExt, Stdout};

use cmb_proto::{BlockId, BLOCK_SIZE};

/// Where downloaded blocks go.
pub enum Sink {
    File(File),
    Stdout {
        stdout: Stdout,
        pending: BTreeMap<BlockId, Vec<u8>>,
        next: BlockId,
    },
    Null,
}

impl Sink {
    /// Opens a sink for the given CLI output spec: a path, `-` for stdout,
    /// or `/dev/null` to discard.
    ///
    /// A file is pre-sized to the resource length, so an empty resource
    /// yields an empty file without any block writes.
    pub async fn create(spec: &str, resource_length: u64) -> io::Result<Sink> {
        match spec {
            "-" => Ok(Sink::Stdout {
                stdout: io::stdout(),
                pending: BTreeMap::new(),
                next: 0,
            }),
            "/dev/null" => Ok(Sink::Null),
            path => {
                let file = File::create(path).await?;
                file.set_len(resource_length).await?;
                Ok(Sink::File(file))
            }
        }
    }

    /// Writes one decoded block. Blocks may arrive in any order but each
    /// id is written at most once.
    pub async fn write_block(&mut self, block_id: BlockId, data: &[u8]) -> io::Result<()> {
        match self {
            Sink::File(file) => {
                file.seek(SeekFrom::Start(block_id * BLOCK_SIZE)).await?;
                file.write_all(data).await
            }
            Sink::Stdout { stdout, pending, next } => {
                pending.insert(block_id, data.to_vec());
                while let Some(chunk) = pending.remove(next) {
                    stdout.write_all(&chunk).await?;
                    *next += 1;
                }
                Ok(())
            }
            Sink::Null => Ok(()),
        }
    }

    /// Flushes buffered output once the transfer is complete.
    pub async fn finish(&mut self) -> io::Result<()> {
        match self {
            Sink::File(file) => file.flush().await,
            Sink::Stdout { stdout, .. } => stdout.flush().await,
            Sink::Null => Ok(()),
        }
    }
}
