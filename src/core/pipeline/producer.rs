//! Chunk Producer: slices a file into ordered segments on its own task.
//!
//! The coordinator talks to the task only through messages:
//!
//! ```text
//!   coordinator                     producer task
//!   ── INIT(source, size, offset) ─►  open / seek
//!   ◄─────────────────── READY ─────
//!   ── NEXT ───────────────────────►  read one chunk
//!   ◄──────── CHUNK(data, offset) ──
//!   ── NEXT ───────────────────────►
//!   ◄──────────────────────── END ──
//! ```
//!
//! The task owns the file handle for the whole transfer and never reads
//! ahead: chunk n+1 is read only after the coordinator asks for it.

use bytes::{Bytes, BytesMut};
use std::path::PathBuf;
use tokio::io::{AsyncReadExt, AsyncSeekExt, SeekFrom};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::trace;

use crate::core::error::{CoreError, CoreResult};

/// Where the bytes of an outgoing file come from.
#[derive(Debug, Clone)]
pub enum FileSource {
    Path(PathBuf),
    Memory(Bytes),
}

enum Request {
    Init {
        source: FileSource,
        chunk_size: usize,
        start_offset: u64,
    },
    Next,
}

enum Response {
    Ready { size: u64 },
    Chunk { data: Bytes, offset: u64 },
    End,
    Failed(String),
}

/// One produced segment.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub data: Bytes,
    /// Position of the first byte of `data` in the file.
    pub offset: u64,
}

/// Handle on a running producer task. Dropping it stops the task.
pub struct ChunkProducer {
    requests: mpsc::Sender<Request>,
    responses: mpsc::Receiver<Response>,
    task: JoinHandle<()>,
}

impl ChunkProducer {
    pub fn spawn() -> Self {
        let (req_tx, req_rx) = mpsc::channel(1);
        let (resp_tx, resp_rx) = mpsc::channel(1);
        let task = tokio::spawn(run(req_rx, resp_tx));
        Self {
            requests: req_tx,
            responses: resp_rx,
            task,
        }
    }

    async fn call(&mut self, request: Request) -> CoreResult<Response> {
        self.requests
            .send(request)
            .await
            .map_err(|_| CoreError::Producer("producer task stopped".into()))?;
        self.responses
            .recv()
            .await
            .ok_or_else(|| CoreError::Producer("producer task stopped".into()))
    }

    /// INIT → READY. Returns the total size of the source.
    pub async fn init(&mut self, source: FileSource, chunk_size: usize, start_offset: u64) -> CoreResult<u64> {
        match self
            .call(Request::Init {
                source,
                chunk_size,
                start_offset,
            })
            .await?
        {
            Response::Ready { size } => Ok(size),
            Response::Failed(reason) => Err(CoreError::Producer(reason)),
            _ => Err(CoreError::Producer("unexpected reply to INIT".into())),
        }
    }

    /// NEXT → CHUNK or END (`None`).
    pub async fn next(&mut self) -> CoreResult<Option<Chunk>> {
        match self.call(Request::Next).await? {
            Response::Chunk { data, offset } => Ok(Some(Chunk { data, offset })),
            Response::End => Ok(None),
            Response::Failed(reason) => Err(CoreError::Producer(reason)),
            Response::Ready { .. } => Err(CoreError::Producer("unexpected reply to NEXT".into())),
        }
    }
}

impl Drop for ChunkProducer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

// ── Task side ────────────────────────────────────────────────────────────────

enum Reader {
    File {
        file: tokio::fs::File,
        size: u64,
        offset: u64,
        chunk_size: usize,
    },
    Memory {
        data: Bytes,
        offset: u64,
        chunk_size: usize,
    },
}

impl Reader {
    async fn open(source: FileSource, chunk_size: usize, start_offset: u64) -> Result<(Self, u64), String> {
        if chunk_size == 0 {
            return Err("chunk size must be positive".into());
        }
        match source {
            FileSource::Path(path) => {
                let mut file = tokio::fs::File::open(&path)
                    .await
                    .map_err(|e| format!("open {}: {e}", path.display()))?;
                let size = file
                    .metadata()
                    .await
                    .map_err(|e| format!("stat {}: {e}", path.display()))?
                    .len();
                let offset = start_offset.min(size);
                file.seek(SeekFrom::Start(offset))
                    .await
                    .map_err(|e| format!("seek {}: {e}", path.display()))?;
                Ok((
                    Reader::File {
                        file,
                        size,
                        offset,
                        chunk_size,
                    },
                    size,
                ))
            }
            FileSource::Memory(data) => {
                let size = data.len() as u64;
                Ok((
                    Reader::Memory {
                        data,
                        offset: start_offset.min(size),
                        chunk_size,
                    },
                    size,
                ))
            }
        }
    }

    async fn next(&mut self) -> Result<Option<Chunk>, String> {
        match self {
            Reader::File {
                file,
                size,
                offset,
                chunk_size,
            } => {
                if *offset >= *size {
                    return Ok(None);
                }
                let len = (*chunk_size as u64).min(*size - *offset) as usize;
                let mut buf = BytesMut::zeroed(len);
                file.read_exact(&mut buf)
                    .await
                    .map_err(|e| format!("read at {offset}: {e}"))?;
                let chunk = Chunk {
                    data: buf.freeze(),
                    offset: *offset,
                };
                *offset += len as u64;
                Ok(Some(chunk))
            }
            Reader::Memory {
                data,
                offset,
                chunk_size,
            } => {
                let size = data.len() as u64;
                if *offset >= size {
                    return Ok(None);
                }
                let start = *offset as usize;
                let end = (start + *chunk_size).min(data.len());
                let chunk = Chunk {
                    data: data.slice(start..end),
                    offset: *offset,
                };
                *offset = end as u64;
                Ok(Some(chunk))
            }
        }
    }
}

async fn run(mut requests: mpsc::Receiver<Request>, responses: mpsc::Sender<Response>) {
    let mut reader: Option<Reader> = None;
    while let Some(request) = requests.recv().await {
        let response = match request {
            Request::Init {
                source,
                chunk_size,
                start_offset,
            } => match Reader::open(source, chunk_size, start_offset).await {
                Ok((r, size)) => {
                    reader = Some(r);
                    Response::Ready { size }
                }
                Err(reason) => Response::Failed(reason),
            },
            Request::Next => match reader.as_mut() {
                None => Response::Failed("NEXT before INIT".into()),
                Some(r) => match r.next().await {
                    Ok(Some(chunk)) => {
                        trace!(event = "chunk_produced", offset = chunk.offset, len = chunk.data.len(), "Chunk produced");
                        Response::Chunk {
                            data: chunk.data,
                            offset: chunk.offset,
                        }
                    }
                    Ok(None) => Response::End,
                    Err(reason) => Response::Failed(reason),
                },
            },
        };
        if responses.send(response).await.is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn drain(producer: &mut ChunkProducer) -> Vec<Chunk> {
        let mut chunks = Vec::new();
        while let Some(chunk) = producer.next().await.unwrap() {
            chunks.push(chunk);
        }
        chunks
    }

    fn sample(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[tokio::test]
    async fn memory_source_yields_ordered_chunks() {
        let data = sample(200_000);
        let mut producer = ChunkProducer::spawn();
        let size = producer
            .init(FileSource::Memory(Bytes::from(data.clone())), 65_536, 0)
            .await
            .unwrap();
        assert_eq!(size, 200_000);

        let chunks = drain(&mut producer).await;
        let sizes: Vec<usize> = chunks.iter().map(|c| c.data.len()).collect();
        assert_eq!(sizes, vec![65_536, 65_536, 65_536, 3_392]);
        let offsets: Vec<u64> = chunks.iter().map(|c| c.offset).collect();
        assert_eq!(offsets, vec![0, 65_536, 131_072, 196_608]);

        let joined: Vec<u8> = chunks.iter().flat_map(|c| c.data.iter().copied()).collect();
        assert_eq!(joined, data);
        assert!(producer.next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn file_source_matches_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("payload.bin");
        let data = sample(70_000);
        std::fs::write(&path, &data).unwrap();

        let mut producer = ChunkProducer::spawn();
        assert_eq!(producer.init(FileSource::Path(path), 16_384, 0).await.unwrap(), 70_000);
        let chunks = drain(&mut producer).await;
        assert_eq!(chunks.len(), 5);
        assert_eq!(chunks[4].data.len(), 70_000 - 4 * 16_384);
        let joined: Vec<u8> = chunks.iter().flat_map(|c| c.data.iter().copied()).collect();
        assert_eq!(joined, data);
    }

    #[tokio::test]
    async fn start_offset_skips_leading_bytes() {
        let data = sample(10_000);
        let mut producer = ChunkProducer::spawn();
        producer
            .init(FileSource::Memory(Bytes::from(data.clone())), 4_096, 8_192)
            .await
            .unwrap();
        let chunks = drain(&mut producer).await;
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].offset, 8_192);
        assert_eq!(&chunks[0].data[..], &data[8_192..]);
    }

    #[tokio::test]
    async fn empty_source_ends_immediately() {
        let mut producer = ChunkProducer::spawn();
        assert_eq!(producer.init(FileSource::Memory(Bytes::new()), 1024, 0).await.unwrap(), 0);
        assert!(producer.next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn protocol_misuse_is_an_error() {
        let mut producer = ChunkProducer::spawn();
        assert!(matches!(producer.next().await, Err(CoreError::Producer(_))));

        let missing = std::env::temp_dir().join("nwshare-producer-missing-file.bin");
        let err = producer
            .init(FileSource::Path(missing), 1024, 0)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Producer(_)));

        let err = producer
            .init(FileSource::Memory(Bytes::from_static(b"abc")), 0, 0)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Producer(_)));
    }
}
