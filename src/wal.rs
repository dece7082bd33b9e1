use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::{mpsc, oneshot};

/// Encode a single record to [len][bincode][crc32] format.
fn encode_record<T: Serialize>(writer: &mut impl Write, record: &T) -> io::Result<()> {
    let payload =
        bincode::serialize(record).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = payload.len() as u32;
    let crc = crc32fast::hash(&payload);
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc.to_le_bytes())?;
    Ok(())
}

/// Append-only Write-Ahead Log of `T` records.
///
/// Format per entry: `[u32: len][bincode: T][u32: crc32]`
/// - `len` is the byte length of the bincode payload (not including the CRC).
/// - Truncated last entry (crash) is safely discarded via length-prefix + CRC check.
pub struct Wal<T> {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
    _record: PhantomData<fn() -> T>,
}

impl<T: Serialize + DeserializeOwned> Wal<T> {
    /// Open (or create) the WAL file at `path`.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            appends_since_compact: 0,
            _record: PhantomData,
        })
    }

    /// Append a single record and fsync. Used by tests only;
    /// production code goes through [`WalWriter`] for group commit.
    #[cfg(test)]
    pub fn append(&mut self, record: &T) -> io::Result<()> {
        self.append_buffered(record)?;
        self.flush_sync()
    }

    /// Append to the BufWriter without flushing or syncing.
    pub fn append_buffered(&mut self, record: &T) -> io::Result<()> {
        encode_record(&mut self.writer, record)?;
        self.appends_since_compact += 1;
        Ok(())
    }

    /// Flush the BufWriter and fsync the underlying file.
    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write compacted records to a temp file and fsync.
    pub fn write_compact_file(path: &Path, records: &[T]) -> io::Result<()> {
        let tmp_path = path.with_extension("wal.tmp");
        let file = File::create(&tmp_path)?;
        let mut writer = BufWriter::new(file);
        for record in records {
            encode_record(&mut writer, record)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()?;
        Ok(())
    }

    /// Atomic swap: rename temp file over the WAL and reopen.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        let tmp_path = self.path.with_extension("wal.tmp");
        fs::rename(&tmp_path, &self.path)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        self.writer = BufWriter::new(file);
        self.appends_since_compact = 0;
        Ok(())
    }

    #[cfg(test)]
    pub fn compact(&mut self, records: &[T]) -> io::Result<()> {
        Self::write_compact_file(&self.path, records)?;
        self.swap_compact_file()
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Replay the WAL from disk, returning all valid records.
    /// Truncated/corrupt trailing entries are silently discarded.
    pub fn replay(path: &Path) -> io::Result<Vec<T>> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        let mut records = Vec::new();

        loop {
            let mut len_buf = [0u8; 4];
            match reader.read_exact(&mut len_buf) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e),
            }
            let len = u32::from_le_bytes(len_buf) as usize;

            let mut payload = vec![0u8; len];
            match reader.read_exact(&mut payload) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break, // truncated
                Err(e) => return Err(e),
            }

            let mut crc_buf = [0u8; 4];
            match reader.read_exact(&mut crc_buf) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break, // truncated
                Err(e) => return Err(e),
            }
            if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
                break;
            }

            match bincode::deserialize::<T>(&payload) {
                Ok(record) => records.push(record),
                Err(_) => break,
            }
        }

        Ok(records)
    }
}

// ── Group-commit writer ──────────────────────────────────────────

enum WalCommand<T> {
    Append {
        record: T,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        records: Vec<T>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Handle to a background task that owns a [`Wal`] and batches appends.
///
/// 1. Block until the first Append arrives.
/// 2. Drain all immediately available Appends (the batch window).
/// 3. Single flush_sync for the whole batch.
/// 4. Respond to all senders with the batch result.
pub struct WalWriter<T> {
    tx: mpsc::Sender<WalCommand<T>>,
    name: &'static str,
}

impl<T> Clone for WalWriter<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            name: self.name,
        }
    }
}

impl<T> WalWriter<T>
where
    T: Serialize + DeserializeOwned + Send + 'static,
{
    /// Spawn the writer task. `name` labels the flush metrics.
    pub fn spawn(wal: Wal<T>, name: &'static str) -> Self {
        let (tx, rx) = mpsc::channel(4096);
        tokio::spawn(writer_loop(wal, rx, name));
        Self { tx, name }
    }

    /// Durably append one record. Returns once the batch holding it is fsynced.
    pub async fn append(&self, record: T) -> io::Result<()> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(WalCommand::Append { record, response: tx })
            .await
            .map_err(|_| io::Error::other(format!("{} WAL writer shut down", self.name)))?;
        rx.await
            .map_err(|_| io::Error::other(format!("{} WAL writer dropped response", self.name)))?
    }

    /// Replace the log with `records`.
    pub async fn compact(&self, records: Vec<T>) -> io::Result<()> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(WalCommand::Compact { records, response: tx })
            .await
            .map_err(|_| io::Error::other(format!("{} WAL writer shut down", self.name)))?;
        rx.await
            .map_err(|_| io::Error::other(format!("{} WAL writer dropped response", self.name)))?
    }

    pub async fn appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

async fn writer_loop<T>(mut wal: Wal<T>, mut rx: mpsc::Receiver<WalCommand<T>>, name: &'static str)
where
    T: Serialize + DeserializeOwned,
{
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { record, response } => {
                let mut batch = vec![(record, response)];
                let mut deferred = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { record, response }) => batch.push((record, response)),
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break, // channel empty, flush batch
                    }
                }

                metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE, "log" => name)
                    .record(batch.len() as f64);
                let flush_start = std::time::Instant::now();
                let result = flush_batch(&mut wal, &batch);
                metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS, "log" => name)
                    .record(flush_start.elapsed().as_secs_f64());
                respond_batch(batch, &result);

                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_batch<T: Serialize + DeserializeOwned>(
    wal: &mut Wal<T>,
    batch: &[(T, oneshot::Sender<io::Result<()>>)],
) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (record, _) in batch {
        if let Err(e) = wal.append_buffered(record) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush, even on append error, so partially buffered bytes
    // don't leak into the next batch (callers were told this batch failed).
    let flush_err = wal.flush_sync().err();
    if let Some(e) = append_err {
        return Err(e);
    }
    if let Some(e) = flush_err {
        return Err(e);
    }
    Ok(())
}

fn respond_batch<T>(batch: Vec<(T, oneshot::Sender<io::Result<()>>)>, result: &io::Result<()>) {
    for (_, tx) in batch {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append<T: Serialize + DeserializeOwned>(wal: &mut Wal<T>, cmd: WalCommand<T>) {
    match cmd {
        WalCommand::Compact { records, response } => {
            let result = Wal::write_compact_file(wal.path(), &records)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}
