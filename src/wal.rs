use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::{Event, Reservation, ReservationId};

/// Write one record as `[u32 len][bincode payload][u32 crc32]`, little endian.
fn write_record(out: &mut impl Write, event: &Event) -> io::Result<()> {
    let payload = bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "wal record too large"))?;
    out.write_all(&len.to_le_bytes())?;
    out.write_all(&payload)?;
    out.write_all(&crc32fast::hash(&payload).to_le_bytes())
}

/// Read one record. `Ok(None)` marks the end of the usable log: clean EOF,
/// a torn tail, a CRC mismatch or an undecodable payload.
fn read_record(input: &mut impl Read) -> io::Result<Option<Event>> {
    let mut word = [0u8; 4];
    if !fill(input, &mut word)? {
        return Ok(None);
    }
    let mut payload = vec![0u8; u32::from_le_bytes(word) as usize];
    if !fill(input, &mut payload)? || !fill(input, &mut word)? {
        return Ok(None);
    }
    if u32::from_le_bytes(word) != crc32fast::hash(&payload) {
        return Ok(None);
    }
    Ok(bincode::deserialize(&payload).ok())
}

fn fill(input: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match input.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Fold an event history down to the reservations still live at its end,
/// in first-created order.
pub fn fold_live(events: impl IntoIterator<Item = Event>) -> Vec<Reservation> {
    let mut order: Vec<ReservationId> = Vec::new();
    let mut live: HashMap<ReservationId, Reservation> = HashMap::new();
    for event in events {
        match event {
            Event::ReservationCreated { reservation } | Event::ReservationUpdated { reservation } => {
                if !live.contains_key(&reservation.id) {
                    order.push(reservation.id);
                }
                live.insert(reservation.id, reservation);
            }
            Event::ReservationDeleted { id, .. } => {
                live.remove(&id);
            }
        }
    }
    order.into_iter().filter_map(|id| live.remove(&id)).collect()
}

/// Append-only reservation log.
///
/// Records are buffered by `append_buffered` and made durable together by
/// `flush_sync`. A torn or corrupt tail left by a crash is dropped on replay.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
}

impl Wal {
    pub fn open(path: &Path) -> io::Result<Self> {
        Ok(Self {
            writer: BufWriter::new(Self::open_append(path)?),
            path: path.to_path_buf(),
            appends_since_compact: 0,
        })
    }

    fn open_append(path: &Path) -> io::Result<File> {
        OpenOptions::new().create(true).append(true).open(path)
    }

    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_buffered(event)?;
        self.flush_sync()
    }

    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        write_record(&mut self.writer, event)?;
        self.appends_since_compact += 1;
        Ok(())
    }

    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Rewrite the log as one `ReservationCreated` per live reservation.
    ///
    /// The current file is the source of truth, so this must run on the
    /// task that owns the writer, between batches. Returns the number of
    /// live reservations written.
    pub fn compact(&mut self) -> io::Result<usize> {
        self.flush_sync()?;
        let live = fold_live(Self::replay(&self.path)?);
        let tmp = self.path.with_extension("wal.tmp");
        {
            let mut out = BufWriter::new(File::create(&tmp)?);
            for reservation in &live {
                write_record(&mut out, &Event::ReservationCreated {
                    reservation: reservation.clone(),
                })?;
            }
            out.flush()?;
            out.get_ref().sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        self.writer = BufWriter::new(Self::open_append(&self.path)?);
        self.appends_since_compact = 0;
        Ok(live.len())
    }

    /// Every intact event in the log, oldest first. A missing file is an
    /// empty log.
    pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        let mut events = Vec::new();
        while let Some(event) = read_record(&mut reader)? {
            events.push(event);
        }
        Ok(events)
    }
}
