//! Per-path sample bus.
//!
//! A [`Stream`] fans units out to any number of attached [`Reader`]s. Each
//! reader gets its own bounded queue and its own dispatch task, so a slow
//! consumer never stalls the publisher or its siblings; when a reader's
//! queue is full the unit is dropped for that reader only. Reader callbacks
//! run on the dispatch task and must return promptly without blocking I/O.

use crate::desc::Session;
use crate::unit::Unit;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Callback registered per (media, format) pair.
pub type OnDataFn = Box<dyn Fn(&Unit) -> anyhow::Result<()> + Send + Sync>;

/// Parameters for [`Stream::new`].
pub struct StreamParams {
    pub desc: Session,
    /// Per-reader queue depth; full queues drop units for that reader.
    pub write_queue_size: usize,
}

impl Default for StreamParams {
    fn default() -> Self {
        Self {
            desc: Session::default(),
            write_queue_size: 256,
        }
    }
}

struct ReaderEntry {
    reader: Reader,
    tx: mpsc::Sender<(usize, usize, Arc<Unit>)>,
    task: tokio::task::JoinHandle<()>,
    dropped: Arc<AtomicU64>,
}

struct StreamInner {
    desc: RwLock<Session>,
    write_queue_size: usize,
    readers: Mutex<Vec<ReaderEntry>>,
}

/// A source stream on the bus. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct Stream {
    inner: Arc<StreamInner>,
}

impl Stream {
    #[must_use]
    pub fn new(params: StreamParams) -> Self {
        Self {
            inner: Arc::new(StreamInner {
                desc: RwLock::new(params.desc),
                write_queue_size: params.write_queue_size.max(1),
                readers: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Snapshot of the current session description.
    #[must_use]
    pub fn desc(&self) -> Session {
        self.inner.desc.read().clone()
    }

    /// Replace the session description (transcoder outputs swap their
    /// tentative description for the detected one).
    pub fn set_desc(&self, desc: Session) {
        *self.inner.desc.write() = desc;
    }

    #[must_use]
    pub fn reader_count(&self) -> usize {
        self.inner.readers.lock().len()
    }

    /// Attach a reader and start its dispatch task. Attaching the same
    /// reader twice is a no-op.
    pub fn add_reader(&self, reader: &Reader) {
        let mut readers = self.inner.readers.lock();
        if readers.iter().any(|e| e.reader.same_as(reader)) {
            return;
        }

        let (tx, mut rx) = mpsc::channel::<(usize, usize, Arc<Unit>)>(self.inner.write_queue_size);
        let r = reader.clone();
        let task = tokio::spawn(async move {
            while let Some((mi, fi, unit)) = rx.recv().await {
                let res = {
                    let callbacks = r.inner.callbacks.read();
                    match callbacks.get(&(mi, fi)) {
                        Some(cb) => cb(&unit),
                        None => Ok(()),
                    }
                };
                if let Err(err) = res {
                    r.inner.fail(err);
                    break;
                }
            }
        });

        readers.push(ReaderEntry {
            reader: reader.clone(),
            tx,
            task,
            dropped: Arc::new(AtomicU64::new(0)),
        });
    }

    /// Detach a reader; its dispatch task ends once the queue drains.
    /// Removing a reader that is not attached is a no-op.
    pub fn remove_reader(&self, reader: &Reader) {
        let mut readers = self.inner.readers.lock();
        if let Some(pos) = readers.iter().position(|e| e.reader.same_as(reader)) {
            let entry = readers.swap_remove(pos);
            drop(entry.tx);
            entry.task.abort();
        }
    }

    /// Dispatch a unit to every attached reader.
    pub fn write_unit(&self, media_idx: usize, format_idx: usize, unit: Unit) {
        let unit = Arc::new(unit);
        let readers = self.inner.readers.lock();
        for entry in readers.iter() {
            match entry.tx.try_send((media_idx, format_idx, Arc::clone(&unit))) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    let total = entry.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                    if total % 100 == 1 {
                        warn!(total_dropped = total, "reader queue full, unit dropped");
                    }
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!("reader dispatch task gone, unit skipped");
                }
            }
        }
    }

    /// Wrap a single RTP packet into a unit and dispatch it.
    pub fn write_rtp_packet(
        &self,
        media_idx: usize,
        format_idx: usize,
        packet: rtp::packet::Packet,
        ntp: SystemTime,
        pts: i64,
    ) {
        self.write_unit(media_idx, format_idx, Unit::new(vec![packet], ntp, pts));
    }
}

struct ReaderInner {
    callbacks: RwLock<HashMap<(usize, usize), OnDataFn>>,
    err_tx: mpsc::Sender<anyhow::Error>,
    err_rx: tokio::sync::Mutex<mpsc::Receiver<anyhow::Error>>,
}

impl ReaderInner {
    fn fail(&self, err: anyhow::Error) {
        // capacity 1: only the first fault is latched
        let _ = self.err_tx.try_send(err);
    }
}

/// A reader handle on the bus. Clone-shared; identity is the allocation.
#[derive(Clone)]
pub struct Reader {
    inner: Arc<ReaderInner>,
}

impl Default for Reader {
    fn default() -> Self {
        Self::new()
    }
}

impl Reader {
    #[must_use]
    pub fn new() -> Self {
        let (err_tx, err_rx) = mpsc::channel(1);
        Self {
            inner: Arc::new(ReaderInner {
                callbacks: RwLock::new(HashMap::new()),
                err_tx,
                err_rx: tokio::sync::Mutex::new(err_rx),
            }),
        }
    }

    fn same_as(&self, other: &Reader) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Register the data callback for a (media, format) pair. Must be called
    /// before the reader is attached.
    pub fn on_data(
        &self,
        media_idx: usize,
        format_idx: usize,
        cb: impl Fn(&Unit) -> anyhow::Result<()> + Send + Sync + 'static,
    ) {
        self.inner
            .callbacks
            .write()
            .insert((media_idx, format_idx), Box::new(cb));
    }

    /// Wait for the first callback fault. Resolves with an error when a
    /// callback failed; pends until then. Detaching the reader does not
    /// resolve this — callers select against their cancellation token.
    pub async fn wait_error(&self) -> anyhow::Error {
        let mut rx = self.inner.err_rx.lock().await;
        match rx.recv().await {
            Some(err) => err,
            None => anyhow::anyhow!("reader error channel closed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::desc::{Format, Media, MediaType};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn test_stream() -> Stream {
        Stream::new(StreamParams {
            desc: Session {
                medias: vec![Media {
                    media_type: MediaType::Video,
                    formats: vec![Format::H264 {
                        payload_type: 96,
                        sps: vec![0x67],
                        pps: vec![0x68],
                        packetization_mode: 1,
                    }],
                }],
            },
            write_queue_size: 8,
        })
    }

    fn test_packet(seq: u16) -> rtp::packet::Packet {
        rtp::packet::Packet {
            header: rtp::header::Header {
                version: 2,
                payload_type: 96,
                sequence_number: seq,
                timestamp: 1000,
                ssrc: 0xabcd,
                ..Default::default()
            },
            payload: bytes::Bytes::from_static(&[1, 2, 3]),
        }
    }

    #[tokio::test]
    async fn test_dispatch_to_reader() {
        let stream = test_stream();
        let reader = Reader::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let seen2 = Arc::clone(&seen);
        reader.on_data(0, 0, move |u| {
            assert!(!u.nil_payload());
            seen2.fetch_add(u.rtp_packets.len(), Ordering::SeqCst);
            Ok(())
        });
        stream.add_reader(&reader);

        for seq in 0..5 {
            stream.write_rtp_packet(0, 0, test_packet(seq), SystemTime::now(), 1000);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 5);

        stream.remove_reader(&reader);
        assert_eq!(stream.reader_count(), 0);
    }

    #[tokio::test]
    async fn test_callback_error_latched() {
        let stream = test_stream();
        let reader = Reader::new();
        reader.on_data(0, 0, |_| Err(anyhow::anyhow!("boom")));
        stream.add_reader(&reader);

        stream.write_rtp_packet(0, 0, test_packet(0), SystemTime::now(), 0);
        let err = tokio::time::timeout(Duration::from_secs(1), reader.wait_error())
            .await
            .expect("error not delivered");
        assert_eq!(err.to_string(), "boom");
    }

    #[tokio::test]
    async fn test_add_remove_idempotent() {
        let stream = test_stream();
        let reader = Reader::new();
        stream.add_reader(&reader);
        stream.add_reader(&reader);
        assert_eq!(stream.reader_count(), 1);
        stream.remove_reader(&reader);
        stream.remove_reader(&reader);
        assert_eq!(stream.reader_count(), 0);
    }

    #[tokio::test]
    async fn test_no_dispatch_after_detach() {
        let stream = test_stream();
        let reader = Reader::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let seen2 = Arc::clone(&seen);
        reader.on_data(0, 0, move |_| {
            seen2.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        stream.add_reader(&reader);
        stream.remove_reader(&reader);

        stream.write_rtp_packet(0, 0, test_packet(0), SystemTime::now(), 0);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 0);
    }
}
