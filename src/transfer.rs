//! Chunked file transfer over the `"file"` data channel.
//!
//! A transfer is one `metadata` control frame, the file body as fixed-size
//! binary chunks, and one `end` control frame. Control frames travel as JSON
//! text; chunks travel as raw binary frames. The carrying channel is reliable
//! and ordered, so reassembly is a plain concatenation in arrival order.

use crate::data_channel::Frame;
use crate::error::Error;
use bytes::{Bytes, BytesMut};
use futures_util::{Sink, SinkExt};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Size of every binary chunk except the last one.
pub const CHUNK_SIZE: usize = 16 * 1024;

/// Descriptive header of one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMeta {
    pub name: String,
    #[serde(rename = "mimeType")]
    pub mime_type: String,
    pub size: u64,
}

/// Control frames of the transfer protocol, sent as channel text frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ControlFrame {
    Metadata {
        name: String,
        #[serde(rename = "mimeType")]
        mime_type: String,
        size: u64,
    },
    End,
}

impl ControlFrame {
    fn metadata(meta: &FileMeta) -> Self {
        ControlFrame::Metadata {
            name: meta.name.clone(),
            mime_type: meta.mime_type.clone(),
            size: meta.size,
        }
    }
}

/// A fully reassembled inbound file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFile {
    pub meta: FileMeta,
    pub bytes: Bytes,
}

/// What a single accepted frame meant for the transfer in progress.
#[derive(Debug)]
pub enum TransferEvent {
    Started(FileMeta),
    Progress { received: u64, total: u64 },
    Completed(ReceivedFile),
}

#[derive(Debug)]
struct FileTransferState {
    meta: FileMeta,
    chunks: Vec<Bytes>,
    received: u64,
}

/// Receive-side state machine of the transfer protocol.
///
/// Pure: it consumes [Frame]s and produces [TransferEvent]s, no I/O. Protocol
/// violations surface as errors; the caller logs them and drops the frame,
/// the state of an in-flight transfer is never corrupted by them.
#[derive(Debug, Default)]
pub struct FileAssembler {
    active: Option<FileTransferState>,
}

impl FileAssembler {
    pub fn accept(&mut self, frame: Frame) -> Result<TransferEvent, Error> {
        match frame {
            Frame::Text(text) => match serde_json::from_str::<ControlFrame>(&text)? {
                ControlFrame::Metadata {
                    name,
                    mime_type,
                    size,
                } => {
                    if self.active.is_some() {
                        log::warn!("metadata while a transfer is active; discarding partial data");
                    }
                    let meta = FileMeta {
                        name,
                        mime_type,
                        size,
                    };
                    self.active = Some(FileTransferState {
                        meta: meta.clone(),
                        chunks: Vec::new(),
                        received: 0,
                    });
                    Ok(TransferEvent::Started(meta))
                }
                ControlFrame::End => {
                    let state = self.active.take().ok_or(Error::EndBeforeMetadata)?;
                    let mut body = BytesMut::with_capacity(state.received as usize);
                    for chunk in &state.chunks {
                        body.extend_from_slice(chunk);
                    }
                    // zero buffered chunks is a valid empty file, not an error
                    Ok(TransferEvent::Completed(ReceivedFile {
                        meta: state.meta,
                        bytes: body.freeze(),
                    }))
                }
            },
            Frame::Binary(data) => {
                let state = self.active.as_mut().ok_or(Error::ChunkBeforeMetadata)?;
                state.received += data.len() as u64;
                state.chunks.push(data);
                Ok(TransferEvent::Progress {
                    received: state.received,
                    total: state.meta.size,
                })
            }
        }
    }

    /// Discards the partial state of an interrupted transfer.
    ///
    /// Returns whether a transfer was actually in flight; a premature channel
    /// close must never silently complete one.
    pub fn abort(&mut self) -> bool {
        self.active.take().is_some()
    }

    pub fn in_progress(&self) -> bool {
        self.active.is_some()
    }
}

/// Session-wide send lock.
///
/// A single outbound transfer may be in flight at a time, and chat sends
/// honor the same lock as a double-submission guard.
#[derive(Debug, Clone, Default)]
pub struct SendGuard(Arc<AtomicBool>);

impl SendGuard {
    /// Takes the lock, or fails with [Error::SendBusy] if it is held.
    pub fn acquire(&self) -> Result<SendPermit, Error> {
        if self.0.swap(true, Ordering::SeqCst) {
            Err(Error::SendBusy)
        } else {
            Ok(SendPermit(self.0.clone()))
        }
    }

    pub fn is_busy(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Held for the duration of one send; releases the lock on drop.
#[derive(Debug)]
pub struct SendPermit(Arc<AtomicBool>);

impl Drop for SendPermit {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Streams one file over `sink` as metadata, chunks and the end marker.
///
/// `on_progress` observes the ratio of bytes emitted so far to the total; it
/// is non-decreasing and reaches exactly `1.0` on completion, which for an
/// empty file is the only value reported.
pub async fn send_file<S>(
    sink: &mut S,
    meta: &FileMeta,
    bytes: Bytes,
    mut on_progress: impl FnMut(f64),
) -> Result<(), Error>
where
    S: Sink<Frame, Error = Error> + Unpin,
{
    let header = serde_json::to_string(&ControlFrame::metadata(meta))?;
    sink.send(Frame::Text(header)).await?;

    let total = bytes.len();
    let mut sent = 0;
    while sent < total {
        let end = usize::min(sent + CHUNK_SIZE, total);
        sink.send(Frame::Binary(bytes.slice(sent..end))).await?;
        sent = end;
        on_progress(sent as f64 / total as f64);
    }

    let trailer = serde_json::to_string(&ControlFrame::End)?;
    sink.send(Frame::Text(trailer)).await?;
    on_progress(1.0);
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    /// Sink collecting frames for inspection.
    #[derive(Debug, Default)]
    struct VecSink(Vec<Frame>);

    impl Sink<Frame> for VecSink {
        type Error = Error;

        fn poll_ready(
            self: std::pin::Pin<&mut Self>,
            _: &mut std::task::Context<'_>,
        ) -> std::task::Poll<Result<(), Error>> {
            std::task::Poll::Ready(Ok(()))
        }

        fn start_send(mut self: std::pin::Pin<&mut Self>, item: Frame) -> Result<(), Error> {
            self.0.push(item);
            Ok(())
        }

        fn poll_flush(
            self: std::pin::Pin<&mut Self>,
            _: &mut std::task::Context<'_>,
        ) -> std::task::Poll<Result<(), Error>> {
            std::task::Poll::Ready(Ok(()))
        }

        fn poll_close(
            self: std::pin::Pin<&mut Self>,
            _: &mut std::task::Context<'_>,
        ) -> std::task::Poll<Result<(), Error>> {
            std::task::Poll::Ready(Ok(()))
        }
    }

    fn meta(size: u64) -> FileMeta {
        FileMeta {
            name: "report.pdf".to_owned(),
            mime_type: "application/pdf".to_owned(),
            size,
        }
    }

    fn sample(len: usize) -> Bytes {
        (0..len).map(|i| (i % 251) as u8).collect::<Vec<_>>().into()
    }

    #[tokio::test]
    async fn chunk_layout_40000_bytes() {
        let body = sample(40000);
        let mut sink = VecSink::default();
        send_file(&mut sink, &meta(40000), body, |_| {}).await.unwrap();

        // metadata, ceil(40000 / 16384) = 3 chunks, end
        assert_eq!(sink.0.len(), 5);
        let sizes: Vec<usize> = sink.0[1..4]
            .iter()
            .map(|f| match f {
                Frame::Binary(b) => b.len(),
                Frame::Text(_) => panic!("chunk expected"),
            })
            .collect();
        assert_eq!(sizes, vec![16384, 16384, 7232]);
    }

    #[tokio::test]
    async fn exact_multiple_has_no_short_chunk() {
        let mut sink = VecSink::default();
        send_file(&mut sink, &meta(32768), sample(32768), |_| {}).await.unwrap();
        let sizes: Vec<usize> = sink.0[1..3]
            .iter()
            .map(|f| match f {
                Frame::Binary(b) => b.len(),
                Frame::Text(_) => panic!("chunk expected"),
            })
            .collect();
        assert_eq!(sizes, vec![16384, 16384]);
    }

    #[tokio::test]
    async fn roundtrip_reproduces_bytes_exactly() {
        for len in [0usize, 1, 16384, 16385, 40000] {
            let body = sample(len);
            let mut sink = VecSink::default();
            send_file(&mut sink, &meta(len as u64), body.clone(), |_| {})
                .await
                .unwrap();

            let mut assembler = FileAssembler::default();
            let mut completed = None;
            for frame in sink.0 {
                if let TransferEvent::Completed(file) = assembler.accept(frame).unwrap() {
                    completed = Some(file);
                }
            }
            let file = completed.expect("transfer must complete");
            assert_eq!(file.bytes, body, "length {len}");
            assert_eq!(file.meta, meta(len as u64));
        }
    }

    #[tokio::test]
    async fn progress_is_monotone_and_reaches_one() {
        let mut sink = VecSink::default();
        let mut seen = Vec::new();
        send_file(&mut sink, &meta(40000), sample(40000), |p| seen.push(p))
            .await
            .unwrap();
        assert!(seen.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(seen.last().copied(), Some(1.0));
    }

    #[tokio::test]
    async fn empty_file_reports_only_completion() {
        let mut sink = VecSink::default();
        let mut seen = Vec::new();
        send_file(&mut sink, &meta(0), Bytes::new(), |p| seen.push(p))
            .await
            .unwrap();
        assert_eq!(seen, vec![1.0]);
    }

    #[test]
    fn end_without_chunks_yields_empty_named_file() {
        let mut assembler = FileAssembler::default();
        let started = assembler
            .accept(Frame::Text(r#"{"type":"metadata","name":"a.txt","mimeType":"text/plain","size":0}"#.to_owned()))
            .unwrap();
        assert!(matches!(started, TransferEvent::Started(_)));
        match assembler.accept(Frame::Text(r#"{"type":"end"}"#.to_owned())).unwrap() {
            TransferEvent::Completed(file) => {
                assert!(file.bytes.is_empty());
                assert_eq!(file.meta.name, "a.txt");
                assert_eq!(file.meta.mime_type, "text/plain");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn chunk_before_metadata_is_rejected_not_fatal() {
        let mut assembler = FileAssembler::default();
        let err = assembler
            .accept(Frame::Binary(Bytes::from_static(b"stray")))
            .unwrap_err();
        assert!(matches!(err, Error::ChunkBeforeMetadata));

        // the assembler stays usable afterwards
        assembler
            .accept(Frame::Text(r#"{"type":"metadata","name":"b","mimeType":"x","size":5}"#.to_owned()))
            .unwrap();
        assembler.accept(Frame::Binary(Bytes::from_static(b"hello"))).unwrap();
        match assembler.accept(Frame::Text(r#"{"type":"end"}"#.to_owned())).unwrap() {
            TransferEvent::Completed(file) => assert_eq!(&file.bytes[..], b"hello"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn end_before_metadata_is_rejected() {
        let mut assembler = FileAssembler::default();
        let err = assembler
            .accept(Frame::Text(r#"{"type":"end"}"#.to_owned()))
            .unwrap_err();
        assert!(matches!(err, Error::EndBeforeMetadata));
    }

    #[test]
    fn garbage_json_leaves_transfer_untouched() {
        let mut assembler = FileAssembler::default();
        assembler
            .accept(Frame::Text(r#"{"type":"metadata","name":"c","mimeType":"x","size":3}"#.to_owned()))
            .unwrap();
        assembler.accept(Frame::Binary(Bytes::from_static(b"abc"))).unwrap();

        let err = assembler.accept(Frame::Text("not json".to_owned())).unwrap_err();
        assert!(matches!(err, Error::Frame(_)));
        assert!(assembler.in_progress());

        match assembler.accept(Frame::Text(r#"{"type":"end"}"#.to_owned())).unwrap() {
            TransferEvent::Completed(file) => assert_eq!(&file.bytes[..], b"abc"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn new_metadata_resets_partial_transfer() {
        let mut assembler = FileAssembler::default();
        assembler
            .accept(Frame::Text(r#"{"type":"metadata","name":"first","mimeType":"x","size":10}"#.to_owned()))
            .unwrap();
        assembler.accept(Frame::Binary(Bytes::from_static(b"partial"))).unwrap();

        assembler
            .accept(Frame::Text(r#"{"type":"metadata","name":"second","mimeType":"y","size":3}"#.to_owned()))
            .unwrap();
        assembler.accept(Frame::Binary(Bytes::from_static(b"new"))).unwrap();
        match assembler.accept(Frame::Text(r#"{"type":"end"}"#.to_owned())).unwrap() {
            TransferEvent::Completed(file) => {
                assert_eq!(file.meta.name, "second");
                assert_eq!(&file.bytes[..], b"new");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn abort_discards_partial_state() {
        let mut assembler = FileAssembler::default();
        assert!(!assembler.abort());
        assembler
            .accept(Frame::Text(r#"{"type":"metadata","name":"d","mimeType":"x","size":4}"#.to_owned()))
            .unwrap();
        assert!(assembler.abort());
        assert!(!assembler.in_progress());
    }

    #[test]
    fn send_guard_rejects_second_acquire() {
        let guard = SendGuard::default();
        let permit = guard.acquire().unwrap();
        assert!(matches!(guard.acquire(), Err(Error::SendBusy)));
        assert!(guard.is_busy());
        drop(permit);
        assert!(guard.acquire().is_ok());
    }

    #[test]
    fn control_frame_wire_shape() {
        let text = serde_json::to_string(&ControlFrame::metadata(&meta(7))).unwrap();
        assert_eq!(
            text,
            r#"{"type":"metadata","name":"report.pdf","mimeType":"application/pdf","size":7}"#
        );
        assert_eq!(serde_json::to_string(&ControlFrame::End).unwrap(), r#"{"type":"end"}"#);
    }
}
