//! Optional per-mesh geometry compression on a worker pool.
//!
//! A [`MeshCodec`] turns one [`BinaryAttributeBuffer`] into an opaque
//! compressed block (for example a Draco bitstream). The [`MeshCompressor`]
//! runs one task per submitted buffer and hands the results back, in
//! submission order, only from [`MeshCompressor::wait_all`].

use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::mpsc::{Receiver, sync_channel};

use rootcause::Report;
use thiserror::Error;
use tracing::{debug, warn};

use crate::export::buffer::BinaryAttributeBuffer;

pub const DRACO_EXTENSION: &str = "KHR_draco_mesh_compression";

#[derive(Debug, Error)]
pub enum CompressionError {
    #[error("codec failed to encode mesh: {0}")]
    Codec(String),
    #[error("compression task {task} ended without producing a result")]
    WorkerLost { task: usize },
    #[error("could not start compression pool: {0}")]
    Pool(String),
}

/// A geometry compression codec.
///
/// Implementations are shared across worker threads.
pub trait MeshCodec: Send + Sync {
    /// glTF extension that primitives compressed by this codec declare.
    fn extension_name(&self) -> &str {
        DRACO_EXTENSION
    }

    fn encode(&self, buffer: &BinaryAttributeBuffer) -> Result<CompressedBlock, CompressionError>;
}

/// Signature of the routine that frees codec-owned memory.
pub type ReleaseFn = unsafe fn(ptr: *mut u8, len: usize);

/// Compressed bytes owned by an external codec.
///
/// The memory is released exactly once, when the block is dropped. This is the
/// only place the crate touches codec-owned memory.
pub struct NativeBlock {
    ptr: NonNull<u8>,
    len: usize,
    release: ReleaseFn,
}

// The block is the unique owner of its allocation.
unsafe impl Send for NativeBlock {}

impl NativeBlock {
    /// Takes ownership of `len` bytes at `ptr`. Returns `None` for a null pointer.
    ///
    /// # Safety
    ///
    /// `ptr` must point to `len` initialized bytes that stay valid and
    /// unaliased until `release(ptr, len)` is called, and `release` must be
    /// the matching deallocation routine.
    pub unsafe fn from_raw(ptr: *mut u8, len: usize, release: ReleaseFn) -> Option<Self> {
        NonNull::new(ptr).map(|ptr| NativeBlock { ptr, len, release })
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: upheld by the contract of `from_raw`.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Copy the bytes out and release the native memory.
    pub fn into_owned(self) -> Vec<u8> {
        self.as_slice().to_vec()
    }
}

impl Drop for NativeBlock {
    fn drop(&mut self) {
        // SAFETY: `from_raw` guarantees `release` matches the allocation, and
        // drop runs once.
        unsafe { (self.release)(self.ptr.as_ptr(), self.len) }
    }
}

impl std::fmt::Debug for NativeBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeBlock").field("len", &self.len).finish()
    }
}

/// Output of one codec run.
#[derive(Debug)]
pub enum CompressedBlock {
    Owned(Vec<u8>),
    Native(NativeBlock),
}

impl CompressedBlock {
    pub fn len(&self) -> usize {
        match self {
            CompressedBlock::Owned(bytes) => bytes.len(),
            CompressedBlock::Native(block) => block.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            CompressedBlock::Owned(bytes) => bytes,
            CompressedBlock::Native(block) => block.into_owned(),
        }
    }
}

type TaskResult = Result<Vec<u8>, CompressionError>;

pub struct MeshCompressor {
    pool: rayon::ThreadPool,
    codec: Arc<dyn MeshCodec>,
    pending: Vec<Receiver<TaskResult>>,
}

impl MeshCompressor {
    /// `threads` of `None` lets rayon pick the pool size.
    pub fn new(
        codec: Arc<dyn MeshCodec>,
        threads: Option<usize>,
    ) -> Result<Self, Report<CompressionError>> {
        let mut builder = rayon::ThreadPoolBuilder::new()
            .thread_name(|i| format!("mesh-compress-{i}"))
            .panic_handler(|_| warn!("mesh compression task panicked"));
        if let Some(threads) = threads {
            builder = builder.num_threads(threads);
        }
        let pool = builder
            .build()
            .map_err(|e| Report::new(CompressionError::Pool(e.to_string())))?;

        Ok(Self {
            pool,
            codec,
            pending: Vec::new(),
        })
    }

    pub fn extension_name(&self) -> &str {
        self.codec.extension_name()
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn threads(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Queue `buffer` for compression. The task owns its copy of the geometry.
    /// Its result is the next entry returned by [`MeshCompressor::wait_all`].
    pub fn submit(&mut self, buffer: BinaryAttributeBuffer) {
        let (tx, rx) = sync_channel(1);
        let codec = Arc::clone(&self.codec);
        self.pool.spawn(move || {
            let result = codec.encode(&buffer).map(CompressedBlock::into_bytes);
            // The receiver only disappears if the compressor was dropped.
            let _ = tx.send(result);
        });
        self.pending.push(rx);
    }

    /// Block until every submitted task has finished.
    ///
    /// Results are returned in submission order. If any task failed, the
    /// first failure is reported and no result is returned.
    pub fn wait_all(&mut self) -> Result<Vec<Vec<u8>>, Report<CompressionError>> {
        let pending = std::mem::take(&mut self.pending);
        let outcomes: Vec<TaskResult> = pending
            .into_iter()
            .enumerate()
            .map(|(task, rx)| {
                rx.recv()
                    .unwrap_or(Err(CompressionError::WorkerLost { task }))
            })
            .collect();
        debug!("{} compression tasks joined", outcomes.len());

        outcomes
            .into_iter()
            .map(|outcome| outcome.map_err(Report::new))
            .collect()
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::traversal::Polymesh;

    /// "Compresses" by emitting the vertex count as four bytes.
    struct CountingCodec;

    impl MeshCodec for CountingCodec {
        fn encode(&self, buffer: &BinaryAttributeBuffer) -> Result<CompressedBlock, CompressionError> {
            Ok(CompressedBlock::Owned(
                (buffer.vertex_count() as u32).to_le_bytes().to_vec(),
            ))
        }
    }

    struct FailingCodec;

    impl MeshCodec for FailingCodec {
        fn encode(&self, buffer: &BinaryAttributeBuffer) -> Result<CompressedBlock, CompressionError> {
            if buffer.vertex_count() > 3 {
                Err(CompressionError::Codec("too many points".into()))
            } else {
                Ok(CompressedBlock::Owned(vec![0; 4]))
            }
        }
    }

    struct PanickingCodec;

    impl MeshCodec for PanickingCodec {
        fn encode(&self, _: &BinaryAttributeBuffer) -> Result<CompressedBlock, CompressionError> {
            panic!("codec crashed")
        }
    }

    static RELEASED: AtomicUsize = AtomicUsize::new(0);

    unsafe fn release_boxed(ptr: *mut u8, len: usize) {
        // SAFETY: paired with `Box::into_raw` in `NativeCodec::encode`.
        drop(unsafe { Box::from_raw(std::ptr::slice_from_raw_parts_mut(ptr, len)) });
        RELEASED.fetch_add(1, Ordering::SeqCst);
    }

    struct NativeCodec;

    impl MeshCodec for NativeCodec {
        fn encode(&self, _: &BinaryAttributeBuffer) -> Result<CompressedBlock, CompressionError> {
            let bytes: Box<[u8]> = vec![7u8; 6].into_boxed_slice();
            let len = bytes.len();
            let ptr = Box::into_raw(bytes) as *mut u8;
            let block = unsafe { NativeBlock::from_raw(ptr, len, release_boxed) }
                .ok_or_else(|| CompressionError::Codec("null block".into()))?;
            Ok(CompressedBlock::Native(block))
        }
    }

    fn buffer_with_points(n: usize) -> BinaryAttributeBuffer {
        let mut buf = BinaryAttributeBuffer::new();
        buf.append_polymesh(&Polymesh {
            points: vec![[0.0, 0.0, 0.0]; n],
            facets: vec![[0, 1, 2]],
            ..Default::default()
        });
        buf
    }

    #[test]
    fn results_come_back_in_submission_order() {
        let mut compressor = MeshCompressor::new(Arc::new(CountingCodec), Some(4)).unwrap();
        assert_eq!(compressor.threads(), 4);
        for n in [3, 30, 300, 3000, 6] {
            compressor.submit(buffer_with_points(n));
        }
        assert_eq!(compressor.pending(), 5);
        let results = compressor.wait_all().unwrap();
        let counts: Vec<u32> = results
            .iter()
            .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();
        assert_eq!(counts, vec![3, 30, 300, 3000, 6]);
        assert_eq!(compressor.pending(), 0);
    }

    #[test]
    fn codec_failure_propagates_through_barrier() {
        let mut compressor = MeshCompressor::new(Arc::new(FailingCodec), Some(2)).unwrap();
        compressor.submit(buffer_with_points(3));
        compressor.submit(buffer_with_points(4));
        let err = compressor.wait_all().unwrap_err();
        assert!(err.to_string().contains("too many points"));
    }

    #[test]
    fn panicking_task_reports_lost_worker() {
        let mut compressor = MeshCompressor::new(Arc::new(PanickingCodec), Some(1)).unwrap();
        compressor.submit(buffer_with_points(3));
        let err = compressor.wait_all().unwrap_err();
        assert!(err.to_string().contains("task 0 ended"));
    }

    #[test]
    fn native_memory_is_released_after_copy() {
        let before = RELEASED.load(Ordering::SeqCst);
        let mut compressor = MeshCompressor::new(Arc::new(NativeCodec), Some(2)).unwrap();
        compressor.submit(buffer_with_points(3));
        compressor.submit(buffer_with_points(3));
        let results = compressor.wait_all().unwrap();
        assert_eq!(results, vec![vec![7u8; 6], vec![7u8; 6]]);
        assert_eq!(RELEASED.load(Ordering::SeqCst) - before, 2);
    }
}
