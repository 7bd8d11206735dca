//! Background worker hosting a [`FacePipeline`].
//!
//! The pipeline is built and used on one dedicated thread. Callers talk to it only
//! through typed request/response messages; images and reports move through the
//! channels by ownership. A router thread matches responses to waiting callers by id.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, mpsc};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use async_channel::{Receiver, Sender, TrySendError};
use facemesh_utils::{DetectionMode, PipelineSettings, WorkerSettings, stage_span};
use image::RgbImage;
use log::{Level, debug, warn};

use crate::error::FaceMeshError;
use crate::face::{DetectionReport, Face};
use crate::input::PixelBuffer;
use crate::model::{InferenceModel, OnnxModel};
use crate::pipeline::FacePipeline;
use crate::segmentation::SegmentationMask;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Deadline for building the pipeline and completing the ready handshake.
    pub init_timeout: Duration,
    pub thread_name: String,
}

impl WorkerOptions {
    pub fn from_settings(settings: &WorkerSettings) -> Self {
        Self {
            init_timeout: Duration::from_millis(settings.init_timeout_ms),
            ..Self::default()
        }
    }
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            init_timeout: Duration::from_secs(30),
            thread_name: "facemesh-worker".to_string(),
        }
    }
}

/// Work the pipeline thread can perform. Buffers are owned by the message.
#[derive(Debug)]
pub enum WorkerOperation {
    Detect { image: RgbImage, mode: DetectionMode },
    DetectEncoded { bytes: Vec<u8>, mode: DetectionMode },
    DetectPixels { pixels: PixelBuffer, mode: DetectionMode },
    Embed { image: RgbImage, face: Box<Face> },
    Segment { image: RgbImage },
}

impl WorkerOperation {
    fn name(&self) -> &'static str {
        match self {
            WorkerOperation::Detect { .. } => "detect",
            WorkerOperation::DetectEncoded { .. } => "detect_encoded",
            WorkerOperation::DetectPixels { .. } => "detect_pixels",
            WorkerOperation::Embed { .. } => "embed",
            WorkerOperation::Segment { .. } => "segment",
        }
    }
}

#[derive(Debug)]
pub struct WorkerRequest {
    pub id: u64,
    pub operation: WorkerOperation,
}

#[derive(Debug)]
pub enum WorkerPayload {
    Detection(DetectionReport),
    Embedding(Vec<f32>),
    Segmentation(SegmentationMask),
}

#[derive(Debug)]
pub struct WorkerResponse {
    pub id: u64,
    pub result: Result<WorkerPayload, FaceMeshError>,
}

type Completion = Sender<Result<WorkerPayload, FaceMeshError>>;
type CompletionReceiver = Receiver<Result<WorkerPayload, FaceMeshError>>;

/// Requests awaiting a response, keyed by id.
#[derive(Debug, Default)]
struct PendingTable {
    entries: Mutex<PendingEntries>,
}

#[derive(Debug, Default)]
struct PendingEntries {
    waiting: HashMap<u64, Completion>,
    closed: bool,
}

impl PendingTable {
    fn insert(&self, id: u64) -> Result<CompletionReceiver, FaceMeshError> {
        let mut entries = lock(&self.entries);
        if entries.closed {
            return Err(FaceMeshError::Disposed);
        }
        let (sender, receiver) = async_channel::bounded(1);
        entries.waiting.insert(id, sender);
        Ok(receiver)
    }

    fn remove(&self, id: u64) {
        lock(&self.entries).waiting.remove(&id);
    }

    fn complete(&self, response: WorkerResponse) {
        let Some(sender) = lock(&self.entries).waiting.remove(&response.id) else {
            debug!("dropping response {} with no waiting caller", response.id);
            return;
        };
        if let Err(TrySendError::Closed(_)) = sender.try_send(response.result) {
            debug!("caller for request {} went away", response.id);
        }
    }

    /// Fail every waiting caller with `Disposed` and refuse new entries.
    fn fail_all(&self) -> usize {
        let drained: Vec<Completion> = {
            let mut entries = lock(&self.entries);
            entries.closed = true;
            entries.waiting.drain().map(|(_, sender)| sender).collect()
        };
        for sender in &drained {
            let _ = sender.try_send(Err(FaceMeshError::Disposed));
        }
        drained.len()
    }

    /// Whether `id` still has a caller waiting for it.
    fn is_waiting(&self, id: u64) -> bool {
        let entries = lock(&self.entries);
        !entries.closed && entries.waiting.contains_key(&id)
    }

    fn len(&self) -> usize {
        lock(&self.entries).waiting.len()
    }
}

/// Client handle to a pipeline running on its own thread.
#[derive(Debug)]
pub struct PipelineWorker {
    requests: Mutex<Option<Sender<WorkerRequest>>>,
    pending: Arc<PendingTable>,
    next_id: AtomicU64,
    worker: Mutex<Option<JoinHandle<()>>>,
    router: Mutex<Option<JoinHandle<()>>>,
}

impl PipelineWorker {
    /// Build a pipeline with `factory` on a new thread and wait for it to become ready.
    ///
    /// If the handshake misses `options.init_timeout`, this returns `WorkerTimeout`
    /// and a pipeline finished afterwards is disposed on the worker thread.
    pub fn spawn<M, F>(factory: F, options: WorkerOptions) -> Result<Self, FaceMeshError>
    where
        M: InferenceModel + 'static,
        F: FnOnce() -> Result<FacePipeline<M>, FaceMeshError> + Send + 'static,
    {
        let (ready_tx, ready_rx) = mpsc::channel::<Result<(), FaceMeshError>>();
        let (request_tx, request_rx) = async_channel::unbounded::<WorkerRequest>();
        let (response_tx, response_rx) = async_channel::unbounded::<WorkerResponse>();
        let pending = Arc::new(PendingTable::default());
        let served_table = pending.clone();

        let worker = thread::Builder::new()
            .name(options.thread_name.clone())
            .spawn(move || {
                let pipeline = match factory() {
                    Ok(pipeline) => pipeline,
                    Err(err) => {
                        let _ = ready_tx.send(Err(err));
                        return;
                    }
                };
                if ready_tx.send(Ok(())).is_err() {
                    debug!("worker became ready after its caller gave up; disposing");
                    pipeline.dispose();
                    return;
                }
                serve(&pipeline, &served_table, &request_rx, &response_tx);
                pipeline.dispose();
                debug!("worker thread exiting");
            })
            .map_err(|e| FaceMeshError::Initialization(e.into()))?;

        match ready_rx.recv_timeout(options.init_timeout) {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                let _ = worker.join();
                return Err(err);
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {
                warn!(
                    "worker did not become ready within {:?}; abandoning it",
                    options.init_timeout
                );
                return Err(FaceMeshError::WorkerTimeout(options.init_timeout));
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                let _ = worker.join();
                return Err(FaceMeshError::Initialization(anyhow::anyhow!(
                    "worker thread exited during initialization"
                )));
            }
        }

        let router_table = pending.clone();
        let router = thread::Builder::new()
            .name(format!("{}-router", options.thread_name))
            .spawn(move || {
                while let Ok(response) = response_rx.recv_blocking() {
                    router_table.complete(response);
                }
                let failed = router_table.fail_all();
                if failed > 0 {
                    debug!("worker stopped with {failed} request(s) pending");
                }
            });
        let router = match router {
            Ok(router) => router,
            Err(err) => {
                drop(request_tx);
                let _ = worker.join();
                return Err(FaceMeshError::Initialization(err.into()));
            }
        };

        debug!("worker '{}' ready", options.thread_name);
        Ok(Self {
            requests: Mutex::new(Some(request_tx)),
            pending,
            next_id: AtomicU64::new(1),
            worker: Mutex::new(Some(worker)),
            router: Mutex::new(Some(router)),
        })
    }

    /// Spawn a worker that loads its models from `settings`.
    pub fn from_settings(settings: PipelineSettings) -> Result<Self, FaceMeshError> {
        let options = WorkerOptions::from_settings(&settings.worker);
        Self::spawn(
            move || FacePipeline::<OnnxModel>::from_settings(&settings),
            options,
        )
    }

    /// Number of requests still awaiting a response.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Send `operation` and return the receiver its result will arrive on.
    pub fn submit(
        &self,
        operation: WorkerOperation,
    ) -> Result<Receiver<Result<WorkerPayload, FaceMeshError>>, FaceMeshError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let receiver = self.pending.insert(id)?;
        let sender = lock(&self.requests).clone();
        let sent = match sender {
            Some(sender) => sender.try_send(WorkerRequest { id, operation }).is_ok(),
            None => false,
        };
        if !sent {
            self.pending.remove(id);
            return Err(FaceMeshError::Disposed);
        }
        Ok(receiver)
    }

    fn call(&self, operation: WorkerOperation) -> Result<WorkerPayload, FaceMeshError> {
        self.submit(operation)?
            .recv_blocking()
            .map_err(|_| FaceMeshError::Disposed)?
    }

    pub fn detect(
        &self,
        image: RgbImage,
        mode: DetectionMode,
    ) -> Result<DetectionReport, FaceMeshError> {
        expect_detection(self.call(WorkerOperation::Detect { image, mode })?)
    }

    pub async fn detect_async(
        &self,
        image: RgbImage,
        mode: DetectionMode,
    ) -> Result<DetectionReport, FaceMeshError> {
        let receiver = self.submit(WorkerOperation::Detect { image, mode })?;
        let payload = receiver.recv().await.map_err(|_| FaceMeshError::Disposed)??;
        expect_detection(payload)
    }

    pub fn detect_encoded(
        &self,
        bytes: Vec<u8>,
        mode: DetectionMode,
    ) -> Result<DetectionReport, FaceMeshError> {
        expect_detection(self.call(WorkerOperation::DetectEncoded { bytes, mode })?)
    }

    pub fn detect_pixels(
        &self,
        pixels: PixelBuffer,
        mode: DetectionMode,
    ) -> Result<DetectionReport, FaceMeshError> {
        expect_detection(self.call(WorkerOperation::DetectPixels { pixels, mode })?)
    }

    pub fn embed(&self, image: RgbImage, face: Face) -> Result<Vec<f32>, FaceMeshError> {
        match self.call(WorkerOperation::Embed {
            image,
            face: Box::new(face),
        })? {
            WorkerPayload::Embedding(embedding) => Ok(embedding),
            other => Err(unexpected_payload("embedding", &other)),
        }
    }

    pub fn segment(&self, image: RgbImage) -> Result<SegmentationMask, FaceMeshError> {
        match self.call(WorkerOperation::Segment { image })? {
            WorkerPayload::Segmentation(mask) => Ok(mask),
            other => Err(unexpected_payload("segmentation", &other)),
        }
    }

    pub fn is_disposed(&self) -> bool {
        lock(&self.requests).is_none()
    }

    /// Fail pending requests with `Disposed`, stop the worker and join its threads.
    pub fn dispose(&self) {
        let Some(requests) = lock(&self.requests).take() else {
            return;
        };
        let failed = self.pending.fail_all();
        requests.close();
        drop(requests);

        for (name, slot) in [("worker", &self.worker), ("router", &self.router)] {
            if let Some(handle) = lock(slot).take()
                && handle.join().is_err()
            {
                warn!("{name} thread panicked before shutdown");
            }
        }
        debug!("worker disposed ({failed} pending request(s) failed)");
    }
}

impl Drop for PipelineWorker {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// Requests already failed by `dispose` stay queued in the channel; they are drained
/// without touching the pipeline.
fn serve<M: InferenceModel>(
    pipeline: &FacePipeline<M>,
    pending: &PendingTable,
    requests: &Receiver<WorkerRequest>,
    responses: &Sender<WorkerResponse>,
) {
    while let Ok(WorkerRequest { id, operation }) = requests.recv_blocking() {
        if !pending.is_waiting(id) {
            debug!("skipping {} request {id}: no caller waiting", operation.name());
            continue;
        }
        let _span = stage_span("worker", operation.name(), Level::Debug);
        let result = handle(pipeline, operation);
        if responses.send_blocking(WorkerResponse { id, result }).is_err() {
            break;
        }
    }
}

fn handle<M: InferenceModel>(
    pipeline: &FacePipeline<M>,
    operation: WorkerOperation,
) -> Result<WorkerPayload, FaceMeshError> {
    match operation {
        WorkerOperation::Detect { image, mode } => {
            pipeline.detect(&image, mode).map(WorkerPayload::Detection)
        }
        WorkerOperation::DetectEncoded { bytes, mode } => pipeline
            .detect_encoded(&bytes, mode)
            .map(WorkerPayload::Detection),
        WorkerOperation::DetectPixels { pixels, mode } => pipeline
            .detect_pixels(pixels, mode)
            .map(WorkerPayload::Detection),
        WorkerOperation::Embed { image, face } => {
            pipeline.embed(&image, &face).map(WorkerPayload::Embedding)
        }
        WorkerOperation::Segment { image } => {
            pipeline.segment(&image).map(WorkerPayload::Segmentation)
        }
    }
}

fn expect_detection(payload: WorkerPayload) -> Result<DetectionReport, FaceMeshError> {
    match payload {
        WorkerPayload::Detection(report) => Ok(report),
        other => Err(unexpected_payload("detection", &other)),
    }
}

fn unexpected_payload(expected: &str, payload: &WorkerPayload) -> FaceMeshError {
    let got = match payload {
        WorkerPayload::Detection(_) => "detection",
        WorkerPayload::Embedding(_) => "embedding",
        WorkerPayload::Segmentation(_) => "segmentation",
    };
    FaceMeshError::Initialization(anyhow::anyhow!(
        "worker answered a {expected} request with a {got} payload"
    ))
}
