//! The inference module adapter — plugs `InferEngine` into the surrounding
//! pipeline's `Module` contract.
//!
//! Mirrors `InferencerPrivate`'s per-thread context map: one `InferEngine`
//! plus one `TransDataHelper` per producer thread, created lazily on that
//! thread's first `process` call and torn down together on `close`.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::ThreadId;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};

use streamforge_core::frame::Frame;
use streamforge_core::module::{
    Downstream, EventBus, Module, ModuleParamSet, OpenError, OpenResult, ParamRegister,
};

use crate::batching::{BatchingStrategy, CpuPreprocessing, ResizeConvert, YuvSplit};
use crate::engine::{
    EngineConfig, InferEngine, InferenceBackend, PostProcessor, ResultWaitingCard, SharedFrame,
};
use crate::error::EngineError;
use crate::model::ModelDescriptor;
use crate::resource::{new_accelerator_resource, new_cpu_resource, IoResValue, RcOpResource};
use crate::task::TaskPool;
use crate::trans_data::TransDataHelper;

/// Loads an offline model binary. The model-loader library itself (symbol
/// resolution, on-device weight upload) is an external collaborator; this
/// crate only needs the descriptor it hands back.
pub trait ModelLoader: Send + Sync {
    fn load(&self, model_path: &Path, func_name: &str, nchw: bool) -> Result<ModelDescriptor, EngineError>;
}

type PreprocFn = dyn Fn(&Frame, &mut IoResValue, usize) -> Result<(), EngineError> + Send + Sync;

/// Per-call constructors for the pre/post-processors a pipeline config
/// names by string.
pub struct ProcessorRegistries {
    pub preproc: streamforge_core::registry::Registry<PreprocFn>,
    pub postproc: streamforge_core::registry::Registry<dyn PostProcessor>,
}

struct OpenConfig {
    model: Arc<ModelDescriptor>,
    postproc: Arc<dyn PostProcessor>,
    preproc: Option<Arc<PreprocFn>>,
    backend: Arc<dyn InferenceBackend>,
    rcop: Option<Arc<RcOpResource>>,
    batchsize: usize,
    batching_timeout: Duration,
    interval: usize,
    worker_count: usize,
}

struct InferContext {
    engine: Arc<InferEngine>,
    trans_data: TransDataHelper,
    drop_count: AtomicUsize,
}

/// The pipeline-facing inference module. Holds the registries and
/// factories fixed at `open` time, and a lazily populated per-thread
/// context map.
pub struct InferenceModule {
    param_register: ParamRegister,
    model_loader: Arc<dyn ModelLoader>,
    registries: ProcessorRegistries,
    backend_factory: Arc<dyn Fn(&ModelDescriptor, u32) -> Result<Arc<dyn InferenceBackend>, EngineError> + Send + Sync>,
    downstream: Arc<dyn Downstream>,
    event_bus: Arc<dyn EventBus>,
    config: RwLock<Option<Arc<OpenConfig>>>,
    contexts: Mutex<HashMap<ThreadId, Arc<InferContext>>>,
}

impl InferenceModule {
    pub fn new(
        model_loader: Arc<dyn ModelLoader>,
        registries: ProcessorRegistries,
        backend_factory: Arc<dyn Fn(&ModelDescriptor, u32) -> Result<Arc<dyn InferenceBackend>, EngineError> + Send + Sync>,
        downstream: Arc<dyn Downstream>,
        event_bus: Arc<dyn EventBus>,
    ) -> Self {
        let mut param_register = ParamRegister::new();
        param_register.register("model_path", "path to the offline model binary", true);
        param_register.register("func_name", "entry-point symbol inside the model", true);
        param_register.register("postproc_name", "registered post-processor name", true);
        param_register.register("preproc_name", "registered host pre-processor name", false);
        param_register.register("device_id", "accelerator ordinal, default 0", false);
        param_register.register("batch_size", "host-side batch size", false);
        param_register.register("batching_timeout", "batching timeout in milliseconds, default 3000", false);
        param_register.register("infer_interval", "run inference on 1 of every N frames", false);
        param_register.register("data_order", "NCHW forces that layout on host tensors", false);

        InferenceModule {
            param_register,
            model_loader,
            registries,
            backend_factory,
            downstream,
            event_bus,
            config: RwLock::new(None),
            contexts: Mutex::new(HashMap::new()),
        }
    }

    fn build_context(&self, config: &OpenConfig) -> Result<Arc<InferContext>, EngineError> {
        let batchsize = config.batchsize;
        if batchsize == 0 {
            return Err(EngineError::ConfigError("batchsize must be greater than zero".into()));
        }
        let exhausted = |e: crate::resource::AllocateError| EngineError::ResourceExhausted(e.to_string());

        let (batching_stage, strategy_name) = match &config.preproc {
            Some(preprocess) => {
                let tensors = config.model.input_layout(false, batchsize);
                let input = Arc::new(new_cpu_resource(2, batchsize, tensors).map_err(exhausted)?);
                (
                    BatchingStrategy::CpuPreprocessing(CpuPreprocessing::new(
                        batchsize,
                        input,
                        Arc::clone(preprocess),
                    )),
                    "cpu-preprocessing",
                )
            }
            None => match &config.rcop {
                Some(rcop) => (
                    BatchingStrategy::ResizeConvert(ResizeConvert::new(batchsize, Arc::clone(rcop))),
                    "resize-convert",
                ),
                None => {
                    let tensors = config.model.input_layout(true, batchsize);
                    let input =
                        Arc::new(new_accelerator_resource(2, batchsize, tensors).map_err(exhausted)?);
                    (
                        BatchingStrategy::YuvSplit(YuvSplit::new(batchsize, input)),
                        "yuv-split",
                    )
                }
            },
        };
        tracing::debug!(strategy = strategy_name, "batching stage selected for new context");

        let output_tensors = config.model.output_layout(true, batchsize);
        let output_resource =
            Arc::new(new_accelerator_resource(2, batchsize, output_tensors).map_err(exhausted)?);

        let event_bus = Arc::clone(&self.event_bus);
        let error_bus = Arc::clone(&self.event_bus);
        let error_callback: Arc<dyn Fn(&str) + Send + Sync> = Arc::new(move |msg: &str| {
            error_bus.post_event(streamforge_core::module::EventKind::Error, msg.to_string());
        });

        let engine = InferEngine::new(
            EngineConfig {
                batchsize,
                batching_timeout: config.batching_timeout,
            },
            batching_stage,
            output_resource,
            Arc::clone(&config.backend),
            Arc::clone(&config.postproc),
            Arc::new(TaskPool::new(config.worker_count)),
            error_callback,
            event_bus,
        );

        Ok(Arc::new(InferContext {
            engine,
            trans_data: TransDataHelper::new(Arc::clone(&self.downstream)),
            drop_count: AtomicUsize::new(0),
        }))
    }

    fn context_for_this_thread(&self, config: &OpenConfig) -> Result<Arc<InferContext>, EngineError> {
        let tid = std::thread::current().id();
        let mut contexts = self.contexts.lock();
        if let Some(ctx) = contexts.get(&tid) {
            return Ok(Arc::clone(ctx));
        }
        let ctx = self.build_context(config)?;
        contexts.insert(tid, Arc::clone(&ctx));
        Ok(ctx)
    }
}

impl Module for InferenceModule {
    fn open(&mut self, params: &ModuleParamSet) -> OpenResult<()> {
        self.param_register.validate(params)?;

        let model_path = params
            .get("model_path")
            .ok_or_else(|| OpenError::Config("missing model_path".into()))?;
        let func_name = params
            .get("func_name")
            .ok_or_else(|| OpenError::Config("missing func_name".into()))?;
        let postproc_name = params
            .get("postproc_name")
            .ok_or_else(|| OpenError::Config("missing postproc_name".into()))?;
        let nchw = params.get("data_order").map(|s| s == "NCHW").unwrap_or(false);

        let model = self
            .model_loader
            .load(Path::new(model_path), func_name, nchw)
            .map_err(|e| OpenError::ModelLoad(e.to_string()))?;

        let postproc: Arc<dyn PostProcessor> = Arc::from(
            self.registries
                .postproc
                .create(postproc_name)
                .map_err(|e| OpenError::Config(e.to_string()))?,
        );

        let preproc: Option<Arc<PreprocFn>> = match params.get("preproc_name") {
            Some(name) => Some(Arc::from(
                self.registries
                    .preproc
                    .create(name)
                    .map_err(|e| OpenError::Config(e.to_string()))?,
            )),
            None => None,
        };

        let device_id: u32 = params
            .get("device_id")
            .map(|s| s.parse().unwrap_or(0))
            .unwrap_or(0);

        let batchsize = {
            let model_bsize = model.batch_size();
            if model_bsize > 0 {
                model_bsize
            } else {
                params
                    .get("batch_size")
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(1)
            }
        };

        let batching_timeout = Duration::from_millis(
            params
                .get("batching_timeout")
                .and_then(|s| s.parse().ok())
                .unwrap_or(3000),
        );

        let interval: usize = params
            .get("infer_interval")
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);

        let backend = (self.backend_factory)(&model, device_id)
            .map_err(|e| OpenError::ModelLoad(e.to_string()))?;

        // The RC-op singleton only exists on the device resize+convert
        // path, i.e. when no host pre-processor was configured.
        let rcop = if preproc.is_none() {
            Some(Arc::new(RcOpResource::new(
                model.inputs.first().map(|t| t.shape.hwc()).unwrap_or(0),
            )))
        } else {
            None
        };

        *self.config.write() = Some(Arc::new(OpenConfig {
            model: Arc::new(model),
            postproc,
            preproc,
            backend,
            rcop,
            batchsize,
            batching_timeout,
            interval,
            worker_count: 2,
        }));

        Ok(())
    }

    fn process(&self, frame: Frame) -> i32 {
        let config = match self.config.read().clone() {
            Some(config) => config,
            None => {
                tracing::error!("process called before open");
                return 1;
            }
        };
        let ctx = match self.context_for_this_thread(&config) {
            Ok(ctx) => ctx,
            Err(e) => {
                tracing::error!(error = %e, "failed to build per-thread inference context");
                self.event_bus
                    .post_event(streamforge_core::module::EventKind::Error, e.to_string());
                return 1;
            }
        };

        let eos = frame.is_eos();
        let old = ctx.drop_count.fetch_add(1, Ordering::Relaxed);
        let drop_data = config.interval > 0 && old % config.interval != 0;
        if drop_data {
            ctx.drop_count
                .store((old + 1) % config.interval, Ordering::Relaxed);
        }

        let (card, shared_frame): (ResultWaitingCard, SharedFrame) = if drop_data && !eos {
            (ResultWaitingCard::pre_fulfilled(), Arc::new(parking_lot::Mutex::new(frame)))
        } else {
            ctx.engine.feed_data(frame)
        };

        ctx.trans_data.submit(shared_frame, card);

        // Self-transmit: the pipeline must not also forward the input
        // frame, delivery happens via trans_data once the card fulfils.
        1
    }

    fn close(&mut self) {
        self.contexts.lock().clear();
        *self.config.write() = None;
    }
}
