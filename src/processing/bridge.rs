// Location: src/processing/bridge.rs

use std::any::Any;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use tracing::{debug, error, warn};

use crate::error::{EngineError, FaultClass, Result, RuntimeFault};
use crate::gpu::ReleaseGuard;
use crate::processing::stream::{FragmentStream, StopFlag};

/// Terminal state of one guarded generation call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerOutcome {
    Success,
    /// Out of memory; whatever was produced stands as the answer.
    Recovered,
    Failed(RuntimeFault),
}

impl WorkerOutcome {
    fn from_guarded<T>(result: &std::result::Result<Option<T>, RuntimeFault>) -> Self {
        match result {
            Ok(Some(_)) => WorkerOutcome::Success,
            Ok(None) => WorkerOutcome::Recovered,
            Err(fault) => WorkerOutcome::Failed(fault.clone()),
        }
    }
}

/// Write-once slot shared between a worker and its consumer.
#[derive(Debug, Clone, Default)]
pub struct OutcomeSlot(Arc<Mutex<Option<WorkerOutcome>>>);

impl OutcomeSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the outcome. Only the first record is kept.
    pub fn record(&self, outcome: WorkerOutcome) -> bool {
        let mut slot = self.0.lock();
        if slot.is_some() {
            return false;
        }
        *slot = Some(outcome);
        true
    }

    pub fn get(&self) -> Option<WorkerOutcome> {
        self.0.lock().clone()
    }

    pub fn fault(&self) -> Option<RuntimeFault> {
        match self.get() {
            Some(WorkerOutcome::Failed(fault)) => Some(fault),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BridgePolicy {
    /// Re-raise transient and unclassified faults.
    pub raise_on_gpu_exceptions: bool,
}

impl Default for BridgePolicy {
    fn default() -> Self {
        Self {
            raise_on_gpu_exceptions: true,
        }
    }
}

/// Prompt context logged alongside a fault.
#[derive(Debug, Clone, Default)]
pub struct FaultContext {
    pub prompt: String,
    pub inputs_decoded: String,
}

/// Run one generation call and classify its failure.
///
/// `Ok(None)` means the call was abandoned after a recoverable fault, or a
/// suppressed one. The call's inputs are owned by `call` and are dropped
/// before the caches are released.
pub fn run_guarded<T, F>(
    call: F,
    ctx: &FaultContext,
    policy: BridgePolicy,
    release: &ReleaseGuard,
) -> std::result::Result<Option<T>, RuntimeFault>
where
    F: FnOnce() -> std::result::Result<T, RuntimeFault>,
{
    let fault = match call() {
        Ok(value) => return Ok(Some(value)),
        Err(fault) => fault,
    };

    match fault.class() {
        FaultClass::Recoverable => {
            warn!(
                prompt = %ctx.prompt,
                inputs_decoded = %ctx.inputs_decoded,
                error = %fault,
                "GPU OOM during generation"
            );
            release.release();
            Ok(None)
        }
        FaultClass::Transient => {
            error!(
                prompt = %ctx.prompt,
                inputs_decoded = %ctx.inputs_decoded,
                error = %fault,
                "GPU error during generation"
            );
            release.release();
            raise_or_suppress(fault, policy)
        }
        FaultClass::Unclassified => {
            release.release();
            raise_or_suppress(fault, policy)
        }
    }
}

fn raise_or_suppress<T>(
    fault: RuntimeFault,
    policy: BridgePolicy,
) -> std::result::Result<Option<T>, RuntimeFault> {
    if policy.raise_on_gpu_exceptions {
        Err(fault)
    } else {
        debug!(error = %fault, "Suppressed generation fault by policy");
        Ok(None)
    }
}

/// Dedicated generation thread that records exactly one outcome.
#[derive(Debug)]
pub struct Worker {
    name: String,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    pub fn spawn<T, F>(name: impl Into<String>, slot: OutcomeSlot, call: F) -> Result<Self>
    where
        T: 'static,
        F: FnOnce() -> std::result::Result<Option<T>, RuntimeFault> + Send + 'static,
    {
        let name = name.into();
        let handle = thread::Builder::new().name(name.clone()).spawn(move || {
            let result = call();
            slot.record(WorkerOutcome::from_guarded(&result));
        })?;
        debug!(worker = %name, "Spawned generation worker");
        Ok(Self {
            name,
            handle: Some(handle),
        })
    }

    /// Wait for the thread. Joining twice is a no-op.
    pub fn join(&mut self) -> Result<()> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };
        handle.join().map_err(|payload| {
            let message = panic_message(payload.as_ref());
            error!(worker = %self.name, %message, "Generation worker panicked");
            EngineError::WorkerPanicked(message)
        })?;
        debug!(worker = %self.name, "Joined generation worker");
        Ok(())
    }

    pub fn is_joined(&self) -> bool {
        self.handle.is_none()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// A fragment stream paired with the worker producing it.
pub struct StreamingRun {
    stream: Option<FragmentStream>,
    stop: StopFlag,
    worker: Worker,
    slot: OutcomeSlot,
}

impl StreamingRun {
    pub fn new(stream: FragmentStream, worker: Worker, slot: OutcomeSlot) -> Self {
        Self {
            stop: stream.stop_flag(),
            stream: Some(stream),
            worker,
            slot,
        }
    }

    /// Next fragment, `Ok(None)` at a normal end of stream. A recorded fault
    /// is raised only after the worker has been joined.
    pub fn next_fragment(&mut self) -> Result<Option<String>> {
        let Some(stream) = self.stream.as_mut() else {
            return Ok(None);
        };
        match stream.next() {
            Some(fragment) => {
                if self.slot.fault().is_some() {
                    self.finish()?;
                }
                Ok(Some(fragment))
            }
            None => {
                self.finish()?;
                Ok(None)
            }
        }
    }

    /// Drop the receiver, join the worker and re-raise a recorded fault.
    pub fn finish(&mut self) -> Result<()> {
        self.stream.take();
        self.worker.join()?;
        match self.slot.fault() {
            Some(fault) => Err(fault.into()),
            None => Ok(()),
        }
    }

    pub fn outcome(&self) -> Option<WorkerOutcome> {
        self.slot.get()
    }

    pub fn stop_flag(&self) -> StopFlag {
        self.stop.clone()
    }
}

impl Drop for StreamingRun {
    fn drop(&mut self) {
        if self.worker.is_joined() {
            return;
        }
        self.stop.stop();
        self.stream.take();
        if let Err(err) = self.worker.join() {
            warn!(error = %err, "Worker failed while abandoning stream");
        }
    }
}
