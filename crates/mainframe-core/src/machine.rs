//! A processor complex with one thread per processor.

use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use log::{debug, info, warn};
use thiserror::Error;

use crate::{
    CpuConfig, CpuId, InterruptPresenter, OpcodeTables, Processor, RunExit, Storage, SystemContext,
};

/// Failures starting or stopping a complex.
#[derive(Debug, Error)]
pub enum MachineError {
    /// A processor thread could not be spawned.
    #[error("failed to spawn processor thread: {0}")]
    Spawn(#[from] io::Error),
    /// A processor thread panicked.
    #[error("processor {0} thread panicked")]
    Panicked(CpuId),
}

/// Running processor complex.
///
/// Every processor starts stopped; drive it through [`Machine::context`]
/// (`restart` after loading the restart new PSW is the usual IPL).
#[derive(Debug)]
pub struct Machine {
    ctx: Arc<SystemContext>,
    threads: Vec<(CpuId, JoinHandle<Processor>)>,
}

impl Machine {
    /// Spawns one thread named `cpu-N` per configured processor.
    ///
    /// # Errors
    ///
    /// [`MachineError::Spawn`] when a thread cannot be created; processors
    /// already started are taken offline and joined first.
    pub fn start(
        config: CpuConfig,
        storage: Arc<dyn Storage>,
        presenter: Arc<dyn InterruptPresenter>,
    ) -> Result<Self, MachineError> {
        let ctx = Arc::new(SystemContext::new(config));
        let tables = Arc::new(OpcodeTables::with_builtins());
        let mut machine = Self {
            ctx: Arc::clone(&ctx),
            threads: Vec::with_capacity(usize::from(config.num_cpus)),
        };
        for cpu in 0..config.num_cpus {
            let processor = Processor::new(cpu, Arc::clone(&ctx), Arc::clone(&storage))
                .with_presenter(Arc::clone(&presenter))
                .with_tables(Arc::clone(&tables));
            let spawned = thread::Builder::new()
                .name(format!("cpu-{cpu}"))
                .spawn(move || processor_thread(processor));
            match spawned {
                Ok(handle) => machine.threads.push((cpu, handle)),
                Err(err) => {
                    if let Err(unwind) = machine.shutdown() {
                        warn!("cpu {cpu}: spawn failed and unwinding failed: {unwind}");
                    }
                    return Err(err.into());
                }
            }
        }
        info!(
            "started {} processor(s), {}",
            config.num_cpus,
            config.arch.name()
        );
        Ok(machine)
    }

    /// Shared context for operator requests.
    #[must_use]
    pub const fn context(&self) -> &Arc<SystemContext> {
        &self.ctx
    }

    /// Takes every processor offline and joins its thread.
    ///
    /// # Errors
    ///
    /// [`MachineError::Panicked`] for the first processor whose thread panicked.
    pub fn shutdown(&mut self) -> Result<Vec<Processor>, MachineError> {
        self.ctx.shutdown();
        let mut processors = Vec::with_capacity(self.threads.len());
        let mut failure = None;
        for (cpu, handle) in self.threads.drain(..) {
            match handle.join() {
                Ok(processor) => processors.push(processor),
                Err(_) => {
                    failure.get_or_insert(MachineError::Panicked(cpu));
                }
            }
        }
        info!("processor complex shut down");
        failure.map_or(Ok(processors), Err)
    }
}

impl Drop for Machine {
    fn drop(&mut self) {
        if !self.threads.is_empty() {
            if let Err(err) = self.shutdown() {
                warn!("dropping processor complex: {err}");
            }
        }
    }
}

fn processor_thread(mut processor: Processor) -> Processor {
    loop {
        match processor.run() {
            RunExit::Offline => return processor,
            RunExit::Intercepted(intercept) => {
                warn!(
                    "cpu {}: unexpected guest exit {:?} without a host driver",
                    processor.cpu(),
                    intercept.reason
                );
                if let Err(err) = processor.exit_guest() {
                    debug!("cpu {}: {err}", processor.cpu());
                }
            }
        }
    }
}
