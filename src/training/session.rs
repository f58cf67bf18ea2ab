use super::SampleProvider;
use crate::error::{Error, Result};
use crate::nn::network::Network;
use crate::nn::optim::{Optimizer, OptimizerState, Regularization};
use alloc::{boxed::Box, sync::Arc};
use core::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

type BatchCallback = Box<dyn FnMut(f32, usize) + Send>;
type CompleteCallback = Box<dyn FnMut() + Send>;

/// Settings of a training session.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SessionConfig {
    /// Samples requested from the provider per epoch.
    pub batch_size: usize,
    /// Penalty added to gradients before every update.
    pub regularization: Option<Regularization>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            batch_size: 32,
            regularization: None,
        }
    }
}

/// Cooperative cancellation flag shared with the training worker.
///
/// The worker checks it before every epoch; a batch in progress always
/// finishes.
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    /// Requests that training stop at the next epoch boundary.
    pub fn stop(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Whether a stop was requested.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    fn reset(&self) {
        self.0.store(false, Ordering::Release);
    }
}

/// State owned by whoever runs the epoch loop: the session while idle, the
/// worker while training.
struct Core {
    network: Network,
    optimizer: Optimizer,
    state: OptimizerState,
    provider: Box<dyn SampleProvider>,
    config: SessionConfig,
    on_batch: Option<BatchCallback>,
    on_complete: Option<CompleteCallback>,
}

impl Core {
    fn run(&mut self, epochs: usize, stop: &StopSignal) -> Result<()> {
        for epoch in 0..epochs {
            if stop.is_stopped() {
                log::info!("training stopped before epoch {epoch}");
                break;
            }

            let batch = self.provider.next_batch(self.config.batch_size);
            if batch.is_empty() {
                log::warn!(
                    "sample provider returned an empty batch, ending training at epoch {epoch}"
                );
                break;
            }

            let loss = self.network.train_batch(
                &batch,
                &self.optimizer,
                &mut self.state,
                self.config.regularization.as_ref(),
            )?;
            log::debug!("epoch {epoch}: {} samples, loss {loss}", batch.len());

            if let Some(on_batch) = &mut self.on_batch {
                on_batch(loss, epoch);
            }
        }

        if let Some(on_complete) = &mut self.on_complete {
            on_complete();
        }
        Ok(())
    }
}

/// Clears the training flag when the worker ends, panicking or not.
struct Busy(Arc<AtomicBool>);

impl Drop for Busy {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Trains a network on a background thread.
///
/// The session owns the network, the optimizer and its accumulators. While
/// training they move to the worker thread and come back when it is joined,
/// either by [`wait`](Self::wait) or by the next [`train`](Self::train).
///
/// ```no_run
/// use accel_nn::nn::optim::Optimizer;
/// use accel_nn::nn::network::Network;
/// use accel_nn::training::{InMemorySamples, Sample, SessionConfig, TrainingSession};
/// # fn run(network: Network, samples: Vec<Sample>) -> accel_nn::Result<()> {
/// let mut session = TrainingSession::new(
///     network,
///     Optimizer::Sgd { learning_rate: 0.1 },
///     InMemorySamples::shuffled(samples),
///     SessionConfig::default(),
/// )?
/// .on_batch(|loss, epoch| println!("epoch {epoch}: {loss}"));
///
/// session.train(100);
/// session.wait()?;
/// let network = session.into_network()?;
/// # Ok(())
/// # }
/// ```
pub struct TrainingSession {
    core: Option<Core>,
    worker: Option<JoinHandle<(Core, Result<()>)>>,
    training: Arc<AtomicBool>,
    stop: StopSignal,
}

impl TrainingSession {
    /// Creates an idle session.
    ///
    /// Optimizer accumulators start empty and persist for the life of the
    /// session.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidConfig`] for a zero batch size, bad optimizer
    /// hyperparameters or a network built for inference only.
    pub fn new<P>(
        network: Network,
        optimizer: Optimizer,
        provider: P,
        config: SessionConfig,
    ) -> Result<Self>
    where
        P: SampleProvider + 'static,
    {
        if config.batch_size == 0 {
            return Err(Error::InvalidConfig("batch size must be positive".into()));
        }
        if !network.is_trainable() {
            return Err(Error::InvalidConfig("network was built for inference only".into()));
        }
        optimizer.validate()?;

        Ok(Self {
            core: Some(Core {
                network,
                optimizer,
                state: OptimizerState::new(),
                provider: Box::new(provider),
                config,
                on_batch: None,
                on_complete: None,
            }),
            worker: None,
            training: Arc::new(AtomicBool::new(false)),
            stop: StopSignal::default(),
        })
    }

    /// Sets the callback run after every batch with its mean loss and the
    /// epoch index. It runs on the worker thread.
    #[must_use]
    pub fn on_batch(mut self, callback: impl FnMut(f32, usize) + Send + 'static) -> Self {
        if let Some(core) = &mut self.core {
            core.on_batch = Some(Box::new(callback));
        }
        self
    }

    /// Sets the callback run once the epoch loop ends without error. It runs
    /// on the worker thread.
    #[must_use]
    pub fn on_complete(mut self, callback: impl FnMut() + Send + 'static) -> Self {
        if let Some(core) = &mut self.core {
            core.on_complete = Some(Box::new(callback));
        }
        self
    }

    /// Starts training for `epochs` epochs on a worker thread.
    ///
    /// Returns `false`, after logging a warning, if the session is already
    /// training. An earlier finished run is joined first; its error, if any,
    /// is logged.
    pub fn train(&mut self, epochs: usize) -> bool {
        if self.is_training() {
            log::warn!("training session is already training, ignoring start request");
            return false;
        }
        if let Err(err) = self.reclaim() {
            log::error!("previous training run failed: {err}");
        }
        let Some(mut core) = self.core.take() else {
            log::warn!("training session lost its network to a panicked worker");
            return false;
        };

        self.stop.reset();
        self.training.store(true, Ordering::Release);
        let busy = Busy(Arc::clone(&self.training));
        let stop = self.stop.clone();

        log::info!("training for {epochs} epochs, batch size {}", core.config.batch_size);
        self.worker = Some(thread::spawn(move || {
            let _busy = busy;
            let result = core.run(epochs, &stop);
            (core, result)
        }));
        true
    }

    /// Whether the worker is still running.
    #[must_use]
    pub fn is_training(&self) -> bool {
        self.training.load(Ordering::Acquire)
    }

    /// Asks the worker to stop at the next epoch boundary.
    pub fn stop(&self) {
        self.stop.stop();
    }

    /// A handle that stops this session's worker, usable from callbacks.
    #[must_use]
    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    /// Blocks until the worker is done and returns its result.
    ///
    /// Returns `Ok(())` immediately if no run is pending.
    ///
    /// # Errors
    ///
    /// The error that ended the run, or [`Error::WorkerPanicked`].
    pub fn wait(&mut self) -> Result<()> {
        self.reclaim()
    }

    /// The network, while idle.
    #[must_use]
    pub fn network(&self) -> Option<&Network> {
        self.core.as_ref().map(|core| &core.network)
    }

    /// Optimizer accumulators, while idle.
    #[must_use]
    pub fn optimizer_state(&self) -> Option<&OptimizerState> {
        self.core.as_ref().map(|core| &core.state)
    }

    /// Waits for the worker and hands the network back.
    ///
    /// # Errors
    ///
    /// As [`wait`](Self::wait).
    pub fn into_network(mut self) -> Result<Network> {
        self.reclaim()?;
        self.core.take().map(|core| core.network).ok_or(Error::WorkerPanicked)
    }

    fn reclaim(&mut self) -> Result<()> {
        let Some(worker) = self.worker.take() else {
            return Ok(());
        };
        let (core, result) = worker.join().map_err(|_| Error::WorkerPanicked)?;
        self.core = Some(core);
        result
    }
}

impl core::fmt::Debug for TrainingSession {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TrainingSession")
            .field("training", &self.is_training())
            .field("stopped", &self.stop.is_stopped())
            .finish_non_exhaustive()
    }
}

impl Drop for TrainingSession {
    fn drop(&mut self) {
        if self.is_training() {
            log::warn!("training session dropped while training, stopping the worker");
            self.stop.stop();
        }
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::error!("training worker panicked");
            }
        }
    }
}
