use std::path::PathBuf;

use candle_core::{
    utils::{cuda_is_available, metal_is_available},
    Device,
};

use crate::{
    checkpoint::{CheckpointStore, GroupState, SaveRequest},
    data::{create_loader, DataLoader, Split},
    logging::{Logger, LoggingSettings, StepPosition},
    metrics::{ErrorBuffer, Errors},
    pipelines::{build_pipeline, Pipeline},
    scheduler::SchedulerState,
    visualization::save_grid,
    TrainingConfig, TrainingError,
};

/// Epoch-based training loop around one [`Pipeline`].
pub struct Trainer {
    config: TrainingConfig,
    device: Device,
    pipeline: Box<dyn Pipeline>,
    train_loader: DataLoader,
    test_loader: DataLoader,
    store: CheckpointStore,
    logger: Logger,
    start_epoch: usize,
    total_steps: usize,
    last_monitor: Option<f64>,
}

impl Trainer {
    pub fn new(config: TrainingConfig) -> Result<Self, TrainingError> {
        config.validate()?;
        if !config.is_train {
            return Err(TrainingError::initialization(
                "trainer requires a configuration with is_train = true",
            ));
        }

        let device = select_device(&config.runtime.devices);
        if let Err(err) = device.set_seed(config.runtime.seed) {
            log::warn!("failed to seed device RNG: {err}");
        }

        let train_loader = create_loader(&config, None, &device)?;
        let test_split = if config.data.debug { Split::Debug } else { Split::Test };
        let test_loader = create_loader(&config, Some(test_split), &device)?;
        if train_loader.num_batches() == 0 {
            return Err(TrainingError::initialization(format!(
                "training split has {} samples, fewer than one batch of {}",
                train_loader.dataset().len(),
                train_loader.batch_size()
            )));
        }

        let store = CheckpointStore::for_run(&config);
        let options = store.save_options(&config)?;
        log::info!("options saved to {}", options.display());

        let (pipeline, manifest) = build_pipeline(&config, &device)?;
        let (start_epoch, total_steps) = match manifest {
            Some(manifest) => {
                log::info!(
                    "resuming after epoch {} ({} steps)",
                    manifest.epoch,
                    manifest.total_steps
                );
                (manifest.epoch + 1, manifest.total_steps)
            }
            None => (config.scheduler.epoch_count, 0),
        };
        let logger = Logger::new(LoggingSettings::from_config(&config))?;

        Ok(Self {
            config,
            device,
            pipeline,
            train_loader,
            test_loader,
            store,
            logger,
            start_epoch,
            total_steps,
            last_monitor: None,
        })
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn pipeline(&self) -> &dyn Pipeline {
        self.pipeline.as_ref()
    }

    pub fn total_steps(&self) -> usize {
        self.total_steps
    }

    pub fn train(&mut self) -> Result<(), TrainingError> {
        self.train_with_shutdown(|| false)
    }

    /// Runs the remaining epochs, stepping every schedule at the start of
    /// each. `should_stop` is polled before every step; once it returns true
    /// the `latest` checkpoint is written and the loop ends without finishing
    /// the epoch.
    pub fn train_with_shutdown<F>(&mut self, mut should_stop: F) -> Result<(), TrainingError>
    where
        F: FnMut() -> bool,
    {
        let last_epoch = self.config.scheduler.last_epoch();
        let iters_per_epoch = self.train_loader.num_batches();
        let display_freq = self.config.runtime.display_freq.max(1);
        log::info!(
            "training [{}] on {:?}: epochs {}..={}, {} iterations per epoch",
            self.config.id,
            self.device,
            self.start_epoch,
            last_epoch,
            iters_per_epoch
        );

        for epoch in self.start_epoch..=last_epoch {
            // Pre-step schedules, saved in place of the live ones on a stop.
            let schedules: Vec<SchedulerState> = self
                .pipeline
                .groups()
                .iter()
                .map(|group| group.schedule_state())
                .collect();
            let metric = self.last_monitor;
            for group in self.pipeline.groups_mut() {
                group.step_schedule(metric);
            }
            let rates = self.learning_rates();
            self.train_loader.start_epoch();
            let mut buffer = ErrorBuffer::new();

            for iter in 0..iters_per_epoch {
                if should_stop() {
                    log::warn!("stop requested during epoch {epoch}; saving latest checkpoint");
                    self.save("latest", epoch.saturating_sub(1), Some(&schedules))?;
                    self.logger.flush();
                    return Ok(());
                }
                let batch = self.train_loader.batch(iter)?;
                let errors = self.pipeline.train_step(&batch)?;
                self.total_steps += 1;
                buffer.add(&errors);

                if (iter + 1) % display_freq == 0 {
                    let position = StepPosition {
                        epoch,
                        last_epoch,
                        iter: iter + 1,
                        iters_per_epoch,
                        total_steps: self.total_steps,
                    };
                    self.logger
                        .log_training_step(position, &rates, &buffer.take_summary());
                }
            }

            if epoch % self.config.runtime.test_epoch_freq.max(1) == 0 {
                self.test(epoch)?;
            }
            if epoch % self.config.runtime.vis_epoch_freq.max(1) == 0 {
                self.visualize(epoch)?;
            }
            self.save("latest", epoch, None)?;
            if epoch % self.config.runtime.save_epoch_freq.max(1) == 0 {
                self.save(&epoch.to_string(), epoch, None)?;
                log::info!("saved checkpoint for epoch {epoch}");
            }
        }

        self.logger.flush();
        Ok(())
    }

    /// Evaluates the whole test split, logs the averaged errors and records
    /// the plateau monitor.
    pub fn test(&mut self, epoch: usize) -> Result<Errors, TrainingError> {
        let errors = self.evaluate()?;
        self.logger.log_evaluation(epoch, self.total_steps, &errors);
        let monitor = self.pipeline.plan().monitor;
        self.last_monitor = errors.get(monitor);
        Ok(errors)
    }

    pub fn evaluate(&mut self) -> Result<Errors, TrainingError> {
        self.pipeline.begin_test();
        self.test_loader.start_epoch();
        let mut buffer = ErrorBuffer::new();
        for index in 0..self.test_loader.num_batches() {
            let batch = self.test_loader.batch(index)?;
            buffer.add(&self.pipeline.evaluate(&batch, true)?);
        }
        let mut errors = buffer.summary();
        errors.extend(&self.pipeline.finish_test()?);
        Ok(errors)
    }

    /// Writes `<run>/vis/<epoch>_<split>.jpg` for the first train and test
    /// batch.
    fn visualize(&mut self, epoch: usize) -> Result<Vec<PathBuf>, TrainingError> {
        let max_n_vis = self.config.runtime.max_n_vis.max(1);
        let dir = self.config.run_dir().join("vis");
        let mut written = Vec::new();
        for (split, loader) in [("train", &mut self.train_loader), ("test", &mut self.test_loader)] {
            if loader.num_batches() == 0 {
                continue;
            }
            let batch = loader.batch(0)?.head(max_n_vis)?;
            let visuals = self.pipeline.visuals(&batch)?;
            let path = dir.join(format!("{epoch}_{split}.jpg"));
            save_grid(&visuals, &path)?;
            written.push(path);
        }
        log::info!("visualization of epoch {epoch} saved to {}", dir.display());
        Ok(written)
    }

    fn learning_rates(&self) -> Vec<(String, f64)> {
        self.pipeline
            .groups()
            .iter()
            .map(|group| (group.name.clone(), group.optimizer.learning_rate()))
            .collect()
    }

    /// Writes every network and group state under `label`. `schedules`
    /// replaces the scheduler part of each group state when given.
    fn save(
        &self,
        label: &str,
        epoch: usize,
        schedules: Option<&[SchedulerState]>,
    ) -> Result<(), TrainingError> {
        let networks = self.pipeline.networks();
        let groups = self
            .pipeline
            .groups()
            .iter()
            .enumerate()
            .map(|(i, group)| {
                let mut state = group.state()?;
                if let Some(schedule) = schedules.and_then(|s| s.get(i)) {
                    state.scheduler = schedule.clone();
                }
                Ok((group.name.as_str(), state))
            })
            .collect::<Result<Vec<(&str, GroupState)>, TrainingError>>()?;
        self.store.save(SaveRequest {
            label,
            config: &self.config,
            networks: &networks,
            groups: &groups,
            epoch,
            total_steps: self.total_steps,
        })?;
        Ok(())
    }
}

/// First listed GPU when a backend is available, otherwise the CPU. An empty
/// device list selects the CPU.
pub fn select_device(devices: &[usize]) -> Device {
    let Some(&ordinal) = devices.first() else {
        log::info!("no devices requested; using CPU");
        return Device::Cpu;
    };
    if cuda_is_available() {
        match Device::new_cuda(ordinal) {
            Ok(device) => {
                log::info!("device: using CUDA GPU #{ordinal}");
                return device;
            }
            Err(err) => log::warn!("cuda reported available but initialization failed: {err}"),
        }
    }
    if metal_is_available() {
        match Device::new_metal(ordinal) {
            Ok(device) => {
                log::info!("device: using Metal GPU #{ordinal}");
                return device;
            }
            Err(err) => log::warn!("failed to initialize metal device, falling back to CPU: {err}"),
        }
    } else {
        log::warn!("no usable GPU backend; using CPU");
    }
    Device::Cpu
}
