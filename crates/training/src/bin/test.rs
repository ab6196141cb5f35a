use std::path::PathBuf;

use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use training::{
    checkpoint::CheckpointStore,
    config::PreservedOptions,
    data::create_loader,
    metrics::ErrorBuffer,
    pipelines::build_pipeline,
    trainer::select_device,
    visualization::{save_grid, save_image},
    TrainingConfig, TrainingError,
};

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    if let Err(err) = run() {
        log::error!("test failed: {err}");
        std::process::exit(1);
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Evaluate a trained run on its test split", long_about = None)]
struct Args {
    #[arg(long, value_name = "RUN", help = "Id of the trained run")]
    id: String,

    #[arg(long, value_name = "DIR", help = "Replace the dataset root of the run")]
    data_root: Option<PathBuf>,

    #[arg(long, default_value = "latest", help = "Checkpoint label to load")]
    which_epoch: String,

    #[arg(long, default_value_t = 1)]
    batch_size: usize,

    #[arg(long, help = "Evaluate at most this many batches")]
    nbatch: Option<usize>,

    #[arg(long, help = "Write generated images to <run>/test/")]
    save_output: bool,

    #[arg(long, default_value_t = 16, help = "Samples in the visualization grid")]
    max_n_vis: usize,

    #[arg(long, default_value = "checkpoints")]
    checkpoints_dir: PathBuf,

    #[arg(long, value_delimiter = ',', help = "GPU ordinals; CPU when empty")]
    devices: Vec<usize>,
}

fn run() -> Result<(), TrainingError> {
    let args = Args::parse();

    let store = CheckpointStore::resolve(&args.checkpoints_dir, &args.id);
    let mut config = TrainingConfig::from_train_opt(
        store.options_path(),
        PreservedOptions {
            devices: args.devices.clone(),
            batch_size: args.batch_size,
            is_train: false,
        },
    )?;
    config.runtime.checkpoints_dir = args.checkpoints_dir.clone();
    config.runtime.which_epoch = args.which_epoch.clone();
    config.runtime.continue_train = false;
    if let Some(root) = &args.data_root {
        config.data.data_root = root.clone();
    }

    let device = select_device(&config.runtime.devices);
    let mut loader = create_loader(&config, None, &device)?;
    let (mut pipeline, _) = build_pipeline(&config, &device)?;
    let output_dir = config.run_dir().join("test");

    let total = args
        .nbatch
        .map_or(loader.num_batches(), |n| n.min(loader.num_batches()));
    let pb = ProgressBar::new(total.max(1) as u64);
    pb.set_style(
        ProgressStyle::with_template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} ({eta})")
            .map_err(|err| TrainingError::runtime(format!("invalid progress template: {err}")))?
            .progress_chars("=>-"),
    );

    pipeline.begin_test();
    loader.start_epoch();
    let mut buffer = ErrorBuffer::new();
    for index in 0..total {
        let batch = loader.batch(index)?;
        buffer.add(&pipeline.evaluate(&batch, true)?);

        if index == 0 && args.max_n_vis > 0 {
            let visuals = pipeline.visuals(&batch.head(args.max_n_vis)?)?;
            save_grid(&visuals, &output_dir.join(format!("vis_{}.jpg", args.which_epoch)))?;
        }
        if args.save_output {
            if let Some(images) = pipeline.output_images(&batch)? {
                for (i, id) in batch.ids().iter().enumerate() {
                    let path = output_dir.join(format!("{}.jpg", id.join("_")));
                    save_image(&images.get(i)?, &path)?;
                }
            }
        }
        pb.inc(1);
    }
    pb.finish_and_clear();

    let mut errors = buffer.summary();
    errors.extend(&pipeline.finish_test()?);
    println!("[{}] {} test batches, checkpoint [{}]", config.id, total, args.which_epoch);
    for (name, value) in errors.iter() {
        println!("{name:>16}: {value:.4}");
    }
    if args.save_output {
        log::info!("outputs saved to {}", output_dir.display());
    }
    Ok(())
}
