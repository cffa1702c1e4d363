//! Trains a feed-forward network for multiclass image classification
//! using the library provided by `nn_basics`
//!
//! # Usage
//! Runnable via
//! ```sh
//! cargo run -- -h
//! cargo run -- --data-dir data/MNIST/raw
//! cargo run -- -d xor --hidden 16
//! ```
//!
//! MNIST and Fashion-MNIST are read from the uncompressed IDX files in `--data-dir`.
//! The two dimensional datasets are generated on the fly. Set `RUST_LOG=debug` for
//! NaN diagnostics.

use std::{error::Error, path::PathBuf};

use nn_basics::{
    dataloader::DataLoader,
    datasets::{Dataset, LoadOptions, Normalize, Split, load_dataset},
    loss::Criterion,
    nn::{Linear, LogSoftmax, Module, ReLU, Sequential, Softmax},
    optim::{Adam, Optim, OptimKind, SGD},
    train::{evaluate, predict, train_epoch},
};

use clap::Parser;
use rand::{Rng, SeedableRng};
use rand_pcg::Pcg64Mcg;

#[derive(Parser)]
struct Args {
    #[clap(short, long, default_value_t = Dataset::Mnist)]
    dataset: Dataset,
    /// Directory holding train-images-idx3-ubyte, train-labels-idx1-ubyte, t10k-*
    #[clap(long, default_value = "data")]
    data_dir: PathBuf,
    #[clap(long, default_value_t = 0.5)]
    normalize_mean: f32,
    #[clap(long, default_value_t = 0.5)]
    normalize_std: f32,
    /// Only use the first N samples of each split
    #[clap(long)]
    limit: Option<usize>,
    /// Points per class for the generated datasets
    #[clap(short, long, default_value_t = 500)]
    class_size: usize,
    /// Hidden layer sizes, comma separated
    #[clap(long, value_delimiter = ',', default_values_t = [128, 64])]
    hidden: Vec<usize>,
    #[clap(long, value_enum, default_value_t = Criterion::Nll)]
    criterion: Criterion,
    #[clap(long, value_enum, default_value_t = OptimKind::Sgd)]
    optimizer: OptimKind,
    #[clap(short, long, default_value_t = 64)]
    batch_size: usize,
    #[clap(short, long, default_value_t = 5)]
    epochs: usize,
    #[clap(short, long, default_value_t = 0.003)]
    lr: f32,
    #[clap(short, long, default_value_t = 0.9)]
    momentum: f32,
    #[clap(short, long, default_value_t = 1)]
    print_epochs: usize,
    /// Seed for the generated datasets, weight initialization and shuffling
    #[clap(long)]
    seed: Option<u64>,
}

/// Stacks `Linear` + `ReLU` blocks and ends with the head the criterion expects
fn build_model<R: Rng + ?Sized>(
    n_inputs: usize,
    hidden: &[usize],
    n_classes: usize,
    criterion: Criterion,
    rng: &mut R,
) -> Sequential {
    let mut model = Sequential::new();
    let mut n_in = n_inputs;
    for &units in hidden {
        model = model.add(Linear::with_rng(n_in, units, &mut *rng)).add(ReLU::new());
        n_in = units;
    }
    model = model.add(Linear::with_rng(n_in, n_classes, &mut *rng));
    match criterion {
        Criterion::CrossEntropy => model,
        Criterion::Nll => model.add(LogSoftmax),
        Criterion::Mse => model.add(Softmax),
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let args = Args::parse();
    let options = LoadOptions {
        data_dir: args.data_dir.clone(),
        normalize: Normalize::new(args.normalize_mean, args.normalize_std)?,
        class_size: args.class_size,
    };
    let mut rng = match args.seed {
        Some(seed) => Pcg64Mcg::seed_from_u64(seed),
        None => Pcg64Mcg::from_rng(&mut rand::rng()),
    };
    let mut train_data = load_dataset(args.dataset, Split::Train, &options, &mut rng)?;
    let mut test_data = load_dataset(args.dataset, Split::Test, &options, &mut rng)?;
    if let Some(limit) = args.limit {
        train_data = train_data.take(limit);
        test_data = test_data.take(limit);
    }

    let model = build_model(
        train_data.n_features(),
        &args.hidden,
        train_data.n_classes,
        args.criterion,
        &mut rng,
    );
    log::info!("{}", model);

    let mut optim: Box<dyn Optim> = match args.optimizer {
        OptimKind::Sgd => Box::new(SGD::new(model.parameters(), args.lr, args.momentum)),
        OptimKind::Adam => Box::new(Adam::new(model.parameters(), args.lr)),
    };

    // held out sample whose prediction is shown after training
    let sample = test_data.sample(0);
    let mut train_loader =
        DataLoader::new(train_data.inputs, train_data.labels, args.batch_size, true)?;
    if let Some(seed) = args.seed {
        train_loader = train_loader.with_seed(seed);
    }
    let test_loader = DataLoader::new(test_data.inputs, test_data.labels, args.batch_size, false)?;

    let epochs = args.epochs;
    let print_every = args.print_epochs.max(1);
    for epoch in 0..epochs {
        let train_stats = train_epoch(&model, args.criterion, optim.as_mut(), &train_loader)?;
        if epoch % print_every == 0 || epoch == epochs - 1 {
            let test_stats = evaluate(&model, args.criterion, &test_loader)?;
            log::info!(
                "Epoch: {}/{}.. Training loss: {:.3}.. Training accuracy: {:.3}.. Test loss: {:.3}.. Test accuracy: {:.3}",
                epoch + 1,
                epochs,
                train_stats.loss,
                train_stats.accuracy,
                test_stats.loss,
                test_stats.accuracy
            );
        }
    }

    if let Some((input, label)) = sample {
        let probs = predict(&model, args.criterion, input)?;
        log::info!(
            "Class probabilities for a test sample of class '{}':",
            test_data.class_names[label]
        );
        for (name, p) in test_data.class_names.iter().zip(probs) {
            log::info!("{:>12}: {:.3}", name, p);
        }
    }
    Ok(())
}
