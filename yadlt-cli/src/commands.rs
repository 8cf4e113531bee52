//! Benchmark commands.
use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context as _};
use candle_core::{DType, Device, Tensor};
use yadlt::data::preprocess::{binarize, discretize, normalize, one_hot_states, shuffle_take};
use yadlt::data::{mnist, Mnist};
use yadlt::models::autoencoder::{DenoisingAutoencoder, StackedDenoisingAutoencoder};
use yadlt::models::dbn::{Dbn, DbnConfig};
use yadlt::models::logistic::LogisticRegression;
use yadlt::models::rbm::{Rbm, RbmConfig, Units};
use yadlt::models::rbm_classifier::RbmClassifier;
use yadlt::models::Classifier;
use yadlt::util::device::default_device;
use yadlt::util::rng::TensorRng;

use crate::config::RunConfig;
use crate::{FineTune, UnitsArg};

const IMAGE_SIDE: usize = 28;

/// Settings shared by all commands.
pub struct Context {
    pub config: RunConfig,
    pub mnist_dir: PathBuf,
    pub output_dir: PathBuf,
    pub display: bool,
}

impl Context {
    fn output_path(&self, file_name: &str) -> anyhow::Result<PathBuf> {
        fs::create_dir_all(&self.output_dir).with_context(|| {
            format!(
                "Cannot create output directory {}",
                self.output_dir.display()
            )
        })?;
        Ok(self.output_dir.join(file_name))
    }
}

/// One benchmark result.
pub struct Report {
    model: String,
    metric: &'static str,
    value: f64,
    train_time: Duration,
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "model={} metric={} value={:.4} train_time={:.2}s",
            self.model,
            self.metric,
            self.value,
            self.train_time.as_secs_f64()
        )
    }
}

/// Shuffled and encoded MNIST subsets.
struct Dataset {
    train: Tensor,
    train_labels: Tensor,
    test: Tensor,
    test_labels: Tensor,
}

impl Dataset {
    /// Load MNIST and keep the first `train_size`/`test_size` samples after
    /// shuffling. The pixels are raw intensities.
    fn load(ctx: &Context, device: &Device, rng: &mut TensorRng) -> anyhow::Result<Self> {
        let mnist = Mnist::load(&ctx.mnist_dir).with_context(|| {
            format!("Cannot load MNIST from {}", ctx.mnist_dir.display())
        })?;
        let data = &ctx.config.data;

        let (train, train_labels) = shuffle_take(
            &mnist.train.pixels(device)?,
            &mnist.train.label_tensor(device)?,
            data.train_size,
            rng,
        )?;
        let (test, test_labels) = shuffle_take(
            &mnist.test.pixels(device)?,
            &mnist.test.label_tensor(device)?,
            data.test_size,
            rng,
        )?;
        tracing::info!(
            n_train = train.dim(0)?,
            n_test = test.dim(0)?,
            "MNIST loaded"
        );

        Ok(Self {
            train,
            train_labels,
            test,
            test_labels,
        })
    }

    /// Encode the pixels of both subsets.
    fn encode(
        self,
        encode: impl Fn(&Tensor) -> Result<Tensor, candle_core::Error>,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            train: encode(&self.train)?,
            test: encode(&self.test)?,
            ..self
        })
    }

    /// The first `batch_size` test samples.
    fn validation(&self, batch_size: usize) -> anyhow::Result<Tensor> {
        let n = batch_size.min(self.test.dim(0)?);
        Ok(self.test.narrow(0, 0, n)?)
    }
}

fn visible_units(ctx: &Context, units: UnitsArg) -> (Units, Units) {
    match units {
        UnitsArg::Standard => (Units::Bernoulli, Units::Bernoulli),
        UnitsArg::Gaussian => (Units::Gaussian, Units::Bernoulli),
        UnitsArg::Multinomial => (
            Units::Multinomial {
                n_states: ctx.config.data.n_visible_states,
            },
            Units::Multinomial {
                n_states: ctx.config.rbm.n_hidden_states,
            },
        ),
    }
}

fn encode_for(ctx: &Context, units: UnitsArg, dataset: Dataset) -> anyhow::Result<Dataset> {
    let n_states = ctx.config.data.n_visible_states;
    match units {
        UnitsArg::Standard => dataset.encode(binarize),
        UnitsArg::Gaussian => dataset.encode(normalize),
        UnitsArg::Multinomial => {
            dataset.encode(|pixels| one_hot_states(&discretize(pixels, n_states)?, n_states))
        }
    }
}

fn model_name(units: UnitsArg) -> &'static str {
    match units {
        UnitsArg::Standard => "rbm",
        UnitsArg::Gaussian => "grbm",
        UnitsArg::Multinomial => "mrbm",
    }
}

fn build_rbm(
    ctx: &Context,
    units: UnitsArg,
    device: &Device,
    rng: &mut TensorRng,
) -> anyhow::Result<Rbm> {
    let (visible, hidden) = visible_units(ctx, units);
    Ok(RbmConfig::default()
        .n_visible(IMAGE_SIDE * IMAGE_SIDE)
        .n_hidden(ctx.config.rbm.n_hidden)
        .visible_units(visible)
        .hidden_units(hidden)
        .build(device, rng)?)
}

/// Pixel intensities in `[0, 1]` of an encoded image.
fn displayable(image: &Tensor, units: UnitsArg, n_states: usize) -> anyhow::Result<Vec<f32>> {
    let image = match units {
        UnitsArg::Multinomial => {
            // Expected state of every pixel, scaled to [0, 1].
            let levels = Tensor::arange(0u32, n_states as u32, image.device())?
                .to_dtype(DType::F32)?
                .affine(1. / (n_states.max(2) - 1) as f64, 0.)?
                .reshape((n_states, 1))?;
            image.reshape((IMAGE_SIDE * IMAGE_SIDE, n_states))?.matmul(&levels)?
        }
        _ => image.clamp(0f32, 1f32)?,
    };
    Ok(image.flatten_all()?.to_vec1::<f32>()?)
}

fn display(original: &[f32], reconstruction: &[f32]) {
    println!("Original:\n{}", mnist::render(original, IMAGE_SIDE));
    println!("Reconstruction:\n{}", mnist::render(reconstruction, IMAGE_SIDE));
}

fn classifier_error(err: yadlt::error::BoxedError) -> anyhow::Error {
    anyhow!(err)
}

/// Train an RBM and report its test reconstruction error.
pub fn rbm(ctx: &Context, units: UnitsArg) -> anyhow::Result<Vec<Report>> {
    let device = default_device();
    let mut rng = TensorRng::seed_from_u64(ctx.config.seed);
    // Invalid unit configurations fail before any data is encoded.
    let mut rbm = build_rbm(ctx, units, &device, &mut rng)?;
    let dataset = encode_for(ctx, units, Dataset::load(ctx, &device, &mut rng)?)?;
    let training = &ctx.config.rbm.training;
    let validation = dataset.validation(training.get_batch_size())?;

    let start = Instant::now();
    rbm.train(&dataset.train, Some(&validation), training, &mut rng)
        .context("Cannot train RBM")?;
    let train_time = start.elapsed();

    let error = rbm.reconstruction_error(&dataset.test)?;
    let path = ctx.output_path(&format!("{}.json", model_name(units)))?;
    rbm.save(&path)
        .with_context(|| format!("Cannot save RBM to {}", path.display()))?;
    tracing::info!(path = %path.display(), "RBM saved");

    if ctx.display {
        let first = dataset.test.narrow(0, 0, 1)?;
        let n_states = ctx.config.data.n_visible_states;
        display(
            &displayable(&first, units, n_states)?,
            &displayable(&rbm.reconstruct(&first)?, units, n_states)?,
        );
    }

    Ok(vec![Report {
        model: model_name(units).to_string(),
        metric: "reconstruction_error",
        value: error,
        train_time,
    }])
}

/// Compare logistic regression on RBM features with logistic regression on
/// the raw input.
pub fn rbm_vs_logistic(ctx: &Context, units: UnitsArg) -> anyhow::Result<Vec<Report>> {
    let device = default_device();
    let config = &ctx.config;
    let mut rng = TensorRng::seed_from_u64(config.seed);
    let rbm = build_rbm(ctx, units, &device, &mut rng)?;
    let dataset = encode_for(ctx, units, Dataset::load(ctx, &device, &mut rng)?)?;
    let validation = dataset.validation(config.rbm.training.get_batch_size())?;
    let n_classes = config.data.n_classes;

    let mut rbm_classifier = RbmClassifier::new(rbm, n_classes, config.logistic.clone());
    let start = Instant::now();
    rbm_classifier
        .learn_unsupervised_features(
            &dataset.train,
            Some(&validation),
            &config.rbm.training,
            &mut rng,
        )
        .context("Cannot learn RBM features")?;
    rbm_classifier
        .fit_logistic_cls(&dataset.train, &dataset.train_labels, &mut rng)
        .context("Cannot fit logistic regression on RBM features")?;
    let rbm_time = start.elapsed();
    let rbm_accuracy = rbm_classifier
        .accuracy(&dataset.test, &dataset.test_labels)
        .map_err(classifier_error)?;

    let mut logistic = LogisticRegression::new(
        dataset.train.dim(1)?,
        n_classes,
        config.logistic.clone(),
        &device,
    )?;
    let start = Instant::now();
    logistic
        .fit(&dataset.train, &dataset.train_labels, &mut rng)
        .context("Cannot fit logistic regression")?;
    let logistic_time = start.elapsed();
    let logistic_accuracy = logistic
        .accuracy(&dataset.test, &dataset.test_labels)
        .map_err(classifier_error)?;

    let path = ctx.output_path(&format!("{}-features.json", model_name(units)))?;
    rbm_classifier.rbm().save(&path)?;

    Ok(vec![
        Report {
            model: format!("{}+logistic", model_name(units)),
            metric: "accuracy",
            value: rbm_accuracy.into(),
            train_time: rbm_time,
        },
        Report {
            model: "logistic".to_string(),
            metric: "accuracy",
            value: logistic_accuracy.into(),
            train_time: logistic_time,
        },
    ])
}

/// Pretrain and fine-tune a DBN on binarized pixels.
pub fn dbn(ctx: &Context, finetune: FineTune) -> anyhow::Result<Vec<Report>> {
    let device = default_device();
    let config = &ctx.config;
    let dbn_config = &config.dbn;
    let mut rng = TensorRng::seed_from_u64(config.seed);
    let dataset = Dataset::load(ctx, &device, &mut rng)?.encode(binarize)?;
    let validation = dataset.validation(dbn_config.pretrain.get_batch_size())?;
    let n_classes = config.data.n_classes;

    let mut dbn = DbnConfig::default()
        .layers(dbn_config.layers.clone())
        .build(&device, &mut rng)?;

    let start = Instant::now();
    dbn.unsupervised_pretrain(
        &dataset.train,
        Some(&validation),
        &dbn_config.pretrain,
        &mut rng,
    )
    .context("Cannot pretrain DBN")?;

    let (name, predictions) = match finetune {
        FineTune::Logistic => {
            dbn.fit_cls(
                &dataset.train,
                &dataset.train_labels,
                n_classes,
                config.logistic.clone(),
                &mut rng,
            )?;
            ("dbn+logistic", dbn.predict_cls(&dataset.test)?)
        }
        FineTune::WakeSleep => {
            dbn.wake_sleep(
                dbn_config.n_top,
                n_classes,
                &dataset.train,
                &dataset.train_labels,
                &dbn_config.wake_sleep,
                &mut rng,
            )?;
            (
                "dbn+wake-sleep",
                dbn.predict_ws(&dataset.test, dbn_config.predict_gibbs_k)?,
            )
        }
        FineTune::Backprop => {
            dbn.backprop(
                n_classes,
                &dataset.train,
                &dataset.train_labels,
                &dbn_config.backprop,
                &mut rng,
            )?;
            ("dbn+backprop", dbn.predict_bp(&dataset.test)?)
        }
    };
    let train_time = start.elapsed();
    let accuracy = yadlt::training::accuracy(&predictions, &dataset.test_labels)?;

    save_dbn(ctx, &dbn)?;

    if ctx.display {
        let first = dataset.test.narrow(0, 0, 1)?;
        let top = dbn.forward(&first)?;
        let top = top.last().context("DBN has no layers")?;
        display(
            &displayable(&first, UnitsArg::Standard, 2)?,
            &displayable(&dbn.backward(top)?, UnitsArg::Standard, 2)?,
        );
    }

    Ok(vec![Report {
        model: name.to_string(),
        metric: "accuracy",
        value: accuracy.into(),
        train_time,
    }])
}

fn save_dbn(ctx: &Context, dbn: &Dbn) -> anyhow::Result<()> {
    for (layer, rbm) in dbn.rbms().iter().enumerate() {
        let path = ctx.output_path(&format!("dbn-rbm-{layer}.json"))?;
        rbm.save(&path)
            .with_context(|| format!("Cannot save RBM to {}", path.display()))?;
    }
    let path = ctx.output_path("dbn-metrics.json")?;
    dbn.save_performance_metrics(&path)?;
    tracing::info!(dir = %ctx.output_dir.display(), "DBN saved");
    Ok(())
}

/// Train a denoising autoencoder and report its test reconstruction cost.
pub fn dae(ctx: &Context) -> anyhow::Result<Vec<Report>> {
    let device = default_device();
    let config = &ctx.config;
    let mut rng = TensorRng::seed_from_u64(config.seed);
    let dataset = Dataset::load(ctx, &device, &mut rng)?.encode(normalize)?;
    let validation = dataset.validation(config.dae.get_batch_size())?;

    let mut dae: DenoisingAutoencoder = config.dae.build(dataset.train.dim(1)?, &device)?;
    let start = Instant::now();
    dae.fit(&dataset.train, Some(&validation), &mut rng)
        .context("Cannot train denoising autoencoder")?;
    let train_time = start.elapsed();

    let cost = dae.cost(&dataset.test)?;
    let path = ctx.output_path("dae.safetensors")?;
    dae.save(&path)
        .with_context(|| format!("Cannot save autoencoder to {}", path.display()))?;

    if ctx.display {
        let first = dataset.test.narrow(0, 0, 1)?;
        display(
            &displayable(&first, UnitsArg::Gaussian, 2)?,
            &displayable(&dae.reconstruct(&first)?, UnitsArg::Gaussian, 2)?,
        );
    }

    Ok(vec![Report {
        model: "dae".to_string(),
        metric: "reconstruction_cost",
        value: cost,
        train_time,
    }])
}

/// Train a stacked denoising autoencoder classifier.
pub fn sdae(ctx: &Context, pretrain: bool) -> anyhow::Result<Vec<Report>> {
    let device = default_device();
    let config = &ctx.config;
    let mut rng = TensorRng::seed_from_u64(config.seed);
    let dataset = Dataset::load(ctx, &device, &mut rng)?.encode(normalize)?;
    let n_validation = config.sdae.get_finetune().batch_size;
    let validation = dataset.validation(n_validation)?;
    let validation_labels = dataset
        .test_labels
        .narrow(0, 0, validation.dim(0)?)?;

    let mut sdae: StackedDenoisingAutoencoder = config.sdae.build()?;
    let start = Instant::now();
    if pretrain {
        sdae.pretrain(&dataset.train, Some(&validation), &mut rng)
            .context("Cannot pretrain stacked autoencoder")?;
    }
    sdae.fit(
        &dataset.train,
        &dataset.train_labels,
        Some((&validation, &validation_labels)),
        config.data.n_classes,
        &mut rng,
    )
    .context("Cannot fine-tune stacked autoencoder")?;
    let train_time = start.elapsed();

    let accuracy = sdae
        .accuracy(&dataset.test, &dataset.test_labels)
        .map_err(classifier_error)?;
    let path = ctx.output_path("sdae.safetensors")?;
    sdae.save(&path)
        .with_context(|| format!("Cannot save stacked autoencoder to {}", path.display()))?;

    let model = if pretrain { "sdae" } else { "sdae-no-pretrain" };
    Ok(vec![Report {
        model: model.to_string(),
        metric: "accuracy",
        value: accuracy.into(),
        train_time,
    }])
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use candle_core::{Device, Tensor};

    use yadlt::util::rng::TensorRng;

    use super::{build_rbm, displayable, encode_for, Context, Dataset, Report};
    use crate::config::RunConfig;
    use crate::UnitsArg;

    fn context(n_visible_states: usize) -> Context {
        let mut config = RunConfig::default();
        config.data.n_visible_states = n_visible_states;
        config.rbm.n_hidden = 4;
        Context {
            config,
            mnist_dir: "mnist".into(),
            output_dir: "models".into(),
            display: false,
        }
    }

    #[test]
    fn rejects_degenerate_multinomial_states() {
        let ctx = context(0);
        let mut rng = TensorRng::seed_from_u64(1);
        assert!(build_rbm(&ctx, UnitsArg::Multinomial, &Device::Cpu, &mut rng).is_err());

        let pixels = Tensor::new(&[[0f32, 255.]], &Device::Cpu).unwrap();
        let labels = Tensor::new(&[0u32], &Device::Cpu).unwrap();
        let dataset = Dataset {
            train: pixels.clone(),
            train_labels: labels.clone(),
            test: pixels,
            test_labels: labels,
        };
        assert!(encode_for(&ctx, UnitsArg::Multinomial, dataset).is_err());

        assert!(build_rbm(&context(4), UnitsArg::Multinomial, &Device::Cpu, &mut rng).is_ok());
    }

    #[test]
    fn report_line() {
        let report = Report {
            model: "rbm".to_string(),
            metric: "reconstruction_error",
            value: 0.12345,
            train_time: Duration::from_millis(1500),
        };
        assert_eq!(
            report.to_string(),
            "model=rbm metric=reconstruction_error value=0.1235 train_time=1.50s"
        );
    }

    #[test]
    fn multinomial_pixels_are_expected_states() {
        // Every pixel in state 1 of 3.
        let image = Tensor::new(&[0f32, 1., 0.], &Device::Cpu)
            .unwrap()
            .repeat(784)
            .unwrap()
            .reshape((1, 784 * 3))
            .unwrap();
        let pixels = displayable(&image, UnitsArg::Multinomial, 3).unwrap();
        assert_eq!(pixels.len(), 784);
        assert!(pixels.iter().all(|&p| (p - 0.5).abs() < 1e-6));
    }
}
