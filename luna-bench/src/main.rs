use std::{fmt::Display, path::PathBuf, time::Instant};

use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use clap::Parser;
use cli_table::{format::Justify, print_stdout, Cell, CellStruct, Style, Table};
use luna_core::{
    initialize_logging, AttentionActivation, ForwardFlags, GatedCrossAttention,
    GatedCrossAttentionConfig, IncrementalState,
};
use tracing::{info, warn};

enum TestName {
    Full(usize, usize),
    Decode(usize),
}

impl Display for TestName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TestName::Full(tgt, src) => format!("full {tgt}x{src}"),
            TestName::Decode(n) => format!("decode {n}"),
        };
        write!(f, "{}", name)
    }
}

struct BenchResult {
    /// Wall time of each repetition, in milliseconds.
    timings: Vec<f32>,
    test_name: TestName,
}

struct UncertainMs {
    mean: f32,
    std_dev: f32,
}

impl Display for UncertainMs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:.3}±{:.3}", self.mean, self.std_dev)
    }
}

fn get_ms(result: &BenchResult) -> UncertainMs {
    let mean = result.timings.iter().sum::<f32>() / result.timings.len() as f32;
    let variance = result
        .timings
        .iter()
        .map(|e| (mean - e).powf(2.))
        .sum::<f32>()
        / result.timings.len() as f32;
    UncertainMs {
        mean,
        std_dev: variance.sqrt(),
    }
}

fn get_ms_step(result: &BenchResult) -> UncertainMs {
    let steps = match result.test_name {
        TestName::Full(..) => 1,
        TestName::Decode(n) => n,
    } as f32;
    let UncertainMs { mean, std_dev } = get_ms(result);
    UncertainMs {
        mean: mean / steps,
        std_dev: std_dev / steps,
    }
}

fn print_usage(unit: &GatedCrossAttention, device: &Device, results: Vec<BenchResult>) {
    let backend = match device {
        Device::Cpu => "CPU",
        Device::Cuda(_) => "CUDA",
        Device::Metal(_) => "Metal",
    };
    let results: Vec<Vec<CellStruct>> = results
        .into_iter()
        .map(|r| {
            vec![
                unit.to_string().cell(),
                backend.cell(),
                r.test_name.to_string().cell(),
                get_ms(&r).cell().justify(Justify::Right),
                get_ms_step(&r).cell().justify(Justify::Right),
            ]
        })
        .collect();

    let table = results
        .table()
        .title(vec![
            "unit".cell().bold(true),
            "backend".cell().bold(true),
            "test".cell().bold(true),
            "ms".cell().bold(true),
            "ms/step".cell().bold(true),
        ])
        .bold(true);
    if let Err(e) = print_stdout(table) {
        warn!("Failed to print the results table: {e}");
    }
}

struct Inputs {
    query: Tensor,
    key: Tensor,
    key_padding_mask: Tensor,
}

fn make_inputs(args: &Args, embed_dim: usize, device: &Device) -> anyhow::Result<Inputs> {
    let query = Tensor::randn(0f32, 1., (args.tgt_len, args.batch, embed_dim), device)?;
    let key = Tensor::randn(0f32, 1., (args.src_len, args.batch, embed_dim), device)?;
    // Last batch row is padded to half its length.
    let mut mask = vec![0u8; args.batch * args.src_len];
    if args.batch > 1 {
        let row = &mut mask[(args.batch - 1) * args.src_len..];
        for m in row.iter_mut().skip(args.src_len.div_ceil(2)) {
            *m = 1;
        }
    }
    let key_padding_mask = Tensor::from_vec(mask, (args.batch, args.src_len), device)?;
    Ok(Inputs {
        query,
        key,
        key_padding_mask,
    })
}

fn run_full(unit: &GatedCrossAttention, inputs: &Inputs) -> anyhow::Result<Tensor> {
    let (out, _) = unit
        .forward(
            &inputs.query,
            Some(&inputs.key),
            Some(&inputs.key),
            None,
            Some(&inputs.key_padding_mask),
            None,
            ForwardFlags::default(),
        )?
        .into_hidden()?;
    Ok(out)
}

fn run_decode(unit: &GatedCrossAttention, inputs: &Inputs) -> anyhow::Result<Tensor> {
    let flags = ForwardFlags {
        static_kv: true,
        ..Default::default()
    };
    let mut state = IncrementalState::new();
    let mut outs = Vec::new();
    for t in 0..inputs.query.dim(0)? {
        let (key, mask) = if t == 0 {
            (Some(&inputs.key), Some(&inputs.key_padding_mask))
        } else {
            (None, None)
        };
        let (out, _) = unit
            .forward(
                &inputs.query.narrow(0, t, 1)?,
                key,
                key,
                None,
                mask,
                Some(&mut state),
                flags,
            )?
            .into_hidden()?;
        outs.push(out);
    }
    Ok(Tensor::cat(&outs, 0)?)
}

fn run_bench<F>(
    repetitions: usize,
    device: &Device,
    test_name: TestName,
    mut f: F,
) -> anyhow::Result<BenchResult>
where
    F: FnMut() -> anyhow::Result<Tensor>,
{
    let mut timings = Vec::with_capacity(repetitions);
    for _ in 0..repetitions {
        let start = Instant::now();
        f()?;
        device.synchronize()?;
        timings.push(start.elapsed().as_secs_f32() * 1000.);
    }
    Ok(BenchResult {
        timings,
        test_name,
    })
}

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Args {
    /// JSON config of the attention unit. Overrides the shape arguments below.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Integer seed to ensure reproducible random number generation.
    #[arg(short, long)]
    seed: Option<u64>,

    /// Model width.
    #[arg(long, default_value_t = 512)]
    embed_dim: usize,

    /// Width of the attention query and key.
    #[arg(long, default_value_t = 64)]
    zdim: usize,

    /// Attention score kernel: `softmax` or `relu2`.
    #[arg(long, default_value_t = AttentionActivation::Softmax)]
    attention_activation: AttentionActivation,

    /// Number of context positions.
    #[arg(long, short = 'p', default_value_t = 256)]
    src_len: usize,

    /// Number of target positions, also the number of decoding steps.
    #[arg(long, short = 'g', default_value_t = 64)]
    tgt_len: usize,

    /// Batch size.
    #[arg(long, short, default_value_t = 4)]
    batch: usize,

    /// Number of times to repeat each test.
    #[arg(long, short, default_value_t = 5)]
    repetitions: usize,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    initialize_logging();

    if args.repetitions == 0 || args.tgt_len == 0 || args.src_len == 0 || args.batch == 0 {
        anyhow::bail!("`repetitions`, `tgt-len`, `src-len` and `batch` must be strictly positive");
    }

    let cfg = match &args.config {
        Some(path) => GatedCrossAttentionConfig::from_file(path)?,
        None => {
            let mut cfg = GatedCrossAttentionConfig::new(args.embed_dim, args.zdim);
            cfg.attention_activation = args.attention_activation;
            cfg.max_positions = cfg.max_positions.max(args.src_len.max(args.tgt_len));
            cfg
        }
    };
    cfg.validate()?;

    #[cfg(feature = "metal")]
    let device = Device::new_metal(0)?;
    #[cfg(not(feature = "metal"))]
    let device = Device::cuda_if_available(0)?;

    if let Some(seed) = args.seed {
        if device.is_cpu() {
            warn!("Seeding is not supported on the CPU backend, ignoring `--seed {seed}`.");
        } else {
            device.set_seed(seed)?;
        }
    }

    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    let unit = GatedCrossAttention::new(&cfg, vb)?;
    info!("Benchmarking gated cross-attention ({unit}) on {device:?}.");

    let inputs = make_inputs(&args, cfg.embed_dim, &device)?;

    // warmup
    let full = run_full(&unit, &inputs)?;
    let decoded = run_decode(&unit, &inputs)?;
    let max_diff = full
        .sub(&decoded)?
        .abs()?
        .flatten_all()?
        .max(0)?
        .to_scalar::<f32>()?;
    info!("Max abs difference between full and step-wise outputs: {max_diff:.3e}");

    let results = vec![
        run_bench(
            args.repetitions,
            &device,
            TestName::Full(args.tgt_len, args.src_len),
            || run_full(&unit, &inputs),
        )?,
        run_bench(
            args.repetitions,
            &device,
            TestName::Decode(args.tgt_len),
            || run_decode(&unit, &inputs),
        )?,
    ];

    print_usage(&unit, &device, results);

    Ok(())
}
