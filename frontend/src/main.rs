#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

use anyhow::Result;
use clap::builder::BoolishValueParser;
use clap::Parser;
use log::info;
use nonzero::nonzero as nz;

use std::{fs, io, path};

use sramslice::common::{DimSize, Dtype};
use sramslice::config::{BundlizerPolicy, SchedulerConfig};
use sramslice::graph::ops::{BatchGemm, Conv, ConvParams, Dedw, Dedx, EltwiseFn, Op};
use sramslice::graph::Graph;
use sramslice::pipeline::emit;
use sramslice::pprint::{pprint, pprint_tasks, PrintStyle};
use sramslice::scheduler::schedule;
use sramslice::shape;
use sramslice::target::{Gaudi2Target, Gaudi3Target, Target, TargetId};

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Target device
    #[arg(long, value_enum, hide_default_value = true, default_value_t = TargetId::default())]
    target: TargetId,

    /// Element type of every tensor
    #[arg(long, value_enum, default_value_t = Dtype::Bfloat16)]
    dtype: Dtype,

    /// Schedule table style
    #[arg(long, value_enum, default_value_t = PrintStyle::Full)]
    style: PrintStyle,

    /// Also print every emitted task
    #[arg(long, default_value_t = false)]
    tasks: bool,

    /// Execute the schedule and the unsliced reference and compare outputs
    #[cfg(feature = "verification")]
    #[arg(long, default_value_t = false)]
    check: bool,

    /// Write the emitted pipeline here (bincode)
    #[arg(long)]
    save: Option<path::PathBuf>,

    #[command(flatten)]
    config: ConfigArgs,

    #[command(subcommand)]
    subcmd: Subcommand,
}

/// Scheduler flags. Each falls back to the environment variable of the same
/// name, then to the built-in default.
#[derive(clap::Args)]
struct ConfigArgs {
    /// Upper bound on SRAM bytes; 0 disables slicing
    #[arg(long, env = "SRAM_SLICER_MAX_CAPACITY_BYTES")]
    max_capacity_bytes: Option<u64>,
    #[arg(long, env = "ENABLE_PIPELINE_MANAGEMENT", value_parser = BoolishValueParser::new())]
    pipeline_management: Option<bool>,
    #[arg(long, env = "ENABLE_LAYERED_PIPELINE_BRAIN", value_parser = BoolishValueParser::new())]
    layered_brain: Option<bool>,
    #[arg(long, env = "PIPELINE_MANAGEMENT_FORCE_BUNDLIZER", value_enum)]
    force_bundlizer: Option<BundlizerPolicy>,
    #[arg(long, env = "SRAM_SLICER_BUNDLE_EXPANSION_ENABLED", value_parser = BoolishValueParser::new())]
    bundle_expansion: Option<bool>,
    #[arg(long, env = "SRAM_SLICER_COST_MODEL_ENABLED", value_parser = BoolishValueParser::new())]
    cost_model: Option<bool>,
    #[arg(long, env = "ENABLE_SRAM_MULTI_BUFFERING", value_parser = BoolishValueParser::new())]
    multi_buffering: Option<bool>,
    #[arg(long, env = "ENABLE_CONV_PACKING_TRAINING", value_parser = BoolishValueParser::new())]
    conv_packing_training: Option<bool>,
    #[arg(long, env = "ENABLE_TPC_BUNDLES", value_parser = BoolishValueParser::new())]
    tpc_bundles: Option<bool>,
    #[arg(long, env = "MIN_SCALAR_PIPE_INPUT_BYTES_FOR_SRAM_PLACEMENT")]
    min_scalar_pipe_input_bytes: Option<u64>,
    #[arg(long, env = "ENABLE_BGEMM_FLATTEN_TO_GEMM_FOR_SLICING", value_parser = BoolishValueParser::new())]
    bgemm_flatten_to_gemm: Option<bool>,
    #[arg(long, env = "ENABLE_GRAD_A_RESHAPED_GRAD_B_PAIRING", value_parser = BoolishValueParser::new())]
    grad_pairing: Option<bool>,
    #[arg(long, env = "ENABLE_SLICING_BOTH_PRODUCER_CHAINS", value_parser = BoolishValueParser::new())]
    slice_both_producer_chains: Option<bool>,
}

#[derive(clap::Subcommand)]
enum Subcommand {
    #[command(about = "Schedule a matrix multiplication followed by a ReLU")]
    Gemm { m: DimSize, k: DimSize, n: DimSize },
    #[command(about = "Schedule two stacked convolutions with a ReLU between them")]
    Conv {
        #[arg(long, short, default_value = "1")]
        batch: DimSize,
        #[arg(long, default_value = "32")]
        channels: DimSize,
        #[arg(long, default_value = "32")]
        filters: DimSize,
        #[arg(long, default_value = "3")]
        kernel: DimSize,
        size: DimSize,
    },
    #[command(about = "Schedule the input and weight gradients of a convolution")]
    DedxDedw {
        #[arg(long, short, default_value = "1")]
        batch: DimSize,
        #[arg(long, default_value = "32")]
        channels: DimSize,
        #[arg(long, default_value = "32")]
        filters: DimSize,
        #[arg(long, default_value = "3")]
        kernel: DimSize,
        size: DimSize,
    },
    #[command(about = "Schedule a batched matrix multiplication")]
    BatchGemm {
        /// Share the right operand across the batch
        #[arg(long, default_value_t = false)]
        broadcast: bool,
        batch: DimSize,
        m: DimSize,
        k: DimSize,
        n: DimSize,
    },
}

impl ConfigArgs {
    fn to_config(&self) -> SchedulerConfig {
        let mut c = SchedulerConfig::default();
        macro_rules! set {
            ($($field:ident => $target:ident),* $(,)?) => {
                $( if let Some(v) = self.$field { c.$target = v; } )*
            };
        }
        set!(
            max_capacity_bytes => sram_capacity_bytes,
            pipeline_management => pipeline_management,
            layered_brain => layered_brain,
            force_bundlizer => force_bundlizer,
            bundle_expansion => bundle_expansion,
            cost_model => cost_model,
            multi_buffering => multi_buffering,
            conv_packing_training => conv_packing_training,
            tpc_bundles => tpc_bundles,
            min_scalar_pipe_input_bytes => min_scalar_pipe_input_bytes,
            bgemm_flatten_to_gemm => bgemm_flatten_to_gemm,
            grad_pairing => grad_pairing,
            slice_both_producer_chains => slice_both_producer_chains,
        );
        c
    }
}

fn build_graph(subcmd: &Subcommand, dtype: Dtype) -> Result<Graph> {
    let mut g = Graph::new();
    match *subcmd {
        Subcommand::Gemm { m, k, n } => {
            let a = g.create_tensor("a", shape![m, k], dtype, false)?;
            let b = g.create_tensor("b", shape![k, n], dtype, false)?;
            let y = g.apply("gemm", Op::gemm(), &[a, b])?;
            g.apply("relu", Op::eltwise(EltwiseFn::Relu), &[y])?;
        }
        Subcommand::Conv {
            batch,
            channels,
            filters,
            kernel,
            size,
        } => {
            let params = ConvParams::same_padding([kernel.get(), kernel.get()]);
            let x = g.create_tensor("x", shape![batch, size, size, channels], dtype, false)?;
            let w0 = g.create_tensor("w0", shape![kernel, kernel, channels, filters], dtype, false)?;
            let w1 = g.create_tensor("w1", shape![kernel, kernel, filters, filters], dtype, false)?;
            let y = g.apply("conv0", Op::Conv(Conv { params }), &[x, w0])?;
            let r = g.apply("relu", Op::eltwise(EltwiseFn::Relu), &[y])?;
            g.apply("conv1", Op::Conv(Conv { params }), &[r, w1])?;
        }
        Subcommand::DedxDedw {
            batch,
            channels,
            filters,
            kernel,
            size,
        } => {
            let params = ConvParams::same_padding([kernel.get(), kernel.get()]);
            let dy = g.create_tensor("dy", shape![batch, size, size, filters], dtype, false)?;
            let w = g.create_tensor("w", shape![kernel, kernel, channels, filters], dtype, false)?;
            let x = g.create_tensor("x", shape![batch, size, size, channels], dtype, false)?;
            g.apply(
                "dedx",
                Op::Dedx(Dedx {
                    params,
                    input_hw: [size.get(), size.get()],
                }),
                &[dy, w],
            )?;
            g.apply(
                "dedw",
                Op::Dedw(Dedw {
                    params,
                    kernel: [kernel.get(), kernel.get()],
                }),
                &[dy, x],
            )?;
        }
        Subcommand::BatchGemm {
            broadcast,
            batch,
            m,
            k,
            n,
        } => {
            let b_batch = if broadcast { nz!(1u32) } else { batch };
            let a = g.create_tensor("a", shape![batch, m, k], dtype, false)?;
            let b = g.create_tensor("b", shape![b_batch, k, n], dtype, false)?;
            g.apply("bgemm", Op::BatchGemm(BatchGemm::default()), &[a, b])?;
        }
    }
    g.freeze()?;
    Ok(g)
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();
    match args.target {
        TargetId::Gaudi2 => main_per_target::<Gaudi2Target>(&args),
        TargetId::Gaudi3 => main_per_target::<Gaudi3Target>(&args),
    }
}

fn main_per_target<Tgt: Target>(args: &Args) -> Result<()> {
    let config = args.config.to_config();
    info!("Configuration: {}", config);
    let graph = build_graph(&args.subcmd, args.dtype)?;

    let start_time = std::time::Instant::now();
    let scheduled = schedule::<Tgt>(&graph, &config)?;
    info!("schedule took {:?}", start_time.elapsed());
    pprint(&graph, &scheduled, args.style);

    let pipeline = emit(&graph, &scheduled)?;
    if args.tasks {
        println!();
        pprint_tasks(&graph, &pipeline);
    }
    println!(
        "\n{} tasks ({} fetches, {} evictions), peak SRAM {} of {} bytes",
        pipeline.tasks.len(),
        pipeline.fetch_count(),
        pipeline.evict_count(),
        scheduled.peak_sram,
        scheduled.capacity
    );

    if let Some(path) = &args.save {
        let file = io::BufWriter::new(fs::File::create(path)?);
        bincode::serialize_into(file, &pipeline)?;
        info!("Saved pipeline to {}", path.display());
    }

    #[cfg(feature = "verification")]
    if args.check {
        sramslice::verification::compare_runs::<Tgt>(
            &graph,
            &SchedulerConfig::unsliced(),
            &config,
            0,
        )?;
        println!("Outputs match the unsliced reference");
    }
    Ok(())
}
