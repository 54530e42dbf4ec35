use std::{
    io::{Write, stdout},
    sync::Arc,
    time::Instant,
};

use anyhow::anyhow;
use clap::{Parser, ValueEnum};
use ep_all_to_all::{
    Buffer, BufferOptions, CombineRequest, DispatchRequest, LowLatencyCombineRequest,
    LowLatencyDispatchRequest, Matrix, PlacementStrategy, TokenPayload, TopkSelection,
};
use fabric_lib::{LinkTopology, LoopbackFabric, RdmaEngine};
use logging_lib::LoggingOpts;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum BenchMode {
    Normal,
    LowLatency,
}

/// Dispatch/combine round trips between in-process ranks.
#[derive(Debug, Parser)]
struct Args {
    #[clap(long, value_enum, default_value = "normal")]
    mode: BenchMode,
    #[clap(long, default_value_t = 8)]
    num_ranks: usize,
    #[clap(long, default_value_t = 128)]
    num_tokens: usize,
    #[clap(long, default_value_t = 1024)]
    hidden: usize,
    #[clap(long, default_value_t = 64)]
    num_experts: usize,
    #[clap(long, default_value_t = 8)]
    num_topk: usize,
    /// Send e4m3 payloads in low-latency mode.
    #[clap(long)]
    fp8: bool,
    /// Send e4m3 payloads with power-of-two scales packed as UE8M0.
    #[clap(long)]
    ue8m0: bool,
    #[clap(long, default_value_t = 3)]
    warmups: usize,
    #[clap(long, default_value_t = 20)]
    repeats: usize,
    /// Check the combined output of the first round trip.
    #[clap(long)]
    verify: bool,
    #[clap(flatten)]
    logging: LoggingOpts,
}

fn fill_random_u64(vec: &mut [u64], seed: u64) {
    let mut state = seed.max(1);
    for v in vec.iter_mut() {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        *v = state;
    }
}

fn random_states(rank: usize, args: &Args) -> anyhow::Result<Matrix<f32>> {
    let mut bits = vec![0u64; args.num_tokens * args.hidden];
    fill_random_u64(&mut bits, 0x9e37_79b9 + rank as u64);
    let data = bits.iter().map(|b| (b % 2001) as f32 / 1000.0 - 1.0).collect();
    Ok(Matrix::from_vec(args.num_tokens, args.hidden, data)?)
}

/// Distinct random experts per token with softmax-like decreasing weights.
fn random_selection(rank: usize, args: &Args) -> anyhow::Result<TopkSelection> {
    let mut bits = vec![0u64; args.num_tokens * args.num_topk];
    fill_random_u64(&mut bits, 0x5851_f42d + rank as u64);
    let mut idx = Vec::with_capacity(bits.len());
    let mut weights = Vec::with_capacity(bits.len());
    for token_bits in bits.chunks(args.num_topk) {
        let mut chosen: Vec<i64> = Vec::with_capacity(args.num_topk);
        for (k, b) in token_bits.iter().enumerate() {
            let mut expert = (b % args.num_experts as u64) as i64;
            while chosen.contains(&expert) {
                expert = (expert + 1) % args.num_experts as i64;
            }
            chosen.push(expert);
            weights.push(1.0 / (k + 2) as f32);
        }
        idx.extend(chosen);
    }
    let idx = Matrix::from_vec(args.num_tokens, args.num_topk, idx)?;
    let weights = Matrix::from_vec(args.num_tokens, args.num_topk, weights)?;
    Ok(TopkSelection::new(idx, Some(weights))?)
}

fn avg_std(list: &[f64]) -> (usize, f64, f64) {
    let n = list.len();
    let sum: f64 = list.iter().sum();
    let mean = sum / n as f64;
    let variance: f64 = list.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n as f64;
    (n, mean, variance.sqrt())
}

fn buffer_options(args: &Args) -> BufferOptions {
    match args.mode {
        BenchMode::Normal => {
            let per_token = args.hidden * size_of::<f32>() + 128 + args.num_topk * 12;
            let bytes = args.num_ranks * args.num_tokens * per_token + (1 << 20);
            BufferOptions {
                num_nvl_bytes: bytes.next_multiple_of(128),
                num_rdma_bytes: bytes.next_multiple_of(128),
                ..Default::default()
            }
        }
        BenchMode::LowLatency => BufferOptions {
            num_rdma_bytes: Buffer::get_low_latency_rdma_size_hint(
                args.num_tokens,
                args.hidden,
                args.num_ranks,
                args.num_experts,
            ),
            low_latency_mode: true,
            ..Default::default()
        },
    }
}

/// One dispatch and combine through identity experts.
fn normal_round(
    buffer: &Buffer,
    x: &Matrix<f32>,
    topk: &TopkSelection,
    num_experts: usize,
) -> anyhow::Result<Matrix<f32>> {
    let plan = buffer
        .get_dispatch_layout(
            topk.idx.clone(),
            num_experts,
            PlacementStrategy::Linear,
            None,
            false,
        )?
        .await_completion()?;
    let x = TokenPayload::F32(x.clone());
    let request = DispatchRequest::new(x, plan, Some(topk.clone()));
    let dispatched = buffer.dispatch(request)?.await_completion()?;
    let recv_x = dispatched
        .recv_x
        .as_f32()
        .ok_or_else(|| anyhow!("dispatch of f32 tokens returned another payload"))?;
    let request = CombineRequest::new(
        recv_x.clone(),
        dispatched.handle,
        dispatched.recv_topk_weights,
    );
    Ok(buffer.combine(request)?.await_completion()?.combined_x)
}

fn low_latency_round(
    buffer: &Buffer,
    x: &Matrix<f32>,
    topk: &TopkSelection,
    args: &Args,
) -> anyhow::Result<Matrix<f32>> {
    let mut request = LowLatencyDispatchRequest::new(
        x.clone(),
        topk.idx.clone(),
        args.num_tokens,
        args.num_experts,
    );
    request.use_fp8 = args.fp8 || args.ue8m0;
    request.round_scale = args.ue8m0;
    request.use_ue8m0 = args.ue8m0;
    let dispatched = buffer.low_latency_dispatch(request)?.await_completion()?;
    let expert_x = dispatched.recv_x.iter().map(TokenPayload::to_f32).collect();
    let weights = topk.weights.clone().ok_or_else(|| anyhow!("missing weights"))?;
    let request = LowLatencyCombineRequest::new(
        expert_x,
        topk.idx.clone(),
        weights,
        dispatched.handle.clone(),
    );
    Ok(buffer.low_latency_combine(request)?.await_completion()?.combined_x)
}

/// Largest deviation of `combined` from `x` scaled by the summed weights.
fn check_combined(
    x: &Matrix<f32>,
    topk: &TopkSelection,
    combined: &Matrix<f32>,
) -> anyhow::Result<f32> {
    let weights = topk.weights.as_ref().ok_or_else(|| anyhow!("missing weights"))?;
    let mut max_error = 0f32;
    for token in 0..x.rows() {
        let factor: f32 = weights.row(token).iter().sum();
        for (value, original) in combined.row(token).iter().zip(x.row(token)) {
            max_error = max_error.max((value - original * factor).abs());
        }
    }
    Ok(max_error)
}

fn run_rank(
    args: &Args,
    fabric: &Arc<LoopbackFabric>,
    rank: usize,
) -> anyhow::Result<Vec<f64>> {
    let engine: Arc<dyn RdmaEngine> = Arc::new(fabric.engine(rank));
    let buffer = Buffer::new(engine, &fabric.bootstrap(rank), buffer_options(args))?;
    let x = random_states(rank, args)?;
    let topk = random_selection(rank, args)?;

    let mut elapsed = Vec::with_capacity(args.repeats);
    for iter in 0..args.warmups + args.repeats {
        let start = Instant::now();
        let combined = match args.mode {
            BenchMode::Normal => normal_round(&buffer, &x, &topk, args.num_experts)?,
            BenchMode::LowLatency => low_latency_round(&buffer, &x, &topk, args)?,
        };
        if iter >= args.warmups {
            elapsed.push(start.elapsed().as_secs_f64());
        }
        if iter == 0 && args.verify {
            let max_error = check_combined(&x, &topk, &combined)?;
            // e4m3 keeps three mantissa bits.
            let tolerance = if args.fp8 || args.ue8m0 { 0.2 } else { 1e-4 };
            if max_error > tolerance {
                return Err(anyhow!("rank {rank}: combined output off by {max_error}"));
            }
        }
    }
    Ok(elapsed)
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    logging_lib::init(&args.logging)?;
    if args.repeats == 0 {
        return Err(anyhow!("--repeats must be positive"));
    }
    if args.num_topk > args.num_experts {
        return Err(anyhow!("--num-topk must not exceed --num-experts"));
    }
    info!(
        "Bench {:?}: {} ranks, {} tokens of {} channels, {} experts, top-{}",
        args.mode,
        args.num_ranks,
        args.num_tokens,
        args.hidden,
        args.num_experts,
        args.num_topk
    );

    let fabric = LoopbackFabric::new(args.num_ranks, LinkTopology::default());
    let results: Vec<anyhow::Result<Vec<f64>>> = std::thread::scope(|scope| {
        let workers: Vec<_> = (0..args.num_ranks)
            .map(|rank| {
                let (args, fabric) = (&args, &fabric);
                scope.spawn(move || run_rank(args, fabric, rank))
            })
            .collect();
        workers
            .into_iter()
            .map(|worker| worker.join().unwrap_or_else(|_| Err(anyhow!("rank panicked"))))
            .collect()
    });

    let mut elapsed = Vec::new();
    for result in results {
        elapsed.extend(result?);
    }
    let (n, avg, stddev) = avg_std(&elapsed);
    let bytes = args.num_tokens * args.num_topk * args.hidden * size_of::<f32>() * 2;
    print!("  round trip ({} samples)", n);
    if args.verify {
        print!(" VERIFIED");
    }
    print!(" lat: {:8.3} ± {:7.3} ms", avg * 1e3, stddev * 1e3);
    print!(", bw: {:6.2} GB/s per rank", bytes as f64 / avg / 1e9);
    println!();
    stdout().flush()?;
    Ok(())
}
