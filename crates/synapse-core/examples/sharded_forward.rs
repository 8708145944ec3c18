//! Two-rank tensor-parallel forward pass, in process.
//!
//! Builds one set of logical weights, evaluates the stack densely and then
//! sharded across two thread-ranks, and reports the divergence (which should
//! be at floating-point noise level).
//!
//! Run with:
//! ```bash
//! cargo run -p synapse-core --example sharded_forward
//! ```

use candle_core::{Device, Tensor};
use std::sync::Arc;
use std::time::Instant;
use synapse_core::comm::{SingleProcess, ThreadGroup};
use synapse_core::model::{Gpt, GptConfig, GptWeights};

fn main() -> anyhow::Result<()> {
    let config = GptConfig {
        depth: 4,
        dim: 256,
        num_heads: 8,
        ..Default::default()
    };
    let device = Device::Cpu;

    println!("Sharded Forward Example");
    println!("=======================\n");
    println!(
        "Model: depth={} dim={} heads={} (intermediate {})",
        config.depth,
        config.dim,
        config.num_heads,
        config.intermediate_size()
    );

    let weights = GptWeights::random(&config, 42, &device)?;
    let x = Tensor::randn(0.0f32, 1.0, &[1, 32, config.dim], &device)?;

    // Dense baseline on a single rank.
    let dense = Gpt::from_full(&config, &weights, Arc::new(SingleProcess::new()))?;
    let start = Instant::now();
    let expected = dense.forward(&x, false)?;
    println!("\nDense forward:   {:?}", start.elapsed());

    // The same computation split across two in-process ranks.
    let world_size = 2;
    let handles = ThreadGroup::new(world_size)?;
    let start = Instant::now();
    let outputs: Vec<Tensor> = std::thread::scope(|s| {
        let joins: Vec<_> = handles
            .into_iter()
            .map(|h| {
                let (config, weights, x) = (config.clone(), weights.clone(), x.clone());
                s.spawn(move || -> anyhow::Result<Tensor> {
                    let gpt = Gpt::from_full(&config, &weights, Arc::new(h))?;
                    Ok(gpt.forward(&x, false)?)
                })
            })
            .collect();
        joins
            .into_iter()
            .map(|j| j.join().expect("rank thread panicked"))
            .collect::<anyhow::Result<Vec<_>>>()
    })?;
    println!("Sharded forward: {:?} ({} ranks)", start.elapsed(), world_size);

    let expected_v: Vec<f32> = expected.flatten_all()?.to_vec1()?;
    for (rank, out) in outputs.iter().enumerate() {
        let got: Vec<f32> = out.flatten_all()?.to_vec1()?;
        let max_diff = expected_v
            .iter()
            .zip(&got)
            .map(|(a, b)| (a - b).abs())
            .fold(0.0f32, f32::max);
        println!("rank {rank}: max divergence from dense = {max_diff:.3e}");
    }

    Ok(())
}
