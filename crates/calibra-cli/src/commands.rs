//! Subcommand implementations.

use std::fs;
use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};
use calibra_core::{
    AdapterConfig, AdapterRegistry, Block, ImageQuestion, ModelAdapter, NormSet,
    PreprocessPolicy, Subset,
};
use serde::Serialize;
use tracing::info;

use crate::{ModelArgs, OutputFormat};

/// Configuration file (or defaults), then `CALIBRA_*` variables, then flags.
pub fn adapter_config(file: Option<&Path>, args: &ModelArgs) -> Result<AdapterConfig> {
    let mut config = match file {
        Some(path) => AdapterConfig::from_file(path)?,
        None => AdapterConfig::default(),
    }
    .apply_env_overrides();

    if let Some(model_type) = &args.model_type {
        config.model_type = Some(model_type.clone());
    }
    if let Some(path) = &args.model_path {
        config.model_path = path.clone();
    }
    if let Some(dtype) = &args.dtype {
        config.torch_dtype = dtype.clone();
    }
    if let Some(device) = &args.device {
        config.device_map = Some(device.clone());
    }
    Ok(config)
}

#[derive(Serialize)]
struct EntryReport<'a> {
    name: &'a str,
    model_types: &'a [&'a str],
    modality: String,
}

pub fn list(format: OutputFormat) -> Result<()> {
    let registry = AdapterRegistry::global()?;
    let entries: Vec<EntryReport> = registry
        .entries()
        .into_iter()
        .map(|entry| EntryReport {
            name: entry.name,
            model_types: entry.model_types,
            modality: entry.modality.to_string(),
        })
        .collect();

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&entries)?),
        OutputFormat::Table => {
            println!("{:<12} {:<16} MODEL TYPES", "NAME", "MODALITY");
            for entry in &entries {
                println!(
                    "{:<12} {:<16} {}",
                    entry.name,
                    entry.modality,
                    entry.model_types.join(", ")
                );
            }
        }
    }
    Ok(())
}

#[derive(Serialize)]
struct BlockReport {
    index: usize,
    kind: calibra_core::BlockKind,
    norms: NormSet,
    subsets: Vec<Subset>,
}

fn block_report(adapter: &dyn ModelAdapter, block: &Block) -> Result<BlockReport> {
    Ok(BlockReport {
        index: block.index(),
        kind: block.kind(),
        norms: adapter.layernorms_in_block(block)?,
        subsets: adapter.subsets_in_block(block)?,
    })
}

pub fn inspect(config: &AdapterConfig, block: Option<usize>, format: OutputFormat) -> Result<()> {
    let adapter = AdapterRegistry::global()?.build(config)?;
    let blocks: Vec<&Block> = match block {
        Some(index) => vec![adapter.block(index)?],
        None => adapter.blocks().iter().collect(),
    };
    let reports = blocks
        .into_iter()
        .map(|block| block_report(adapter.as_ref(), block))
        .collect::<Result<Vec<_>>>()?;

    match format {
        OutputFormat::Json => {
            let output = serde_json::json!({
                "architecture": adapter.architecture(),
                "dtype": format!("{:?}", adapter.dtype()),
                "num_blocks": adapter.blocks().len(),
                "needs_mask_update": adapter.needs_mask_update(),
                "embed_layers": adapter.embed_layers(),
                "head_layers": adapter.head_layers(),
                "pre_head_layernorm_layers": adapter.pre_head_layernorm_layers(),
                "blocks": reports,
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            println!(
                "{} ({} blocks, {:?})",
                adapter.architecture(),
                adapter.blocks().len(),
                adapter.dtype()
            );
            for report in &reports {
                print_block(report);
            }
        }
    }
    Ok(())
}

fn print_block(report: &BlockReport) {
    println!();
    println!("block {} [{:?}]", report.index, report.kind);
    let norms: Vec<String> = report.norms.values().map(ToString::to_string).collect();
    println!("  norms: {}", norms.join(", "));
    for (i, subset) in report.subsets.iter().enumerate() {
        let layers: Vec<&str> = subset.layer_names().collect();
        let prev: Vec<String> = subset.prev_op.iter().map(ToString::to_string).collect();
        let mut flags = Vec::new();
        if subset.has_kwargs {
            flags.push("kwargs");
        }
        if subset.sub_keys.is_some() {
            flags.push("sub_keys");
        }
        if subset.is_mlp {
            flags.push("mlp");
        }
        println!("  subset {i}: {}", layers.join(", "));
        println!(
            "    prev_op: [{}]  inspect: {}  {}",
            prev.join(", "),
            subset.inspect,
            flags.join(" ")
        );
    }
}

#[derive(Serialize)]
struct SampleReport {
    prompt: String,
    num_tokens: usize,
    tensors: Vec<(String, Vec<usize>)>,
}

fn read_pairs(path: &Path) -> Result<Vec<ImageQuestion>> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("Failed to read pairs file {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("Invalid pairs file {}", path.display()))
}

pub fn preprocess(
    config: &AdapterConfig,
    pairs_path: &Path,
    skip_invalid: bool,
    format: OutputFormat,
) -> Result<()> {
    let pairs = read_pairs(pairs_path)?;
    if pairs.is_empty() {
        bail!("{} contains no calibration pairs", pairs_path.display());
    }

    let adapter = AdapterRegistry::global()?.build(config)?;
    let multimodal = adapter.as_multimodal().ok_or_else(|| {
        anyhow!(
            "{} does not take images; preprocessing needs a vision-language model",
            adapter.architecture()
        )
    })?;

    let policy = if skip_invalid {
        PreprocessPolicy::Skip
    } else {
        config.preprocess_policy
    };
    let samples = multimodal.preprocess(&pairs, policy)?;
    info!("Built {} calibration samples", samples.len());

    let reports: Vec<SampleReport> = samples
        .iter()
        .map(|sample| SampleReport {
            prompt: sample.prompt.clone(),
            num_tokens: sample.num_tokens(),
            tensors: sample.shapes(),
        })
        .collect();

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&reports)?),
        OutputFormat::Table => {
            for (i, report) in reports.iter().enumerate() {
                println!("sample {i}: {} tokens", report.num_tokens);
                for (name, shape) in &report.tensors {
                    println!("  {name:<22} {shape:?}");
                }
            }
        }
    }
    Ok(())
}
