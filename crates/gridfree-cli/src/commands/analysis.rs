use super::Context;
use crate::cli::{AnalyzeArgs, ReweightArgs};
use crate::config;
use crate::error::Result;
use gridfree::engine::config::ReweightMethod;
use gridfree::workflows::reweight::CsvEnergySource;
use gridfree::workflows::{analyze, reweight};

pub fn reweight(ctx: &Context, args: &ReweightArgs) -> Result<()> {
    let mut pool = ctx.open_pool()?;
    let (options, column) = config::build_reweight_options(args, &ctx.file)?;
    let source = CsvEnergySource { column };
    let summary = reweight::run(
        &mut pool,
        &source,
        &options,
        config::lock_guard(&ctx.file)?,
        &ctx.reporter(),
    )?;
    match summary.method {
        ReweightMethod::Direct => {
            println!("Direct weights (energy region ±{:.4} kJ/mol):", summary.region)
        }
        ReweightMethod::Entropy => {
            println!("Entropy weights (neighbour region {:.4}):", summary.region)
        }
    }
    for (name, weight) in summary.nodes.iter().zip(&summary.weights) {
        println!("  {name}  {weight:.6e}");
    }
    Ok(())
}

pub fn analyze(ctx: &Context, args: &AnalyzeArgs) -> Result<()> {
    let mut pool = ctx.open_pool()?;
    let options = config::build_analysis_options(args, &ctx.file)?;
    let result = analyze::run(
        &mut pool,
        &options,
        config::lock_guard(&ctx.file)?,
        &ctx.reporter(),
    )?;
    println!(
        "Clustered {} node(s) into {} metastable set(s). Results written to {}.",
        result.nodes.len(),
        result.pcca.n_clusters,
        pool.analysis_dir().display()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::pool;
    use crate::commands::tests::context_with_inputs;

    #[test]
    fn reweighting_an_unsampled_pool_fails() {
        let (_dir, ctx, args) = context_with_inputs(&[0.0, 1.0]);
        pool::create(&ctx, &args).unwrap();
        assert!(reweight(&ctx, &ReweightArgs::default()).is_err());
        assert!(analyze(&ctx, &AnalyzeArgs::default()).is_err());
    }
}
