use super::Context;
use crate::cli::{MdrunArgs, RefineArgs};
use crate::config;
use crate::engine::ShellEngine;
use crate::error::Result;
use gridfree::workflows::{refine, sampling};
use tracing::warn;

pub fn mdrun(ctx: &Context, args: &MdrunArgs) -> Result<()> {
    let mut pool = ctx.open_pool()?;
    let engine = ShellEngine::new(config::build_md_commands(&ctx.file)?);
    let options = config::build_worker_options(args, &ctx.file)?;
    let refine_options = config::build_refine_options(&RefineArgs::default(), &ctx.file)?;

    let summary = sampling::run(&mut pool, &engine, &options, &refine_options, &ctx.reporter())?;
    println!(
        "Worker finished: {} converged, {} not converged, {} ready, {} extended, {} failed, {} refinement round(s).",
        summary.converged.len(),
        summary.not_converged.len(),
        summary.ready.len(),
        summary.extended.len(),
        summary.failed.len(),
        summary.refinements
    );
    if !summary.failed.is_empty() {
        warn!(nodes = %summary.failed.join(", "), "Some nodes failed; see 'gridfree recover'");
    }
    Ok(())
}

pub fn refine(ctx: &Context, args: &RefineArgs) -> Result<()> {
    let mut pool = ctx.open_pool()?;
    let engine = ShellEngine::new(config::build_md_commands(&ctx.file)?);
    let options = config::build_refine_options(args, &ctx.file)?;
    let summary = refine::run(
        &mut pool,
        &engine,
        &options,
        config::lock_guard(&ctx.file)?,
        &ctx.reporter(),
    )?;
    println!(
        "Refined {} node(s) into {} new node(s), extended {} node(s).",
        summary.refined.len(),
        summary.created,
        summary.extended.len()
    );
    Ok(())
}
