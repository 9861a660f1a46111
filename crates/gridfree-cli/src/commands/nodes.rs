use super::Context;
use crate::cli::{CreateNodesArgs, RemoveArgs};
use crate::config;
use crate::engine::ShellEngine;
use crate::error::Result;
use gridfree::workflows::{discretize, prepare, recover};
use tracing::info;

pub fn create(ctx: &Context, args: &CreateNodesArgs) -> Result<()> {
    let mut pool = ctx.open_pool()?;
    let node_config = config::build_node_creation_config(args, &ctx.file, pool.alpha())?;
    info!(
        parent = %node_config.parent,
        nodes = node_config.num_nodes,
        seed_method = ?node_config.seed_method,
        "Creating nodes"
    );
    let created = discretize::run(&mut pool, &node_config, &ctx.reporter())?;
    let names: Vec<&str> = created.iter().map(|&id| pool.node(id).name()).collect();
    println!(
        "Created {} node(s): {} (alpha = {:.6}).",
        names.len(),
        names.join(", "),
        pool.alpha().unwrap_or(f64::NAN)
    );
    Ok(())
}

pub fn prepare(ctx: &Context) -> Result<()> {
    let mut pool = ctx.open_pool()?;
    let engine = ShellEngine::new(config::build_md_commands(&ctx.file)?);
    let summary = prepare::run(&mut pool, &engine, config::lock_guard(&ctx.file)?, &ctx.reporter())?;
    println!(
        "Set up {} node(s), preprocessed {} node(s).",
        summary.set_up.len(),
        summary.preprocessed.len()
    );
    Ok(())
}

pub fn remove(ctx: &Context, args: &RemoveArgs) -> Result<()> {
    let mut pool = ctx.open_pool()?;
    recover::remove_nodes(&mut pool, &args.nodes, config::lock_guard(&ctx.file)?)?;
    println!("Removed {} node(s).", args.nodes.len());
    Ok(())
}
