use super::Context;
use crate::cli::{CreatePoolArgs, ExportArgs};
use crate::config;
use crate::error::Result;
use gridfree::core::coords::CoordinateSet;
use gridfree::engine::error::EngineError;
use gridfree::workflows::{create_pool, export};
use std::fs::File;
use std::io::Write;
use tracing::info;

pub fn create(ctx: &Context, args: &CreatePoolArgs) -> Result<()> {
    let study = config::build_study_config(args, &ctx.file)?;
    let coordinates = CoordinateSet::read_from_path(&args.coordinates).map_err(EngineError::from)?;
    info!(
        coordinates = coordinates.len(),
        temperature = study.temperature,
        "Creating pool"
    );
    let setup = create_pool::PoolSetup {
        dir: ctx.pool_dir.clone(),
        study,
        coordinates,
        presampling: args.presampling.clone(),
        balance_linears: args.balance_linears,
    };
    let pool = create_pool::run(&setup, &ctx.reporter())?;
    println!(
        "Created pool in {} with root node {}.",
        pool.dir().display(),
        create_pool::ROOT_NAME
    );
    Ok(())
}

pub fn status(ctx: &Context) -> Result<String> {
    let pool = ctx.open_pool()?;
    let mut text = format!("Pool {}\n", pool.dir().display());
    match pool.alpha() {
        Some(alpha) => text.push_str(&format!("  alpha: {alpha:.6}\n")),
        None => text.push_str("  alpha: not set\n"),
    }
    text.push_str(&format!("  nodes: {}\n", pool.len()));
    for (state, count) in export::state_counts(&pool) {
        text.push_str(&format!("  {:<22}{}\n", state.as_str(), count));
    }
    let locked: Vec<&str> = pool
        .iter()
        .filter(|(_, node)| node.is_locked())
        .map(|(_, node)| node.name())
        .collect();
    if !locked.is_empty() {
        text.push_str(&format!("  locked: {}\n", locked.join(", ")));
    }
    Ok(text)
}

pub fn export_table(ctx: &Context, args: &ExportArgs) -> Result<()> {
    let pool = ctx.open_pool()?;
    match &args.output {
        Some(path) => {
            export::write_csv(&pool, File::create(path)?)?;
            println!("Wrote {} nodes to {}.", pool.len(), path.display());
        }
        None => {
            let stdout = std::io::stdout();
            let mut handle = stdout.lock();
            export::write_csv(&pool, &mut handle)?;
            handle.flush()?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::tests::context_with_inputs;
    use crate::error::CliError;

    #[test]
    fn created_pool_reports_its_root() {
        let (_dir, ctx, args) = context_with_inputs(&[0.1, 0.2, 0.3]);
        create(&ctx, &args).unwrap();

        let text = status(&ctx).unwrap();
        assert!(text.contains("alpha: not set"));
        assert!(text.contains("nodes: 1"));
        assert!(text.contains("refined"));
        assert!(!text.contains("locked"));
    }

    #[test]
    fn second_creation_fails() {
        let (_dir, ctx, args) = context_with_inputs(&[0.1, 0.2]);
        create(&ctx, &args).unwrap();
        assert!(matches!(create(&ctx, &args), Err(CliError::Gridfree(_))));
    }

    #[test]
    fn export_writes_one_row_per_node() {
        let (dir, ctx, args) = context_with_inputs(&[0.1, 0.2]);
        create(&ctx, &args).unwrap();
        let output = dir.path().join("nodes.csv");
        export_table(
            &ctx,
            &ExportArgs {
                output: Some(output.clone()),
            },
        )
        .unwrap();
        let text = std::fs::read_to_string(output).unwrap();
        assert_eq!(text.lines().count(), 2);
        assert!(text.lines().nth(1).unwrap().starts_with("node0000,refined"));
    }

    #[test]
    fn status_of_missing_pool_is_an_error() {
        let (_dir, ctx, _args) = context_with_inputs(&[0.1]);
        assert!(status(&ctx).is_err());
    }
}
