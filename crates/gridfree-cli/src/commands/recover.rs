use super::Context;
use crate::cli::RecoverArgs;
use crate::config;
use crate::error::Result;
use gridfree::engine::lock::ProcessTableLiveness;
use gridfree::workflows::recover;

pub fn run(ctx: &Context, args: &RecoverArgs) -> Result<()> {
    let mut pool = ctx.open_pool()?;
    if !args.failed_only {
        let freed = recover::remove_stale_locks(&pool, &ProcessTableLiveness::default())?;
        println!("Removed {} stale lock(s).", freed.len());
    }
    if !args.locks_only {
        let recovered = recover::recover_failed(&mut pool, config::lock_guard(&ctx.file)?, &ctx.reporter())?;
        println!("Sent {} failed node(s) back to sampling.", recovered.len());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::pool;
    use crate::commands::tests::context_with_inputs;

    #[test]
    fn own_locks_are_not_stale() {
        let (_dir, ctx, args) = context_with_inputs(&[0.0, 1.0]);
        pool::create(&ctx, &args).unwrap();
        let pool = ctx.open_pool().unwrap();
        let root = pool.root().unwrap();
        assert!(pool.node(root).lock(std::time::Duration::ZERO).unwrap());

        run(
            &ctx,
            &RecoverArgs {
                locks_only: true,
                failed_only: false,
            },
        )
        .unwrap();
        assert!(pool.node(root).is_locked());
        pool.node(root).unlock().unwrap();
    }
}
