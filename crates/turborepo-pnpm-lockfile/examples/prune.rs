use std::{env, fs, process::ExitCode};

use turborepo_pnpm_lockfile::pnpm_subgraph;

// Usage: prune <pnpm-lock.yaml> [workspace...]
fn main() -> ExitCode {
    let mut args = env::args().skip(1);
    let Some(path) = args.next() else {
        eprintln!("usage: prune <pnpm-lock.yaml> [workspace...]");
        return ExitCode::FAILURE;
    };
    let workspaces = args.collect::<Vec<_>>();

    let contents = match fs::read(&path) {
        Ok(contents) => contents,
        Err(e) => {
            eprintln!("unable to read {path}: {e}");
            return ExitCode::FAILURE;
        }
    };
    match pnpm_subgraph(&contents, &workspaces, &[]) {
        Ok(pruned) => {
            print!("{}", String::from_utf8_lossy(&pruned));
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("{e}");
            ExitCode::FAILURE
        }
    }
}
