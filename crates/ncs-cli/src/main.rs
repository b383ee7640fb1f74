//! ncsdc — NCS bytecode decompiler for the KotOR games
//!
//! Subcommands: decompile NCS files to NSS source, dump file info and pcode
//! listings, and inspect the loaded action table.

mod output;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use ncs_actions::{ActionsData, Game};
use ncs_decompiler::{Config, FileDecompiler, Status};
use output::{resolve_color_choice, Reporter};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "ncsdc")]
#[command(about = "NCS bytecode decompiler for KotOR and TSL")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Color output (auto, always, never)
    #[arg(long, global = true, default_value = "auto")]
    color: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Decompile NCS files to NSS source
    #[command(alias = "d")]
    Decompile {
        /// Files or glob patterns to decompile
        files: Vec<String>,
        /// Game whose action table applies (k1, k2, tsl)
        #[arg(short, long)]
        game: Option<String>,
        /// Output directory (defaults to each input's directory)
        #[arg(short, long)]
        out_dir: Option<PathBuf>,
        /// Emit switch statements even for single equality tests
        #[arg(long)]
        prefer_switches: bool,
        /// Emit if/else chains instead of single-arm switches
        #[arg(long, conflicts_with = "prefer_switches")]
        no_switches: bool,
        /// Treat unresolved subroutine signatures as errors
        #[arg(long)]
        strict: bool,
        /// Disable output repair passes
        #[arg(long)]
        no_repairs: bool,
        /// Upper bound on repair passes
        #[arg(long)]
        max_repair_passes: Option<u32>,
        /// External compiler used for the round-trip comparison
        #[arg(long)]
        compiler: Option<PathBuf>,
        /// Explicit action table file
        #[arg(long)]
        actions: Option<PathBuf>,
        /// Print per-pass diagnostics
        #[arg(short, long)]
        verbose: bool,
    },

    /// Show header, subroutine prototypes and the pcode listing
    Info {
        /// NCS file to inspect
        file: PathBuf,
        /// Game whose action table applies (k1, k2, tsl)
        #[arg(short, long)]
        game: Option<String>,
        /// Explicit action table file
        #[arg(long)]
        actions: Option<PathBuf>,
    },

    /// Dump the loaded action table
    Actions {
        /// Game whose action table applies (k1, k2, tsl)
        #[arg(short, long)]
        game: Option<String>,
        /// Explicit action table file
        #[arg(long)]
        actions: Option<PathBuf>,
        /// Only actions whose name matches this pattern
        #[arg(long)]
        grep: Option<String>,
    },
}

/// `ncsdc.toml` next to the working directory supplies defaults; flags win.
fn load_config() -> Result<Config> {
    let path = Path::new("ncsdc.toml");
    if !path.is_file() {
        return Ok(Config::default());
    }
    let text = std::fs::read_to_string(path).context("reading ncsdc.toml")?;
    toml::from_str(&text).context("parsing ncsdc.toml")
}

fn parse_game(flag: Option<&str>, config: &Config) -> Result<Game> {
    match flag {
        Some(text) => {
            Game::from_str_loose(text).with_context(|| format!("unknown game \"{text}\""))
        }
        None => Ok(config.game),
    }
}

fn load_actions(
    game: Game,
    override_path: Option<&Path>,
    config: &Config,
) -> Result<ActionsData, ncs_actions::ActionsError> {
    ActionsData::locate(
        game,
        override_path.or(config.actions_path.as_deref()),
        &config.actions_dirs,
    )
}

fn main() {
    let cli = Cli::parse();
    let code = match run(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            2
        }
    };
    std::process::exit(code);
}

fn run(cli: Cli) -> Result<i32> {
    let choice = resolve_color_choice(Some(cli.color.as_str()));
    let mut config = load_config()?;

    match cli.command {
        Commands::Decompile {
            files,
            game,
            out_dir,
            prefer_switches,
            no_switches,
            strict,
            no_repairs,
            max_repair_passes,
            compiler,
            actions,
            verbose,
        } => {
            if files.is_empty() {
                bail!("no input files");
            }
            config.game = parse_game(game.as_deref(), &config)?;
            if prefer_switches {
                config.prefer_switches = true;
            }
            if no_switches {
                config.prefer_switches = false;
            }
            if strict {
                config.strict_signatures = true;
            }
            if no_repairs {
                config.repairs.enabled = false;
            }
            if let Some(max) = max_repair_passes {
                config.repairs.max_passes = max;
            }
            if compiler.is_some() {
                config.compiler_path = compiler;
            }

            let table = load_actions(config.game, actions.as_deref(), &config);
            let decompiler = FileDecompiler::new(config, table);
            let mut reporter = Reporter::new(choice, verbose);

            let inputs = expand_globs(&files)?;
            if inputs.is_empty() {
                bail!("no files matched");
            }

            let (mut success, mut partial, mut failed) = (0usize, 0usize, 0usize);
            let mut worst = 0;
            for input in &inputs {
                let bytes = match std::fs::read(input) {
                    Ok(bytes) => bytes,
                    Err(err) => {
                        reporter.error(&format!("{}: {err}", input.display()));
                        failed += 1;
                        worst = worst.max(2);
                        continue;
                    }
                };
                let outcome = decompiler.decompile(&bytes);
                let out_path = output_path(input, out_dir.as_deref());
                std::fs::write(&out_path, &outcome.source)
                    .with_context(|| format!("writing {}", out_path.display()))?;

                reporter.file_result(
                    outcome.status,
                    &input.display().to_string(),
                    &out_path.display().to_string(),
                );
                reporter.diagnostics(&outcome.diagnostics);

                match outcome.status {
                    Status::Success => success += 1,
                    Status::PartialCompare | Status::PartialCompile => {
                        partial += 1;
                        worst = worst.max(1);
                    }
                    Status::Failure => {
                        failed += 1;
                        worst = worst.max(2);
                    }
                }
            }
            reporter.summary(inputs.len(), success, partial, failed);
            Ok(worst)
        }

        Commands::Info {
            file,
            game,
            actions,
        } => {
            config.game = parse_game(game.as_deref(), &config)?;
            let table = load_actions(config.game, actions.as_deref(), &config);
            let decompiler = FileDecompiler::new(config, table);
            let bytes =
                std::fs::read(&file).with_context(|| format!("reading {}", file.display()))?;
            let info = decompiler.info(&bytes)?;
            print!("{info}");
            Ok(0)
        }

        Commands::Actions {
            game,
            actions,
            grep,
        } => {
            config.game = parse_game(game.as_deref(), &config)?;
            let table = load_actions(config.game, actions.as_deref(), &config)
                .map_err(|err| anyhow::anyhow!("{err}"))?;
            let pattern = grep
                .map(|p| regex::Regex::new(&p).context("invalid --grep pattern"))
                .transpose()?;
            for action in table.iter() {
                if let Some(pattern) = &pattern {
                    if !pattern.is_match(&action.name) {
                        continue;
                    }
                }
                let params: Vec<String> = action
                    .params
                    .iter()
                    .map(|p| match &p.default {
                        Some(default) => format!("{} {} = {default}", p.ty, p.name),
                        None => format!("{} {}", p.ty, p.name),
                    })
                    .collect();
                println!(
                    "{:>4}  {} {}({})",
                    action.id,
                    action.returns,
                    action.name,
                    params.join(", ")
                );
            }
            Ok(0)
        }
    }
}

/// Expand glob patterns; plain paths pass through untouched
fn expand_globs(patterns: &[String]) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for pattern in patterns {
        let path = Path::new(pattern);
        if path.is_file() {
            files.push(path.to_path_buf());
            continue;
        }
        let matched =
            glob::glob(pattern).with_context(|| format!("bad glob pattern \"{pattern}\""))?;
        for entry in matched {
            let entry = entry?;
            if entry.is_file() {
                files.push(entry);
            }
        }
    }
    files.sort();
    files.dedup();
    Ok(files)
}

/// `<out_dir or input dir>/<stem>.nss`
fn output_path(input: &Path, out_dir: Option<&Path>) -> PathBuf {
    let stem = input.file_stem().unwrap_or_default();
    let mut name = stem.to_os_string();
    name.push(".nss");
    match out_dir {
        Some(dir) => dir.join(name),
        None => input.with_file_name(name),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_path() {
        assert_eq!(
            output_path(Path::new("scripts/a_enter.ncs"), None),
            PathBuf::from("scripts/a_enter.nss")
        );
        assert_eq!(
            output_path(Path::new("scripts/a_enter.ncs"), Some(Path::new("out"))),
            PathBuf::from("out/a_enter.nss")
        );
    }
}
