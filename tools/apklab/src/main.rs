use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod commands;
mod config;
mod output;

/// Decompile, patch, rebuild and sign Android packages
#[derive(Parser)]
#[command(name = "apklab")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Config file (default: ./.apklabconfig, then ~/.apklabconfig)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Decompile a package (local file or http(s) URL) into an archive
    Decompile {
        /// Package path or URL
        input: String,

        /// Pipeline option (repeatable): decompile_java, quark_analysis, mitm_patch, deobf, ...
        #[arg(short = 'O', long = "option")]
        options: Vec<String>,

        /// Print the job record as JSON
        #[arg(long)]
        json: bool,
    },

    /// Rebuild a decoded project archive and sign it
    Rebuild {
        /// Project archive (.zip or .tar.gz of a decoded project)
        project: PathBuf,

        /// Keystore file
        #[arg(long)]
        keystore: PathBuf,

        /// Key alias inside the keystore
        #[arg(long)]
        alias: String,

        /// File holding the keystore password (default: $APKLAB_KS_PASS)
        #[arg(long)]
        ks_pass_file: Option<PathBuf>,

        /// File holding the key password (default: $APKLAB_KEY_PASS, then the keystore password)
        #[arg(long)]
        key_pass_file: Option<PathBuf>,

        /// Build option (repeatable): no_crunch, use_aapt2, debuggable
        #[arg(short = 'O', long = "option")]
        options: Vec<String>,

        /// Print the job record as JSON
        #[arg(long)]
        json: bool,
    },

    /// Decompile several packages concurrently
    Batch {
        /// Package paths or URLs
        #[arg(required = true)]
        inputs: Vec<String>,

        /// Worker count (default: workspace.max_concurrent)
        #[arg(short, long)]
        jobs: Option<usize>,

        /// Pipeline option applied to every job (repeatable)
        #[arg(short = 'O', long = "option")]
        options: Vec<String>,

        /// Print job records as JSON
        #[arg(long)]
        json: bool,
    },

    /// Apply the interception patch to an already decoded project directory
    Patch {
        /// Decoded project directory (contains AndroidManifest.xml)
        dir: PathBuf,

        /// Also mark the application debuggable
        #[arg(long)]
        debuggable: bool,

        /// Do not permit cleartext traffic in the injected config
        #[arg(long)]
        no_cleartext: bool,
    },

    /// Check that java and every configured tool can be found
    Doctor {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Remove stored artifacts
    Clean {
        /// Job IDs whose artifacts should be removed
        #[arg(required_unless_present = "all")]
        job_ids: Vec<String>,

        /// Remove every stored artifact
        #[arg(long, conflicts_with = "job_ids")]
        all: bool,
    },

    /// Write a sample configuration file
    InitConfig {
        /// Output path
        #[arg(default_value = config::CONFIG_FILE)]
        path: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let config_path = cli.config.as_deref();

    match cli.command {
        Commands::Decompile { input, options, json } => {
            commands::decompile::run(config_path, &input, &options, json)?;
        }
        Commands::Rebuild { project, keystore, alias, ks_pass_file, key_pass_file, options, json } => {
            let keys = commands::rebuild::KeyArgs {
                keystore,
                alias,
                ks_pass_file,
                key_pass_file,
            };
            commands::rebuild::run(config_path, &project, keys, &options, json)?;
        }
        Commands::Batch { inputs, jobs, options, json } => {
            commands::batch::run(config_path, &inputs, jobs, &options, json)?;
        }
        Commands::Patch { dir, debuggable, no_cleartext } => {
            commands::patch::run(&dir, debuggable, !no_cleartext)?;
        }
        Commands::Doctor { json } => {
            commands::doctor::run(config_path, json)?;
        }
        Commands::Clean { job_ids, all } => {
            commands::clean::run(config_path, &job_ids, all)?;
        }
        Commands::InitConfig { path, force } => {
            commands::init_config::run(&path, force)?;
        }
    }

    Ok(())
}
