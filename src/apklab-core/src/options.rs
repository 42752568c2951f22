//! Option set parsing and validation.
//!
//! Options arrive as plain names (checkbox values in a form, `--option`
//! flags on the CLI). They are parsed and cross-checked here, before any
//! workspace is allocated or any process is spawned, so an impossible
//! combination never fails halfway through a pipeline.

use serde::Serialize;

use crate::error::{Error, Result};
use crate::job::JobKind;

/// Option names accepted for decompile jobs.
pub const DECOMPILE_OPTIONS: &[&str] = &[
    "decompile_java",
    "quark_analysis",
    "mitm_patch",
    "deobf",
    "show_bad_code",
    "no_src",
    "no_res",
    "force_manifest",
    "no_assets",
    "only_main_classes",
    "no_debug_info",
];

/// Option names accepted for rebuild jobs.
pub const REBUILD_OPTIONS: &[&str] = &["no_crunch", "use_aapt2", "debuggable"];

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DecompileOptions {
    /// Render high-level Java source with jadx
    pub render_source: bool,
    /// Run the quark security scanner
    pub scan: bool,
    /// Patch the manifest for traffic interception
    pub mitm_patch: bool,
    /// jadx: --deobf
    pub deobfuscate: bool,
    /// jadx: --show-bad-code
    pub show_bad_code: bool,
    /// apktool: -s
    pub no_src: bool,
    /// apktool: -r
    pub no_res: bool,
    /// apktool: --force-manifest
    pub force_manifest: bool,
    /// apktool: --no-assets
    pub no_assets: bool,
    /// apktool: --only-main-classes
    pub only_main_classes: bool,
    /// apktool: -b
    pub no_debug_info: bool,
}

impl DecompileOptions {
    /// Parse and validate option names.
    pub fn parse<S: AsRef<str>>(names: &[S]) -> Result<Self> {
        let mut opts = Self::default();
        for name in names {
            let name = name.as_ref().trim();
            let flag = match name {
                "decompile_java" => &mut opts.render_source,
                "quark_analysis" => &mut opts.scan,
                "mitm_patch" => &mut opts.mitm_patch,
                "deobf" => &mut opts.deobfuscate,
                "show_bad_code" => &mut opts.show_bad_code,
                "no_src" => &mut opts.no_src,
                "no_res" => &mut opts.no_res,
                "force_manifest" => &mut opts.force_manifest,
                "no_assets" => &mut opts.no_assets,
                "only_main_classes" => &mut opts.only_main_classes,
                "no_debug_info" => &mut opts.no_debug_info,
                other if REBUILD_OPTIONS.contains(&other) => {
                    return Err(Error::InvalidOptions(format!(
                        "'{}' is a rebuild option and cannot be used when decompiling",
                        other
                    )));
                }
                other => {
                    return Err(Error::InvalidOptions(format!(
                        "unknown decompile option '{}' (expected one of: {})",
                        other,
                        DECOMPILE_OPTIONS.join(", ")
                    )));
                }
            };
            *flag = true;
        }
        opts.validate()?;
        Ok(opts)
    }

    /// Reject combinations that cannot produce a meaningful result.
    pub fn validate(&self) -> Result<()> {
        if (self.deobfuscate || self.show_bad_code) && !self.render_source {
            return Err(Error::InvalidOptions(
                "'deobf' and 'show_bad_code' only apply together with 'decompile_java'".to_string(),
            ));
        }
        if self.mitm_patch && self.no_res {
            return Err(Error::InvalidOptions(
                "'mitm_patch' needs decoded resources and cannot be combined with 'no_res'".to_string(),
            ));
        }
        if self.only_main_classes && self.no_src {
            return Err(Error::InvalidOptions(
                "'only_main_classes' has no effect when 'no_src' skips smali output".to_string(),
            ));
        }
        Ok(())
    }

    /// Extra apktool decode flags.
    pub fn apktool_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if self.no_src {
            args.push("-s");
        }
        if self.no_res {
            args.push("-r");
        }
        if self.force_manifest {
            args.push("--force-manifest");
        }
        if self.no_assets {
            args.push("--no-assets");
        }
        if self.only_main_classes {
            args.push("--only-main-classes");
        }
        if self.no_debug_info {
            args.push("-b");
        }
        args.into_iter().map(String::from).collect()
    }

    /// Extra jadx flags.
    pub fn jadx_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if self.deobfuscate {
            args.push("--deobf".to_string());
        }
        if self.show_bad_code {
            args.push("--show-bad-code".to_string());
        }
        args
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RebuildOptions {
    /// apktool: --no-crunch
    pub no_crunch: bool,
    /// apktool: --use-aapt2
    pub use_aapt2: bool,
    /// apktool: -d
    pub debuggable: bool,
}

impl RebuildOptions {
    pub fn parse<S: AsRef<str>>(names: &[S]) -> Result<Self> {
        let mut opts = Self::default();
        for name in names {
            match name.as_ref().trim() {
                "no_crunch" => opts.no_crunch = true,
                "use_aapt2" => opts.use_aapt2 = true,
                "debuggable" => opts.debuggable = true,
                other if DECOMPILE_OPTIONS.contains(&other) => {
                    return Err(Error::InvalidOptions(format!(
                        "'{}' is a decompile option and cannot be used when rebuilding",
                        other
                    )));
                }
                other => {
                    return Err(Error::InvalidOptions(format!(
                        "unknown rebuild option '{}' (expected one of: {})",
                        other,
                        REBUILD_OPTIONS.join(", ")
                    )));
                }
            }
        }
        Ok(opts)
    }

    /// Extra apktool build flags.
    pub fn apktool_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if self.no_crunch {
            args.push("--no-crunch".to_string());
        }
        if self.use_aapt2 {
            args.push("--use-aapt2".to_string());
        }
        if self.debuggable {
            args.push("-d".to_string());
        }
        args
    }
}

/// Validated options of one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum OptionSet {
    Decompile(DecompileOptions),
    Rebuild(RebuildOptions),
}

impl OptionSet {
    /// Parse option names for the given job kind.
    pub fn parse<S: AsRef<str>>(kind: JobKind, names: &[S]) -> Result<Self> {
        match kind {
            JobKind::Decompile => DecompileOptions::parse(names).map(OptionSet::Decompile),
            JobKind::Rebuild => RebuildOptions::parse(names).map(OptionSet::Rebuild),
        }
    }

    pub fn kind(&self) -> JobKind {
        match self {
            OptionSet::Decompile(_) => JobKind::Decompile,
            OptionSet::Rebuild(_) => JobKind::Rebuild,
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            OptionSet::Decompile(opts) => opts.validate(),
            OptionSet::Rebuild(_) => Ok(()),
        }
    }
}
