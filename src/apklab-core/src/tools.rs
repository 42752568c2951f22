//! Argument contracts for the external tools.
//!
//! Each builder turns a job's options into an immutable [`ToolStep`] with
//! its success predicate (expected output paths) attached. Nothing here
//! spawns a process except [`check_tools`].

use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config::{TimeoutsConfig, ToolsConfig};
use crate::execution::{execute_step, CancelToken, ToolRunner, ToolStep};
use crate::options::{DecompileOptions, RebuildOptions};
use crate::rebuild::SigningCredentials;

/// Program plus fixed leading arguments (e.g. `java -jar apktool.jar`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCommand {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl ToolCommand {
    pub fn new(program: &str) -> Self {
        Self {
            program: program.to_string(),
            args: Vec::new(),
        }
    }

    /// `java -jar <jar>`
    pub fn jar(jar: &Path) -> Self {
        Self {
            program: "java".to_string(),
            args: vec!["-jar".to_string(), jar.to_string_lossy().to_string()],
        }
    }

    /// The file this command depends on: the jar for `java -jar`, else the program.
    pub fn entry_point(&self) -> &str {
        match self.args.iter().position(|a| a == "-jar") {
            Some(i) if i + 1 < self.args.len() => &self.args[i + 1],
            _ => &self.program,
        }
    }

    /// Resolve relative paths in the command against `base`.
    ///
    /// Steps run inside the job workspace, so a relative program path or
    /// script argument would otherwise be looked up there. Bare program
    /// names stay as they are and go through PATH.
    pub fn anchor(&mut self, base: &Path) {
        let program = Path::new(&self.program);
        if !program.is_absolute() && program.components().count() > 1 {
            self.program = base.join(program).to_string_lossy().into_owned();
        }

        let mut after_jar = false;
        for arg in &mut self.args {
            let path = Path::new(arg.as_str());
            let is_path = !arg.is_empty()
                && !arg.starts_with('-')
                && !path.is_absolute()
                && (after_jar || path.components().count() > 1 || base.join(path).exists());
            after_jar = *arg == "-jar";
            if is_path {
                *arg = base.join(path).to_string_lossy().into_owned();
            }
        }
    }

    fn step(&self, tool: &str, cwd: &Path, timeout: Duration) -> ToolStep {
        ToolStep::new(tool, &self.program, cwd, timeout).args(self.args.iter().map(String::as_str))
    }
}

/// Configured tools plus their timeouts.
#[derive(Debug, Clone)]
pub struct Toolchain {
    pub apktool: ToolCommand,
    pub jadx: ToolCommand,
    pub quark: ToolCommand,
    pub signer: ToolCommand,
    pub framework_dir: Option<PathBuf>,
    pub timeouts: TimeoutsConfig,
}

impl Toolchain {
    pub fn new(tools: &ToolsConfig, timeouts: &TimeoutsConfig) -> Self {
        Self {
            apktool: tools.apktool.clone(),
            jadx: tools.jadx.clone(),
            quark: tools.quark.clone(),
            signer: tools.signer.clone(),
            framework_dir: tools.framework_dir.clone(),
            timeouts: timeouts.clone(),
        }
    }

    /// `apktool d <apk> -o <out> -f [-p <framework>] [flags]`
    pub fn decode(&self, apk: &Path, out: &Path, opts: &DecompileOptions, cwd: &Path) -> ToolStep {
        let mut step = self
            .apktool
            .step("apktool", cwd, self.timeouts.decode())
            .arg("d")
            .arg(apk)
            .arg("-o")
            .arg(out)
            .arg("-f");
        if let Some(dir) = &self.framework_dir {
            step = step.arg("-p").arg(dir.as_path());
        }
        step.args(opts.apktool_args()).expect_output(&out.join("apktool.yml"))
    }

    /// `jadx -r -q -ds <out> [--deobf] [--show-bad-code] <apk>`
    ///
    /// `-r` skips resources: apktool already decoded them.
    pub fn render(&self, apk: &Path, out: &Path, opts: &DecompileOptions, cwd: &Path) -> ToolStep {
        self.jadx
            .step("jadx", cwd, self.timeouts.render())
            .args(["-r", "-q", "-ds"])
            .arg(out)
            .args(opts.jadx_args())
            .arg(apk)
            .expect_output(out)
    }

    /// `quark -a <apk> -o <report>`
    pub fn scan(&self, apk: &Path, report: &Path, cwd: &Path) -> ToolStep {
        self.quark
            .step("quark", cwd, self.timeouts.scan())
            .arg("-a")
            .arg(apk)
            .arg("-o")
            .arg(report)
            .expect_output(report)
    }

    /// `apktool b <project> -o <unsigned> [-p <framework>] [flags]`
    pub fn build(&self, project: &Path, unsigned: &Path, opts: &RebuildOptions, cwd: &Path) -> ToolStep {
        let mut step = self
            .apktool
            .step("apktool", cwd, self.timeouts.build())
            .arg("b")
            .arg(project)
            .arg("-o")
            .arg(unsigned);
        if let Some(dir) = &self.framework_dir {
            step = step.arg("-p").arg(dir.as_path());
        }
        step.args(opts.apktool_args()).expect_output(unsigned)
    }

    /// Sign (and zipalign) `unsigned` into `out_dir`.
    ///
    /// Passwords travel as secret arguments and are masked in every
    /// rendered command line.
    pub fn sign(&self, unsigned: &Path, out_dir: &Path, creds: &SigningCredentials, cwd: &Path) -> ToolStep {
        let key_password = creds.key_password.as_ref().unwrap_or(&creds.store_password);
        self.signer
            .step("signer", cwd, self.timeouts.sign())
            .arg("--apks")
            .arg(unsigned)
            .arg("--out")
            .arg(out_dir)
            .arg("--ks")
            .arg(creds.keystore.as_path())
            .arg("--ksAlias")
            .arg(creds.alias.as_str())
            .arg("--ksPass")
            .secret_arg(&creds.store_password)
            .arg("--ksKeyPass")
            .secret_arg(key_password)
            .arg("--allowResign")
            .expect_output(&signed_output_path(unsigned, out_dir))
    }
}

/// Where the signer writes its result: `<out_dir>/<stem>-aligned-signed.apk`.
pub fn signed_output_path(unsigned: &Path, out_dir: &Path) -> PathBuf {
    let stem = unsigned
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "package".to_string());
    out_dir.join(format!("{}-aligned-signed.apk", stem))
}

// ============================================================================
// Tool check
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct ToolCheck {
    pub name: String,
    pub ok: bool,
    pub detail: String,
}

/// Verify that java runs and every configured tool is resolvable.
pub fn check_tools(toolchain: &Toolchain, runner: &dyn ToolRunner) -> Vec<ToolCheck> {
    let mut checks = Vec::new();

    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    let java = ToolStep::new("java", "java", &cwd, Duration::from_secs(30)).arg("--version");
    checks.push(match execute_step(runner, &java, &CancelToken::new()) {
        Ok(result) => {
            // `java --version` prints to stdout, older `-version` to stderr
            let out = if result.stdout.trim().is_empty() { &result.stderr } else { &result.stdout };
            ToolCheck {
                name: "java".to_string(),
                ok: true,
                detail: out.lines().next().unwrap_or("").trim().to_string(),
            }
        }
        Err(e) => ToolCheck {
            name: "java".to_string(),
            ok: false,
            detail: e.to_string(),
        },
    });

    for (name, command) in [
        ("apktool", &toolchain.apktool),
        ("jadx", &toolchain.jadx),
        ("quark", &toolchain.quark),
        ("signer", &toolchain.signer),
    ] {
        let entry = command.entry_point();
        checks.push(match resolve_program(entry) {
            Some(path) => ToolCheck {
                name: name.to_string(),
                ok: true,
                detail: path.display().to_string(),
            },
            None => ToolCheck {
                name: name.to_string(),
                ok: false,
                detail: format!("{} not found", entry),
            },
        });
    }

    if let Some(dir) = &toolchain.framework_dir {
        checks.push(ToolCheck {
            name: "framework".to_string(),
            ok: dir.is_dir(),
            detail: dir.display().to_string(),
        });
    }

    for check in &checks {
        if check.ok {
            info!("tool={} Tool check passed: {}", check.name, check.detail);
        } else {
            warn!("tool={} Tool check failed: {}", check.name, check.detail);
        }
    }

    checks
}

/// Resolve a program the way the OS would: paths directly, bare names via PATH.
fn resolve_program(program: &str) -> Option<PathBuf> {
    let path = Path::new(program);
    if path.components().count() > 1 || path.is_absolute() {
        return path.exists().then(|| path.to_path_buf());
    }

    let search = std::env::var_os("PATH")?;
    std::env::split_paths(&search)
        .map(|dir| dir.join(program))
        .find(|candidate| candidate.is_file())
}
