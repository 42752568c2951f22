//! Shared fixtures for pipeline tests.
#![allow(dead_code)]

use apklab_core::archive::{self, ArchiveFormat, PackSource};
use apklab_core::{CancelToken, Error, OrchestratorConfig, Result, ToolResult, ToolRunner, ToolStep};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tempfile::TempDir;

pub const MANIFEST: &str = r#"<?xml version="1.0" encoding="utf-8" standalone="no"?><manifest xmlns:android="http://schemas.android.com/apk/res/android" package="com.example.app">
    <uses-permission android:name="android.permission.INTERNET"/>
    <application android:label="@string/app_name">
        <activity android:exported="true" android:name=".MainActivity"/>
    </application>
</manifest>
"#;

pub fn config(temp: &TempDir) -> OrchestratorConfig {
    let mut config = OrchestratorConfig::default();
    config.workspace.base_dir = temp.path().join("work");
    config.artifacts.dir = temp.path().join("downloads");
    config
}

pub fn write_apk(temp: &TempDir) -> PathBuf {
    let apk = temp.path().join("app.apk");
    fs::write(&apk, b"PK\x03\x04not really a package").unwrap();
    apk
}

/// A decoded project like apktool leaves it.
pub fn write_decoded(out: &Path) {
    fs::create_dir_all(out.join("smali/com/example")).unwrap();
    fs::create_dir_all(out.join("res/values")).unwrap();
    fs::write(out.join("apktool.yml"), "version: 2.9.3\napkFileName: app.apk\n").unwrap();
    fs::write(out.join("AndroidManifest.xml"), MANIFEST).unwrap();
    fs::write(out.join("res/values/strings.xml"), "<resources/>\n").unwrap();
    fs::write(out.join("smali/com/example/MainActivity.smali"), ".class public Lcom/example/MainActivity;\n").unwrap();
}

/// Zip of a decoded project, as a user would upload it for rebuild.
pub fn write_project_zip(temp: &TempDir, name: &str) -> PathBuf {
    let project = temp.path().join(format!("{}-src", name));
    write_decoded(&project);
    let zip = temp.path().join(format!("{}.zip", name));
    archive::pack(&[PackSource::new(&project)], &zip, ArchiveFormat::Zip).unwrap();
    zip
}

/// Directories currently under the workspace base.
pub fn workspace_dirs(config: &OrchestratorConfig) -> usize {
    fs::read_dir(&config.workspace.base_dir).map(|d| d.count()).unwrap_or(0)
}

/// `path` spelled relative to the current directory of the test process.
#[cfg(unix)]
pub fn relative_to_cwd(path: &Path) -> PathBuf {
    let cwd = std::env::current_dir().unwrap();
    let mut relative = PathBuf::new();
    for _ in cwd.components().skip(1) {
        relative.push("..");
    }
    relative.join(path.strip_prefix("/").unwrap())
}

/// Unpack an artifact archive and return the directory.
pub fn unpack_artifact(path: &Path, temp: &TempDir) -> PathBuf {
    let dest = temp.path().join(format!("unpacked-{}", path.file_name().unwrap().to_string_lossy()));
    fs::create_dir_all(&dest).unwrap();
    archive::unpack(path, &dest).unwrap();
    dest
}

/// Stand-in for the external tools: records every step and produces the
/// outputs each real tool would.
pub struct FakeRunner {
    calls: Mutex<Vec<ToolStep>>,
    failing: Mutex<HashSet<String>>,
    pub accepted_alias: String,
    /// Tool that hangs until cancelled
    pub hang_tool: Option<String>,
    pub hanging: AtomicUsize,
}

impl FakeRunner {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            failing: Mutex::new(HashSet::new()),
            accepted_alias: "release".to_string(),
            hang_tool: None,
            hanging: AtomicUsize::new(0),
        }
    }

    pub fn hanging_on(tool: &str) -> Self {
        Self {
            hang_tool: Some(tool.to_string()),
            ..Self::new()
        }
    }

    pub fn fail(&self, tool: &str) {
        self.failing.lock().unwrap().insert(tool.to_string());
    }

    pub fn calls(&self) -> Vec<ToolStep> {
        self.calls.lock().unwrap().clone()
    }

    pub fn tools_called(&self) -> Vec<String> {
        self.calls().into_iter().map(|s| s.tool).collect()
    }

    fn exit(code: i32, stdout: &str, stderr: &str) -> ToolResult {
        ToolResult {
            exit_code: Some(code),
            signal: None,
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
            duration: Duration::from_millis(1),
        }
    }
}

fn arg_after(args: &[String], flag: &str) -> PathBuf {
    let i = args.iter().position(|a| a == flag).unwrap();
    PathBuf::from(&args[i + 1])
}

impl ToolRunner for FakeRunner {
    fn run(&self, step: &ToolStep, cancel: &CancelToken) -> Result<ToolResult> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        self.calls.lock().unwrap().push(step.clone());

        if self.hang_tool.as_deref() == Some(step.tool.as_str()) {
            self.hanging.fetch_add(1, Ordering::SeqCst);
            loop {
                if cancel.is_cancelled() {
                    return Err(Error::Cancelled);
                }
                std::thread::sleep(Duration::from_millis(10));
            }
        }

        let args: Vec<String> = step.args.iter().map(|a| a.to_string()).collect();

        if self.failing.lock().unwrap().contains(&step.tool) {
            // Real tools die halfway and leave part of their output behind
            match step.tool.as_str() {
                "jadx" => {
                    let out = arg_after(&args, "-ds").join("com/example");
                    fs::create_dir_all(&out).unwrap();
                    fs::write(out.join("Truncated.java"), "package com.example;\nclass Truncated {\n").unwrap();
                }
                "quark" => {
                    let report = arg_after(&args, "-o");
                    if report.parent().map_or(false, Path::is_dir) {
                        fs::write(report, "{\"crimes\": [").unwrap();
                    }
                }
                _ => {}
            }
            return Ok(Self::exit(1, "partial output", &format!("{}: fatal error in analysis", step.tool)));
        }

        match step.tool.as_str() {
            "apktool" if args.iter().any(|a| a == "d") => write_decoded(&arg_after(&args, "-o")),
            "apktool" => fs::write(arg_after(&args, "-o"), b"unsigned package").unwrap(),
            "jadx" => {
                let out = arg_after(&args, "-ds").join("com/example");
                fs::create_dir_all(&out).unwrap();
                fs::write(out.join("MainActivity.java"), "package com.example;\n").unwrap();
            }
            "quark" => fs::write(arg_after(&args, "-o"), "{\"crimes\": []}\n").unwrap(),
            "signer" => {
                let alias = args[args.iter().position(|a| a == "--ksAlias").unwrap() + 1].clone();
                if alias != self.accepted_alias {
                    return Ok(Self::exit(
                        1,
                        "",
                        &format!("java.lang.IllegalArgumentException: alias '{}' not found in keystore", alias),
                    ));
                }
                let unsigned = arg_after(&args, "--apks");
                let stem = unsigned.file_stem().unwrap().to_string_lossy().to_string();
                let out = arg_after(&args, "--out").join(format!("{}-aligned-signed.apk", stem));
                fs::write(out, b"signed package").unwrap();
            }
            other => panic!("unexpected tool {}", other),
        }

        Ok(Self::exit(0, "done", ""))
    }
}
