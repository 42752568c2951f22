//! Integration tests for the apklab binary
//!
//! These run the built CLI against shell-script stand-ins for the external
//! tools, configured through a `--config` file.
#![cfg(unix)]

use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use tempfile::TempDir;

const APKTOOL: &str = r#"#!/bin/sh
set -e
case "$1" in
  d)
    out="$4"
    mkdir -p "$out/smali"
    printf 'version: 2.9.3\n' > "$out/apktool.yml"
    cat > "$out/AndroidManifest.xml" <<'EOF'
<?xml version="1.0" encoding="utf-8" standalone="no"?><manifest xmlns:android="http://schemas.android.com/apk/res/android" package="com.example.app">
    <application android:label="demo"/>
</manifest>
EOF
    printf '.class public La;\n' > "$out/smali/a.smali"
    ;;
  b)
    printf 'unsigned' > "$4"
    ;;
esac
"#;

const SIGNER: &str = r#"#!/bin/sh
while [ $# -gt 0 ]; do
  case "$1" in
    --apks) apks="$2"; shift 2 ;;
    --out) out="$2"; shift 2 ;;
    --ks) ks="$2"; shift 2 ;;
    --ksPass) pass="$2"; shift 2 ;;
    *) shift ;;
  esac
done
if [ ! -f "$ks" ]; then
  echo "keystore $ks not found" >&2
  exit 1
fi
if [ "$pass" != "storepass" ]; then
  echo "Keystore was tampered with, or password was incorrect" >&2
  exit 1
fi
printf 'signed' > "$out/$(basename "$apks" .apk)-aligned-signed.apk"
"#;

const FAILING: &str = "#!/bin/sh\necho 'boom' >&2\nexit 3\n";

struct Env {
    temp: TempDir,
    config: PathBuf,
}

impl Env {
    fn new() -> Self {
        Self::with_root(|temp, rel| temp.join(rel))
    }

    /// Config with every path relative to the directory the CLI runs in.
    fn relative() -> Self {
        Self::with_root(|_, rel| PathBuf::from(rel))
    }

    fn with_root(path: impl Fn(&Path, &str) -> PathBuf) -> Self {
        let temp = TempDir::new().unwrap();
        let bin = temp.path().join("bin");
        fs::create_dir_all(&bin).unwrap();
        for (name, body) in [("apktool", APKTOOL), ("signer", SIGNER), ("failing", FAILING)] {
            fs::write(bin.join(name), body).unwrap();
        }

        let tool = |name: &str| {
            let script = path(temp.path(), &format!("bin/{}", name));
            format!("{{ program: sh, args: [\"{}\"] }}", script.display())
        };
        let config = temp.path().join("apklab.yaml");
        fs::write(
            &config,
            format!(
                "workspace:\n  base_dir: \"{work}\"\n\
                 artifacts:\n  dir: \"{downloads}\"\n\
                 tools:\n  apktool: {apktool}\n  jadx: {failing}\n  quark: {failing}\n  signer: {signer}\n",
                work = path(temp.path(), "work").display(),
                downloads = path(temp.path(), "downloads").display(),
                apktool = tool("apktool"),
                failing = tool("failing"),
                signer = tool("signer"),
            ),
        )
        .unwrap();

        Self { temp, config }
    }

    fn path(&self) -> &Path {
        self.temp.path()
    }

    fn apklab(&self, args: &[&str]) -> Command {
        let mut cmd = Command::new(env!("CARGO_BIN_EXE_apklab"));
        cmd.arg("--config")
            .arg(&self.config)
            .args(args)
            .current_dir(self.path())
            .env("HOME", self.path())
            .env("NO_COLOR", "1")
            .env_remove("APKLAB_KS_PASS")
            .env_remove("APKLAB_KEY_PASS");
        cmd
    }

    fn run(&self, args: &[&str]) -> Output {
        self.apklab(args).output().unwrap()
    }

    fn apk(&self) -> PathBuf {
        let apk = self.path().join("app.apk");
        fs::write(&apk, b"PK\x03\x04package").unwrap();
        apk
    }
}

fn json(output: &Output) -> Value {
    serde_json::from_slice(&output.stdout).unwrap()
}

#[test]
fn test_decompile_json() {
    let env = Env::new();
    let apk = env.apk();

    let output = env.run(&["decompile", apk.to_str().unwrap(), "-O", "mitm_patch", "--json"]);
    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));

    let record = json(&output);
    assert_eq!(record["job"]["kind"], "decompile");
    let artifact = PathBuf::from(record["artifact"]["path"].as_str().unwrap());
    assert!(artifact.is_file());
    assert!(artifact.to_string_lossy().ends_with("app-decompiled.zip"));
    assert_eq!(fs::read_dir(env.path().join("work")).unwrap().count(), 0);
}

#[test]
fn test_failed_optional_step_reports_raw_output() {
    let env = Env::new();
    let apk = env.apk();

    let output = env.run(&["decompile", apk.to_str().unwrap(), "-O", "decompile_java", "--json"]);
    assert_eq!(output.status.code(), Some(1));

    let record = json(&output);
    assert_eq!(record["error"]["stage"], "rendering_source");
    assert_eq!(record["error"]["category"], "tool-failure");
    assert_eq!(record["error"]["stderr"], "boom\n");
}

#[test]
fn test_invalid_option_combination() {
    let env = Env::new();
    let apk = env.apk();

    let output = env.run(&["decompile", apk.to_str().unwrap(), "-O", "deobf"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("decompile_java"));
    assert!(!env.path().join("work").exists() || fs::read_dir(env.path().join("work")).unwrap().count() == 0);
}

#[test]
fn test_rebuild_round_trip() {
    let env = Env::new();
    let apk = env.apk();
    let keystore = env.path().join("release.jks");
    fs::write(&keystore, b"jks").unwrap();
    let pass_file = env.path().join("ks.pass");
    fs::write(&pass_file, "storepass\n").unwrap();

    let decompiled = json(&env.run(&["decompile", apk.to_str().unwrap(), "--json"]));
    let archive = decompiled["artifact"]["path"].as_str().unwrap().to_string();

    let output = env.run(&[
        "rebuild",
        &archive,
        "--keystore",
        keystore.to_str().unwrap(),
        "--alias",
        "release",
        "--ks-pass-file",
        pass_file.to_str().unwrap(),
        "--json",
    ]);
    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));

    let record = json(&output);
    let signed = PathBuf::from(record["artifact"]["path"].as_str().unwrap());
    assert_eq!(fs::read(&signed).unwrap(), b"signed");
    assert!(!String::from_utf8_lossy(&output.stdout).contains("storepass"));
    assert!(!String::from_utf8_lossy(&output.stderr).contains("storepass"));
}

#[test]
fn test_rebuild_wrong_password_is_signing_error() {
    let env = Env::new();
    let apk = env.apk();
    let keystore = env.path().join("release.jks");
    fs::write(&keystore, b"jks").unwrap();

    let decompiled = json(&env.run(&["decompile", apk.to_str().unwrap(), "--json"]));
    let archive = decompiled["artifact"]["path"].as_str().unwrap().to_string();

    let output = env
        .apklab(&["rebuild", &archive, "--keystore", keystore.to_str().unwrap(), "--alias", "release", "--json"])
        .env("APKLAB_KS_PASS", "wrong-pass")
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(1));

    let record = json(&output);
    assert_eq!(record["error"]["category"], "signing");
    assert!(record["error"]["stderr"].as_str().unwrap().contains("password was incorrect"));
    assert!(!String::from_utf8_lossy(&output.stderr).contains("wrong-pass"));
}

#[test]
fn test_rebuild_requires_password() {
    let env = Env::new();
    let keystore = env.path().join("release.jks");
    fs::write(&keystore, b"jks").unwrap();

    let output = env.run(&["rebuild", "project.zip", "--keystore", keystore.to_str().unwrap(), "--alias", "release"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("APKLAB_KS_PASS"));
}

#[test]
fn test_patch_command() {
    let env = Env::new();
    let project = env.path().join("decoded");
    fs::create_dir_all(&project).unwrap();
    fs::write(
        project.join("AndroidManifest.xml"),
        "<?xml version=\"1.0\" encoding=\"utf-8\"?>\n<manifest xmlns:android=\"http://schemas.android.com/apk/res/android\" package=\"a.b\">\n    <application android:label=\"x\"/>\n</manifest>\n",
    )
    .unwrap();

    let output = env.run(&["patch", project.to_str().unwrap()]);
    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));
    assert!(project.join("res/xml/network_security_config.xml").is_file());

    let again = env.run(&["patch", project.to_str().unwrap()]);
    assert!(String::from_utf8_lossy(&again.stdout).contains("Already patched"));
}

#[test]
fn test_clean_and_init_config() {
    let env = Env::new();
    let apk = env.apk();

    let record = json(&env.run(&["decompile", apk.to_str().unwrap(), "--json"]));
    let job_id = record["job"]["id"].as_str().unwrap().to_string();
    let artifact = PathBuf::from(record["artifact"]["path"].as_str().unwrap());
    assert!(artifact.exists());

    let output = env.run(&["clean", &job_id]);
    assert!(output.status.success());
    assert!(!artifact.exists());

    let sample = env.path().join("sample.yaml");
    assert!(env.run(&["init-config", sample.to_str().unwrap()]).status.success());
    assert!(fs::read_to_string(&sample).unwrap().contains("optional_step_failure"));
    assert!(!env.run(&["init-config", sample.to_str().unwrap()]).status.success());
}

#[test]
fn test_relative_config_paths() {
    let env = Env::relative();
    env.apk();
    fs::write(env.path().join("release.jks"), b"jks").unwrap();
    fs::write(env.path().join("ks.pass"), "storepass\n").unwrap();

    let output = env.run(&["decompile", "app.apk", "--json"]);
    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));
    let record = json(&output);
    let archive = PathBuf::from(record["artifact"]["path"].as_str().unwrap());
    assert!(archive.is_absolute());
    assert!(archive.starts_with(env.path().canonicalize().unwrap().join("downloads")));

    let output = env.run(&[
        "rebuild",
        archive.to_str().unwrap(),
        "--keystore",
        "release.jks",
        "--alias",
        "release",
        "--ks-pass-file",
        "ks.pass",
        "--json",
    ]);
    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));
    let signed = PathBuf::from(json(&output)["artifact"]["path"].as_str().unwrap());
    assert_eq!(fs::read(&signed).unwrap(), b"signed");
    assert_eq!(fs::read_dir(env.path().join("work")).unwrap().count(), 0);
}
