//! Network-security-config patching of decoded manifests.
//!
//! The manifest is parsed as an XML event stream and written back event
//! by event, so comments, whitespace and unrelated elements survive. Only
//! the `<application>` start tag is rewritten.
//!
//! The patch marker is the `android:networkSecurityConfig` attribute
//! itself: when it already points at the configured resource and the
//! resource file holds the configured content, the patch is a no-op and
//! nothing on disk is touched.

use log::{debug, info};
use std::borrow::Cow;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use xml::attribute::OwnedAttribute;
use xml::name::OwnedName;
use xml::reader::{ParserConfig, XmlEvent as ReaderEvent};
use xml::writer::{EmitterConfig, XmlEvent as WriterEvent};

use crate::error::{Error, Result};

pub const ANDROID_NS: &str = "http://schemas.android.com/apk/res/android";
const ANDROID_PREFIX: &str = "android";
const MANIFEST_FILE: &str = "AndroidManifest.xml";

/// Compiled (binary) Android XML starts with a RES_XML_TYPE chunk header.
const AXML_MAGIC: [u8; 4] = [0x03, 0x00, 0x08, 0x00];

/// What to inject and where.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestPatchSpec {
    /// Resource name under res/xml/ (without extension)
    pub resource_name: String,
    /// Full content of the injected resource file
    pub config_xml: String,
    /// Also set android:debuggable="true"
    pub debuggable: bool,
}

impl ManifestPatchSpec {
    /// Trust user-installed CAs next to the system store, so an
    /// intercepting proxy's certificate is accepted.
    pub fn interception(cleartext_traffic: bool, debuggable: bool) -> Self {
        let config_xml = format!(
            r#"<?xml version="1.0" encoding="utf-8"?>
<network-security-config>
    <base-config cleartextTrafficPermitted="{}">
        <trust-anchors>
            <certificates src="system" />
            <certificates src="user" />
        </trust-anchors>
    </base-config>
</network-security-config>
"#,
            cleartext_traffic
        );
        Self {
            resource_name: "network_security_config".to_string(),
            config_xml,
            debuggable,
        }
    }

    /// Value of the manifest reference, e.g. `@xml/network_security_config`.
    pub fn reference(&self) -> String {
        format!("@xml/{}", self.resource_name)
    }

    pub fn resource_path(&self, project: &Path) -> PathBuf {
        project.join("res").join("xml").join(format!("{}.xml", self.resource_name))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatchOutcome {
    /// Reference inserted
    Applied,
    /// An existing reference to another resource was overwritten
    Replaced { previous: String },
    /// Already patched; nothing written
    AlreadyPatched,
}

/// Patch the decoded project at `project`.
pub fn patch_manifest(project: &Path, spec: &ManifestPatchSpec) -> Result<PatchOutcome> {
    let manifest_path = project.join(MANIFEST_FILE);
    if !manifest_path.is_file() {
        return Err(Error::Patch(format!("{} not found in {}", MANIFEST_FILE, project.display())));
    }

    let content = fs::read(&manifest_path)
        .map_err(|e| Error::Patch(format!("cannot read {}: {}", manifest_path.display(), e)))?;
    if content.starts_with(&AXML_MAGIC) {
        return Err(Error::Patch(format!(
            "{} is binary XML; the project must be decoded with resources",
            manifest_path.display()
        )));
    }

    let events = parse_events(&content, &manifest_path)?;
    let app_index = find_application(&events)
        .ok_or_else(|| Error::Patch(format!("no <application> element in {}", manifest_path.display())))?;

    let (patched_start, previous) = patch_application(&events[app_index], spec)?;

    let mut manifest_changed = patched_start.is_some();
    if let Some(start) = patched_start {
        let output = write_events(&events, app_index, &start, &Margins::of(&content))?;
        manifest_changed = output != content;
        if manifest_changed {
            fs::write(&manifest_path, output)
                .map_err(|e| Error::Patch(format!("cannot write {}: {}", manifest_path.display(), e)))?;
        }
    }

    let resource_changed = write_resource(project, spec)?;

    let outcome = match previous {
        Some(prev) if prev != spec.reference() => PatchOutcome::Replaced { previous: prev },
        _ if manifest_changed || resource_changed => PatchOutcome::Applied,
        _ => PatchOutcome::AlreadyPatched,
    };

    info!(
        "Manifest patch {}: {} (reference={}, manifest_changed={}, resource_changed={})",
        match &outcome {
            PatchOutcome::Applied => "applied",
            PatchOutcome::Replaced { .. } => "replaced",
            PatchOutcome::AlreadyPatched => "skipped",
        },
        manifest_path.display(),
        spec.reference(),
        manifest_changed,
        resource_changed
    );

    Ok(outcome)
}

fn parse_events(content: &[u8], path: &Path) -> Result<Vec<ReaderEvent>> {
    let reader = ParserConfig::new()
        .trim_whitespace(false)
        .whitespace_to_characters(false)
        .cdata_to_characters(false)
        .ignore_comments(false)
        .coalesce_characters(false)
        .create_reader(content);

    reader
        .into_iter()
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::Patch(format!("cannot parse {}: {}", path.display(), e)))
}

/// Index of the `<application>` start tag directly under the root.
fn find_application(events: &[ReaderEvent]) -> Option<usize> {
    let mut depth = 0usize;
    for (i, event) in events.iter().enumerate() {
        match event {
            ReaderEvent::StartElement { name, .. } => {
                if depth == 1 && name.local_name == "application" {
                    return Some(i);
                }
                depth += 1;
            }
            ReaderEvent::EndElement { .. } => depth = depth.saturating_sub(1),
            _ => {}
        }
    }
    None
}

/// Rewritten `<application>` start tag (None if already correct) and the
/// reference it carried before.
fn patch_application(event: &ReaderEvent, spec: &ManifestPatchSpec) -> Result<(Option<ReaderEvent>, Option<String>)> {
    let ReaderEvent::StartElement {
        name,
        attributes,
        namespace,
    } = event
    else {
        return Err(Error::Patch("expected <application> start tag".to_string()));
    };

    let mut attributes = attributes.clone();
    let mut namespace = namespace.clone();
    match namespace.get(ANDROID_PREFIX) {
        Some(uri) if uri == ANDROID_NS => {}
        Some(uri) => {
            return Err(Error::Patch(format!(
                "prefix '{}' is bound to '{}' instead of {}",
                ANDROID_PREFIX, uri, ANDROID_NS
            )));
        }
        None => {
            namespace.put(ANDROID_PREFIX, ANDROID_NS);
        }
    }

    let reference = spec.reference();
    let previous = set_android_attribute(&mut attributes, "networkSecurityConfig", &reference);
    let mut changed = previous.as_deref() != Some(reference.as_str());

    if spec.debuggable {
        let was = set_android_attribute(&mut attributes, "debuggable", "true");
        changed |= was.as_deref() != Some("true");
    }

    if !changed {
        debug!("<application> already references {}", reference);
        return Ok((None, previous));
    }

    Ok((
        Some(ReaderEvent::StartElement {
            name: name.clone(),
            attributes,
            namespace,
        }),
        previous,
    ))
}

/// Set `android:<local>` and return its previous value.
fn set_android_attribute(attributes: &mut Vec<OwnedAttribute>, local: &str, value: &str) -> Option<String> {
    let existing = attributes
        .iter_mut()
        .find(|a| a.name.local_name == local && a.name.namespace.as_deref() == Some(ANDROID_NS));

    match existing {
        Some(attr) => Some(std::mem::replace(&mut attr.value, value.to_string())),
        None => {
            attributes.push(OwnedAttribute {
                name: OwnedName {
                    local_name: local.to_string(),
                    namespace: Some(ANDROID_NS.to_string()),
                    prefix: Some(ANDROID_PREFIX.to_string()),
                },
                value: value.to_string(),
            });
            None
        }
    }
}

/// Whitespace outside the root element, which the parser does not report.
#[derive(Debug, Default, PartialEq, Eq)]
struct Margins {
    /// The document starts with an XML declaration
    declaration: bool,
    after_declaration: String,
    trailing: String,
}

impl Margins {
    fn of(content: &[u8]) -> Self {
        let text = content.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(content);
        let declaration = text.starts_with(b"<?xml") && text.get(5).map_or(false, u8::is_ascii_whitespace);

        let after_declaration = if declaration {
            text.windows(2)
                .position(|w| w == b"?>")
                .map(|end| leading_whitespace(&text[end + 2..]))
                .unwrap_or_default()
        } else {
            String::new()
        };

        let trailing_len = text.iter().rev().take_while(|b| b.is_ascii_whitespace()).count();
        let trailing = String::from_utf8_lossy(&text[text.len() - trailing_len..]).into_owned();

        Self {
            declaration,
            after_declaration,
            trailing,
        }
    }
}

fn leading_whitespace(bytes: &[u8]) -> String {
    let len = bytes.iter().take_while(|b| b.is_ascii_whitespace()).count();
    String::from_utf8_lossy(&bytes[..len]).into_owned()
}

fn write_events(
    events: &[ReaderEvent],
    replace_at: usize,
    replacement: &ReaderEvent,
    margins: &Margins,
) -> Result<Vec<u8>> {
    let mut writer = EmitterConfig::new()
        .perform_indent(false)
        .write_document_declaration(margins.declaration)
        .normalize_empty_elements(true)
        .pad_self_closing(false)
        .create_writer(Vec::new());

    let emit_err = |e: xml::writer::Error| Error::Patch(format!("cannot serialise manifest: {}", e));

    for (i, event) in events.iter().enumerate() {
        let event = if i == replace_at { replacement } else { event };

        match event {
            ReaderEvent::StartElement {
                name,
                attributes,
                namespace,
            } => {
                let attributes: Vec<_> = attributes.iter().map(OwnedAttribute::borrow).collect();
                writer
                    .write(WriterEvent::StartElement {
                        name: name.borrow(),
                        attributes: Cow::Owned(attributes),
                        namespace: Cow::Borrowed(namespace),
                    })
                    .map_err(emit_err)?;
            }
            // The parser reports a declaration even when the file has none
            ReaderEvent::StartDocument { .. } if !margins.declaration => {}
            ReaderEvent::StartDocument { .. } => {
                if let Some(out) = event.as_writer_event() {
                    writer.write(out).map_err(emit_err)?;
                }
                writer
                    .inner_mut()
                    .write_all(margins.after_declaration.as_bytes())
                    .map_err(|e| Error::Patch(format!("cannot serialise manifest: {}", e)))?;
            }
            _ => {
                if let Some(out) = event.as_writer_event() {
                    writer.write(out).map_err(emit_err)?;
                }
            }
        }
    }

    let mut output = writer.into_inner();
    output.extend_from_slice(margins.trailing.as_bytes());
    Ok(output)
}

/// Write the security-config resource unless it already has the expected content.
fn write_resource(project: &Path, spec: &ManifestPatchSpec) -> Result<bool> {
    let path = spec.resource_path(project);
    if fs::read_to_string(&path).map(|c| c == spec.config_xml).unwrap_or(false) {
        return Ok(false);
    }

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| Error::Patch(format!("cannot create {}: {}", parent.display(), e)))?;
    }
    fs::write(&path, &spec.config_xml).map_err(|e| Error::Patch(format!("cannot write {}: {}", path.display(), e)))?;
    debug!("Wrote {}", path.display());
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const MANIFEST: &str = r#"<?xml version="1.0" encoding="utf-8" standalone="no"?><manifest xmlns:android="http://schemas.android.com/apk/res/android" package="com.example.app">
    <!-- network access -->
    <uses-permission android:name="android.permission.INTERNET"/>
    <application android:allowBackup="true" android:label="@string/app_name">
        <activity android:exported="true" android:name=".MainActivity">
            <intent-filter>
                <action android:name="android.intent.action.MAIN"/>
            </intent-filter>
        </activity>
    </application>
</manifest>
"#;

    fn project(manifest: &str) -> TempDir {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join(MANIFEST_FILE), manifest).unwrap();
        temp
    }

    fn read_manifest(temp: &TempDir) -> String {
        fs::read_to_string(temp.path().join(MANIFEST_FILE)).unwrap()
    }

    fn spec() -> ManifestPatchSpec {
        ManifestPatchSpec::interception(true, false)
    }

    #[test]
    fn test_fresh_patch() {
        let temp = project(MANIFEST);
        let outcome = patch_manifest(temp.path(), &spec()).unwrap();
        assert_eq!(outcome, PatchOutcome::Applied);

        let manifest = read_manifest(&temp);
        assert_eq!(manifest.matches("android:networkSecurityConfig=").count(), 1);
        assert!(manifest.contains(r#"android:networkSecurityConfig="@xml/network_security_config""#));

        let resource = fs::read_to_string(temp.path().join("res/xml/network_security_config.xml")).unwrap();
        assert!(resource.contains(r#"<certificates src="user" />"#));
        assert!(resource.contains(r#"cleartextTrafficPermitted="true""#));
    }

    #[test]
    fn test_unrelated_content_preserved() {
        let temp = project(MANIFEST);
        patch_manifest(temp.path(), &spec()).unwrap();

        let manifest = read_manifest(&temp);
        assert!(manifest.contains("<!-- network access -->"));
        assert!(manifest.contains(r#"<uses-permission android:name="android.permission.INTERNET"/>"#));
        assert!(manifest.contains(r#"<action android:name="android.intent.action.MAIN"/>"#));
        assert!(manifest.contains("\n        <activity"));
        assert!(manifest.contains(r#"package="com.example.app""#));
        assert_eq!(manifest.matches("xmlns:android=").count(), 1);
    }

    #[test]
    fn test_second_patch_is_noop() {
        let temp = project(MANIFEST);
        patch_manifest(temp.path(), &spec()).unwrap();
        let once_manifest = read_manifest(&temp);
        let resource_path = temp.path().join("res/xml/network_security_config.xml");
        let once_resource = fs::read_to_string(&resource_path).unwrap();

        let outcome = patch_manifest(temp.path(), &spec()).unwrap();
        assert_eq!(outcome, PatchOutcome::AlreadyPatched);
        assert_eq!(read_manifest(&temp), once_manifest);
        assert_eq!(fs::read_to_string(&resource_path).unwrap(), once_resource);
    }

    #[test]
    fn test_existing_reference_is_replaced() {
        let manifest = MANIFEST.replace(
            r#"android:allowBackup="true""#,
            r#"android:allowBackup="true" android:networkSecurityConfig="@xml/pinning""#,
        );
        let temp = project(&manifest);

        let outcome = patch_manifest(temp.path(), &spec()).unwrap();
        assert_eq!(
            outcome,
            PatchOutcome::Replaced {
                previous: "@xml/pinning".to_string()
            }
        );
        let manifest = read_manifest(&temp);
        assert_eq!(manifest.matches("networkSecurityConfig").count(), 1);
        assert!(!manifest.contains("@xml/pinning"));
    }

    #[test]
    fn test_app_shipped_resource_is_overwritten() {
        let manifest = MANIFEST.replace(
            r#"android:allowBackup="true""#,
            r#"android:allowBackup="true" android:networkSecurityConfig="@xml/network_security_config""#,
        );
        let temp = project(&manifest);
        let resource = temp.path().join("res/xml/network_security_config.xml");
        fs::create_dir_all(resource.parent().unwrap()).unwrap();
        fs::write(&resource, "<network-security-config><pin-set/></network-security-config>").unwrap();

        let outcome = patch_manifest(temp.path(), &spec()).unwrap();
        assert_eq!(outcome, PatchOutcome::Applied);
        assert_eq!(read_manifest(&temp), manifest);
        assert_eq!(fs::read_to_string(&resource).unwrap(), spec().config_xml);
    }

    #[test]
    fn test_prolog_and_trailing_whitespace_preserved() {
        let temp = project(MANIFEST);
        patch_manifest(temp.path(), &spec()).unwrap();
        let manifest = read_manifest(&temp);
        assert!(manifest.contains("?><manifest "), "{}", manifest);
        assert!(manifest.ends_with("</manifest>\n"));
        assert!(!manifest.ends_with("\n\n"));

        let spaced = MANIFEST.replacen("?><manifest", "?>\r\n\n<manifest", 1).replace("</manifest>\n", "</manifest>");
        let temp = project(&spaced);
        patch_manifest(temp.path(), &spec()).unwrap();
        let manifest = read_manifest(&temp);
        assert!(manifest.contains("?>\r\n\n<manifest "));
        assert!(manifest.ends_with("</manifest>"));
    }

    #[test]
    fn test_missing_declaration_is_not_added() {
        let temp = project(r#"<manifest xmlns:android="http://schemas.android.com/apk/res/android" package="x"><application/></manifest>"#);
        patch_manifest(temp.path(), &spec()).unwrap();
        assert!(read_manifest(&temp).starts_with("<manifest "));
    }

    #[test]
    fn test_margins() {
        let margins = Margins::of(b"<?xml version=\"1.0\"?>\n  <a/>\n");
        assert!(margins.declaration);
        assert_eq!(margins.after_declaration, "\n  ");
        assert_eq!(margins.trailing, "\n");

        let margins = Margins::of(b"<?xml-stylesheet href=\"x\"?><a/>");
        assert!(!margins.declaration);
        assert_eq!(margins, Margins::default());
    }

    #[test]
    fn test_debuggable_flag() {
        let temp = project(MANIFEST);
        patch_manifest(temp.path(), &ManifestPatchSpec::interception(true, true)).unwrap();
        assert!(read_manifest(&temp).contains(r#"android:debuggable="true""#));
    }

    #[test]
    fn test_namespace_added_when_missing() {
        let temp = project(r#"<?xml version="1.0" encoding="utf-8"?><manifest package="x"><application/></manifest>"#);
        patch_manifest(temp.path(), &spec()).unwrap();

        let manifest = read_manifest(&temp);
        assert!(manifest.contains(&format!(r#"xmlns:android="{}""#, ANDROID_NS)));
        assert!(manifest.contains(r#"android:networkSecurityConfig="@xml/network_security_config""#));
    }

    #[test]
    fn test_missing_manifest() {
        let temp = TempDir::new().unwrap();
        let err = patch_manifest(temp.path(), &spec()).unwrap_err();
        assert_eq!(err.category(), "patch");
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn test_binary_manifest_rejected() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join(MANIFEST_FILE), [0x03, 0x00, 0x08, 0x00, 0x10, 0x20]).unwrap();
        let err = patch_manifest(temp.path(), &spec()).unwrap_err();
        assert!(err.to_string().contains("binary XML"));
    }

    #[test]
    fn test_malformed_or_incomplete_manifest() {
        let temp = project("<manifest><application></manifest>");
        assert_eq!(patch_manifest(temp.path(), &spec()).unwrap_err().category(), "patch");

        let temp = project(r#"<manifest package="x"><uses-sdk/></manifest>"#);
        let err = patch_manifest(temp.path(), &spec()).unwrap_err();
        assert!(err.to_string().contains("<application>"));
        assert!(!temp.path().join("res").exists());
    }
}
