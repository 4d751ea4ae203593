//! Component and release metadata.
//!
//! Cabinet archives and remote catalogs both carry AppStream-style XML
//! documents describing components: which hardware-ids they target, what
//! installing them requires, and the releases available. The same parser
//! serves both; a cabinet holds one or more documents, a remote index holds
//! one large one.

use ignition_crypto::Checksum;
use ignition_errors::{Result, UpdateError};
use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// How urgent the vendor considers a release.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum ReleaseUrgency {
    /// Not specified by the vendor
    #[default]
    Unknown,
    /// Cosmetic or minor
    Low,
    /// Normal bugfix cadence
    Medium,
    /// Fixes something user-visible
    High,
    /// Security or data-loss fix
    Critical,
}

impl ReleaseUrgency {
    fn parse(value: &str) -> Self {
        match value {
            "low" => ReleaseUrgency::Low,
            "medium" => ReleaseUrgency::Medium,
            "high" => ReleaseUrgency::High,
            "critical" => ReleaseUrgency::Critical,
            _ => ReleaseUrgency::Unknown,
        }
    }
}

/// Comparison operator used by requirement predicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompareOp {
    /// Equal
    Eq,
    /// Not equal
    Ne,
    /// Strictly greater
    Gt,
    /// Greater or equal
    Ge,
    /// Strictly less
    Lt,
    /// Less or equal
    Le,
    /// Anchored pattern match on the raw string
    Regex,
    /// Shell-style glob on the raw string
    Glob,
}

impl CompareOp {
    fn parse(value: &str) -> Option<Self> {
        match value {
            "eq" => Some(CompareOp::Eq),
            "ne" => Some(CompareOp::Ne),
            "gt" => Some(CompareOp::Gt),
            "ge" => Some(CompareOp::Ge),
            "lt" => Some(CompareOp::Lt),
            "le" => Some(CompareOp::Le),
            "regex" => Some(CompareOp::Regex),
            "glob" => Some(CompareOp::Glob),
        _ => None,
        }
    }
}

/// Which version a firmware requirement is evaluated against.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FirmwareTarget {
    /// The target device's own firmware version
    SelfVersion,
    /// The target device's bootloader version
    Bootloader,
    /// Another component in the same composite unit, by component id
    Sibling(String),
}

/// A declarative requirement attached to a component.
///
/// All requirements must hold for a release to be installable; evaluation
/// lives in the engine, this is purely the parsed shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Requirement {
    /// At least one of these hardware-ids must be present on the device
    HardwareId {
        /// Accepted hardware-ids, lowercased
        any_of: Vec<String>,
    },
    /// A version comparison against the device or a sibling
    Firmware {
        /// Whose version to compare
        target: FirmwareTarget,
        /// Comparison operator
        compare: CompareOp,
        /// Right-hand side version string
        version: String,
    },
    /// The client driving the update must advertise all these features
    Client {
        /// Required feature names
        features: Vec<String>,
    },
    /// The device's vendor-id must satisfy the comparison
    VendorId {
        /// Comparison operator
        compare: CompareOp,
        /// Right-hand side, e.g. `USB:0x273F`
        value: String,
    },
    /// A requirement kind this engine does not know; fails closed
    Unknown {
        /// The XML element name
        element: String,
    },
}

/// One installable firmware release of a component.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Release {
    /// Version string, in the component's declared format
    pub version: String,
    /// Vendor urgency
    pub urgency: ReleaseUrgency,
    /// Branch this release belongs to, if the component has several
    pub branch: Option<String>,
    /// Payload locations: archive basenames or remote URIs
    pub locations: Vec<String>,
    /// Declared payload checksums
    pub checksums: Vec<Checksum>,
    /// Expected install duration in seconds
    pub install_duration: Option<u32>,
    /// Message shown to the operator before installing
    pub update_message: Option<String>,
    /// Free-form release notes
    pub description: Option<String>,
    /// Vendor tags, e.g. a best-known-configuration name
    pub tags: Vec<String>,
    /// Update may only be applied from offline mode
    pub only_offline: bool,
    /// Payload size in bytes, when declared
    pub size: Option<u64>,
}

/// A component: one updatable thing and its candidate releases.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Component {
    /// AppStream-style component id, e.g. `com.vendor.product.firmware`
    pub id: String,
    /// Human-readable name
    pub name: Option<String>,
    /// Branch the component tracks, if any
    pub branch: Option<String>,
    /// Hardware-ids this component applies to, lowercased
    pub provides: Vec<String>,
    /// Requirements gating every release of the component
    pub requirements: Vec<Requirement>,
    /// Candidate releases, document order
    pub releases: Vec<Release>,
    /// A failure installing this component does not abort the rest of the
    /// composite set
    pub install_independently: bool,
}

impl Component {
    /// Whether any of the given hardware-ids is listed by this component.
    pub fn matches_any_guid<'a, I>(&self, guids: I) -> bool
    where
        I: IntoIterator<Item = &'a str>,
    {
        guids
            .into_iter()
            .any(|g| self.provides.iter().any(|p| p.eq_ignore_ascii_case(g)))
    }
}

/// A parsed metadata document: zero or more components.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ComponentDocument {
    /// Origin attribute, normally the remote or vendor name
    pub origin: Option<String>,
    /// Components in document order
    pub components: Vec<Component>,
}

impl ComponentDocument {
    /// Parse an XML metadata document.
    pub fn parse_xml(bytes: &[u8]) -> Result<Self> {
        let mut reader = Reader::from_reader(bytes);
        reader.config_mut().trim_text(true);

        let mut doc = ComponentDocument::default();
        let mut path: Vec<String> = Vec::new();
        let mut component: Option<Component> = None;
        let mut release: Option<Release> = None;
        let mut checksum_attrs: Option<(Option<String>, String)> = None;
        let mut firmware_req: Option<(CompareOp, String)> = None;
        let mut custom_key: Option<String> = None;

        loop {
            match reader.read_event() {
                Ok(Event::Start(ref e)) => {
                    let name = local_name(e);
                    handle_element_start(
                        e,
                        &name,
                        &path,
                        &mut doc,
                        &mut component,
                        &mut release,
                        &mut checksum_attrs,
                        &mut firmware_req,
                        &mut custom_key,
                    )?;
                    path.push(name);
                }
                Ok(Event::Empty(ref e)) => {
                    let name = local_name(e);
                    // self-closing elements carry everything in attributes
                    path.push(name.clone());
                    handle_empty_element(e, &name, &path, &mut component, &mut release)?;
                    path.pop();
                }
                Ok(Event::Text(ref t)) => {
                    let text = t
                        .unescape()
                        .map_err(|e| UpdateError::invalid_file(format!("bad XML text: {e}")))?
                        .into_owned();
                    handle_text(
                        &text,
                        &path,
                        &mut component,
                        &mut release,
                        &checksum_attrs,
                        &mut firmware_req,
                        &custom_key,
                    )?;
                }
                Ok(Event::End(_)) => {
                    let ended = path.pop();
                    match ended.as_deref() {
                        Some("component") => {
                            if let Some(c) = component.take() {
                                if c.id.is_empty() {
                                    return Err(UpdateError::invalid_file(
                                        "component without an <id>",
                                    ));
                                }
                                doc.components.push(c);
                            }
                        }
                        Some("release") => {
                            if let (Some(c), Some(r)) = (component.as_mut(), release.take()) {
                                if r.version.is_empty() {
                                    return Err(UpdateError::invalid_file(
                                        "release without a version attribute",
                                    ));
                                }
                                c.releases.push(r);
                            }
                        }
                        Some("checksum") => checksum_attrs = None,
                        Some("firmware") if path_ends_with(&path, &["requires"]) => {
                            // a <firmware compare= version=></firmware> with no
                            // text targets the device's own version
                            if let (Some(c), Some((compare, version))) =
                                (component.as_mut(), firmware_req.take())
                            {
                                c.requirements.push(Requirement::Firmware {
                                    target: FirmwareTarget::SelfVersion,
                                    compare,
                                    version,
                                });
                            }
                        }
                        Some("value") => custom_key = None,
                        _ => {}
                    }
                }
                Ok(Event::Eof) => break,
                Ok(_) => {}
                Err(e) => {
                    return Err(UpdateError::invalid_file(format!(
                        "XML parse error at byte {}: {e}",
                        reader.buffer_position()
                    )));
                }
            }
        }

        if !path.is_empty() {
            return Err(UpdateError::invalid_file("unbalanced XML document"));
        }
        debug!(components = doc.components.len(), "parsed metadata document");
        Ok(doc)
    }
}

fn local_name(e: &BytesStart<'_>) -> String {
    String::from_utf8_lossy(e.local_name().as_ref()).into_owned()
}

fn attr(e: &BytesStart<'_>, name: &str) -> Result<Option<String>> {
    for a in e.attributes() {
        let a = a.map_err(|e| UpdateError::invalid_file(format!("bad XML attribute: {e}")))?;
        if a.key.local_name().as_ref() == name.as_bytes() {
            let value = a
                .unescape_value()
                .map_err(|e| UpdateError::invalid_file(format!("bad XML attribute: {e}")))?;
            return Ok(Some(value.into_owned()));
        }
    }
    Ok(None)
}

fn parse_compare(e: &BytesStart<'_>) -> Result<CompareOp> {
    let raw = attr(e, "compare")?.unwrap_or_else(|| "ge".to_string());
    CompareOp::parse(&raw)
        .ok_or_else(|| UpdateError::invalid_file(format!("unknown compare op '{raw}'")))
}

fn path_ends_with(path: &[String], suffix: &[&str]) -> bool {
    path.len() >= suffix.len()
        && path
            .iter()
            .rev()
            .zip(suffix.iter().rev())
            .all(|(a, b)| a == b)
}

#[allow(clippy::too_many_arguments)]
fn handle_element_start(
    e: &BytesStart<'_>,
    name: &str,
    path: &[String],
    doc: &mut ComponentDocument,
    component: &mut Option<Component>,
    release: &mut Option<Release>,
    checksum_attrs: &mut Option<(Option<String>, String)>,
    firmware_req: &mut Option<(CompareOp, String)>,
    custom_key: &mut Option<String>,
) -> Result<()> {
    match name {
        "components" if path.is_empty() => {
            doc.origin = attr(e, "origin")?;
        }
        "component" => {
            if component.is_some() {
                return Err(UpdateError::invalid_file("nested <component>"));
            }
            *component = Some(Component::default());
        }
        "release" if path_ends_with(path, &["releases"]) => {
            let version = attr(e, "version")?.unwrap_or_default();
            let urgency = attr(e, "urgency")?
                .map(|u| ReleaseUrgency::parse(&u))
                .unwrap_or_default();
            let install_duration = attr(e, "install_duration")?.and_then(|d| d.parse().ok());
            *release = Some(Release {
                version,
                urgency,
                install_duration,
                branch: component.as_ref().and_then(|c| c.branch.clone()),
                ..Release::default()
            });
        }
        "checksum" if release.is_some() => {
            let filename = attr(e, "filename")?;
            let target = attr(e, "target")?.unwrap_or_else(|| "content".to_string());
            *checksum_attrs = Some((filename, target));
        }
        "firmware" if path_ends_with(path, &["requires"]) => {
            let compare = parse_compare(e)?;
            let version = attr(e, "version")?.unwrap_or_default();
            *firmware_req = Some((compare, version));
        }
        "hardware" | "client" if path_ends_with(path, &["requires"]) => {
            // text element; handled on the text event
        }
        "vendor-id" if path_ends_with(path, &["requires"]) => {
            let compare = parse_compare(e)?;
            let value = attr(e, "version")?.unwrap_or_default();
            if let Some(c) = component.as_mut() {
                c.requirements.push(Requirement::VendorId { compare, value });
            }
        }
        "value" if path_ends_with(path, &["custom"]) => {
            *custom_key = attr(e, "key")?;
        }
        other if path_ends_with(path, &["requires"]) => {
            if let Some(c) = component.as_mut() {
                c.requirements.push(Requirement::Unknown {
                    element: other.to_string(),
                });
            }
        }
        _ => {}
    }
    Ok(())
}

fn handle_empty_element(
    e: &BytesStart<'_>,
    name: &str,
    path: &[String],
    component: &mut Option<Component>,
    release: &mut Option<Release>,
) -> Result<()> {
    match name {
        "firmware" if path_ends_with(&path[..path.len() - 1], &["requires"]) => {
            let compare = parse_compare(e)?;
            let version = attr(e, "version")?.unwrap_or_default();
            if let Some(c) = component.as_mut() {
                c.requirements.push(Requirement::Firmware {
                    target: FirmwareTarget::SelfVersion,
                    compare,
                    version,
                });
            }
        }
        "vendor-id" if path_ends_with(&path[..path.len() - 1], &["requires"]) => {
            let compare = parse_compare(e)?;
            let value = attr(e, "version")?.unwrap_or_default();
            if let Some(c) = component.as_mut() {
                c.requirements.push(Requirement::VendorId { compare, value });
            }
        }
        other if path_ends_with(&path[..path.len() - 1], &["requires"]) => {
            if let Some(c) = component.as_mut() {
                c.requirements.push(Requirement::Unknown {
                    element: other.to_string(),
                });
            }
        }
        "size" | "artifact" => {
            // sizes may also appear as attributes on self-closing elements
            if let (Some(r), Ok(Some(v))) = (release.as_mut(), attr(e, "value")) {
                r.size = v.parse().ok();
            }
        }
        _ => {}
    }
    Ok(())
}

fn handle_text(
    text: &str,
    path: &[String],
    component: &mut Option<Component>,
    release: &mut Option<Release>,
    checksum_attrs: &Option<(Option<String>, String)>,
    firmware_req: &mut Option<(CompareOp, String)>,
    custom_key: &Option<String>,
) -> Result<()> {
    let Some(leaf) = path.last().map(String::as_str) else {
        return Ok(());
    };
    match leaf {
        "id" if path_ends_with(path, &["component", "id"]) => {
            if let Some(c) = component.as_mut() {
                c.id = text.to_string();
            }
        }
        "name" if path_ends_with(path, &["component", "name"]) => {
            if let Some(c) = component.as_mut() {
                c.name = Some(text.to_string());
            }
        }
        "branch" if path_ends_with(path, &["component", "branch"]) => {
            if let Some(c) = component.as_mut() {
                c.branch = Some(text.to_string());
            }
        }
        "firmware" if path_ends_with(path, &["provides", "firmware"]) => {
            if let Some(c) = component.as_mut() {
                c.provides.push(text.to_ascii_lowercase());
            }
        }
        "firmware" if path_ends_with(path, &["requires", "firmware"]) => {
            if let (Some(c), Some((compare, version))) = (component.as_mut(), firmware_req.take()) {
                let target = match text {
                    "bootloader" => FirmwareTarget::Bootloader,
                    other => FirmwareTarget::Sibling(other.to_string()),
                };
                c.requirements.push(Requirement::Firmware {
                    target,
                    compare,
                    version,
                });
            }
        }
        "hardware" if path_ends_with(path, &["requires", "hardware"]) => {
            if let Some(c) = component.as_mut() {
                c.requirements.push(Requirement::HardwareId {
                    any_of: text
                        .split('|')
                        .map(|g| g.trim().to_ascii_lowercase())
                        .filter(|g| !g.is_empty())
                        .collect(),
                });
            }
        }
        "client" if path_ends_with(path, &["requires", "client"]) => {
            if let Some(c) = component.as_mut() {
                c.requirements.push(Requirement::Client {
                    features: text
                        .split('|')
                        .map(|f| f.trim().to_string())
                        .filter(|f| !f.is_empty())
                        .collect(),
                });
            }
        }
        "location" => {
            if let Some(r) = release.as_mut() {
                r.locations.push(text.to_string());
            }
        }
        "checksum" => {
            if let (Some(r), Some((_filename, target))) = (release.as_mut(), checksum_attrs) {
                if target == "content" {
                    let checksum: Checksum = text
                        .parse()
                        .map_err(|e| UpdateError::invalid_file(format!("bad checksum: {e}")))?;
                    r.checksums.push(checksum);
                }
            }
        }
        "description" | "p" => {
            if let Some(r) = release.as_mut() {
                let existing = r.description.get_or_insert_with(String::new);
                if !existing.is_empty() {
                    existing.push('\n');
                }
                existing.push_str(text);
            }
        }
        "tag" if path_ends_with(path, &["tags", "tag"]) => {
            if let Some(r) = release.as_mut() {
                r.tags.push(text.to_string());
            }
        }
        "size" => {
            if let Some(r) = release.as_mut() {
                r.size = text.parse().ok();
            }
        }
        "value" => {
            if let (Some(c), Some(key)) = (component.as_mut(), custom_key) {
                match key.as_str() {
                    "LVFS::UpdateMessage" => {
                        if let Some(r) = release.as_mut() {
                            r.update_message = Some(text.to_string());
                        } else if let Some(r) = c.releases.last_mut() {
                            r.update_message = Some(text.to_string());
                        }
                    }
                    "LVFS::OnlyOffline" => {
                        if let Some(r) = c.releases.last_mut() {
                            r.only_offline = text == "true";
                        }
                    }
                    "LVFS::InstallIndependently" => {
                        c.install_independently = text == "true";
                    }
                    _ => {}
                }
            }
        }
        _ => {}
    }
    Ok(())
}
