use crate::android::binary_xml::{AndroidManifest, ManifestAttribute, ManifestElement};
use crate::patch::report::{PatchEvent, PatchReporter};
use crate::patch::{PatchRequest, ReceiverActions, TagSpec};

pub const STORAGE_WRITE_PERMISSION: &str = "android.permission.WRITE_EXTERNAL_STORAGE";

const USES_PERMISSION: &str = "uses-permission";
const INSTRUMENTATION: &str = "instrumentation";
const APPLICATION: &str = "application";
const RECEIVER: &str = "receiver";
const INTENT_FILTER: &str = "intent-filter";
const ACTION: &str = "action";

/// The manifest breaks a structural assumption the patch relies on.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("malformed manifest while trying to {operation}: {detail}")]
pub struct MalformedManifest {
    pub operation: &'static str,
    pub detail: String,
}

impl MalformedManifest {
    fn new(operation: &'static str, detail: impl Into<String>) -> Self {
        MalformedManifest {
            operation,
            detail: detail.into(),
        }
    }
}

/// Apply `request` to `manifest` in the fixed order: remove permissions, add permissions,
/// add instrumentation, add receivers, remove application tags.
///
/// Either the whole request applies and its events reach `reporter`, or `manifest` is left
/// as it was and nothing is reported. Returns whether the tree changed.
pub fn apply_patch(
    manifest: &mut AndroidManifest,
    request: &PatchRequest,
    reporter: &mut dyn PatchReporter,
) -> Result<bool, MalformedManifest> {
    let mut patch = ManifestPatch::new(manifest);
    patch.remove_permissions(&request.remove_permissions)?;
    patch.add_permissions(&request.add_permissions)?;
    if let Some(name) = &request.instrumentation {
        patch.add_instrumentation(name)?;
    }
    patch.add_receivers(&request.receivers)?;
    patch.remove_application_tags(&request.remove_tags)?;
    Ok(patch.commit(manifest, reporter))
}

/// A working copy of a manifest root that collects edits and their events.
///
/// Nothing is visible to the original manifest until [`ManifestPatch::commit`].
#[derive(Debug)]
pub struct ManifestPatch {
    root: ManifestElement,
    modified: bool,
    events: Vec<PatchEvent>,
}

impl ManifestPatch {
    pub fn new(manifest: &AndroidManifest) -> Self {
        ManifestPatch {
            root: manifest.root().clone(),
            modified: false,
            events: Vec::new(),
        }
    }

    /// Swap the working copy into `manifest` and flush buffered events.
    pub fn commit(self, manifest: &mut AndroidManifest, reporter: &mut dyn PatchReporter) -> bool {
        for event in &self.events {
            reporter.report(event);
        }
        if self.modified {
            *manifest.root_mut() = self.root;
        }
        self.modified
    }

    pub fn remove_permissions(&mut self, names: &[String]) -> Result<(), MalformedManifest> {
        const OP: &str = "remove permissions";
        for name in names {
            match find_keyed_child(&self.root, USES_PERMISSION, name, OP)? {
                Some(index) => {
                    self.root.children.remove(index);
                    self.modified = true;
                    self.events.push(PatchEvent::PermissionRemoved { name: name.clone() });
                }
                None => self.events.push(PatchEvent::PermissionAbsent { name: name.clone() }),
            }
        }
        Ok(())
    }

    pub fn add_permissions(&mut self, names: &[String]) -> Result<(), MalformedManifest> {
        const OP: &str = "add permissions";
        for name in names {
            match find_keyed_child(&self.root, USES_PERMISSION, name, OP)? {
                Some(index) => {
                    if name == STORAGE_WRITE_PERMISSION
                        && self.root.children[index].remove_android_attribute("maxSdkVersion") > 0
                    {
                        self.modified = true;
                        self.events.push(PatchEvent::PermissionWidened { name: name.clone() });
                    }
                }
                None => {
                    self.root.append_child(named_element(USES_PERMISSION, name));
                    self.modified = true;
                    self.events.push(PatchEvent::PermissionAdded { name: name.clone() });
                }
            }
        }
        Ok(())
    }

    /// Appends unconditionally, even when an instrumentation with the same name exists.
    pub fn add_instrumentation(&mut self, name: &str) -> Result<(), MalformedManifest> {
        const OP: &str = "add instrumentation";
        let package = self
            .root
            .attribute_value("package")
            .ok_or_else(|| MalformedManifest::new(OP, "root element has no package attribute"))?
            .as_str()
            .ok_or_else(|| MalformedManifest::new(OP, "package attribute is not a string"))?
            .to_string();

        let mut element = named_element(INSTRUMENTATION, name);
        element
            .attributes
            .push(ManifestAttribute::android("targetPackage", package.as_str()));
        self.root.append_child(element);
        self.modified = true;
        self.events.push(PatchEvent::InstrumentationAdded {
            name: name.to_string(),
            target_package: package,
        });
        Ok(())
    }

    pub fn add_receivers(&mut self, receivers: &ReceiverActions) -> Result<(), MalformedManifest> {
        const OP: &str = "add receivers";
        if receivers.is_empty() {
            return Ok(());
        }
        let app_index = application_index(&self.root, OP)?;

        for (class, actions) in receivers.iter() {
            let application = &mut self.root.children[app_index];
            let receiver_index = match find_keyed_child(application, RECEIVER, class, OP)? {
                Some(index) => index,
                None => {
                    let mut receiver = named_element(RECEIVER, class);
                    receiver
                        .attributes
                        .push(ManifestAttribute::android("exported", true));
                    receiver
                        .attributes
                        .push(ManifestAttribute::android("enabled", true));
                    application.append_child(receiver);
                    self.modified = true;
                    self.events.push(PatchEvent::ReceiverAdded {
                        name: class.to_string(),
                    });
                    application.children.len() - 1
                }
            };

            let receiver = &mut application.children[receiver_index];
            let filter_index = match receiver
                .children
                .iter()
                .position(|child| child.tag == INTENT_FILTER)
            {
                Some(index) => index,
                None => {
                    receiver.append_child(ManifestElement::new(INTENT_FILTER));
                    receiver.children.len() - 1
                }
            };

            let filter = &mut receiver.children[filter_index];
            let mut present = filter
                .children_named(ACTION)
                .map(|action| required_identity(action, OP).map(str::to_string))
                .collect::<Result<Vec<_>, _>>()?;

            for action in actions {
                if present.contains(action) {
                    continue;
                }
                filter.append_child(named_element(ACTION, action));
                present.push(action.clone());
                self.modified = true;
                self.events.push(PatchEvent::ActionAdded {
                    receiver: class.to_string(),
                    action: action.clone(),
                });
            }
        }
        Ok(())
    }

    pub fn remove_application_tags(&mut self, specs: &[TagSpec]) -> Result<(), MalformedManifest> {
        const OP: &str = "remove application tags";
        if specs.is_empty() {
            return Ok(());
        }
        let app_index = application_index(&self.root, OP)?;

        for spec in specs {
            let application = &mut self.root.children[app_index];
            match find_keyed_child(application, &spec.tag, &spec.name, OP)? {
                Some(index) => {
                    application.children.remove(index);
                    self.modified = true;
                    self.events.push(PatchEvent::TagRemoved {
                        tag: spec.tag.clone(),
                        name: spec.name.clone(),
                    });
                }
                None => self.events.push(PatchEvent::TagAbsent {
                    tag: spec.tag.clone(),
                    name: spec.name.clone(),
                }),
            }
        }
        Ok(())
    }
}

fn named_element(tag: &str, name: &str) -> ManifestElement {
    let mut element = ManifestElement::new(tag);
    element.attributes.push(ManifestAttribute::android("name", name));
    element
}

/// The single `<application>` child of the root.
fn application_index(root: &ManifestElement, operation: &'static str) -> Result<usize, MalformedManifest> {
    let mut found = root
        .children
        .iter()
        .enumerate()
        .filter(|(_, child)| child.tag == APPLICATION)
        .map(|(index, _)| index);
    match (found.next(), found.next()) {
        (Some(index), None) => Ok(index),
        (None, _) => Err(MalformedManifest::new(
            operation,
            format!("<{}> has no <{APPLICATION}> child", root.tag),
        )),
        (Some(_), Some(_)) => Err(MalformedManifest::new(
            operation,
            format!("<{}> has more than one <{APPLICATION}> child", root.tag),
        )),
    }
}

/// The `android:name` of `element`, if it has exactly one string-valued one.
fn identity<'a>(
    element: &'a ManifestElement,
    operation: &'static str,
) -> Result<Option<&'a str>, MalformedManifest> {
    let mut names = element.attributes.iter().filter(|attr| attr.is_android("name"));
    let attribute = match (names.next(), names.next()) {
        (None, _) => return Ok(None),
        (Some(attribute), None) => attribute,
        (Some(_), Some(_)) => {
            return Err(MalformedManifest::new(
                operation,
                format!("<{}> has more than one android:name attribute", element.tag),
            ))
        }
    };
    attribute.value.as_str().map(Some).ok_or_else(|| {
        MalformedManifest::new(
            operation,
            format!("android:name of <{}> is not a string: {:?}", element.tag, attribute.value),
        )
    })
}

fn required_identity<'a>(
    element: &'a ManifestElement,
    operation: &'static str,
) -> Result<&'a str, MalformedManifest> {
    identity(element, operation)?.ok_or_else(|| {
        MalformedManifest::new(
            operation,
            format!("<{}> is missing its android:name attribute", element.tag),
        )
    })
}

/// Index of the first `<tag>` child of `parent` whose `android:name` is `name`.
///
/// Every candidate with the same tag must carry an identity, since matching keys off it.
fn find_keyed_child(
    parent: &ManifestElement,
    tag: &str,
    name: &str,
    operation: &'static str,
) -> Result<Option<usize>, MalformedManifest> {
    for (index, child) in parent.children.iter().enumerate() {
        if child.tag == tag && required_identity(child, operation)? == name {
            return Ok(Some(index));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest(xml: &str) -> AndroidManifest {
        AndroidManifest::from_string(xml).expect("fixture manifest should parse")
    }

    fn permissions(names: &[&str]) -> Vec<String> {
        names.iter().map(|name| name.to_string()).collect()
    }

    #[test]
    fn missing_application_is_malformed() {
        let mut doc = manifest(
            r#"<manifest xmlns:android="http://schemas.android.com/apk/res/android" package="a.b"/>"#,
        );
        let mut request = PatchRequest::default();
        request.receivers.push("R1", "A1");

        let err = apply_patch(&mut doc, &request, &mut Vec::<PatchEvent>::new()).unwrap_err();
        assert_eq!(err.operation, "add receivers");
        assert!(err.detail.contains("no <application>"));
    }

    #[test]
    fn duplicate_application_is_malformed() {
        let mut doc = manifest(
            r#"<manifest xmlns:android="http://schemas.android.com/apk/res/android" package="a.b">
                 <application/><application/>
               </manifest>"#,
        );
        let request = PatchRequest {
            remove_tags: vec![TagSpec::new("activity", "X")],
            ..PatchRequest::default()
        };

        let err = apply_patch(&mut doc, &request, &mut Vec::<PatchEvent>::new()).unwrap_err();
        assert!(err.detail.contains("more than one <application>"));
    }

    #[test]
    fn failure_leaves_tree_and_reporter_untouched() {
        let original = manifest(
            r#"<manifest xmlns:android="http://schemas.android.com/apk/res/android" package="a.b">
                 <application>
                   <receiver android:exported="true"/>
                 </application>
               </manifest>"#,
        );
        let mut doc = original.clone();
        let mut request = PatchRequest {
            add_permissions: permissions(&["P1"]),
            ..PatchRequest::default()
        };
        request.receivers.push("R1", "A1");
        let mut events: Vec<PatchEvent> = Vec::new();

        let err = apply_patch(&mut doc, &request, &mut events).unwrap_err();
        assert!(err.detail.contains("missing its android:name"));
        assert_eq!(doc, original);
        assert!(events.is_empty());
    }

    #[test]
    fn duplicate_identity_attribute_is_malformed() {
        let mut doc = manifest(
            r#"<manifest xmlns:android="http://schemas.android.com/apk/res/android" package="a.b">
                 <uses-permission android:name="P1"/>
                 <application/>
               </manifest>"#,
        );
        doc.root_mut().children[0]
            .attributes
            .push(ManifestAttribute::android("name", "P2"));

        let err = apply_patch(
            &mut doc,
            &PatchRequest {
                remove_permissions: permissions(&["P9"]),
                ..PatchRequest::default()
            },
            &mut Vec::<PatchEvent>::new(),
        )
        .unwrap_err();
        assert_eq!(err.operation, "remove permissions");
        assert!(err.detail.contains("more than one android:name"));
    }

    #[test]
    fn instrumentation_requires_package() {
        let mut doc = manifest(r#"<manifest><application/></manifest>"#);
        let request = PatchRequest {
            instrumentation: Some("I1".to_string()),
            ..PatchRequest::default()
        };

        let err = apply_patch(&mut doc, &request, &mut Vec::<PatchEvent>::new()).unwrap_err();
        assert_eq!(err.operation, "add instrumentation");
    }

    #[test]
    fn instrumentation_is_appended_every_time() {
        let mut doc = manifest(
            r#"<manifest xmlns:android="http://schemas.android.com/apk/res/android" package="pkg.example">
                 <application/>
               </manifest>"#,
        );
        let request = PatchRequest {
            instrumentation: Some("I1".to_string()),
            ..PatchRequest::default()
        };

        assert!(apply_patch(&mut doc, &request, &mut Vec::<PatchEvent>::new()).unwrap());
        assert!(apply_patch(&mut doc, &request, &mut Vec::<PatchEvent>::new()).unwrap());
        assert_eq!(doc.root().children_named("instrumentation").count(), 2);
    }

    #[test]
    fn existing_filter_without_new_actions_is_unchanged() {
        let mut doc = manifest(
            r#"<manifest xmlns:android="http://schemas.android.com/apk/res/android" package="a.b">
                 <application>
                   <receiver android:name="R1">
                     <intent-filter><action android:name="A1"/></intent-filter>
                   </receiver>
                 </application>
               </manifest>"#,
        );
        let original = doc.clone();
        let mut request = PatchRequest::default();
        request.receivers.push("R1", "A1");
        let mut events: Vec<PatchEvent> = Vec::new();

        assert!(!apply_patch(&mut doc, &request, &mut events).unwrap());
        assert_eq!(doc, original);
        assert!(events.is_empty());
    }

    #[test]
    fn events_follow_operation_order() {
        let mut doc = manifest(
            r#"<manifest xmlns:android="http://schemas.android.com/apk/res/android" package="a.b">
                 <uses-permission android:name="OLD"/>
                 <application><service android:name="S"/></application>
               </manifest>"#,
        );
        let mut request = PatchRequest {
            add_permissions: permissions(&["NEW"]),
            remove_permissions: permissions(&["OLD", "MISSING"]),
            remove_tags: vec![TagSpec::new("service", "S")],
            ..PatchRequest::default()
        };
        request.receivers.push("R", "A");
        let mut events: Vec<PatchEvent> = Vec::new();

        assert!(apply_patch(&mut doc, &request, &mut events).unwrap());
        assert_eq!(
            events,
            vec![
                PatchEvent::PermissionRemoved { name: "OLD".into() },
                PatchEvent::PermissionAbsent { name: "MISSING".into() },
                PatchEvent::PermissionAdded { name: "NEW".into() },
                PatchEvent::ReceiverAdded { name: "R".into() },
                PatchEvent::ActionAdded {
                    receiver: "R".into(),
                    action: "A".into()
                },
                PatchEvent::TagRemoved {
                    tag: "service".into(),
                    name: "S".into()
                },
            ]
        );
    }
}
