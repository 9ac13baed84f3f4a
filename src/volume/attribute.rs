//! Object attributes and ordered ACL rule resolution.
//!
//! Every entry gets an [`ObjectAttribute`] computed from the volume's default
//! attribute, the volume-wide flags and the ordered rule list. Rules are
//! applied field by field, so a later matching rule only overrides the fields
//! it actually sets.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use regex::Regex;

use crate::config::{AttributeConfig, RuleConfig};
use crate::{ConnectorError, Result};

/// Effective access flags of one entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectAttribute {
    read: bool,
    write: bool,
    locked: bool,
    visible: bool,
    show_only: bool,
    access: bool,
}

impl Default for ObjectAttribute {
    fn default() -> Self {
        Self {
            read: true,
            write: true,
            locked: false,
            visible: true,
            show_only: false,
            access: true,
        }
    }
}

impl ObjectAttribute {
    /// Read permission. Always false when the entry is not accessible.
    pub fn read(&self) -> bool {
        self.access && self.read
    }

    /// Write permission. Always false when the entry is not accessible.
    pub fn write(&self) -> bool {
        self.access && self.write
    }

    /// Locked flag. Always true when the entry is not accessible.
    pub fn locked(&self) -> bool {
        !self.access || self.locked
    }

    /// Whether the entry appears in listings.
    pub fn visible(&self) -> bool {
        self.visible
    }

    /// Whether the entry is listed but its content cannot be opened.
    pub fn show_only(&self) -> bool {
        self.show_only
    }

    /// Whether the entry is accessible at all.
    pub fn accessible(&self) -> bool {
        self.access
    }

    /// Apply every override that is set.
    pub fn apply(&mut self, overrides: &AttributeOverrides) {
        if let Some(v) = overrides.read {
            self.read = v;
        }
        if let Some(v) = overrides.write {
            self.write = v;
        }
        if let Some(v) = overrides.locked {
            self.locked = v;
        }
        if let Some(v) = overrides.visible {
            self.visible = v;
        }
        if let Some(v) = overrides.show_only {
            self.show_only = v;
        }
        if let Some(v) = overrides.access {
            self.access = v;
        }
    }
}

/// Nullable per-field overrides.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AttributeOverrides {
    pub read: Option<bool>,
    pub write: Option<bool>,
    pub locked: Option<bool>,
    pub visible: Option<bool>,
    pub show_only: Option<bool>,
    pub access: Option<bool>,
}

impl From<&AttributeConfig> for AttributeOverrides {
    fn from(config: &AttributeConfig) -> Self {
        Self {
            read: config.read,
            write: config.write,
            locked: config.locked,
            visible: config.visible,
            show_only: config.show_only,
            access: config.access,
        }
    }
}

/// What a rule predicate gets to look at.
#[derive(Debug, Clone, Copy)]
pub struct RuleSubject<'a> {
    /// Relative path (`/dir/name`).
    pub relative: &'a str,
    /// Absolute backing path.
    pub path: &'a Path,
    /// Whether the entry is a directory.
    pub is_dir: bool,
}

impl RuleSubject<'_> {
    /// Last path component, empty for the root.
    pub fn name(&self) -> &str {
        self.relative.rsplit('/').next().unwrap_or_default()
    }
}

/// Predicate over a rule subject.
pub type EntryPredicate = Arc<dyn Fn(&RuleSubject<'_>) -> bool + Send + Sync>;

/// One ACL rule: predicates plus overrides.
#[derive(Clone, Default)]
pub struct FilteredObjectAttribute {
    /// Matches directory entries.
    pub directory_filter: Option<EntryPredicate>,
    /// Matches file entries.
    pub file_filter: Option<EntryPredicate>,
    /// Matches any entry.
    pub object_filter: Option<EntryPredicate>,
    /// Overrides applied on match.
    pub overrides: AttributeOverrides,
}

impl fmt::Debug for FilteredObjectAttribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilteredObjectAttribute")
            .field("directory_filter", &self.directory_filter.is_some())
            .field("file_filter", &self.file_filter.is_some())
            .field("object_filter", &self.object_filter.is_some())
            .field("overrides", &self.overrides)
            .finish()
    }
}

impl FilteredObjectAttribute {
    /// Rule applying to directories matched by `predicate`.
    pub fn directories<F>(predicate: F, overrides: AttributeOverrides) -> Self
    where
        F: Fn(&RuleSubject<'_>) -> bool + Send + Sync + 'static,
    {
        Self {
            directory_filter: Some(Arc::new(predicate)),
            overrides,
            ..Default::default()
        }
    }

    /// Rule applying to files matched by `predicate`.
    pub fn files<F>(predicate: F, overrides: AttributeOverrides) -> Self
    where
        F: Fn(&RuleSubject<'_>) -> bool + Send + Sync + 'static,
    {
        Self {
            file_filter: Some(Arc::new(predicate)),
            overrides,
            ..Default::default()
        }
    }

    /// Rule applying to any entry matched by `predicate`.
    pub fn objects<F>(predicate: F, overrides: AttributeOverrides) -> Self
    where
        F: Fn(&RuleSubject<'_>) -> bool + Send + Sync + 'static,
    {
        Self {
            object_filter: Some(Arc::new(predicate)),
            overrides,
            ..Default::default()
        }
    }

    /// Build a rule from configuration: a regex on the relative path, optionally
    /// restricted to files or directories.
    pub fn from_config(rule: &RuleConfig) -> Result<Self> {
        let regex = Regex::new(&rule.pattern).map_err(|e| {
            ConnectorError::Config(format!("invalid rule pattern {}: {e}", rule.pattern))
        })?;
        let overrides = AttributeOverrides::from(&rule.attributes);

        match rule.kind.as_deref() {
            None => Ok(Self::objects(move |s| regex.is_match(s.relative), overrides)),
            Some("file") => Ok(Self::files(move |s| regex.is_match(s.relative), overrides)),
            Some("directory") | Some("dir") => Ok(Self::directories(
                move |s| regex.is_match(s.relative),
                overrides,
            )),
            Some(other) => Err(ConnectorError::Config(format!("invalid rule kind: {other}"))),
        }
    }

    /// Whether this rule applies to the subject.
    pub fn matches(&self, subject: &RuleSubject<'_>) -> bool {
        let test = |p: &Option<EntryPredicate>| p.as_ref().is_some_and(|f| f(subject));

        (subject.is_dir && test(&self.directory_filter))
            || (!subject.is_dir && test(&self.file_filter))
            || test(&self.object_filter)
    }
}

/// Resolves entry attributes for one volume.
#[derive(Debug, Clone, Default)]
pub struct AttributeResolver {
    default: ObjectAttribute,
    read_only: bool,
    locked: bool,
    show_only: bool,
    rules: Vec<FilteredObjectAttribute>,
}

impl AttributeResolver {
    /// Create a resolver from a default attribute and volume-wide flags.
    pub fn new(default: ObjectAttribute, read_only: bool, locked: bool, show_only: bool) -> Self {
        Self {
            default,
            read_only,
            locked,
            show_only,
            rules: Vec::new(),
        }
    }

    /// Append a rule; later rules win per field.
    pub fn push_rule(&mut self, rule: FilteredObjectAttribute) {
        self.rules.push(rule);
    }

    /// Ordered rules.
    pub fn rules(&self) -> &[FilteredObjectAttribute] {
        &self.rules
    }

    /// Compute the effective attribute of an entry.
    pub fn resolve(&self, subject: &RuleSubject<'_>) -> ObjectAttribute {
        let mut attribute = self.default;
        if self.read_only {
            attribute.write = false;
        }
        if self.locked {
            attribute.locked = true;
        }
        if self.show_only {
            attribute.show_only = true;
        }

        for rule in self.rules.iter().filter(|r| r.matches(subject)) {
            attribute.apply(&rule.overrides);
        }
        attribute
    }
}

/// A new entry may be created inside `parent`.
pub fn can_create(parent: &ObjectAttribute) -> bool {
    parent.write()
}

/// `entry` may be removed from `parent`.
pub fn can_delete(entry: &ObjectAttribute, parent: &ObjectAttribute) -> bool {
    !entry.locked() && parent.write()
}

/// `entry` may be renamed inside `parent`.
pub fn can_rename(entry: &ObjectAttribute, parent: &ObjectAttribute) -> bool {
    can_delete(entry, parent)
}

/// `entry` may be moved out of `parent` into `destination`.
pub fn can_move(
    entry: &ObjectAttribute,
    parent: &ObjectAttribute,
    destination: &ObjectAttribute,
) -> bool {
    can_delete(entry, parent) && can_create(destination)
}

/// `entry` may be copied into `destination`.
pub fn can_copy(entry: &ObjectAttribute, destination: &ObjectAttribute) -> bool {
    entry.read() && can_create(destination)
}

/// The content of `entry` may be read or downloaded.
pub fn can_download(entry: &ObjectAttribute) -> bool {
    entry.read() && !entry.show_only()
}

/// The content of `entry` may be replaced.
pub fn can_edit(entry: &ObjectAttribute) -> bool {
    entry.write() && !entry.show_only()
}

/// `archive` may be extracted into `destination`.
pub fn can_extract(archive: &ObjectAttribute, destination: &ObjectAttribute) -> bool {
    can_download(archive) && can_create(destination)
}
