//! Sharing templates
//!
//! Named bundles of sharing configuration an owner applies in one call. A
//! template expands to plain grant drafts and rides the ordinary mutation
//! path, so applied templates leave the same audit trail as hand-written
//! grants and are revoked rule by rule like any other.

use ahash::AHashMap;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::core::error::{PermissionError, Result};
use crate::core::pattern::InstrumentFilter;
use crate::core::rule::{GrantDraft, InstrumentScope};
use crate::core::types::{ActionKind, Grantee, PermissionKind, ResourceKind, RuleLevel, UserId};

/// Who a sharing template reaches
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "scope", content = "users", rename_all = "snake_case")]
pub enum SharingScope {
    /// Every user
    Everyone,
    /// Every user except the listed ones
    AllExcept(Vec<UserId>),
    /// Only the listed users
    Only(Vec<UserId>),
}

impl SharingScope {
    /// Grant drafts realizing this scope for `owner` over `resources`.
    ///
    /// `AllExcept` becomes one everyone-wide ALLOW per resource plus an
    /// explicit DENY per excluded user; the denies carry a SPECIFIC scope so
    /// they outrank the blanket row whenever both match.
    pub fn drafts(
        &self,
        owner: UserId,
        resources: &[ResourceKind],
        expires_at: Option<DateTime<Utc>>,
        notes: Option<&str>,
    ) -> Vec<GrantDraft> {
        let mut drafts = Vec::new();
        for &resource in resources {
            match self {
                SharingScope::Everyone => {
                    drafts.push(view_draft(owner, Grantee::Everyone, resource, RuleLevel::Allow));
                }
                SharingScope::AllExcept(excluded) => {
                    drafts.push(view_draft(owner, Grantee::Everyone, resource, RuleLevel::Allow));
                    for &user in excluded {
                        drafts.push(view_draft(owner, Grantee::User(user), resource, RuleLevel::Deny));
                    }
                }
                SharingScope::Only(users) => {
                    for &user in users {
                        drafts.push(view_draft(owner, Grantee::User(user), resource, RuleLevel::Allow));
                    }
                }
            }
        }
        drafts
            .into_iter()
            .map(|mut draft| {
                if let Some(at) = expires_at {
                    draft = draft.expiring_at(at);
                }
                if let Some(text) = notes {
                    draft = draft.with_notes(text);
                }
                draft
            })
            .collect()
    }
}

fn view_draft(
    owner: UserId,
    grantee: Grantee,
    resource: ResourceKind,
    level: RuleLevel,
) -> GrantDraft {
    let draft = GrantDraft::new(
        owner,
        grantee,
        PermissionKind::DataSharing,
        resource,
        ActionKind::View,
        level,
    );
    match level {
        RuleLevel::Allow => draft,
        RuleLevel::Deny => draft.with_scope(InstrumentScope::Specific(
            InstrumentFilter::compile_lenient(&[]),
        )),
    }
}

/// A named, reusable sharing configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SharingTemplate {
    pub name: String,
    pub description: String,
    /// Resources the expansion covers, one rule set per entry
    pub resources: Vec<ResourceKind>,
    pub sharing: SharingScope,
    /// Seeded templates; protected from redefinition and removal
    pub system: bool,
}

impl SharingTemplate {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        resources: Vec<ResourceKind>,
        sharing: SharingScope,
    ) -> Self {
        SharingTemplate {
            name: name.into(),
            description: description.into(),
            resources,
            sharing,
            system: false,
        }
    }

    fn seeded(
        name: &str,
        description: &str,
        resources: Vec<ResourceKind>,
        sharing: SharingScope,
    ) -> Self {
        SharingTemplate {
            system: true,
            ..SharingTemplate::new(name, description, resources, sharing)
        }
    }

    /// Expand into the grant drafts the mutation path will write for `owner`.
    pub fn expand(&self, owner: UserId, expires_at: Option<DateTime<Utc>>) -> Vec<GrantDraft> {
        self.sharing
            .drafts(owner, &self.resources, expires_at, None)
            .into_iter()
            .map(|draft| {
                let note = match draft.level {
                    RuleLevel::Allow => format!("shared via template '{}'", self.name),
                    RuleLevel::Deny => format!("excluded by template '{}'", self.name),
                };
                draft.with_notes(note)
            })
            .collect()
    }
}

/// Named template store, seeded with the stock system templates
pub struct TemplateRegistry {
    templates: RwLock<AHashMap<String, SharingTemplate>>,
}

impl TemplateRegistry {
    /// Registry carrying the stock templates.
    pub fn standard() -> Self {
        let registry = TemplateRegistry::empty();
        let seeded = [
            SharingTemplate::seeded(
                "share-all",
                "Share every resource with everyone",
                vec![
                    ResourceKind::Positions,
                    ResourceKind::Holdings,
                    ResourceKind::Orders,
                    ResourceKind::Strategies,
                    ResourceKind::Margins,
                ],
                SharingScope::Everyone,
            ),
            SharingTemplate::seeded(
                "family-view",
                "Share positions and holdings with everyone",
                vec![ResourceKind::Positions, ResourceKind::Holdings],
                SharingScope::Everyone,
            ),
        ];
        {
            let mut templates = registry.templates.write();
            for template in seeded {
                templates.insert(template.name.clone(), template);
            }
        }
        registry
    }

    pub fn empty() -> Self {
        TemplateRegistry {
            templates: RwLock::new(AHashMap::new()),
        }
    }

    /// Insert or replace a template under its name. System templates cannot
    /// be shadowed.
    pub fn define(&self, template: SharingTemplate) -> Result<()> {
        if template.name.is_empty() {
            return Err(PermissionError::Validation(
                "template name must not be empty".to_string(),
            ));
        }
        let mut templates = self.templates.write();
        if templates.get(&template.name).is_some_and(|t| t.system) {
            return Err(PermissionError::Validation(format!(
                "'{}' is a system template and cannot be redefined",
                template.name
            )));
        }
        templates.insert(template.name.clone(), template);
        Ok(())
    }

    /// Drop a user-defined template.
    pub fn remove(&self, name: &str) -> Result<()> {
        let mut templates = self.templates.write();
        match templates.get(name) {
            None => Err(PermissionError::TemplateNotFound(name.to_string())),
            Some(t) if t.system => Err(PermissionError::Validation(format!(
                "'{}' is a system template and cannot be removed",
                name
            ))),
            Some(_) => {
                templates.remove(name);
                Ok(())
            }
        }
    }

    pub fn get(&self, name: &str) -> Result<SharingTemplate> {
        self.templates
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| PermissionError::TemplateNotFound(name.to_string()))
    }

    /// Every registered template, ordered by name.
    pub fn list(&self) -> Vec<SharingTemplate> {
        let mut all: Vec<SharingTemplate> = self.templates.read().values().cloned().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }
}

impl Default for TemplateRegistry {
    fn default() -> Self {
        TemplateRegistry::standard()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_except_expands_to_blanket_allow_plus_denies() {
        let template = SharingTemplate::new(
            "team-view",
            "Share positions with everyone but the juniors",
            vec![ResourceKind::Positions],
            SharingScope::AllExcept(vec![2, 3]),
        );

        let drafts = template.expand(5, None);
        assert_eq!(drafts.len(), 3);

        assert_eq!(drafts[0].grantee, Grantee::Everyone);
        assert_eq!(drafts[0].level, RuleLevel::Allow);
        assert_eq!(drafts[0].scope, InstrumentScope::All);

        for (draft, user) in drafts[1..].iter().zip([2, 3]) {
            assert_eq!(draft.grantee, Grantee::User(user));
            assert_eq!(draft.level, RuleLevel::Deny);
            assert_eq!(draft.scope.kind_str(), "SPECIFIC");
            assert_eq!(draft.grantor, 5);
        }
    }

    #[test]
    fn test_only_expands_to_listed_allows() {
        let template = SharingTemplate::new(
            "advisors",
            "Positions and holdings for the two advisors",
            vec![ResourceKind::Positions, ResourceKind::Holdings],
            SharingScope::Only(vec![7, 8]),
        );

        let drafts = template.expand(1, None);
        assert_eq!(drafts.len(), 4);
        assert!(drafts.iter().all(|d| d.level == RuleLevel::Allow));
        assert!(drafts.iter().all(|d| matches!(d.grantee, Grantee::User(_))));
    }

    #[test]
    fn test_expansion_propagates_expiry_and_validates() {
        let expires = Utc::now() + chrono::Duration::days(30);
        let template = SharingTemplate::new(
            "month-trial",
            "",
            vec![ResourceKind::Orders],
            SharingScope::AllExcept(vec![9]),
        );

        let now = Utc::now();
        for draft in template.expand(4, Some(expires)) {
            assert_eq!(draft.expires_at, Some(expires));
            draft.validate(now).unwrap();
        }
    }

    #[test]
    fn test_registry_define_get_remove() {
        let registry = TemplateRegistry::empty();
        let template = SharingTemplate::new(
            "mine",
            "",
            vec![ResourceKind::Positions],
            SharingScope::Everyone,
        );

        registry.define(template.clone()).unwrap();
        assert_eq!(registry.get("mine").unwrap(), template);

        registry.remove("mine").unwrap();
        assert!(matches!(
            registry.get("mine"),
            Err(PermissionError::TemplateNotFound(_))
        ));
        assert!(matches!(
            registry.remove("mine"),
            Err(PermissionError::TemplateNotFound(_))
        ));
    }

    #[test]
    fn test_system_templates_are_protected() {
        let registry = TemplateRegistry::standard();
        assert!(registry.get("share-all").unwrap().system);

        assert!(matches!(
            registry.remove("share-all"),
            Err(PermissionError::Validation(_))
        ));
        let shadow = SharingTemplate::new(
            "share-all",
            "",
            vec![ResourceKind::Margins],
            SharingScope::Only(vec![1]),
        );
        assert!(matches!(
            registry.define(shadow),
            Err(PermissionError::Validation(_))
        ));
    }

    #[test]
    fn test_list_is_sorted_by_name() {
        let registry = TemplateRegistry::standard();
        registry
            .define(SharingTemplate::new(
                "a-first",
                "",
                vec![ResourceKind::Positions],
                SharingScope::Everyone,
            ))
            .unwrap();

        let listed = registry.list();
        let names: Vec<&str> = listed.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, ["a-first", "family-view", "share-all"]);
    }
}
