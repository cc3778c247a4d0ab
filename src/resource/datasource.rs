//! Read-only data sources
//!
//! Every `*_list` kind walks a cursor-paginated collection; `user_lookup`
//! finds one organization member by email. They are re-read on every pass
//! and never create anything remotely.

use apikit::{Error, ListQuery, OrganizationUser, Result, Scope};
use converge::{AttrMode, Attributes, Controller, Created, Lifecycle, Registry, Schema};
use serde_json::Value;
use std::sync::Arc;

use super::{Platform, object, required};

const LIST: Schema = Schema::new(&[
    ("limit", AttrMode::ForcesReplacement),
    ("max_items", AttrMode::ForcesReplacement),
]);

const USER_LOOKUP: Schema = Schema::new(&[("email", AttrMode::ForcesReplacement)]);

/// Page size when none is declared
const DEFAULT_PAGE_SIZE: u32 = 100;

pub fn register(registry: &mut Registry, platform: &Arc<Platform>) {
    let lists: [(&'static str, Scope, &'static str, &'static [&'static str]); 8] = [
        ("project_list", Scope::Admin, "/organization/projects", &["include_archived"]),
        ("file_list", Scope::Project, "/files", &["purpose"]),
        ("assistant_list", Scope::Project, "/assistants", &[]),
        ("vector_store_list", Scope::Project, "/vector_stores", &[]),
        ("invite_list", Scope::Admin, "/organization/invites", &[]),
        ("user_list", Scope::Admin, "/organization/users", &[]),
        ("batch_list", Scope::Project, "/batches", &[]),
        ("fine_tuning_job_list", Scope::Project, "/fine_tuning/jobs", &[]),
    ];
    for (kind, scope, path, filters) in lists {
        registry.register(ListSource {
            platform: Arc::clone(platform),
            kind,
            scope,
            path,
            filters,
        });
    }
    registry.register(UserLookup {
        platform: Arc::clone(platform),
    });
}

/// Query parameter form of a filter value
fn param(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Array(items) => items.iter().map(param).collect::<Vec<_>>().join(","),
        other => other.to_string(),
    }
}

/// All items of a collection, optionally filtered
#[derive(Debug)]
pub struct ListSource {
    platform: Arc<Platform>,
    kind: &'static str,
    scope: Scope,
    path: &'static str,
    filters: &'static [&'static str],
}

impl ListSource {
    fn positive(declared: &Attributes, name: &str) -> Result<Option<u64>> {
        match declared.get(name) {
            None => Ok(None),
            Some(value) => value
                .as_u64()
                .filter(|n| *n > 0)
                .map(Some)
                .ok_or_else(|| Error::validation(format!("{name} must be a positive integer"))),
        }
    }
}

impl Controller for ListSource {
    fn kind(&self) -> &'static str {
        self.kind
    }

    fn schema(&self) -> &Schema {
        &LIST
    }

    fn lifecycle(&self) -> Lifecycle {
        Lifecycle::DataSource
    }

    fn validate(&self, declared: &Attributes) -> Result<()> {
        if let Some(unknown) = declared
            .keys()
            .find(|k| !LIST.names().chain(self.filters.iter().copied()).any(|n| n == k.as_str()))
        {
            return Err(Error::validation(format!(
                "{} does not accept attribute '{unknown}'",
                self.kind
            )));
        }
        if let Some(limit) = Self::positive(declared, "limit")?
            && limit > 100
        {
            return Err(Error::validation("limit must be at most 100"));
        }
        Self::positive(declared, "max_items").map(|_| ())
    }

    fn create(&self, declared: &Attributes) -> Result<Created> {
        let limit = Self::positive(declared, "limit")?
            .and_then(|l| u32::try_from(l).ok())
            .unwrap_or(DEFAULT_PAGE_SIZE);
        let max_items = Self::positive(declared, "max_items")?
            .and_then(|m| usize::try_from(m).ok())
            .unwrap_or(usize::MAX);

        let mut query = ListQuery::new().limit(limit);
        for filter in self.filters {
            if let Some(value) = declared.get(*filter) {
                query = query.param(*filter, param(value));
            }
        }

        let api = self.platform.api(self.scope)?;
        let items = api
            .list::<Value>(self.path, query)
            .take(max_items)
            .collect::<Result<Vec<_>>>()?;
        log::debug!("{} returned {} item(s)", self.kind, items.len());

        let ids: Vec<Value> = items.iter().filter_map(|i| i.get("id").cloned()).collect();
        let mut observed = Attributes::new();
        observed.insert("count".to_string(), Value::from(items.len()));
        observed.insert("ids".to_string(), Value::Array(ids));
        observed.insert("data".to_string(), Value::Array(items));
        Ok(Created {
            identity: self.path.to_string(),
            observed,
        })
    }

    fn read(&self, _identity: &str, prior: &Attributes) -> Result<Attributes> {
        Ok(prior.clone())
    }

    fn delete(&self, _identity: &str, _observed: &Attributes) -> Result<()> {
        Ok(())
    }
}

/// An organization member found by email.
///
/// This is the lookup step between an accepted invite and a project
/// membership: `project_user.user_id = "${lookup.id}"`.
#[derive(Debug)]
pub struct UserLookup {
    platform: Arc<Platform>,
}

impl Controller for UserLookup {
    fn kind(&self) -> &'static str {
        "user_lookup"
    }

    fn schema(&self) -> &Schema {
        &USER_LOOKUP
    }

    fn lifecycle(&self) -> Lifecycle {
        Lifecycle::DataSource
    }

    fn validate(&self, declared: &Attributes) -> Result<()> {
        super::only_known(self.kind(), declared, &USER_LOOKUP)?;
        required(declared, "email").map(|_| ())
    }

    fn create(&self, declared: &Attributes) -> Result<Created> {
        let email = required(declared, "email")?;
        let api = self.platform.api(Scope::Admin)?;
        let query = ListQuery::new().limit(DEFAULT_PAGE_SIZE);

        for user in api.list::<OrganizationUser>("/organization/users", query) {
            let user = user?;
            if user.email.eq_ignore_ascii_case(email) {
                return Ok(Created {
                    identity: user.id.clone(),
                    observed: object(serde_json::to_value(&user)?)?,
                });
            }
        }
        Err(Error::not_found(format!(
            "no organization user with email '{email}' (has the invite been accepted?)"
        )))
    }

    fn read(&self, _identity: &str, prior: &Attributes) -> Result<Attributes> {
        Ok(prior.clone())
    }

    fn delete(&self, _identity: &str, _observed: &Attributes) -> Result<()> {
        Ok(())
    }
}
