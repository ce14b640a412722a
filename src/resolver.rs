//! Contributor resolution
//!
//! Turns configuration-time contributor assignments (role / group / direct
//! user) into concrete user ids. Invoked identically during event
//! materialization and rollback resync. A role or group lookup miss silently
//! contributes zero users - an empty contributor set auto-approves the step.

use crate::config::{Approvable, ConfigStore};

pub struct ContributorResolver<'a> {
    config: &'a ConfigStore,
}

impl<'a> ContributorResolver<'a> {
    pub fn new(config: &'a ConfigStore) -> Self {
        Self { config }
    }

    /// Resolve one assignment into user ids.
    pub fn resolve(&self, approvable: &Approvable) -> anyhow::Result<Vec<String>> {
        let users = match approvable {
            Approvable::Role(role_id) => self
                .config
                .role(role_id)?
                .map(|role| role.users)
                .unwrap_or_default(),
            Approvable::Group(group_id) => self
                .config
                .group(group_id)?
                .map(|group| group.members)
                .unwrap_or_default(),
            Approvable::User(user_id) => vec![user_id.clone()],
        };
        Ok(users)
    }

    /// Resolve a component's full assignment list, deduplicated while keeping
    /// first-seen order.
    pub fn resolve_all(&self, approvables: &[Approvable]) -> anyhow::Result<Vec<String>> {
        let mut users = Vec::new();
        for approvable in approvables {
            for user_id in self.resolve(approvable)? {
                if !users.contains(&user_id) {
                    users.push(user_id);
                }
            }
        }
        Ok(users)
    }
}
