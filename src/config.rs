//! Approval workflow configuration store
//!
//! Static workflow definitions: flows, their approvals (parallel/sequential),
//! ordered step components with AND/OR aggregation rules, and the contributor
//! assignments per step. Read-mostly; the event engine snapshots this
//! configuration when an event is materialized and only re-reads it on
//! rollback.

use crate::error::ApprovalError;
use crate::utils;
use sled::Tree;

/// How an approval's steps relate to each other. Copied onto each event at
/// creation time.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowKind {
    #[n(0)]
    Parallel,
    #[n(1)]
    Sequential,
}

/// Aggregation rule for a single step: OR settles on any one contributor
/// action, AND needs all of them.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepRule {
    #[n(0)]
    And,
    #[n(1)]
    Or,
}

/// A contributor assignment on a configuration step. Resolved to concrete
/// user ids by the resolver at event creation and rollback time.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub enum Approvable {
    /// Every user currently holding the role.
    #[n(0)]
    Role(#[n(0)] String),
    /// Every member of the approval group.
    #[n(1)]
    Group(#[n(0)] String),
    /// A single user, referenced directly.
    #[n(2)]
    User(#[n(0)] String),
}

/// Named workflow template. The dictionary tree maps requestable type keys
/// onto flow ids, so one flow can serve several document types.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone)]
pub struct Flow {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub name: String,
}

/// Flow instantiation: carries the parallel/sequential kind and the ordered
/// step components. One per flow.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone)]
pub struct Approval {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub flow_id: String,
    #[n(2)]
    pub kind: FlowKind,
    #[n(3)]
    pub can_change: bool,
    #[n(4)]
    pub components: Vec<ApprovalComponent>,
}

/// Configuration-time step. `step` is the small sequential index assigned by
/// configuration ordering, not yet a bitmask.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone)]
pub struct ApprovalComponent {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub name: String,
    #[n(2)]
    pub step: u8,
    #[n(3)]
    pub rule: StepRule,
    #[n(4)]
    pub color: Option<String>,
    #[n(5)]
    pub can_drag: bool,
    #[n(6)]
    pub can_edit: bool,
    #[n(7)]
    pub can_delete: bool,
    #[n(8)]
    pub contributors: Vec<Approvable>,
}

/// Named set of users approvers can be drawn from.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone)]
pub struct ApprovalGroup {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub name: String,
    #[n(2)]
    pub members: Vec<String>,
}

/// A role and the users currently holding it. Full role management lives
/// outside this crate; the engine only needs the membership list.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone)]
pub struct Role {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub name: String,
    #[n(2)]
    pub users: Vec<String>,
}

/// Directory entry for actor validation.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone)]
pub struct User {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub name: String,
}

impl Flow {
    pub fn new(name: &str) -> anyhow::Result<Self> {
        Ok(Self {
            id: utils::new_uuid_to_bech32("flow_")?,
            name: name.to_string(),
        })
    }
}

impl Approval {
    pub fn new(flow_id: &str, kind: FlowKind) -> anyhow::Result<Self> {
        Ok(Self {
            id: utils::new_uuid_to_bech32("apr_")?,
            flow_id: flow_id.to_string(),
            kind,
            can_change: true,
            components: vec![],
        })
    }

    pub fn with_component(mut self, component: ApprovalComponent) -> Self {
        self.components.push(component);
        self
    }
}

impl ApprovalComponent {
    pub fn new(name: &str, step: u8, rule: StepRule) -> anyhow::Result<Self> {
        Ok(Self {
            id: utils::new_uuid_to_bech32("cmp_")?,
            name: name.to_string(),
            step,
            rule,
            color: None,
            can_drag: true,
            can_edit: true,
            can_delete: true,
            contributors: vec![],
        })
    }

    pub fn set_color(mut self, color: &str) -> Self {
        self.color = Some(color.to_string());
        self
    }

    pub fn with_contributor(mut self, approvable: Approvable) -> Self {
        self.contributors.push(approvable);
        self
    }
}

impl ApprovalGroup {
    pub fn new(name: &str, members: Vec<String>) -> anyhow::Result<Self> {
        Ok(Self {
            id: utils::new_uuid_to_bech32("grp_")?,
            name: name.to_string(),
            members,
        })
    }
}

impl Role {
    pub fn new(name: &str, users: Vec<String>) -> anyhow::Result<Self> {
        Ok(Self {
            id: utils::new_uuid_to_bech32("role_")?,
            name: name.to_string(),
            users,
        })
    }
}

impl User {
    pub fn new(name: &str) -> anyhow::Result<Self> {
        Ok(Self {
            id: utils::new_uuid_to_bech32("user_")?,
            name: name.to_string(),
        })
    }
}

/// sled-backed configuration store. One named tree per record family, rows
/// encoded as CBOR aggregates.
pub struct ConfigStore {
    flows: Tree,
    dictionary: Tree,
    approvals: Tree,
    approval_by_flow: Tree,
    groups: Tree,
    roles: Tree,
    users: Tree,
}

impl ConfigStore {
    pub fn open(db: &sled::Db) -> anyhow::Result<Self> {
        Ok(Self {
            flows: db.open_tree("flows")?,
            dictionary: db.open_tree("dictionary")?,
            approvals: db.open_tree("approvals")?,
            approval_by_flow: db.open_tree("approval_by_flow")?,
            groups: db.open_tree("groups")?,
            roles: db.open_tree("roles")?,
            users: db.open_tree("users")?,
        })
    }

    pub fn put_flow(&self, flow: &Flow) -> anyhow::Result<()> {
        put_cbor(&self.flows, flow.id.as_bytes(), flow)
    }

    pub fn flow(&self, id: &str) -> anyhow::Result<Option<Flow>> {
        get_cbor(&self.flows, id.as_bytes())
    }

    /// Map a requestable type key onto a flow. This is the Dictionary lookup
    /// the engine consults when it materializes an event.
    pub fn map_key(&self, key: &str, flow_id: &str) -> anyhow::Result<()> {
        self.dictionary.insert(key.as_bytes(), flow_id.as_bytes())?;
        Ok(())
    }

    pub fn unmap_key(&self, key: &str) -> anyhow::Result<()> {
        self.dictionary.remove(key.as_bytes())?;
        Ok(())
    }

    pub fn flow_for_key(&self, key: &str) -> anyhow::Result<Option<String>> {
        let found = self.dictionary.get(key.as_bytes())?;
        match found {
            Some(raw) => Ok(Some(String::from_utf8(raw.to_vec())?)),
            None => Ok(None),
        }
    }

    /// Store an approval and its flow index. Replaces any approval previously
    /// attached to the same flow (the relation is 1:1).
    pub fn put_approval(&self, approval: &Approval) -> anyhow::Result<()> {
        put_cbor(&self.approvals, approval.id.as_bytes(), approval)?;
        self.approval_by_flow
            .insert(approval.flow_id.as_bytes(), approval.id.as_bytes())?;
        Ok(())
    }

    pub fn approval(&self, id: &str) -> anyhow::Result<Option<Approval>> {
        get_cbor(&self.approvals, id.as_bytes())
    }

    pub fn approval_for_flow(&self, flow_id: &str) -> anyhow::Result<Option<Approval>> {
        let id = self.approval_by_flow.get(flow_id.as_bytes())?;
        match id {
            Some(raw) => get_cbor(&self.approvals, raw.as_ref()),
            None => Ok(None),
        }
    }

    pub fn put_group(&self, group: &ApprovalGroup) -> anyhow::Result<()> {
        put_cbor(&self.groups, group.id.as_bytes(), group)
    }

    pub fn group(&self, id: &str) -> anyhow::Result<Option<ApprovalGroup>> {
        get_cbor(&self.groups, id.as_bytes())
    }

    pub fn put_role(&self, role: &Role) -> anyhow::Result<()> {
        put_cbor(&self.roles, role.id.as_bytes(), role)
    }

    pub fn role(&self, id: &str) -> anyhow::Result<Option<Role>> {
        get_cbor(&self.roles, id.as_bytes())
    }

    pub fn put_user(&self, user: &User) -> anyhow::Result<()> {
        put_cbor(&self.users, user.id.as_bytes(), user)
    }

    pub fn user(&self, id: &str) -> anyhow::Result<Option<User>> {
        get_cbor(&self.users, id.as_bytes())
    }

    /// Actor check used before any mutating transition that names a user.
    pub fn require_user(&self, id: &str) -> anyhow::Result<()> {
        if self.users.contains_key(id.as_bytes())? {
            Ok(())
        } else {
            Err(ApprovalError::UnknownUser(id.to_string()).into())
        }
    }
}

fn put_cbor<T: minicbor::Encode<()>>(tree: &Tree, key: &[u8], value: &T) -> anyhow::Result<()> {
    let bytes = minicbor::to_vec(value)?;
    tree.insert(key, bytes)?;
    Ok(())
}

fn get_cbor<T: for<'b> minicbor::Decode<'b, ()>>(
    tree: &Tree,
    key: &[u8],
) -> anyhow::Result<Option<T>> {
    match tree.get(key)? {
        Some(raw) => Ok(Some(minicbor::decode(raw.as_ref())?)),
        None => Ok(None),
    }
}
