use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;
use ulid::Ulid;

use crate::node_store::{NodeStore, NodeStoreError};
use crate::{GroupId, Node, NodeId, UserId};

/// Group carrying role flags. Users derive their roles from the groups they
/// belong to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserGroup {
    pub id: GroupId,
    pub name: String,
    pub description: Option<String>,
    pub hidden_edit_functions: Vec<String>,
    pub is_editor_group: bool,
    pub is_workflow_editor_group: bool,
    pub is_admin_group: bool,
}

impl UserGroup {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Ulid::new(),
            name: name.into(),
            description: None,
            hidden_edit_functions: Vec::new(),
            is_editor_group: false,
            is_workflow_editor_group: false,
            is_admin_group: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub login_name: String,
    pub display_name: Option<String>,
    pub firstname: Option<String>,
    pub lastname: Option<String>,
    pub email: Option<String>,
    pub organisation: Option<String>,
    pub active: bool,
    pub can_change_password: bool,
    pub group_ids: Vec<GroupId>,
    pub home_dir: Option<NodeId>,
}

impl User {
    pub fn new(login_name: impl Into<String>) -> Self {
        Self {
            id: Ulid::new(),
            login_name: login_name.into(),
            display_name: None,
            firstname: None,
            lastname: None,
            email: None,
            organisation: None,
            active: true,
            can_change_password: false,
            group_ids: Vec::new(),
            home_dir: None,
        }
    }

    /// Display name, falling back to the login name.
    pub fn name(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.login_name)
    }
}

/// Purpose tag stored in `system_attrs["used_as"]` of a home's special directories.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpecialDir {
    Faulty,
    Upload,
    Trash,
}

impl SpecialDir {
    pub const ALL: [SpecialDir; 3] = [SpecialDir::Faulty, SpecialDir::Upload, SpecialDir::Trash];

    pub fn as_str(self) -> &'static str {
        match self {
            SpecialDir::Faulty => "faulty",
            SpecialDir::Upload => "upload",
            SpecialDir::Trash => "trash",
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdentityError {
    #[error("user {0} not found")]
    UserNotFound(UserId),
    #[error("group {0} not found")]
    GroupNotFound(GroupId),
    #[error("login name {0} already taken")]
    DuplicateLogin(String),
    #[error("group name {0} already taken")]
    DuplicateGroup(String),
    #[error("user {0} already has a home directory")]
    HomeExists(UserId),
    #[error(transparent)]
    Store(#[from] NodeStoreError),
}

/// Users and groups, with role flags derived from membership.
#[derive(Default, Debug, Clone, Serialize, Deserialize)]
pub struct UserDirectory {
    users: HashMap<UserId, User>,
    groups: HashMap<GroupId, UserGroup>,
}

impl UserDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_group(&mut self, group: UserGroup) -> Result<GroupId, IdentityError> {
        if self.groups.values().any(|g| g.name == group.name) {
            return Err(IdentityError::DuplicateGroup(group.name));
        }
        let id = group.id;
        self.groups.insert(id, group);
        Ok(id)
    }

    pub fn add_user(&mut self, user: User) -> Result<UserId, IdentityError> {
        if self.users.values().any(|u| u.login_name == user.login_name) {
            return Err(IdentityError::DuplicateLogin(user.login_name));
        }
        for group_id in &user.group_ids {
            self.group(*group_id)?;
        }
        let id = user.id;
        self.users.insert(id, user);
        Ok(id)
    }

    pub fn add_to_group(&mut self, user_id: UserId, group_id: GroupId) -> Result<(), IdentityError> {
        self.group(group_id)?;
        let user = self
            .users
            .get_mut(&user_id)
            .ok_or(IdentityError::UserNotFound(user_id))?;
        if !user.group_ids.contains(&group_id) {
            user.group_ids.push(group_id);
        }
        Ok(())
    }

    pub fn user(&self, id: UserId) -> Result<&User, IdentityError> {
        self.users.get(&id).ok_or(IdentityError::UserNotFound(id))
    }

    pub fn group(&self, id: GroupId) -> Result<&UserGroup, IdentityError> {
        self.groups.get(&id).ok_or(IdentityError::GroupNotFound(id))
    }

    pub fn user_by_login(&self, login_name: &str) -> Option<&User> {
        self.users.values().find(|u| u.login_name == login_name)
    }

    pub fn group_by_name(&self, name: &str) -> Option<&UserGroup> {
        self.groups.values().find(|g| g.name == name)
    }

    /// The configured guest account, if it exists.
    pub fn guest(&self, guest_login: &str) -> Option<&User> {
        self.user_by_login(guest_login)
    }

    pub fn groups_of<'a>(&'a self, user: &'a User) -> impl Iterator<Item = &'a UserGroup> + 'a {
        user.group_ids.iter().filter_map(|id| self.groups.get(id))
    }

    pub fn is_admin(&self, user: &User) -> bool {
        self.groups_of(user).any(|g| g.is_admin_group)
    }

    pub fn is_editor(&self, user: &User) -> bool {
        self.groups_of(user).any(|g| g.is_editor_group)
    }

    pub fn is_workflow_editor(&self, user: &User) -> bool {
        self.groups_of(user).any(|g| g.is_workflow_editor_group)
    }

    pub fn hidden_edit_functions(&self, user: &User) -> Vec<String> {
        self.groups_of(user)
            .flat_map(|g| g.hidden_edit_functions.iter().cloned())
            .collect()
    }

    /// Create the user's home directory below `home_container`, including the
    /// faulty, upload and trash directories.
    pub fn create_home_dir(
        &mut self,
        user_id: UserId,
        store: &mut NodeStore,
        home_container: NodeId,
    ) -> Result<NodeId, IdentityError> {
        let user = self.user(user_id)?;
        if user.home_dir.is_some() {
            return Err(IdentityError::HomeExists(user_id));
        }
        let login_name = user.login_name.clone();

        let home = store.create_node("directory", login_name.clone())?;
        store.link(home_container, home)?;
        for special in SpecialDir::ALL {
            let mut dir = Node::new("directory", special.as_str());
            dir.set_system_attr("used_as", special.as_str());
            let dir_id = store.insert_node(dir)?;
            store.link(home, dir_id)?;
        }

        if let Some(user) = self.users.get_mut(&user_id) {
            user.home_dir = Some(home);
        }
        info!(login = %login_name, user = %user_id, "created home dir");
        Ok(home)
    }

    pub fn special_dir<'s>(
        &self,
        user: &User,
        store: &'s NodeStore,
        which: SpecialDir,
    ) -> Option<&'s Node> {
        let home = user.home_dir?;
        store
            .children(home)
            .into_iter()
            .find(|n| n.system_attr("used_as") == Some(which.as_str()))
    }

    pub fn upload_dir<'s>(&self, user: &User, store: &'s NodeStore) -> Option<&'s Node> {
        self.special_dir(user, store, SpecialDir::Upload)
    }

    pub fn faulty_dir<'s>(&self, user: &User, store: &'s NodeStore) -> Option<&'s Node> {
        self.special_dir(user, store, SpecialDir::Faulty)
    }

    pub fn trash_dir<'s>(&self, user: &User, store: &'s NodeStore) -> Option<&'s Node> {
        self.special_dir(user, store, SpecialDir::Trash)
    }

    /// Clear home directory references to a deleted node.
    pub fn forget_node(&mut self, node: NodeId) {
        for user in self.users.values_mut() {
            if user.home_dir == Some(node) {
                user.home_dir = None;
                info!(login = %user.login_name, %node, "home dir removed");
            }
        }
    }
}
