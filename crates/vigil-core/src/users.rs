//! User and group provisioning for sandboxed applications.
//!
//! Each sandboxed application runs as its own OS user; supplementary groups
//! named in configuration are created on demand.

use std::process::Command;

use nix::unistd::{Gid, Group, Uid, User};
use vigil_common::constants::GROUPADD_CMD;
use vigil_common::error::{Result, VigilError};

/// Maps application names to OS identities and provisions groups.
pub trait UserRegistry {
    /// The unique OS user name an application runs as.
    fn user_name_for_app(&self, app_name: &str) -> String;

    /// Resolves the uid and primary gid for a user name.
    ///
    /// # Errors
    ///
    /// Returns [`VigilError::NotFound`] when the user does not exist.
    fn resolve_ids(&mut self, user_name: &str) -> Result<(Uid, Gid)>;

    /// Creates a supplementary group if it does not exist, returning its gid.
    ///
    /// # Errors
    ///
    /// Returns an error when the group can neither be found nor created.
    fn create_group(&mut self, group_name: &str) -> Result<Gid>;
}

/// The real registry, backed by the system user/group databases.
#[derive(Debug, Default)]
pub struct SystemUsers;

impl UserRegistry for SystemUsers {
    fn user_name_for_app(&self, app_name: &str) -> String {
        format!("app{app_name}")
    }

    fn resolve_ids(&mut self, user_name: &str) -> Result<(Uid, Gid)> {
        match User::from_name(user_name) {
            Ok(Some(user)) => Ok((user.uid, user.gid)),
            Ok(None) => Err(VigilError::NotFound {
                kind: "user",
                id: user_name.to_owned(),
            }),
            Err(e) => Err(VigilError::sys("getpwnam_r", e)),
        }
    }

    fn create_group(&mut self, group_name: &str) -> Result<Gid> {
        if let Some(group) = Group::from_name(group_name).map_err(|e| VigilError::sys("getgrnam_r", e))? {
            return Ok(group.gid);
        }

        let status = Command::new(GROUPADD_CMD)
            .arg("--system")
            .arg(group_name)
            .status()
            .map_err(|e| VigilError::Io {
                path: GROUPADD_CMD.into(),
                source: e,
            })?;
        if !status.success() {
            return Err(VigilError::fault(format!(
                "could not create group '{group_name}': {GROUPADD_CMD} exited with {status}"
            )));
        }

        Group::from_name(group_name)
            .map_err(|e| VigilError::sys("getgrnam_r", e))?
            .map(|group| group.gid)
            .ok_or_else(|| VigilError::NotFound {
                kind: "group",
                id: group_name.to_owned(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn app_user_names_are_prefixed() {
        let users = SystemUsers;
        assert_eq!(users.user_name_for_app("web"), "appweb");
        assert_eq!(users.user_name_for_app("modemService"), "appmodemService");
    }

    #[test]
    fn root_resolves_to_uid_zero() {
        let mut users = SystemUsers;
        let (uid, gid) = users.resolve_ids("root").expect("root exists");
        assert!(uid.is_root());
        assert_eq!(gid.as_raw(), 0);
    }

    #[test]
    fn unknown_user_is_not_found() {
        let mut users = SystemUsers;
        assert!(matches!(
            users.resolve_ids("no-such-user-vigil"),
            Err(VigilError::NotFound { kind: "user", .. })
        ));
    }
}
