//! Host to guest identity mapping
//!
//! The invoking user and group are mapped into the instance with the same
//! numeric ids, so artifacts pulled back out are owned by the caller.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

const FALLBACK_NAME: &str = "charms-builder";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityMapping {
    pub uid: u32,
    pub gid: u32,
    pub user: String,
    pub group: String,
    pub home: PathBuf,
    pub shell: PathBuf,
}

impl IdentityMapping {
    pub fn new(uid: u32, gid: u32, user: impl Into<String>, group: impl Into<String>) -> Self {
        let user = user.into();
        Self {
            uid,
            gid,
            home: PathBuf::from("/home").join(&user),
            user,
            group: group.into(),
            shell: PathBuf::from("/bin/bash"),
        }
    }

    /// The invoking process's user and group
    #[cfg(unix)]
    pub fn current() -> Self {
        use nix::unistd::{getgid, getuid, Group, User};

        let uid = getuid();
        let gid = getgid();
        let user = User::from_uid(uid).ok().flatten();
        let group = Group::from_gid(gid).ok().flatten();

        let mut mapping = Self::new(
            uid.as_raw(),
            gid.as_raw(),
            user.as_ref().map(|u| u.name.clone()).unwrap_or_else(|| FALLBACK_NAME.to_string()),
            group.map(|g| g.name).unwrap_or_else(|| FALLBACK_NAME.to_string()),
        );
        if let Some(user) = user {
            mapping.home = user.dir;
            if !user.shell.as_os_str().is_empty() {
                mapping.shell = user.shell;
            }
        }
        mapping
    }

    #[cfg(not(unix))]
    pub fn current() -> Self {
        Self::new(1000, 1000, FALLBACK_NAME, FALLBACK_NAME)
    }

    /// Value for the instance's `raw.idmap` key
    pub fn raw_idmap(&self) -> String {
        format!("uid {uid} {uid}\ngid {gid} {gid}", uid = self.uid, gid = self.gid)
    }

    pub fn groupadd_argv(&self) -> Vec<String> {
        vec![
            "groupadd".to_string(),
            "-g".to_string(),
            self.gid.to_string(),
            self.group.clone(),
        ]
    }

    pub fn useradd_argv(&self) -> Vec<String> {
        vec![
            "useradd".to_string(),
            "-d".to_string(),
            self.home.display().to_string(),
            "-g".to_string(),
            self.gid.to_string(),
            "-m".to_string(),
            "-s".to_string(),
            self.shell.display().to_string(),
            "-u".to_string(),
            self.uid.to_string(),
            self.user.clone(),
        ]
    }
}
