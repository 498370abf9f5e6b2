//! Mapping launch attributes to process credentials.

use nix::unistd::{Group, User};
use tracing::debug;

use tunsh_core::proto::SysProcAttrLinux;

/// Identity a child process runs as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Credential {
    pub uid: u32,
    pub gid: u32,
}

/// Name lookups used when resolving credentials.
pub trait Directory {
    fn user_id(&self, name: &str) -> Option<u32>;
    fn group_id(&self, name: &str) -> Option<u32>;
}

/// The host's passwd and group databases.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemDirectory;

impl Directory for SystemDirectory {
    fn user_id(&self, name: &str) -> Option<u32> {
        User::from_name(name).ok().flatten().map(|u| u.uid.as_raw())
    }

    fn group_id(&self, name: &str) -> Option<u32> {
        Group::from_name(name).ok().flatten().map(|g| g.gid.as_raw())
    }
}

/// Resolve the credential for `attrs` against the host databases.
pub fn credentials(attrs: &SysProcAttrLinux) -> Option<Credential> {
    credentials_with(attrs, &SystemDirectory)
}

/// Resolve the credential for `attrs`.
///
/// Returns `None` (inherit the server's identity) when no identity field is
/// set. Otherwise numeric ids are the starting point and names only fill in
/// while the uid is still 0:
/// - a group name replaces the gid
/// - a user name replaces the uid, and the gid follows it if still 0
///
/// Names that fail to resolve are ignored.
pub fn credentials_with(attrs: &SysProcAttrLinux, directory: &impl Directory) -> Option<Credential> {
    if attrs.uid == 0 && attrs.gid == 0 && attrs.username.is_empty() && attrs.groupname.is_empty() {
        return None;
    }

    let mut cred = Credential {
        uid: attrs.uid,
        gid: attrs.gid,
    };

    if cred.uid == 0 && !attrs.groupname.is_empty() {
        match directory.group_id(&attrs.groupname) {
            Some(gid) => cred.gid = gid,
            None => debug!(group = %attrs.groupname, "group lookup failed, ignoring"),
        }
    }

    if cred.uid == 0 && !attrs.username.is_empty() {
        match directory.user_id(&attrs.username) {
            Some(uid) => {
                cred.uid = uid;
                if cred.gid == 0 {
                    cred.gid = uid;
                }
            }
            None => debug!(user = %attrs.username, "user lookup failed, ignoring"),
        }
    }

    Some(cred)
}
