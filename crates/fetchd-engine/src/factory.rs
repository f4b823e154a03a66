//! Builds transfers from client requests.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use fetchd_types::metadata::TransferMetadata;
use fetchd_types::models::{GroupMember, TransferId};
use url::Url;

use crate::group::{GroupSpec, GroupTransfer};
use crate::single::{Destination, SingleSpec, SingleTransfer};
use crate::transfer::EngineContext;

const DEFAULT_FILE_NAME: &str = "data.download";

/// Identity and location granted to a new transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurePath {
    pub id: TransferId,
    pub root_path: PathBuf,
    pub is_confined: bool,
}

/// Decides where an owner may write.
pub trait PathPolicy: Send + Sync {
    fn secure_path(&self, owner: &str) -> SecurePath;
}

/// Every owner is unconfined and writes under one directory.
#[derive(Debug, Clone)]
pub struct DirectoryPolicy {
    root: PathBuf,
}

impl DirectoryPolicy {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl PathPolicy for DirectoryPolicy {
    fn secure_path(&self, _owner: &str) -> SecurePath {
        SecurePath {
            id: TransferId::new(),
            root_path: self.root.clone(),
            is_confined: false,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SingleRequest {
    pub url: String,
    pub hash: String,
    pub algorithm: String,
    pub metadata: TransferMetadata,
    pub headers: BTreeMap<String, String>,
    pub throttle: u64,
}

#[derive(Debug, Clone, Default)]
pub struct GroupRequest {
    pub members: Vec<GroupMember>,
    pub algorithm: String,
    pub allow_mobile: bool,
    pub metadata: TransferMetadata,
    pub headers: BTreeMap<String, String>,
    pub throttle: u64,
}

pub struct TransferFactory {
    ctx: EngineContext,
    policy: Arc<dyn PathPolicy>,
}

impl TransferFactory {
    pub fn new(ctx: EngineContext, policy: Arc<dyn PathPolicy>) -> Self {
        Self { ctx, policy }
    }

    pub fn create_single(&self, owner: &str, request: SingleRequest) -> SingleTransfer {
        let secure = self.policy.secure_path(owner);
        let destination = match &request.metadata.local_path {
            Some(path) if !secure.is_confined => Destination::Explicit(path.clone()),
            _ => Destination::Managed(secure.root_path.join(file_name_for(&request.url))),
        };

        SingleTransfer::new(
            SingleSpec {
                id: secure.id,
                owner: owner.to_string(),
                group_id: None,
                is_confined: secure.is_confined,
                root_path: secure.root_path,
                url: request.url,
                hash: request.hash,
                algorithm: request.algorithm,
                metadata: request.metadata,
                headers: request.headers,
                throttle: request.throttle,
                destination,
            },
            self.ctx.clone(),
        )
    }

    pub fn create_group(&self, owner: &str, request: GroupRequest) -> GroupTransfer {
        let secure = self.policy.secure_path(owner);
        // Members get the pass-through entries only; the command and path
        // override apply to the group as a whole.
        let member_metadata = TransferMetadata {
            extra: request.metadata.extra.clone(),
            ..TransferMetadata::default()
        };

        let children = request
            .members
            .iter()
            .map(|member| {
                self.create_for_group(
                    owner,
                    secure.is_confined,
                    &secure.root_path,
                    member,
                    &request.algorithm,
                    &member_metadata,
                    &request.headers,
                    &secure.id,
                )
            })
            .collect();

        GroupTransfer::new(
            GroupSpec {
                id: secure.id,
                owner: owner.to_string(),
                is_confined: secure.is_confined,
                root_path: secure.root_path,
                algorithm: request.algorithm,
                metadata: request.metadata,
                headers: request.headers,
                throttle: request.throttle,
                allow_mobile: request.allow_mobile,
            },
            children,
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn create_for_group(
        &self,
        owner: &str,
        is_confined: bool,
        root_path: &Path,
        member: &GroupMember,
        algorithm: &str,
        metadata: &TransferMetadata,
        headers: &BTreeMap<String, String>,
        group_id: &TransferId,
    ) -> SingleTransfer {
        let local = Path::new(&member.local_file);
        let destination = if local.is_absolute() && !is_confined {
            Destination::Explicit(local.to_path_buf())
        } else {
            let name = local
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| file_name_for(&member.url));
            Destination::Managed(root_path.join(name))
        };

        SingleTransfer::new(
            SingleSpec {
                id: TransferId::new(),
                owner: owner.to_string(),
                group_id: Some(group_id.clone()),
                is_confined,
                root_path: root_path.to_path_buf(),
                url: member.url.clone(),
                hash: member.hash.clone(),
                algorithm: algorithm.to_string(),
                metadata: metadata.clone(),
                headers: headers.clone(),
                throttle: 0,
                destination,
            },
            self.ctx.clone(),
        )
    }
}

/// Last path segment of `url`, or a fixed name when there is none.
fn file_name_for(url: &str) -> String {
    Url::parse(url)
        .ok()
        .and_then(|url| {
            url.path_segments()?
                .next_back()
                .filter(|segment| !segment.is_empty())
                .map(str::to_string)
        })
        .unwrap_or_else(|| DEFAULT_FILE_NAME.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::single::tests::Harness;
    use crate::transfer::Transfer;

    struct Confined(PathBuf);

    impl PathPolicy for Confined {
        fn secure_path(&self, _owner: &str) -> SecurePath {
            SecurePath {
                id: TransferId::new(),
                root_path: self.0.clone(),
                is_confined: true,
            }
        }
    }

    #[test]
    fn file_names_come_from_the_url() {
        assert_eq!(file_name_for("http://example.com/a/b/image.iso"), "image.iso");
        assert_eq!(file_name_for("http://example.com/"), "data.download");
        assert_eq!(file_name_for("http://example.com"), "data.download");
        assert_eq!(file_name_for("garbage"), "data.download");
    }

    #[test]
    fn managed_destination_lives_under_the_root() {
        let h = Harness::new();
        let factory = TransferFactory::new(h.ctx(), Arc::new(DirectoryPolicy::new(h.dir.path())));
        let t = factory.create_single(
            "owner",
            SingleRequest {
                url: "http://example.com/pkg.deb".into(),
                ..Default::default()
            },
        );
        assert!(t.core().is_valid());
        assert_eq!(t.file_path(), h.dir.path().join("pkg.deb"));
        assert_eq!(t.temp_file_path(), h.dir.path().join("pkg.deb.tmp"));
        assert!(h.names.is_locked(t.file_path()));
    }

    #[test]
    fn local_path_override_is_honored_when_unconfined() {
        let h = Harness::new();
        let target = h.dir.path().join("custom").join("name.bin");
        let request = SingleRequest {
            url: "http://example.com/pkg.deb".into(),
            metadata: TransferMetadata::default().with_local_path(&target),
            ..Default::default()
        };

        let unconfined = TransferFactory::new(h.ctx(), Arc::new(DirectoryPolicy::new(h.dir.path())));
        let t = unconfined.create_single("owner", request.clone());
        assert_eq!(t.file_path(), target);
        assert!(h.names.is_locked(t.temp_file_path()));
        assert!(!h.names.is_locked(t.file_path()));

        let confined = TransferFactory::new(h.ctx(), Arc::new(Confined(h.dir.path().join("jail"))));
        let t = confined.create_single("owner", request);
        assert_eq!(t.file_path(), h.dir.path().join("jail").join("pkg.deb"));
        assert!(t.core().is_confined());
    }

    #[test]
    fn group_members_share_the_group_identity() {
        let h = Harness::new();
        let factory = TransferFactory::new(h.ctx(), Arc::new(DirectoryPolicy::new(h.dir.path())));
        let group = factory.create_group(
            "owner",
            GroupRequest {
                members: vec![
                    GroupMember {
                        url: "http://example.com/a".into(),
                        local_file: "first.bin".into(),
                        hash: String::new(),
                    },
                    GroupMember {
                        url: "http://example.com/b".into(),
                        local_file: "/ignored/dir/second.bin".into(),
                        hash: "00".into(),
                    },
                ],
                algorithm: "md5".into(),
                allow_mobile: false,
                metadata: TransferMetadata::default()
                    .with_command(["true"])
                    .with_entry("title", "bundle"),
                ..Default::default()
            },
        );

        assert!(group.core().is_valid());
        assert!(!group.core().allows_mobile());
        let children = group.children();
        assert_eq!(children.len(), 2);
        for child in children {
            assert_eq!(child.group_id(), Some(group.core().id()));
            assert!(child.core().metadata().command.is_none());
            assert_eq!(child.core().metadata().get_str("title").as_deref(), Some("bundle"));
        }
        assert_eq!(children[0].file_path(), h.dir.path().join("first.bin"));
        assert_eq!(children[1].file_path(), Path::new("/ignored/dir/second.bin"));
    }
}
