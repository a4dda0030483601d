//! Cross-host replica management
//!
//! Replication is snapshot-shipping: the active copy is snapshotted
//! under a per-replica reserved tag and sent over SSH with
//! `zfs send | zfs receive`. The receiving side keeps the last applied
//! tag as its incremental baseline; the baseline only advances after a
//! transfer succeeds, so a failed sync can always resume from the old
//! one. Promotion reports one entry per replica and isolates failures,
//! ending with exactly one active copy even when siblings cannot be
//! reached.

use crate::driver::ZfsDriver;
use crate::store::keys;
use tracing::{debug, warn};
use zshare_common::{
    AccessRule, AccessRulesStatus, Error, Replica, ReplicaState, ReplicaUpdate, Result,
    ShareServer,
};
use zshare_exec::parse_table;

/// The single replica currently holding the active role.
///
/// Zero or several active replicas means the orchestrator's view and
/// ours diverged; nothing sane can be replicated from that state.
pub fn get_active_replica(replica_list: &[Replica]) -> Result<&Replica> {
    let mut actives = replica_list.iter().filter(|r| r.is_active());
    match (actives.next(), actives.next()) {
        (Some(active), None) => Ok(active),
        (None, _) => Err(Error::replication("no active replica found")),
        (Some(_), Some(_)) => Err(Error::replication("more than one active replica found")),
    }
}

fn pool_root(dataset_name: &str) -> &str {
    dataset_name.split('/').next().unwrap_or(dataset_name)
}

fn reject_share_server(share_server: Option<&ShareServer>) -> Result<()> {
    match share_server {
        None => Ok(()),
        Some(server) => Err(Error::invalid_request(format!(
            "share server `{}` passed to a host-less backend",
            server.id
        ))),
    }
}

fn set_state(updates: &mut [ReplicaUpdate], id: &str, state: ReplicaState) {
    if let Some(entry) = updates.iter_mut().find(|u| u.id == id) {
        entry.replica_state = Some(state);
    }
}

impl ZfsDriver {
    fn stored(&self, entity_id: &str, key: &str) -> Result<String> {
        self.store.get(entity_id, key).ok_or_else(|| {
            Error::replication(format!("no `{key}` recorded for replica `{entity_id}`"))
        })
    }

    /// Seed a new replica from the active copy.
    ///
    /// Takes a fresh replication snapshot on the source, ships the full
    /// stream here and leaves the new dataset read-only with read-only
    /// exports.
    pub fn create_replica(
        &self,
        replica_list: &[Replica],
        new_replica: &Replica,
        access_rules: &[AccessRule],
        share_server: Option<&ShareServer>,
    ) -> Result<ReplicaUpdate> {
        reject_share_server(share_server)?;
        let active = get_active_replica(replica_list)?;
        let src_dataset = self.stored(&active.id, keys::DATASET_NAME)?;
        let ssh_to_src = self.stored(&active.id, keys::SSH_CMD)?;
        let pool = new_replica.pool()?;
        let dst_dataset = self.names.dataset_name(pool, &new_replica.id)?;
        let ssh_cmd = self.config.service_ssh_target();

        let snapshot_tag = self.names.replication_snapshot_tag(&new_replica.id);
        let src_snapshot = format!("{src_dataset}@{snapshot_tag}");
        self.executor
            .execute(&["ssh", &ssh_to_src, "sudo", "zfs", "snapshot", &src_snapshot])?;
        self.executor.execute(&[
            "ssh",
            &ssh_to_src,
            "sudo",
            "zfs",
            "send",
            "-vDR",
            &src_snapshot,
            "|",
            "ssh",
            &ssh_cmd,
            "sudo",
            "zfs",
            "receive",
            "-v",
            &dst_dataset,
        ])?;

        self.zfs(&["set", "readonly=on", &dst_dataset])?;
        // the quota mirrors the copy being replicated, not whatever
        // size the orchestrator recorded for the new replica
        self.set_quota(&dst_dataset, active.size_gb)?;

        self.store.update(
            &new_replica.id,
            &[
                (keys::ENTITY_TYPE, "replica"),
                (keys::DATASET_NAME, &dst_dataset),
                (keys::POOL_NAME, pool),
                (keys::SSH_CMD, &ssh_cmd),
                (keys::REPL_SNAPSHOT_TAG, &snapshot_tag),
            ],
        );
        self.store
            .update(&active.id, &[(keys::REPL_SNAPSHOT_TAG, &snapshot_tag)]);

        let helper = self.helpers.get(&new_replica.share_proto)?;
        helper.update_access(&dst_dataset, access_rules, &[], &[], true)?;
        let export_locations = helper.create_exports(&dst_dataset)?;

        Ok(ReplicaUpdate {
            id: new_replica.id.clone(),
            replica_state: Some(ReplicaState::InSync),
            access_rules_status: AccessRulesStatus::Active,
            export_locations: Some(export_locations),
        })
    }

    /// Tear down a replica's dataset and its snapshots. An already
    /// absent dataset is logged and treated as deleted.
    pub fn delete_replica(
        &self,
        replica: &Replica,
        share_server: Option<&ShareServer>,
    ) -> Result<()> {
        reject_share_server(share_server)?;
        let pool = match self.store.get(&replica.id, keys::POOL_NAME) {
            Some(pool) => pool,
            None => replica.pool()?.to_string(),
        };
        let dataset_name = match self.store.get(&replica.id, keys::DATASET_NAME) {
            Some(name) => name,
            None => self.names.dataset_name(&pool, &replica.id)?,
        };

        let out = self.zfs(&["list", "-r", "-t", "snapshot", &pool])?;
        let snapshot_prefix = format!("{dataset_name}@");
        for row in parse_table(&out.stdout)? {
            if row.name().starts_with(&snapshot_prefix) {
                self.delete_dataset_or_snapshot_with_retry(row.name())?;
            }
        }

        let out = self.zfs(&["list", "-r", &pool])?;
        let present = parse_table(&out.stdout)?
            .iter()
            .any(|row| row.name() == dataset_name);
        if present {
            self.helpers
                .get(&replica.share_proto)?
                .remove_exports(&dataset_name)?;
            self.delete_dataset_or_snapshot_with_retry(&dataset_name)?;
        } else {
            warn!(
                replica_id = %replica.id,
                dataset = %dataset_name,
                "replica dataset not found on deletion, considering it gone"
            );
        }
        self.store.delete(&replica.id);
        Ok(())
    }

    /// Resync a replica from the active copy and report its state.
    ///
    /// Ships an incremental stream from the replica's recorded baseline
    /// to a fresh source snapshot, then prunes replication snapshots
    /// older than the new baseline on both sides. Pruning failures are
    /// logged and do not fail the sync.
    pub fn update_replica_state(
        &self,
        replica_list: &[Replica],
        replica: &Replica,
        access_rules: &[AccessRule],
        share_server: Option<&ShareServer>,
    ) -> Result<ReplicaState> {
        reject_share_server(share_server)?;
        let active = get_active_replica(replica_list)?;
        let src_dataset = self.stored(&active.id, keys::DATASET_NAME)?;
        let ssh_to_src = self.stored(&active.id, keys::SSH_CMD)?;
        let dst_dataset = self.stored(&replica.id, keys::DATASET_NAME)?;
        let previous_tag = self.stored(&replica.id, keys::REPL_SNAPSHOT_TAG)?;
        let ssh_cmd = self.config.service_ssh_target();

        let snapshot_tag = self.names.replication_snapshot_tag(&replica.id);
        let src_snapshot = format!("{src_dataset}@{snapshot_tag}");
        self.executor
            .execute(&["ssh", &ssh_to_src, "sudo", "zfs", "snapshot", &src_snapshot])?;
        self.zfs(&["set", "readonly=on", &dst_dataset])?;
        self.executor.execute(&[
            "ssh",
            &ssh_to_src,
            "sudo",
            "zfs",
            "send",
            "-vDRI",
            &previous_tag,
            &src_snapshot,
            "|",
            "ssh",
            &ssh_cmd,
            "sudo",
            "zfs",
            "receive",
            "-vF",
            &dst_dataset,
        ])?;

        // the baseline advances only after the stream applied
        self.store
            .update(&replica.id, &[(keys::REPL_SNAPSHOT_TAG, &snapshot_tag)]);
        self.store
            .update(&active.id, &[(keys::REPL_SNAPSHOT_TAG, &snapshot_tag)]);

        self.helpers.get(&replica.share_proto)?.update_access(
            &dst_dataset,
            access_rules,
            &[],
            &[],
            true,
        )?;

        self.prune_local_replication_snapshots(&replica.id, &dst_dataset, &snapshot_tag)?;
        self.prune_source_replication_snapshots(
            &replica.id,
            &ssh_to_src,
            &src_dataset,
            &snapshot_tag,
        )?;

        Ok(ReplicaState::InSync)
    }

    /// Drop replication snapshots of this replica's class on the local
    /// dataset, keeping the current baseline.
    fn prune_local_replication_snapshots(
        &self,
        replica_id: &str,
        dataset_name: &str,
        keep_tag: &str,
    ) -> Result<()> {
        let out = self.zfs(&["list", "-r", "-t", "snapshot", pool_root(dataset_name)])?;
        let class_prefix = format!(
            "{dataset_name}@{}",
            self.names.replication_snapshot_prefix(replica_id)
        );
        let keep = format!("{dataset_name}@{keep_tag}");
        for row in parse_table(&out.stdout)? {
            let name = row.name();
            if name.starts_with(&class_prefix) && name != keep {
                if let Err(err) = self.delete_dataset_or_snapshot_with_retry(name) {
                    warn!(snapshot = %name, %err, "could not prune stale replication snapshot");
                }
            }
        }
        Ok(())
    }

    /// Same pruning on the source host, over SSH
    fn prune_source_replication_snapshots(
        &self,
        replica_id: &str,
        ssh_to_src: &str,
        src_dataset: &str,
        keep_tag: &str,
    ) -> Result<()> {
        let out = self.executor.execute(&[
            "ssh",
            ssh_to_src,
            "sudo",
            "zfs",
            "list",
            "-r",
            "-t",
            "snapshot",
            pool_root(src_dataset),
        ])?;
        let class_prefix = format!(
            "{src_dataset}@{}",
            self.names.replication_snapshot_prefix(replica_id)
        );
        let keep = format!("{src_dataset}@{keep_tag}");
        for row in parse_table(&out.stdout)? {
            let name = row.name();
            if name.starts_with(&class_prefix) && name != keep {
                let destroy = ["ssh", ssh_to_src, "sudo", "zfs", "destroy", "-f", name];
                if let Err(err) = self.executor.execute_with_retry(&destroy) {
                    warn!(snapshot = %name, %err, "could not prune stale source replication snapshot");
                }
            }
        }
        Ok(())
    }

    /// Make `replica` the active copy, reporting one entry per replica.
    ///
    /// When the outgoing active copy is reachable it is frozen
    /// read-only, snapshotted, and the snapshot is fanned out to every
    /// other replica; when it is not, the promoted replica's current
    /// content becomes the new baseline and is fanned out instead. A
    /// sibling that fails to receive is marked out of sync with its
    /// baseline kept; it never aborts the promotion. Every entry except
    /// the promoted one reports its access rules out of sync, since
    /// read-only downgrades cannot be applied reliably mid-failover.
    pub fn promote_replica(
        &self,
        replica_list: &[Replica],
        replica: &Replica,
        access_rules: &[AccessRule],
        share_server: Option<&ShareServer>,
    ) -> Result<Vec<ReplicaUpdate>> {
        reject_share_server(share_server)?;
        let active = get_active_replica(replica_list)?;
        let dst_dataset = self.stored(&replica.id, keys::DATASET_NAME)?;

        let mut updates: Vec<ReplicaUpdate> = replica_list
            .iter()
            .map(|r| ReplicaUpdate {
                id: r.id.clone(),
                replica_state: None,
                access_rules_status: AccessRulesStatus::OutOfSync,
                export_locations: None,
            })
            .collect();

        if let Err(err) = self.fan_out_from_active(replica_list, active, &mut updates) {
            warn!(
                active_id = %active.id,
                %err,
                "active replica unreachable, promoting from local content"
            );
            self.fan_out_from_promoted(replica_list, active, replica, &dst_dataset, &mut updates)?;
            set_state(&mut updates, &active.id, ReplicaState::OutOfSync);
        }

        self.zfs(&["set", "readonly=off", &dst_dataset])?;
        set_state(&mut updates, &replica.id, ReplicaState::Active);
        match self.helpers.get(&replica.share_proto)?.update_access(
            &dst_dataset,
            access_rules,
            &[],
            &[],
            false,
        ) {
            Ok(()) => {
                if let Some(entry) = updates.iter_mut().find(|u| u.id == replica.id) {
                    entry.access_rules_status = AccessRulesStatus::Active;
                }
            }
            Err(err) => {
                warn!(replica_id = %replica.id, %err, "could not apply access rules on promotion");
            }
        }
        Ok(updates)
    }

    /// Freeze the active copy, snapshot it and ship the increment to
    /// every other replica. Fails only when the source itself cannot be
    /// frozen or snapshotted.
    fn fan_out_from_active(
        &self,
        replica_list: &[Replica],
        active: &Replica,
        updates: &mut [ReplicaUpdate],
    ) -> Result<()> {
        let src_dataset = self.stored(&active.id, keys::DATASET_NAME)?;
        let ssh_to_src = self.stored(&active.id, keys::SSH_CMD)?;
        self.executor.execute(&[
            "ssh",
            &ssh_to_src,
            "sudo",
            "zfs",
            "set",
            "readonly=on",
            &src_dataset,
        ])?;
        let snapshot_tag = self.names.replication_snapshot_tag(&active.id);
        let src_snapshot = format!("{src_dataset}@{snapshot_tag}");
        self.executor
            .execute(&["ssh", &ssh_to_src, "sudo", "zfs", "snapshot", &src_snapshot])?;

        for sibling in replica_list.iter().filter(|r| r.id != active.id) {
            match self.receive_increment(&ssh_to_src, &src_snapshot, sibling) {
                Ok(()) => {
                    self.store
                        .update(&sibling.id, &[(keys::REPL_SNAPSHOT_TAG, &snapshot_tag)]);
                }
                Err(err) => {
                    warn!(
                        replica_id = %sibling.id,
                        %err,
                        "replica missed the promotion snapshot"
                    );
                    set_state(updates, &sibling.id, ReplicaState::OutOfSync);
                }
            }
        }
        self.store
            .update(&active.id, &[(keys::REPL_SNAPSHOT_TAG, &snapshot_tag)]);
        set_state(updates, &active.id, ReplicaState::InSync);
        Ok(())
    }

    /// Incremental `send | receive` from the source host to one
    /// replica's backend, resuming from that replica's baseline.
    fn receive_increment(
        &self,
        ssh_to_src: &str,
        src_snapshot: &str,
        sibling: &Replica,
    ) -> Result<()> {
        let previous_tag = self.stored(&sibling.id, keys::REPL_SNAPSHOT_TAG)?;
        let dataset_name = self.stored(&sibling.id, keys::DATASET_NAME)?;
        let ssh_cmd = self.stored(&sibling.id, keys::SSH_CMD)?;
        self.executor.execute(&[
            "ssh",
            ssh_to_src,
            "sudo",
            "zfs",
            "send",
            "-vDRI",
            &previous_tag,
            src_snapshot,
            "|",
            "ssh",
            &ssh_cmd,
            "sudo",
            "zfs",
            "receive",
            "-vF",
            &dataset_name,
        ])?;
        Ok(())
    }

    /// Fallback fan-out when the active copy is gone: snapshot the
    /// promoted replica's local dataset and ship it fully to the
    /// remaining replicas.
    fn fan_out_from_promoted(
        &self,
        replica_list: &[Replica],
        active: &Replica,
        promoted: &Replica,
        dst_dataset: &str,
        updates: &mut [ReplicaUpdate],
    ) -> Result<()> {
        let snapshot_tag = self.names.replication_snapshot_tag(&promoted.id);
        let dst_snapshot = format!("{dst_dataset}@{snapshot_tag}");
        self.zfs(&["snapshot", &dst_snapshot])?;
        self.store
            .update(&promoted.id, &[(keys::REPL_SNAPSHOT_TAG, &snapshot_tag)]);

        for sibling in replica_list
            .iter()
            .filter(|r| r.id != active.id && r.id != promoted.id)
        {
            let sent = self
                .stored(&sibling.id, keys::DATASET_NAME)
                .and_then(|dataset_name| {
                    let ssh_cmd = self.stored(&sibling.id, keys::SSH_CMD)?;
                    self.shell(
                        &[
                            "zfs",
                            "send",
                            "-vDR",
                            &dst_snapshot,
                            "|",
                            "ssh",
                            &ssh_cmd,
                            "sudo",
                            "zfs",
                            "receive",
                            "-vF",
                            &dataset_name,
                        ],
                        true,
                    )?;
                    Ok(())
                });
            match sent {
                Ok(()) => {
                    self.store
                        .update(&sibling.id, &[(keys::REPL_SNAPSHOT_TAG, &snapshot_tag)]);
                    debug!(replica_id = %sibling.id, "replica reseeded from promoted copy");
                }
                Err(err) => {
                    warn!(
                        replica_id = %sibling.id,
                        %err,
                        "replica missed the promotion snapshot"
                    );
                    set_state(updates, &sibling.id, ReplicaState::OutOfSync);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::EntityStore;
    use crate::test_support::{build_driver, name_answer, test_config, value_answer, FAKE_EXPORT};

    const SRC_SSH: &str = "fake_user@240.1.1.1";

    fn replica(id: &str, pool: &str, state: Option<ReplicaState>) -> Replica {
        Replica {
            id: id.to_string(),
            host: format!("hostname@backend#{pool}"),
            size_gb: 5,
            share_proto: "NFS".to_string(),
            replica_state: state,
        }
    }

    fn seed(
        store: &dyn EntityStore,
        id: &str,
        dataset_name: &str,
        ssh_cmd: &str,
        tag: Option<&str>,
    ) {
        store.update(
            id,
            &[
                (keys::DATASET_NAME, dataset_name),
                (keys::POOL_NAME, pool_root(dataset_name)),
                (keys::SSH_CMD, ssh_cmd),
            ],
        );
        if let Some(tag) = tag {
            store.update(id, &[(keys::REPL_SNAPSHOT_TAG, tag)]);
        }
    }

    #[test]
    fn test_get_active_replica() {
        let active = replica("a", "foo", Some(ReplicaState::Active));
        let secondary = replica("b", "bar", Some(ReplicaState::InSync));
        let list = [secondary.clone(), active.clone()];
        assert_eq!(get_active_replica(&list).unwrap().id, "a");

        let err = get_active_replica(&[secondary.clone()]).unwrap_err();
        assert!(matches!(err, Error::Replication(_)));

        let err = get_active_replica(&[active.clone(), active]).unwrap_err();
        assert!(matches!(err, Error::Replication(_)));
    }

    #[test]
    fn test_create_replica() {
        let t = build_driver(test_config());
        let active = replica("active-id", "foo", Some(ReplicaState::Active));
        let new = replica("new-id", "bar", None);
        seed(&*t.store, "active-id", "foo/share_active_id", SRC_SSH, None);

        let update = t
            .driver
            .create_replica(&[active, new.clone()], &new, &[], None)
            .unwrap();

        let lines = t.executor.call_lines();
        assert_eq!(lines.len(), 4);
        let snap_prefix = format!(
            "ssh {SRC_SSH} sudo zfs snapshot foo/share_active_id@tmp_snapshot_for_replication__new_id_time_"
        );
        assert!(lines[0].starts_with(&snap_prefix), "got {}", lines[0]);
        assert!(
            lines[1].starts_with(&format!(
                "ssh {SRC_SSH} sudo zfs send -vDR foo/share_active_id@tmp_snapshot_for_replication__new_id"
            )),
            "got {}",
            lines[1]
        );
        assert!(
            lines[1].ends_with(
                "| ssh fake_username@2.2.2.2 sudo zfs receive -v bar/subbar/share_new_id"
            ),
            "got {}",
            lines[1]
        );
        assert_eq!(lines[2], "zfs set readonly=on bar/subbar/share_new_id");
        assert_eq!(lines[3], "zfs set quota=5G bar/subbar/share_new_id");

        assert_eq!(
            t.helper.call_lines(),
            [
                "update_access bar/subbar/share_new_id make_all_ro=true",
                "create_exports bar/subbar/share_new_id",
            ]
        );

        assert_eq!(update.id, "new-id");
        assert_eq!(update.replica_state, Some(ReplicaState::InSync));
        assert_eq!(update.access_rules_status, AccessRulesStatus::Active);
        assert_eq!(update.export_locations, Some(vec![FAKE_EXPORT.to_string()]));

        let new_tag = t.store.get("new-id", keys::REPL_SNAPSHOT_TAG).unwrap();
        assert!(new_tag.starts_with("tmp_snapshot_for_replication__new_id_time_"));
        assert_eq!(
            t.store.get("active-id", keys::REPL_SNAPSHOT_TAG).as_deref(),
            Some(new_tag.as_str())
        );
        assert_eq!(
            t.store.get("new-id", keys::DATASET_NAME).as_deref(),
            Some("bar/subbar/share_new_id")
        );
    }

    #[test]
    fn test_create_replica_quota_follows_active_size() {
        let t = build_driver(test_config());
        let active = replica("active-id", "foo", Some(ReplicaState::Active));
        let new = Replica {
            size_gb: 3,
            ..replica("new-id", "bar", None)
        };
        seed(&*t.store, "active-id", "foo/share_active_id", SRC_SSH, None);

        t.driver
            .create_replica(&[active, new.clone()], &new, &[], None)
            .unwrap();

        let lines = t.executor.call_lines();
        assert!(
            lines.contains(&"zfs set quota=5G bar/subbar/share_new_id".to_string()),
            "got {lines:?}"
        );
        assert!(!lines.iter().any(|l| l.contains("quota=3G")));
    }

    #[test]
    fn test_create_replica_without_active() {
        let t = build_driver(test_config());
        let new = replica("new-id", "bar", None);
        let err = t
            .driver
            .create_replica(&[new.clone()], &new, &[], None)
            .unwrap_err();
        assert!(matches!(err, Error::Replication(_)));
        assert!(t.executor.call_lines().is_empty());
    }

    #[test]
    fn test_update_replica_state() {
        let t = build_driver(test_config());
        let active = replica("active-id", "foo", Some(ReplicaState::Active));
        let r2 = replica("r2", "bar", Some(ReplicaState::OutOfSync));
        let old_tag = "tmp_snapshot_for_replication__r2_time_old";
        seed(&*t.store, "active-id", "foo/share_active_id", SRC_SSH, None);
        seed(
            &*t.store,
            "r2",
            "bar/subbar/share_r2",
            "fake_username@2.2.2.2",
            Some(old_tag),
        );

        let stale_dst = format!("bar/subbar/share_r2@{old_tag}");
        let stale_src = format!("foo/share_active_id@{old_tag}");
        t.executor.push_ok(""); // source snapshot
        t.executor.push_ok(""); // readonly=on
        t.executor.push_ok(""); // send | receive
        t.executor.push_ok(&name_answer(&[
            &stale_dst,
            "bar/subbar/share_r2@snapshot_user",
            "bar/subbar/share_other@tmp_snapshot_for_replication__r2_time_old",
        ]));
        t.executor
            .push_ok(&value_answer(&stale_dst, "mountpoint", "-"));
        t.executor.push_ok(""); // destroy stale dst snapshot
        t.executor.push_ok(&name_answer(&[
            &stale_src,
            "foo/share_active_id@snapshot_user",
        ]));

        let state = t
            .driver
            .update_replica_state(&[active, r2.clone()], &r2, &[], None)
            .unwrap();
        assert_eq!(state, ReplicaState::InSync);

        let lines = t.executor.call_lines();
        assert_eq!(lines.len(), 7);
        assert!(lines[0].starts_with(&format!(
            "ssh {SRC_SSH} sudo zfs snapshot foo/share_active_id@tmp_snapshot_for_replication__r2_time_"
        )));
        assert_eq!(lines[1], "zfs set readonly=on bar/subbar/share_r2");
        assert!(
            lines[2].starts_with(&format!(
                "ssh {SRC_SSH} sudo zfs send -vDRI {old_tag} foo/share_active_id@"
            )),
            "got {}",
            lines[2]
        );
        assert!(lines[2]
            .ends_with("| ssh fake_username@2.2.2.2 sudo zfs receive -vF bar/subbar/share_r2"));
        assert_eq!(lines[3], "zfs list -r -t snapshot bar");
        assert_eq!(lines[4], format!("zfs get mountpoint {stale_dst}"));
        assert_eq!(lines[5], format!("zfs destroy -f {stale_dst}"));
        assert_eq!(lines[6], format!("ssh {SRC_SSH} sudo zfs list -r -t snapshot foo"));

        assert_eq!(
            t.executor.retry_call_lines(),
            [format!("ssh {SRC_SSH} sudo zfs destroy -f {stale_src}")]
        );
        assert_eq!(
            t.helper.call_lines(),
            ["update_access bar/subbar/share_r2 make_all_ro=true"]
        );

        let new_tag = t.store.get("r2", keys::REPL_SNAPSHOT_TAG).unwrap();
        assert_ne!(new_tag, old_tag);
        assert_eq!(
            t.store.get("active-id", keys::REPL_SNAPSHOT_TAG).as_deref(),
            Some(new_tag.as_str())
        );
    }

    #[test]
    fn test_update_replica_state_survives_prune_failure() {
        let t = build_driver(test_config());
        let active = replica("active-id", "foo", Some(ReplicaState::Active));
        let r2 = replica("r2", "bar", Some(ReplicaState::OutOfSync));
        let old_tag = "tmp_snapshot_for_replication__r2_time_old";
        seed(&*t.store, "active-id", "foo/share_active_id", SRC_SSH, None);
        seed(
            &*t.store,
            "r2",
            "bar/subbar/share_r2",
            "fake_username@2.2.2.2",
            Some(old_tag),
        );

        let stale_src = format!("foo/share_active_id@{old_tag}");
        t.executor.push_ok(""); // source snapshot
        t.executor.push_ok(""); // readonly=on
        t.executor.push_ok(""); // send | receive
        t.executor.push_ok(&name_answer(&[])); // no stale local snapshots
        t.executor.push_ok(&name_answer(&[&stale_src]));
        t.executor
            .push_retry_err("cannot destroy 'foo/share_active_id': dataset is busy\n");

        let state = t
            .driver
            .update_replica_state(&[active, r2.clone()], &r2, &[], None)
            .unwrap();
        assert_eq!(state, ReplicaState::InSync);

        // the prune was attempted, its failure only logged
        assert_eq!(
            t.executor.retry_call_lines(),
            [format!("ssh {SRC_SSH} sudo zfs destroy -f {stale_src}")]
        );
        let new_tag = t.store.get("r2", keys::REPL_SNAPSHOT_TAG).unwrap();
        assert_ne!(new_tag, old_tag);
        assert_eq!(
            t.store.get("active-id", keys::REPL_SNAPSHOT_TAG).as_deref(),
            Some(new_tag.as_str())
        );
    }

    #[test]
    fn test_update_replica_state_requires_baseline() {
        let t = build_driver(test_config());
        let active = replica("active-id", "foo", Some(ReplicaState::Active));
        let r2 = replica("r2", "bar", Some(ReplicaState::OutOfSync));
        seed(&*t.store, "active-id", "foo/share_active_id", SRC_SSH, None);
        seed(&*t.store, "r2", "bar/subbar/share_r2", "x@2.2.2.2", None);
        let err = t
            .driver
            .update_replica_state(&[active, r2.clone()], &r2, &[], None)
            .unwrap_err();
        assert!(matches!(err, Error::Replication(_)));
    }

    #[test]
    fn test_promote_replica_with_failing_sibling() {
        let t = build_driver(test_config());
        let active = replica("active-id", "foo", Some(ReplicaState::Active));
        let r2 = replica("r2", "bar", Some(ReplicaState::InSync));
        let r3 = replica("r3", "quuz", Some(ReplicaState::InSync));
        seed(
            &*t.store,
            "active-id",
            "foo/share_active_id",
            SRC_SSH,
            Some("old_active_tag"),
        );
        seed(
            &*t.store,
            "r2",
            "bar/subbar/share_r2",
            "fake_username@2.2.2.2",
            Some("old_r2_tag"),
        );
        seed(&*t.store, "r3", "quuz/share_r3", "user@240.1.1.3", Some("old_r3_tag"));

        t.executor.push_ok(""); // readonly=on on source
        t.executor.push_ok(""); // source snapshot
        t.executor.push_ok(""); // send to promoted replica
        t.executor.push_err("fake send failure"); // send to r3

        let updates = t
            .driver
            .promote_replica(&[active, r2.clone(), r3], &r2, &[], None)
            .unwrap();

        assert_eq!(updates.len(), 3);
        let by_id = |id: &str| updates.iter().find(|u| u.id == id).unwrap();
        assert_eq!(by_id("active-id").replica_state, Some(ReplicaState::InSync));
        assert_eq!(
            by_id("active-id").access_rules_status,
            AccessRulesStatus::OutOfSync
        );
        assert_eq!(by_id("r2").replica_state, Some(ReplicaState::Active));
        assert_eq!(by_id("r2").access_rules_status, AccessRulesStatus::Active);
        assert_eq!(by_id("r3").replica_state, Some(ReplicaState::OutOfSync));
        assert_eq!(
            updates.iter().filter(|u| u.replica_state == Some(ReplicaState::Active)).count(),
            1
        );

        let lines = t.executor.call_lines();
        assert_eq!(
            lines[0],
            format!("ssh {SRC_SSH} sudo zfs set readonly=on foo/share_active_id")
        );
        assert!(lines[1].starts_with(&format!(
            "ssh {SRC_SSH} sudo zfs snapshot foo/share_active_id@tmp_snapshot_for_replication__active_id_time_"
        )));
        assert!(lines[2].contains("send -vDRI old_r2_tag"));
        assert!(lines[3].contains("send -vDRI old_r3_tag"));
        assert_eq!(lines[4], "zfs set readonly=off bar/subbar/share_r2");

        // baseline advanced only where the stream applied
        let new_tag = t.store.get("r2", keys::REPL_SNAPSHOT_TAG).unwrap();
        assert!(new_tag.starts_with("tmp_snapshot_for_replication__active_id_time_"));
        assert_eq!(
            t.store.get("active-id", keys::REPL_SNAPSHOT_TAG).as_deref(),
            Some(new_tag.as_str())
        );
        assert_eq!(
            t.store.get("r3", keys::REPL_SNAPSHOT_TAG).as_deref(),
            Some("old_r3_tag")
        );
        assert_eq!(
            t.helper.call_lines(),
            ["update_access bar/subbar/share_r2 make_all_ro=false"]
        );
    }

    #[test]
    fn test_promote_replica_active_unreachable() {
        let t = build_driver(test_config());
        let active = replica("active-id", "foo", Some(ReplicaState::Active));
        let r2 = replica("r2", "bar", Some(ReplicaState::InSync));
        let r3 = replica("r3", "quuz", Some(ReplicaState::InSync));
        seed(
            &*t.store,
            "active-id",
            "foo/share_active_id",
            SRC_SSH,
            Some("old_active_tag"),
        );
        seed(
            &*t.store,
            "r2",
            "bar/subbar/share_r2",
            "fake_username@2.2.2.2",
            Some("old_r2_tag"),
        );
        seed(&*t.store, "r3", "quuz/share_r3", "user@240.1.1.3", Some("old_r3_tag"));

        t.executor.push_err("fake: no route to host"); // readonly=on on source

        let updates = t
            .driver
            .promote_replica(&[active, r2.clone(), r3], &r2, &[], None)
            .unwrap();

        assert_eq!(updates.len(), 3);
        let by_id = |id: &str| updates.iter().find(|u| u.id == id).unwrap();
        assert_eq!(
            by_id("active-id").replica_state,
            Some(ReplicaState::OutOfSync)
        );
        assert_eq!(by_id("r2").replica_state, Some(ReplicaState::Active));
        assert_eq!(by_id("r3").replica_state, None);

        let lines = t.executor.call_lines();
        assert!(lines[1].starts_with(
            "zfs snapshot bar/subbar/share_r2@tmp_snapshot_for_replication__r2_time_"
        ));
        assert!(
            lines[2].starts_with("zfs send -vDR bar/subbar/share_r2@"),
            "got {}",
            lines[2]
        );
        assert!(lines[2].ends_with("| ssh user@240.1.1.3 sudo zfs receive -vF quuz/share_r3"));
        assert_eq!(lines[3], "zfs set readonly=off bar/subbar/share_r2");

        // promoted and reseeded replicas share the new baseline, the
        // unreachable active keeps its stale one
        let new_tag = t.store.get("r2", keys::REPL_SNAPSHOT_TAG).unwrap();
        assert!(new_tag.starts_with("tmp_snapshot_for_replication__r2_time_"));
        assert_eq!(
            t.store.get("r3", keys::REPL_SNAPSHOT_TAG).as_deref(),
            Some(new_tag.as_str())
        );
        assert_eq!(
            t.store.get("active-id", keys::REPL_SNAPSHOT_TAG).as_deref(),
            Some("old_active_tag")
        );
    }

    #[test]
    fn test_delete_replica() {
        let t = build_driver(test_config());
        let r2 = replica("r2", "bar", Some(ReplicaState::InSync));
        seed(
            &*t.store,
            "r2",
            "bar/subbar/share_r2",
            "fake_username@2.2.2.2",
            Some("old_r2_tag"),
        );
        let stale = "bar/subbar/share_r2@tmp_snapshot_for_replication__r2_time_old";
        t.executor
            .push_ok(&name_answer(&[stale, "bar/subbar/share_other@x"]));
        t.executor.push_ok(&value_answer(stale, "mountpoint", "-"));
        t.executor.push_ok(""); // destroy snapshot
        t.executor
            .push_ok(&name_answer(&["bar/subbar", "bar/subbar/share_r2"]));
        t.executor
            .push_ok(&value_answer("bar/subbar/share_r2", "mountpoint", "none"));

        t.driver.delete_replica(&r2, None).unwrap();

        assert_eq!(
            t.executor.call_lines(),
            [
                "zfs list -r -t snapshot bar".to_string(),
                format!("zfs get mountpoint {stale}"),
                format!("zfs destroy -f {stale}"),
                "zfs list -r bar".to_string(),
                "zfs get mountpoint bar/subbar/share_r2".to_string(),
                "zfs destroy -f bar/subbar/share_r2".to_string(),
            ]
        );
        assert_eq!(
            t.helper.call_lines(),
            ["remove_exports bar/subbar/share_r2"]
        );
        assert!(t.store.get("r2", keys::DATASET_NAME).is_none());
    }

    #[test]
    fn test_delete_replica_absent_dataset() {
        let t = build_driver(test_config());
        let r2 = replica("r2", "bar", Some(ReplicaState::InSync));
        t.executor.push_ok(&name_answer(&["bar/subbar/share_other@x"]));
        t.executor.push_ok(&name_answer(&["bar/subbar"]));
        t.driver.delete_replica(&r2, None).unwrap();
        assert_eq!(
            t.executor.call_lines(),
            ["zfs list -r -t snapshot bar", "zfs list -r bar"]
        );
        assert!(t.helper.call_lines().is_empty());
    }
}
